use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{DeviceId, OperationKind};

/// Change notifications for dashboards and composed coordinators.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    OperationEnded {
        kind: OperationKind,
        succeeded: bool,
    },
    DeviceChanged {
        device: DeviceId,
    },
    CaptureFinished {
        request_id: Uuid,
    },
    RequestSendFinished {
        request_id: Uuid,
    },
    SetRequestFinished {
        set_id: Uuid,
        request_id: Uuid,
    },
    SetCompleted {
        set_id: Uuid,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Nobody listening is fine.
    pub fn emit(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }
}
