use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::instrument;

use crate::dispatcher::{self, BoundedDispatcher, DispatchOperation, RunSummary, StateSink};
use crate::error::{FleetResult, TransportError};
use crate::fleet::FleetContext;
use crate::messages::{Command, ReplyEnvelope, ReplyValue};
use crate::net::{broadcast_cancel, send_command, Transport};
use crate::registry::DispatchBoard;
use crate::router::CorrelationKey;
use crate::types::{DeviceId, OperationKind, RequestState, TimeSyncFailure, TimeSyncResult};

lazy_static! {
    static ref SYNC_STATUS: Regex = Regex::new(
        r"timestamp:\s*([+-]?\d+(?:\.\d+)?)\s+offset:\s*([+-]?\d+(?:\.\d+)?)\s+error:\s*([+-]?\d+(?:\.\d+)?)"
    )
    .expect("valid sync status pattern");
}

/// Parse `timestamp: <s> offset: <s> error: <s>` into milliseconds.
pub fn parse_sync_output(output: &str) -> Option<TimeSyncResult> {
    let captures = SYNC_STATUS.captures(output)?;
    let seconds = |i: usize| -> Option<f64> { captures.get(i)?.as_str().parse().ok() };
    Some(TimeSyncResult {
        timestamp_ms: seconds(1)? * 1000.0,
        offset_ms: seconds(2)? * 1000.0,
        error_ms: seconds(3)? * 1000.0,
    })
}

pub fn classify_reply(envelope: &ReplyEnvelope) -> RequestState<TimeSyncResult, TimeSyncFailure> {
    match (envelope.success, &envelope.value) {
        (true, ReplyValue::SyncStatus { output }) => match parse_sync_output(output) {
            Some(result) => RequestState::Succeeded(result),
            None => RequestState::Failed(TimeSyncFailure::FailedToParse(format!(
                "unrecognised sync status output: {:?}",
                output
            ))),
        },
        (false, ReplyValue::Error { reason, .. }) => {
            RequestState::Failed(TimeSyncFailure::Reported(reason.clone()))
        }
        (false, ReplyValue::SyncStatus { output }) => {
            RequestState::Failed(TimeSyncFailure::Reported(output.clone()))
        }
        (_, other) => RequestState::Unknown(format!("unexpected sync-status reply: {:?}", other)),
    }
}

struct TimeSyncOperation<'a> {
    board: &'a DispatchBoard,
    transport: &'a dyn Transport,
    window: usize,
}

#[async_trait]
impl<'a> DispatchOperation for TimeSyncOperation<'a> {
    fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::TimeSync
    }

    fn window_size(&self) -> usize {
        self.window
    }

    fn states(&self) -> &dyn StateSink {
        &self.board.time_sync
    }

    fn priority_device(&self) -> Option<DeviceId> {
        Some(DeviceId::indicator())
    }

    /// The indicator's slot stays taken even when its publish fails.
    fn priority_failure_reserves_slot(&self) -> bool {
        true
    }

    async fn publish(&self, device: &DeviceId) -> Result<(), TransportError> {
        send_command(self.transport, device, &Command::GetSyncStatus).await
    }
}

/// Asks devices for their clock-sync status, `max_concurrent_time_sync` at a time.
pub struct TimeSyncCoordinator {
    context: FleetContext,
    dispatcher: BoundedDispatcher,
}

impl TimeSyncCoordinator {
    pub fn new(context: &FleetContext) -> Self {
        Self {
            dispatcher: BoundedDispatcher::new(
                OperationKind::TimeSync,
                context.registry.clone(),
                context.router.clone(),
                context.events.clone(),
            ),
            context: context.clone(),
        }
    }

    fn operation(&self) -> TimeSyncOperation<'_> {
        TimeSyncOperation {
            board: &self.context.board,
            transport: self.context.transport.as_ref(),
            window: self.context.settings.current().max_concurrent_time_sync,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> FleetResult<RunSummary> {
        self.dispatcher.run(&self.operation(), None).await
    }

    #[instrument(skip(self), fields(device_id = %device))]
    pub async fn poke(&self, device: &DeviceId) -> FleetResult<()> {
        dispatcher::poke(
            &self.context.registry,
            &self.operation(),
            device,
            OperationKind::TimeSync,
        )
        .await
    }

    /// Cancel the running batch and tell devices to drop their work.
    pub async fn cancel(&self) -> bool {
        let cancelled = self.dispatcher.cancel();
        if cancelled {
            broadcast_cancel(self.context.transport.as_ref()).await;
        }
        cancelled
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }
}
