//! Wiring of the shared state and every coordinator.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::beacon::ClockSyncBeacon;
use crate::capture::CaptureScheduler;
use crate::config::LiveSettings;
use crate::events::EventBus;
use crate::net::Transport;
use crate::ota::UpdateCoordinator;
use crate::picture_send::PictureSendCoordinator;
use crate::picture_set::PictureSetCoordinator;
use crate::ping::PingCoordinator;
use crate::registry::{DeviceRegistry, DispatchBoard};
use crate::router::ResponseRouter;
use crate::storage::CaptureStore;
use crate::time_sync::TimeSyncCoordinator;

/// Handles every coordinator needs. Cloning is cheap.
#[derive(Clone)]
pub struct FleetContext {
    pub registry: Arc<DeviceRegistry>,
    pub board: Arc<DispatchBoard>,
    pub router: Arc<ResponseRouter>,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn CaptureStore>,
    pub events: EventBus,
    pub settings: LiveSettings,
}

impl FleetContext {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CaptureStore>,
        settings: LiveSettings,
    ) -> Self {
        let board = Arc::new(DispatchBoard::new());
        let events = EventBus::default();
        let router = Arc::new(ResponseRouter::new(
            Arc::clone(&registry),
            Arc::clone(&board),
            Arc::clone(&store),
            events.clone(),
        ));
        Self {
            registry,
            board,
            router,
            transport,
            store,
            events,
            settings,
        }
    }
}

pub struct Fleet {
    pub context: FleetContext,
    pub ping: PingCoordinator,
    pub time_sync: TimeSyncCoordinator,
    pub update: UpdateCoordinator,
    pub picture_send: Arc<PictureSendCoordinator>,
    pub capture: CaptureScheduler,
    pub picture_set: PictureSetCoordinator,
}

impl Fleet {
    pub fn new(
        context: FleetContext,
        ping_timeout: Duration,
        beacon: watch::Receiver<Option<ClockSyncBeacon>>,
    ) -> Self {
        let picture_send = Arc::new(PictureSendCoordinator::new(&context));
        Self {
            ping: PingCoordinator::new(&context, ping_timeout),
            time_sync: TimeSyncCoordinator::new(&context),
            update: UpdateCoordinator::new(&context),
            capture: CaptureScheduler::new(&context, beacon),
            picture_set: PictureSetCoordinator::new(&context, Arc::clone(&picture_send)),
            picture_send,
            context,
        }
    }

    /// Cancel whatever is running, of every kind.
    pub async fn cancel_all(&self) {
        let mut cancelled = 0;
        cancelled += usize::from(self.picture_set.cancel().await);
        cancelled += usize::from(self.picture_send.cancel().await);
        cancelled += usize::from(self.capture.cancel().await);
        cancelled += usize::from(self.time_sync.cancel().await);
        cancelled += usize::from(self.update.cancel().await);
        cancelled += usize::from(self.ping.cancel());
        info!(cancelled, "cancel requested for all operations");
    }
}
