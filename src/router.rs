//! Inbound reply demultiplexing.
//!
//! Every reply first updates long-lived device fields and persisted picture
//! rows, then the device id is forwarded to whichever dispatch is waiting on
//! the reply's correlation key. Nobody waiting means the run already ended;
//! the reply is still recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::events::{EventBus, FleetEvent};
use crate::messages::{parse_reply_topic, ReplyEnvelope, ReplyKind, ReplyValue};
use crate::registry::{DeviceRegistry, DispatchBoard};
use crate::storage::CaptureStore;
use crate::types::{DeviceId, PictureEvent, RequestState};
use crate::{ota, time_sync};

/// Which waiting dispatch a reply belongs to. Fleet-wide operations have one
/// live channel per kind; picture operations have one per capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Ping,
    TimeSync,
    Update,
    Taken(Uuid),
    Saved(Uuid),
    PictureSend(Uuid),
}

struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<DeviceId>,
}

type RouteTable = Arc<Mutex<HashMap<CorrelationKey, Route>>>;

/// Receiving end of one registered correlation key. Unregisters on drop.
pub struct Subscription {
    key: CorrelationKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<DeviceId>,
    routes: RouteTable,
}

impl Subscription {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub async fn recv(&mut self) -> Option<DeviceId> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.get(&self.key).map(|r| r.id) == Some(self.id) {
            routes.remove(&self.key);
        }
    }
}

pub struct ResponseRouter {
    routes: RouteTable,
    next_id: AtomicU64,
    registry: Arc<DeviceRegistry>,
    board: Arc<DispatchBoard>,
    store: Arc<dyn CaptureStore>,
    events: EventBus,
}

impl ResponseRouter {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        board: Arc<DispatchBoard>,
        store: Arc<dyn CaptureStore>,
        events: EventBus,
    ) -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            registry,
            board,
            store,
            events,
        }
    }

    /// Register a delivery channel for `key`, replacing any stale one.
    pub fn subscribe(&self, key: CorrelationKey) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Route { id, tx });
        if replaced.is_some() {
            warn!(?key, "replaced a stale reply route");
        }
        Subscription {
            key,
            id,
            rx,
            routes: Arc::clone(&self.routes),
        }
    }

    pub fn is_routed(&self, key: CorrelationKey) -> bool {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    fn forward(&self, key: CorrelationKey, device: &DeviceId) {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        match routes.get(&key) {
            Some(route) => {
                if route.tx.send(device.clone()).is_err() {
                    debug!(?key, device_id = %device, "reply route closed, dropping");
                }
            }
            None => {
                debug!(?key, device_id = %device, "no dispatch waiting for reply, dropping");
            }
        }
    }

    /// Entry point for every inbound transport message.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let span = info_span!("reply", topic = %topic, payload_size = payload.len());
        async {
            let (kind, device) = match parse_reply_topic(topic) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "ignoring message on unexpected topic");
                    return;
                }
            };
            if !self.registry.contains(&device) {
                warn!(device_id = %device, "reply from device outside the registry");
                return;
            }

            self.registry.mark_seen(&device);

            match serde_json::from_slice::<ReplyEnvelope>(payload) {
                Ok(envelope) => self.handle_reply(kind, &device, envelope).await,
                Err(e) => self.handle_malformed(kind, &device, payload, &e.to_string()).await,
            }

            self.events.emit(FleetEvent::DeviceChanged { device });
        }
        .instrument(span)
        .await
    }

    async fn handle_reply(&self, kind: ReplyKind, device: &DeviceId, envelope: ReplyEnvelope) {
        match kind {
            ReplyKind::Status => self.handle_status(device, envelope),
            ReplyKind::SyncStatus => {
                let state = time_sync::classify_reply(&envelope);
                match &state {
                    RequestState::Succeeded(result) => {
                        self.registry.record_time_sync(device, result.clone())
                    }
                    RequestState::Failed(failure) => {
                        self.registry.record_error(device, failure.reason())
                    }
                    _ => {}
                }
                self.board.time_sync.resolve(device, state);
                self.forward(CorrelationKey::TimeSync, device);
            }
            ReplyKind::Update => {
                let state = ota::classify_reply(&envelope);
                match &state {
                    RequestState::Succeeded(version) => {
                        self.registry.set_firmware_version(device, version)
                    }
                    RequestState::Failed(reason) => self.registry.record_error(device, reason),
                    _ => {}
                }
                self.board.update.resolve(device, state);
                self.forward(CorrelationKey::Update, device);
            }
            ReplyKind::Taken | ReplyKind::Saved | ReplyKind::PictureSent => {
                self.handle_picture_reply(kind, device, envelope).await
            }
        }
    }

    fn handle_status(&self, device: &DeviceId, envelope: ReplyEnvelope) {
        let state = match (envelope.success, envelope.value) {
            (true, ReplyValue::Status(status)) => {
                self.registry.set_status(device, status.clone());
                RequestState::Succeeded(status)
            }
            (false, ReplyValue::Error { reason, .. }) => {
                self.registry.record_error(device, reason.clone());
                RequestState::Failed(reason)
            }
            (_, other) => RequestState::Unknown(format!("unexpected status reply: {:?}", other)),
        };
        self.board.ping.resolve(device, state);
        self.forward(CorrelationKey::Ping, device);
    }

    async fn handle_picture_reply(&self, kind: ReplyKind, device: &DeviceId, envelope: ReplyEnvelope) {
        let Some(request_id) = envelope.value.request_id() else {
            if let ReplyValue::Error { reason, .. } = &envelope.value {
                self.registry.record_error(device, reason.clone());
            }
            warn!(device_id = %device, %kind, "picture reply without request id, dropping");
            return;
        };

        let (event, detail) = match (kind, envelope.success, &envelope.value) {
            (ReplyKind::Taken, true, ReplyValue::Taken { metadata, .. }) => {
                if let Err(e) = self.store.record_metadata(request_id, device, metadata).await {
                    error!(error = %e, %request_id, device_id = %device, "failed to store capture metadata");
                }
                (PictureEvent::Taken, None)
            }
            (ReplyKind::Saved, true, ReplyValue::Saved { file_name, .. }) => {
                (PictureEvent::Saved, file_name.clone())
            }
            (ReplyKind::PictureSent, true, ReplyValue::PictureSent { .. }) => (PictureEvent::Sent, None),
            (_, _, ReplyValue::Error { reason, .. }) => {
                self.registry.record_error(device, reason.clone());
                (failure_event(kind), Some(reason.clone()))
            }
            (_, _, other) => (
                failure_event(kind),
                Some(format!("unexpected {} reply: {:?}", kind, other)),
            ),
        };

        self.apply_picture_event(request_id, device, event, detail.clone()).await;

        let succeeded = matches!(
            event,
            PictureEvent::Taken | PictureEvent::Saved | PictureEvent::Sent
        );
        match kind {
            ReplyKind::Taken => {
                self.forward(CorrelationKey::Taken(request_id), device);
                if !succeeded {
                    // no saved reply follows a failed capture
                    self.board
                        .capture
                        .resolve(device, RequestState::Failed(detail.unwrap_or_default()));
                    self.forward(CorrelationKey::Saved(request_id), device);
                }
            }
            ReplyKind::Saved => {
                let state = if succeeded {
                    RequestState::Succeeded(())
                } else {
                    RequestState::Failed(detail.unwrap_or_default())
                };
                self.board.capture.resolve(device, state);
                self.forward(CorrelationKey::Saved(request_id), device);
            }
            ReplyKind::PictureSent => {
                let state = if succeeded {
                    RequestState::Succeeded(())
                } else {
                    RequestState::Failed(detail.unwrap_or_default())
                };
                self.board.picture_send.resolve(device, state);
                self.forward(CorrelationKey::PictureSend(request_id), device);
            }
            ReplyKind::Status | ReplyKind::SyncStatus | ReplyKind::Update => {}
        }
    }

    async fn apply_picture_event(
        &self,
        request_id: Uuid,
        device: &DeviceId,
        event: PictureEvent,
        detail: Option<String>,
    ) {
        match self
            .store
            .apply_picture_event(request_id, device, event, detail)
            .await
        {
            Ok(Some(status)) => {
                debug!(%request_id, device_id = %device, %status, "picture status updated")
            }
            Ok(None) => {
                debug!(%request_id, device_id = %device, ?event, "picture event did not apply")
            }
            Err(e) => {
                error!(error = %e, %request_id, device_id = %device, "failed to persist picture status")
            }
        }
    }

    async fn handle_malformed(&self, kind: ReplyKind, device: &DeviceId, payload: &[u8], error: &str) {
        warn!(device_id = %device, %kind, error = %error, "malformed reply");
        let reason = format!("malformed {} reply: {}", kind, error);
        self.registry.record_error(device, reason.clone());

        match kind {
            ReplyKind::Status => {
                self.board.ping.resolve(device, RequestState::Unknown(reason));
                self.forward(CorrelationKey::Ping, device);
            }
            ReplyKind::SyncStatus => {
                self.board.time_sync.resolve(device, RequestState::Unknown(reason));
                self.forward(CorrelationKey::TimeSync, device);
            }
            ReplyKind::Update => {
                self.board.update.resolve(device, RequestState::Unknown(reason));
                self.forward(CorrelationKey::Update, device);
            }
            ReplyKind::Taken | ReplyKind::Saved | ReplyKind::PictureSent => {
                let Some(request_id) = salvage_request_id(payload) else {
                    warn!(device_id = %device, %kind, "cannot correlate malformed picture reply");
                    return;
                };
                self.apply_picture_event(request_id, device, failure_event(kind), Some(reason.clone()))
                    .await;
                let key = match kind {
                    ReplyKind::Taken => CorrelationKey::Taken(request_id),
                    ReplyKind::Saved => {
                        self.board.capture.resolve(device, RequestState::Unknown(reason));
                        CorrelationKey::Saved(request_id)
                    }
                    _ => {
                        self.board
                            .picture_send
                            .resolve(device, RequestState::Unknown(reason));
                        CorrelationKey::PictureSend(request_id)
                    }
                };
                self.forward(key, device);
            }
        }
    }
}

fn failure_event(kind: ReplyKind) -> PictureEvent {
    match kind {
        ReplyKind::Taken => PictureEvent::TakeFailed,
        ReplyKind::Saved => PictureEvent::SaveFailed,
        _ => PictureEvent::SendFailed,
    }
}

/// Best effort: pull `value.request_id` out of a reply that does not match
/// the envelope schema.
fn salvage_request_id(payload: &[u8]) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value
        .get("value")
        .and_then(|v| v.get("request_id"))
        .and_then(|id| id.as_str())
        .and_then(|id| Uuid::parse_str(id).ok())
}
