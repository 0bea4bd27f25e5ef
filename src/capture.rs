//! Synchronized capture across the camera grid.
//!
//! One broadcast carries the absolute capture time. Replies then come back
//! in two independent phases, "taken" and "saved", each collected by its own
//! loop over the same device set.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::beacon::{aligned_capture_time, ClockSyncBeacon};
use crate::dispatcher::{CancelSlot, OperationLock};
use crate::error::{FleetError, FleetResult};
use crate::events::FleetEvent;
use crate::fleet::FleetContext;
use crate::messages::Command;
use crate::net::{broadcast_cancel, broadcast_command};
use crate::router::{CorrelationKey, Subscription};
use crate::types::{CapturePicture, CaptureRequest, DeviceId, OperationKind, PictureEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub request_id: Uuid,
    pub taken: usize,
    pub saved: usize,
    pub cancelled: bool,
}

pub struct PendingCapture {
    pub request: CaptureRequest,
    handle: JoinHandle<CaptureOutcome>,
}

impl PendingCapture {
    /// Wait until both collection phases are done or cancelled.
    pub async fn finished(self) -> FleetResult<CaptureOutcome> {
        self.handle
            .await
            .map_err(|e| FleetError::Other(anyhow::Error::new(e)))
    }
}

fn micros_to_datetime(us: u64) -> FleetResult<DateTime<Utc>> {
    i64::try_from(us)
        .ok()
        .and_then(DateTime::from_timestamp_micros)
        .ok_or_else(|| FleetError::InvalidBeacon(format!("capture time {}µs out of range", us)))
}

/// Broadcasts synchronized captures, one at a time: the capture state table
/// belongs to the request in flight until its collection ends.
pub struct CaptureScheduler {
    context: FleetContext,
    beacon: watch::Receiver<Option<ClockSyncBeacon>>,
    lock: OperationLock,
    cancel: Arc<CancelSlot>,
}

struct Started {
    request: CaptureRequest,
    devices: Vec<DeviceId>,
    taken: Subscription,
    saved: Subscription,
}

impl CaptureScheduler {
    pub fn new(context: &FleetContext, beacon: watch::Receiver<Option<ClockSyncBeacon>>) -> Self {
        Self {
            context: context.clone(),
            beacon,
            lock: OperationLock::new(OperationKind::Capture),
            cancel: Arc::new(CancelSlot::new()),
        }
    }

    fn eligible_cameras(&self) -> Vec<DeviceId> {
        self.context
            .registry
            .snapshot()
            .into_iter()
            .filter(|device| device.is_ready() && !device.id.is_indicator())
            .map(|device| device.id)
            .collect()
    }

    /// Broadcast a capture at the next aligned frame at least `lead_ms` (or
    /// the configured lead time) from now, persist it, and start collecting
    /// replies in the background. Refused while an earlier capture is still
    /// collecting.
    #[instrument(skip(self))]
    pub async fn request_capture(
        &self,
        capture_type: &str,
        set_id: Option<Uuid>,
        lead_ms: Option<u64>,
    ) -> FleetResult<PendingCapture> {
        let guard = self.lock.try_acquire()?;
        let (generation, token) = self.cancel.install(None);

        let started = match self.start(capture_type, set_id, lead_ms).await {
            Ok(started) => started,
            Err(e) => {
                self.cancel.clear(generation);
                return Err(e);
            }
        };
        let Started {
            request,
            devices,
            taken,
            saved,
        } = started;

        let collection = Collection {
            context: self.context.clone(),
            request_id: request.id,
            token,
        };
        let slot = Arc::clone(&self.cancel);
        let span = tracing::info_span!("capture", request_id = %request.id);
        let handle = tokio::spawn(
            async move {
                let outcome = collection.run(devices, taken, saved).await;
                slot.clear(generation);
                drop(guard);
                outcome
            }
            .instrument(span),
        );

        Ok(PendingCapture { request, handle })
    }

    async fn start(&self, capture_type: &str, set_id: Option<Uuid>, lead_ms: Option<u64>) -> FleetResult<Started> {
        if let Some(set_id) = set_id {
            if self.context.store.get_set(set_id).await?.is_none() {
                return Err(FleetError::SetNotFound(set_id));
            }
        }

        let lead_ms = lead_ms.unwrap_or_else(|| self.context.settings.current().capture_lead_time_ms);
        let now_us = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let beacon = *self.beacon.borrow();
        if beacon.is_none() {
            warn!("no clock-sync beacon received, capture time is not frame aligned");
        }
        let capture_at_us = aligned_capture_time(beacon.as_ref(), now_us, lead_ms);

        let request = CaptureRequest {
            id: Uuid::new_v4(),
            created_at: micros_to_datetime(now_us)?,
            capture_at: micros_to_datetime(capture_at_us)?,
            capture_type: capture_type.to_string(),
            active: true,
            set_id,
        };
        let devices = self.eligible_cameras();
        let board = &self.context.board;

        let taken = self.context.router.subscribe(CorrelationKey::Taken(request.id));
        let saved = self.context.router.subscribe(CorrelationKey::Saved(request.id));
        board.capture.reset(&devices);

        let command = Command::TakePicture {
            request_id: request.id,
            capture_at_us,
        };
        if let Err(e) = broadcast_command(self.context.transport.as_ref(), &command).await {
            error!(request_id = %request.id, error = %e, "failed to broadcast capture");
            for device in &devices {
                board.capture.mark_failed_to_request(device, e.to_string());
            }
            return Err(e.into());
        }
        for device in &devices {
            board.capture.mark_requested(device);
        }

        let pictures: Vec<CapturePicture> = devices
            .iter()
            .map(|device| CapturePicture::requested(request.id, device.clone()))
            .collect();
        if let Err(e) = self.context.store.insert_request(&request, &pictures).await {
            error!(request_id = %request.id, error = %e, "failed to persist capture request");
            board.capture.mark_failed(&devices, e.to_string());
            return Err(e);
        }

        info!(
            request_id = %request.id,
            capture_type = %request.capture_type,
            capture_at = %request.capture_at,
            cameras = devices.len(),
            "capture requested"
        );
        Ok(Started {
            request,
            devices,
            taken,
            saved,
        })
    }

    pub async fn cancel(&self) -> bool {
        let cancelled = self.cancel.cancel();
        if cancelled {
            broadcast_cancel(self.context.transport.as_ref()).await;
        }
        cancelled
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }
}

struct Collection {
    context: FleetContext,
    request_id: Uuid,
    token: CancellationToken,
}

impl Collection {
    async fn run(self, devices: Vec<DeviceId>, taken: Subscription, saved: Subscription) -> CaptureOutcome {
        let pending: HashSet<DeviceId> = devices.into_iter().collect();
        let ((taken, taken_left), (saved, saved_left)) = tokio::join!(
            self.phase(taken, pending.clone(), PictureEvent::TakeCancelled),
            self.phase(saved, pending, PictureEvent::SaveCancelled),
        );

        let cancelled = self.token.is_cancelled();
        self.context.board.capture.mark_cancelled(&saved_left);
        self.context.events.emit(FleetEvent::CaptureFinished {
            request_id: self.request_id,
        });
        info!(
            taken,
            saved,
            unresolved_taken = taken_left.len(),
            unresolved_saved = saved_left.len(),
            cancelled,
            "capture collection finished"
        );

        CaptureOutcome {
            request_id: self.request_id,
            taken,
            saved,
            cancelled,
        }
    }

    /// Collect one reply kind until every device answered or the run is
    /// cancelled. Returns how many answered and who did not.
    async fn phase(
        &self,
        mut subscription: Subscription,
        mut pending: HashSet<DeviceId>,
        leftover_event: PictureEvent,
    ) -> (usize, Vec<DeviceId>) {
        let mut resolved = 0;
        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = subscription.recv() => match next {
                    Some(device) => {
                        if pending.remove(&device) {
                            resolved += 1;
                        }
                    }
                    None => {
                        warn!(key = ?subscription.key(), "reply route closed during capture");
                        break;
                    }
                },
            }
        }

        let mut leftover: Vec<DeviceId> = pending.into_iter().collect();
        leftover.sort();
        for device in &leftover {
            if let Err(e) = self
                .context
                .store
                .apply_picture_event(self.request_id, device, leftover_event, None)
                .await
            {
                error!(error = %e, device_id = %device, "failed to mark picture cancelled");
            }
        }
        (resolved, leftover)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LiveSettings, Settings};
    use crate::error::TransportError;
    use crate::messages::{encode_reply, ReplyEnvelope, ReplyValue};
    use crate::net::MockTransport;
    use crate::registry::DeviceRegistry;
    use crate::simulate::{mark_ready, recording_context, RecordingTransport};
    use crate::storage::SqliteCaptureStore;
    use crate::types::{PictureStatus, RequestState};
    use std::time::Duration;

    fn id(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    fn setup(
        devices: &[&str],
        beacon: Option<ClockSyncBeacon>,
    ) -> (FleetContext, Arc<RecordingTransport>, CaptureScheduler) {
        let ids: Vec<DeviceId> = devices.iter().map(|d| id(d)).collect();
        let (context, transport) = recording_context(&ids, Settings::default()).unwrap();
        let (_tx, rx) = watch::channel(beacon);
        let scheduler = CaptureScheduler::new(&context, rx);
        (context, transport, scheduler)
    }

    async fn reply(context: &FleetContext, kind: &str, device: &str, value: ReplyValue, success: bool) {
        let payload = encode_reply(&ReplyEnvelope { success, value }).unwrap();
        context
            .router
            .handle_message(&format!("reply/{}/{}", kind, device), &payload)
            .await;
    }

    async fn taken(context: &FleetContext, device: &str, request_id: Uuid) {
        let value = ReplyValue::Taken {
            request_id,
            metadata: Default::default(),
        };
        reply(context, "taken", device, value, true).await;
    }

    async fn saved(context: &FleetContext, device: &str, request_id: Uuid) {
        let value = ReplyValue::Saved {
            request_id,
            file_name: None,
        };
        reply(context, "saved", device, value, true).await;
    }

    async fn statuses(context: &FleetContext, request_id: Uuid) -> Vec<(DeviceId, PictureStatus)> {
        context
            .store
            .list_pictures(request_id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.device_id, p.status))
            .collect()
    }

    #[tokio::test]
    async fn test_without_beacon_capture_time_is_now_plus_lead() {
        let (_context, transport, scheduler) = setup(&["A1"], None);
        let pending = scheduler.request_capture("standing", None, Some(1500)).await.unwrap();

        let request = &pending.request;
        assert_eq!(
            request.capture_at - request.created_at,
            chrono::Duration::milliseconds(1500)
        );

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "cmd/take-picture");
        match published[0].command().unwrap() {
            Command::TakePicture {
                request_id,
                capture_at_us,
            } => {
                assert_eq!(request_id, request.id);
                assert_eq!(capture_at_us as i64, request.capture_at.timestamp_micros());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_beacon_capture_time_is_frame_aligned() {
        let t0 = u64::try_from(Utc::now().timestamp_micros()).unwrap() - 1_000_000;
        let beacon = ClockSyncBeacon {
            frame_duration_us: 33_333,
            system_frame_us: 0,
            wall_frame_us: t0,
            system_ready_us: 0,
            wall_ready_us: t0,
        };
        let (_context, _transport, scheduler) = setup(&["A1"], Some(beacon));
        let pending = scheduler.request_capture("sitting", None, Some(50)).await.unwrap();

        let request = &pending.request;
        let capture_us = request.capture_at.timestamp_micros() as u64;
        assert_eq!((capture_us - t0 - crate::beacon::CAPTURE_MARGIN_US) % 33_333, 0);
        assert!(request.capture_at - request.created_at >= chrono::Duration::milliseconds(50));
    }

    #[tokio::test]
    async fn test_two_phase_collection_and_cancel() {
        let (context, _transport, scheduler) = setup(&["A1", "A2", "A3", "IND"], None);
        context.registry.set_reachable(&id("A3"), false);
        let scheduler_devices = ["A1", "A2"];

        let pending = scheduler.request_capture("standing", None, Some(0)).await.unwrap();
        let request_id = pending.request.id;
        assert_eq!(
            statuses(&context, request_id).await,
            scheduler_devices
                .iter()
                .map(|d| (id(d), PictureStatus::Requested))
                .collect::<Vec<_>>()
        );

        taken(&context, "A1", request_id).await;
        saved(&context, "A1", request_id).await;
        saved(&context, "A2", request_id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(scheduler.is_running());
        assert!(scheduler.cancel().await);
        let outcome = pending.finished().await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.taken, 1);
        assert_eq!(outcome.saved, 2);

        assert_eq!(
            statuses(&context, request_id).await,
            vec![
                (id("A1"), PictureStatus::SavedOnDevice),
                (id("A2"), PictureStatus::SavedOnDevice),
            ]
        );
        assert_eq!(context.board.capture.get(&id("A1")), RequestState::Succeeded(()));
        assert_eq!(context.board.capture.get(&id("A2")), RequestState::Succeeded(()));
        assert!(!scheduler.is_running());
        assert!(!scheduler.cancel().await);
    }

    #[tokio::test]
    async fn test_unanswered_cameras_are_cancelled() {
        let (context, _transport, scheduler) = setup(&["B1", "B2"], None);
        let pending = scheduler.request_capture("other", None, Some(0)).await.unwrap();
        let request_id = pending.request.id;

        taken(&context, "B1", request_id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.cancel().await;
        pending.finished().await.unwrap();

        assert_eq!(
            statuses(&context, request_id).await,
            vec![
                (id("B1"), PictureStatus::CaptureCancelled),
                (id("B2"), PictureStatus::CaptureCancelled),
            ]
        );
        assert_eq!(context.board.capture.get(&id("B2")), RequestState::Cancelled);
    }

    #[tokio::test]
    async fn test_completes_without_cancel_when_all_answer() {
        let (context, _transport, scheduler) = setup(&["C1", "C2"], None);
        let mut events = context.events.subscribe();
        let pending = scheduler.request_capture("standing", None, Some(0)).await.unwrap();
        let request_id = pending.request.id;

        taken(&context, "C1", request_id).await;
        saved(&context, "C1", request_id).await;
        let failure = ReplyValue::Error {
            request_id: Some(request_id),
            reason: "sensor timeout".into(),
        };
        reply(&context, "taken", "C2", failure, false).await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), pending.finished())
            .await
            .unwrap()
            .unwrap();
        assert!(!outcome.cancelled);
        assert_eq!(
            statuses(&context, request_id).await,
            vec![
                (id("C1"), PictureStatus::SavedOnDevice),
                (id("C2"), PictureStatus::FailedToTake),
            ]
        );
        assert_eq!(
            context.board.capture.get(&id("C2")),
            RequestState::Failed("sensor timeout".into())
        );

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            finished |= event == FleetEvent::CaptureFinished { request_id };
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_broadcast_failure_persists_nothing() {
        let devices = vec![id("A1"), id("A2")];
        let registry = Arc::new(DeviceRegistry::new(devices.clone()));
        mark_ready(&registry, &devices, "1.0.0");
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .returning(|_, _| Err(TransportError::Disconnected));
        let store = Arc::new(SqliteCaptureStore::open_in_memory().unwrap());
        let context = FleetContext::new(
            registry,
            Arc::new(transport),
            store,
            LiveSettings::default(),
        );
        let (_tx, rx) = watch::channel(None);
        let scheduler = CaptureScheduler::new(&context, rx);

        let result = scheduler.request_capture("standing", None, Some(0)).await;
        assert!(matches!(result, Err(FleetError::Transport(_))));
        assert!(matches!(
            context.board.capture.get(&id("A1")),
            RequestState::FailedToRequest(_)
        ));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_unknown_set_is_rejected_before_broadcast() {
        let (_context, transport, scheduler) = setup(&["A1"], None);
        let result = scheduler
            .request_capture("standing", Some(Uuid::new_v4()), None)
            .await;
        assert!(matches!(result, Err(FleetError::SetNotFound(_))));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_second_capture_waits_for_first_collection() {
        let (context, transport, scheduler) = setup(&["A1", "A2"], None);
        let first = scheduler.request_capture("standing", None, Some(0)).await.unwrap();
        let first_id = first.request.id;
        taken(&context, "A1", first_id).await;
        saved(&context, "A1", first_id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let overlapping = scheduler.request_capture("sitting", None, Some(0)).await;
        assert!(matches!(
            overlapping,
            Err(FleetError::AlreadyRunning(OperationKind::Capture))
        ));
        assert_eq!(transport.published().len(), 1);
        assert_eq!(context.board.capture.get(&id("A1")), RequestState::Succeeded(()));
        assert_eq!(context.board.capture.get(&id("A2")), RequestState::Requested);

        taken(&context, "A2", first_id).await;
        saved(&context, "A2", first_id).await;
        let outcome = tokio::time::timeout(Duration::from_secs(5), first.finished())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.saved, 2);
        assert!(!scheduler.is_running());

        let second = scheduler.request_capture("sitting", None, Some(0)).await.unwrap();
        assert_ne!(second.request.id, first_id);
        assert_eq!(context.board.capture.get(&id("A1")), RequestState::Requested);
    }
}
