use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::dispatcher::{CancelSlot, OperationLock};
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::fleet::FleetContext;
use crate::net::broadcast_cancel;
use crate::picture_send::PictureSendCoordinator;
use crate::types::{OperationKind, PictureStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSendSummary {
    pub set_id: Uuid,
    pub requests: usize,
    pub failed_requests: usize,
    pub completed: bool,
}

/// Sends every active request of a capture set, one request at a time.
///
/// Holds its own lock, separate from the per-request one, so the loop can
/// take and release the request lock once per iteration.
pub struct PictureSetCoordinator {
    context: FleetContext,
    sender: Arc<PictureSendCoordinator>,
    lock: OperationLock,
    cancel: CancelSlot,
}

impl PictureSetCoordinator {
    pub fn new(context: &FleetContext, sender: Arc<PictureSendCoordinator>) -> Self {
        Self {
            context: context.clone(),
            sender,
            lock: OperationLock::new(OperationKind::SetSend),
            cancel: CancelSlot::new(),
        }
    }

    #[instrument(skip(self), fields(set_id = %set_id))]
    pub async fn send_set(&self, set_id: Uuid) -> FleetResult<SetSendSummary> {
        let guard = self.lock.try_acquire()?;
        let (generation, token) = self.cancel.install(None);

        let result = self.drive(set_id, &token).await;

        self.cancel.clear(generation);
        drop(guard);
        self.context.events.emit(FleetEvent::OperationEnded {
            kind: OperationKind::SetSend,
            succeeded: result.is_ok(),
        });
        match &result {
            Ok(summary) => info!(
                requests = summary.requests,
                failed_requests = summary.failed_requests,
                completed = summary.completed,
                "set send finished"
            ),
            Err(FleetError::Cancelled) => info!("set send cancelled"),
            Err(e) => error!(error = %e, "set send aborted"),
        }
        result
    }

    async fn drive(&self, set_id: Uuid, token: &CancellationToken) -> FleetResult<SetSendSummary> {
        let store = &self.context.store;
        if store.get_set(set_id).await?.is_none() {
            return Err(FleetError::SetNotFound(set_id));
        }
        let requests = store.list_active_requests(set_id).await?;
        let ids: HashSet<Uuid> = requests.iter().map(|r| r.id).collect();

        let done = CancellationToken::new();
        let forwarder = tokio::spawn(forward_request_events(
            self.context.events.subscribe(),
            self.context.events.clone(),
            set_id,
            ids.clone(),
            done.clone(),
        ));

        let mut summary = SetSendSummary {
            set_id,
            requests: requests.len(),
            failed_requests: 0,
            completed: false,
        };
        let mut outcome = Ok(());
        for request in &requests {
            if token.is_cancelled() {
                outcome = Err(FleetError::Cancelled);
                break;
            }
            match self.sender.run_within(request.id, Some(token)).await {
                Ok(_) => {}
                Err(e @ (FleetError::Cancelled | FleetError::AlreadyRunning(_))) => {
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "request send failed, continuing with set");
                    summary.failed_requests += 1;
                }
            }
        }

        done.cancel();
        if let Err(e) = forwarder.await {
            warn!(error = %e, "set event forwarder failed");
        }
        outcome?;

        if !requests.is_empty() && self.all_delivered(&ids).await? {
            store.complete_set(set_id).await?;
            self.context.events.emit(FleetEvent::SetCompleted { set_id });
            summary.completed = true;
        }
        Ok(summary)
    }

    async fn all_delivered(&self, request_ids: &HashSet<Uuid>) -> FleetResult<bool> {
        for request_id in request_ids {
            let pictures = self.context.store.list_pictures(*request_id).await?;
            if pictures.iter().any(|p| p.status != PictureStatus::Success) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Cancels the set loop and, through its token, the request send in progress.
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

/// Re-emit request completions belonging to `set_id` as set-level events
/// until `done`, then drain whatever is already queued.
async fn forward_request_events(
    mut rx: Receiver<FleetEvent>,
    events: EventBus,
    set_id: Uuid,
    request_ids: HashSet<Uuid>,
    done: CancellationToken,
) {
    let forward = |event: FleetEvent| {
        if let FleetEvent::RequestSendFinished { request_id } = event {
            if request_ids.contains(&request_id) {
                events.emit(FleetEvent::SetRequestFinished { set_id, request_id });
            }
        }
    };

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => forward(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "set event forwarder lagged"),
                Err(RecvError::Closed) => return,
            },
        }
    }
    loop {
        match rx.try_recv() {
            Ok(event) => forward(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::messages::{encode_reply, ReplyEnvelope, ReplyValue};
    use crate::simulate::{recording_context, RecordingTransport};
    use crate::types::{CapturePicture, CaptureRequest, DeviceId};
    use chrono::Utc;

    fn id(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    struct Rig {
        context: FleetContext,
        transport: Arc<RecordingTransport>,
        sender: Arc<PictureSendCoordinator>,
        sets: Arc<PictureSetCoordinator>,
    }

    fn rig(devices: &[&str], window: usize) -> Rig {
        let ids: Vec<DeviceId> = devices.iter().map(|d| id(d)).collect();
        let settings = Settings {
            max_concurrent_send: window,
            ..Settings::default()
        };
        let (context, transport) = recording_context(&ids, settings).unwrap();
        let sender = Arc::new(PictureSendCoordinator::new(&context));
        let sets = Arc::new(PictureSetCoordinator::new(&context, sender.clone()));
        Rig {
            context,
            transport,
            sender,
            sets,
        }
    }

    async fn add_request(rig: &Rig, set_id: Uuid, capture_type: &str, devices: &[&str]) -> Uuid {
        let request = CaptureRequest {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            capture_at: Utc::now(),
            capture_type: capture_type.into(),
            active: true,
            set_id: Some(set_id),
        };
        let pictures: Vec<CapturePicture> = devices
            .iter()
            .map(|d| CapturePicture {
                status: PictureStatus::SavedOnDevice,
                ..CapturePicture::requested(request.id, id(d))
            })
            .collect();
        rig.context
            .store
            .insert_request(&request, &pictures)
            .await
            .unwrap();
        request.id
    }

    async fn reply_sent(rig: &Rig, device: &str, request_id: Uuid) {
        let payload = encode_reply(&ReplyEnvelope {
            success: true,
            value: ReplyValue::PictureSent { request_id },
        })
        .unwrap();
        rig.context
            .router
            .handle_message(&format!("reply/picture-sent/{}", device), &payload)
            .await;
    }

    fn sent_request_ids(rig: &Rig) -> Vec<Uuid> {
        rig.transport
            .published()
            .iter()
            .filter_map(|p| match p.command() {
                Some(crate::messages::Command::SendPicture { request_id, .. }) => Some(request_id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_requests_are_sent_in_order_and_set_completes() {
        let rig = rig(&["A1", "A2"], 4);
        let set = rig.context.store.create_set("morning").await.unwrap();
        let first = add_request(&rig, set.id, "standing", &["A1", "A2"]).await;
        let second = add_request(&rig, set.id, "sitting", &["A1", "A2"]).await;
        let mut events = rig.context.events.subscribe();

        let run = tokio::spawn({
            let sets = rig.sets.clone();
            async move { sets.send_set(set.id).await }
        });

        rig.transport.wait_for_publishes(2).await;
        assert_eq!(sent_request_ids(&rig), vec![first, first]);
        reply_sent(&rig, "A1", first).await;
        reply_sent(&rig, "A2", first).await;

        rig.transport.wait_for_publishes(4).await;
        assert_eq!(sent_request_ids(&rig), vec![first, first, second, second]);
        reply_sent(&rig, "A2", second).await;
        reply_sent(&rig, "A1", second).await;

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.requests, 2);
        assert!(summary.completed);
        assert!(rig.context.store.get_set(set.id).await.unwrap().unwrap().completed);

        let mut set_events = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                FleetEvent::SetRequestFinished { set_id, request_id } => {
                    assert_eq!(set_id, set.id);
                    set_events.push(request_id);
                }
                FleetEvent::SetCompleted { set_id } => {
                    assert_eq!(set_id, set.id);
                    set_events.push(set_id);
                }
                _ => {}
            }
        }
        assert_eq!(set_events, vec![first, second, set.id]);
    }

    #[tokio::test]
    async fn test_cancel_stops_inner_send_and_remaining_requests() {
        let rig = rig(&["A1", "A2"], 1);
        let set = rig.context.store.create_set("evening").await.unwrap();
        let first = add_request(&rig, set.id, "standing", &["A1", "A2"]).await;
        add_request(&rig, set.id, "sitting", &["A1"]).await;

        let run = tokio::spawn({
            let sets = rig.sets.clone();
            async move { sets.send_set(set.id).await }
        });
        rig.transport.wait_for_publishes(1).await;
        assert!(rig.sets.is_running());
        assert!(rig.sender.is_running());

        assert!(rig.sets.cancel().await);
        assert!(matches!(run.await.unwrap(), Err(FleetError::Cancelled)));
        assert!(!rig.sender.is_running());

        assert_eq!(sent_request_ids(&rig), vec![first]);
        let pictures = rig.context.store.list_pictures(first).await.unwrap();
        assert_eq!(pictures[0].status, PictureStatus::SendCancelled);
        assert_eq!(pictures[1].status, PictureStatus::SavedOnDevice);
        assert!(!rig.context.store.get_set(set.id).await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_set_and_request_locks_are_separate() {
        let rig = rig(&["A1"], 1);
        let set = rig.context.store.create_set("s").await.unwrap();
        let request = add_request(&rig, set.id, "standing", &["A1"]).await;

        let run = tokio::spawn({
            let sets = rig.sets.clone();
            async move { sets.send_set(set.id).await }
        });
        rig.transport.wait_for_publishes(1).await;

        assert!(matches!(
            rig.sets.send_set(set.id).await,
            Err(FleetError::AlreadyRunning(OperationKind::SetSend))
        ));
        assert!(matches!(
            rig.sender.run(request).await,
            Err(FleetError::AlreadyRunning(OperationKind::PictureSend))
        ));

        reply_sent(&rig, "A1", request).await;
        assert!(run.await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_superseded_request_is_skipped() {
        let rig = rig(&["A1"], 1);
        let set = rig.context.store.create_set("retake").await.unwrap();
        add_request(&rig, set.id, "standing", &["A1"]).await;
        let retake = add_request(&rig, set.id, "standing", &["A1"]).await;

        let run = tokio::spawn({
            let sets = rig.sets.clone();
            async move { sets.send_set(set.id).await }
        });
        rig.transport.wait_for_publishes(1).await;
        reply_sent(&rig, "A1", retake).await;

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.requests, 1);
        assert_eq!(sent_request_ids(&rig), vec![retake]);
    }

    #[tokio::test]
    async fn test_unknown_set() {
        let rig = rig(&["A1"], 1);
        assert!(matches!(
            rig.sets.send_set(Uuid::new_v4()).await,
            Err(FleetError::SetNotFound(_))
        ));
        assert!(!rig.sets.is_running());
    }
}
