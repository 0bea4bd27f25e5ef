use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::dispatcher::{self, BoundedDispatcher, DispatchOperation, RunSummary, StateSink};
use crate::error::{FleetError, FleetResult, TransportError};
use crate::events::FleetEvent;
use crate::fleet::FleetContext;
use crate::messages::Command;
use crate::net::{broadcast_cancel, send_command, Transport};
use crate::registry::{DeviceRegistry, DispatchBoard};
use crate::router::CorrelationKey;
use crate::storage::CaptureStore;
use crate::types::{DeviceId, OperationKind, PictureEvent};

struct PictureSendOperation<'a> {
    board: &'a DispatchBoard,
    transport: &'a dyn Transport,
    store: &'a dyn CaptureStore,
    request_id: Uuid,
    destination: String,
    window: usize,
}

impl PictureSendOperation<'_> {
    async fn apply(&self, device: &DeviceId, event: PictureEvent, detail: Option<String>) {
        if let Err(e) = self
            .store
            .apply_picture_event(self.request_id, device, event, detail)
            .await
        {
            error!(error = %e, request_id = %self.request_id, device_id = %device, ?event, "failed to persist picture status");
        }
    }
}

#[async_trait]
impl<'a> DispatchOperation for PictureSendOperation<'a> {
    fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::PictureSend(self.request_id)
    }

    fn window_size(&self) -> usize {
        self.window
    }

    fn states(&self) -> &dyn StateSink {
        &self.board.picture_send
    }

    /// Ready devices whose picture was captured but not yet delivered.
    async fn eligible_devices(&self, registry: &DeviceRegistry) -> FleetResult<Vec<DeviceId>> {
        let pictures = self.store.list_pictures(self.request_id).await?;
        Ok(pictures
            .into_iter()
            .filter(|picture| picture.status.is_sendable())
            .filter_map(|picture| registry.get(&picture.device_id))
            .filter(|device| self.admits(device))
            .map(|device| device.id)
            .collect())
    }

    async fn before_publish(&self, device: &DeviceId) -> FleetResult<()> {
        let status = self
            .store
            .apply_picture_event(self.request_id, device, PictureEvent::SendRequested, None)
            .await?;
        if status.is_none() {
            debug!(request_id = %self.request_id, device_id = %device, "picture no longer sendable");
        }
        Ok(())
    }

    async fn publish(&self, device: &DeviceId) -> Result<(), TransportError> {
        let command = Command::SendPicture {
            request_id: self.request_id,
            destination: self.destination.clone(),
        };
        send_command(self.transport, device, &command).await
    }

    async fn publish_failed(&self, device: &DeviceId, error: &TransportError) -> FleetResult<()> {
        self.store
            .apply_picture_event(
                self.request_id,
                device,
                PictureEvent::SendPublishFailed,
                Some(error.to_string()),
            )
            .await?;
        Ok(())
    }

    async fn cancelled(&self, devices: &[DeviceId]) {
        for device in devices {
            self.apply(device, PictureEvent::SendCancelled, None).await;
        }
    }

    async fn aborted(&self, devices: &[DeviceId], error: &FleetError) {
        for device in devices {
            self.apply(device, PictureEvent::SendFailed, Some(error.to_string()))
                .await;
        }
    }
}

/// Transfers the pictures of one capture request off the devices.
pub struct PictureSendCoordinator {
    context: FleetContext,
    dispatcher: BoundedDispatcher,
}

impl PictureSendCoordinator {
    pub fn new(context: &FleetContext) -> Self {
        Self {
            dispatcher: BoundedDispatcher::new(
                OperationKind::PictureSend,
                context.registry.clone(),
                context.router.clone(),
                context.events.clone(),
            ),
            context: context.clone(),
        }
    }

    fn operation(&self, request_id: Uuid) -> PictureSendOperation<'_> {
        let settings = self.context.settings.current();
        PictureSendOperation {
            board: &self.context.board,
            transport: self.context.transport.as_ref(),
            store: self.context.store.as_ref(),
            request_id,
            destination: settings.picture_destination,
            window: settings.max_concurrent_send,
        }
    }

    async fn ensure_request(&self, request_id: Uuid) -> FleetResult<()> {
        match self.context.store.get_request(request_id).await? {
            Some(_) => Ok(()),
            None => Err(FleetError::RequestNotFound(request_id)),
        }
    }

    pub async fn run(&self, request_id: Uuid) -> FleetResult<RunSummary> {
        self.run_within(request_id, None).await
    }

    /// Like [`run`](Self::run), but cancelling `parent` also cancels this run.
    #[instrument(skip(self, parent), fields(request_id = %request_id))]
    pub async fn run_within(
        &self,
        request_id: Uuid,
        parent: Option<&CancellationToken>,
    ) -> FleetResult<RunSummary> {
        self.ensure_request(request_id).await?;
        let result = self
            .dispatcher
            .run(&self.operation(request_id), parent)
            .await;
        if !matches!(result, Err(FleetError::AlreadyRunning(_))) {
            self.context
                .events
                .emit(FleetEvent::RequestSendFinished { request_id });
        }
        result
    }

    /// Re-send one picture outside any batch.
    #[instrument(skip(self), fields(request_id = %request_id, device_id = %device))]
    pub async fn send_one(&self, request_id: Uuid, device: &DeviceId) -> FleetResult<()> {
        self.ensure_request(request_id).await?;
        let pictures = self.context.store.list_pictures(request_id).await?;
        let sendable = pictures
            .iter()
            .any(|p| &p.device_id == device && p.status.is_sendable());
        if !sendable {
            return Err(FleetError::NotEligible {
                device: device.clone(),
                reason: format!("no sendable picture for request {}", request_id),
            });
        }

        dispatcher::poke(
            &self.context.registry,
            &self.operation(request_id),
            device,
            OperationKind::PictureSend,
        )
        .await
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LiveSettings, Settings};
    use crate::messages::{encode_reply, ReplyEnvelope, ReplyValue};
    use crate::simulate::{mark_ready, recording_context, RecordingTransport};
    use crate::storage::MockCaptureStore;
    use crate::types::{CapturePicture, CaptureRequest, PictureStatus, RequestState};
    use chrono::Utc;
    use std::sync::Arc;

    fn id(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    fn request() -> CaptureRequest {
        CaptureRequest {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            capture_at: Utc::now(),
            capture_type: "standing".into(),
            active: true,
            set_id: None,
        }
    }

    fn picture(request_id: Uuid, device: &str, status: PictureStatus) -> CapturePicture {
        CapturePicture {
            status,
            ..CapturePicture::requested(request_id, id(device))
        }
    }

    async fn setup(
        window: usize,
        pictures: &[(&str, PictureStatus)],
    ) -> (FleetContext, Arc<RecordingTransport>, PictureSendCoordinator, Uuid) {
        let devices: Vec<DeviceId> = pictures.iter().map(|(d, _)| id(d)).collect();
        let settings = Settings {
            max_concurrent_send: window,
            ..Settings::default()
        };
        let (context, transport) = recording_context(&devices, settings).unwrap();
        let request = request();
        let rows: Vec<CapturePicture> = pictures
            .iter()
            .map(|(d, s)| picture(request.id, d, *s))
            .collect();
        context.store.insert_request(&request, &rows).await.unwrap();
        let coordinator = PictureSendCoordinator::new(&context);
        (context, transport, coordinator, request.id)
    }

    async fn reply_sent(context: &FleetContext, device: &str, request_id: Uuid) {
        let payload = encode_reply(&ReplyEnvelope {
            success: true,
            value: ReplyValue::PictureSent { request_id },
        })
        .unwrap();
        context
            .router
            .handle_message(&format!("reply/picture-sent/{}", device), &payload)
            .await;
    }

    async fn status_of(context: &FleetContext, request_id: Uuid, device: &str) -> PictureStatus {
        context
            .store
            .list_pictures(request_id)
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.device_id == id(device))
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_only_sendable_pictures_on_ready_devices_are_sent() {
        let (context, transport, coordinator, request_id) = setup(
            4,
            &[
                ("A1", PictureStatus::SavedOnDevice),
                ("A2", PictureStatus::Taken),
                ("A3", PictureStatus::FailedToSend),
                ("A4", PictureStatus::SavedOnDevice),
                ("A5", PictureStatus::Success),
            ],
        )
        .await;
        context.registry.set_reachable(&id("A4"), false);
        let coordinator = Arc::new(coordinator);
        let mut events = context.events.subscribe();

        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(request_id).await }
        });
        transport.wait_for_publishes(2).await;
        assert_eq!(transport.targeted_devices(), vec![id("A1"), id("A3")]);
        assert_eq!(status_of(&context, request_id, "A1").await, PictureStatus::RequestedSend);

        let command = transport.published()[0].command().unwrap();
        assert_eq!(
            command,
            Command::SendPicture {
                request_id,
                destination: "smb://archive/pictures".into()
            }
        );

        reply_sent(&context, "A1", request_id).await;
        reply_sent(&context, "A3", request_id).await;
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.eligible, 2);

        assert_eq!(status_of(&context, request_id, "A1").await, PictureStatus::Success);
        assert_eq!(status_of(&context, request_id, "A3").await, PictureStatus::Success);
        assert_eq!(status_of(&context, request_id, "A4").await, PictureStatus::SavedOnDevice);

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            finished |= event == FleetEvent::RequestSendFinished { request_id };
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_cancel_then_late_success() {
        let (context, transport, coordinator, request_id) = setup(
            1,
            &[
                ("A1", PictureStatus::SavedOnDevice),
                ("A2", PictureStatus::SendCancelled),
            ],
        )
        .await;
        let coordinator = Arc::new(coordinator);

        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(request_id).await }
        });
        transport.wait_for_publishes(1).await;
        assert!(coordinator.cancel().await);
        assert!(matches!(run.await.unwrap(), Err(FleetError::Cancelled)));

        assert_eq!(status_of(&context, request_id, "A1").await, PictureStatus::SendCancelled);
        assert_eq!(status_of(&context, request_id, "A2").await, PictureStatus::SendCancelled);
        assert_eq!(context.board.picture_send.get(&id("A1")), RequestState::Cancelled);
        assert_eq!(context.board.picture_send.get(&id("A2")), RequestState::Cancelled);

        reply_sent(&context, "A1", request_id).await;
        assert_eq!(status_of(&context, request_id, "A1").await, PictureStatus::Success);
        assert_eq!(context.board.picture_send.get(&id("A1")), RequestState::Cancelled);
    }

    #[tokio::test]
    async fn test_publish_failure_marks_picture() {
        let (context, transport, coordinator, request_id) =
            setup(2, &[("A1", PictureStatus::SavedOnDevice)]).await;
        transport.fail_device(&id("A1"));

        let summary = coordinator.run(request_id).await.unwrap();
        assert_eq!(summary.failed_to_request, 1);
        assert_eq!(
            status_of(&context, request_id, "A1").await,
            PictureStatus::FailedToRequestSend
        );
        assert!(matches!(
            context.board.picture_send.get(&id("A1")),
            RequestState::FailedToRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let (_context, _transport, coordinator, _) = setup(1, &[]).await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            coordinator.run(missing).await,
            Err(FleetError::RequestNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_send_one_requires_sendable_picture() {
        let (context, transport, coordinator, request_id) = setup(
            1,
            &[
                ("A1", PictureStatus::Taken),
                ("A2", PictureStatus::FailedToSend),
            ],
        )
        .await;

        assert!(matches!(
            coordinator.send_one(request_id, &id("A1")).await,
            Err(FleetError::NotEligible { .. })
        ));

        coordinator.send_one(request_id, &id("A2")).await.unwrap();
        assert_eq!(transport.targeted_devices(), vec![id("A2")]);
        assert_eq!(status_of(&context, request_id, "A2").await, PictureStatus::RequestedSend);
    }

    #[tokio::test]
    async fn test_storage_fault_aborts_run() {
        let request = request();
        let request_id = request.id;
        let mut store = MockCaptureStore::new();
        store
            .expect_get_request()
            .returning(move |_| Ok(Some(request.clone())));
        store.expect_list_pictures().returning(move |_| {
            Ok(vec![picture(request_id, "A1", PictureStatus::SavedOnDevice)])
        });
        store
            .expect_apply_picture_event()
            .returning(|_, _, _, _| Err(FleetError::Storage(rusqlite::Error::InvalidQuery)));

        let registry = Arc::new(DeviceRegistry::new(vec![id("A1")]));
        mark_ready(&registry, &[id("A1")], "1.0.0");
        let transport = Arc::new(RecordingTransport::new());
        let context = FleetContext::new(
            registry,
            transport.clone(),
            Arc::new(store),
            LiveSettings::default(),
        );
        let coordinator = PictureSendCoordinator::new(&context);

        let result = coordinator.run(request_id).await;
        assert!(matches!(result, Err(FleetError::Storage(_))));
        assert!(transport.published().is_empty());
        assert!(matches!(
            context.board.picture_send.get(&id("A1")),
            RequestState::FailedToRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_send_one_storage_fault_is_failed_to_request() {
        let request = request();
        let request_id = request.id;
        let mut store = MockCaptureStore::new();
        store
            .expect_get_request()
            .returning(move |_| Ok(Some(request.clone())));
        store.expect_list_pictures().returning(move |_| {
            Ok(vec![picture(request_id, "A1", PictureStatus::SavedOnDevice)])
        });
        store
            .expect_apply_picture_event()
            .returning(|_, _, _, _| Err(FleetError::Storage(rusqlite::Error::InvalidQuery)));

        let registry = Arc::new(DeviceRegistry::new(vec![id("A1")]));
        mark_ready(&registry, &[id("A1")], "1.0.0");
        let transport = Arc::new(RecordingTransport::new());
        let context = FleetContext::new(
            registry,
            transport.clone(),
            Arc::new(store),
            LiveSettings::default(),
        );
        let coordinator = PictureSendCoordinator::new(&context);

        let first = coordinator.send_one(request_id, &id("A1")).await;
        assert!(matches!(first, Err(FleetError::Storage(_))));
        assert!(matches!(
            context.board.picture_send.get(&id("A1")),
            RequestState::FailedToRequest(_)
        ));

        // a retry is attempted again rather than refused as outstanding
        let retry = coordinator.send_one(request_id, &id("A1")).await;
        assert!(matches!(retry, Err(FleetError::Storage(_))));
        assert!(transport.published().is_empty());
    }
}
