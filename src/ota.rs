use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::dispatcher::{
    self, BoundedDispatcher, DispatchOperation, Eligibility, RunSummary, StateSink,
};
use crate::error::{FleetResult, TransportError};
use crate::fleet::FleetContext;
use crate::messages::{Command, ReplyEnvelope, ReplyValue};
use crate::net::{broadcast_cancel, send_command, Transport};
use crate::registry::{Device, DispatchBoard};
use crate::router::CorrelationKey;
use crate::types::{DeviceId, OperationKind, RequestState};

/// Firmware build the fleet should run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FirmwareTarget {
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Ask the firmware manifest endpoint for the latest build. `204 No Content`
/// or an empty body means there is nothing to roll out.
pub async fn fetch_latest_firmware(client: &Client, manifest_url: &str) -> Result<Option<FirmwareTarget>> {
    info!("Checking for firmware updates at {}", manifest_url);
    let response = client.get(manifest_url).send().await?;

    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Ok(None);
    }

    let text = response.error_for_status()?.text().await?;
    if text.trim().is_empty() {
        return Ok(None);
    }

    let target: FirmwareTarget = serde_json::from_str(&text)?;
    Ok(Some(target))
}

pub fn classify_reply(envelope: &ReplyEnvelope) -> RequestState<String> {
    match (envelope.success, &envelope.value) {
        (true, ReplyValue::Update { version }) => RequestState::Succeeded(version.clone()),
        (false, ReplyValue::Error { reason, .. }) => RequestState::Failed(reason.clone()),
        (_, other) => RequestState::Unknown(format!("unexpected update reply: {:?}", other)),
    }
}

struct UpdateOperation<'a> {
    board: &'a DispatchBoard,
    transport: &'a dyn Transport,
    target: &'a FirmwareTarget,
    force: bool,
    window: usize,
}

#[async_trait]
impl<'a> DispatchOperation for UpdateOperation<'a> {
    fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::Update
    }

    fn window_size(&self) -> usize {
        self.window
    }

    fn states(&self) -> &dyn StateSink {
        &self.board.update
    }

    fn eligibility(&self) -> Eligibility {
        if self.force {
            Eligibility::Relaxed
        } else {
            Eligibility::Strict
        }
    }

    fn admits(&self, device: &Device) -> bool {
        if !self.eligibility().admits(device) {
            return false;
        }
        let current = device.status.as_ref().map(|s| s.firmware_version.as_str());
        self.force || current != Some(self.target.version.as_str())
    }

    fn priority_device(&self) -> Option<DeviceId> {
        Some(DeviceId::indicator())
    }

    async fn publish(&self, device: &DeviceId) -> Result<(), TransportError> {
        let command = Command::Update {
            version: self.target.version.clone(),
            url: self.target.url.clone(),
            checksum: self.target.checksum.clone(),
        };
        send_command(self.transport, device, &command).await
    }
}

/// Rolls a firmware build out to the fleet, `max_concurrent_update` at a time.
pub struct UpdateCoordinator {
    context: FleetContext,
    dispatcher: BoundedDispatcher,
}

impl UpdateCoordinator {
    pub fn new(context: &FleetContext) -> Self {
        Self {
            dispatcher: BoundedDispatcher::new(
                OperationKind::Update,
                context.registry.clone(),
                context.router.clone(),
                context.events.clone(),
            ),
            context: context.clone(),
        }
    }

    fn operation<'a>(&'a self, target: &'a FirmwareTarget, force: bool) -> UpdateOperation<'a> {
        UpdateOperation {
            board: &self.context.board,
            transport: self.context.transport.as_ref(),
            target,
            force,
            window: self.context.settings.current().max_concurrent_update,
        }
    }

    /// Devices already on `target.version` are skipped unless `force` is set.
    #[instrument(skip(self, target), fields(version = %target.version))]
    pub async fn run(&self, target: &FirmwareTarget, force: bool) -> FleetResult<RunSummary> {
        self.dispatcher.run(&self.operation(target, force), None).await
    }

    #[instrument(skip(self, target), fields(device_id = %device, version = %target.version))]
    pub async fn poke(&self, device: &DeviceId, target: &FirmwareTarget, force: bool) -> FleetResult<()> {
        dispatcher::poke(
            &self.context.registry,
            &self.operation(target, force),
            device,
            OperationKind::Update,
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
    use crate::config::Settings;
    use crate::error::FleetError;
    use crate::messages::encode_reply;
    use crate::simulate::{recording_context, RecordingTransport};
    use crate::types::DeviceStatus;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn id(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    fn target() -> FirmwareTarget {
        FirmwareTarget {
            version: "2.0.0".into(),
            url: "http://firmware.local/2.0.0.bin".into(),
            checksum: Some("abc123".into()),
        }
    }

    fn setup(devices: &[&str], window: usize) -> (FleetContext, Arc<RecordingTransport>, Arc<UpdateCoordinator>) {
        let ids: Vec<DeviceId> = devices.iter().map(|d| id(d)).collect();
        let settings = Settings {
            max_concurrent_update: window,
            ..Settings::default()
        };
        let (context, transport) = recording_context(&ids, settings).unwrap();
        let coordinator = Arc::new(UpdateCoordinator::new(&context));
        (context, transport, coordinator)
    }

    async fn reply_updated(context: &FleetContext, device: &str, version: &str) {
        let payload = encode_reply(&ReplyEnvelope {
            success: true,
            value: ReplyValue::Update {
                version: version.into(),
            },
        })
        .unwrap();
        context
            .router
            .handle_message(&format!("reply/update/{}", device), &payload)
            .await;
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/firmware/latest", addr)
    }

    #[test]
    fn test_classify_update_reply() {
        let ok = ReplyEnvelope {
            success: true,
            value: ReplyValue::Update {
                version: "2.0.0".into(),
            },
        };
        assert_eq!(classify_reply(&ok), RequestState::Succeeded("2.0.0".into()));

        let failed = ReplyEnvelope {
            success: false,
            value: ReplyValue::Error {
                request_id: None,
                reason: "checksum mismatch".into(),
            },
        };
        assert_eq!(
            classify_reply(&failed),
            RequestState::Failed("checksum mismatch".into())
        );
    }

    #[tokio::test]
    async fn test_devices_on_target_version_are_skipped() {
        let (context, transport, coordinator) = setup(&["A1", "A2", "A3"], 4);
        context.registry.set_status(
            &id("A2"),
            DeviceStatus {
                firmware_version: "2.0.0".into(),
                mode: "idle".into(),
            },
        );

        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(&target(), false).await }
        });
        transport.wait_for_publishes(2).await;
        assert_eq!(transport.targeted_devices(), vec![id("A1"), id("A3")]);

        let command = transport.published()[0].command().unwrap();
        assert!(matches!(command, Command::Update { ref version, .. } if version == "2.0.0"));

        reply_updated(&context, "A1", "2.0.0").await;
        reply_updated(&context, "A3", "2.0.0").await;
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.eligible, 2);

        let a1 = context.registry.get(&id("A1")).unwrap();
        assert_eq!(a1.status.unwrap().firmware_version, "2.0.0");
        assert_eq!(
            context.board.update.get(&id("A3")),
            RequestState::Succeeded("2.0.0".into())
        );
    }

    #[tokio::test]
    async fn test_force_relaxes_eligibility() {
        let (context, transport, coordinator) = setup(&["A1", "A2"], 4);
        context.registry.set_status(
            &id("A1"),
            DeviceStatus {
                firmware_version: "2.0.0".into(),
                mode: "idle".into(),
            },
        );
        context.registry.set_reachable(&id("A2"), false);

        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(&target(), true).await }
        });
        transport.wait_for_publishes(1).await;
        assert_eq!(transport.targeted_devices(), vec![id("A1")]);

        reply_updated(&context, "A1", "2.0.0").await;
        assert_eq!(run.await.unwrap().unwrap().eligible, 1);
    }

    #[tokio::test]
    async fn test_indicator_publish_failure_frees_its_slot() {
        let (context, transport, coordinator) = setup(&["A1", "A2", "A3", "IND"], 2);
        transport.fail_device(&DeviceId::indicator());

        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(&target(), false).await }
        });
        transport.wait_for_publishes(3).await;
        assert_eq!(transport.targeted_devices(), vec![id("A1"), id("A2")]);
        assert_eq!(context.board.update.count_requested(), 2);

        coordinator.cancel().await;
        assert!(matches!(run.await.unwrap(), Err(FleetError::Cancelled)));
        assert!(matches!(
            context.board.update.get(&DeviceId::indicator()),
            RequestState::FailedToRequest(_)
        ));
        assert_eq!(context.board.update.get(&id("A3")), RequestState::Cancelled);
    }

    #[tokio::test]
    async fn test_second_rollout_is_refused_while_running() {
        let (context, transport, coordinator) = setup(&["A1", "A2"], 1);
        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(&target(), false).await }
        });
        transport.wait_for_publishes(1).await;

        assert!(coordinator.is_running());
        assert!(matches!(
            coordinator.run(&target(), true).await,
            Err(FleetError::AlreadyRunning(OperationKind::Update))
        ));
        assert_eq!(transport.published().len(), 1);

        reply_updated(&context, "A1", "2.0.0").await;
        transport.wait_for_publishes(2).await;
        reply_updated(&context, "A2", "2.0.0").await;
        assert_eq!(run.await.unwrap().unwrap().completed, 2);
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_late_reply_keeps_terminal_state() {
        let (context, transport, coordinator) = setup(&["A1", "A2"], 1);
        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(&target(), false).await }
        });
        transport.wait_for_publishes(1).await;
        reply_updated(&context, "A1", "2.0.0").await;
        transport.wait_for_publishes(2).await;
        assert!(coordinator.cancel().await);
        assert!(matches!(run.await.unwrap(), Err(FleetError::Cancelled)));
        assert_eq!(context.board.update.get(&id("A2")), RequestState::Cancelled);

        // the device still finishes after the run gave up on it
        reply_updated(&context, "A2", "2.0.0").await;
        assert_eq!(context.board.update.get(&id("A2")), RequestState::Cancelled);
        let a2 = context.registry.get(&id("A2")).unwrap();
        assert_eq!(a2.status.unwrap().firmware_version, "2.0.0");

        // a duplicate for a finished request changes nothing either
        reply_updated(&context, "A1", "2.0.1").await;
        assert_eq!(
            context.board.update.get(&id("A1")),
            RequestState::Succeeded("2.0.0".into())
        );
    }

    #[tokio::test]
    async fn test_poke_refuses_device_on_target_version() {
        let (context, _transport, coordinator) = setup(&["A1"], 1);
        context.registry.set_status(
            &id("A1"),
            DeviceStatus {
                firmware_version: "2.0.0".into(),
                mode: "idle".into(),
            },
        );
        assert!(matches!(
            coordinator.poke(&id("A1"), &target(), false).await,
            Err(FleetError::NotEligible { .. })
        ));
        coordinator.poke(&id("A1"), &target(), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_latest_firmware() {
        let client = Client::new();

        let body = r#"{"version":"2.1.0","url":"http://fw/2.1.0.bin"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let url = serve_once(response).await;
        let target = fetch_latest_firmware(&client, &url).await.unwrap().unwrap();
        assert_eq!(target.version, "2.1.0");
        assert_eq!(target.checksum, None);

        let url = serve_once("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        assert!(fetch_latest_firmware(&client, &url).await.unwrap().is_none());
    }
}
