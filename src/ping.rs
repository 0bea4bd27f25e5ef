use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::{CancelSlot, OperationLock};
use crate::error::{FleetError, FleetResult};
use crate::events::FleetEvent;
use crate::fleet::FleetContext;
use crate::messages::Command;
use crate::net::send_command;
use crate::router::CorrelationKey;
use crate::types::{DeviceId, OperationKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingSummary {
    pub requested: usize,
    pub replied: usize,
    pub unreachable: Vec<DeviceId>,
}

/// Status sweep over every registered device.
///
/// Status queries are cheap, so there is no window: every device is asked at
/// once and whoever has not answered when `timeout` elapses is marked
/// unreachable.
pub struct PingCoordinator {
    context: FleetContext,
    timeout: Duration,
    lock: OperationLock,
    cancel: CancelSlot,
}

impl PingCoordinator {
    pub fn new(context: &FleetContext, timeout: Duration) -> Self {
        Self {
            context: context.clone(),
            timeout,
            lock: OperationLock::new(OperationKind::Ping),
            cancel: CancelSlot::new(),
        }
    }

    #[instrument(skip(self), fields(timeout_ms = self.timeout.as_millis() as u64))]
    pub async fn run(&self) -> FleetResult<PingSummary> {
        let guard = self.lock.try_acquire()?;
        let (generation, token) = self.cancel.install(None);

        let result = self.sweep(&token).await;

        self.cancel.clear(generation);
        drop(guard);
        self.context.events.emit(FleetEvent::OperationEnded {
            kind: OperationKind::Ping,
            succeeded: result.is_ok(),
        });
        if let Ok(summary) = &result {
            info!(
                requested = summary.requested,
                replied = summary.replied,
                unreachable = summary.unreachable.len(),
                "ping sweep finished"
            );
        }
        result
    }

    async fn sweep(&self, token: &CancellationToken) -> FleetResult<PingSummary> {
        let registry = &self.context.registry;
        let states = &self.context.board.ping;
        let ids = registry.ids().to_vec();
        states.reset(&ids);

        let mut subscription = self.context.router.subscribe(CorrelationKey::Ping);
        let mut pending: HashSet<DeviceId> = HashSet::new();
        let mut unreachable = Vec::new();

        for device in &ids {
            if token.is_cancelled() {
                break;
            }
            states.mark_requested(device);
            pending.insert(device.clone());
            if let Err(e) = send_command(self.context.transport.as_ref(), device, &Command::GetStatus).await {
                warn!(device_id = %device, error = %e, "failed to publish status request");
                pending.remove(device);
                states.mark_failed_to_request(device, e.to_string());
                registry.set_reachable(device, false);
                unreachable.push(device.clone());
            }
        }
        let requested = pending.len();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = &mut deadline => break,
                next = subscription.recv() => match next {
                    Some(device) => {
                        pending.remove(&device);
                    }
                    None => return Err(FleetError::RouterClosed),
                },
            }
        }

        if token.is_cancelled() {
            // covers both the outstanding devices and those never asked
            states.mark_cancelled(&ids);
            info!("ping sweep cancelled");
            return Err(FleetError::Cancelled);
        }

        let mut silent: Vec<DeviceId> = pending.into_iter().collect();
        silent.sort();
        if !silent.is_empty() {
            debug!(count = silent.len(), "devices did not answer the status request");
            states.mark_failed(&silent, format!("no reply within {} ms", self.timeout.as_millis()));
            for device in &silent {
                registry.set_reachable(device, false);
            }
        }
        unreachable.extend(silent);
        unreachable.sort();

        Ok(PingSummary {
            requested,
            replied: ids.len() - unreachable.len(),
            unreachable,
        })
    }

    /// Returns whether a sweep was running.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }
}
