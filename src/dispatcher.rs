//! Bounded fan-out with reply-driven refill.
//!
//! The "workers" are remote devices, so there is no local pool: a FIFO of
//! eligible devices feeds a window of at most `K` outstanding requests, and
//! a slot frees when the response router forwards a terminal reply for one
//! of them.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FleetError, FleetResult, TransportError};
use crate::events::{EventBus, FleetEvent};
use crate::registry::{Device, DeviceRegistry, StateTable};
use crate::router::{CorrelationKey, ResponseRouter};
use crate::types::{DeviceId, OperationKind};

/// Non-blocking single-holder guard: one live run per operation kind.
#[derive(Clone)]
pub struct OperationLock {
    kind: OperationKind,
    mutex: Arc<AsyncMutex<()>>,
}

impl OperationLock {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            mutex: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn try_acquire(&self) -> FleetResult<OwnedMutexGuard<()>> {
        Arc::clone(&self.mutex)
            .try_lock_owned()
            .map_err(|_| FleetError::AlreadyRunning(self.kind))
    }

    pub fn is_held(&self) -> bool {
        self.mutex.try_lock().is_err()
    }
}

#[derive(Default)]
pub struct CancelSlot {
    token: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl CancelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh token, cancelling any stale one left behind. A parent
    /// token makes the new one a child, so cancelling the parent reaches it.
    /// The returned generation is what [`CancelSlot::clear`] expects back.
    pub fn install(&self, parent: Option<&CancellationToken>) -> (u64, CancellationToken) {
        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slot = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, stale)) = slot.replace((generation, token.clone())) {
            warn!("discarding stale cancellation handle");
            stale.cancel();
        }
        (generation, token)
    }

    /// Returns whether a run was there to cancel.
    pub fn cancel(&self) -> bool {
        let slot = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token of `generation`. A newer run's token stays in place.
    pub fn clear(&self, generation: u64) {
        let mut slot = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
            slot.take();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Strict,
    Relaxed,
}

impl Eligibility {
    pub fn admits(&self, device: &Device) -> bool {
        match self {
            Eligibility::Strict => device.is_ready(),
            Eligibility::Relaxed => device.reachable != Some(false),
        }
    }
}

#[async_trait]
pub trait DispatchOperation: Send + Sync {
    fn correlation_key(&self) -> CorrelationKey;

    /// Read at dispatch start so live configuration changes apply to the next run.
    fn window_size(&self) -> usize;

    fn states(&self) -> &dyn StateSink;

    fn eligibility(&self) -> Eligibility {
        Eligibility::Strict
    }

    fn admits(&self, device: &Device) -> bool {
        self.eligibility().admits(device)
    }

    /// Dispatched ahead of everyone else and counts toward the window.
    fn priority_device(&self) -> Option<DeviceId> {
        None
    }

    /// Whether a failed publish to the priority device still holds its slot
    /// for the rest of the run.
    fn priority_failure_reserves_slot(&self) -> bool {
        false
    }

    async fn eligible_devices(&self, registry: &DeviceRegistry) -> FleetResult<Vec<DeviceId>> {
        Ok(registry
            .snapshot()
            .into_iter()
            .filter(|device| self.admits(device))
            .map(|device| device.id)
            .collect())
    }

    async fn publish(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn before_publish(&self, _device: &DeviceId) -> FleetResult<()> {
        Ok(())
    }

    async fn publish_failed(&self, _device: &DeviceId, _error: &TransportError) -> FleetResult<()> {
        Ok(())
    }

    async fn cancelled(&self, _devices: &[DeviceId]) {}

    async fn aborted(&self, _devices: &[DeviceId], _error: &FleetError) {}
}

pub trait StateSink: Send + Sync {
    fn reset(&self, ids: &[DeviceId]);
    fn try_begin(&self, id: &DeviceId) -> bool;
    fn mark_requested(&self, id: &DeviceId);
    fn mark_failed_to_request(&self, id: &DeviceId, reason: String);
    fn mark_cancelled(&self, ids: &[DeviceId]);
    fn mark_failed(&self, ids: &[DeviceId], reason: String);
}

impl<T, E> StateSink for StateTable<T, E>
where
    T: Clone + Send + Sync,
    E: Clone + Send + Sync + From<String>,
{
    fn reset(&self, ids: &[DeviceId]) {
        StateTable::reset(self, ids)
    }

    fn try_begin(&self, id: &DeviceId) -> bool {
        StateTable::begin(self, id)
    }

    fn mark_requested(&self, id: &DeviceId) {
        StateTable::mark_requested(self, id)
    }

    fn mark_failed_to_request(&self, id: &DeviceId, reason: String) {
        StateTable::mark_failed_to_request(self, id, reason)
    }

    fn mark_cancelled(&self, ids: &[DeviceId]) {
        StateTable::mark_cancelled(self, ids)
    }

    fn mark_failed(&self, ids: &[DeviceId], reason: String) {
        StateTable::mark_failed(self, ids, E::from(reason))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub kind: OperationKind,
    pub eligible: usize,
    pub dispatched: usize,
    pub failed_to_request: usize,
    pub completed: usize,
}

impl RunSummary {
    fn new(kind: OperationKind, eligible: usize) -> Self {
        Self {
            kind,
            eligible,
            dispatched: 0,
            failed_to_request: 0,
            completed: 0,
        }
    }
}

#[derive(Debug)]
struct Window {
    width: usize,
    reserved: usize,
    queue: VecDeque<DeviceId>,
    in_flight: HashSet<DeviceId>,
}

impl Window {
    fn new(width: usize, devices: Vec<DeviceId>) -> Self {
        Self {
            width: width.max(1),
            reserved: 0,
            queue: devices.into(),
            in_flight: HashSet::new(),
        }
    }

    fn has_capacity(&self) -> bool {
        self.in_flight.len() + self.reserved < self.width
    }

    fn next(&mut self) -> Option<DeviceId> {
        if self.has_capacity() {
            self.queue.pop_front()
        } else {
            None
        }
    }

    fn launched(&mut self, device: DeviceId) {
        self.in_flight.insert(device);
    }

    /// Permanently hold one slot. Never takes the last one, so a run can
    /// always make progress.
    fn reserve(&mut self) {
        if self.width - self.reserved > 1 {
            self.reserved += 1;
        }
    }

    fn complete(&mut self, device: &DeviceId) -> bool {
        self.in_flight.remove(device)
    }

    fn is_drained(&self) -> bool {
        self.in_flight.is_empty() && self.queue.is_empty()
    }

    fn take_outstanding(&mut self) -> Vec<DeviceId> {
        let mut outstanding: Vec<DeviceId> = self.in_flight.drain().collect();
        outstanding.sort();
        outstanding.extend(self.queue.drain(..));
        outstanding
    }
}

fn dispatch_order(mut devices: Vec<DeviceId>, priority: Option<&DeviceId>) -> Vec<DeviceId> {
    if let Some(priority) = priority {
        if let Some(index) = devices.iter().position(|d| d == priority) {
            let device = devices.remove(index);
            devices.insert(0, device);
        }
    }
    devices
}

pub struct BoundedDispatcher {
    kind: OperationKind,
    registry: Arc<DeviceRegistry>,
    router: Arc<ResponseRouter>,
    events: EventBus,
    lock: OperationLock,
    cancel: CancelSlot,
}

impl BoundedDispatcher {
    pub fn new(
        kind: OperationKind,
        registry: Arc<DeviceRegistry>,
        router: Arc<ResponseRouter>,
        events: EventBus,
    ) -> Self {
        Self {
            kind,
            registry,
            router,
            events,
            lock: OperationLock::new(kind),
            cancel: CancelSlot::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Run `op` to completion. `parent` lets a composing coordinator cancel
    /// this run through its own token.
    pub async fn run<O>(&self, op: &O, parent: Option<&CancellationToken>) -> FleetResult<RunSummary>
    where
        O: DispatchOperation + ?Sized,
    {
        let guard = self.lock.try_acquire()?;
        let (generation, token) = self.cancel.install(parent);

        let result = self.drive(op, &token).await;

        self.cancel.clear(generation);
        drop(guard);
        self.events.emit(FleetEvent::OperationEnded {
            kind: self.kind,
            succeeded: result.is_ok(),
        });

        match &result {
            Ok(summary) => info!(
                kind = %self.kind,
                eligible = summary.eligible,
                dispatched = summary.dispatched,
                failed_to_request = summary.failed_to_request,
                "dispatch run finished"
            ),
            Err(FleetError::Cancelled) => info!(kind = %self.kind, "dispatch run cancelled"),
            Err(e) => error!(kind = %self.kind, error = %e, "dispatch run aborted"),
        }
        result
    }

    async fn drive<O>(&self, op: &O, token: &CancellationToken) -> FleetResult<RunSummary>
    where
        O: DispatchOperation + ?Sized,
    {
        let eligible = op.eligible_devices(&self.registry).await?;
        let states = op.states();
        states.reset(&eligible);

        let priority = op.priority_device();
        let order = dispatch_order(eligible, priority.as_ref());
        let mut window = Window::new(op.window_size(), order);
        let mut summary = RunSummary::new(self.kind, window.queue.len());
        debug!(kind = %self.kind, eligible = summary.eligible, width = window.width, "starting dispatch");

        let mut subscription = self.router.subscribe(op.correlation_key());

        let result: FleetResult<()> = async {
            self.fill(op, &mut window, &mut summary, priority.as_ref(), token)
                .await?;
            while !window.is_drained() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(FleetError::Cancelled),
                    next = subscription.recv() => match next {
                        Some(device) => {
                            if window.complete(&device) {
                                summary.completed += 1;
                                self.fill(op, &mut window, &mut summary, priority.as_ref(), token)
                                    .await?;
                            } else {
                                debug!(kind = %self.kind, device_id = %device, "reply for device not in flight");
                            }
                        }
                        None => return Err(FleetError::RouterClosed),
                    },
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => Ok(summary),
            Err(FleetError::Cancelled) => {
                let outstanding = window.take_outstanding();
                states.mark_cancelled(&outstanding);
                op.cancelled(&outstanding).await;
                Err(FleetError::Cancelled)
            }
            Err(e) => {
                let outstanding = window.take_outstanding();
                states.mark_failed(&outstanding, e.to_string());
                op.aborted(&outstanding, &e).await;
                Err(e)
            }
        }
    }

    /// Publish to queued devices until the window is full or the queue is
    /// empty. A failed publish is terminal for that device and frees its slot
    /// at once, unless it is the priority device of an operation that
    /// reserves it.
    async fn fill<O>(
        &self,
        op: &O,
        window: &mut Window,
        summary: &mut RunSummary,
        priority: Option<&DeviceId>,
        token: &CancellationToken,
    ) -> FleetResult<()>
    where
        O: DispatchOperation + ?Sized,
    {
        let states = op.states();
        while let Some(device) = window.next() {
            if token.is_cancelled() {
                window.queue.push_front(device);
                return Err(FleetError::Cancelled);
            }

            states.mark_requested(&device);
            window.launched(device.clone());
            if let Err(e) = op.before_publish(&device).await {
                window.complete(&device);
                states.mark_failed_to_request(&device, e.to_string());
                summary.failed_to_request += 1;
                return Err(e);
            }

            match op.publish(&device).await {
                Ok(()) => {
                    summary.dispatched += 1;
                    debug!(kind = %self.kind, device_id = %device, "request published");
                }
                Err(e) => {
                    warn!(kind = %self.kind, device_id = %device, error = %e, "failed to publish request");
                    window.complete(&device);
                    states.mark_failed_to_request(&device, e.to_string());
                    summary.failed_to_request += 1;
                    if priority == Some(&device) && op.priority_failure_reserves_slot() {
                        window.reserve();
                    }
                    op.publish_failed(&device, &e).await?;
                }
            }
        }
        Ok(())
    }
}

/// Ad hoc single-device request outside any batch run. Does not take the
/// kind's exclusivity lock.
pub async fn poke<O>(registry: &DeviceRegistry, op: &O, device: &DeviceId, kind: OperationKind) -> FleetResult<()>
where
    O: DispatchOperation + ?Sized,
{
    let snapshot = registry
        .get(device)
        .ok_or_else(|| FleetError::UnknownDevice(device.to_string()))?;
    if !op.admits(&snapshot) {
        return Err(FleetError::NotEligible {
            device: device.clone(),
            reason: "device is not reachable or has no known status".to_string(),
        });
    }

    let states = op.states();
    if !states.try_begin(device) {
        return Err(FleetError::AlreadyRequested {
            device: device.clone(),
            kind,
        });
    }

    if let Err(e) = op.before_publish(device).await {
        warn!(%kind, device_id = %device, error = %e, "could not prepare single-device request");
        states.mark_failed_to_request(device, e.to_string());
        return Err(e);
    }
    if let Err(e) = op.publish(device).await {
        warn!(%kind, device_id = %device, error = %e, "failed to publish single-device request");
        states.mark_failed_to_request(device, e.to_string());
        op.publish_failed(device, &e).await?;
        return Err(e.into());
    }
    Ok(())
}
