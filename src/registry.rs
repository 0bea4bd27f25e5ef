//! Fleet state shared by every coordinator.
//!
//! [`DeviceRegistry`] owns device identity, reachability and the last status
//! snapshot. [`DispatchBoard`] owns the per-operation request states. Writers
//! are the response router and the dispatcher that owns a given operation
//! kind; everything else reads cloned snapshots.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{DeviceId, DeviceStatus, RequestState, TimeSyncFailure, TimeSyncResult};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    /// `None` until the device has been pinged or has replied to anything.
    pub reachable: Option<bool>,
    pub status: Option<DeviceStatus>,
    pub last_time_sync: Option<TimeSyncResult>,
    pub last_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    fn new(id: DeviceId) -> Self {
        Self {
            id,
            reachable: None,
            status: None,
            last_time_sync: None,
            last_error: None,
            last_seen: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.reachable == Some(true) && self.status.is_some()
    }
}

pub struct DeviceRegistry {
    order: Vec<DeviceId>,
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl DeviceRegistry {
    pub fn new(ids: impl IntoIterator<Item = DeviceId>) -> Self {
        let order: Vec<DeviceId> = ids.into_iter().collect();
        let devices = order
            .iter()
            .map(|id| (id.clone(), Device::new(id.clone())))
            .collect();
        Self {
            order,
            devices: RwLock::new(devices),
        }
    }

    pub fn with_default_fleet() -> Self {
        Self::new(DeviceId::grid().chain(std::iter::once(DeviceId::indicator())))
    }

    pub fn ids(&self) -> &[DeviceId] {
        &self.order
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        read(&self.devices).contains_key(id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        read(&self.devices).get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Device> {
        let devices = read(&self.devices);
        self.order
            .iter()
            .filter_map(|id| devices.get(id).cloned())
            .collect()
    }

    pub fn set_reachable(&self, id: &DeviceId, reachable: bool) {
        if let Some(device) = write(&self.devices).get_mut(id) {
            device.reachable = Some(reachable);
        }
    }

    /// Any reply proves the device is on the network.
    pub fn mark_seen(&self, id: &DeviceId) {
        if let Some(device) = write(&self.devices).get_mut(id) {
            device.reachable = Some(true);
            device.last_seen = Some(Utc::now());
        }
    }

    pub fn set_status(&self, id: &DeviceId, status: DeviceStatus) {
        if let Some(device) = write(&self.devices).get_mut(id) {
            device.status = Some(status);
        }
    }

    pub fn set_firmware_version(&self, id: &DeviceId, version: &str) {
        if let Some(device) = write(&self.devices).get_mut(id) {
            if let Some(status) = device.status.as_mut() {
                status.firmware_version = version.to_string();
            }
        }
    }

    pub fn record_time_sync(&self, id: &DeviceId, result: TimeSyncResult) {
        if let Some(device) = write(&self.devices).get_mut(id) {
            device.last_time_sync = Some(result);
        }
    }

    pub fn record_error(&self, id: &DeviceId, error: impl Into<String>) {
        if let Some(device) = write(&self.devices).get_mut(id) {
            device.last_error = Some(error.into());
        }
    }
}

pub struct StateTable<T, E = String> {
    states: RwLock<HashMap<DeviceId, RequestState<T, E>>>,
}

impl<T: Clone, E: Clone> Default for StateTable<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> StateTable<T, E> {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &DeviceId) -> RequestState<T, E> {
        read(&self.states).get(id).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<DeviceId, RequestState<T, E>> {
        read(&self.states).clone()
    }

    pub fn count_requested(&self) -> usize {
        read(&self.states).values().filter(|s| s.is_requested()).count()
    }

    pub fn reset(&self, ids: &[DeviceId]) {
        let mut states = write(&self.states);
        for id in ids {
            states.insert(id.clone(), RequestState::NotStarted);
        }
    }

    /// Single-device restart used by ad hoc pokes. Refuses while a request is
    /// already outstanding.
    pub fn begin(&self, id: &DeviceId) -> bool {
        let mut states = write(&self.states);
        let state = states.entry(id.clone()).or_default();
        if state.is_requested() {
            return false;
        }
        *state = RequestState::Requested;
        true
    }

    pub fn mark_requested(&self, id: &DeviceId) {
        let mut states = write(&self.states);
        let state = states.entry(id.clone()).or_default();
        if matches!(state, RequestState::NotStarted) {
            *state = RequestState::Requested;
        }
    }

    pub fn mark_failed_to_request(&self, id: &DeviceId, reason: impl Into<String>) {
        self.transition(id, RequestState::FailedToRequest(reason.into()));
    }

    /// Terminal transition driven by a reply. Only an outstanding request can
    /// be resolved; returns whether the state changed.
    pub fn resolve(&self, id: &DeviceId, outcome: RequestState<T, E>) -> bool {
        let mut states = write(&self.states);
        match states.get_mut(id) {
            Some(state) if state.is_requested() => {
                *state = outcome;
                true
            }
            _ => false,
        }
    }

    pub fn mark_cancelled(&self, ids: &[DeviceId]) {
        for id in ids {
            self.transition(id, RequestState::Cancelled);
        }
    }

    pub fn mark_failed(&self, ids: &[DeviceId], reason: E) {
        for id in ids {
            self.transition(id, RequestState::Failed(reason.clone()));
        }
    }

    fn transition(&self, id: &DeviceId, next: RequestState<T, E>) {
        let mut states = write(&self.states);
        let state = states.entry(id.clone()).or_default();
        if !state.is_terminal() {
            *state = next;
        }
    }
}

#[derive(Default)]
pub struct DispatchBoard {
    pub ping: StateTable<DeviceStatus>,
    pub time_sync: StateTable<TimeSyncResult, TimeSyncFailure>,
    pub update: StateTable<String>,
    pub capture: StateTable<()>,
    pub picture_send: StateTable<()>,
}

impl DispatchBoard {
    pub fn new() -> Self {
        Self::default()
    }
}
