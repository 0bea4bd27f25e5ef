//! In-process stand-ins for the device fleet.
//!
//! [`RecordingTransport`] only records what was published, for tests that
//! script replies by hand. [`SimulatedFleet`] answers every command on its
//! own after a short random delay, like a healthy rig would.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::config::{LiveSettings, Settings};
use crate::error::{FleetResult, TransportError};
use crate::fleet::FleetContext;
use crate::messages::{encode_reply, Command, ReplyEnvelope, ReplyKind, ReplyValue, CANCEL_TOPIC};
use crate::net::Transport;
use crate::registry::DeviceRegistry;
use crate::router::ResponseRouter;
use crate::storage::SqliteCaptureStore;
use crate::types::{CaptureMetadata, DeviceId, DeviceStatus};

/// Give every listed device a reachable flag and a status, as a ping would.
pub fn mark_ready(registry: &DeviceRegistry, ids: &[DeviceId], firmware_version: &str) {
    for id in ids {
        registry.mark_seen(id);
        registry.set_status(
            id,
            DeviceStatus {
                firmware_version: firmware_version.to_string(),
                mode: "idle".to_string(),
            },
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn command(&self) -> Option<Command> {
        serde_json::from_slice(&self.payload).ok()
    }

    pub fn device(&self) -> Option<DeviceId> {
        let segments: Vec<&str> = self.topic.split('/').collect();
        match segments.as_slice() {
            ["cmd", _, device] => DeviceId::parse(device).ok(),
            _ => None,
        }
    }
}

/// Records every publish; publishes to chosen devices fail.
pub struct RecordingTransport {
    published: Mutex<Vec<Published>>,
    failing: Mutex<HashSet<DeviceId>>,
    count: watch::Sender<usize>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            published: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            count,
        }
    }

    pub fn fail_device(&self, device: &DeviceId) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.clone());
    }

    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn targeted_devices(&self) -> Vec<DeviceId> {
        self.published().iter().filter_map(Published::device).collect()
    }

    /// Wait until at least `n` publish attempts (failed ones included) were made.
    pub async fn wait_for_publishes(&self, n: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let published = Published {
            topic: topic.to_string(),
            payload,
        };
        let fails = published.device().map_or(false, |device| {
            self.failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&device)
        });
        if !fails {
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(published);
        }
        self.count.send_modify(|count| *count += 1);

        if fails {
            Err(TransportError::Publish(format!("{} unreachable", topic)))
        } else {
            Ok(())
        }
    }
}

/// A fleet of well-behaved devices answering through the router.
pub struct SimulatedFleet {
    me: Weak<SimulatedFleet>,
    router: OnceLock<Weak<ResponseRouter>>,
    devices: Vec<DeviceId>,
    firmware_version: Mutex<String>,
    jitter_ms: (u64, u64),
    in_flight: Mutex<HashMap<&'static str, (usize, usize)>>,
}

impl SimulatedFleet {
    pub fn new(devices: Vec<DeviceId>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            router: OnceLock::new(),
            devices,
            firmware_version: Mutex::new("1.0.0".to_string()),
            jitter_ms: (2, 20),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn attach(&self, router: &Arc<ResponseRouter>) {
        let _ = self.router.set(Arc::downgrade(router));
    }

    /// Highest number of simultaneously unanswered targeted commands seen for `op`.
    pub fn peak_in_flight(&self, op: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(op)
            .map_or(0, |(_, peak)| *peak)
    }

    fn started(&self, op: &'static str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = in_flight.entry(op).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
    }

    fn finished(&self, op: &'static str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = in_flight.get_mut(op) {
            entry.0 = entry.0.saturating_sub(1);
        }
    }

    fn replies_for(&self, device: &DeviceId, command: &Command) -> Vec<(ReplyKind, ReplyValue)> {
        match command {
            Command::GetStatus => vec![(
                ReplyKind::Status,
                ReplyValue::Status(DeviceStatus {
                    firmware_version: self
                        .firmware_version
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone(),
                    mode: "idle".to_string(),
                }),
            )],
            Command::GetSyncStatus => {
                let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
                vec![(
                    ReplyKind::SyncStatus,
                    ReplyValue::SyncStatus {
                        output: format!("timestamp: {:.6} offset: -0.000120 error: 0.000035", now),
                    },
                )]
            }
            Command::Update { version, .. } => {
                *self
                    .firmware_version
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = version.clone();
                vec![(
                    ReplyKind::Update,
                    ReplyValue::Update {
                        version: version.clone(),
                    },
                )]
            }
            Command::TakePicture { request_id, .. } => vec![
                (
                    ReplyKind::Taken,
                    ReplyValue::Taken {
                        request_id: *request_id,
                        metadata: CaptureMetadata {
                            exposure_us: Some(8_000),
                            gain: Some(1.5),
                            sensor_timestamp_us: None,
                            taken_at: Some(Utc::now()),
                        },
                    },
                ),
                (
                    ReplyKind::Saved,
                    ReplyValue::Saved {
                        request_id: *request_id,
                        file_name: Some(format!("{}_{}.jpg", request_id, device)),
                    },
                ),
            ],
            Command::SendPicture { request_id, .. } => vec![(
                ReplyKind::PictureSent,
                ReplyValue::PictureSent {
                    request_id: *request_id,
                },
            )],
        }
    }

    fn respond(&self, device: DeviceId, command: Command, targeted: bool) {
        let Some(fleet) = self.me.upgrade() else {
            return;
        };
        let (low, high) = self.jitter_ms;
        let mut delay = rand::thread_rng().gen_range(low..=high);
        if let Command::TakePicture { capture_at_us, .. } = &command {
            let now_us = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
            delay += capture_at_us.saturating_sub(now_us) / 1_000;
        }
        let op = command.op();
        if targeted {
            self.started(op);
        }

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let Some(router) = fleet.router.get().and_then(Weak::upgrade) else {
                return;
            };
            if targeted {
                fleet.finished(op);
            }
            for (kind, value) in fleet.replies_for(&device, &command) {
                let envelope = ReplyEnvelope {
                    success: true,
                    value,
                };
                if let Ok(payload) = encode_reply(&envelope) {
                    router.handle_message(&kind.topic_for(&device), &payload).await;
                }
            }
        });
    }
}

#[async_trait]
impl Transport for SimulatedFleet {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if topic == CANCEL_TOPIC {
            debug!("simulated fleet received cancel");
            return Ok(());
        }
        let command: Command = serde_json::from_slice(&payload)?;
        let published = Published {
            topic: topic.to_string(),
            payload,
        };

        match published.device() {
            Some(device) => self.respond(device, command, true),
            None => {
                for device in self.devices.iter().filter(|d| !d.is_indicator()) {
                    self.respond(device.clone(), command.clone(), false);
                }
            }
        }
        Ok(())
    }
}

/// Context over a [`RecordingTransport`] and an in-memory store, with every
/// device already reachable and reporting firmware "1.0.0".
pub fn recording_context(
    devices: &[DeviceId],
    settings: Settings,
) -> FleetResult<(FleetContext, Arc<RecordingTransport>)> {
    let registry = Arc::new(DeviceRegistry::new(devices.to_vec()));
    mark_ready(&registry, devices, "1.0.0");
    let transport = Arc::new(RecordingTransport::new());
    let store = Arc::new(SqliteCaptureStore::open_in_memory()?);
    let context = FleetContext::new(
        registry,
        transport.clone(),
        store,
        LiveSettings::new(settings),
    );
    Ok((context, transport))
}

/// Context whose transport is a [`SimulatedFleet`] answering for `devices`.
/// Devices start unknown; a ping makes them ready.
pub fn simulated_context(
    devices: &[DeviceId],
    settings: Settings,
) -> FleetResult<(FleetContext, Arc<SimulatedFleet>)> {
    let registry = Arc::new(DeviceRegistry::new(devices.to_vec()));
    let fleet = SimulatedFleet::new(devices.to_vec());
    let store = Arc::new(SqliteCaptureStore::open_in_memory()?);
    let context = FleetContext::new(registry, fleet.clone(), store, LiveSettings::new(settings));
    fleet.attach(&context.router);
    Ok((context, fleet))
}
