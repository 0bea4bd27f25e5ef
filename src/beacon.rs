//! Clock-sync beacon: decoding, multicast reception and capture-time alignment.
//!
//! The beacon is a 40-byte little-endian packet:
//!
//! | offset | type | field                  |
//! |--------|------|------------------------|
//! | 0      | u32  | frame duration (µs)    |
//! | 4      | u32  | padding                |
//! | 8      | u64  | system frame start (µs)|
//! | 16     | u64  | wall frame start (µs)  |
//! | 24     | u64  | system ready (µs)      |
//! | 32     | u64  | wall ready (µs)        |
//!
//! Wall-clock fields count microseconds since the Unix epoch.

use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FleetError, FleetResult};

pub const BEACON_LEN: usize = 40;

/// Added after the aligned frame boundary so devices are never asked for a
/// frame that is already being exposed.
pub const CAPTURE_MARGIN_US: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncBeacon {
    pub frame_duration_us: u32,
    pub system_frame_us: u64,
    pub wall_frame_us: u64,
    pub system_ready_us: u64,
    pub wall_ready_us: u64,
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

impl ClockSyncBeacon {
    pub fn parse(bytes: &[u8]) -> FleetResult<Self> {
        if bytes.len() != BEACON_LEN {
            return Err(FleetError::InvalidBeacon(format!(
                "expected {} bytes, got {}",
                BEACON_LEN,
                bytes.len()
            )));
        }
        let frame_duration_us = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if frame_duration_us == 0 {
            return Err(FleetError::InvalidBeacon("zero frame duration".to_string()));
        }
        Ok(Self {
            frame_duration_us,
            system_frame_us: u64_at(bytes, 8),
            wall_frame_us: u64_at(bytes, 16),
            system_ready_us: u64_at(bytes, 24),
            wall_ready_us: u64_at(bytes, 32),
        })
    }

    pub fn to_bytes(&self) -> [u8; BEACON_LEN] {
        let mut bytes = [0u8; BEACON_LEN];
        bytes[0..4].copy_from_slice(&self.frame_duration_us.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.system_frame_us.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.wall_frame_us.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.system_ready_us.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.wall_ready_us.to_le_bytes());
        bytes
    }
}

/// Wall-clock capture time in µs since the epoch.
///
/// Without a beacon this is exactly `now + lead`. With one, it is the first
/// frame boundary `T0 + n * duration` at or after `now + lead`, plus
/// [`CAPTURE_MARGIN_US`].
pub fn aligned_capture_time(beacon: Option<&ClockSyncBeacon>, now_us: u64, lead_ms: u64) -> u64 {
    let earliest = now_us.saturating_add(lead_ms.saturating_mul(1_000));
    let Some(beacon) = beacon else {
        return earliest;
    };

    let frame = u64::from(beacon.frame_duration_us.max(1));
    let t0 = beacon.wall_frame_us;
    let frames = if earliest <= t0 {
        0
    } else {
        (earliest - t0).div_ceil(frame)
    };
    let aligned = frames
        .checked_mul(frame)
        .and_then(|offset| t0.checked_add(offset))
        .and_then(|start| start.checked_add(CAPTURE_MARGIN_US));
    match aligned {
        Some(at) => at,
        None => {
            warn!(wall_frame_us = t0, "beacon frame start out of range, capture time not aligned");
            earliest
        }
    }
}

pub async fn run_beacon_listener(
    group: Ipv4Addr,
    port: u16,
    latest: watch::Sender<Option<ClockSyncBeacon>>,
    shutdown: CancellationToken,
) -> FleetResult<()> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
    socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
    info!(%group, port, "listening for clock-sync beacons");
    receive_beacons(socket, latest, shutdown).await
}

/// Each valid packet replaces the previous beacon; invalid ones are logged
/// and dropped.
pub async fn receive_beacons(
    socket: UdpSocket,
    latest: watch::Sender<Option<ClockSyncBeacon>>,
    shutdown: CancellationToken,
) -> FleetResult<()> {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("beacon listener shutting down");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                match ClockSyncBeacon::parse(&buf[..len]) {
                    Ok(beacon) => {
                        latest.send_replace(Some(beacon));
                    }
                    Err(e) => warn!(%from, error = %e, "dropping invalid beacon"),
                }
            }
        }
    }
}
