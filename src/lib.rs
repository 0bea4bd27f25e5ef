//! Dispatch engine for a rig of networked cameras.
//!
//! Coordinators fan commands out to the fleet over a publish/subscribe
//! transport, correlate the replies and keep per-device state that a UI or
//! CLI can read at any time.

pub mod beacon;
pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fleet;
pub mod messages;
pub mod net;
pub mod ota;
pub mod picture_send;
pub mod picture_set;
pub mod ping;
pub mod registry;
pub mod router;
pub mod simulate;
pub mod storage;
pub mod time_sync;
pub mod types;

pub use error::{FleetError, FleetResult};
pub use fleet::{Fleet, FleetContext};
pub use types::DeviceId;
