//! dongled
//!
//! Discovers cellular USB modems ("dongles") attached to the host, probes
//! their serial endpoints for IMEI/IMSI, and streams realtime lifecycle
//! events about the fleet over a websocket.
//!
//! ## Architecture
//!
//! 1. HotplugSource - udev enumeration + netlink notification stream
//! 2. SerialProber - modem identification over AT commands
//! 3. DongleStore - keyed index of live dongle records
//! 4. SymlinkManager - stable `/dev/<imei>.imei` / `/dev/<imsi>.imsi` aliases
//! 5. Reconciler - the device reconciliation loop
//! 6. EventHub - lifecycle event fan-out to subscribers
//! 7. WebAPI - websocket push surface
//!
//! A physical modem shows up as several `ttyUSB` endpoints; the reconciler
//! elects the lowest-tty endpoint per IMEI as the canonical one and keeps
//! the alias symlinks pointed at it, so downstream software can address a
//! modem by identity instead of by the volatile kernel device node.

pub mod error;
pub mod event_hub;
pub mod hotplug;
pub mod models;
pub mod probe;
pub mod reconciler;
pub mod state;
pub mod store;
pub mod symlink;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
