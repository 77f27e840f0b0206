//! Hotplug source and endpoint classification
//!
//! ## Responsibilities
//!
//! - The [`HotplugSource`] contract: one-shot enumeration of present
//!   devices plus a cancellable stream of add/remove notifications
//! - Classifying kernel device paths: only `ttyUSB<N>` nodes are candidate
//!   modem endpoints
//!
//! The production source is udev ([`UdevSource`]); tests drive the
//! reconciler with scripted sources.

mod udev_source;

pub use udev_source::UdevSource;

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Basename prefix of candidate serial endpoints
pub const TTY_PREFIX: &str = "ttyUSB";

/// One kernel device notification
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    /// Kernel action; only "add" and "remove" are of interest
    pub action: String,
    /// sysfs device path; the basename names the device node
    pub devpath: String,
    /// udev property dump, carried through to the dongle record
    pub properties: HashMap<String, String>,
}

/// Provider of device notifications.
///
/// `enumerate` answers what is attached right now; `subscribe` yields the
/// ongoing stream until the token cancels, at which point the channel
/// closes and the consumer drains naturally.
pub trait HotplugSource: Send + Sync + 'static {
    fn enumerate(&self) -> Result<Vec<HotplugEvent>>;
    fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<HotplugEvent>>;
}

/// Device node for a sysfs path: the basename joined under the dev dir
pub fn device_node(dev_dir: &Path, devpath: &str) -> PathBuf {
    let base = Path::new(devpath)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dev_dir.join(base)
}

/// Whether the node names a candidate serial endpoint
pub fn is_usb_serial(node: &Path) -> bool {
    node.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(TTY_PREFIX))
}

/// The numeric suffix of a `ttyUSB<N>` node, used as the tie-breaker
pub fn tty_number(node: &Path) -> Result<i64> {
    let name = node
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::MalformedPath(node.display().to_string()))?;
    name.strip_prefix(TTY_PREFIX)
        .and_then(|suffix| suffix.parse().ok())
        .ok_or_else(|| Error::MalformedPath(node.display().to_string()))
}
