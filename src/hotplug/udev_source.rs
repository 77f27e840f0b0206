//! udev-backed hotplug source
//!
//! Enumeration and the netlink monitor both filter on the `systemd` tag, so
//! the daemon only ever sees device nodes that made it through the usual
//! rules processing. The monitor socket is not `Send`; a dedicated thread
//! owns it and pumps notifications into a tokio channel.

use super::{HotplugEvent, HotplugSource};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const UDEV_TAG: &str = "systemd";

/// How often the pump thread checks the non-blocking monitor socket and the
/// cancellation token.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Hotplug source reading from the kernel via libudev
pub struct UdevSource;

impl UdevSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UdevSource {
    fn default() -> Self {
        Self::new()
    }
}

fn properties_of(device: &udev::Device) -> HashMap<String, String> {
    device
        .properties()
        .map(|entry| {
            (
                entry.name().to_string_lossy().into_owned(),
                entry.value().to_string_lossy().into_owned(),
            )
        })
        .collect()
}

impl HotplugSource for UdevSource {
    fn enumerate(&self) -> Result<Vec<HotplugEvent>> {
        let mut enumerator =
            udev::Enumerator::new().map_err(|e| Error::Hotplug(e.to_string()))?;
        enumerator
            .match_is_initialized()
            .map_err(|e| Error::Hotplug(e.to_string()))?;
        enumerator
            .match_tag(UDEV_TAG)
            .map_err(|e| Error::Hotplug(e.to_string()))?;

        let devices = enumerator
            .scan_devices()
            .map_err(|e| Error::Hotplug(e.to_string()))?;

        Ok(devices
            .map(|device| HotplugEvent {
                action: "add".to_string(),
                devpath: device.devpath().to_string_lossy().into_owned(),
                properties: properties_of(&device),
            })
            .collect())
    }

    fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<HotplugEvent>> {
        let (tx, rx) = mpsc::channel(64);

        std::thread::Builder::new()
            .name("udev-monitor".to_string())
            .spawn(move || {
                let socket = udev::MonitorBuilder::new()
                    .and_then(|builder| builder.match_tag(UDEV_TAG))
                    .and_then(|builder| builder.listen());
                let socket = match socket {
                    Ok(socket) => socket,
                    Err(e) => {
                        error!(error = %e, "failed to open udev monitor");
                        return;
                    }
                };

                info!("listening for udev events");
                while !cancel.is_cancelled() {
                    for event in socket.iter() {
                        let notification = HotplugEvent {
                            action: event.event_type().to_string(),
                            devpath: event.devpath().to_string_lossy().into_owned(),
                            properties: properties_of(&event.device()),
                        };
                        if tx.blocking_send(notification).is_err() {
                            debug!("hotplug consumer gone, stopping monitor");
                            return;
                        }
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                info!("udev monitor stopped");
            })
            .map_err(|e| Error::Hotplug(e.to_string()))?;

        Ok(rx)
    }
}
