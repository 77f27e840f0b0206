//! Shared models and types for dongled
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// One serial endpoint of a physical cellular modem.
///
/// Combines what udev reports about the device node with what the modem
/// itself answers over its serial port. `path` is the unique storage key;
/// `imei` is the logical key shared by every endpoint of one physical modem.
#[derive(Debug, Clone, Serialize)]
pub struct Dongle {
    pub imei: String,
    /// Empty when no SIM is present
    pub imsi: String,
    pub path: String,
    /// True once both `/dev` aliases point at this record's path
    #[serde(rename = "symlink")]
    pub is_symlinked: bool,
    /// Numeric suffix of the ttyUSB path, used as the tie-breaker
    #[serde(skip)]
    pub tty: i64,
    /// udev property dump, carried through without interpretation
    pub properties: HashMap<String, String>,
    #[serde(skip)]
    pub created_on: DateTime<Utc>,
    #[serde(skip)]
    pub updated_on: DateTime<Utc>,
}

impl Dongle {
    /// Create a new record; timestamps are placeholders until the store
    /// persists it.
    pub fn new(
        imei: impl Into<String>,
        imsi: impl Into<String>,
        path: impl Into<String>,
        tty: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            imei: imei.into(),
            imsi: imsi.into(),
            path: path.into(),
            is_symlinked: false,
            tty,
            properties: HashMap::new(),
            created_on: now,
            updated_on: now,
        }
    }
}

/// Lifecycle event name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventName {
    Add,
    Remove,
    Update,
}

/// Outbound lifecycle event. Carries a point-in-time snapshot of the
/// record; subscribers never see a live reference.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: EventName,
    pub data: Dongle,
}

impl Event {
    pub fn add(data: Dongle) -> Self {
        Self {
            name: EventName::Add,
            data,
        }
    }

    pub fn remove(data: Dongle) -> Self {
        Self {
            name: EventName::Remove,
            data,
        }
    }

    pub fn update(data: Dongle) -> Self {
        Self {
            name: EventName::Update,
            data,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub db_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let mut d = Dongle::new("111", "222", "/dev/ttyUSB0", 0);
        d.properties.insert("ID_VENDOR".into(), "huawei".into());
        d.is_symlinked = true;

        let json = serde_json::to_value(Event::add(d)).unwrap();
        assert_eq!(json["name"], "add");
        assert_eq!(json["data"]["imei"], "111");
        assert_eq!(json["data"]["imsi"], "222");
        assert_eq!(json["data"]["path"], "/dev/ttyUSB0");
        assert_eq!(json["data"]["symlink"], true);
        assert_eq!(json["data"]["properties"]["ID_VENDOR"], "huawei");
        // tty and timestamps are internal
        assert!(json["data"].get("tty").is_none());
        assert!(json["data"].get("created_on").is_none());
    }
}
