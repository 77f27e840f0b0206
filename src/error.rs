//! Error handling for dongled

use std::path::PathBuf;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device path without a parseable ttyUSB suffix
    #[error("malformed device path: {0}")]
    MalformedPath(String),

    /// A record for this device path already exists
    #[error("duplicate path: {0}")]
    DuplicatePath(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Serial probe error
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Symlink error
    #[error("symlink error: {0}")]
    Symlink(#[from] SymlinkError),

    /// Hotplug subsystem error
    #[error("hotplug error: {0}")]
    Hotplug(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures while interrogating a serial endpoint.
///
/// `ParseImsi` is non-fatal to a probe (a dongle without a SIM has no IMSI);
/// everything else aborts the current add.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The OS refused to open the serial port
    #[error("failed to open serial port: {0}")]
    PortOpen(#[from] serialport::Error),

    /// Read/write failure on an open port
    #[error("serial I/O: {0}")]
    Io(std::io::Error),

    /// The endpoint sent nothing within the read timeout
    #[error("no reply within the read timeout")]
    Timeout,

    /// The endpoint replied, but without the OK terminator
    #[error("reply without OK: {}", String::from_utf8_lossy(.0))]
    BadReply(Vec<u8>),

    /// No IMEI between `IMEI:` and `+GCAP` in the ATI reply
    #[error("IMEI not found in ATI reply")]
    ParseImei,

    /// AT+CIMI reply did not reduce to decimal digits
    #[error("IMSI not found in reply")]
    ParseImsi,
}

/// Failures while maintaining the `/dev` alias pair.
///
/// A failure on the second alias rolls back the first, so the pair is
/// all-or-nothing post-call.
#[derive(Debug, thiserror::Error)]
pub enum SymlinkError {
    #[error("unlink {path}: {source}")]
    Unlink {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("symlink {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
}
