//! Serial probe - modem identification over AT commands
//!
//! ## Responsibilities
//!
//! - Open a candidate ttyUSB endpoint at 9600 8N1
//! - Run `ATI` (IMEI + device banner) and `AT+CIMI` (IMSI) with a bounded
//!   retry budget
//! - Reduce raw replies to identifiers via [`parser`]
//!
//! Each attempt walks open -> flush -> write -> read -> validate, and the
//! port closes on every exit path when the handle drops. Probing is
//! blocking; the reconciler runs it on the blocking thread pool.

pub mod parser;

use crate::error::ProbeError;
use serialport::{ClearBuffer, DataBits, Parity, StopBits};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maximum number of attempts to read the IMEI or IMSI out of an endpoint
pub const MAX_ATTEMPTS: u32 = 3;

/// Fixed serial parameters for the probe
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub baud: u32,
    /// Per-read timeout; a read that returns nothing within it ends the reply
    pub read_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            baud: 9600,
            read_timeout: Duration::from_secs(5),
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

/// What a successful probe learned about the modem
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub imei: String,
    /// Empty when the SIM is absent
    pub imsi: String,
    /// Raw ATI banner, kept for logging
    pub ati: String,
}

/// Identifies the modem behind a serial endpoint.
///
/// The trait is the seam that lets the reconciliation loop run against
/// scripted modems in tests.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, path: &str) -> Result<ProbeReport, ProbeError>;
}

/// Production prober talking to the real serial port
pub struct SerialProber {
    config: ProbeConfig,
}

impl SerialProber {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// One command round-trip on a freshly opened port
    fn run_command(&self, path: &str, cmd: &str) -> Result<Vec<u8>, ProbeError> {
        let mut port = serialport::new(path, self.config.baud)
            .timeout(self.config.read_timeout)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .open()?;

        port.clear(ClearBuffer::All)
            .map_err(|e| ProbeError::Io(e.into()))?;

        port.write_all(format!("{cmd}\r\n").as_bytes())
            .map_err(ProbeError::Io)?;

        // Accumulate until the peer stops sending within the read timeout
        let mut reply = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match port.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => reply.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(ProbeError::Io(e)),
            }
        }

        if reply.is_empty() {
            return Err(ProbeError::Timeout);
        }
        if !reply.windows(2).any(|w| w == b"OK") {
            return Err(ProbeError::BadReply(reply));
        }
        Ok(reply)
    }

    fn query_imei(&self, path: &str) -> Result<(String, String), ProbeError> {
        let raw = self.run_command(path, "ATI")?;
        let ati = String::from_utf8_lossy(&raw).into_owned();
        let imei = parser::parse_imei(&ati).ok_or(ProbeError::ParseImei)?;
        Ok((imei, ati))
    }

    fn query_imsi(&self, path: &str) -> Result<String, ProbeError> {
        let raw = self.run_command(path, "AT+CIMI")?;
        parser::parse_imsi(&raw).ok_or(ProbeError::ParseImsi)
    }
}

impl Prober for SerialProber {
    fn probe(&self, path: &str) -> Result<ProbeReport, ProbeError> {
        let started = Instant::now();

        // A missing IMSI just means no SIM; only IMEI failure is fatal.
        let imsi = match with_attempts(self.config.max_attempts, "IMSI", || {
            self.query_imsi(path)
        }) {
            Ok(imsi) => imsi,
            Err(e) => {
                warn!(path = %path, error = %e, "no IMSI, continuing without SIM");
                String::new()
            }
        };

        let (imei, ati) = with_attempts(self.config.max_attempts, "IMEI", || {
            self.query_imei(path)
        })?;

        info!(
            path = %path,
            imei = %imei,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "modem identified"
        );
        Ok(ProbeReport { imei, imsi, ati })
    }
}

/// Run `op` up to `max_attempts` times, returning the first success or the
/// last failure.
fn with_attempts<T>(
    max_attempts: u32,
    label: &str,
    mut op: impl FnMut() -> Result<T, ProbeError>,
) -> Result<T, ProbeError> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                debug!(attempt, label, error = %e, "probe attempt failed, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
