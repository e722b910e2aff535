//! Acquisition of environmental sensors over serial text links and
//! Modbus RTU, with piecewise-linear calibration and a tag-keyed
//! snapshot of the latest readings.
//!
//! Data flows one way: a [`DeviceChannel`] owns the physical link, a
//! [`reader::SensorReader`] decodes and calibrates what it delivers, and
//! the [`supervisor::AcquisitionSupervisor`] keeps the latest reading of
//! every tag for the sinks.

/// The I/O-free enclave
pub mod core;

pub use self::core::*;

pub mod config;
pub mod error;
pub mod reader;
pub mod sink;
pub mod supervisor;

#[cfg(feature = "serial-text")]
pub mod serial;

#[cfg(feature = "modbus-rtu")]
pub mod modbus;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use self::error::{BusError, Error};

use self::core::modbus::RegisterRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type Result<T> = std::result::Result<T, Error>;

/// A single physical link, exclusively owned by one sensor reader.
#[async_trait]
pub trait DeviceChannel: Send {
    /// Human readable name of the link, usually the port.
    fn name(&self) -> &str;

    fn state(&self) -> DeviceConnectionState;

    /// When the link last failed mid-read.
    fn last_fault(&self) -> Option<DateTime<Utc>>;

    /// Release the handle. The state returns to `Disconnected`.
    async fn close(&mut self);
}

/// A serial link that delivers ASCII measurements line by line.
#[async_trait]
pub trait LineChannel: DeviceChannel {
    /// Open the link. On failure the state stays `Disconnected` and the
    /// caller may try again later.
    async fn open(&mut self) -> Result<()>;

    /// Wait up to the read timeout for a complete line. When several
    /// lines queued up since the last poll only the newest is returned.
    ///
    /// Returns `None` if no full line arrived in time. A low-level I/O
    /// error also yields `None` but leaves the channel `Faulted`; the
    /// caller closes and reopens it.
    async fn poll_line(&mut self) -> Option<String>;
}

/// A request/response link to addressed devices on a field bus.
#[async_trait]
pub trait RegisterChannel: DeviceChannel {
    /// Read a block of registers.
    ///
    /// The link is opened for the exchange and closed again afterwards,
    /// so a half-duplex bus is never held open between polls.
    async fn read_registers(&mut self, request: RegisterRequest) -> Result<Vec<u16>>;
}
