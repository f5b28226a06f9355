//! Talk to automotive ECUs over a VPW (Variable Pulse Width) bus.
//!
//! # Overview
//!
//! The `vpw-link` crate implements the transport and device layer used by
//! reflashing and diagnostic tools for VPW-based engine control modules.
//! It offers an asynchronous API that hides how bytes reach the bus:
//!
//! - Use the [`device`] module to send and receive bus [`Message`]s,
//!   size read timeouts for an upcoming exchange and negotiate the bus speed.
//! - Plug in a device kind (e.g. [`device::serial::SerialAdapter`]) that knows
//!   how a particular interface box frames bytes.
//! - Work directly with a byte-level [`Transport`] when writing a new device kind.
//!
//! # Getting started
//!
//! Serial interface boxes are opened with the following line settings:
//!
//! - **Data bits:** 8
//! - **Parity:** None
//! - **Stop bits:** 1
//!
//! If you enable the `native-serial` feature, a compatible transport can be
//! obtained using [`serial::SerialTransport::new`]. The example below uses the
//! in-process [`memory::MemoryTransport`] in its place:
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use vpw_link::{
//!     PortConfiguration,
//!     device::{Device, TimeoutScenario, VpwSpeed, serial::SerialAdapter},
//!     memory::MemoryTransport,
//! };
//!
//! let transport = MemoryTransport::new();
//! let adapter = SerialAdapter::new(transport, PortConfiguration::new(115_200));
//! let mut dev = Device::new(adapter);
//!
//! if dev.initialize().await {
//!     dev.set_timeout(TimeoutScenario::ReadProperty).await;
//!     dev.set_vpw_speed(VpwSpeed::FourX).await;
//!
//!     while let Some(msg) = dev.receive_message().await {
//!         println!("{msg}");
//!     }
//! }
//! # }
//! ```
//!
//! # Bus timing
//!
//! VPW runs at 10.4 kbit/s in standard mode and at 41.6 kbit/s in 4x mode.
//! Read timeouts are derived from the expected response size and the current
//! speed, see [`device::vpw_timeout`]. They are not recomputed automatically:
//! callers set the timeout scenario before each exchange whose response size
//! differs from the previous one.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod device;
pub mod memory;
pub mod message;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

pub use message::{Message, MessageQueue};

use core::{
    fmt::{Display, Formatter},
    time::Duration,
};

/// Receive timeout applied when a [`PortConfiguration`] leaves it at zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// A specialized [`Result`] type for [`Transport`] operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for [`Transport`] operations.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// The medium could not be opened (missing, inaccessible or in use).
    Open(std::io::Error),
    /// The transport is not open.
    NotOpen,
    /// No data arrived before the receive timeout elapsed.
    Timeout,
    /// The provided argument is invalid.
    InvalidArgument,
    /// A medium-specific input/output error.
    Io(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Open(err) => write!(f, "failed to open transport: {err}"),
            Self::NotOpen => write!(f, "transport not open"),
            Self::Timeout => write!(f, "receive timed out"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(err) | Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(err),
        }
    }
}

/// Settings used to open a [`Transport`].
///
/// Medium-specific settings, such as the device path of a serial port,
/// are passed to the transport's constructor instead.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct PortConfiguration {
    /// Line bit rate.
    pub baud_rate: u32,
    /// Receive timeout, zero selects [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
}

impl PortConfiguration {
    /// Constructs a configuration with the default receive timeout.
    #[must_use]
    pub const fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            timeout: Duration::ZERO,
        }
    }

    /// Returns a copy of the configuration using the given receive timeout.
    #[must_use]
    pub const fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Returns the receive timeout the transport actually applies.
    #[must_use]
    pub const fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// Byte-level, half-duplex communication channel.
///
/// Implementations know nothing about VPW messages; they only move bytes.
/// Device kinds in the [`device`] module build message framing on top.
///
/// A receive that sees no byte before the timeout elapses always fails with
/// [`Error::Timeout`] rather than returning zero bytes.
/// Once [`Transport::close`] has been called, all other operations fail with
/// [`Error::NotOpen`] until the transport is opened again.
#[async_trait::async_trait(?Send)]
pub trait Transport {
    /// Opens the medium with 8N1 framing at the configured bit rate.
    ///
    /// An already open medium is closed first.
    /// Afterwards [`Transport::timeout`] reports the effective receive timeout.
    async fn open(&mut self, config: &PortConfiguration) -> Result<()>;

    /// Writes all bytes of `buf` and flushes them out to the medium.
    async fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Waits for at least one byte and copies up to `buf.len()` bytes into `buf`.
    ///
    /// Returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if nothing arrives before the receive timeout elapses.
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drops all bytes buffered for input and output.
    fn discard_buffers(&mut self) -> Result<()>;

    /// Changes the receive timeout used by subsequent receives.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Returns the number of bytes that can be received without waiting.
    ///
    /// The value is a snapshot and may be stale if bytes keep arriving.
    fn receive_queue_size(&self) -> Result<usize>;

    /// Returns the current receive timeout.
    fn timeout(&self) -> Duration;

    /// Returns whether the medium is open.
    fn is_open(&self) -> bool;

    /// Closes the medium and releases its handle.
    ///
    /// Calling this on a closed transport does nothing.
    fn close(&mut self);
}
