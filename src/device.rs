//! High-level device abstractions.
//!
//! A [`Device`] owns the protocol-level state shared by all kinds of
//! interface hardware: the queue of received messages, the confirmed bus
//! speed and the timeout policy. How bytes actually reach the bus is left to
//! an [`Adapter`], e.g. [`serial::SerialAdapter`] for interface boxes attached
//! through a [`Transport`](crate::Transport).
//!
//! Device operations never fail with an error. Problems reported by the
//! adapter are logged and turned into `false` or `None`, so callers can apply
//! their own retry policy or try a different device.

pub mod serial;

use crate::{Error as TransportError, Message, MessageQueue};
use core::{
    fmt::{Display, Formatter},
    time::Duration,
};
use log::{debug, error, info, warn};
use strum::{Display as StrumDisplay, EnumString};

/// A specialized [`Result`] type for [`Adapter`] operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for [`Adapter`] operations.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// The device has not been initialized.
    NotReady,
    /// The message exceeds the device's maximum send size.
    MessageTooLarge(usize),
    /// The device kind does not support the requested speed.
    SpeedNotSupported(VpwSpeed),
    /// The adapter did not reply before the timeout elapsed.
    NoReply,
    /// The adapter rejected the request.
    Rejected,
    /// The adapter did not recognize the request.
    InvalidCommand,
    /// The adapter sent data that does not fit the expected format.
    InvalidResponse,
    /// A frame ended before all announced bytes arrived.
    TruncatedFrame,
    /// Byte-level transport error.
    Transport(TransportError),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotReady => write!(f, "device not ready"),
            Self::MessageTooLarge(len) => write!(f, "message too large: {len} bytes"),
            Self::SpeedNotSupported(speed) => write!(f, "speed not supported: {speed}"),
            Self::NoReply => write!(f, "no reply from adapter"),
            Self::Rejected => write!(f, "request rejected"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::InvalidResponse => write!(f, "invalid response"),
            Self::TruncatedFrame => write!(f, "truncated frame"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

/// VPW bus speed.
#[derive(StrumDisplay, EnumString, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum VpwSpeed {
    /// Standard speed, 10.4 kbit/s.
    Standard,
    /// High speed, 41.6 kbit/s.
    FourX,
}

impl VpwSpeed {
    /// Returns the bus bit rate in bits per millisecond.
    #[must_use]
    pub const fn bits_per_millisecond(self) -> f64 {
        match self {
            Self::Standard => 10.4,
            Self::FourX => 41.6,
        }
    }
}

/// Purpose of an upcoming exchange, used to size its read timeout.
#[derive(StrumDisplay, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "title_case")]
pub enum TimeoutScenario {
    /// Reading a short property, e.g. the VIN or operating system ID.
    ReadProperty,
    /// Uploading a kernel in messages of up to the maximum send size.
    SendKernel,
    /// Reading a memory block of up to the maximum receive size.
    ReadMemoryBlock,
}

/// Fixed limits of a device kind.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Capabilities {
    /// Maximum size of a single outgoing message in bytes.
    pub max_send_size: usize,
    /// Maximum size of a single incoming message in bytes.
    pub max_receive_size: usize,
    /// Whether the 4x bus speed is available.
    pub supports_4x: bool,
}

/// Computes the read timeout for a scenario at the given bus speed.
///
/// The expected response size is derived from the scenario:
///
/// - [`TimeoutScenario::ReadProperty`]: 20 bytes.
/// - [`TimeoutScenario::ReadMemoryBlock`]: the maximum receive size plus 20 bytes,
///   scaled by 2.2 for protocol overhead and inter-byte gaps seen on real buses.
/// - [`TimeoutScenario::SendKernel`]: the maximum send size plus 20 bytes.
///
/// Each byte takes 9 bit times (8 data bits and a stop bit).
/// The transmission time gets a 10% margin and is truncated to milliseconds.
#[must_use]
pub fn vpw_timeout(scenario: TimeoutScenario, speed: VpwSpeed, caps: &Capabilities) -> Duration {
    const BITS_PER_BYTE: f64 = 9.0;
    const SHORT_PACKET_SIZE: f64 = 20.0;
    const BLOCK_OVERHEAD: f64 = 2.2;
    const MARGIN: f64 = 1.1;

    #[allow(clippy::cast_precision_loss)]
    let packet_size = match scenario {
        TimeoutScenario::ReadProperty => SHORT_PACKET_SIZE,
        TimeoutScenario::ReadMemoryBlock => {
            (SHORT_PACKET_SIZE + caps.max_receive_size as f64) * BLOCK_OVERHEAD
        }
        TimeoutScenario::SendKernel => caps.max_send_size as f64 + SHORT_PACKET_SIZE,
    };
    let millis = packet_size * BITS_PER_BYTE / speed.bits_per_millisecond();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let timeout = (millis * MARGIN) as u64;

    Duration::from_millis(timeout)
}

/// Kind-specific part of a [`Device`].
///
/// Implemented once per kind of interface hardware. The [`Device`] calls
/// these methods and keeps all state that is common to every kind.
#[async_trait::async_trait(?Send)]
pub trait Adapter {
    /// Returns the fixed limits of this device kind.
    fn capabilities(&self) -> Capabilities;

    /// Opens and validates the underlying medium.
    ///
    /// Bus messages that arrive while initializing are appended to `queue`.
    async fn initialize(&mut self, queue: &MessageQueue) -> Result<()>;

    /// Applies a read timeout to the underlying medium.
    async fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Transmits a message on the bus.
    async fn send_message(&mut self, msg: &Message) -> Result<()>;

    /// Listens once for incoming messages and appends them to `queue`.
    ///
    /// Waits at most for the current read timeout.
    /// Receiving nothing is not an error.
    async fn receive(&mut self, queue: &MessageQueue) -> Result<()>;

    /// Discards bytes received but not yet assembled into messages.
    async fn clear_message_buffer(&mut self) -> Result<()>;

    /// Performs the handshake that switches the bus to the given speed.
    ///
    /// Must only return `Ok` once the switch has been confirmed.
    /// Bus messages that arrive during the handshake are appended to `queue`.
    async fn set_vpw_speed(&mut self, speed: VpwSpeed, queue: &MessageQueue) -> Result<()>;

    /// Releases the underlying medium.
    ///
    /// Calling this more than once does nothing.
    fn close(&mut self);
}

/// Device state.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
enum State {
    Uninitialized,
    Ready,
}

/// A VPW device backed by a kind-specific [`Adapter`].
///
/// # Examples
///
/// ```no_run
/// # async fn example() {
/// use vpw_link::{
///     Message, PortConfiguration,
///     device::{Device, TimeoutScenario, serial::SerialAdapter},
///     memory::MemoryTransport,
/// };
///
/// let adapter = SerialAdapter::new(MemoryTransport::new(), PortConfiguration::new(115_200));
/// let mut dev = Device::new(adapter);
///
/// if !dev.initialize().await {
///     return;
/// }
///
/// dev.set_timeout(TimeoutScenario::ReadProperty).await;
///
/// if dev.send_message(&Message::from([0x6c, 0x10, 0xf0, 0x3c, 0x01])).await {
///     if let Some(msg) = dev.receive_message().await {
///         println!("Response: {msg}");
///     }
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct Device<A> {
    adapter: A,
    caps: Capabilities,
    queue: MessageQueue,
    speed: VpwSpeed,
    state: State,
}

impl<A: Adapter> Device<A> {
    /// Constructs an uninitialized device at standard speed.
    pub fn new(adapter: A) -> Self {
        let caps = adapter.capabilities();

        Self {
            adapter,
            caps,
            queue: MessageQueue::new(),
            speed: VpwSpeed::Standard,
            state: State::Uninitialized,
        }
    }

    /// Brings the device into the ready state.
    ///
    /// Returns `false` if the device cannot be readied,
    /// allowing the caller to try a different device.
    pub async fn initialize(&mut self) -> bool {
        match self.adapter.initialize(&self.queue).await {
            Ok(()) => {
                debug!("Device initialized: {:?}", self.caps);
                self.state = State::Ready;

                true
            }
            Err(err) => {
                warn!("Failed to initialize device: {err}");
                self.state = State::Uninitialized;

                false
            }
        }
    }

    /// Returns whether the device has been initialized.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Returns the fixed limits of the device.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Returns the last confirmed bus speed.
    #[must_use]
    pub fn speed(&self) -> VpwSpeed {
        self.speed
    }

    /// Returns the read timeout for a scenario at the current bus speed.
    #[must_use]
    pub fn vpw_timeout(&self, scenario: TimeoutScenario) -> Duration {
        vpw_timeout(scenario, self.speed, &self.caps)
    }

    /// Sizes the read timeout for an upcoming exchange.
    ///
    /// The timeout is not derived automatically per call, so this has to be
    /// called whenever the expected response size changes.
    /// Returns `false` if the timeout could not be applied.
    pub async fn set_timeout(&mut self, scenario: TimeoutScenario) -> bool {
        let timeout = self.vpw_timeout(scenario);

        debug!("Setting timeout for {scenario} at {} speed: {timeout:?}", self.speed);

        match self.adapter.set_timeout(timeout).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to set timeout: {err}");

                false
            }
        }
    }

    /// Transmits a message on the bus.
    ///
    /// Returns `false` if the message could not be sent.
    pub async fn send_message(&mut self, msg: &Message) -> bool {
        let res = if self.state == State::Uninitialized {
            Err(Error::NotReady)
        } else if msg.len() > self.caps.max_send_size {
            Err(Error::MessageTooLarge(msg.len()))
        } else {
            self.adapter.send_message(msg).await
        };

        match res {
            Ok(()) => {
                debug!("Sent message: {msg}");

                true
            }
            Err(err) => {
                warn!("Failed to send message: {err}");

                false
            }
        }
    }

    /// Returns the oldest received message.
    ///
    /// If no message is queued, listens on the bus once for up to the current
    /// read timeout. Returns `None` if nothing arrived in that window.
    pub async fn receive_message(&mut self) -> Option<Message> {
        if let Some(msg) = self.queue.dequeue() {
            return Some(msg);
        }

        if self.state == State::Uninitialized {
            warn!("Cannot receive message: {}", Error::NotReady);

            return None;
        }

        if let Err(err) = self.adapter.receive(&self.queue).await {
            debug!("Failed to receive message: {err}");
        }

        self.queue.dequeue()
    }

    /// Appends a message to the receive queue.
    ///
    /// Intended for adapters that receive messages outside of
    /// [`Device::receive_message`], e.g. from a background listener.
    pub fn enqueue(&self, msg: Message) {
        self.queue.enqueue(msg);
    }

    /// Returns a handle to the receive queue for use by another producer.
    #[must_use]
    pub fn queue(&self) -> MessageQueue {
        self.queue.clone()
    }

    /// Returns the number of messages waiting in the receive queue.
    #[must_use]
    pub fn received_message_count(&self) -> usize {
        self.queue.len()
    }

    /// Drops all queued messages and any partially received data.
    pub async fn clear_message_queue(&mut self) {
        self.queue.clear();

        if let Err(err) = self.adapter.clear_message_buffer().await {
            warn!("Failed to clear message buffer: {err}");
        }
    }

    /// Switches the bus to the given speed.
    ///
    /// Returns `true` immediately if the bus already runs at that speed.
    /// Otherwise the stored speed only changes once the adapter has confirmed
    /// the switch; on failure it keeps its previous value and `false` is returned.
    pub async fn set_vpw_speed(&mut self, speed: VpwSpeed) -> bool {
        if speed == self.speed {
            return true;
        }

        let res = if self.state == State::Uninitialized {
            Err(Error::NotReady)
        } else if speed == VpwSpeed::FourX && !self.caps.supports_4x {
            Err(Error::SpeedNotSupported(speed))
        } else {
            self.adapter.set_vpw_speed(speed, &self.queue).await
        };

        match res {
            Ok(()) => {
                info!("Switched bus speed from {} to {speed}", self.speed);
                self.speed = speed;

                true
            }
            Err(err) => {
                error!("Failed to switch bus speed to {speed}: {err}");

                false
            }
        }
    }

    /// Returns a mutable reference to the kind-specific adapter.
    pub fn adapter(&mut self) -> &mut A {
        &mut self.adapter
    }

    /// Closes the device and releases the underlying medium.
    pub fn close(mut self) {
        self.adapter.close();
    }
}

/// Device backed by a serial interface box.
pub type SerialDevice<T> = Device<serial::SerialAdapter<T>>;
