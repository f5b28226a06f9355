//! Device support for serial VPW interface boxes.
//!
//! The interface box sits between a [`Transport`] and the vehicle bus.
//! Host and box exchange frames of the following form:
//!
//! | Offset | Size | Content                          |
//! |--------|------|----------------------------------|
//! | 0      | 1    | Frame kind                       |
//! | 1      | 2    | Body length (big-endian)         |
//! | 3      | n    | Body                             |
//!
//! Bus message frames carry one complete VPW message each.
//! Command frames carry a command code and a parameter byte,
//! and the box answers every command with a reply frame
//! holding the command code and a response code.

use crate::{
    Error as TransportError, Message, MessageQueue, PortConfiguration, Transport,
    device::{Adapter, Capabilities, Error, Result, VpwSpeed},
};
use core::time::Duration;
use log::{debug, trace, warn};
use strum::FromRepr;
use tokio::time::{self, Instant};

/// Frames the box may send while the host waits for a reply.
const MAX_FRAMES_BEFORE_REPLY: usize = 16;

/// Frame kind, the first byte of every frame.
#[derive(FromRepr, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
enum FrameKind {
    Message = 0x4d,
    Command = 0x43,
    Reply = 0x52,
}

/// Command code understood by the interface box.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
enum Command {
    Identify = 0x01,
    SetSpeed = 0x02,
}

/// Response code of a reply frame.
#[derive(FromRepr, Debug)]
#[repr(u8)]
enum ResponseCode {
    Success,
    Rejected,
    InvalidCommand,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    body: Vec<u8>,
}

fn frame_header(kind: u8, len: u16) -> [u8; 3] {
    let len = len.to_be_bytes();

    [kind, len[0], len[1]]
}

/// [`Adapter`] for interface boxes attached through a [`Transport`].
///
/// # Examples
///
/// ```no_run
/// # async fn example() {
/// use vpw_link::{PortConfiguration, device::{SerialDevice, serial::SerialAdapter}, memory::MemoryTransport};
///
/// let adapter = SerialAdapter::new(MemoryTransport::new(), PortConfiguration::new(115_200));
/// let mut dev = SerialDevice::new(adapter);
///
/// println!("Device ready: {}", dev.initialize().await);
/// # }
/// ```
#[derive(Debug)]
pub struct SerialAdapter<T> {
    transport: T,
    config: PortConfiguration,
    caps: Capabilities,
}

impl<T: Transport> SerialAdapter<T> {
    /// Limits of a typical interface box: 4 KiB memory blocks plus
    /// room for the message header and checksum, 4x speed supported.
    pub const DEFAULT_CAPABILITIES: Capabilities = Capabilities {
        max_send_size: 4096 + 16,
        max_receive_size: 4096 + 16,
        supports_4x: true,
    };

    /// Constructs an adapter that opens `transport` with `config` on initialization.
    pub fn new(transport: T, config: PortConfiguration) -> Self {
        Self {
            transport,
            config,
            caps: Self::DEFAULT_CAPABILITIES,
        }
    }

    /// Replaces the default capabilities, e.g. for boxes without 4x support.
    #[must_use]
    pub fn with_capabilities(self, caps: Capabilities) -> Self {
        Self { caps, ..self }
    }

    /// Returns a mutable reference to the underlying transport.
    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sends a command and waits for the box to confirm it.
    async fn command(&mut self, cmd: Command, param: u8, queue: &MessageQueue) -> Result<()> {
        debug!("Sending command {cmd:?} with parameter {param:#04x}");

        self.send_frame(FrameKind::Command, &[cmd as u8, param])
            .await?;

        // Bus traffic may arrive ahead of the reply
        for _ in 0..MAX_FRAMES_BEFORE_REPLY {
            let frame = self.read_frame_or_resync().await?.ok_or(Error::NoReply)?;

            match frame.kind {
                FrameKind::Message => queue.enqueue(frame.body.into()),
                FrameKind::Reply => return Self::check_reply(cmd, &frame.body),
                FrameKind::Command => return Err(Error::InvalidResponse),
            }
        }

        Err(Error::NoReply)
    }

    fn check_reply(cmd: Command, body: &[u8]) -> Result<()> {
        match body {
            [code, resp] if *code == cmd as u8 => match ResponseCode::from_repr(*resp) {
                Some(ResponseCode::Success) => Ok(()),
                Some(ResponseCode::Rejected) => Err(Error::Rejected),
                Some(ResponseCode::InvalidCommand) => Err(Error::InvalidCommand),
                None => Err(Error::InvalidResponse),
            },
            _ => Err(Error::InvalidResponse),
        }
    }

    async fn send_frame(&mut self, kind: FrameKind, body: &[u8]) -> Result<()> {
        let len = u16::try_from(body.len()).map_err(|_| Error::MessageTooLarge(body.len()))?;
        let mut buf = Vec::with_capacity(body.len() + 3);

        buf.extend_from_slice(&frame_header(kind as u8, len));
        buf.extend_from_slice(body);

        trace!("Sending {kind:?} frame: {buf:02x?}");

        Ok(self.transport.send(&buf).await?)
    }

    /// Reads one frame, discarding buffered bytes if it turns out to be malformed.
    ///
    /// Returns `None` if no frame started before the timeout elapsed.
    async fn read_frame_or_resync(&mut self) -> Result<Option<Frame>> {
        let res = self.read_frame().await;

        if let Err(err) = &res {
            warn!("Dropping malformed frame: {err}");

            // Stale bytes of the broken frame must not start the next one
            if let Err(err) = self.transport.discard_buffers() {
                warn!("Failed to discard buffers: {err}");
            }
        }

        res
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut header = [0x00; 3];

        match self.transport.receive(&mut header[..1]).await {
            Ok(_) => {}
            Err(TransportError::Timeout) => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        // The rest of the frame shares a single timeout budget
        let deadline = Instant::now() + self.transport.timeout();

        self.read_exact(&mut header[1..], deadline).await?;

        let kind = FrameKind::from_repr(header[0]).ok_or(Error::InvalidResponse)?;
        let len = usize::from(u16::from_be_bytes([header[1], header[2]]));

        if len > self.caps.max_receive_size {
            return Err(Error::MessageTooLarge(len));
        }

        let mut body = vec![0x00; len];

        self.read_exact(&mut body, deadline).await?;
        trace!("Received {kind:?} frame: {body:02x?}");

        Ok(Some(Frame { kind, body }))
    }

    /// Fills `buf` completely before `deadline`, treating a timeout as a truncated frame.
    async fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> Result<()> {
        let transport = &mut self.transport;
        let fill = async {
            let mut pos = 0;

            while pos < buf.len() {
                pos += transport.receive(&mut buf[pos..]).await?;
            }

            Ok::<_, TransportError>(())
        };

        match time::timeout_at(deadline, fill).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(TransportError::Timeout)) | Err(_) => Err(Error::TruncatedFrame),
            Ok(Err(err)) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait(?Send)]
impl<T: Transport> Adapter for SerialAdapter<T> {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn initialize(&mut self, queue: &MessageQueue) -> Result<()> {
        self.transport.open(&self.config).await?;

        let res = match self.transport.discard_buffers() {
            Ok(()) => self.command(Command::Identify, 0x00, queue).await,
            Err(err) => Err(err.into()),
        };

        if res.is_err() {
            // Leave the port free for the next device candidate
            self.transport.close();
        }

        res
    }

    async fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok(self.transport.set_timeout(timeout)?)
    }

    async fn send_message(&mut self, msg: &Message) -> Result<()> {
        self.send_frame(FrameKind::Message, msg.as_bytes()).await
    }

    async fn receive(&mut self, queue: &MessageQueue) -> Result<()> {
        match self.read_frame_or_resync().await? {
            Some(Frame {
                kind: FrameKind::Message,
                body,
            }) => {
                queue.enqueue(body.into());

                Ok(())
            }
            Some(frame) => {
                warn!("Ignoring unexpected {:?} frame", frame.kind);

                Err(Error::InvalidResponse)
            }
            None => Ok(()),
        }
    }

    async fn clear_message_buffer(&mut self) -> Result<()> {
        Ok(self.transport.discard_buffers()?)
    }

    async fn set_vpw_speed(&mut self, speed: VpwSpeed, queue: &MessageQueue) -> Result<()> {
        self.command(Command::SetSpeed, speed as u8, queue).await
    }

    fn close(&mut self) {
        self.transport.close();
    }
}
