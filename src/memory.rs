//! In-process [`Transport`] without any hardware behind it.
//!
//! The far end of the channel is driven through a [`MemoryBus`] handle:
//! incoming bytes are injected, scripted replies are delivered after the
//! next send and written bytes can be inspected. This makes it possible to
//! exercise device kinds and upper layers without an interface box.

use crate::{Error, PortConfiguration, Result, Transport};
use core::time::Duration;
use log::{debug, trace};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{sync::Notify, time};

#[derive(Default, Debug)]
struct BusState {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
    replies: VecDeque<Vec<u8>>,
    discards: usize,
    unavailable: bool,
}

/// Handle to the far end of a [`MemoryTransport`].
///
/// Cloning the handle yields another reference to the same channel.
#[derive(Clone, Default, Debug)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl MemoryBus {
    /// Makes bytes available to the transport's receive side.
    pub fn inject(&self, data: &[u8]) {
        self.lock().incoming.extend(data);
        self.notify.notify_one();
    }

    /// Schedules bytes to be injected right after the transport's next send.
    ///
    /// Replies are delivered in the order they were scheduled, one per send.
    pub fn queue_reply(&self, data: &[u8]) {
        self.lock().replies.push_back(data.to_vec());
    }

    /// Takes all bytes the transport has sent so far.
    #[must_use]
    pub fn take_sent(&self) -> Vec<u8> {
        core::mem::take(&mut self.lock().outgoing)
    }

    /// Returns the number of injected bytes not yet received.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().incoming.len()
    }

    /// Returns how often the transport discarded its buffers.
    #[must_use]
    pub fn discards(&self) -> usize {
        self.lock().discards
    }

    /// Makes subsequent opens fail as if the medium were missing.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`Transport`] backed by in-memory buffers.
#[derive(Debug)]
pub struct MemoryTransport {
    bus: MemoryBus,
    open: bool,
    timeout: Duration,
}

impl MemoryTransport {
    /// Constructs a closed transport with a fresh [`MemoryBus`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            bus: MemoryBus::default(),
            open: false,
            timeout: crate::DEFAULT_TIMEOUT,
        }
    }

    /// Returns a handle to the far end of the channel.
    #[must_use]
    pub fn bus(&self) -> MemoryBus {
        self.bus.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait(?Send)]
impl Transport for MemoryTransport {
    async fn open(&mut self, config: &PortConfiguration) -> Result<()> {
        if self.open {
            debug!("Memory transport already open, reopening");
            self.close();
        }

        if self.bus.lock().unavailable {
            return Err(Error::Open(std::io::ErrorKind::NotFound.into()));
        }

        self.timeout = config.effective_timeout();
        self.open = true;

        debug!(
            "Opened memory transport at {} baud, timeout {:?}",
            config.baud_rate, self.timeout
        );

        Ok(())
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        trace!("Write to memory bus: {buf:02x?}");

        let mut state = self.bus.lock();

        state.outgoing.extend_from_slice(buf);

        if let Some(reply) = state.replies.pop_front() {
            state.incoming.extend(reply);
            drop(state);
            self.bus.notify.notify_one();
        }

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;

        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let bus = &self.bus;
        let wait = async {
            loop {
                {
                    let mut state = bus.lock();

                    if !state.incoming.is_empty() {
                        let len = buf.len().min(state.incoming.len());

                        for (dst, src) in buf.iter_mut().zip(state.incoming.drain(..len)) {
                            *dst = src;
                        }

                        return len;
                    }
                }

                bus.notify.notified().await;
            }
        };

        let len = time::timeout(self.timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?;

        trace!("Read from memory bus: {:02x?}", &buf[..len]);

        Ok(len)
    }

    fn discard_buffers(&mut self) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.bus.lock();

        state.incoming.clear();
        state.discards += 1;

        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        self.timeout = timeout;

        Ok(())
    }

    fn receive_queue_size(&self) -> Result<usize> {
        self.ensure_open()?;

        Ok(self.bus.pending())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            debug!("Closed memory transport");
        }

        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;

    fn config(timeout_ms: u64) -> PortConfiguration {
        PortConfiguration::new(115_200).with_timeout(Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn open_with_zero_timeout_uses_default() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();

        transport.open(&PortConfiguration::new(115_200)).await?;

        assert!(transport.is_open(), "transport should be open");
        assert_eq!(
            transport.timeout(),
            Duration::from_millis(1000),
            "timeout should default to 1000 ms"
        );

        Ok(())
    }

    #[tokio::test]
    async fn reopen_applies_new_configuration() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();

        transport.open(&config(50)).await?;
        transport.open(&config(80)).await?;

        assert!(transport.is_open(), "transport should be open");
        assert_eq!(
            transport.timeout(),
            Duration::from_millis(80),
            "timeout should come from the latest configuration"
        );

        Ok(())
    }

    #[tokio::test]
    async fn open_unavailable_medium() {
        init_logger();

        let mut transport = MemoryTransport::new();

        transport.bus().set_unavailable(true);

        let res = transport.open(&config(50)).await;

        assert!(
            matches!(res, Err(Error::Open(_))),
            "result should be open error"
        );
        assert!(!transport.is_open(), "transport should stay closed");
    }

    #[tokio::test]
    async fn send_and_receive() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();
        let bus = transport.bus();

        transport.open(&config(50)).await?;
        transport.send(&[0x01, 0x02, 0x03]).await?;
        bus.inject(&[0xaa, 0xbb, 0xcc]);

        assert_eq!(bus.take_sent(), [0x01, 0x02, 0x03], "sent bytes should be correct");
        assert_eq!(transport.receive_queue_size()?, 3, "queue size should be correct");

        let mut buf = [0x00; 8];
        let len = transport.receive(&mut buf[2..4]).await?;

        assert_eq!(len, 2, "received length should be limited by the buffer");
        assert_eq!(buf[2..4], [0xaa, 0xbb], "received bytes should be correct");
        assert_eq!(transport.receive_queue_size()?, 1, "one byte should be left");

        Ok(())
    }

    #[tokio::test]
    async fn receive_times_out() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();

        transport.open(&config(10)).await?;

        let res = transport.receive(&mut [0x00; 4]).await;

        assert!(
            matches!(res, Err(Error::Timeout)),
            "result should be timeout error"
        );

        Ok(())
    }

    #[tokio::test]
    async fn receive_wakes_on_late_bytes() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();
        let bus = transport.bus();

        transport.open(&config(1000)).await?;

        let injector = tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            bus.inject(&[0x42]);
        });

        let mut buf = [0x00; 4];
        let len = transport.receive(&mut buf).await?;

        assert_eq!(len, 1, "one byte should be received");
        assert_eq!(buf[0], 0x42, "received byte should be correct");

        injector.await.expect("injector task should not panic");

        Ok(())
    }

    #[tokio::test]
    async fn scripted_reply_follows_send() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();
        let bus = transport.bus();

        transport.open(&config(50)).await?;
        bus.queue_reply(&[0x10, 0x20]);

        assert_eq!(bus.pending(), 0, "reply should not be visible before send");

        transport.send(&[0x01]).await?;

        assert_eq!(bus.pending(), 2, "reply should be visible after send");

        Ok(())
    }

    #[tokio::test]
    async fn discard_drops_pending_bytes() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();
        let bus = transport.bus();

        transport.open(&config(10)).await?;
        bus.inject(&[0x01, 0x02]);
        transport.discard_buffers()?;

        assert_eq!(bus.pending(), 0, "pending bytes should be dropped");
        assert_eq!(bus.discards(), 1, "discard should be counted");
        assert!(
            matches!(transport.receive(&mut [0x00]).await, Err(Error::Timeout)),
            "nothing should be received after discard"
        );

        Ok(())
    }

    #[tokio::test]
    async fn set_timeout_takes_effect() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();

        transport.open(&config(1000)).await?;
        transport.set_timeout(Duration::from_millis(5))?;

        assert_eq!(
            transport.timeout(),
            Duration::from_millis(5),
            "timeout should be updated"
        );
        assert!(
            matches!(transport.receive(&mut [0x00]).await, Err(Error::Timeout)),
            "receive should time out with the new timeout"
        );

        Ok(())
    }

    #[tokio::test]
    async fn close_is_idempotent() -> Result<()> {
        init_logger();

        let mut transport = MemoryTransport::new();

        transport.open(&config(10)).await?;
        transport.close();
        transport.close();

        assert!(!transport.is_open(), "transport should be closed");
        assert!(
            matches!(transport.send(&[0x01]).await, Err(Error::NotOpen)),
            "send should fail after close"
        );
        assert!(
            matches!(transport.receive(&mut [0x00]).await, Err(Error::NotOpen)),
            "receive should fail after close"
        );
        assert!(
            matches!(transport.discard_buffers(), Err(Error::NotOpen)),
            "discard should fail after close"
        );
        assert!(
            matches!(transport.receive_queue_size(), Err(Error::NotOpen)),
            "queue size should fail after close"
        );
        assert!(
            matches!(
                transport.set_timeout(Duration::from_millis(5)),
                Err(Error::NotOpen)
            ),
            "set timeout should fail after close"
        );

        Ok(())
    }
}
