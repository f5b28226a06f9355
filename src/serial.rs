//! Native asynchronous serial port support for [`Transport`].
//!
//! Uses the [`tokio-serial`](https://crates.io/crates/tokio-serial) crate.
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> vpw_link::Result<()> {
//! use vpw_link::{PortConfiguration, Transport, serial::SerialTransport};
//!
//! let mut transport = SerialTransport::new("/dev/ttyUSB0");
//!
//! transport.open(&PortConfiguration::new(115_200)).await?;
//! transport.send(&[0x01, 0x02]).await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, PortConfiguration, Result, Transport};
use core::{
    fmt::{Debug, Formatter},
    time::Duration,
};
use embedded_io_adapters::tokio_1::FromTokio;
use embedded_io_async::{Read, Write};
use log::{debug, trace};
use tokio::time;
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, SerialStream, StopBits,
};

/// Serial port type implementing [`Read`] and [`Write`].
pub type Port = FromTokio<SerialStream>;

/// Information about a serial port present on the system.
#[derive(Clone, Debug)]
pub struct PortInfo {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,
    /// USB vendor and product ID, if the port is a USB device.
    pub usb_id: Option<(u16, u16)>,
    /// Product name reported by the device, if any.
    pub product: Option<String>,
}

/// Lists the serial ports present on the system.
///
/// Ports are sorted by path.
pub fn available_ports() -> Result<Vec<PortInfo>> {
    let mut ports: Vec<PortInfo> = tokio_serial::available_ports()
        .map_err(|err| Error::Io(err.into()))?
        .into_iter()
        .map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                path: info.port_name,
                usb_id: Some((usb.vid, usb.pid)),
                product: usb.product,
            },
            _ => PortInfo {
                path: info.port_name,
                usb_id: None,
                product: None,
            },
        })
        .collect();

    ports.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(ports)
}

/// [`Transport`] over a native serial port.
///
/// The port is opened lazily by [`Transport::open`] and released on
/// [`Transport::close`] or when the transport is dropped.
pub struct SerialTransport {
    path: String,
    port: Option<Port>,
    timeout: Duration,
}

impl SerialTransport {
    /// Constructs a closed transport for the serial port at the given path.
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self {
            path: path.into(),
            port: None,
            timeout: crate::DEFAULT_TIMEOUT,
        }
    }

    /// Returns the serial port path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> Result<&mut Port> {
        self.port.as_mut().ok_or(Error::NotOpen)
    }
}

impl Debug for SerialTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("open", &self.port.is_some())
            .finish()
    }
}

#[async_trait::async_trait(?Send)]
impl Transport for SerialTransport {
    async fn open(&mut self, config: &PortConfiguration) -> Result<()> {
        if self.port.is_some() {
            debug!("Serial port {} already open, reopening", self.path);
            self.close();
        }

        let timeout = config.effective_timeout();
        let builder = tokio_serial::new(&self.path, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout);
        let port = SerialStream::open(&builder).map_err(|err| Error::Open(err.into()))?;

        self.port = Some(FromTokio::new(port));
        self.timeout = timeout;

        debug!(
            "Opened serial port {} at {} baud, timeout {timeout:?}",
            self.path, config.baud_rate
        );

        Ok(())
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let port = self.port()?;

        trace!("Write to port: {buf:02x?}");
        port.write_all(buf).await?;
        port.flush().await?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.timeout;
        let port = self.port()?;

        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }

        // The read timeout configured on the port does not apply to async reads
        let len = time::timeout(timeout, port.read(buf))
            .await
            .map_err(|_| Error::Timeout)??;

        if len == 0 {
            // End-of-file means the port went away
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }

        trace!("Read from port: {:02x?}", &buf[..len]);

        Ok(len)
    }

    fn discard_buffers(&mut self) -> Result<()> {
        self.port()?
            .inner()
            .clear(ClearBuffer::All)
            .map_err(|err| Error::Io(err.into()))
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port()?
            .inner_mut()
            .set_timeout(timeout)
            .map_err(|err| Error::Io(err.into()))?;
        self.timeout = timeout;

        Ok(())
    }

    fn receive_queue_size(&self) -> Result<usize> {
        let port = self.port.as_ref().ok_or(Error::NotOpen)?;
        let len = port
            .inner()
            .bytes_to_read()
            .map_err(|err| Error::Io(err.into()))?;

        Ok(len as usize)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;

    #[test]
    fn list_ports() {
        init_logger();

        let ports = available_ports().expect("port enumeration should succeed");

        assert!(
            ports.windows(2).all(|pair| pair[0].path <= pair[1].path),
            "ports should be sorted by path"
        );
    }

    #[tokio::test]
    async fn closed_transport() {
        init_logger();

        let mut transport = SerialTransport::new("/dev/ttyUSB0");

        assert!(!transport.is_open(), "transport should start closed");
        assert_eq!(transport.path(), "/dev/ttyUSB0", "path should be kept");
        assert_eq!(
            format!("{transport:?}"),
            "SerialTransport { path: \"/dev/ttyUSB0\", timeout: 1s, open: false }",
            "debug output should be correct"
        );
        assert!(
            matches!(transport.send(&[0x01]).await, Err(Error::NotOpen)),
            "send should fail before open"
        );
        assert!(
            matches!(transport.receive(&mut [0x00]).await, Err(Error::NotOpen)),
            "receive should fail before open"
        );
        assert!(
            matches!(transport.discard_buffers(), Err(Error::NotOpen)),
            "discard should fail before open"
        );
        assert!(
            matches!(transport.receive_queue_size(), Err(Error::NotOpen)),
            "queue size should fail before open"
        );

        transport.close();
    }

    #[tokio::test]
    async fn open_missing_port() {
        init_logger();

        let mut transport = SerialTransport::new("/dev/vpw-link-missing-port");
        let res = transport.open(&PortConfiguration::new(115_200)).await;

        assert!(
            matches!(res, Err(Error::Open(_))),
            "result should be open error"
        );
        assert!(!transport.is_open(), "transport should stay closed");
    }
}
