//! Byte channels to a device in EDL mode
//!
//! Every protocol in this crate talks to the device through the [Channel]
//! trait, a duplex byte pipe. [SerialChannel] implements it on top of the
//! QDLoader serial port.

#[cfg(feature = "serialport")]
use std::io::{ErrorKind, Read, Write};
#[cfg(feature = "serialport")]
use std::time::Duration;

#[cfg(feature = "serialport")]
use log::debug;
#[cfg(feature = "serialport")]
use serialport::{FlowControl, SerialPort};

#[cfg(feature = "serialport")]
use crate::error::ConnectionError;
use crate::error::Error;

#[cfg(test)]
pub(crate) mod mock;

/// Consecutive empty reads after which a blocking read gives up
pub(crate) const MAX_IDLE_READS: usize = 4;
const DEFAULT_MAX_PACKET_SIZE: usize = 16384;

#[cfg(feature = "serialport")]
const DEFAULT_BAUD: u32 = 115_200;
#[cfg(feature = "serialport")]
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A duplex byte channel to a device
pub trait Channel {
    /// Read from the device
    ///
    /// With `None` this returns whatever a single transfer delivers, which is
    /// empty when the device had nothing to send. With `Some(len)` it blocks
    /// until exactly `len` bytes were received.
    fn read(&mut self, len: Option<usize>) -> Result<Vec<u8>, Error>;

    /// Write to the device
    ///
    /// An empty slice is sent as a zero-length packet. With `wait` set, the
    /// data is flushed before returning.
    fn write(&mut self, data: &[u8], wait: bool) -> Result<(), Error>;

    /// Largest amount of data a single read should ask for
    fn max_packet_size(&self) -> usize {
        DEFAULT_MAX_PACKET_SIZE
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn read(&mut self, len: Option<usize>) -> Result<Vec<u8>, Error> {
        (**self).read(len)
    }

    fn write(&mut self, data: &[u8], wait: bool) -> Result<(), Error> {
        (**self).write(data, wait)
    }

    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }
}

/// A [Channel] over the serial port a device in EDL mode enumerates as
#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub struct SerialChannel {
    serial: Box<dyn SerialPort>,
}

#[cfg(feature = "serialport")]
impl SerialChannel {
    pub fn new(serial: Box<dyn SerialPort>) -> Self {
        Self { serial }
    }

    /// Open the named port with the settings the QDLoader interface expects
    pub fn open(port_name: &str) -> Result<Self, Error> {
        let serial = serialport::new(port_name, DEFAULT_BAUD)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        debug!("Opened serial port {port_name}");

        Ok(Self::new(serial))
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.serial.as_ref()
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.serial
    }
}

#[cfg(feature = "serialport")]
impl Channel for SerialChannel {
    fn read(&mut self, len: Option<usize>) -> Result<Vec<u8>, Error> {
        let Some(len) = len else {
            let mut buffer = vec![0; self.max_packet_size()];
            return match self.serial.read(&mut buffer) {
                Ok(read) => {
                    buffer.truncate(read);
                    Ok(buffer)
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(e.into()),
            };
        };

        let mut buffer = vec![0; len];
        let mut filled = 0;
        let mut idle = 0;
        while filled < len {
            match self.serial.read(&mut buffer[filled..]) {
                Ok(0) => idle += 1,
                Ok(read) => {
                    filled += read;
                    idle = 0;
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => idle += 1,
                Err(e) => return Err(e.into()),
            }

            if idle >= MAX_IDLE_READS {
                debug!("Read stalled after {filled} of {len} bytes");
                return Err(Error::Connection(ConnectionError::Timeout(
                    Default::default(),
                )));
            }
        }

        Ok(buffer)
    }

    fn write(&mut self, data: &[u8], wait: bool) -> Result<(), Error> {
        // A serial line has no packet boundaries to mark
        if !data.is_empty() {
            self.serial.write_all(data)?;
        }
        if wait {
            self.serial.flush()?;
        }

        Ok(())
    }
}
