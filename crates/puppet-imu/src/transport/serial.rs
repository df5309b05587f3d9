use super::Transport;
use crate::error::{Error, Result};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Upper bound for a single blocking read, so line deadlines stay accurate.
const READ_SLICE: Duration = Duration::from_millis(5);

/// Serial transport to the sensor bridge (8N1, no flow control).
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    /// Bytes received past the last returned line.
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Open `path` at `baud_rate`.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_SLICE)
            .open()
            .map_err(|source| Error::Connection {
                port: path.to_owned(),
                source,
            })?;

        tracing::info!(path, baud_rate, "Opened serial port");

        Ok(Self {
            port: Some(port),
            pending: Vec::with_capacity(128),
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(Error::Disconnected)
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim_end().to_owned())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("response line"));
            }
            let read = self.port()?.read(&mut buf);
            match read {
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.pending.clear();
        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            tracing::info!("Closed serial port");
        }
        self.pending.clear();
        Ok(())
    }
}
