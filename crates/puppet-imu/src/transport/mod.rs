//! Byte-stream transports the sensor link can talk over.

use crate::error::Result;
use std::time::Duration;

mod serial;
pub use serial::SerialTransport;

#[cfg(test)]
pub(crate) mod mock;

/// Line-oriented transport to the sensor bridge.
pub trait Transport: Send {
    /// Write the whole buffer.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read one newline-terminated line, without the terminator.
    ///
    /// Fails with [`crate::Error::Timeout`] if no full line arrives within
    /// `timeout`.
    fn read_line(&mut self, timeout: Duration) -> Result<String>;

    /// Drop anything received but not yet read, so a late reply to an
    /// abandoned command cannot be mistaken for the next one.
    fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the underlying device. Further I/O fails.
    fn close(&mut self) -> Result<()>;
}
