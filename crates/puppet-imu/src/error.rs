use crate::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the sensor link and the sampling loop.
///
/// Only [`Error::Connection`] is meant to be fatal. Everything else is
/// reported per cycle and the loop carries on with the last good frame.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport could not be opened.
    #[error("Failed to open sensor transport {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// The device answered with something we could not decode.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The device did not answer in time.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link was shut down and can no longer produce samples.
    #[error("Sensor link disconnected")]
    Disconnected,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
