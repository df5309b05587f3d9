//! ASCII register protocol spoken by the MPU-9150 serial bridge.
//!
//! Every command is one newline-terminated line:
//!
//! - `WR<slave><reg><value>` writes one byte; the reply line is an ack.
//! - `RD<slave><reg><count>` reads `count` bytes; the reply echoes the
//!   six-character `RD<slave><reg>` header followed by two hex digits per byte.
//! - `SD` stops any free-running stream mode.

use thiserror::Error;

/// MPU-9150 accel/gyro die.
pub const MPU_SLAVE_ADDR: u8 = 0x68;
/// AK8975 magnetometer, reachable only in bypass mode.
pub const MAG_SLAVE_ADDR: u8 = 0x0C;

pub const REG_INT_PIN_CFG: u8 = 0x37;
pub const REG_ACCEL_XOUT_H: u8 = 0x3B;
pub const REG_USER_CTRL: u8 = 0x6A;
pub const REG_PWR_MGMT_1: u8 = 0x6B;

pub const REG_MAG_ST1: u8 = 0x02;
pub const REG_MAG_HXL: u8 = 0x03;
pub const REG_MAG_CNTL: u8 = 0x0A;

/// USER_CTRL.I2C_MST_EN
pub const I2C_MST_EN: u8 = 1 << 5;
/// INT_PIN_CFG.I2C_BYPASS_EN
pub const I2C_BYPASS_EN: u8 = 1 << 1;
/// PWR_MGMT_1: wake up, clock from the X gyro PLL.
pub const CLKSEL_PLL_XGYRO: u8 = 0x01;
/// AK8975 CNTL: power down.
pub const MAG_MODE_POWER_DOWN: u8 = 0x00;
/// AK8975 CNTL: single measurement.
pub const MAG_MODE_SINGLE: u8 = 0x01;
/// AK8975 ST1.DRDY
pub const MAG_DATA_READY: u8 = 0x01;

/// Accel (6) + temperature (2) + gyro (6).
pub const ACCEL_GYRO_LEN: u8 = 14;
pub const MAG_LEN: u8 = 6;

/// Hex payload starts after the echoed `RD<slave><reg>` header.
pub const RESPONSE_DATA_OFFSET: usize = 6;

pub const ACCEL_OFFSETS: [usize; 3] = [6, 10, 14];
pub const GYRO_OFFSETS: [usize; 3] = [22, 26, 30];
pub const MAG_OFFSETS: [usize; 3] = [6, 10, 14];

/// Gyro at ±2000 °/s full scale: 16.4 LSB per °/s.
pub const LSB_TO_RADIANS_PER_SECOND: f32 = (1.0 / 16.4) * 0.017_453_292_5;

/// Stop-streaming command.
pub const STOP_STREAMING: &str = "SD\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Response too short: need {needed} bytes, got {len} in {line:?}")]
    ResponseTooShort {
        needed: usize,
        len: usize,
        line: String,
    },
    #[error("Invalid hex digits at offset {offset} in {line:?}")]
    InvalidHex { offset: usize, line: String },
    #[error("Response {line:?} does not answer {expected:?}")]
    HeaderMismatch { expected: String, line: String },
}

/// `WR` command line for a single-byte register write.
pub fn write_command(slave: u8, register: u8, value: u8) -> String {
    format!("WR{slave:02X}{register:02X}{value:02X}\n")
}

/// `RD` command line for a `count`-byte register read.
pub fn read_command(slave: u8, register: u8, count: u8) -> String {
    format!("RD{slave:02X}{register:02X}{count:02X}\n")
}

/// Decode the byte whose two hex digits start at `offset`.
pub fn byte_at(line: &str, offset: usize) -> Result<u8, ProtocolError> {
    let digits = hex_digits(line, offset, 2)?;
    u8::from_str_radix(digits, 16).map_err(|_| ProtocolError::InvalidHex {
        offset,
        line: line.to_owned(),
    })
}

/// Decode a big-endian signed 16-bit value from the four hex digits at
/// `offset` (high byte first).
pub fn i16_at(line: &str, offset: usize) -> Result<i16, ProtocolError> {
    let high = byte_at(line, offset)?;
    let low = byte_at(line, offset + 2)?;
    Ok(i16::from_be_bytes([high, low]))
}

/// Decode three consecutive axes at the given offsets.
pub fn axes_at(line: &str, offsets: [usize; 3]) -> Result<[i16; 3], ProtocolError> {
    Ok([
        i16_at(line, offsets[0])?,
        i16_at(line, offsets[1])?,
        i16_at(line, offsets[2])?,
    ])
}

/// Check a read response answers `command` and carries the full payload it
/// asked for.
pub fn expect_payload(line: &str, command: &str, count: u8) -> Result<(), ProtocolError> {
    let needed = RESPONSE_DATA_OFFSET + 2 * count as usize;
    if line.len() < needed {
        return Err(ProtocolError::ResponseTooShort {
            needed,
            len: line.len(),
            line: line.to_owned(),
        });
    }
    let expected = command.get(..RESPONSE_DATA_OFFSET).unwrap_or(command);
    let echoed = line.get(..RESPONSE_DATA_OFFSET);
    if !echoed.is_some_and(|header| header.eq_ignore_ascii_case(expected)) {
        return Err(ProtocolError::HeaderMismatch {
            expected: expected.to_owned(),
            line: line.to_owned(),
        });
    }
    Ok(())
}

fn hex_digits(line: &str, offset: usize, len: usize) -> Result<&str, ProtocolError> {
    let digits = line
        .get(offset..offset + len)
        .ok_or_else(|| ProtocolError::ResponseTooShort {
            needed: offset + len,
            len: line.len(),
            line: line.to_owned(),
        })?;
    // from_str_radix accepts a leading sign, the wire format never does.
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidHex {
            offset,
            line: line.to_owned(),
        });
    }
    Ok(digits)
}
