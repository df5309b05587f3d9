use crate::error::{Error, Result};
use crate::protocol::{self, *};
use crate::transport::Transport;
use crate::types::Sample;
use glam::Vec3;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Timing limits for one acquisition.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Deadline for each command's reply line.
    pub read_timeout: Duration,
    /// Maximum magnetometer status polls per sample.
    pub mag_poll_attempts: u32,
    /// Pause between status polls.
    pub mag_poll_interval: Duration,
    /// Overall deadline for the magnetometer to become ready.
    pub mag_ready_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            mag_poll_attempts: 100,
            mag_poll_interval: Duration::from_micros(500),
            mag_ready_timeout: Duration::from_millis(100),
        }
    }
}

/// Anything that can produce one [`Sample`] per call.
pub trait SampleSource: Send {
    fn sample(&mut self) -> Result<Sample>;
}

/// Requests shutdown of a [`SensorLink`] from another thread.
#[derive(Debug, Clone)]
pub struct DisconnectHandle(Arc<AtomicBool>);

impl DisconnectHandle {
    /// The link tears down at the start of its next `sample()` call.
    pub fn disconnect(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Acquisition protocol for the MPU-9150 (accel + gyro) and its AK8975
/// magnetometer behind an ASCII register bridge.
///
/// Exclusively owns the transport. Every call to [`SensorLink::sample`] runs
/// the whole register exchange to completion or failure; a failed call never
/// yields a partial sample.
pub struct SensorLink<T: Transport> {
    transport: T,
    settings: LinkSettings,
    stop: Arc<AtomicBool>,
    closed: bool,
    /// A previous exchange was abandoned mid-way; stale replies may be queued.
    resync: bool,
}

impl<T: Transport> SensorLink<T> {
    /// Bring the device into a known state and return a ready link.
    pub fn connect(transport: T, settings: LinkSettings) -> Result<Self> {
        let mut link = Self {
            transport,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
            closed: false,
            resync: false,
        };

        link.transport.clear_input()?;
        link.i2c_master_enable()?;
        link.stop_streaming()?;
        link.write_register(MPU_SLAVE_ADDR, REG_PWR_MGMT_1, CLKSEL_PLL_XGYRO)?;

        tracing::info!("Sensor link ready");
        Ok(link)
    }

    /// Ask the link to shut down before its next acquisition.
    pub fn disconnect(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn disconnect_handle(&self) -> DisconnectHandle {
        DisconnectHandle(self.stop.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Acquire one sample.
    pub fn sample(&mut self) -> Result<Sample> {
        if self.closed {
            return Err(Error::Disconnected);
        }
        if self.stop.load(Ordering::Acquire) {
            self.shutdown();
            return Err(Error::Disconnected);
        }

        if self.resync {
            self.transport.clear_input()?;
            self.resync = false;
        }

        self.acquire().inspect_err(|_| self.resync = true)
    }

    fn acquire(&mut self) -> Result<Sample> {
        let timestamp = SystemTime::now();

        // Accel + gyro through the primary device.
        self.i2c_master_enable()?;
        let accel_gyro = self.read_registers(MPU_SLAVE_ADDR, REG_ACCEL_XOUT_H, ACCEL_GYRO_LEN)?;
        let accel = axes_at(&accel_gyro, ACCEL_OFFSETS)?;
        let gyro = axes_at(&accel_gyro, GYRO_OFFSETS)?;

        // Magnetometer directly, in bypass mode.
        self.i2c_master_disable()?;
        self.write_register(MAG_SLAVE_ADDR, REG_MAG_CNTL, MAG_MODE_SINGLE)?;
        self.wait_for_magnetometer()?;
        let mag_raw = self.read_registers(MAG_SLAVE_ADDR, REG_MAG_HXL, MAG_LEN)?;
        let mag = axes_at(&mag_raw, MAG_OFFSETS)?;

        Ok(Sample::new(
            timestamp,
            to_vec3(accel),
            to_vec3(gyro) * LSB_TO_RADIANS_PER_SECOND,
            to_vec3(mag),
        ))
    }

    fn wait_for_magnetometer(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.settings.mag_ready_timeout;
        for attempt in 1..=self.settings.mag_poll_attempts {
            let status = self.read_registers(MAG_SLAVE_ADDR, REG_MAG_ST1, 1)?;
            if byte_at(&status, RESPONSE_DATA_OFFSET)? & MAG_DATA_READY != 0 {
                tracing::trace!(attempt, "Magnetometer ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.settings.mag_poll_interval);
        }
        Err(Error::Timeout("magnetometer data ready"))
    }

    /// Best-effort teardown, then close. Errors are logged, not returned.
    fn shutdown(&mut self) {
        tracing::info!("Disconnecting sensor link");

        let steps = [
            protocol::write_command(MAG_SLAVE_ADDR, REG_MAG_CNTL, MAG_MODE_POWER_DOWN),
            protocol::write_command(MPU_SLAVE_ADDR, REG_USER_CTRL, I2C_MST_EN),
            protocol::write_command(MPU_SLAVE_ADDR, REG_INT_PIN_CFG, 0x00),
            STOP_STREAMING.to_owned(),
        ];
        for command in &steps {
            if let Err(e) = self.command(command) {
                tracing::warn!(command = command.trim_end(), %e, "Teardown step failed");
            }
        }

        if let Err(e) = self.transport.close() {
            tracing::warn!(%e, "Failed to close sensor transport");
        }
        self.closed = true;
    }

    fn i2c_master_enable(&mut self) -> Result<()> {
        self.write_register(MPU_SLAVE_ADDR, REG_USER_CTRL, I2C_MST_EN)?;
        self.write_register(MPU_SLAVE_ADDR, REG_INT_PIN_CFG, 0x00)
    }

    fn i2c_master_disable(&mut self) -> Result<()> {
        self.write_register(MPU_SLAVE_ADDR, REG_USER_CTRL, 0x00)?;
        self.write_register(MPU_SLAVE_ADDR, REG_INT_PIN_CFG, I2C_BYPASS_EN)
    }

    fn stop_streaming(&mut self) -> Result<()> {
        self.command(STOP_STREAMING)
    }

    fn write_register(&mut self, slave: u8, register: u8, value: u8) -> Result<()> {
        self.command(&protocol::write_command(slave, register, value))
    }

    /// Send a command whose reply is only an acknowledgement.
    fn command(&mut self, command: &str) -> Result<()> {
        self.transport.write(command.as_bytes())?;
        self.transport.read_line(self.settings.read_timeout)?;
        Ok(())
    }

    fn read_registers(&mut self, slave: u8, register: u8, count: u8) -> Result<String> {
        let command = protocol::read_command(slave, register, count);
        self.transport.write(command.as_bytes())?;
        let line = self.transport.read_line(self.settings.read_timeout)?;
        expect_payload(&line, &command, count)?;
        Ok(line)
    }
}

impl<T: Transport> Drop for SensorLink<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.shutdown();
        }
    }
}

impl<T: Transport> SampleSource for SensorLink<T> {
    fn sample(&mut self) -> Result<Sample> {
        SensorLink::sample(self)
    }
}

fn to_vec3([x, y, z]: [i16; 3]) -> Vec3 {
    Vec3::new(x as f32, y as f32, z as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn settings() -> LinkSettings {
        LinkSettings {
            read_timeout: Duration::from_millis(10),
            mag_poll_attempts: 5,
            mag_poll_interval: Duration::from_micros(10),
            mag_ready_timeout: Duration::from_secs(1),
        }
    }

    fn connected(mock: &MockTransport) -> SensorLink<MockTransport> {
        let link = SensorLink::connect(mock.clone(), settings()).unwrap();
        mock.device().commands.clear();
        link
    }

    #[test]
    fn connect_initializes_device() {
        let mock = MockTransport::new();
        let _link = SensorLink::connect(mock.clone(), settings()).unwrap();
        assert_eq!(
            mock.device().commands,
            ["WR686A20", "WR683700", "SD", "WR686B01"]
        );
    }

    #[test]
    fn sample_runs_full_sequence() {
        let mock = MockTransport::new();
        {
            let mut device = mock.device();
            device.accel_gyro = [100, -200, 16384, 0, 164, -328, 0];
            device.mag = [12, -34, 56];
            device.polls_until_ready = 2;
        }
        let mut link = connected(&mock);

        let sample = link.sample().unwrap();

        assert_eq!(sample.accel, Vec3::new(100.0, -200.0, 16384.0));
        assert_eq!(sample.mag, Vec3::new(12.0, -34.0, 56.0));
        assert!((sample.gyro.x - 10.0_f32.to_radians()).abs() < 1e-5);
        assert!((sample.gyro.y + 20.0_f32.to_radians()).abs() < 1e-5);
        assert_eq!(sample.gyro.z, 0.0);

        assert_eq!(
            mock.device().commands,
            [
                "WR686A20", "WR683700", "RD683B0E", "WR686A00", "WR683702", "WR0C0A01",
                "RD0C0201", "RD0C0201", "RD0C0201", "RD0C0306",
            ]
        );
    }

    #[test]
    fn short_response_fails_whole_sample() {
        let mock = MockTransport::new();
        mock.device().truncate_reply_to = Some("RD683B");
        let mut link = connected(&mock);

        let err = link.sample().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
        // Aborted before touching the magnetometer.
        assert!(!mock.device().commands.iter().any(|c| c.starts_with("WR0C")));
    }

    #[test]
    fn garbled_magnetometer_fails_whole_sample() {
        let mock = MockTransport::new();
        mock.device().truncate_reply_to = Some("RD0C03");
        let mut link = connected(&mock);

        assert!(matches!(link.sample(), Err(Error::Protocol(_))));
    }

    #[test]
    fn magnetometer_poll_is_bounded() {
        let mock = MockTransport::new();
        mock.device().polls_until_ready = usize::MAX;
        let mut link = connected(&mock);

        assert!(matches!(
            link.sample(),
            Err(Error::Timeout("magnetometer data ready"))
        ));
        assert_eq!(mock.device().status_polls(), 5);
    }

    #[test]
    fn magnetometer_poll_respects_deadline() {
        let mock = MockTransport::new();
        mock.device().polls_until_ready = usize::MAX;
        let mut link = SensorLink::connect(
            mock.clone(),
            LinkSettings {
                mag_poll_attempts: 1_000_000,
                mag_poll_interval: Duration::from_millis(1),
                mag_ready_timeout: Duration::from_millis(20),
                ..settings()
            },
        )
        .unwrap();

        let started = Instant::now();
        assert!(matches!(link.sample(), Err(Error::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(mock.device().status_polls() < 1_000_000);
    }

    #[test]
    fn silent_device_times_out_then_recovers() {
        let mock = MockTransport::new();
        mock.device().ignore = Some("RD0C03");
        let mut link = connected(&mock);

        assert!(matches!(link.sample(), Err(Error::Timeout("response line"))));

        mock.device().ignore = None;
        let clears = mock.device().clears;
        let sample = link.sample().unwrap();
        assert_eq!(sample.mag, Vec3::new(200.0, 0.0, -400.0));
        assert_eq!(mock.device().clears, clears + 1);
    }

    #[test]
    fn disconnect_tears_down_and_is_terminal() {
        let mock = MockTransport::new();
        let mut link = connected(&mock);
        link.sample().unwrap();
        mock.device().commands.clear();

        let handle = link.disconnect_handle();
        std::thread::spawn(move || handle.disconnect()).join().unwrap();

        assert!(matches!(link.sample(), Err(Error::Disconnected)));
        assert!(link.is_closed());
        {
            let device = mock.device();
            assert_eq!(device.commands, ["WR0C0A00", "WR686A20", "WR683700", "SD"]);
            assert!(device.closed);
        }

        assert!(matches!(link.sample(), Err(Error::Disconnected)));
        drop(link);
        assert_eq!(mock.device().commands.len(), 4);
    }

    #[test]
    fn direct_disconnect_applies_on_next_sample() {
        let mock = MockTransport::new();
        let mut link = connected(&mock);

        link.disconnect();
        assert!(!link.is_closed());
        assert!(mock.device().commands.is_empty());

        assert!(matches!(link.sample(), Err(Error::Disconnected)));
        assert!(link.is_closed());
        let device = mock.device();
        assert!(!device.commands.iter().any(|c| c.starts_with("RD")));
        assert!(device.closed);
    }

    #[test]
    fn dropping_an_open_link_tears_down() {
        let mock = MockTransport::new();
        let link = connected(&mock);
        drop(link);

        let device = mock.device();
        assert_eq!(device.commands, ["WR0C0A00", "WR686A20", "WR683700", "SD"]);
        assert!(device.closed);
    }
}
