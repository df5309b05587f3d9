//! Scripted stand-in for the MPU-9150 serial bridge.

use super::Transport;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Simulated device state; tests tweak it through [`MockTransport::device`].
pub struct MockDevice {
    /// ax, ay, az, temperature, gx, gy, gz
    pub accel_gyro: [i16; 7],
    pub mag: [i16; 3],
    /// Status polls answered "not ready" before DRDY is set.
    pub polls_until_ready: usize,
    /// Replies to commands starting with this prefix are cut short.
    pub truncate_reply_to: Option<&'static str>,
    /// Commands starting with this prefix get no reply at all.
    pub ignore: Option<&'static str>,
    /// Every command received, without the newline.
    pub commands: Vec<String>,
    pub clears: usize,
    pub closed: bool,
    /// Unread reply lines.
    pub replies: VecDeque<String>,
    status_polls: usize,
}

impl MockDevice {
    fn respond(&mut self, command: &str) {
        if self.ignore.is_some_and(|p| command.starts_with(p)) {
            return;
        }

        let reply = if let Some(args) = command.strip_prefix("RD") {
            let header = &args[..4.min(args.len())];
            format!("RD{header}{}", self.payload(args))
        } else {
            "OK".to_owned()
        };

        let reply = match self.truncate_reply_to {
            Some(p) if command.starts_with(p) => reply[..reply.len() / 2].to_owned(),
            _ => reply,
        };
        self.replies.push_back(reply);
    }

    fn payload(&mut self, args: &str) -> String {
        let hex = |values: &[i16]| -> String {
            values.iter().map(|v| format!("{:04X}", *v as u16)).collect()
        };
        match &args[..4.min(args.len())] {
            "683B" => hex(&self.accel_gyro),
            "0C03" => hex(&self.mag),
            "0C02" => {
                self.status_polls += 1;
                if self.status_polls > self.polls_until_ready {
                    "01".to_owned()
                } else {
                    "00".to_owned()
                }
            }
            _ => String::new(),
        }
    }

    /// Number of magnetometer status polls seen so far.
    pub fn status_polls(&self) -> usize {
        self.status_polls
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            accel_gyro: [0, 0, 16384, 0, 0, 0, 0],
            mag: [200, 0, -400],
            polls_until_ready: 0,
            truncate_reply_to: None,
            ignore: None,
            commands: Vec::new(),
            clears: 0,
            closed: false,
            replies: VecDeque::new(),
            status_polls: 0,
        }
    }
}

/// Cloneable handle; clones share one simulated device.
#[derive(Clone, Default)]
pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self) -> MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap()
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut device = self.device();
        if device.closed {
            return Err(Error::Disconnected);
        }
        let text = String::from_utf8_lossy(data);
        for command in text.lines().filter(|l| !l.is_empty()) {
            device.commands.push(command.to_owned());
            device.respond(command);
        }
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<String> {
        let mut device = self.device();
        if device.closed {
            return Err(Error::Disconnected);
        }
        device
            .replies
            .pop_front()
            .ok_or(Error::Timeout("response line"))
    }

    fn clear_input(&mut self) -> Result<()> {
        let mut device = self.device();
        device.replies.clear();
        device.clears += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.device().closed = true;
        Ok(())
    }
}
