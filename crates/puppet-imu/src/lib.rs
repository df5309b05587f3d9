pub mod error;
pub mod fusion;
pub mod link;
pub mod protocol;
pub mod subscribers;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use fusion::{FilterConfig, OrientationFilter};
pub use link::{DisconnectHandle, LinkSettings, SampleSource, SensorLink};
pub use subscribers::{ChannelSink, FrameSink, SubscriberSet};
pub use transport::{SerialTransport, Transport};
pub use types::{OrientationFrame, Sample};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Frames between debug heartbeats.
const HEARTBEAT_FRAMES: u64 = 600;

/// Runtime changes for the sampling loop, applied at the top of a cycle.
enum LoopCommand {
    SetFrequency(f32),
    SetGain(f32),
    Reset,
}

/// Runs acquisition and fusion on a dedicated thread and fans the resulting
/// frames out to subscribers.
///
/// The filter and the sample source live on the sampling thread; this handle
/// only talks to them through a command channel and reads results from a
/// watch channel.
pub struct Broadcaster {
    frame_rx: watch::Receiver<Option<Arc<OrientationFrame>>>,
    command_tx: mpsc::UnboundedSender<LoopCommand>,
    subscribers: Arc<SubscriberSet>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Broadcaster {
    /// Start sampling `source` through `filter`.
    pub fn spawn<S>(source: S, filter: OrientationFilter) -> Result<Self>
    where
        S: SampleSource + 'static,
    {
        let (frame_tx, frame_rx) = watch::channel(filter.last_frame());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(SubscriberSet::new());
        let running = Arc::new(AtomicBool::new(true));

        let sampling = SamplingLoop {
            source,
            filter,
            frame_tx,
            command_rx,
            subscribers: subscribers.clone(),
            running: running.clone(),
            frames: 0,
        };
        let thread = std::thread::Builder::new()
            .name("puppet-sampling".into())
            .spawn(move || sampling.run())?;

        Ok(Self {
            frame_rx,
            command_tx,
            subscribers,
            running,
            thread: Some(thread),
        })
    }

    /// Change the sample rate. Applies from the next cycle.
    pub fn set_frequency(&self, hz: f32) -> Result<()> {
        fusion::validate_frequency(hz)?;
        self.send(LoopCommand::SetFrequency(hz));
        Ok(())
    }

    /// Change the filter gain. Applies from the next cycle.
    pub fn set_gain(&self, beta: f32) -> Result<()> {
        fusion::validate_gain(beta)?;
        self.send(LoopCommand::SetGain(beta));
        Ok(())
    }

    /// Reset the orientation estimate to identity.
    pub fn reset(&self) {
        self.send(LoopCommand::Reset);
    }

    pub fn subscribe(&self, sink: &Arc<dyn FrameSink>) -> bool {
        self.subscribers.subscribe(sink)
    }

    pub fn unsubscribe(&self, sink: &Arc<dyn FrameSink>) -> usize {
        self.subscribers.unsubscribe(sink)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Most recent frame (non-blocking).
    pub fn last_frame(&self) -> Option<Arc<OrientationFrame>> {
        self.frame_rx.borrow().clone()
    }

    /// Receiver that always holds the most recent frame.
    pub fn watch(&self) -> watch::Receiver<Option<Arc<OrientationFrame>>> {
        self.frame_rx.clone()
    }

    /// Whether the sampling thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop sampling and wait for the thread to exit. An acquisition already
    /// in flight runs to completion first.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::error!("Sampling thread panicked");
            }
        }
    }

    fn send(&self, command: LoopCommand) {
        if self.command_tx.send(command).is_err() {
            tracing::debug!("Sampling loop already stopped, command ignored");
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SamplingLoop<S> {
    source: S,
    filter: OrientationFilter,
    frame_tx: watch::Sender<Option<Arc<OrientationFrame>>>,
    command_rx: mpsc::UnboundedReceiver<LoopCommand>,
    subscribers: Arc<SubscriberSet>,
    running: Arc<AtomicBool>,
    frames: u64,
}

impl<S: SampleSource> SamplingLoop<S> {
    fn run(mut self) {
        let config = self.filter.config();
        tracing::info!(
            sample_freq = config.sample_freq,
            beta = config.beta,
            "Sampling loop started"
        );

        while self.running.load(Ordering::Acquire) {
            self.apply_commands();
            // Fixed for this cycle; later changes wait for the next one.
            let period = self.filter.config().sample_period();

            match self.source.sample() {
                Ok(sample) => self.publish(sample),
                Err(Error::Disconnected) => {
                    tracing::info!("Sensor link closed");
                    break;
                }
                Err(e) => tracing::warn!(%e, "Acquisition failed, skipping cycle"),
            }

            self.pause(Duration::try_from_secs_f32(period).unwrap_or(Duration::MAX));
        }

        tracing::info!(frames = self.frames, "Sampling loop stopped");
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            let applied = match command {
                LoopCommand::SetFrequency(hz) => self.filter.set_frequency(hz),
                LoopCommand::SetGain(beta) => self.filter.set_gain(beta),
                LoopCommand::Reset => {
                    self.filter.reset();
                    Ok(())
                }
            };
            match applied {
                Ok(()) => tracing::info!(config = ?self.filter.config(), "Filter updated"),
                Err(e) => tracing::warn!(%e, "Rejected filter change"),
            }
        }
    }

    fn publish(&mut self, sample: Sample) {
        let frame = self.filter.update(sample);
        self.frame_tx.send_replace(Some(frame.clone()));
        let notified = self.subscribers.broadcast(&frame);

        self.frames += 1;
        if self.frames % HEARTBEAT_FRAMES == 0 {
            tracing::debug!(frames = self.frames, notified, %frame, "Sampling heartbeat");
        }
    }

    /// Sleep for `period`, waking early if the loop is stopped.
    fn pause(&self, period: Duration) {
        let deadline = Instant::now().checked_add(period);
        while self.running.load(Ordering::Acquire) {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::park_timeout(deadline - now);
                }
                None => std::thread::park(),
            }
        }
    }
}
