use crate::types::OrientationFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Receives every frame the sampling loop publishes.
///
/// `notify` runs on the sampling thread while the subscriber set is held,
/// so it must return promptly and never block. It must not subscribe or
/// unsubscribe on the set that is notifying it either: that waits on the
/// held read lock and deadlocks the sampling thread.
pub trait FrameSink: Send + Sync {
    fn notify(&self, frame: &Arc<OrientationFrame>);
}

/// Identity-keyed set of weakly held sinks.
///
/// Fan-out holds the read lock for the whole pass, so once
/// [`SubscriberSet::unsubscribe`] returns the removed sink sees no further
/// frames.
#[derive(Default)]
pub struct SubscriberSet {
    sinks: RwLock<Vec<Weak<dyn FrameSink>>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `sink` unless already present. Returns whether it was added.
    pub fn subscribe(&self, sink: &Arc<dyn FrameSink>) -> bool {
        let mut sinks = self.write();
        if sinks.iter().any(|s| same_sink(s, sink)) {
            return false;
        }
        sinks.push(Arc::downgrade(sink));
        true
    }

    /// Remove every entry for `sink`. Returns how many were removed.
    pub fn unsubscribe(&self, sink: &Arc<dyn FrameSink>) -> usize {
        let mut sinks = self.write();
        let before = sinks.len();
        sinks.retain(|s| !same_sink(s, sink));
        before - sinks.len()
    }

    /// Number of subscribers still alive.
    pub fn len(&self) -> usize {
        self.read().iter().filter(|s| s.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand `frame` to every live subscriber. Returns how many were notified.
    pub fn broadcast(&self, frame: &Arc<OrientationFrame>) -> usize {
        let mut notified = 0;
        let mut stale = false;
        {
            let sinks = self.read();
            for sink in sinks.iter() {
                match sink.upgrade() {
                    Some(sink) => {
                        sink.notify(frame);
                        notified += 1;
                    }
                    None => stale = true,
                }
            }
        }

        if stale {
            self.write().retain(|s| s.strong_count() > 0);
        }
        notified
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Weak<dyn FrameSink>>> {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Weak<dyn FrameSink>>> {
        self.sinks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn same_sink(entry: &Weak<dyn FrameSink>, sink: &Arc<dyn FrameSink>) -> bool {
    std::ptr::addr_eq(entry.as_ptr(), Arc::as_ptr(sink))
}

/// Sink backed by a bounded channel. Frames that do not fit are dropped
/// rather than stalling the sampling loop.
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<OrientationFrame>>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<OrientationFrame>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
        });
        (sink, rx)
    }

    /// Frames discarded because the receiver fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for ChannelSink {
    fn notify(&self, frame: &Arc<OrientationFrame>) {
        match self.tx.try_send(frame.clone()) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    tracing::debug!(dropped, "Subscriber lagging, dropping frames");
                }
            }
        }
    }
}
