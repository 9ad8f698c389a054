//! Progress delivery and in-flight job accounting
//!
//! Each server being prepared gets one progress channel. A channel holds
//! only the latest message: publishing never blocks and replaces whatever
//! the observer has not read yet. The terminal "Done" message is the last
//! value written, so an observer always sees it once it reads again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

/// Terminal message of every preparation
pub const DONE_MESSAGE: &str = "Done";

struct Channel {
    generation: u64,
    rx: watch::Receiver<Option<String>>,
}

/// Progress channels keyed by server ID
#[derive(Default)]
pub struct ProgressHub {
    channels: Mutex<HashMap<String, Channel>>,
    generation: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a channel for a server, replacing any previous one
    pub fn register(self: &Arc<Self>, server_id: &str) -> (ProgressSender, ProgressReceiver) {
        let (tx, rx) = watch::channel(None);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.channels.lock().insert(
            server_id.to_string(),
            Channel {
                generation,
                rx: rx.clone(),
            },
        );
        let sender = ProgressSender {
            server_id: server_id.to_string(),
            generation,
            tx,
            hub: Arc::clone(self),
        };
        (sender, ProgressReceiver { rx })
    }

    /// Attach another observer. The latest message, if any, is delivered first.
    pub fn subscribe(&self, server_id: &str) -> Option<ProgressReceiver> {
        let channels = self.channels.lock();
        let channel = channels.get(server_id)?;
        let mut rx = channel.rx.clone();
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        Some(ProgressReceiver { rx })
    }

    pub fn is_active(&self, server_id: &str) -> bool {
        self.channels.lock().contains_key(server_id)
    }

    fn remove(&self, server_id: &str, generation: u64) {
        let mut channels = self.channels.lock();
        if channels.get(server_id).is_some_and(|c| c.generation == generation) {
            channels.remove(server_id);
        }
    }
}

/// Publishing half, owned by the preparation job
pub struct ProgressSender {
    server_id: String,
    generation: u64,
    tx: watch::Sender<Option<String>>,
    hub: Arc<ProgressHub>,
}

impl ProgressSender {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Non-blocking publish; an unread previous message is dropped
    pub fn publish(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(server_id = %self.server_id, %message, "Progress");
        self.tx.send_replace(Some(message));
    }

    /// Publish the terminal message and close the channel
    pub fn finish(self) {
        self.publish(DONE_MESSAGE);
        self.hub.remove(&self.server_id, self.generation);
    }
}

/// Observing half
pub struct ProgressReceiver {
    rx: watch::Receiver<Option<String>>,
}

impl ProgressReceiver {
    /// Wait for the next unseen message. Returns `None` once the job is gone
    /// and its last message has been read.
    pub async fn next(&mut self) -> Option<String> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(message) = self.rx.borrow_and_update().clone() {
                return Some(message);
            }
        }
    }

    /// Follow the channel until "Done" or until it closes
    pub async fn follow(mut self, mut on_message: impl FnMut(&str)) {
        while let Some(message) = self.next().await {
            on_message(&message);
            if message == DONE_MESSAGE {
                break;
            }
        }
    }
}

#[derive(Default)]
struct Counts {
    total: usize,
    per_version: HashMap<String, usize>,
}

/// Counts preparation jobs in flight, globally and per game version
#[derive(Default)]
pub struct InFlight {
    counts: Mutex<Counts>,
    changed: Notify,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a job until the returned ticket is dropped
    pub fn begin(self: &Arc<Self>, version: &str) -> InFlightTicket {
        let mut counts = self.counts.lock();
        counts.total += 1;
        *counts.per_version.entry(version.to_string()).or_insert(0) += 1;
        InFlightTicket {
            tracker: Arc::clone(self),
            version: version.to_string(),
        }
    }

    fn end(&self, version: &str) {
        {
            let mut counts = self.counts.lock();
            counts.total = counts.total.saturating_sub(1);
            if let Some(n) = counts.per_version.get_mut(version) {
                *n -= 1;
                if *n == 0 {
                    counts.per_version.remove(version);
                }
            }
        }
        self.changed.notify_waiters();
    }

    pub fn count(&self, version: &str) -> usize {
        self.counts.lock().per_version.get(version).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().total
    }

    /// Wait until no job for `version` is observed in flight.
    ///
    /// Best-effort: a job submitted while waiting keeps the waiter blocked
    /// until it finishes too, so a steady stream of jobs can delay this
    /// indefinitely.
    pub async fn wait_version_idle(&self, version: &str) {
        self.wait_until(|| self.count(version) == 0).await
    }

    pub async fn wait_idle(&self) {
        self.wait_until(|| self.total() == 0).await
    }

    async fn wait_until(&self, idle: impl Fn() -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent end() is not missed
            notified.as_mut().enable();
            if idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the in-flight counters on drop
pub struct InFlightTicket {
    tracker: Arc<InFlight>,
    version: String,
}

impl InFlightTicket {
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        self.tracker.end(&self.version);
    }
}
