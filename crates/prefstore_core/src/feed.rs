//! Latest-value broadcast for committed preferences.
//!
//! # Responsibility
//! - Replay the most recent known snapshot to every new subscriber.
//! - Deliver each distinct change once per subscriber, in commit order.
//! - Carry read failures as error events without closing subscriptions.
//!
//! # Invariants
//! - The retained value is the last *good* snapshot; errors never replace it.
//! - `generation` advances on every committed publish. A pool read started
//!   before a commit can no longer publish, so the feed never regresses.
//! - Subscriptions end only when the feed itself is dropped.

use crate::model::preferences::PreferencesValue;
use log::debug;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::watch;

pub type FeedResult<T> = Result<T, FeedError>;

/// Error event delivered to subscribers when the store could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedError {
    message: Arc<str>,
}

impl FeedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for FeedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "preferences read failed: {}", self.message)
    }
}

impl Error for FeedError {}

#[derive(Debug, Clone)]
struct FeedState {
    value: PreferencesValue,
    generation: u64,
    error: Option<FeedError>,
    error_seq: u64,
}

/// Sending half, owned by the repository.
#[derive(Debug)]
pub struct ChangeFeed {
    sender: watch::Sender<FeedState>,
}

impl ChangeFeed {
    pub fn new(initial: PreferencesValue) -> Self {
        let (sender, _) = watch::channel(FeedState {
            value: initial,
            generation: 0,
            error: None,
            error_seq: 0,
        });
        Self { sender }
    }

    /// Creates a subscription whose first item is the current snapshot.
    pub fn subscribe(&self) -> Subscription {
        let receiver = self.sender.subscribe();
        let seen_error_seq = receiver.borrow().error_seq;
        Subscription {
            receiver,
            last_delivered: None,
            seen_error_seq,
        }
    }

    pub fn latest(&self) -> PreferencesValue {
        self.sender.borrow().value
    }

    pub fn generation(&self) -> u64 {
        self.sender.borrow().generation
    }

    /// Publishes a value read after a commit.
    ///
    /// Returns `true` when subscribers were notified (the value changed).
    pub fn publish_committed(&self, value: PreferencesValue) -> bool {
        self.sender.send_if_modified(|state| {
            state.generation += 1;
            state.error = None;
            replace_if_changed(state, value)
        })
    }

    /// Publishes a value read by a pool reader that captured `generation`
    /// before reading. Dropped when a commit happened in the meantime.
    pub fn publish_observed(&self, generation: u64, value: PreferencesValue) -> bool {
        self.sender.send_if_modified(|state| {
            if state.generation != generation {
                debug!(
                    "event=feed_publish module=feed status=stale read_generation={} current_generation={}",
                    generation, state.generation
                );
                return false;
            }
            state.error = None;
            replace_if_changed(state, value)
        })
    }

    /// Publishes a read failure. The retained value is left untouched.
    pub fn publish_error(&self, error: FeedError) {
        self.sender.send_modify(|state| {
            state.error_seq += 1;
            state.error = Some(error);
        });
    }
}

fn replace_if_changed(state: &mut FeedState, value: PreferencesValue) -> bool {
    if state.value == value {
        return false;
    }
    state.value = value;
    true
}

/// Receiving half handed to observers.
#[derive(Debug)]
pub struct Subscription {
    receiver: watch::Receiver<FeedState>,
    last_delivered: Option<PreferencesValue>,
    seen_error_seq: u64,
}

impl Subscription {
    /// Waits for the next item.
    ///
    /// Values are delivered before a pending error so a late joiner always
    /// starts from the last good snapshot. Returns `None` once the feed has
    /// been dropped and everything pending was delivered.
    pub async fn next(&mut self) -> Option<FeedResult<PreferencesValue>> {
        loop {
            if let Some(item) = self.take_pending() {
                return Some(item);
            }
            if self.receiver.changed().await.is_err() {
                return self.take_pending();
            }
        }
    }

    fn take_pending(&mut self) -> Option<FeedResult<PreferencesValue>> {
        let state = self.receiver.borrow_and_update();
        if self.last_delivered != Some(state.value) {
            self.last_delivered = Some(state.value);
            return Some(Ok(state.value));
        }
        if state.error_seq > self.seen_error_seq {
            self.seen_error_seq = state.error_seq;
            if let Some(error) = &state.error {
                return Some(Err(error.clone()));
            }
        }
        None
    }
}
