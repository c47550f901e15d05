//! Buffered producer/consumer channels.
//!
//! Channels are independent of the action system: any code can `put` values
//! and any saga (or plain async code) can `take` them. A saga takes from a
//! channel with the [`take_channel`](crate::effect::take_channel) effect.
//!
//! # Delivery
//!
//! - A `put` with a waiting taker hands the value straight to the oldest
//!   taker, bypassing the buffer.
//! - Otherwise the value goes through the buffer policy:
//!
//! | Policy      | At capacity                                      |
//! |-------------|--------------------------------------------------|
//! | `none`      | value dropped (no taker, nothing kept)           |
//! | `fixed`     | tail truncated back to `size`, warning logged     |
//! | `expanding` | grows without bound (default)                    |
//! | `dropping`  | newest value discarded                           |
//! | `sliding`   | oldest value evicted                             |
//!
//! # Closing
//!
//! `close()` releases every waiting taker with `None` (the closed sentinel).
//! Buffered values are kept: later `take()` calls drain them first and only
//! then observe `None`, and `flush()` still returns them.
//!
//! A `take()` future dropped before it is polled to completion gives back a
//! value already handed to it, at the front of the buffer.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::sync::lock;

/// Default size for the bounded buffer policies.
pub const DEFAULT_BUFFER_SIZE: usize = 10;

// =============================================================================
// Buffer Configuration
// =============================================================================

/// How a channel buffers values nobody is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// No buffer: values without a waiting taker are dropped.
    None,
    /// Capped at `size`; overflow truncates the tail.
    Fixed,
    /// Unbounded.
    Expanding,
    /// Capped at `size`; new values are discarded once full.
    Dropping,
    /// Capped at `size`; the oldest value is evicted for the newest.
    Sliding,
}

/// Channel construction parameters.
///
/// ```ignore
/// let ch: Channel<u32> = channel(ChannelConfig::sliding(1));
/// let ch: Channel<u32> = serde_json::from_value::<ChannelConfig>(json!({
///     "policy": "dropping",
///     "size": 5,
/// }))?.into();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Buffer policy.
    #[serde(default = "default_policy")]
    pub policy: BufferPolicy,
    /// Capacity for `fixed`, `dropping` and `sliding`; an initial capacity
    /// hint for `expanding`.
    #[serde(default = "default_size")]
    pub size: usize,
}

fn default_policy() -> BufferPolicy {
    BufferPolicy::Expanding
}

fn default_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl ChannelConfig {
    /// Unbuffered channel.
    pub fn none() -> Self {
        Self {
            policy: BufferPolicy::None,
            size: 0,
        }
    }

    /// Fixed buffer of `size` values.
    pub fn fixed(size: usize) -> Self {
        Self {
            policy: BufferPolicy::Fixed,
            size,
        }
    }

    /// Unbounded buffer.
    pub fn expanding() -> Self {
        Self {
            policy: BufferPolicy::Expanding,
            size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Buffer that discards new values once `size` are held.
    pub fn dropping(size: usize) -> Self {
        Self {
            policy: BufferPolicy::Dropping,
            size,
        }
    }

    /// Buffer that evicts the oldest value once `size` are held.
    pub fn sliding(size: usize) -> Self {
        Self {
            policy: BufferPolicy::Sliding,
            size,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::expanding()
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Outcome of asking a channel for a value without awaiting.
pub(crate) enum TakeRequest<T: Send + 'static> {
    /// A value (or the closed sentinel) was available immediately.
    Ready(Option<T>),
    /// The caller was registered as a waiting taker.
    Pending(PendingTaker<T>),
}

struct ChannelState<T> {
    config: ChannelConfig,
    queue: VecDeque<T>,
    takers: VecDeque<(u64, oneshot::Sender<Option<T>>)>,
    next_taker: u64,
    closed: bool,
}

impl<T> ChannelState<T> {
    /// Hand `value` to the oldest live taker. Gives it back if none is left.
    fn deliver(&mut self, mut value: T) -> Option<T> {
        while let Some((_, taker)) = self.takers.pop_front() {
            match taker.send(Some(value)) {
                Ok(()) => return None,
                // The taker went away; try the next one with the same value
                Err(Some(returned)) => value = returned,
                Err(None) => return None,
            }
        }
        Some(value)
    }

    fn buffer(&mut self, value: T) {
        let size = self.config.size;
        match self.config.policy {
            BufferPolicy::None => {
                trace!("unbuffered channel has no taker, dropping value");
            }
            BufferPolicy::Expanding => self.queue.push_back(value),
            BufferPolicy::Fixed => {
                self.queue.push_back(value);
                if self.queue.len() > size {
                    warn!(size, "channel buffer overflow, truncating");
                    self.queue.truncate(size);
                }
            }
            BufferPolicy::Dropping => {
                if self.queue.len() < size {
                    self.queue.push_back(value);
                } else {
                    trace!(size, "dropping buffer full, discarding value");
                }
            }
            BufferPolicy::Sliding => {
                if size == 0 {
                    return;
                }
                while self.queue.len() >= size {
                    self.queue.pop_front();
                }
                self.queue.push_back(value);
            }
        }
    }
}

/// A buffered producer/consumer channel.
///
/// Cheap to clone; clones share the same queue and takers.
pub struct Channel<T> {
    state: Arc<Mutex<ChannelState<T>>>,
}

/// Create a channel with the given buffer configuration.
pub fn channel<T: Send + 'static>(config: ChannelConfig) -> Channel<T> {
    Channel::with_config(config)
}

impl<T: Send + 'static> Channel<T> {
    /// Create a channel with an expanding buffer.
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    /// Create a channel with the given buffer configuration.
    pub fn with_config(config: ChannelConfig) -> Self {
        let capacity = match config.policy {
            BufferPolicy::None => 0,
            _ => config.size,
        };
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                config,
                queue: VecDeque::with_capacity(capacity),
                takers: VecDeque::new(),
                next_taker: 0,
                closed: false,
            })),
        }
    }

    /// The configuration this channel was built with.
    pub fn config(&self) -> ChannelConfig {
        lock(&self.state).config
    }

    /// Send a value.
    ///
    /// No-op once the channel is closed.
    pub fn put(&self, value: T) {
        let mut state = lock(&self.state);
        if state.closed {
            trace!("put on closed channel ignored");
            return;
        }

        if let Some(value) = state.deliver(value) {
            state.buffer(value);
        }
    }

    /// Receive the next value.
    ///
    /// Resolves immediately when the buffer is non-empty, waits otherwise.
    /// Resolves to `None` once the channel is closed and drained.
    pub async fn take(&self) -> Option<T> {
        match self.request() {
            TakeRequest::Ready(value) => value,
            TakeRequest::Pending(taker) => taker.await,
        }
    }

    /// Close the channel, releasing every waiting taker with `None`.
    pub fn close(&self) {
        let takers = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.takers)
        };
        for (_, taker) in takers {
            let _ = taker.send(None);
        }
    }

    /// Returns true once `close()` has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Drain and return everything currently buffered.
    pub fn flush(&self) -> Vec<T> {
        lock(&self.state).queue.drain(..).collect()
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of takers currently waiting for a value.
    pub fn waiting_takers(&self) -> usize {
        lock(&self.state).takers.len()
    }

    /// Take a buffered value, or register as a waiting taker.
    pub(crate) fn request(&self) -> TakeRequest<T> {
        let mut state = lock(&self.state);
        if let Some(value) = state.queue.pop_front() {
            return TakeRequest::Ready(Some(value));
        }
        if state.closed {
            return TakeRequest::Ready(None);
        }
        let (sender, receiver) = oneshot::channel();
        let id = state.next_taker;
        state.next_taker += 1;
        state.takers.push_back((id, sender));
        TakeRequest::Pending(PendingTaker {
            channel: self.clone(),
            id,
            receiver,
        })
    }

    /// Forget a waiting taker so it can no longer receive values.
    pub(crate) fn release_taker(&self, id: u64) {
        lock(&self.state).takers.retain(|(taker, _)| *taker != id);
    }
}

/// A registered taker waiting for its value.
///
/// Dropping it unresolved removes the taker from the channel. A value that
/// was already sent to it goes to the next waiting taker, or back to the
/// front of the buffer when none is left.
pub(crate) struct PendingTaker<T: Send + 'static> {
    channel: Channel<T>,
    id: u64,
    receiver: oneshot::Receiver<Option<T>>,
}

impl<T: Send + 'static> PendingTaker<T> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl<T: Send + 'static> Future for PendingTaker<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(None))
    }
}

impl<T: Send + 'static> Drop for PendingTaker<T> {
    fn drop(&mut self) {
        let mut state = lock(&self.channel.state);
        let id = self.id;
        state.takers.retain(|(taker, _)| *taker != id);
        if let Ok(Some(value)) = self.receiver.try_recv() {
            if let Some(value) = state.deliver(value) {
                state.queue.push_front(value);
            }
        }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> From<ChannelConfig> for Channel<T> {
    fn from(config: ChannelConfig) -> Self {
        Self::with_config(config)
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Channel")
            .field("policy", &state.config.policy)
            .field("size", &state.config.size)
            .field("buffered", &state.queue.len())
            .field("takers", &state.takers.len())
            .field("closed", &state.closed)
            .finish()
    }
}
