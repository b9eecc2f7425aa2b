//! Async stream utilities for event delivery.
//!
//! The change observer hands normalized mutations to the runtime over an
//! [`EventSender`]/[`EventStream`] pair, and the runtime publishes its own
//! lifecycle events to any number of subscribers through an [`EventHub`].

use std::pin::Pin;

use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Type alias for a boxed async stream of events.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// A sender for events in an async stream.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> EventSender<T> {
    /// Create a new event sender from an mpsc sender.
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }

    /// Send an event, waiting for buffer space.
    ///
    /// Returns `Err(event)` if the receiver was dropped.
    pub async fn send(&self, event: T) -> Result<(), T> {
        self.tx.send(event).await.map_err(|e| e.0)
    }

    /// Try to send an event without waiting.
    ///
    /// Returns `Err(event)` if the channel is full or closed.
    pub fn try_send(&self, event: T) -> Result<(), T> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(v) => v,
            mpsc::error::TrySendError::Closed(v) => v,
        })
    }

    /// Check if the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Builder for creating event streams.
///
/// # Example
///
/// ```rust
/// use enliven::StreamBuilder;
///
/// # async fn example() {
/// let (sender, stream) = StreamBuilder::<u32>::new()
///     .buffer_size(16)
///     .build();
///
/// sender.send(7).await.unwrap();
/// # }
/// ```
pub struct StreamBuilder<T> {
    buffer_size: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Send + 'static> StreamBuilder<T> {
    /// Create a new stream builder with default settings.
    pub fn new() -> Self {
        Self {
            buffer_size: 100,
            _marker: std::marker::PhantomData,
        }
    }

    /// Set the buffer size for the underlying channel.
    ///
    /// Default is 100. Zero is bumped to one.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Build the stream and sender.
    pub fn build(self) -> (EventSender<T>, EventStream<T>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let sender = EventSender::new(tx);
        let stream: EventStream<T> = Box::pin(ReceiverStream::new(rx));
        (sender, stream)
    }
}

impl<T: Send + 'static> Default for StreamBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out publisher: every subscriber gets its own bounded stream.
///
/// Publishing never waits. A subscriber whose buffer is full misses the event
/// (logged); a subscriber that dropped its stream is forgotten.
#[derive(Debug)]
pub struct EventHub<T> {
    buffer_size: usize,
    subscribers: Mutex<Vec<EventSender<T>>>,
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Open a new subscription.
    pub fn subscribe(&self) -> EventStream<T> {
        let (sender, stream) = StreamBuilder::new().buffer_size(self.buffer_size).build();
        self.subscribers.lock().push(sender);
        stream
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.try_send(event.clone()).is_err() && !subscriber.is_closed() {
                tracing::warn!("event subscriber is lagging, dropping event");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.is_closed());
        subscribers.len()
    }
}
