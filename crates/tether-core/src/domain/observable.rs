//! Push-stream primitives shared by the session store and the link.
//!
//! An [`Observable`] hands each subscriber a boxed [`Observer`]; fan-out is
//! done explicitly by [`SubscriberList`], which owns the observers and
//! isolates a failing callback from the others.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::domain::types::{SessionId, SubscriberId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriberError {
    #[error("Subscriber callback failed: {message}")]
    Callback { message: String },

    #[error("Subscriber fell more than {capacity} events behind")]
    Lagged { capacity: usize },

    #[error("Subscriber disconnected")]
    Disconnected,
}

impl SubscriberError {
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }
}

/// Terminal failure of a session stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error(transparent)]
    Subscriber(#[from] SubscriberError),

    #[error("Session {session_id} is no longer available")]
    SessionClosed { session_id: SessionId },
}

pub trait Observer<T, E>: Send + 'static {
    /// Returning an error detaches this observer; other observers are unaffected.
    fn on_next(&mut self, item: T) -> Result<(), SubscriberError>;

    fn on_error(&mut self, error: E);

    fn on_complete(&mut self);
}

pub trait Observable<T, E>: Send + Sync {
    fn subscribe(&self, observer: Box<dyn Observer<T, E>>) -> Unsubscribe;
}

/// Detaches one observer, explicitly or when dropped. Calling it more than
/// once, or after the stream already terminated, does nothing.
#[must_use = "dropping an Unsubscribe detaches the observer"]
pub struct Unsubscribe {
    terminated: Arc<AtomicBool>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    pub fn new(terminated: Arc<AtomicBool>, detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            terminated,
            detach: Some(Box::new(detach)),
        }
    }

    /// A handle for a stream that already terminated.
    pub fn noop() -> Self {
        Self {
            terminated: Arc::new(AtomicBool::new(true)),
            detach: None,
        }
    }

    pub fn unsubscribe(&mut self) {
        let Some(detach) = self.detach.take() else {
            return;
        };
        if !self.terminated.swap(true, Ordering::AcqRel) {
            detach();
        }
    }

    pub fn is_active(&self) -> bool {
        self.detach.is_some() && !self.terminated.load(Ordering::Acquire)
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.is_active())
            .finish()
    }
}

struct Entry<T, E> {
    id: SubscriberId,
    observer: Box<dyn Observer<T, E>>,
    terminated: Arc<AtomicBool>,
}

/// Explicit subscriber list with manual, in-order fan-out.
pub struct SubscriberList<T, E> {
    entries: Vec<Entry<T, E>>,
}

impl<T, E> Default for SubscriberList<T, E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T, E> SubscriberList<T, E>
where
    T: Clone + 'static,
    E: Clone + From<SubscriberError> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Adds an observer. An observer already registered under `id` is
    /// completed and replaced.
    pub fn attach(
        &mut self,
        id: SubscriberId,
        observer: Box<dyn Observer<T, E>>,
        terminated: Arc<AtomicBool>,
    ) {
        self.complete(id);
        self.entries.push(Entry {
            id,
            observer,
            terminated,
        });
    }

    /// Removes an observer without invoking any of its callbacks.
    pub fn detach(&mut self, id: SubscriberId) -> bool {
        match self.position(id) {
            Some(index) => {
                let entry = self.entries.remove(index);
                entry.terminated.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Removes the observer under `id` only if it is the attachment that
    /// owns `attachment`. A later attachment reusing the id is left alone.
    pub fn detach_attachment(&mut self, id: SubscriberId, attachment: &Arc<AtomicBool>) -> bool {
        match self.position(id) {
            Some(index) if Arc::ptr_eq(&self.entries[index].terminated, attachment) => {
                self.detach(id)
            }
            _ => false,
        }
    }

    /// Delivers `item` to one subscriber. Returns the failure if the
    /// subscriber was dropped because of it.
    pub fn send_to(&mut self, id: SubscriberId, item: T) -> Option<SubscriberError> {
        let index = self.position(id)?;
        let result = deliver(self.entries[index].observer.as_mut(), item);
        match result {
            Ok(()) => None,
            Err(error) => {
                self.fail_at(index, error.clone());
                Some(error)
            }
        }
    }

    /// Delivers `item` to every subscriber in attach order. Subscribers whose
    /// callback fails are removed and receive `on_error`; the rest still get
    /// the item.
    pub fn publish(&mut self, item: &T) -> Vec<(SubscriberId, SubscriberError)> {
        let mut failures = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            match deliver(self.entries[index].observer.as_mut(), item.clone()) {
                Ok(()) => index += 1,
                Err(error) => {
                    failures.push((self.entries[index].id, error.clone()));
                    self.fail_at(index, error);
                }
            }
        }
        failures
    }

    pub fn complete(&mut self, id: SubscriberId) -> bool {
        match self.position(id) {
            Some(index) => {
                let mut entry = self.entries.remove(index);
                entry.terminated.store(true, Ordering::Release);
                entry.observer.on_complete();
                true
            }
            None => false,
        }
    }

    pub fn complete_all(&mut self) {
        for mut entry in self.entries.drain(..) {
            entry.terminated.store(true, Ordering::Release);
            entry.observer.on_complete();
        }
    }

    pub fn error_all(&mut self, error: &E) {
        for mut entry in self.entries.drain(..) {
            entry.terminated.store(true, Ordering::Release);
            entry.observer.on_error(error.clone());
        }
    }

    fn position(&self, id: SubscriberId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    fn fail_at(&mut self, index: usize, error: SubscriberError) {
        let mut entry = self.entries.remove(index);
        entry.terminated.store(true, Ordering::Release);
        entry.observer.on_error(E::from(error));
    }
}

fn deliver<T: 'static, E: 'static>(observer: &mut dyn Observer<T, E>, item: T) -> Result<(), SubscriberError> {
    match catch_unwind(AssertUnwindSafe(|| observer.on_next(item))) {
        Ok(result) => result,
        Err(payload) => Err(SubscriberError::callback(panic_message(payload.as_ref()))),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Observer built from closures.
pub struct FnObserver<T, E> {
    on_next: Box<dyn FnMut(T) -> Result<(), SubscriberError> + Send>,
    on_error: Box<dyn FnMut(E) + Send>,
    on_complete: Box<dyn FnMut() + Send>,
}

impl<T, E> FnObserver<T, E> {
    pub fn new(on_next: impl FnMut(T) -> Result<(), SubscriberError> + Send + 'static) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error: Box::new(|_| {}),
            on_complete: Box::new(|| {}),
        }
    }

    pub fn on_error(mut self, on_error: impl FnMut(E) + Send + 'static) -> Self {
        self.on_error = Box::new(on_error);
        self
    }

    pub fn on_complete(mut self, on_complete: impl FnMut() + Send + 'static) -> Self {
        self.on_complete = Box::new(on_complete);
        self
    }
}

impl<T: 'static, E: 'static> Observer<T, E> for FnObserver<T, E> {
    fn on_next(&mut self, item: T) -> Result<(), SubscriberError> {
        (self.on_next)(item)
    }

    fn on_error(&mut self, error: E) {
        (self.on_error)(error);
    }

    fn on_complete(&mut self) {
        (self.on_complete)();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<T, E> {
    Next(T),
    Error(E),
    Complete,
}

enum Terminal<E> {
    Error(E),
    Complete,
}

/// Items a lagging channel consumer may skip.
///
/// When a [`ChannelObserver`]'s buffer is full, newer items wait in an
/// overflow queue; an item that supersedes a queued one replaces it there.
pub trait Coalesce {
    /// Whether `self` carries everything `older` did.
    fn supersedes(&self, older: &Self) -> bool;
}

type Overflow<T> = Arc<Mutex<VecDeque<T>>>;

fn lock<T>(overflow: &Overflow<T>) -> MutexGuard<'_, VecDeque<T>> {
    overflow.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observer that forwards into a bounded channel.
///
/// A consumer that falls behind keeps receiving items in order: once the
/// buffer is full, items are coalesced into an overflow queue of at most
/// `capacity` entries. Only when that queue is also full is the observer
/// detached with [`SubscriberError::Lagged`].
pub struct ChannelObserver<T, E> {
    tx: mpsc::Sender<T>,
    overflow: Overflow<T>,
    terminal: Option<oneshot::Sender<Terminal<E>>>,
    capacity: usize,
}

/// Receiving half of [`channel_observer`].
pub struct NotificationStream<T, E> {
    rx: mpsc::Receiver<T>,
    overflow: Overflow<T>,
    terminal: Option<oneshot::Receiver<Terminal<E>>>,
}

pub fn channel_observer<T, E>(capacity: usize) -> (ChannelObserver<T, E>, NotificationStream<T, E>)
where
    T: Coalesce,
{
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let (terminal_tx, terminal_rx) = oneshot::channel();
    let overflow = Overflow::default();
    (
        ChannelObserver {
            tx,
            overflow: overflow.clone(),
            terminal: Some(terminal_tx),
            capacity,
        },
        NotificationStream {
            rx,
            overflow,
            terminal: Some(terminal_rx),
        },
    )
}

impl<T, E> Observer<T, E> for ChannelObserver<T, E>
where
    T: Coalesce + Send + 'static,
    E: Send + 'static,
{
    fn on_next(&mut self, item: T) -> Result<(), SubscriberError> {
        let mut overflow = lock(&self.overflow);
        if self.tx.is_closed() {
            return Err(SubscriberError::Disconnected);
        }

        // Items already waiting in the overflow queue go out first.
        let item = if overflow.is_empty() {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(SubscriberError::Disconnected);
                }
                Err(mpsc::error::TrySendError::Full(item)) => {
                    tracing::debug!(
                        target: "tether::subscriber",
                        capacity = self.capacity,
                        "Subscriber lagging, coalescing updates"
                    );
                    item
                }
            }
        } else {
            item
        };

        // A superseding item takes the place of the first item it replaces.
        let first = overflow.iter().position(|older| item.supersedes(older));
        overflow.retain(|older| !item.supersedes(older));
        if overflow.len() >= self.capacity {
            return Err(SubscriberError::Lagged {
                capacity: self.capacity,
            });
        }
        match first {
            Some(index) => overflow.insert(index, item),
            None => overflow.push_back(item),
        }
        Ok(())
    }

    fn on_error(&mut self, error: E) {
        if let Some(terminal) = self.terminal.take() {
            let _ = terminal.send(Terminal::Error(error));
        }
    }

    fn on_complete(&mut self) {
        if let Some(terminal) = self.terminal.take() {
            let _ = terminal.send(Terminal::Complete);
        }
    }
}

impl<T, E> NotificationStream<T, E> {
    /// Next notification. Buffered items are drained before the terminal
    /// notification; `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<Notification<T, E>> {
        if let Some(item) = self.try_next() {
            return Some(Notification::Next(item));
        }
        // The overflow queue only fills behind a full buffer, so waiting on
        // the buffer cannot miss it.
        if let Some(item) = self.rx.recv().await {
            return Some(Notification::Next(item));
        }
        let overflowed = lock(&self.overflow).pop_front();
        if let Some(item) = overflowed {
            return Some(Notification::Next(item));
        }
        let terminal = self.terminal.take()?;
        match terminal.await {
            Ok(Terminal::Error(error)) => Some(Notification::Error(error)),
            Ok(Terminal::Complete) => Some(Notification::Complete),
            // Detached without a terminal callback.
            Err(_) => None,
        }
    }

    fn try_next(&mut self) -> Option<T> {
        let mut overflow = lock(&self.overflow);
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(_) => overflow.pop_front(),
        }
    }

    /// Collects items until the stream terminates.
    pub async fn collect(mut self) -> (Vec<T>, Option<E>) {
        let mut items = Vec::new();
        while let Some(notification) = self.next().await {
            match notification {
                Notification::Next(item) => items.push(item),
                Notification::Error(error) => return (items, Some(error)),
                Notification::Complete => break,
            }
        }
        (items, None)
    }
}
