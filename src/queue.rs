//! Handler queues and once-signals.
//!
//! `HandlerQueue` turns push-style event sources (socket reads, accepted
//! connections, data-channel frames) into pull-style awaitable streams with a
//! pluggable consumer. It is the single concurrency adapter the rest of the
//! relay builds on. `Signal` is the companion one-shot lifecycle signal
//! (`once_connected`, `once_closed`, ...): fulfilled at most once, observable
//! by any number of waiters.

use std::collections::VecDeque;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::error::{Error, Result};

type SyncHandler<T, R> = Box<dyn FnMut(T) -> R + Send>;
type OnceHandler<T, R> = Box<dyn FnOnce(T) -> R + Send>;

enum HandlerKind<T, R> {
    /// No handler installed; items accumulate.
    None,
    /// Permanent synchronous handler.
    Sync(SyncHandler<T, R>),
    /// One-shot handler; consumes exactly the next item, then uninstalls.
    /// The waiter receives the handler's result.
    Once {
        f: OnceHandler<T, R>,
        waiter: oneshot::Sender<Result<R>>,
    },
    /// A handler has been taken out for a dispatch in progress.
    Busy,
}

struct Inner<T, R> {
    queue: VecDeque<(T, oneshot::Sender<R>)>,
    handler: HandlerKind<T, R>,
    dispatching: bool,
}

/// Buffered single-consumer FIFO coupled to a pluggable handler.
///
/// Items offered through [`handle`](Self::handle) are delivered in enqueue
/// order. With no handler installed they accumulate; installing a permanent
/// handler drains the backlog in order before any later item is observed.
/// The queue is single-consumer: installing a handler while one is installed
/// is a misuse and is rejected.
///
/// Handlers run outside the queue lock, so a handler may feed items back into
/// the same queue without deadlocking; re-entrant items are processed after
/// the current one, preserving order.
pub struct HandlerQueue<T, R> {
    inner: Mutex<Inner<T, R>>,
}

impl<T, R> Default for HandlerQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> HandlerQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Create an empty queue with no handler installed.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                handler: HandlerKind::None,
                dispatching: false,
            }),
        }
    }

    /// Enqueue an item; the returned future completes with the result of the
    /// handler that eventually processes it.
    ///
    /// The item is enqueued before this returns, so the future may be dropped
    /// by fire-and-forget producers without losing the item.
    pub fn handle(&self, item: T) -> impl Future<Output = Result<R>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().queue.push_back((item, tx));
        self.drain();
        async move { rx.await.map_err(|_| Error::QueueCleared) }
    }

    /// Install a permanent synchronous handler.
    ///
    /// Any backlog is drained, in order, before this returns. Fails with
    /// [`Error::HandlerInstalled`] if a handler is already installed.
    pub fn set_sync_handler<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(T) -> R + Send + 'static,
    {
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.handler, HandlerKind::None) {
                return Err(Error::HandlerInstalled);
            }
            inner.handler = HandlerKind::Sync(Box::new(f));
        }
        self.drain();
        Ok(())
    }

    /// Install a one-shot handler for exactly the next item (queued, or the
    /// first to arrive) and return its result.
    ///
    /// Detaching the handler with [`stop_handling`](Self::stop_handling) or
    /// clearing the queue before an item arrives fails the returned future.
    pub fn set_sync_next_handler<F>(&self, f: F) -> impl Future<Output = Result<R>>
    where
        F: FnOnce(T) -> R + Send + 'static,
    {
        let rx = {
            let mut inner = self.inner.lock();
            if !matches!(inner.handler, HandlerKind::None) {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.handler = HandlerKind::Once {
                    f: Box::new(f),
                    waiter: tx,
                };
                Some(rx)
            }
        };
        if rx.is_some() {
            self.drain();
        }
        async move {
            match rx {
                None => Err(Error::HandlerInstalled),
                Some(rx) => rx.await.map_err(|_| Error::QueueCleared)?,
            }
        }
    }

    /// Detach any installed handler; subsequent items queue.
    ///
    /// A pending one-shot handler's future fails with
    /// [`Error::QueueCleared`].
    pub fn stop_handling(&self) {
        // If a dispatch is in progress its taken-out handler finishes the
        // current item; clearing the slot prevents it from being reinstalled.
        self.inner.lock().handler = HandlerKind::None;
    }

    /// Drop all queued items, failing their pending futures.
    pub fn clear(&self) {
        self.inner.lock().queue.clear();
    }

    /// Number of items waiting for a handler.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Deliver queued items to the installed handler, one at a time, running
    /// the handler outside the lock. Re-entrant calls (a handler feeding the
    /// same queue) bail out on `dispatching` and leave the work to the outer
    /// invocation, which loops until the queue is empty again.
    fn drain(&self) {
        loop {
            enum Job<T, R> {
                Sync(SyncHandler<T, R>, T, oneshot::Sender<R>),
                Once(OnceHandler<T, R>, oneshot::Sender<Result<R>>, T, oneshot::Sender<R>),
            }

            let job = {
                let mut inner = self.inner.lock();
                if inner.dispatching {
                    return;
                }
                let handler = match std::mem::replace(&mut inner.handler, HandlerKind::Busy) {
                    HandlerKind::None => {
                        inner.handler = HandlerKind::None;
                        return;
                    }
                    HandlerKind::Busy => return,
                    taken => taken,
                };
                match inner.queue.pop_front() {
                    None => {
                        inner.handler = handler;
                        return;
                    }
                    Some((item, tx)) => {
                        inner.dispatching = true;
                        match handler {
                            HandlerKind::Sync(f) => Job::Sync(f, item, tx),
                            HandlerKind::Once { f, waiter } => Job::Once(f, waiter, item, tx),
                            // Sync or Once by the match above.
                            HandlerKind::None | HandlerKind::Busy => return,
                        }
                    }
                }
            };

            match job {
                Job::Sync(mut f, item, tx) => {
                    let r = f(item);
                    let _ = tx.send(r);
                    let mut inner = self.inner.lock();
                    inner.dispatching = false;
                    // Reinstall unless the handler was detached mid-dispatch.
                    if matches!(inner.handler, HandlerKind::Busy) {
                        inner.handler = HandlerKind::Sync(f);
                    }
                }
                Job::Once(f, waiter, item, tx) => {
                    let r = f(item);
                    let _ = tx.send(r.clone());
                    let _ = waiter.send(Ok(r));
                    let mut inner = self.inner.lock();
                    inner.dispatching = false;
                    if matches!(inner.handler, HandlerKind::Busy) {
                        inner.handler = HandlerKind::None;
                    }
                }
            }
        }
    }
}

/// A lifecycle signal: fulfilled at most once, awaitable by any number of
/// tasks, observable after the fact.
pub struct Signal<T: Clone> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Signal<T> {
    /// Create an unfulfilled signal.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Fulfill the signal. Returns `false` (and changes nothing) if it was
    /// already fulfilled.
    pub fn fulfill(&self, value: T) -> bool {
        {
            let mut slot = self.value.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
        true
    }

    /// Wait until the signal is fulfilled and return its value.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(v) = self.peek() {
                return v;
            }
            notified.await;
        }
    }

    /// The fulfilled value, if any.
    pub fn peek(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// Whether the signal has been fulfilled.
    pub fn is_fulfilled(&self) -> bool {
        self.value.lock().is_some()
    }
}
