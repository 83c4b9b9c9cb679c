//! Hand-off of end-of-stream notifications to the control thread
//!
//! Backend end syncs run on the audio thread. They never call subscribers
//! directly: the sync only sends a copyable [`EndToken`] over a bounded
//! channel, and the control loop notifies the subscribers behind each token
//! in [`MainThreadDispatcher::run_pending`]. Control-side jobs go through
//! the same loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Select, Sender, TrySendError};

use crate::backend::EndSyncCallback;

/// A job queued for the control thread
pub type Job = Box<dyn FnOnce() + Send>;

/// End notices that may wait for the control loop before new ones are dropped
pub const END_QUEUE_CAPACITY: usize = 1024;

/// Names the subscriber list an end sync reports to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndToken(u64);

type Targets = Mutex<HashMap<EndToken, Weak<Mutex<Subscribers>>>>;

/// Control-thread side of the job queue
pub struct MainThreadDispatcher {
    jobs: Receiver<Job>,
    ends: Receiver<EndToken>,
    handle: DispatchHandle,
}

impl Default for MainThreadDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MainThreadDispatcher {
    pub fn new() -> Self {
        let (job_tx, jobs) = unbounded();
        let (end_tx, ends) = bounded(END_QUEUE_CAPACITY);
        Self {
            jobs,
            ends,
            handle: DispatchHandle {
                jobs: job_tx,
                ends: end_tx,
                targets: Arc::new(Mutex::new(HashMap::new())),
                next_token: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    /// Sender side for other threads
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Run every job and end notice queued so far; returns how many ran
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(token) = self.ends.try_recv() {
            self.handle.notify_end(token);
            count += 1;
        }
        while let Ok(job) = self.jobs.try_recv() {
            job();
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for a job or end notice, then run everything queued
    pub fn run_timeout(&self, timeout: Duration) -> usize {
        let mut select = Select::new();
        select.recv(&self.ends);
        select.recv(&self.jobs);
        match select.ready_timeout(timeout) {
            Ok(_) => self.run_pending(),
            Err(_) => 0,
        }
    }

    /// Number of jobs and end notices waiting
    pub fn pending(&self) -> usize {
        self.jobs.len() + self.ends.len()
    }
}

/// Cloneable sender used from the audio thread
#[derive(Clone)]
pub struct DispatchHandle {
    jobs: Sender<Job>,
    ends: Sender<EndToken>,
    targets: Arc<Targets>,
    next_token: Arc<AtomicU64>,
}

impl DispatchHandle {
    /// Queue a job; returns false if the dispatcher is gone
    pub fn queue(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.jobs.send(Box::new(job)).is_ok()
    }

    /// Report an end of stream without allocating
    ///
    /// Returns false when the notice was dropped.
    pub fn send_end(&self, token: EndToken) -> bool {
        match self.ends.try_send(token) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn register(&self, subscribers: &Arc<Mutex<Subscribers>>) -> EndToken {
        let token = EndToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        targets.retain(|_, list| list.strong_count() > 0);
        targets.insert(token, Arc::downgrade(subscribers));
        token
    }

    fn notify_end(&self, token: EndToken) {
        let subscribers = self
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .and_then(Weak::upgrade);
        if let Some(subscribers) = subscribers {
            notify(&subscribers);
        }
    }
}

/// Subscriber callback for end-of-stream
pub type EndCallback = Arc<dyn Fn() + Send + Sync>;

/// Identifies a subscription for [`EndOfStream::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    list: Vec<(SubscriptionId, EndCallback)>,
}

/// End-of-stream subscriber list of one channel
///
/// The backend sync is registered once, on the first subscription; the
/// `registered` flag records that it happened.
#[derive(Default)]
pub struct EndOfStream {
    subscribers: Arc<Mutex<Subscribers>>,
    registered: bool,
}

impl EndOfStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: EndCallback) -> SubscriptionId {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(subs.next_id);
        subs.next_id += 1;
        subs.list.push((id, callback));
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subs.list.len();
        subs.list.retain(|(existing, _)| *existing != id);
        subs.list.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .len()
    }

    pub fn clear(&mut self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .clear();
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    /// Build the backend sync callback
    ///
    /// The callback runs on the audio thread and only sends this list's
    /// token. Subscribers present when the control loop picks the token up
    /// are notified.
    pub fn sync_callback(&self, dispatch: DispatchHandle) -> EndSyncCallback {
        let token = dispatch.register(&self.subscribers);
        Arc::new(move || {
            dispatch.send_end(token);
        })
    }
}

fn notify(subscribers: &Mutex<Subscribers>) {
    // Snapshot so subscribers may (un)subscribe while being notified
    let callbacks: Vec<EndCallback> = subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .list
        .iter()
        .map(|(_, callback)| callback.clone())
        .collect();
    for callback in callbacks {
        callback();
    }
}
