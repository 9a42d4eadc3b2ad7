//! Connection lifecycle for one broker session.
//!
//! A [`Connection`] owns at most one live [`BrokerSession`] at a time and a supervisor
//! task that (re)establishes it within a bounded retry budget. Its lifecycle is
//! published two ways:
//!
//! - a `watch` channel carrying the current [`ConnectionState`], used internally to
//!   gate commands and to cancel blocking pops on close;
//! - a `broadcast` channel of [`ConnectionEvent`]s (`Ready`, `Error`,
//!   `Disconnecting`, `Cutted`) for any number of observers. Observers must
//!   subscribe before [`Connection::start`] to see the first `Ready`.
//!
//! Work that must finish before the session is torn down holds a [`WorkLease`].
//! `close(drain = true)` waits for every lease; `close(drain = false)` does not.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::infra::broker::{Broker, BrokerError, BrokerSession};
use crate::runtime::Spawn;

const EVENT_CAPACITY: usize = 64;

/// Bounded exponential backoff for (re)connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reconnection attempts after an unexpected loss before the cut is final.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, supervisor not started.
    Idle,
    /// First connection attempt in progress.
    Connecting,
    /// Session established; commands are accepted.
    Ready,
    /// Session lost unexpectedly; retrying within the budget.
    Reconnecting,
    /// Close requested; no new fetches are issued.
    Closing {
        /// Whether outstanding leases are awaited before teardown.
        drain: bool,
    },
    /// Terminal. No further `Ready` will follow.
    Closed,
}

impl ConnectionState {
    /// Whether a close was requested or the connection is already closed.
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(self, Self::Closing { .. } | Self::Closed)
    }
}

/// Signals published by a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Session established. Emitted once per successful (re)connection.
    Ready,
    /// Non-fatal error, e.g. a failed connect attempt.
    Error(BrokerError),
    /// Session dropped unexpectedly; recovery follows if the budget allows.
    Disconnecting(BrokerError),
    /// Session stopped. With `is_final` no further `Ready` will ever follow.
    Cutted {
        /// Whether the connection is permanently gone.
        is_final: bool,
    },
}

#[derive(Default)]
struct LeaseCount {
    active: usize,
    /// Pops in flight against the broker. One may complete with a job at any time.
    pending: usize,
    sealed: bool,
}

#[derive(Default)]
struct LeaseBook {
    count: Mutex<LeaseCount>,
    returned: Notify,
}

impl LeaseBook {
    fn acquire(self: &Arc<Self>) -> Option<WorkLease> {
        let mut count = self.count.lock();
        if count.sealed {
            return None;
        }
        count.active += 1;
        Some(WorkLease {
            book: Arc::clone(self),
        })
    }

    /// Register a pop in flight. `None` once the book is sealed.
    fn begin_pop(self: &Arc<Self>) -> Option<PendingPop> {
        let mut count = self.count.lock();
        if count.sealed {
            return None;
        }
        count.pending += 1;
        Some(PendingPop {
            book: Arc::clone(self),
        })
    }

    /// Turn a completed pop into a lease. Never refused while the pop is pending.
    fn lease_popped(self: &Arc<Self>, pending: PendingPop) -> WorkLease {
        self.count.lock().active += 1;
        drop(pending);
        WorkLease {
            book: Arc::clone(self),
        }
    }

    fn seal(&self) {
        self.count.lock().sealed = true;
    }

    fn active(&self) -> usize {
        self.count.lock().active
    }

    /// Wait until no lease or pop is outstanding, then refuse new ones.
    async fn drained(&self) {
        loop {
            let returned = self.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();
            {
                let mut count = self.count.lock();
                if count.active == 0 && count.pending == 0 {
                    count.sealed = true;
                    return;
                }
            }
            returned.await;
        }
    }
}

/// A pop the broker may still answer with a job.
struct PendingPop {
    book: Arc<LeaseBook>,
}

impl Drop for PendingPop {
    fn drop(&mut self) {
        {
            let mut count = self.book.count.lock();
            count.pending = count.pending.saturating_sub(1);
        }
        self.book.returned.notify_waiters();
    }
}

/// Keeps a connection open under a draining close until dropped.
pub struct WorkLease {
    book: Arc<LeaseBook>,
}

impl fmt::Debug for WorkLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkLease").finish_non_exhaustive()
    }
}

impl Drop for WorkLease {
    fn drop(&mut self) {
        {
            let mut count = self.book.count.lock();
            count.active = count.active.saturating_sub(1);
        }
        self.book.returned.notify_waiters();
    }
}

/// One supervised broker session.
pub struct Connection<B: Broker> {
    id: Uuid,
    name: String,
    broker: B,
    retry: RetryPolicy,
    session: RwLock<Option<Arc<B::Session>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    leases: Arc<LeaseBook>,
    /// Poked when a command on the current session reports the transport gone.
    lost: Notify,
    started: AtomicBool,
}

impl<B: Broker> Connection<B> {
    /// Create an idle connection. Nothing touches the network until [`Self::start`].
    pub fn new(name: impl Into<String>, broker: B, retry: RetryPolicy) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            broker,
            retry,
            session: RwLock::new(None),
            state,
            events,
            leases: Arc::new(LeaseBook::default()),
            lost: Notify::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Unique identity of this connection.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Name used in logs and passed to the broker.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the session is established and no close was requested.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether the connection reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of outstanding work leases.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.leases.active()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Spawn the supervisor. Calling this more than once has no effect.
    pub fn start<S: Spawn>(self: &Arc<Self>, spawner: &S) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        spawner.spawn(Arc::clone(self).supervise());
    }

    /// Append `payloads` to the tail of `key`.
    ///
    /// # Errors
    ///
    /// Fails with [`BrokerError::Closed`] once a close was requested, or with the
    /// session's error if the command fails.
    pub async fn push(&self, key: &str, payloads: &[String]) -> Result<(), BrokerError> {
        let _lease = self.leases.acquire().ok_or(BrokerError::Closed)?;
        let session = self.session().await?;
        session
            .push(key, payloads)
            .await
            .map_err(|err| self.observe(&session, err))
    }

    /// Length of the list at `key`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::push`].
    pub async fn len(&self, key: &str) -> Result<u64, BrokerError> {
        let _lease = self.leases.acquire().ok_or(BrokerError::Closed)?;
        let session = self.session().await?;
        session
            .len(key)
            .await
            .map_err(|err| self.observe(&session, err))
    }

    /// Blocking pop from the head of `key`.
    ///
    /// A received job comes with a [`WorkLease`] that keeps a draining close
    /// waiting until it is dropped. Completes with `Ok(None)` when the pop timed
    /// out or the connection started closing before a job arrived.
    ///
    /// # Errors
    ///
    /// Returns the session's error when the pop fails while the connection is open.
    pub async fn pop(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<(String, WorkLease)>, BrokerError> {
        let Some(pending) = self.leases.begin_pop() else {
            return Ok(None);
        };
        let mut state = self.state.subscribe();
        let session = match self.session().await {
            Ok(session) => session,
            Err(_) if self.state().is_closing() => return Ok(None),
            Err(err) => return Err(err),
        };
        tokio::select! {
            biased;
            popped = session.pop(key, timeout) => match popped {
                Ok(Some(payload)) => Ok(Some((payload, self.leases.lease_popped(pending)))),
                Ok(None) => Ok(None),
                Err(_) if self.state().is_closing() => Ok(None),
                Err(err) => Err(self.observe(&session, err)),
            },
            _ = state.wait_for(|s| s.is_closing()) => Ok(None),
        }
    }

    /// Stop the connection and resolve once it is closed.
    ///
    /// With `drain`, new fetches stop, idle blocking pops are cancelled, and the
    /// session stays up until every [`WorkLease`] is returned. Without it the
    /// session is torn down immediately. Safe to call any number of times.
    pub async fn close(&self, drain: bool) {
        if !self.transition(|s| !s.is_closing(), ConnectionState::Closing { drain }) {
            self.wait_closed().await;
            return;
        }
        info!(connection = %self.name, drain, leases = self.leases.active(), "closing connection");
        if drain {
            self.leases.drained().await;
        } else {
            self.leases.seal();
        }
        let session = self.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.state.send_replace(ConnectionState::Closed);
        info!(connection = %self.name, "connection closed");
        self.emit(ConnectionEvent::Cutted { is_final: true });
    }

    /// Resolve once the connection is closed, by request or by exhausted retries.
    pub async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    async fn session(&self) -> Result<Arc<B::Session>, BrokerError> {
        let mut state = self.state.subscribe();
        loop {
            let current = match state
                .wait_for(|s| *s == ConnectionState::Ready || s.is_closing())
                .await
            {
                Ok(current) => *current,
                Err(_) => return Err(BrokerError::Closed),
            };
            if current != ConnectionState::Ready {
                return Err(BrokerError::Closed);
            }
            let session = self.session.read().clone();
            if let Some(session) = session {
                return Ok(session);
            }
            // A command saw the transport drop; wait for the supervisor to react.
            if state.changed().await.is_err() {
                return Err(BrokerError::Closed);
            }
        }
    }

    /// Retire the current session if `err` shows its transport is gone.
    fn observe(&self, session: &Arc<B::Session>, err: BrokerError) -> BrokerError {
        if err.is_connection_lost() {
            let retired = {
                let mut slot = self.session.write();
                let current = slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session));
                if current {
                    *slot = None;
                }
                current
            };
            if retired {
                debug!(connection = %self.name, error = %err, "command observed connection loss");
                self.lost.notify_waiters();
            }
        }
        err
    }

    fn transition(&self, allowed: impl Fn(ConnectionState) -> bool, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if allowed(*state) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Terminal cut after the retry budget ran out.
    fn cut(&self) {
        if self.transition(|s| !s.is_closing(), ConnectionState::Closed) {
            self.leases.seal();
            warn!(connection = %self.name, max_retries = self.retry.max_retries, "connection cut for good");
            self.emit(ConnectionEvent::Cutted { is_final: true });
        }
    }

    async fn supervise(self: Arc<Self>) {
        if !self.transition(|s| s == ConnectionState::Idle, ConnectionState::Connecting) {
            return;
        }
        info!(connection = %self.name, id = %self.id, broker = %self.broker.describe(), "connecting");
        let mut attempts = self.retry.max_retries.saturating_add(1);
        loop {
            let Some(session) = self.establish(attempts).await else {
                return;
            };
            let session = Arc::new(session);
            // Registered before any command can see the session.
            let lost = self.lost.notified();
            tokio::pin!(lost);
            lost.as_mut().enable();
            *self.session.write() = Some(Arc::clone(&session));
            if !self.transition(
                |s| matches!(s, ConnectionState::Connecting | ConnectionState::Reconnecting),
                ConnectionState::Ready,
            ) {
                // close() won the race; make sure the fresh session does not leak.
                let orphan = self.session.write().take();
                if let Some(orphan) = orphan {
                    orphan.close().await;
                }
                return;
            }
            info!(connection = %self.name, "connection ready");
            self.emit(ConnectionEvent::Ready);

            let mut state = self.state.subscribe();
            let cause = tokio::select! {
                cause = session.disconnected() => cause,
                () = &mut lost => {
                    BrokerError::ConnectionLost("command observed connection loss".into())
                }
                _ = state.wait_for(|s| s.is_closing()) => return,
            };
            if !self.transition(|s| s == ConnectionState::Ready, ConnectionState::Reconnecting) {
                return;
            }
            self.session.write().take();
            session.close().await;
            warn!(connection = %self.name, error = %cause, "connection lost");
            self.emit(ConnectionEvent::Disconnecting(cause));
            if self.retry.max_retries == 0 {
                self.cut();
                return;
            }
            self.emit(ConnectionEvent::Cutted { is_final: false });
            attempts = self.retry.max_retries;
        }
    }

    async fn establish(&self, attempts: u32) -> Option<B::Session> {
        let mut state = self.state.subscribe();
        for attempt in 0..attempts {
            if self.state().is_closing() {
                return None;
            }
            if attempt > 0 {
                let delay = self.retry.delay_for(attempt - 1);
                debug!(connection = %self.name, attempt, ?delay, "retrying connect");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = state.wait_for(|s| s.is_closing()) => return None,
                }
            }
            let connected = tokio::select! {
                connected = self.broker.connect(&self.name) => connected,
                _ = state.wait_for(|s| s.is_closing()) => return None,
            };
            match connected {
                Ok(session) => return Some(session),
                Err(err) => {
                    warn!(connection = %self.name, attempt = attempt + 1, error = %err, "connect attempt failed");
                    self.emit(ConnectionEvent::Error(err));
                }
            }
        }
        self.cut();
        None
    }
}
