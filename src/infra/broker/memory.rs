//! In-memory broker for development and testing.
//!
//! Lists live in process memory and are shared by every session opened from clones
//! of the same [`InMemoryBroker`]. The broker also exposes fault-injection controls
//! (going offline, severing named sessions, failing commands) so connection
//! recovery paths can be exercised without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use super::{Broker, BrokerError, BrokerSession};

/// Process-local broker storing lists in a `HashMap<String, VecDeque<String>>`.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<StoreState>,
    /// Woken on every push so blocked pops re-check their list.
    pushed: Notify,
    sessions_opened: AtomicU64,
}

#[derive(Default)]
struct StoreState {
    lists: HashMap<String, VecDeque<String>>,
    offline: bool,
    failing_commands: usize,
    sessions: HashMap<u64, Arc<SessionLink>>,
    next_session: u64,
}

struct SessionLink {
    id: u64,
    name: String,
    lost: watch::Sender<Option<BrokerError>>,
}

impl SessionLink {
    fn cut(&self, err: BrokerError) -> bool {
        self.lost.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(err);
                true
            } else {
                false
            }
        })
    }

    fn check(&self) -> Result<(), BrokerError> {
        self.lost.borrow().clone().map_or(Ok(()), Err)
    }

    fn is_live(&self) -> bool {
        self.lost.borrow().is_none()
    }

    async fn wait_lost(&self) -> BrokerError {
        let mut rx = self.lost.subscribe();
        let lost = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(BrokerError::Closed),
            Err(_) => BrokerError::Closed,
        };
        lost
    }
}

impl InMemoryBroker {
    /// Create an empty, online broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live session and refuse new connections until [`Self::go_online`].
    pub fn go_offline(&self) {
        let mut state = self.shared.state.lock();
        state.offline = true;
        for link in state.sessions.values() {
            link.cut(BrokerError::ConnectionLost("broker offline".into()));
        }
        tracing::debug!(sessions = state.sessions.len(), "in-memory broker went offline");
    }

    /// Accept connections again.
    pub fn go_online(&self) {
        self.shared.state.lock().offline = false;
        tracing::debug!("in-memory broker back online");
    }

    /// Cut every live session opened under `name`. Returns how many were cut.
    pub fn sever(&self, name: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .sessions
            .values()
            .filter(|link| link.name == name)
            .filter(|link| link.cut(BrokerError::ConnectionLost(format!("session `{name}` severed"))))
            .count()
    }

    /// Make the next `count` commands (from any session) fail with a command error.
    pub fn fail_next_commands(&self, count: usize) {
        self.shared.state.lock().failing_commands = count;
    }

    /// Append a raw payload without encoding, e.g. to plant malformed jobs.
    pub fn push_raw(&self, key: &str, payload: impl Into<String>) {
        self.shared
            .state
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(payload.into());
        self.shared.pushed.notify_waiters();
    }

    /// Number of payloads stored under `key`.
    #[must_use]
    pub fn len_of(&self, key: &str) -> usize {
        self.shared
            .state
            .lock()
            .lists
            .get(key)
            .map_or(0, VecDeque::len)
    }

    /// Number of sessions that are open and not lost.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.shared
            .state
            .lock()
            .sessions
            .values()
            .filter(|link| link.is_live())
            .count()
    }

    /// Total sessions ever opened against this broker.
    #[must_use]
    pub fn sessions_opened(&self) -> u64 {
        self.shared.sessions_opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Session = InMemorySession;

    async fn connect(&self, name: &str) -> Result<Self::Session, BrokerError> {
        let link = {
            let mut state = self.shared.state.lock();
            if state.offline {
                return Err(BrokerError::ConnectionLost("broker offline".into()));
            }
            state.next_session += 1;
            let (lost, _) = watch::channel(None);
            let link = Arc::new(SessionLink {
                id: state.next_session,
                name: name.to_string(),
                lost,
            });
            state.sessions.insert(link.id, Arc::clone(&link));
            link
        };
        self.shared.sessions_opened.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(session = link.id, name, "in-memory session opened");
        Ok(InMemorySession {
            link,
            shared: Arc::clone(&self.shared),
        })
    }

    fn describe(&self) -> String {
        "memory://".into()
    }
}

/// Session against an [`InMemoryBroker`].
pub struct InMemorySession {
    link: Arc<SessionLink>,
    shared: Arc<Shared>,
}

impl InMemorySession {
    fn begin_command(&self) -> Result<(), BrokerError> {
        self.link.check()?;
        let mut state = self.shared.state.lock();
        if state.failing_commands > 0 {
            state.failing_commands -= 1;
            return Err(BrokerError::Command("injected failure".into()));
        }
        Ok(())
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn push(&self, key: &str, payloads: &[String]) -> Result<(), BrokerError> {
        self.begin_command()?;
        {
            let mut state = self.shared.state.lock();
            state
                .lists
                .entry(key.to_string())
                .or_default()
                .extend(payloads.iter().cloned());
        }
        self.shared.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&self, key: &str, timeout: Option<Duration>) -> Result<Option<String>, BrokerError> {
        self.begin_command()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.link.check()?;
            let popped = {
                let mut state = self.shared.state.lock();
                state.lists.get_mut(key).and_then(VecDeque::pop_front)
            };
            if popped.is_some() {
                return Ok(popped);
            }

            tokio::select! {
                () = &mut notified => {}
                err = self.link.wait_lost() => return Err(err),
                () = deadline_elapsed(deadline) => return Ok(None),
            }
        }
    }

    async fn len(&self, key: &str) -> Result<u64, BrokerError> {
        self.begin_command()?;
        let len = {
            let state = self.shared.state.lock();
            state.lists.get(key).map_or(0, VecDeque::len)
        };
        Ok(len as u64)
    }

    async fn disconnected(&self) -> BrokerError {
        self.link.wait_lost().await
    }

    async fn close(&self) {
        self.link.cut(BrokerError::Closed);
        self.shared.state.lock().sessions.remove(&self.link.id);
        tracing::trace!(session = self.link.id, "in-memory session closed");
    }
}
