//! Per-tunnel session state and the registry that maps tokens to it.
//!
//! A [`Session`] is one side's half of a tunnel: an inbound queue (bytes
//! from the peer), an outbound queue (bytes for the peer) and a
//! closed-signal. Client and server each keep their own [`SessionRegistry`];
//! the two halves of a tunnel never share memory.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_lock::Mutex;
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DeliveryError, TokenError},
    token::Token,
};

/// Capacity of each direction's chunk queue.
const QUEUE_CAPACITY: usize = 128;

/// One side's half of a tunnel.
///
/// Clones share the same queues and closed-signal.
#[derive(Debug, Clone)]
pub struct Session {
    inbound_tx: async_channel::Sender<Bytes>,
    inbound_rx: async_channel::Receiver<Bytes>,
    outbound_tx: async_channel::Sender<Bytes>,
    outbound_rx: async_channel::Receiver<Bytes>,
    closed: CancellationToken,
}

impl Session {
    /// Create an open session with empty queues.
    #[must_use]
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = async_channel::bounded(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = async_channel::bounded(QUEUE_CAPACITY);

        Self {
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            closed: CancellationToken::new(),
        }
    }

    /// Hand a chunk received from the peer to the inbound queue.
    ///
    /// Waits at most `watchdog` for queue space.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Closed`] if the session is (or becomes)
    /// closed, and [`DeliveryError::TimedOut`] if the queue stays full for
    /// the whole watchdog period.
    pub async fn deliver_inbound(
        &self,
        chunk: Bytes,
        watchdog: Duration,
    ) -> Result<(), DeliveryError> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(DeliveryError::Closed),
            sent = self.inbound_tx.send(chunk) => sent.map_err(|_| DeliveryError::Closed),
            () = tokio::time::sleep(watchdog) => Err(DeliveryError::TimedOut),
        }
    }

    /// Take the next chunk destined for the peer.
    ///
    /// Chunks queued before a close are still returned; `None` means the
    /// session is closed and the queue is drained.
    pub async fn pull_outbound(&self) -> Option<Bytes> {
        self.outbound_rx.recv().await.ok()
    }

    /// Set the closed-signal and close both queues.
    ///
    /// Idempotent. Every task waiting on the session wakes up.
    pub fn close(&self) {
        self.closed.cancel();
        self.inbound_tx.close();
        self.outbound_tx.close();
    }

    /// Whether the closed-signal is set.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the closed-signal is set.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub(crate) fn inbound_reader(&self) -> async_channel::Receiver<Bytes> {
        self.inbound_rx.clone()
    }

    pub(crate) fn outbound_writer(&self) -> async_channel::Sender<Bytes> {
        self.outbound_tx.clone()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    last_activity: Instant,
}

/// Thread-safe registry mapping [`Token`] to [`Session`].
///
/// The lock is held only for map operations, never across queue waits.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<BTreeMap<Token, SessionEntry>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh token and register a new session under it.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if no token could be generated.
    pub async fn create(&self) -> Result<(Token, Session), TokenError> {
        let session = Session::new();
        let mut sessions = self.sessions.lock().await;

        let token = loop {
            let candidate = Token::generate()?;
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
            tracing::warn!("token collision, regenerating");
        };

        sessions.insert(
            token.clone(),
            SessionEntry {
                session: session.clone(),
                last_activity: Instant::now(),
            },
        );
        tracing::info!(token = %token, "created session");

        Ok((token, session))
    }

    /// Register a session under a token chosen elsewhere.
    ///
    /// A session previously registered under the same token is closed and
    /// returned.
    pub async fn insert(&self, token: Token, session: Session) -> Option<Session> {
        let replaced = self.sessions.lock().await.insert(
            token,
            SessionEntry {
                session,
                last_activity: Instant::now(),
            },
        );

        replaced.map(|entry| {
            entry.session.close();
            entry.session
        })
    }

    /// Look up a session, refreshing its activity time.
    pub async fn get(&self, token: &Token) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(token)?;
        entry.last_activity = Instant::now();
        Some(entry.session.clone())
    }

    /// Refresh a session's activity time without cloning it.
    ///
    /// Returns `false` if the token is not registered.
    pub async fn touch(&self, token: &Token) -> bool {
        match self.sessions.lock().await.get_mut(token) {
            Some(entry) => {
                entry.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a session, returning it if it was present.
    ///
    /// Removing an absent token is a no-op.
    pub async fn remove(&self, token: &Token) -> Option<Session> {
        self.sessions.lock().await.remove(token).map(|entry| entry.session)
    }

    /// Remove a session and close it.
    ///
    /// Returns `true` if this call removed it.
    pub async fn teardown(&self, token: &Token) -> bool {
        if let Some(session) = self.remove(token).await {
            session.close();
            tracing::info!(token = %token, "session torn down");
            true
        } else {
            false
        }
    }

    /// Remove and close every session that is already closed or has not been
    /// looked up or touched for longer than `max_idle`.
    ///
    /// Returns the removed tokens.
    pub async fn expire_idle(&self, max_idle: Duration) -> Vec<Token> {
        let mut sessions = self.sessions.lock().await;

        let expired: Vec<Token> = sessions
            .iter()
            .filter(|(_, entry)| {
                entry.session.is_closed() || entry.last_activity.elapsed() > max_idle
            })
            .map(|(token, _)| token.clone())
            .collect();

        for token in &expired {
            if let Some(entry) = sessions.remove(token) {
                entry.session.close();
                tracing::debug!(token = %token, "expired session");
            }
        }

        expired
    }

    /// Remove and close every session.
    pub async fn close_all(&self) {
        let drained = core::mem::take(&mut *self.sessions.lock().await);
        for entry in drained.into_values() {
            entry.session.close();
        }
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_remove() {
        let registry = SessionRegistry::new();
        let (token, _session) = registry.create().await.expect("create");

        assert!(registry.get(&token).await.is_some());
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(&token).await.is_some());
        assert!(registry.get(&token).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let (token, _session) = registry.create().await.expect("create");

        assert!(registry.teardown(&token).await);
        assert!(!registry.teardown(&token).await);
        assert!(registry.remove(&token).await.is_none());
    }

    #[tokio::test]
    async fn created_tokens_are_unique() {
        let registry = SessionRegistry::new();
        let mut tokens = std::collections::BTreeSet::new();
        for _ in 0..64 {
            let (token, _) = registry.create().await.expect("create");
            tokens.insert(token);
        }
        assert_eq!(tokens.len(), 64);
        assert_eq!(registry.len().await, 64);
    }

    #[tokio::test]
    async fn insert_replaces_and_closes_previous() {
        let registry = SessionRegistry::new();
        let token: Token = "abc123".parse().expect("token");

        let first = Session::new();
        assert!(registry.insert(token.clone(), first.clone()).await.is_none());

        let replaced = registry.insert(token.clone(), Session::new()).await;
        assert!(replaced.is_some());
        assert!(first.is_closed());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn teardown_closes_session() {
        let registry = SessionRegistry::new();
        let (token, session) = registry.create().await.expect("create");

        registry.teardown(&token).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn expire_idle_removes_stale_and_closed_sessions() {
        let registry = SessionRegistry::new();
        let (stale, stale_session) = registry.create().await.expect("create");

        tokio::time::sleep(Duration::from_millis(30)).await;

        let (fresh, _) = registry.create().await.expect("create");
        let (closed, closed_session) = registry.create().await.expect("create");
        closed_session.close();

        let expired = registry.expire_idle(Duration::from_millis(15)).await;

        assert!(expired.contains(&stale));
        assert!(expired.contains(&closed));
        assert!(!expired.contains(&fresh));
        assert!(stale_session.is_closed());
        assert!(registry.get(&fresh).await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn touch_keeps_session_from_expiring() {
        let registry = SessionRegistry::new();
        let (token, session) = registry.create().await.expect("create");

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(registry.touch(&token).await);
            assert!(registry.expire_idle(Duration::from_millis(25)).await.is_empty());
        }

        assert!(!session.is_closed());
        registry.remove(&token).await;
        assert!(!registry.touch(&token).await);
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = SessionRegistry::new();
        let (_, a) = registry.create().await.expect("create");
        let (_, b) = registry.create().await.expect("create");

        registry.close_all().await;

        assert!(registry.is_empty().await);
        assert!(a.is_closed() && b.is_closed());
    }

    #[tokio::test]
    async fn outbound_is_fifo_and_drains_after_close() {
        let session = Session::new();
        let writer = session.outbound_writer();
        for chunk in [&b"A"[..], &b"B"[..], &b"C"[..]] {
            writer.send(Bytes::copy_from_slice(chunk)).await.expect("send");
        }
        session.close();

        assert_eq!(session.pull_outbound().await.as_deref(), Some(&b"A"[..]));
        assert_eq!(session.pull_outbound().await.as_deref(), Some(&b"B"[..]));
        assert_eq!(session.pull_outbound().await.as_deref(), Some(&b"C"[..]));
        assert_eq!(session.pull_outbound().await, None);
    }

    #[tokio::test]
    async fn deliver_inbound_after_close_fails() {
        let session = Session::new();
        session.close();

        let res = session
            .deliver_inbound(Bytes::from_static(b"x"), Duration::from_secs(1))
            .await;
        assert_eq!(res, Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn deliver_inbound_times_out_on_full_queue() {
        let session = Session::new();
        for _ in 0..QUEUE_CAPACITY {
            session
                .deliver_inbound(Bytes::from_static(b"x"), Duration::from_secs(1))
                .await
                .expect("queue has room");
        }

        let res = session
            .deliver_inbound(Bytes::from_static(b"x"), Duration::from_millis(20))
            .await;
        assert_eq!(res, Err(DeliveryError::TimedOut));
        assert!(!session.is_closed());
    }
}
