//! Per-URL cache of idle client sessions.
//!
//! Each remote URL keeps a bounded FIFO (default capacity 3). Synchronous
//! acquisition polls the cache first and otherwise creates a session
//! asynchronously, blocking on a transaction listener rather than a bare
//! future wait, so a scheduler waiting on its own inbound traffic keeps
//! draining queues. Local sessions are never cached; server-side
//! sessions are closed on release.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{AsyncHandler, AsyncResult};

use kestrel_txn::{SyncTransactionListener, TransactionListener};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Client side of a remote connection; cacheable.
    RemoteClient,
    /// In-process session; never cached.
    Local,
    /// Server side of a connection; closed on release.
    ServerSide,
}

pub struct ClientSession {
    id: u64,
    url: String,
    kind: SessionKind,
    closed: AtomicBool,
}

impl ClientSession {
    pub fn new(url: &str, kind: SessionKind) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            url: url.to_string(),
            kind,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Creates sessions; the network layer plugs in here.
pub trait SessionFactory: Send + Sync {
    /// Create asynchronously; the handler fires when the session is
    /// ready (possibly on another scheduler's thread).
    fn create_session(&self, url: &str, handler: AsyncHandler<Arc<ClientSession>>);
}

/// In-process factory used by embedded deployments and tests.
pub struct LocalSessionFactory;

impl SessionFactory for LocalSessionFactory {
    fn create_session(&self, url: &str, handler: AsyncHandler<Arc<ClientSession>>) {
        handler(AsyncResult::succeeded(ClientSession::new(
            url,
            SessionKind::RemoteClient,
        )));
    }
}

pub struct SessionPool {
    pools: DashMap<String, Mutex<VecDeque<Arc<ClientSession>>>>,
    capacity: usize,
    factory: Arc<dyn SessionFactory>,
    create_timeout: Duration,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, capacity: usize) -> Self {
        Self {
            pools: DashMap::new(),
            capacity: capacity.max(1),
            factory,
            create_timeout: Duration::from_secs(10),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached-session count for a URL (diagnostics).
    pub fn idle_count(&self, url: &str) -> usize {
        self.pools.get(url).map(|q| q.lock().len()).unwrap_or(0)
    }

    /// Poll the cache, else create through the factory and park on the
    /// supplied listener until the session arrives.
    pub fn get_session_sync_with(
        &self,
        url: &str,
        listener: Arc<dyn TransactionListener>,
    ) -> KestrelResult<Arc<ClientSession>> {
        if let Some(queue) = self.pools.get(url) {
            let mut queue = queue.lock();
            while let Some(session) = queue.pop_front() {
                if !session.is_closed() {
                    return Ok(session);
                }
            }
        }

        let slot: Arc<Mutex<Option<AsyncResult<Arc<ClientSession>>>>> =
            Arc::new(Mutex::new(None));
        let handler_slot = Arc::clone(&slot);
        let handler_listener = Arc::clone(&listener);
        listener.before_operation();
        self.factory.create_session(
            url,
            Box::new(move |result| {
                *handler_slot.lock() = Some(result);
                handler_listener.operation_complete();
            }),
        );
        listener.await_completion(Some(self.create_timeout))?;
        let taken = slot.lock().take();
        match taken {
            Some(result) => match result.into_result()? {
                Some(session) => Ok(session),
                None => Err(KestrelError::Internal(
                    "session factory delivered nothing".into(),
                )),
            },
            None => Err(KestrelError::Internal(
                "session factory never completed".into(),
            )),
        }
    }

    /// Synchronous acquisition with a plain blocking listener.
    pub fn get_session_sync(&self, url: &str) -> KestrelResult<Arc<ClientSession>> {
        self.get_session_sync_with(url, Arc::new(SyncTransactionListener::new()))
    }

    /// Asynchronous acquisition: cache hit completes inline.
    pub fn get_session_async(&self, url: &str, handler: AsyncHandler<Arc<ClientSession>>) {
        if let Some(queue) = self.pools.get(url) {
            let mut queue = queue.lock();
            while let Some(session) = queue.pop_front() {
                if !session.is_closed() {
                    drop(queue);
                    handler(AsyncResult::succeeded(session));
                    return;
                }
            }
        }
        self.factory.create_session(url, handler);
    }

    /// Return a session to its URL's queue; closed sessions, non-client
    /// sessions and overflow beyond the capacity are closed instead.
    pub fn release(&self, session: Arc<ClientSession>) {
        if session.is_closed() || session.kind() != SessionKind::RemoteClient {
            session.close();
            return;
        }
        let queue = self
            .pools
            .entry(session.url().to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut queue = queue.lock();
        if queue.len() >= self.capacity {
            drop(queue);
            session.close();
            return;
        }
        queue.push_back(session);
    }

    /// Close every cached session (server shutdown).
    pub fn close_all(&self) {
        for entry in self.pools.iter() {
            let mut queue = entry.value().lock();
            for session in queue.drain(..) {
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SessionPool {
        SessionPool::new(Arc::new(LocalSessionFactory), 3)
    }

    #[test]
    fn test_get_creates_then_caches() {
        let pool = pool();
        let s = pool.get_session_sync("tcp://node1:9210").unwrap();
        assert_eq!(pool.idle_count("tcp://node1:9210"), 0);
        pool.release(Arc::clone(&s));
        assert_eq!(pool.idle_count("tcp://node1:9210"), 1);

        let s2 = pool.get_session_sync("tcp://node1:9210").unwrap();
        assert_eq!(s.id(), s2.id(), "cache hit returns the idle session");
    }

    #[test]
    fn test_release_beyond_capacity_closes() {
        let pool = pool();
        let sessions: Vec<_> = (0..5)
            .map(|_| pool.get_session_sync("tcp://node1:9210").unwrap())
            .collect();
        for s in &sessions {
            pool.release(Arc::clone(s));
        }
        assert_eq!(pool.idle_count("tcp://node1:9210"), 3);
        assert!(sessions[4].is_closed(), "overflow is closed, not cached");
    }

    #[test]
    fn test_closed_sessions_are_not_returned() {
        let pool = pool();
        let s = pool.get_session_sync("tcp://node1:9210").unwrap();
        pool.release(Arc::clone(&s));
        s.close();
        let s2 = pool.get_session_sync("tcp://node1:9210").unwrap();
        assert_ne!(s.id(), s2.id());
    }

    #[test]
    fn test_server_side_sessions_close_on_release() {
        let pool = pool();
        let s = ClientSession::new("tcp://peer:9210", SessionKind::ServerSide);
        pool.release(Arc::clone(&s));
        assert!(s.is_closed());
        assert_eq!(pool.idle_count("tcp://peer:9210"), 0);
    }

    #[test]
    fn test_local_sessions_never_cached() {
        let pool = pool();
        let s = ClientSession::new("local", SessionKind::Local);
        pool.release(Arc::clone(&s));
        assert_eq!(pool.idle_count("local"), 0);
    }

    #[test]
    fn test_async_acquisition() {
        let pool = pool();
        let got: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&got);
        pool.get_session_async(
            "tcp://node2:9210",
            Box::new(move |result| {
                *sink.lock() = result.value.map(|s| s.id());
            }),
        );
        assert!(got.lock().is_some());
    }
}
