// Suggester sessions: one connection handle per endpoint url.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no suggester registered for address {0}")]
    UnknownSuggester(String),

    #[error("suggester not connected: {0}")]
    NotConnected(String),

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("remote call `{func}` failed: {message}")]
    Remote { func: String, message: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Transport collaborator
// ---------------------------------------------------------------------------

/// A request/response connection to one suggester endpoint.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Establish the connection.
    async fn connect(&self) -> Result<(), SessionError>;

    /// Whether the connection is currently live.
    fn is_connected(&self) -> bool;

    /// Call the remote operation `func` and return the `data` of its reply.
    async fn send(&self, func: &str, data: Option<Value>) -> Result<Value, SessionError>;
}

/// Builds a fresh, not yet connected transport for an endpoint url.
pub trait Connector: Send + Sync {
    fn transport_for(&self, url: &str) -> Arc<dyn SessionTransport>;
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// What happens to a handle whose dial failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailedDialPolicy {
    /// Leave the handle registered. The endpoint is never dialed again.
    #[default]
    KeepStale,
    /// Drop the handle so a later connect dials again.
    Evict,
}

/// Endpoint url → session handle. At most one handle per url.
pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<String, Arc<dyn SessionTransport>>>,
    policy: FailedDialPolicy,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>, policy: FailedDialPolicy) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn SessionTransport>>> {
        self.sessions.lock().expect("session registry mutex poisoned")
    }

    /// Connect to `url` unless a handle for it already exists.
    ///
    /// The handle is registered before the dial starts, under the same lock
    /// as the existence check, so concurrent callers for one url never dial
    /// twice. Dial failures are logged, not returned.
    pub async fn connect(&self, url: &str) {
        let transport = {
            let mut sessions = self.sessions();
            if sessions.contains_key(url) {
                debug!(url, "session already registered");
                return;
            }
            let transport = self.connector.transport_for(url);
            sessions.insert(url.to_string(), Arc::clone(&transport));
            transport
        };

        match transport.connect().await {
            Ok(()) => info!(url, "connected to suggester server"),
            Err(e) => {
                warn!(url, error = %e, "failed to connect to suggester server");
                if self.policy == FailedDialPolicy::Evict {
                    let mut sessions = self.sessions();
                    if sessions
                        .get(url)
                        .is_some_and(|current| Arc::ptr_eq(current, &transport))
                    {
                        sessions.remove(url);
                    }
                }
            }
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<dyn SessionTransport>> {
        self.sessions().get(url).cloned()
    }

    /// Registered urls and whether each is live.
    pub fn statuses(&self) -> Vec<(String, bool)> {
        let mut statuses: Vec<_> = self
            .sessions()
            .iter()
            .map(|(url, t)| (url.clone(), t.is_connected()))
            .collect();
        statuses.sort();
        statuses
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeTransport {
        fail: bool,
        connected: AtomicBool,
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionTransport for FakeTransport {
        async fn connect(&self) -> Result<(), SessionError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                return Err(SessionError::Timeout("handshake".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn send(&self, _func: &str, _data: Option<Value>) -> Result<Value, SessionError> {
            Ok(Value::Null)
        }
    }

    struct FakeConnector {
        fail: bool,
        dials: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                dials: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    impl Connector for FakeConnector {
        fn transport_for(&self, _url: &str) -> Arc<dyn SessionTransport> {
            Arc::new(FakeTransport {
                fail: self.fail,
                connected: AtomicBool::new(false),
                dials: Arc::clone(&self.dials),
            })
        }
    }

    #[tokio::test]
    async fn sequential_connects_dial_once() {
        let connector = FakeConnector::new(false);
        let registry = SessionRegistry::new(connector.clone(), FailedDialPolicy::KeepStale);

        registry.connect("wss://a").await;
        registry.connect("wss://a").await;

        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert!(registry.get("wss://a").unwrap().is_connected());
    }

    #[tokio::test]
    async fn concurrent_connects_dial_once() {
        let connector = FakeConnector::new(false);
        let registry = SessionRegistry::new(connector.clone(), FailedDialPolicy::KeepStale);

        tokio::join!(
            registry.connect("wss://a"),
            registry.connect("wss://a"),
            registry.connect("wss://a"),
        );

        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn distinct_urls_get_distinct_sessions() {
        let connector = FakeConnector::new(false);
        let registry = SessionRegistry::new(connector.clone(), FailedDialPolicy::KeepStale);

        registry.connect("wss://a").await;
        registry.connect("wss://b").await;

        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
        assert_eq!(
            registry.statuses(),
            vec![("wss://a".to_string(), true), ("wss://b".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn failed_dial_leaves_stale_handle_by_default() {
        let connector = FakeConnector::new(true);
        let registry = SessionRegistry::new(connector.clone(), FailedDialPolicy::KeepStale);

        registry.connect("wss://down").await;
        registry.connect("wss://down").await;

        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        let handle = registry.get("wss://down").expect("stale handle stays registered");
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn evict_policy_allows_a_later_redial() {
        let connector = FakeConnector::new(true);
        let registry = SessionRegistry::new(connector.clone(), FailedDialPolicy::Evict);

        registry.connect("wss://down").await;
        assert!(registry.get("wss://down").is_none());

        registry.connect("wss://down").await;
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    }
}
