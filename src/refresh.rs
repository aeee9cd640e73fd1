//! Coordinated token refresh.
//!
//! When a request comes back with an authorization failure the pipeline asks
//! [`RefreshCoordinator::recover`] for a usable access token. At most one
//! exchange against the refresh endpoint is in flight at a time: the first
//! caller leads an episode, callers arriving while it runs wait for the same
//! outcome, and callers arriving after it finished pick up the renewed token
//! straight from the store.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::AuthFailurePolicy;
use crate::credentials::CredentialStore;
use crate::models::Envelope;

pub const REFRESH_PATH: &str = "/auth/refresh";

/// Tokens returned by a successful exchange. The backend may or may not
/// rotate the refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("refresh token rejected ({status})")]
    Rejected { status: StatusCode },
    #[error("refresh endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("refresh request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decode refresh response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("refresh response missing access token")]
    MissingToken,
}

/// Trades a refresh token for a new token pair.
pub trait TokenExchange: Send + Sync {
    fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, ExchangeError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Exchange against the backend's refresh endpoint. The call goes out
/// without a bearer header.
pub struct HttpTokenExchange {
    http: HttpClient,
    url: Url,
    user_agent: String,
    policy: AuthFailurePolicy,
}

impl HttpTokenExchange {
    pub fn new(
        http: HttpClient,
        url: Url,
        user_agent: impl Into<String>,
        policy: AuthFailurePolicy,
    ) -> Self {
        Self {
            http,
            url,
            user_agent: user_agent.into(),
            policy,
        }
    }
}

impl TokenExchange for HttpTokenExchange {
    fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, ExchangeError> {
        let resp = self
            .http
            .post(self.url.clone())
            .header(USER_AGENT, self.user_agent.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&RefreshRequest { refresh_token })
            .send()?;

        let status = resp.status();
        if self.policy.is_auth_failure(status) {
            return Err(ExchangeError::Rejected { status });
        }
        let body = resp.text()?;
        if !status.is_success() {
            return Err(ExchangeError::Status { status, body });
        }

        let envelope: Envelope<TokenGrant> = serde_json::from_str(&body)?;
        if !envelope.success {
            return Err(ExchangeError::Status {
                status,
                body: envelope.reason().unwrap_or("refresh unsuccessful").to_string(),
            });
        }
        match envelope.data {
            Some(grant) if !grant.access_token.trim().is_empty() => Ok(grant),
            _ => Err(ExchangeError::MissingToken),
        }
    }
}

/// What a caller should do after an authorization failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Retry with this access token.
    Renewed(String),
    /// Nothing to exchange; no refresh call was made.
    NoRefreshToken,
    /// The refresh token itself was refused and the store was cleared.
    Rejected,
    /// The exchange failed for another reason; credentials were kept.
    Failed(String),
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recovery::Renewed(_) => f.write_str("renewed"),
            Recovery::NoRefreshToken => f.write_str("no refresh token"),
            Recovery::Rejected => f.write_str("refresh token rejected"),
            Recovery::Failed(reason) => write!(f, "refresh failed: {}", reason),
        }
    }
}

#[derive(Default)]
struct Episode {
    outcome: Mutex<Option<Recovery>>,
    ready: Condvar,
}

impl Episode {
    fn publish(&self, outcome: Recovery) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Recovery {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.ready.wait(&mut slot);
        }
    }
}

enum Role {
    Done(Recovery),
    Follow(Arc<Episode>),
    Lead(Arc<Episode>, String),
}

pub struct RefreshCoordinator {
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    inflight: Mutex<Option<Arc<Episode>>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<dyn CredentialStore>, exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            store,
            exchange,
            inflight: Mutex::new(None),
        }
    }

    /// Recover from an authorization failure on a request that carried
    /// `stale` (or no token at all).
    pub fn recover(&self, stale: Option<&str>) -> Recovery {
        match self.join(stale) {
            Role::Done(outcome) => outcome,
            Role::Follow(episode) => {
                tracing::debug!("waiting for in-flight token refresh");
                episode.wait()
            }
            Role::Lead(episode, refresh_token) => {
                let guard = LeaderGuard {
                    coordinator: self,
                    episode: &episode,
                };
                let outcome = self.run_exchange(&refresh_token);
                guard.finish(outcome.clone());
                outcome
            }
        }
    }

    fn join(&self, stale: Option<&str>) -> Role {
        let mut inflight = self.inflight.lock();

        let creds = match self.store.read() {
            Ok(creds) => creds,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "read credentials during recovery");
                return Role::Done(Recovery::Failed(format!("{err:#}")));
            }
        };

        if let Some(current) = creds.bearer() {
            if Some(current) != stale {
                tracing::debug!("access token already renewed by another caller");
                return Role::Done(Recovery::Renewed(current.to_string()));
            }
        }

        if let Some(episode) = inflight.as_ref() {
            return Role::Follow(Arc::clone(episode));
        }

        let Some(refresh_token) = creds.refresh() else {
            tracing::warn!("authorization failed and no refresh token is stored");
            return Role::Done(Recovery::NoRefreshToken);
        };

        let episode = Arc::new(Episode::default());
        *inflight = Some(Arc::clone(&episode));
        Role::Lead(episode, refresh_token.to_string())
    }

    fn run_exchange(&self, refresh_token: &str) -> Recovery {
        match self.exchange.exchange(refresh_token) {
            Ok(grant) => self.persist(grant),
            Err(ExchangeError::Rejected { status }) => {
                tracing::warn!(%status, "refresh token rejected, clearing stored credentials");
                if let Err(err) = self.store.clear() {
                    tracing::warn!(error = %format!("{err:#}"), "clear credentials");
                }
                Recovery::Rejected
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed, keeping credentials");
                Recovery::Failed(err.to_string())
            }
        }
    }

    fn persist(&self, grant: TokenGrant) -> Recovery {
        let written = match grant.refresh_token.as_deref() {
            Some(refresh) if !refresh.trim().is_empty() => {
                self.store.write_pair(&grant.access_token, refresh)
            }
            _ => self.store.write_access_token(&grant.access_token),
        };
        match written {
            Ok(()) => {
                tracing::info!("access token refreshed");
                Recovery::Renewed(grant.access_token)
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "persist refreshed tokens");
                Recovery::Failed(format!("{err:#}"))
            }
        }
    }

    #[cfg(test)]
    fn has_inflight(&self) -> bool {
        self.inflight.lock().is_some()
    }
}

/// Publishes the leader's outcome and retires the episode. If the leader
/// unwinds before finishing, waiters are released with a failure.
struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    episode: &'a Arc<Episode>,
}

impl LeaderGuard<'_> {
    fn finish(self, outcome: Recovery) {
        self.retire(outcome);
        std::mem::forget(self);
    }

    fn retire(&self, outcome: Recovery) {
        let mut inflight = self.coordinator.inflight.lock();
        self.episode.publish(outcome);
        if inflight
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, self.episode))
        {
            *inflight = None;
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.retire(Recovery::Failed("refresh aborted".into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    struct FakeExchange {
        calls: AtomicUsize,
        delay: Duration,
        respond: Box<dyn Fn(&str) -> Result<TokenGrant, ExchangeError> + Send + Sync>,
    }

    impl FakeExchange {
        fn new(
            respond: impl Fn(&str) -> Result<TokenGrant, ExchangeError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
                respond: Box::new(respond),
            })
        }

        fn slow(
            delay: Duration,
            respond: impl Fn(&str) -> Result<TokenGrant, ExchangeError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                respond: Box::new(respond),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenExchange for FakeExchange {
        fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            (self.respond)(refresh_token)
        }
    }

    fn grant(access: &str, refresh: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: access.into(),
            refresh_token: refresh.map(str::to_string),
        }
    }

    fn setup(
        creds: Credentials,
        exchange: Arc<FakeExchange>,
    ) -> (Arc<MemoryStore>, RefreshCoordinator) {
        let store = Arc::new(MemoryStore::with_credentials(creds));
        let coordinator = RefreshCoordinator::new(store.clone(), exchange);
        (store, coordinator)
    }

    #[test]
    fn renews_and_persists_rotated_pair() {
        let exchange = FakeExchange::new(|refresh| {
            assert_eq!(refresh, "r1");
            Ok(grant("a2", Some("r2")))
        });
        let (store, coordinator) = setup(Credentials::new("a1", "r1"), exchange.clone());

        assert_eq!(coordinator.recover(Some("a1")), Recovery::Renewed("a2".into()));
        assert_eq!(store.read().unwrap(), Credentials::new("a2", "r2"));
        assert_eq!(exchange.calls(), 1);
        assert!(!coordinator.has_inflight());
    }

    #[test]
    fn keeps_refresh_token_when_not_rotated() {
        let exchange = FakeExchange::new(|_| Ok(grant("a2", None)));
        let (store, coordinator) = setup(Credentials::new("a1", "r1"), exchange);

        assert_eq!(coordinator.recover(Some("a1")), Recovery::Renewed("a2".into()));
        assert_eq!(store.read().unwrap(), Credentials::new("a2", "r1"));
    }

    #[test]
    fn no_refresh_token_makes_no_call() {
        let exchange = FakeExchange::new(|_| Ok(grant("a2", None)));
        let creds = Credentials {
            access_token: Some("a1".into()),
            refresh_token: None,
        };
        let (store, coordinator) = setup(creds.clone(), exchange.clone());

        assert_eq!(coordinator.recover(Some("a1")), Recovery::NoRefreshToken);
        assert_eq!(exchange.calls(), 0);
        assert_eq!(store.read().unwrap(), creds);
    }

    #[test]
    fn rejected_refresh_clears_store() {
        let exchange = FakeExchange::new(|_| {
            Err(ExchangeError::Rejected {
                status: StatusCode::UNAUTHORIZED,
            })
        });
        let (store, coordinator) = setup(Credentials::new("a1", "r1"), exchange);

        assert_eq!(coordinator.recover(Some("a1")), Recovery::Rejected);
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn transient_failure_keeps_store() {
        let exchange = FakeExchange::new(|_| {
            Err(ExchangeError::Status {
                status: StatusCode::BAD_GATEWAY,
                body: "upstream down".into(),
            })
        });
        let (store, coordinator) = setup(Credentials::new("a1", "r1"), exchange);

        assert!(matches!(coordinator.recover(Some("a1")), Recovery::Failed(_)));
        assert_eq!(store.read().unwrap(), Credentials::new("a1", "r1"));
        assert!(!coordinator.has_inflight());
    }

    #[test]
    fn token_renewed_elsewhere_is_reused_without_a_call() {
        let exchange = FakeExchange::new(|_| Ok(grant("a3", None)));
        let (_store, coordinator) = setup(Credentials::new("a2", "r2"), exchange.clone());

        assert_eq!(coordinator.recover(Some("a1")), Recovery::Renewed("a2".into()));
        assert_eq!(exchange.calls(), 0);
    }

    #[test]
    fn request_sent_without_token_picks_up_a_stored_one() {
        let exchange = FakeExchange::new(|_| Ok(grant("a3", None)));
        let (_store, coordinator) = setup(Credentials::new("a1", "r1"), exchange.clone());

        assert_eq!(coordinator.recover(None), Recovery::Renewed("a1".into()));
        assert_eq!(exchange.calls(), 0);
    }

    #[test]
    fn concurrent_failures_share_one_exchange() {
        const CALLERS: usize = 8;
        let exchange = FakeExchange::slow(Duration::from_millis(100), |_| {
            Ok(grant("a2", Some("r2")))
        });
        let (store, coordinator) = setup(Credentials::new("a1", "r1"), exchange.clone());
        let coordinator = Arc::new(coordinator);
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.recover(Some("a1"))
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Recovery::Renewed("a2".into()));
        }
        assert_eq!(exchange.calls(), 1);
        assert_eq!(store.read().unwrap(), Credentials::new("a2", "r2"));
    }

    #[test]
    fn waiters_share_a_failed_outcome() {
        const CALLERS: usize = 4;
        let exchange = FakeExchange::slow(Duration::from_millis(100), |_| {
            Err(ExchangeError::Rejected {
                status: StatusCode::FORBIDDEN,
            })
        });
        let (store, coordinator) = setup(Credentials::new("a1", "r1"), exchange.clone());
        let coordinator = Arc::new(coordinator);
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.recover(Some("a1"))
                })
            })
            .collect();

        for handle in handles {
            let outcome = handle.join().unwrap();
            assert!(
                matches!(outcome, Recovery::Rejected | Recovery::NoRefreshToken),
                "unexpected outcome {outcome:?}"
            );
        }
        assert_eq!(exchange.calls(), 1);
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn panicking_exchange_releases_waiters() {
        let exchange = FakeExchange::slow(Duration::from_millis(100), |_| {
            panic!("exchange blew up")
        });
        let (store, coordinator) = setup(Credentials::new("a1", "r1"), exchange);
        let coordinator = Arc::new(coordinator);

        let leader = {
            let coordinator = coordinator.clone();
            thread::spawn(move || coordinator.recover(Some("a1")))
        };
        thread::sleep(Duration::from_millis(20));
        let follower = {
            let coordinator = coordinator.clone();
            thread::spawn(move || coordinator.recover(Some("a1")))
        };

        assert!(leader.join().is_err());
        let outcome = follower.join().unwrap();
        assert!(
            matches!(outcome, Recovery::Failed(_)),
            "unexpected outcome {outcome:?}"
        );
        assert!(!coordinator.has_inflight());
        assert_eq!(store.read().unwrap(), Credentials::new("a1", "r1"));
    }
}
