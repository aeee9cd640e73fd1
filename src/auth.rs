use std::sync::Arc;

use anyhow::Result;
use reqwest::blocking::RequestBuilder;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;

use crate::credentials::CredentialStore;

/// Paths that must go out without a bearer header. Matched as substrings of
/// the request path.
pub const PUBLIC_ROUTES: &[&str] = &[
    "/auth/login",
    "/auth/authority/login",
    "/auth/register",
    "/auth/verify",
];

/// Statuses treated as "credentials expired or invalid". The backend answers
/// with either for the same condition.
pub const DEFAULT_AUTH_FAILURE_STATUSES: &[u16] = &[401, 403];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailurePolicy {
    statuses: Vec<u16>,
}

impl AuthFailurePolicy {
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        let mut statuses: Vec<u16> = statuses.into_iter().collect();
        statuses.sort_unstable();
        statuses.dedup();
        if statuses.is_empty() {
            return Self::default();
        }
        Self { statuses }
    }

    pub fn is_auth_failure(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status.as_u16())
    }

    pub fn statuses(&self) -> &[u16] {
        &self.statuses
    }
}

impl Default for AuthFailurePolicy {
    fn default() -> Self {
        Self {
            statuses: DEFAULT_AUTH_FAILURE_STATUSES.to_vec(),
        }
    }
}

/// Decides which credential, if any, an outgoing request carries.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    public_routes: Vec<String>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            public_routes: PUBLIC_ROUTES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_routes
            .iter()
            .any(|route| path.contains(route.as_str()))
    }

    /// Token to attach for `path`. `None` for public routes and when no
    /// usable access token is stored; the request then goes out bare.
    pub fn credential_for(&self, path: &str) -> Result<Option<String>> {
        if self.is_public(path) {
            return Ok(None);
        }
        let creds = self.store.read()?;
        Ok(creds.bearer().map(str::to_string))
    }

    /// Attach `token` as a bearer header unless the route is public or the
    /// token is blank.
    pub fn apply(&self, req: RequestBuilder, path: &str, token: Option<&str>) -> RequestBuilder {
        if self.is_public(path) {
            return req;
        }
        match token.filter(|t| !t.trim().is_empty()) {
            Some(token) => {
                tracing::debug!(path, "attaching bearer credential");
                req.header(AUTHORIZATION, format!("Bearer {}", token))
            }
            None => {
                tracing::debug!(path, "no access token stored, sending unauthenticated");
                req
            }
        }
    }
}
