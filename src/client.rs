use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::auth::{AuthFailurePolicy, Authenticator};
use crate::credentials::CredentialStore;
use crate::models::Envelope;
use crate::refresh::{HttpTokenExchange, Recovery, RefreshCoordinator, TokenExchange, REFRESH_PATH};

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000/api/";
pub const DEFAULT_MAX_AUTH_RETRIES: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("credential store: {0:#}")]
    Storage(anyhow::Error),
    #[error("not authorized ({status}): {message}")]
    Unauthorized { status: StatusCode, message: String },
    #[error("request rejected ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("decode response ({status}): {source}")]
    Decode {
        status: StatusCode,
        #[source]
        source: serde_json::Error,
    },
    #[error("response carried no data")]
    MissingData,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// The caller has to sign in again before retrying.
    pub fn needs_login(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}

/// In-memory file sent as one multipart part.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn photo(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let content_type = guess_image_type(&file_name).to_string();
        Self {
            field: "photos".into(),
            file_name,
            content_type,
            bytes,
        }
    }
}

fn guess_image_type(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// Body kept in a form that can be rebuilt for a retry.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<Attachment>,
    },
}

/// Replayable description of one backend call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn query_pairs(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|err| ApiError::InvalidRequest(format!("encode body: {}", err)))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn multipart(mut self, fields: Vec<(String, String)>, files: Vec<Attachment>) -> Self {
        self.body = RequestBody::Multipart { fields, files };
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub auth_failure_statuses: Vec<u16>,
    pub max_auth_retries: u32,
    pub http_client: Option<HttpClient>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!("alris/{}", crate::VERSION),
            timeout: Duration::from_secs(20),
            auth_failure_statuses: crate::auth::DEFAULT_AUTH_FAILURE_STATUSES.to_vec(),
            max_auth_retries: DEFAULT_MAX_AUTH_RETRIES,
            http_client: None,
        }
    }
}

/// Authenticated request pipeline: attach credential, send, recover from an
/// authorization failure, replay.
pub struct Client {
    http: HttpClient,
    base_url: Url,
    user_agent: String,
    store: Arc<dyn CredentialStore>,
    authenticator: Authenticator,
    coordinator: RefreshCoordinator,
    policy: AuthFailurePolicy,
    max_auth_retries: u32,
}

impl Client {
    pub fn new(store: Arc<dyn CredentialStore>, config: ClientConfig) -> anyhow::Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("client: user agent required");
        }
        let base_url = parse_base_url(&config.base_url)?;
        let policy = AuthFailurePolicy::new(config.auth_failure_statuses.iter().copied());
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout)
                .build()
                .context("client: build http client")?,
        };
        let exchange_url = join(&base_url, REFRESH_PATH).context("client: refresh url")?;
        let exchange: Arc<dyn TokenExchange> = Arc::new(HttpTokenExchange::new(
            http.clone(),
            exchange_url,
            config.user_agent.clone(),
            policy.clone(),
        ));

        Ok(Self {
            http,
            base_url,
            user_agent: config.user_agent,
            authenticator: Authenticator::new(store.clone()),
            coordinator: RefreshCoordinator::new(store.clone(), exchange),
            store,
            policy,
            max_auth_retries: config.max_auth_retries,
        })
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Send `req`, transparently refreshing credentials on an authorization
    /// failure. When recovery is impossible the failed response is returned
    /// as-is; this never errors for a missing token or a failed refresh.
    pub fn execute(&self, req: &ApiRequest) -> Result<Response, ApiError> {
        let mut token = self
            .authenticator
            .credential_for(&req.path)
            .map_err(ApiError::Storage)?;
        let mut recoveries = 0u32;

        loop {
            let resp = self.send(req, token.as_deref())?;
            let status = resp.status();
            if !self.policy.is_auth_failure(status) || self.authenticator.is_public(&req.path) {
                return Ok(resp);
            }
            if recoveries >= self.max_auth_retries {
                tracing::warn!(path = %req.path, %status, recoveries, "auth retry budget exhausted");
                return Ok(resp);
            }
            recoveries += 1;

            match self.coordinator.recover(token.as_deref()) {
                Recovery::Renewed(fresh) => {
                    tracing::debug!(path = %req.path, attempt = recoveries, "replaying with renewed token");
                    token = Some(fresh);
                }
                outcome => {
                    tracing::warn!(path = %req.path, %status, %outcome, "giving up on request");
                    return Ok(resp);
                }
            }
        }
    }

    /// Execute and decode the envelope's `data`.
    pub fn call<T: DeserializeOwned>(&self, req: &ApiRequest) -> Result<T, ApiError> {
        let resp = self.execute(req)?;
        self.decode::<T>(resp)?.ok_or(ApiError::MissingData)
    }

    /// Execute for an endpoint whose `data` carries nothing of interest.
    pub fn call_unit(&self, req: &ApiRequest) -> Result<(), ApiError> {
        let resp = self.execute(req)?;
        self.decode::<serde_json::Value>(resp)?;
        Ok(())
    }

    fn decode<T: DeserializeOwned>(&self, resp: Response) -> Result<Option<T>, ApiError> {
        let status = resp.status();
        let body = resp.text()?;

        if self.policy.is_auth_failure(status) {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|env| env.reason().map(str::to_string))
                .unwrap_or_else(|| fallback_message(status, &body));
            return Err(ApiError::Unauthorized { status, message });
        }

        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ApiError::Rejected {
                    status,
                    message: fallback_message(status, &body),
                })
            }
            Err(source) => return Err(ApiError::Decode { status, source }),
        };

        if !status.is_success() || !envelope.success {
            let message = envelope
                .reason()
                .map(str::to_string)
                .unwrap_or_else(|| fallback_message(status, ""));
            return Err(ApiError::Rejected { status, message });
        }
        Ok(envelope.data)
    }

    fn send(&self, req: &ApiRequest, token: Option<&str>) -> Result<Response, ApiError> {
        let mut url = join(&self.base_url, &req.path)
            .map_err(|err| ApiError::InvalidRequest(format!("{err:#}")))?;
        if !req.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &req.query {
                pairs.append_pair(k, v);
            }
        }

        let mut builder = self
            .http
            .request(req.method.clone(), url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(ACCEPT, "application/json");
        builder = self.authenticator.apply(builder, &req.path, token);
        builder = match &req.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart { fields, files } => builder.multipart(build_form(fields, files)?),
        };

        Ok(builder.send()?)
    }
}

fn build_form(fields: &[(String, String)], files: &[Attachment]) -> Result<Form, ApiError> {
    let mut form = Form::new();
    for (name, value) in fields {
        form = form.text(name.clone(), value.clone());
    }
    for file in files {
        let part = Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.content_type)?;
        form = form.part(file.field.clone(), part);
    }
    Ok(form)
}

fn fallback_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        body.chars().take(200).collect()
    }
}

fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("client: base url required");
    }
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&normalized).with_context(|| format!("client: parse base url {:?}", raw))
}

/// Join an API path onto the base URL, keeping any base path prefix.
fn join(base: &Url, path: &str) -> anyhow::Result<Url> {
    base.join(path.trim_start_matches('/'))
        .with_context(|| format!("join {:?} onto {}", path, base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_keeps_base_prefix() {
        let base = parse_base_url("https://alris.example/api/v1").unwrap();
        assert_eq!(
            join(&base, "/issues/nearby").unwrap().as_str(),
            "https://alris.example/api/v1/issues/nearby"
        );
        assert_eq!(
            join(&base, "auth/refresh").unwrap().as_str(),
            "https://alris.example/api/v1/auth/refresh"
        );
    }

    #[test]
    fn empty_base_url_is_rejected() {
        assert!(parse_base_url("  ").is_err());
    }

    #[test]
    fn photo_content_type_from_extension() {
        assert_eq!(Attachment::photo("drain.PNG", vec![]).content_type, "image/png");
        assert_eq!(Attachment::photo("drain.jpg", vec![]).content_type, "image/jpeg");
        assert_eq!(Attachment::photo("drain", vec![]).field, "photos");
    }

    #[test]
    fn request_builder_collects_query_and_body() {
        let req = ApiRequest::get("/issues/nearby")
            .query("lat", 6.5)
            .query("lng", 3.3)
            .query_pairs(vec![("limit".to_string(), "20".to_string())]);
        assert_eq!(req.query.len(), 3);
        assert!(matches!(req.body, RequestBody::Empty));

        let req = ApiRequest::post("/ratings")
            .json(&serde_json::json!({"score": 4}))
            .unwrap();
        assert!(matches!(req.body, RequestBody::Json(_)));
    }

    #[test]
    fn unauthorized_error_asks_for_login() {
        let err = ApiError::Unauthorized {
            status: StatusCode::UNAUTHORIZED,
            message: "expired".into(),
        };
        assert!(err.needs_login());
        assert!(!ApiError::MissingData.needs_login());
    }
}
