#![allow(dead_code)]

use std::io::Read;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tiny_http::{Header, Response, Server};

use alris_client::client::{Client, ClientConfig};
use alris_client::credentials::MemoryStore;

/// One request as the fake backend saw it. `path` has the `/api` prefix
/// and the query string removed.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub body: String,
}

impl Recorded {
    pub fn bearer(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self {
            status: 200,
            body: json!({"success": true, "data": data, "message": null, "error": null})
                .to_string(),
        }
    }

    pub fn fail(status: u16, error: &str) -> Self {
        Self {
            status,
            body: json!({"success": false, "data": null, "message": null, "error": error})
                .to_string(),
        }
    }
}

pub struct FakeBackend {
    pub base_url: String,
    server: Arc<Server>,
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeBackend {
    pub fn start(handler: impl Fn(&Recorded) -> Reply + Send + Sync + 'static) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind fake backend"));
        let base_url = format!("http://{}/api/", server.server_addr());
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        {
            let server = server.clone();
            let log = log.clone();
            thread::spawn(move || {
                for mut request in server.incoming_requests() {
                    let log = log.clone();
                    let handler = handler.clone();
                    thread::spawn(move || {
                        let mut raw = Vec::new();
                        let _ = request.as_reader().read_to_end(&mut raw);
                        let body = String::from_utf8_lossy(&raw).into_owned();
                        let header = |name: &'static str| {
                            request
                                .headers()
                                .iter()
                                .find(|h| h.field.equiv(name))
                                .map(|h| h.value.as_str().to_string())
                        };
                        let url = request.url().to_string();
                        let (path, query) = match url.split_once('?') {
                            Some((path, query)) => (path.to_string(), query.to_string()),
                            None => (url.clone(), String::new()),
                        };
                        let recorded = Recorded {
                            method: request.method().to_string(),
                            path: path.strip_prefix("/api").unwrap_or(&path).to_string(),
                            query,
                            authorization: header("Authorization"),
                            content_type: header("Content-Type"),
                            user_agent: header("User-Agent"),
                            body,
                        };
                        log.lock().push(recorded.clone());

                        let reply = (*handler)(&recorded);
                        let content_type =
                            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                                .expect("valid header");
                        let response = Response::from_string(reply.body)
                            .with_status_code(reply.status)
                            .with_header(content_type);
                        let _ = request.respond(response);
                    });
                }
            });
        }

        Self {
            base_url,
            server,
            log,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn client(&self, store: Arc<MemoryStore>) -> Client {
        Client::new(
            store,
            ClientConfig {
                base_url: self.base_url.clone(),
                ..ClientConfig::default()
            },
        )
        .expect("build client")
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

pub fn issue_json(id: &str) -> Value {
    json!({
        "id": id,
        "title": "Broken streetlight",
        "description": "Dark since Monday",
        "category": "lighting",
        "status": "pending",
        "latitude": 6.5244,
        "longitude": 3.3792,
        "distanceKm": 0.3
    })
}

pub fn issue_page(ids: &[&str]) -> Value {
    let items: Vec<Value> = ids.iter().map(|id| issue_json(id)).collect();
    json!({
        "items": items,
        "total": ids.len(),
        "limit": 20,
        "offset": 0,
        "hasMore": false
    })
}

pub fn session_json(access: &str, refresh: &str, role: &str) -> Value {
    json!({
        "accessToken": access,
        "refreshToken": refresh,
        "user": {
            "id": "u-1",
            "name": "Ada Obi",
            "email": "ada@example.com",
            "role": role
        }
    })
}

pub fn grant_json(access: &str, refresh: Option<&str>) -> Value {
    match refresh {
        Some(refresh) => json!({"accessToken": access, "refreshToken": refresh}),
        None => json!({"accessToken": access}),
    }
}
