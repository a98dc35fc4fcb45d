//! Scripted SFU standing in for the caller-supplied fetch

use async_trait::async_trait;
use parking_lot::Mutex;
use partytracks::api::http::{HttpClient, HttpRequest, HttpResponse};
use partytracks::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One recorded exchange
#[derive(Debug, Clone)]
pub struct LoggedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
}

/// In-memory SFU with scripted responses and a full request log
pub struct MockSfu {
    session_counter: AtomicU32,
    pull_mid_counter: AtomicU32,
    /// Whether pull responses demand an immediate renegotiation
    pub pull_renegotiates: AtomicBool,
    /// Delay applied before every response is returned
    response_delay_ms: AtomicU64,
    log: Mutex<Vec<LoggedRequest>>,
}

impl MockSfu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session_counter: AtomicU32::new(0),
            pull_mid_counter: AtomicU32::new(0),
            pull_renegotiates: AtomicBool::new(true),
            response_delay_ms: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Hold every response for `delay`, so tests can cancel callers while a
    /// request is in flight
    pub fn set_response_delay(&self, delay: Duration) {
        self.response_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// All requests whose path contains `fragment`, in arrival order
    pub fn requests_matching(&self, fragment: &str) -> Vec<LoggedRequest> {
        self.log
            .lock()
            .iter()
            .filter(|entry| entry.path.contains(fragment))
            .cloned()
            .collect()
    }

    pub fn count_matching(&self, fragment: &str) -> usize {
        self.requests_matching(fragment).len()
    }

    /// Paths in arrival order, for sequence assertions
    pub fn request_paths(&self) -> Vec<String> {
        self.log.lock().iter().map(|entry| entry.path.clone()).collect()
    }

    fn session_path_id(path: &str) -> Option<&str> {
        let rest = path.split("/sessions/").nth(1)?;
        Some(rest.split('/').next().unwrap_or(rest))
    }

    fn respond(&self, request: &HttpRequest, path: &str) -> Value {
        if path.ends_with("/sessions/new") {
            let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
            return json!({ "sessionId": format!("S{n}") });
        }
        if path.ends_with("/generate-ice-servers") {
            return json!({
                "iceServers": [{ "urls": ["stun:stun.test:3478"] }]
            });
        }
        if path.ends_with("/tracks/new") {
            let session_id = Self::session_path_id(path).unwrap_or("S?");
            let body = request.body.clone().unwrap_or(Value::Null);
            let requested = body["tracks"].as_array().cloned().unwrap_or_default();

            if body.get("sessionDescription").is_some() {
                // push: echo every announced track with its request mid
                let tracks: Vec<Value> = requested
                    .iter()
                    .map(|track| {
                        json!({
                            "trackName": track["trackName"],
                            "mid": track["mid"],
                            "sessionId": session_id,
                        })
                    })
                    .collect();
                return json!({
                    "sessionDescription": { "type": "answer", "sdp": "v=0 push-answer" },
                    "tracks": tracks,
                });
            }

            // pull: assign fresh MIDs and, when scripted, demand an
            // immediate renegotiation whose offer names them
            let mut mids = Vec::new();
            let tracks: Vec<Value> = requested
                .iter()
                .map(|track| {
                    let n = self.pull_mid_counter.fetch_add(1, Ordering::SeqCst);
                    let mid = format!("p{n}");
                    mids.push(mid.clone());
                    json!({
                        "trackName": track["trackName"],
                        "sessionId": track["sessionId"],
                        "mid": mid,
                    })
                })
                .collect();

            if self.pull_renegotiates.load(Ordering::SeqCst) {
                return json!({
                    "sessionDescription": {
                        "type": "offer",
                        "sdp": format!("v=0 pull-offer mids={}", mids.join(",")),
                    },
                    "requiresImmediateRenegotiation": true,
                    "tracks": tracks,
                });
            }
            return json!({ "tracks": tracks });
        }
        if path.ends_with("/renegotiate") {
            return json!({});
        }
        if path.ends_with("/tracks/update") {
            return json!({});
        }
        if path.ends_with("/tracks/close") {
            return json!({
                "sessionDescription": { "type": "answer", "sdp": "v=0 close-answer" }
            });
        }
        Value::Null
    }
}

#[async_trait]
impl HttpClient for MockSfu {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let path = request
            .url
            .split("https://sfu.test")
            .nth(1)
            .unwrap_or(&request.url)
            .split('?')
            .next()
            .unwrap_or("")
            .to_string();

        self.log.lock().push(LoggedRequest {
            method: request.method.as_str().to_string(),
            path: path.clone(),
            body: request.body.clone().unwrap_or(Value::Null),
        });

        let delay = self.response_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let body = self.respond(&request, &path);
        Ok(HttpResponse {
            status: 200,
            redirected: false,
            body,
        })
    }
}
