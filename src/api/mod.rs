//! Typed client for the SFU HTTP API
//!
//! Every exchange is recorded to a bounded history ring for diagnostics,
//! regardless of outcome.

pub mod http;
pub mod protocol;

use crate::config::IceServerConfig;
use crate::history::{HistoryEntry, HistoryKind, RequestHistory};
use crate::{Error, Result};
use http::{HttpClient, HttpMethod, HttpRequest};
use parking_lot::Mutex;
use protocol::*;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// Typed SFU API client
///
/// Applies the configured prefix, extra query parameters and headers to
/// every call, maps SFU-reported `errorCode`s to [`Error::Sfu`] and
/// redirect responses to [`Error::SessionExpired`].
pub struct SfuApi {
    client: Arc<dyn HttpClient>,
    base_url: String,
    prefix: String,
    extra_params: Option<String>,
    headers: Vec<(String, String)>,
    history: Mutex<RequestHistory>,
}

impl SfuApi {
    pub fn new(client: Arc<dyn HttpClient>, config: &crate::config::PartyTracksConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            prefix: config.prefix.clone(),
            extra_params: config.api_extra_params.clone(),
            headers: config.headers.clone(),
            history: Mutex::new(RequestHistory::new(config.max_api_history)),
        }
    }

    fn url(&self, path: &str) -> String {
        match &self.extra_params {
            Some(params) => format!("{}{}{}?{}", self.base_url, self.prefix, path, params),
            None => format!("{}{}{}", self.base_url, self.prefix, path),
        }
    }

    async fn call<Resp>(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        self.history.lock().record(HistoryEntry {
            kind: HistoryKind::Request,
            endpoint: path.to_string(),
            method: method.as_str().to_string(),
            body: body.clone().unwrap_or(serde_json::Value::Null),
        });

        let response = self
            .client
            .fetch(HttpRequest {
                method,
                url: self.url(path),
                headers: self.headers.clone(),
                body,
            })
            .await;

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                self.history.lock().record(HistoryEntry {
                    kind: HistoryKind::Response,
                    endpoint: path.to_string(),
                    method: method.as_str().to_string(),
                    body: serde_json::json!({ "error": err.to_string() }),
                });
                return Err(err);
            }
        };

        self.history.lock().record(HistoryEntry {
            kind: HistoryKind::Response,
            endpoint: path.to_string(),
            method: method.as_str().to_string(),
            body: response.body.clone(),
        });

        if response.redirected {
            return Err(Error::SessionExpired(format!(
                "{path} answered with a redirect"
            )));
        }
        if !response.is_success() {
            if response.status >= 500 {
                return Err(Error::SessionExpired(format!(
                    "{path} returned HTTP {}",
                    response.status
                )));
            }
            return Err(Error::Http(format!(
                "{path} returned HTTP {}",
                response.status
            )));
        }

        serde_json::from_value(response.body)
            .map_err(|e| Error::Protocol(format!("malformed response from {path}: {e}")))
    }

    /// `POST /sessions/new`
    pub async fn new_session(&self) -> Result<String> {
        let resp: NewSessionResponse = self
            .call(HttpMethod::Post, "/sessions/new", None)
            .await?;
        debug!(session_id = %resp.session_id, "created SFU session");
        Ok(resp.session_id)
    }

    /// `GET /generate-ice-servers`
    pub async fn ice_servers(&self) -> Result<Vec<IceServerConfig>> {
        let resp: IceServersResponse = self
            .call(HttpMethod::Get, "/generate-ice-servers", None)
            .await?;
        Ok(resp.ice_servers)
    }

    /// `POST /sessions/{id}/tracks/new`, covering both the push (with offer) and
    /// pull (descriptors only) shapes
    pub async fn tracks_new(
        &self,
        session_id: &str,
        request: &TracksRequest,
    ) -> Result<TracksResponse> {
        let path = format!("/sessions/{session_id}/tracks/new");
        let body = serde_json::to_value(request)
            .map_err(|e| Error::Protocol(format!("unserializable request: {e}")))?;
        let resp: TracksResponse = self.call(HttpMethod::Post, &path, Some(body)).await?;
        resp.check()?;
        Ok(resp)
    }

    /// `PUT /sessions/{id}/renegotiate`
    pub async fn renegotiate(
        &self,
        session_id: &str,
        answer: SessionDescription,
    ) -> Result<()> {
        let path = format!("/sessions/{session_id}/renegotiate");
        let body = serde_json::to_value(RenegotiateRequest {
            session_description: answer,
        })
        .map_err(|e| Error::Protocol(format!("unserializable request: {e}")))?;
        let resp: RenegotiateResponse = self.call(HttpMethod::Put, &path, Some(body)).await?;
        resp.check()
    }

    /// `PUT /sessions/{id}/tracks/update`; the response body is ignored
    pub async fn update_tracks(
        &self,
        session_id: &str,
        request: &UpdateTracksRequest,
    ) -> Result<()> {
        let path = format!("/sessions/{session_id}/tracks/update");
        let body = serde_json::to_value(request)
            .map_err(|e| Error::Protocol(format!("unserializable request: {e}")))?;
        let _: serde_json::Value = self.call(HttpMethod::Put, &path, Some(body)).await?;
        Ok(())
    }

    /// `PUT /sessions/{id}/tracks/close`
    pub async fn close_tracks(
        &self,
        session_id: &str,
        request: &CloseTracksRequest,
    ) -> Result<CloseTracksResponse> {
        let path = format!("/sessions/{session_id}/tracks/close");
        let body = serde_json::to_value(request)
            .map_err(|e| Error::Protocol(format!("unserializable request: {e}")))?;
        let resp: CloseTracksResponse = self.call(HttpMethod::Put, &path, Some(body)).await?;
        resp.check()?;
        Ok(resp)
    }

    /// Copy of the request/response history, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().snapshot()
    }
}
