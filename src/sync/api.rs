//! Session HTTP API
//!
//! The request/response collaborator used around the WebSocket handshake:
//! authorization before joining, the full session record after joining, and
//! session creation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::network::protocol::Session;

/// Session API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request never got a response.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("{0}")]
    Rejected(String),

    /// Base URL cannot carry path segments.
    #[error("invalid API url {0:?}")]
    InvalidUrl(String),

    /// Success response with an unexpected body.
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Data for a new session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Roster limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
}

/// Session lifecycle calls made over HTTP.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Full session record.
    async fn get_session(&self, session_id: &str) -> Result<Session, ApiError>;

    /// Ask to be admitted. `Ok` means the WebSocket join may proceed.
    async fn join_session(&self, session_id: &str) -> Result<(), ApiError>;

    /// Create a session owned by the caller.
    async fn create_session(&self, data: &NewSession) -> Result<Session, ApiError>;
}

/// [`SessionApi`] over reqwest with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpSessionApi {
    /// API rooted at `base_url` (e.g. `http://localhost:3000/api`).
    pub fn new(base_url: &str, access_token: Option<String>) -> Result<Self, ApiError> {
        let parsed = Url::parse(base_url).map_err(|_| ApiError::InvalidUrl(base_url.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, base_url: parsed, access_token })
    }

    /// Base URL extended by `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn checked(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Rejected(rejection_message(status.as_u16(), &body)))
    }
}

/// Message of an error body `{ "error" | "message": ... }`, else the status.
fn rejection_message(status: u16, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["error", "message"]
                .iter()
                .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| format!("request failed with status {}", status))
}

/// Bodies either carry the session directly or wrap it as `{ "session": ... }`.
fn session_from_body(body: Value) -> Result<Session, ApiError> {
    let inner = match body {
        Value::Object(mut map) if map.contains_key("session") => {
            map.remove("session").unwrap_or(Value::Null)
        }
        other => other,
    };
    Ok(serde_json::from_value(inner)?)
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    #[instrument(skip(self))]
    async fn get_session(&self, session_id: &str) -> Result<Session, ApiError> {
        let request = self.client.get(self.url(&["sessions", session_id]));
        let response = Self::checked(self.authorized(request).send().await?).await?;
        session_from_body(response.json().await?)
    }

    #[instrument(skip(self))]
    async fn join_session(&self, session_id: &str) -> Result<(), ApiError> {
        let request = self.client.post(self.url(&["sessions", session_id, "join"]));
        Self::checked(self.authorized(request).send().await?).await?;
        debug!(session_id, "join authorized");
        Ok(())
    }

    #[instrument(skip(self, data), fields(name = %data.name))]
    async fn create_session(&self, data: &NewSession) -> Result<Session, ApiError> {
        let request = self.client.post(self.url(&["sessions"])).json(data);
        let response = Self::checked(self.authorized(request).send().await?).await?;
        session_from_body(response.json().await?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejection_message_prefers_error_field() {
        assert_eq!(rejection_message(403, r#"{"error":"Session is full"}"#), "Session is full");
        assert_eq!(rejection_message(404, r#"{"message":"Not found"}"#), "Not found");
        assert_eq!(rejection_message(500, "<html>"), "request failed with status 500");
    }

    #[test]
    fn test_session_body_wrapped_or_bare() {
        let bare = json!({
            "id": "s1",
            "name": "Crypt",
            "gmId": "gm",
            "players": [],
            "status": "active",
        });
        let wrapped = json!({ "session": bare.clone() });

        assert_eq!(session_from_body(bare).unwrap().id, "s1");
        assert_eq!(session_from_body(wrapped).unwrap().name, "Crypt");
        assert!(matches!(session_from_body(json!({"id": 3})), Err(ApiError::Decode(_))));
    }

    #[test]
    fn test_base_url_normalized() {
        let api = HttpSessionApi::new("http://localhost:3000/api/", None).unwrap();
        assert_eq!(api.url(&["sessions"]).as_str(), "http://localhost:3000/api/sessions");

        let api = HttpSessionApi::new("http://localhost:3000/api", None).unwrap();
        assert_eq!(api.url(&["sessions", "s1", "join"]).as_str(), "http://localhost:3000/api/sessions/s1/join");
    }

    #[test]
    fn test_session_id_cannot_change_route() {
        let api = HttpSessionApi::new("http://localhost:3000/api", None).unwrap();

        let url = api.url(&["sessions", "../admin?drop=1#x", "join"]);
        assert_eq!(url.path(), "/api/sessions/..%2Fadmin%3Fdrop=1%23x/join");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(url.path_segments().unwrap().count(), 4);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(HttpSessionApi::new("not a url", None), Err(ApiError::InvalidUrl(_))));
        assert!(matches!(
            HttpSessionApi::new("mailto:gm@example.com", None),
            Err(ApiError::InvalidUrl(_))
        ));
    }
}
