//! HTTP signaling with the voice gateway
//!
//! Creates a session (receiving the gateway's SDP offer) and submits the
//! local SDP answer. No ICE candidate endpoint exists, so answers are sent
//! only after gathering completes.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Path of the session creation endpoint under the gateway URL
const SESSION_PATH: &str = "/api/session";

/// Path of the answer submission endpoint under the gateway URL
const ANSWER_PATH: &str = "/api/session/answer";

/// Identifiers of a negotiated gateway session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Gateway session identifier
    pub session_id: String,
    /// Conversation thread identifier
    pub thread_id: String,
}

/// SDP description in the gateway's JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Raw SDP
    pub sdp: String,
    /// `offer` or `answer`
    #[serde(rename = "type")]
    pub sdp_type: String,
}

impl SessionDescription {
    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: "answer".to_string(),
        }
    }
}

/// Result of a successful session creation
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub info: SessionInfo,
    /// Gateway offer to apply as the remote description
    pub offer: SessionDescription,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    device_id: &'a str,
    toy_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
    thread_id: String,
    offer: SessionDescription,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitAnswerRequest<'a> {
    session_id: &'a str,
    answer: &'a SessionDescription,
}

/// Client for the gateway's signaling endpoints
#[derive(Debug, Clone)]
pub struct SignalingClient {
    gateway_url: String,
    client: reqwest::Client,
}

impl SignalingClient {
    /// Create a new signaling client
    #[must_use]
    pub fn new(gateway_url: &str) -> Self {
        Self {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured HTTP client (timeouts, proxies)
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Create a session and receive the gateway's offer
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for empty identifiers, `Error::Signaling` on a
    /// non-success status, or an HTTP/serialization error
    pub async fn create_session(
        &self,
        device_id: &str,
        toy_id: &str,
        user_id: Option<&str>,
    ) -> Result<CreatedSession> {
        require("device id", device_id)?;
        require("toy id", toy_id)?;

        let request = CreateSessionRequest {
            device_id,
            toy_id,
            user_id: user_id.filter(|u| !u.is_empty()),
        };

        tracing::debug!(device_id, toy_id, "creating gateway session");

        let response = self
            .client
            .post(format!("{}{SESSION_PATH}", self.gateway_url))
            .json(&request)
            .send()
            .await?;

        let response = check_status(response, "session creation").await?;
        let body: CreateSessionResponse = response.json().await?;

        if body.offer.sdp_type != "offer" {
            return Err(Error::Protocol(format!(
                "expected offer from gateway, got {}",
                body.offer.sdp_type
            )));
        }

        tracing::info!(
            session_id = %body.session_id,
            thread_id = %body.thread_id,
            "gateway session created"
        );

        Ok(CreatedSession {
            info: SessionInfo {
                session_id: body.session_id,
                thread_id: body.thread_id,
            },
            offer: body.offer,
        })
    }

    /// Submit the local answer for a session
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty session id, `Error::Signaling` on
    /// a non-success status, or an HTTP error
    pub async fn submit_answer(&self, session_id: &str, answer: &SessionDescription) -> Result<()> {
        require("session id", session_id)?;

        let response = self
            .client
            .post(format!("{}{ANSWER_PATH}", self.gateway_url))
            .json(&SubmitAnswerRequest { session_id, answer })
            .send()
            .await?;

        check_status(response, "answer submission").await?;
        tracing::debug!(session_id, "answer accepted by gateway");

        Ok(())
    }
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} must not be empty")));
    }
    Ok(())
}

/// Map a non-success response to `Error::Signaling` carrying its status text
async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let reason = status.canonical_reason().unwrap_or("unknown status");
    let message = if body.trim().is_empty() {
        reason.to_string()
    } else {
        format!("{reason}: {}", body.trim())
    };

    tracing::warn!(status = status.as_u16(), %message, "{what} failed");
    Err(Error::signaling(status.as_u16(), message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_omits_missing_user() {
        let json = serde_json::to_value(CreateSessionRequest {
            device_id: "dev-1",
            toy_id: "toy-1",
            user_id: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"deviceId": "dev-1", "toyId": "toy-1"}));
    }

    #[test]
    fn answer_request_shape() {
        let answer = SessionDescription::answer("v=0");
        let json = serde_json::to_value(SubmitAnswerRequest {
            session_id: "s-1",
            answer: &answer,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"sessionId": "s-1", "answer": {"sdp": "v=0", "type": "answer"}})
        );
    }

    #[test]
    fn parses_session_response() {
        let body: CreateSessionResponse = serde_json::from_str(
            r#"{"sessionId":"s-9","threadId":"t-9","offer":{"sdp":"v=0\r\n","type":"offer"}}"#,
        )
        .unwrap();
        assert_eq!(body.session_id, "s-9");
        assert_eq!(body.thread_id, "t-9");
        assert_eq!(body.offer.sdp_type, "offer");
    }

    #[tokio::test]
    async fn empty_identifiers_fail_before_network() {
        let client = SignalingClient::new("http://127.0.0.1:9");
        let err = client.create_session("", "toy", None).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = client
            .submit_answer(" ", &SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
