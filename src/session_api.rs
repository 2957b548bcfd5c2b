use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::proto::{is_ok_flag, join_errors};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const ACCOUNT_HEADER: &str = "X-Auth-Account";
const TOKEN_HEADER: &str = "X-Auth-Token";
pub const SESSION_API_BASE_URL: &str = "https://ws.flowthings.io";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionApiDefaults;

impl SessionApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Account credentials exchanged for a session id.
#[derive(Clone)]
pub struct Credentials {
    pub account_id: String,
    pub token: SecretString,
}

impl Credentials {
    pub fn new(account_id: impl Into<String>, token: SecretString) -> Self {
        Self {
            account_id: account_id.into(),
            token,
        }
    }

    /// Checks that both fields are present before any network activity.
    pub fn validate(&self) -> Result<(), CredentialsError> {
        if self.account_id.trim().is_empty() {
            return Err(CredentialsError::MissingAccountId);
        }
        if self.token.expose_secret().trim().is_empty() {
            return Err(CredentialsError::MissingToken);
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum CredentialsError {
    #[error("provide account id and token: account id is missing")]
    MissingAccountId,

    #[error("provide account id and token: token is missing")]
    MissingToken,
}

/// Server-assigned id scoping one streaming connection.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        (!id.trim().is_empty()).then_some(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct SessionApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SessionApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SessionApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: SessionApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::acquisition(),
        }
    }
}

/// HTTP client for the session acquisition exchange.
#[derive(Clone, Debug)]
pub struct SessionApiClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl SessionApiClient {
    pub fn new() -> Result<Self, SessionApiError> {
        Self::with_options(SessionApiClientOptions::default())
    }

    pub fn with_options(options: SessionApiClientOptions) -> Result<Self, SessionApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(SessionApiError::Transport)?;

        Ok(Self {
            http,
            base_url: SESSION_API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Overrides the service base URL (scheme and host, no trailing path).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges credentials for a session id.
    ///
    /// Transient transport failures are retried according to the client's
    /// retry policy; server rejections are returned immediately.
    pub async fn acquire_session(
        &self,
        credentials: &Credentials,
    ) -> Result<SessionId, SessionApiError> {
        let endpoint = format!("{}/session", self.base_url);

        retry_async(
            &self.retry_policy,
            |attempt| {
                let endpoint = endpoint.as_str();
                async move {
                    debug!(event = "session_acquire_attempt", attempt, endpoint);
                    self.send_attempt(endpoint, credentials).await
                }
            },
            SessionApiError::is_retryable,
        )
        .await
    }

    async fn send_attempt(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<SessionId, SessionApiError> {
        let response = self
            .http
            .post(endpoint)
            .timeout(self.attempt_timeout)
            .header(ACCOUNT_HEADER, credentials.account_id.as_str())
            .header(TOKEN_HEADER, credentials.token.expose_secret())
            .send()
            .await
            .map_err(SessionApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(SessionApiError::Transport)?;

        match parse_session_response(&body) {
            Err(SessionApiError::Parse(_)) if !status.is_success() => {
                Err(SessionApiError::HttpStatus {
                    status,
                    body: summarize_error_body(&body),
                })
            }
            outcome => outcome,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionApiError {
    #[error("session request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Non-ok acknowledgement; `message` holds the server errors, one per line.
    #[error("session rejected: {message}")]
    Rejected { message: String },

    #[error("no session id in acknowledgement")]
    MissingSessionId,

    #[error("failed to parse session response: {0}")]
    Parse(String),
}

impl SessionApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Rejected { .. } | Self::MissingSessionId | Self::Parse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    head: SessionHead,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Deserialize)]
struct SessionHead {
    #[serde(default)]
    ok: Value,
}

fn parse_session_response(body: &str) -> Result<SessionId, SessionApiError> {
    let envelope: SessionEnvelope =
        serde_json::from_str(body).map_err(|err| SessionApiError::Parse(err.to_string()))?;

    if !is_ok_flag(&envelope.head.ok) {
        return Err(SessionApiError::Rejected {
            message: join_errors(&envelope.body),
        });
    }

    envelope
        .body
        .get("id")
        .and_then(Value::as_str)
        .and_then(SessionId::new)
        .ok_or(SessionApiError::MissingSessionId)
}

fn summarize_error_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{
        parse_session_response, Credentials, CredentialsError, SessionApiClient,
        SessionApiError, SESSION_API_BASE_URL,
    };

    fn credentials(account: &str, token: &str) -> Credentials {
        Credentials::new(account, SecretString::new(token.to_string()))
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert_eq!(
            credentials("", "token").validate(),
            Err(CredentialsError::MissingAccountId)
        );
        assert_eq!(
            credentials("   ", "token").validate(),
            Err(CredentialsError::MissingAccountId)
        );
        assert_eq!(
            credentials("a001", "").validate(),
            Err(CredentialsError::MissingToken)
        );
        assert_eq!(
            credentials("", "").validate(),
            Err(CredentialsError::MissingAccountId)
        );
        assert!(credentials("a001", "token").validate().is_ok());
    }

    #[test]
    fn debug_output_redacts_token() {
        let rendered = format!("{:?}", credentials("a001", "super-secret"));
        assert!(rendered.contains("a001"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn parse_accepts_boolean_and_string_ok() {
        let id = parse_session_response(r#"{"head":{"ok":true},"body":{"id":"s1"}}"#)
            .expect("boolean ok");
        assert_eq!(id.as_str(), "s1");

        let id = parse_session_response(r#"{"head":{"ok":"true","status":200},"body":{"id":"s2"}}"#)
            .expect("string ok");
        assert_eq!(id.as_str(), "s2");
    }

    #[test]
    fn parse_joins_server_errors_on_rejection() {
        let error = parse_session_response(
            r#"{"head":{"ok":false},"body":{"errors":["invalid token","account locked"]}}"#,
        )
        .expect_err("rejected");

        match error {
            SessionApiError::Rejected { message } => {
                assert_eq!(message, "invalid token\naccount locked");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn parse_treats_other_ok_values_as_rejection() {
        for payload in [
            r#"{"head":{"ok":"false"},"body":{"errors":["no"]}}"#,
            r#"{"head":{"ok":1},"body":{"id":"s1"}}"#,
            r#"{"head":{},"body":{"id":"s1"}}"#,
        ] {
            assert!(matches!(
                parse_session_response(payload),
                Err(SessionApiError::Rejected { .. })
            ));
        }
    }

    #[test]
    fn parse_requires_session_id() {
        assert!(matches!(
            parse_session_response(r#"{"head":{"ok":true},"body":{}}"#),
            Err(SessionApiError::MissingSessionId)
        ));
        assert!(matches!(
            parse_session_response(r#"{"head":{"ok":true},"body":{"id":""}}"#),
            Err(SessionApiError::MissingSessionId)
        ));
        assert!(matches!(
            parse_session_response("<html>bad gateway</html>"),
            Err(SessionApiError::Parse(_))
        ));
    }

    #[test]
    fn rejections_are_not_retryable() {
        let error = SessionApiError::Rejected {
            message: "no".to_string(),
        };
        assert!(!error.is_retryable());
        assert!(!SessionApiError::MissingSessionId.is_retryable());
    }

    #[test]
    fn base_url_override_strips_trailing_slash() {
        let client = SessionApiClient::new().expect("build client");
        assert_eq!(client.base_url(), SESSION_API_BASE_URL);

        let client = client.with_base_url("http://127.0.0.1:9000/ ");
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
    }
}
