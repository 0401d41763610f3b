//! Remote side of CAST: identity-provider tokens, CSAF document retrieval and
//! synchroniser task control.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cast-fetch";

/// Token endpoint of the isduba Keycloak realm, relative to the provider base.
pub const KEYCLOAK_TOKEN_PATH: &str = "/realms/isduba/protocol/openid-connect/token";

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub verify_ssl: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            verify_ssl: true,
        }
    }
}

fn build_client(settings: &HttpSettings) -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(settings.timeout)
        .danger_accept_invalid_certs(!settings.verify_ssl)
        .build()?;
    Ok(client)
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Token acquisition failures, split so operators can tell a wrong credential
/// from a dead host.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("login rejected by {endpoint}: {detail}")]
    LoginFailed { endpoint: String, detail: String },
    #[error("cannot reach {endpoint}: {detail}")]
    ConnectionFailed { endpoint: String, detail: String },
    #[error("unexpected token response from {endpoint}: {detail}")]
    Unknown { endpoint: String, detail: String },
}

impl TokenError {
    /// Short state string shown in synchroniser listings.
    pub fn state_label(&self) -> &'static str {
        match self {
            Self::LoginFailed { .. } => "Login Failed",
            Self::ConnectionFailed { .. } => "Connection Failed",
            Self::Unknown { .. } => "Unknown Error",
        }
    }
}

fn classify_send_error(endpoint: &str, err: reqwest::Error) -> TokenError {
    if err.is_connect() || err.is_timeout() {
        TokenError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            detail: err.to_string(),
        }
    } else {
        TokenError::Unknown {
            endpoint: endpoint.to_string(),
            detail: err.to_string(),
        }
    }
}

/// Bearer-token client for the identity provider and for synchroniser
/// subsystems (which run their own simplified token endpoint).
pub struct TokenClient {
    client: reqwest::Client,
}

impl TokenClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_client(settings)?,
        })
    }

    /// Password-grant login against the Keycloak realm.
    pub async fn keycloak_token(
        &self,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<String, TokenError> {
        let endpoint = format!("{}{}", base_url.trim_end_matches('/'), KEYCLOAK_TOKEN_PATH);
        let form = [
            ("grant_type", "password"),
            ("client_id", "auth"),
            ("username", username),
            ("password", password),
        ];
        self.request_token(&endpoint, &form).await
    }

    /// Subsystem login: plain username/password form, no grant_type.
    pub async fn subsystem_token(
        &self,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<String, TokenError> {
        let endpoint = format!("{}/token", base_url.trim_end_matches('/'));
        let form = [("username", username), ("password", password)];
        self.request_token(&endpoint, &form).await
    }

    async fn request_token(
        &self,
        endpoint: &str,
        form: &[(&str, &str)],
    ) -> Result<String, TokenError> {
        debug!(endpoint, "requesting access token");
        let response = self
            .client
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|err| classify_send_error(endpoint, err))?;

        let status = response.status();
        let body = response.text().await.map_err(|err| TokenError::Unknown {
            endpoint: endpoint.to_string(),
            detail: err.to_string(),
        })?;

        if !status.is_success() {
            return Err(TokenError::LoginFailed {
                endpoint: endpoint.to_string(),
                detail: format!("HTTP {status}: {body}"),
            });
        }

        let value: Value = serde_json::from_str(&body).map_err(|err| TokenError::Unknown {
            endpoint: endpoint.to_string(),
            detail: format!("token response is not JSON: {err}"),
        })?;
        match path_str(&value, &["access_token"]) {
            Some(token) => Ok(token.to_string()),
            None => Err(TokenError::Unknown {
                endpoint: endpoint.to_string(),
                detail: "no access_token in response".to_string(),
            }),
        }
    }
}

/// Short-circuiting optional-path traversal: `None` as soon as any level is
/// missing or not an object.
pub fn try_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

pub fn path_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    try_path(value, path).and_then(Value::as_str)
}

pub fn path_f64(value: &Value, path: &[&str]) -> Option<f64> {
    try_path(value, path).and_then(Value::as_f64)
}

/// The four advisory fields carried by a CSAF payload; each defaults
/// independently when its path does not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentFields {
    pub title: Option<String>,
    pub lang: Option<String>,
    pub version: Option<String>,
    pub publisher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentPayload {
    /// The cache answered with its in-band not-found marker.
    NotFound,
    Loaded(DocumentFields),
}

pub fn extract_document_fields(payload: &Value) -> DocumentPayload {
    if path_f64(payload, &["code"]) == Some(404.0) {
        return DocumentPayload::NotFound;
    }
    DocumentPayload::Loaded(DocumentFields {
        title: path_str(payload, &["document", "title"]).map(str::to_string),
        lang: path_str(payload, &["document", "lang"]).map(str::to_string),
        version: path_str(payload, &["document", "tracking", "version"]).map(str::to_string),
        publisher: path_str(payload, &["document", "publisher", "name"]).map(str::to_string),
    })
}

/// The document version field doubles as a fetch-attempt counter: unparseable
/// or absent resets to "1", otherwise it increments. Observed behavior of the
/// upstream system, preserved as-is.
pub fn bump_fetch_attempt(version: Option<&str>) -> String {
    match version.and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(n) => (n + 1).to_string(),
        None => "1".to_string(),
    }
}

/// Authenticated retrieval of CSAF documents from the remote cache.
pub struct DocumentFetcher {
    client: reqwest::Client,
}

impl DocumentFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_client(settings)?,
        })
    }

    pub async fn fetch_document(&self, docurl: &str, token: &str) -> Result<Value, FetchError> {
        let response = self.client.get(docurl).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: docurl.to_string(),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

/// Operator-action failures carry the subsystem's own response text; they are
/// shown, not retried.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("request to {url} failed: {detail}")]
    Request { url: String, detail: String },
    #[error("{url} answered {status}: {detail}")]
    Rejected { url: String, status: u16, detail: String },
}

/// Task-control client for synchroniser subsystems.
pub struct SubsystemClient {
    client: reqwest::Client,
}

impl SubsystemClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_client(settings)?,
        })
    }

    pub async fn task_status(&self, base_url: &str, token: &str) -> Result<Value, FetchError> {
        let url = format!("{}/task/status", base_url.trim_end_matches('/'));
        let response = self.client.get(&url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.json::<Value>().await?)
    }

    /// POST a task action (`start`, `stop`, `trigger`) with an optional JSON
    /// body of trigger filters.
    pub async fn task_action(
        &self,
        base_url: &str,
        token: &str,
        action: &str,
        body: Option<&Value>,
    ) -> Result<(), ActionError> {
        let url = format!("{}/task/{}", base_url.trim_end_matches('/'), action);
        let mut request = self.client.post(&url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|err| ActionError::Request {
            url: url.clone(),
            detail: err.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ActionError::Rejected {
                url,
                status: status.as_u16(),
                detail,
            });
        }
        Ok(())
    }
}
