/*!
 * Remote repository interface and its XNAT implementation
 */

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE};
use reqwest::{Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::package::PackagingMethod;

const USER_AGENT: &str = concat!("xingest/", env!("CARGO_PKG_VERSION"));

/// Errors raised by the remote transport
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Credentials rejected or session expired
    #[error("Authentication failed ({status}): {message}")]
    Authentication { status: u16, message: String },

    /// Non-success HTTP status
    #[error("HTTP {status} from {operation}: {message}")]
    Http {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// The remote has not finished processing an upload
    #[error("Upload of {0} not confirmed by the remote")]
    Unconfirmed(String),

    /// Unexpected response body
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Check if this error is retriable (transient)
    pub fn is_retriable(&self) -> bool {
        match self {
            RemoteError::Timeout(_) | RemoteError::Connection(_) | RemoteError::Unconfirmed(_) => true,
            RemoteError::Http { status, .. } => *status >= 500 || *status == 429,
            RemoteError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            RemoteError::Authentication { .. } | RemoteError::Protocol(_) => false,
        }
    }

    /// Check if this error is related to authentication
    pub fn is_auth_error(&self) -> bool {
        matches!(self, RemoteError::Authentication { .. })
    }

    fn from_reqwest(operation: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout(format!("{}: {}", operation, err))
        } else if let Some(status) = err.status() {
            RemoteError::Http {
                operation: operation.to_string(),
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            RemoteError::Connection(format!("{}: {}", operation, err))
        }
    }
}

/// Opaque session token issued by the remote
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(Arc<str>);

impl SessionToken {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// Where one transfer unit lands on the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub project: String,
    pub subject: String,
    /// Session (experiment) label, the bundle directory name
    pub session: String,
    pub scan_id: String,
    pub scan_type: String,
    pub resource: String,
    /// Logical type recorded as the resource format
    pub format: String,
    pub file_count: usize,
}

impl fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.project, self.subject, self.session, self.scan_id, self.resource
        )
    }
}

/// Acknowledgement of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    /// The remote finished processing before responding
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Complete,
    Pending,
}

/// Session-based remote imaging repository
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Create a new authenticated session
    async fn authenticate(&self) -> Result<SessionToken, RemoteError>;

    /// Upload one packaged archive to `target`
    async fn upload(
        &self,
        token: &SessionToken,
        target: &UploadTarget,
        archive: &Path,
        method: PackagingMethod,
    ) -> Result<UploadReceipt, RemoteError>;

    /// Query whether the remote finished extracting an upload
    async fn processing_status(
        &self,
        token: &SessionToken,
        target: &UploadTarget,
    ) -> Result<ProcessingStatus, RemoteError>;
}

/// XNAT REST client
pub struct XnatClient {
    http: reqwest::Client,
    server: String,
    user: String,
    password: SecretString,
}

#[derive(Debug, Deserialize)]
struct FileListing {
    #[serde(rename = "ResultSet")]
    result_set: ResultSet,
}

#[derive(Debug, Deserialize)]
struct ResultSet {
    #[serde(rename = "Result", default)]
    result: Vec<serde_json::Value>,
}

impl XnatClient {
    pub fn new(
        server: &str,
        user: &str,
        password: SecretString,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RemoteError::Connection(e.to_string()))?;

        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password,
        })
    }

    fn session_url(&self, target: &UploadTarget) -> String {
        format!(
            "{}/data/projects/{}/subjects/{}/experiments/{}",
            self.server, target.project, target.subject, target.session
        )
    }

    fn resource_url(&self, target: &UploadTarget) -> String {
        format!(
            "{}/scans/{}/resources/{}",
            self.session_url(target),
            target.scan_id,
            target.resource
        )
    }

    async fn put(
        &self,
        token: &SessionToken,
        operation: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<(), RemoteError> {
        debug!(url = %url, operation, "PUT");
        let response = self
            .http
            .put(url)
            .query(query)
            .header(COOKIE, format!("JSESSIONID={}", token.value()))
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(operation, e))?;
        check_status(operation, response).await?;
        Ok(())
    }
}

async fn check_status(operation: &str, response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RemoteError::Authentication {
            status: status.as_u16(),
            message,
        });
    }
    Err(RemoteError::Http {
        operation: operation.to_string(),
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RemoteRepository for XnatClient {
    async fn authenticate(&self) -> Result<SessionToken, RemoteError> {
        let url = format!("{}/data/JSESSION", self.server);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest("authenticate", e))?;
        let response = check_status("authenticate", response).await?;
        let token = response
            .text()
            .await
            .map_err(|e| RemoteError::from_reqwest("authenticate", e))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(RemoteError::Protocol("empty session id".to_string()));
        }
        info!(server = %self.server, user = %self.user, "authenticated");
        Ok(SessionToken::new(token))
    }

    async fn upload(
        &self,
        token: &SessionToken,
        target: &UploadTarget,
        archive: &Path,
        method: PackagingMethod,
    ) -> Result<UploadReceipt, RemoteError> {
        let subject_url = format!(
            "{}/data/projects/{}/subjects/{}",
            self.server, target.project, target.subject
        );
        self.put(token, "create subject", &subject_url, &[]).await?;
        self.put(
            token,
            "create session",
            &self.session_url(target),
            &[("xsiType", "xnat:petSessionData")],
        )
        .await?;
        self.put(
            token,
            "create scan",
            &format!("{}/scans/{}", self.session_url(target), target.scan_id),
            &[("xsiType", "xnat:imageScanData"), ("type", target.scan_type.as_str())],
        )
        .await?;
        self.put(
            token,
            "create resource",
            &self.resource_url(target),
            &[("format", target.format.as_str())],
        )
        .await?;

        let file = tokio::fs::File::open(archive).await?;
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let url = format!("{}/files", self.resource_url(target));
        debug!(url = %url, bytes = length, "uploading archive");
        let response = self
            .http
            .put(&url)
            .query(&[("extract", "true"), ("overwrite", "true"), ("inbody", "true")])
            .header(COOKIE, format!("JSESSIONID={}", token.value()))
            .header(CONTENT_TYPE, method.content_type())
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest("upload archive", e))?;
        check_status("upload archive", response).await?;

        // Extraction happens asynchronously on the server
        Ok(UploadReceipt { confirmed: false })
    }

    async fn processing_status(
        &self,
        token: &SessionToken,
        target: &UploadTarget,
    ) -> Result<ProcessingStatus, RemoteError> {
        let url = format!("{}/files", self.resource_url(target));
        let response = self
            .http
            .get(&url)
            .query(&[("format", "json")])
            .header(COOKIE, format!("JSESSIONID={}", token.value()))
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest("status", e))?;
        let response = check_status("status", response).await?;
        let listing: FileListing = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        let found = listing.result_set.result.len();
        debug!(target = %target, found, expected = target.file_count, "resource file count");
        if found >= target.file_count {
            Ok(ProcessingStatus::Complete)
        } else {
            Ok(ProcessingStatus::Pending)
        }
    }
}
