//! Anti-forgery (CSRF) token acquisition and refresh.
//!
//! The backend hands out a short-lived token in response to a metadata probe
//! carrying `X-CSRF-Token: Fetch`. State-changing requests must echo it back.
//! A missing token is never fatal here: if the backend really needs one, the
//! submission call itself fails and is scored like any other failure.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::http::{HttpClient, HttpRequest};

/// Header value requesting a fresh token.
pub const FETCH: &str = "Fetch";
/// Header value meaning the backend could not hand one out.
pub const REQUIRED: &str = "Required";

/// How the current token came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenFreshness {
    Present,
    Absent,
    /// Re-fetched after the backend rejected the previous one
    Retried,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    pub value: Option<String>,
    pub retried: bool,
    /// A probe already ran; an absent value stays absent until invalidated
    pub fetched: bool,
}

impl Token {
    pub fn freshness(&self) -> TokenFreshness {
        match (&self.value, self.retried) {
            (_, true) => TokenFreshness::Retried,
            (Some(_), false) => TokenFreshness::Present,
            (None, false) => TokenFreshness::Absent,
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

/// Owns the session token for one service root.
///
/// The token is the only state shared across a whole submission. The async
/// mutex is held across the probe so concurrent callers never probe twice.
pub struct SessionTokenManager<H: HttpClient> {
    http_client: Arc<H>,
    service_root: String,
    header_name: String,
    extra_headers: Vec<(String, String)>,
    timeout_ms: u64,
    token: Mutex<Token>,
}

impl<H: HttpClient> SessionTokenManager<H> {
    pub fn new(http_client: Arc<H>, service_root: impl Into<String>) -> Self {
        Self {
            http_client,
            service_root: service_root.into(),
            header_name: "X-CSRF-Token".to_string(),
            extra_headers: Vec::new(),
            timeout_ms: 30_000,
            token: Mutex::new(Token::default()),
        }
    }

    pub fn with_header_name(mut self, header_name: impl Into<String>) -> Self {
        self.header_name = header_name.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Static headers added to the probe (e.g., `sap-client`).
    pub fn with_extra_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.extra_headers = headers;
        self
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Return the cached token, probing the backend if none was fetched yet.
    ///
    /// An absent result is cached too. Only `invalidate`, `clear_retried` and
    /// `refresh_after_rejection` make the next call probe again.
    pub async fn ensure_token(&self) -> Token {
        let mut token = self.token.lock().await;
        if token.is_present() || token.fetched {
            return token.clone();
        }
        token.value = self.probe().await;
        token.fetched = true;
        token.clone()
    }

    /// Drop the cached token so the next `ensure_token` probes again.
    pub async fn invalidate(&self) {
        let mut token = self.token.lock().await;
        token.value = None;
        token.fetched = false;
    }

    pub async fn mark_retried(&self) {
        self.token.lock().await.retried = true;
    }

    /// Reset per-submission state. A present token is kept; an absent one
    /// is probed for again on the next `ensure_token`.
    pub async fn clear_retried(&self) {
        let mut token = self.token.lock().await;
        token.retried = false;
        if !token.is_present() {
            token.fetched = false;
        }
    }

    pub async fn current(&self) -> Token {
        self.token.lock().await.clone()
    }

    /// Replace a token the backend just rejected.
    ///
    /// `rejected` is the token the failing request was sent with. If another
    /// unit of work already swapped it for a fresh one, that one is returned
    /// without probing again.
    #[tracing::instrument(skip(self, rejected), fields(service_root = %self.service_root))]
    pub async fn refresh_after_rejection(&self, rejected: &Token) -> Token {
        let mut token = self.token.lock().await;
        token.retried = true;

        if token.is_present() && token.value != rejected.value {
            tracing::debug!("Token already refreshed by a concurrent request");
            return token.clone();
        }

        counter!("broadside_token_refresh_total").increment(1);
        token.value = self.probe().await;
        token.fetched = true;
        tracing::info!(
            freshness = ?token.freshness(),
            "Refreshed CSRF token after rejection"
        );
        token.clone()
    }

    async fn probe(&self) -> Option<String> {
        let mut request = HttpRequest::new("HEAD", &self.service_root, "/")
            .header(self.header_name.as_str(), FETCH);
        for (name, value) in &self.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match self.http_client.execute(&request, self.timeout_ms).await {
            Ok(response) => match response.header(&self.header_name) {
                Some(value)
                    if response.is_success()
                        && !value.trim().is_empty()
                        && !value.eq_ignore_ascii_case(REQUIRED) =>
                {
                    tracing::debug!(status = response.status, "Fetched CSRF token");
                    Some(value.trim().to_string())
                }
                other => {
                    tracing::warn!(
                        status = response.status,
                        header = ?other,
                        "Token probe returned no usable token, continuing without one"
                    );
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Token probe failed, continuing without a token");
                None
            }
        }
    }
}
