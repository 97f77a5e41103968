//! The PBX OpenAPI client.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;

use crate::error::PbxError;

/// Error codes the provider uses for an expired or invalid access token.
const TOKEN_EXPIRED_CODES: [i64; 2] = [10002, 10003];

/// Connection settings for the PBX API.
#[derive(Debug, Clone)]
pub struct PbxConfig {
    /// Base URL of the provider, e.g. `https://tenant.example-pbx.com`.
    pub base_url: String,
    /// API client id (sent as the token-endpoint username).
    pub client_id: String,
    /// API client secret (sent as the token-endpoint password).
    pub client_secret: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

/// One extension as reported by the provider's extension list.
#[derive(Debug, Clone, Deserialize)]
pub struct PbxExtension {
    pub number: String,
    #[serde(default, rename = "caller_id_name")]
    pub name: Option<String>,
    #[serde(default, rename = "presence_status")]
    pub presence: Option<String>,
}

/// One page of CDR search results. Records are kept as raw JSON; the
/// normalizer owns interpretation so the webhook and poll paths share it.
#[derive(Debug, Clone)]
pub struct CdrPage {
    pub records: Vec<Value>,
    pub total: u64,
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// Authenticated client for the PBX OpenAPI.
///
/// Cheap to share behind an `Arc`; the token state is internally
/// synchronized so concurrent callers reuse one login.
pub struct PbxClient {
    http: reqwest::Client,
    config: PbxConfig,
    token: Mutex<TokenState>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Token lifetime in seconds.
    #[serde(default)]
    access_token_expire_time: Option<i64>,
}

impl PbxClient {
    pub fn new(config: PbxConfig) -> Result<Self, PbxError> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PbxError::Protocol(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(TokenState::default()),
        })
    }

    /// Lists all extensions known to the PBX.
    pub async fn extension_list(&self) -> Result<Vec<PbxExtension>, PbxError> {
        let body = self.api_get("/openapi/v1.0/extension/list", &[]).await?;
        let data = body.get("data").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(data)
            .map_err(|e| PbxError::Protocol(format!("unexpected extension list shape: {e}")))
    }

    /// Fetches one page of CDRs in the inclusive `[start_time, end_time]`
    /// window. Timestamps use the provider's `YYYY-MM-DD HH:MM:SS` format.
    pub async fn cdr_page(
        &self,
        start_time: &str,
        end_time: &str,
        page: u32,
        page_size: u32,
    ) -> Result<CdrPage, PbxError> {
        let body = self
            .api_get(
                "/openapi/v1.0/cdr/search",
                &[
                    ("start_time".to_string(), start_time.to_string()),
                    ("end_time".to_string(), end_time.to_string()),
                    ("page".to_string(), page.to_string()),
                    ("page_size".to_string(), page_size.to_string()),
                    ("sort_by".to_string(), "time".to_string()),
                    ("order_by".to_string(), "asc".to_string()),
                ],
            )
            .await?;

        let records = match body.get("data") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let total = body
            .get("total_number")
            .and_then(Value::as_u64)
            .unwrap_or(records.len() as u64);
        Ok(CdrPage { records, total })
    }

    /// Checks whether a recording reference exists on the provider.
    pub async fn recording_exists(&self, reference: &str) -> Result<bool, PbxError> {
        match self.recording_resource_url(reference).await {
            Ok(_) => Ok(true),
            Err(PbxError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Downloads a recording by its provider reference.
    ///
    /// Two steps, per the provider API: resolve the reference to a
    /// short-lived resource URL, then fetch the bytes from it.
    pub async fn download_recording(&self, reference: &str) -> Result<Vec<u8>, PbxError> {
        let resource_url = self.recording_resource_url(reference).await?;
        let token = self.ensure_authenticated().await?;

        let url = if resource_url.starts_with("http") {
            resource_url
        } else {
            format!("{}{}", self.config.base_url, resource_url)
        };

        let resp = self
            .http
            .get(&url)
            .query(&[("access_token", token.as_str())])
            .header("User-Agent", "OpenAPI")
            .send()
            .await?
            .error_for_status()?;

        let bytes = resp.bytes().await?;
        tracing::debug!(reference, bytes = bytes.len(), "downloaded recording");
        Ok(bytes.to_vec())
    }

    async fn recording_resource_url(&self, reference: &str) -> Result<String, PbxError> {
        let body = self
            .api_get(
                "/openapi/v1.0/recording/download",
                &[("file".to_string(), reference.to_string())],
            )
            .await?;
        body.get("download_resource_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PbxError::Protocol("download response missing resource url".to_string())
            })
    }

    /// Performs an authenticated GET, re-authenticating once on a
    /// token-expired error code.
    async fn api_get(&self, path: &str, query: &[(String, String)]) -> Result<Value, PbxError> {
        let mut reauthed = false;
        loop {
            let token = self.ensure_authenticated().await?;
            let url = format!("{}{}", self.config.base_url, path);

            let resp = self
                .http
                .get(&url)
                .query(&[("access_token", token.as_str())])
                .query(query)
                .header("User-Agent", "OpenAPI")
                .send()
                .await?
                .error_for_status()?;

            let body: Value = resp
                .json()
                .await
                .map_err(|e| PbxError::Protocol(format!("invalid JSON from provider: {e}")))?;

            let errcode = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
            if errcode == 0 {
                return Ok(body);
            }

            if TOKEN_EXPIRED_CODES.contains(&errcode) && !reauthed {
                tracing::debug!(path, errcode, "access token rejected, re-authenticating");
                self.token.lock().await.access_token = None;
                reauthed = true;
                continue;
            }

            let errmsg = body
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error");
            return Err(classify_api_error(errcode, errmsg));
        }
    }

    /// Returns a valid access token, logging in or refreshing as needed.
    async fn ensure_authenticated(&self) -> Result<String, PbxError> {
        let mut state = self.token.lock().await;

        if let (Some(token), Some(expires_at)) = (&state.access_token, state.expires_at) {
            if Utc::now() < expires_at {
                return Ok(token.clone());
            }
        }

        // Prefer refresh when we hold a refresh token; fall back to a full
        // login if the refresh is rejected.
        if let Some(refresh_token) = state.refresh_token.clone() {
            match self
                .token_request(
                    "/openapi/v1.0/refresh_token",
                    serde_json::json!({ "refresh_token": refresh_token }),
                )
                .await
            {
                Ok(resp) => {
                    apply_token_response(&mut state, resp)?;
                    if let Some(token) = &state.access_token {
                        return Ok(token.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!("token refresh failed, attempting full login: {e}");
                }
            }
        }

        let resp = self
            .token_request(
                "/openapi/v1.0/get_token",
                serde_json::json!({
                    "username": self.config.client_id,
                    "password": self.config.client_secret,
                }),
            )
            .await?;
        apply_token_response(&mut state, resp)?;
        state
            .access_token
            .clone()
            .ok_or_else(|| PbxError::Auth("provider returned no access token".to_string()))
    }

    async fn token_request(
        &self,
        path: &str,
        payload: Value,
    ) -> Result<TokenResponse, PbxError> {
        let url = format!("{}{}", self.config.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("User-Agent", "OpenAPI")
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| PbxError::Protocol(format!("invalid token response: {e}")))
    }
}

fn apply_token_response(state: &mut TokenState, resp: TokenResponse) -> Result<(), PbxError> {
    if resp.errcode != 0 {
        let msg = resp.errmsg.unwrap_or_else(|| "unknown error".to_string());
        // Provider-side rate limiting is transient; real credential
        // rejections are not.
        if msg.to_uppercase().contains("MAX LIMITATION") {
            return Err(PbxError::Unavailable(format!("login rate limited: {msg}")));
        }
        return Err(PbxError::Auth(msg));
    }

    let expires_in = resp.access_token_expire_time.unwrap_or(1800);
    state.access_token = resp.access_token;
    state.refresh_token = resp.refresh_token;
    // Refresh one minute early so in-flight requests do not race expiry.
    state.expires_at = Some(Utc::now() + Duration::seconds(expires_in.saturating_sub(60)));
    tracing::info!("authenticated with PBX provider");
    Ok(())
}

fn classify_api_error(errcode: i64, errmsg: &str) -> PbxError {
    let upper = errmsg.to_uppercase();
    if upper.contains("NOT FOUND") || upper.contains("NOT EXIST") {
        return PbxError::NotFound(format!("errcode {errcode}: {errmsg}"));
    }
    if upper.contains("MAX LIMITATION") || upper.contains("TOO MANY") {
        return PbxError::Unavailable(format!("errcode {errcode}: {errmsg}"));
    }
    if TOKEN_EXPIRED_CODES.contains(&errcode) {
        return PbxError::Auth(format!("errcode {errcode}: {errmsg}"));
    }
    PbxError::Protocol(format!("errcode {errcode}: {errmsg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_provider_messages() {
        assert!(matches!(
            classify_api_error(404011, "record not found"),
            PbxError::NotFound(_)
        ));
        assert!(matches!(
            classify_api_error(10001, "MAX LIMITATION reached"),
            PbxError::Unavailable(_)
        ));
        assert!(matches!(
            classify_api_error(10002, "token invalid"),
            PbxError::Auth(_)
        ));
        assert!(matches!(
            classify_api_error(42, "mystery"),
            PbxError::Protocol(_)
        ));
    }

    #[test]
    fn token_response_updates_expiry_with_margin() {
        let mut state = TokenState::default();
        let resp = TokenResponse {
            errcode: 0,
            errmsg: None,
            access_token: Some("tok".to_string()),
            refresh_token: Some("ref".to_string()),
            access_token_expire_time: Some(1800),
        };
        apply_token_response(&mut state, resp).expect("should apply");

        assert_eq!(state.access_token.as_deref(), Some("tok"));
        let expires_at = state.expires_at.expect("expiry should be set");
        let remaining = expires_at - Utc::now();
        assert!(remaining <= Duration::seconds(1740));
        assert!(remaining > Duration::seconds(1600));
    }

    #[test]
    fn rate_limited_login_is_retryable() {
        let mut state = TokenState::default();
        let resp = TokenResponse {
            errcode: 20001,
            errmsg: Some("reach max limitation of request".to_string()),
            access_token: None,
            refresh_token: None,
            access_token_expire_time: None,
        };
        let err = apply_token_response(&mut state, resp).expect_err("should fail");
        assert!(err.is_retryable());
    }
}
