//! Findings-tracker client.

use super::model::{
    EngagementPage, EngagementRef, EngagementRequest, ImportScanRequest, ImportScanResponse,
};
use super::retry::RetryPolicy;
use crate::errors::{truncate_body, TrackerError};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use std::fmt::Debug;
use std::time::Duration;
use tracing::debug;

/// Operations the publisher needs from the findings tracker.
///
/// Every call carries the API token it authenticates with; clients never
/// hold one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackerClient: Send + Sync + Debug {
    /// Looks up an engagement by exact name.
    async fn find_engagement(
        &self,
        name: &str,
        token: &SecretString,
    ) -> Result<Option<EngagementRef>, TrackerError>;

    /// Creates an engagement.
    async fn create_engagement(
        &self,
        request: &EngagementRequest,
        token: &SecretString,
    ) -> Result<EngagementRef, TrackerError>;

    /// Uploads one scan artifact.
    async fn import_scan(
        &self,
        request: ImportScanRequest,
        token: &SecretString,
    ) -> Result<ImportScanResponse, TrackerError>;
}

/// REST client for the findings tracker.
///
/// Every call retries transient failures under its [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct HttpTrackerClient {
    client: reqwest::Client,
    base_url: String,
    product_id: u64,
    auth_scheme: String,
    retry: RetryPolicy,
}

impl HttpTrackerClient {
    /// Creates a client for `base_url` (e.g. `https://tracker/api/v2`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        product_id: u64,
        request_timeout: Duration,
    ) -> Result<Self, TrackerError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TrackerError::Transport {
                endpoint: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url,
            product_id,
            auth_scheme: "Bearer".to_string(),
            retry: RetryPolicy::default(),
        })
    }

    /// Sets the `Authorization` scheme (`Bearer`, `Token`).
    #[must_use]
    pub fn with_auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = scheme.into();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the URL of an endpoint under the base URL.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorization(&self, token: &SecretString) -> Result<HeaderValue, TrackerError> {
        let mut value =
            HeaderValue::from_str(&format!("{} {}", self.auth_scheme, token.expose_secret()))
                .map_err(|_| TrackerError::Transport {
                    endpoint: self.base_url.clone(),
                    message: "token is not a valid header value".to_string(),
                })?;
        value.set_sensitive(true);
        Ok(value)
    }

    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
        token: &SecretString,
    ) -> Result<String, TrackerError> {
        let response = request
            .header(AUTHORIZATION, self.authorization(token)?)
            .send()
            .await
            .map_err(|e| TrackerError::Transport {
                endpoint: endpoint.to_string(),
                message: e.without_url().to_string(),
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| TrackerError::Transport {
            endpoint: endpoint.to_string(),
            message: e.without_url().to_string(),
        })?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(TrackerError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: truncate_body(&body),
            })
        }
    }

    async fn find_once(
        &self,
        name: &str,
        token: &SecretString,
    ) -> Result<Option<EngagementRef>, TrackerError> {
        let endpoint = "engagements/";
        let product = self.product_id.to_string();
        let request = self
            .client
            .get(self.endpoint(endpoint))
            .query(&[("name", name), ("product", product.as_str())]);
        let body = self.send(endpoint, request, token).await?;
        decode_engagement_page(endpoint, &body, name)
    }

    async fn create_once(
        &self,
        request: &EngagementRequest,
        token: &SecretString,
    ) -> Result<EngagementRef, TrackerError> {
        let endpoint = "engagements/";
        let builder = self.client.post(self.endpoint(endpoint)).json(request);
        let body = self.send(endpoint, builder, token).await?;
        serde_json::from_str(&body).map_err(|e| TrackerError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    async fn import_once(
        &self,
        request: &ImportScanRequest,
        token: &SecretString,
    ) -> Result<ImportScanResponse, TrackerError> {
        let endpoint = "import-scan/";
        let file = Part::bytes(request.payload.clone()).file_name(request.file_name.clone());
        let form = Form::new()
            .text("active", request.active.to_string())
            .text("verified", request.verified.to_string())
            .text("scan_type", request.scan_type.tracker_name())
            .text("product_name", request.product_name.clone())
            .text("engagement_name", request.engagement_name.clone())
            .part("file", file);

        let builder = self.client.post(self.endpoint(endpoint)).multipart(form);
        let body = self.send(endpoint, builder, token).await?;
        Ok(decode_import_response(&body))
    }
}

/// Picks the engagement with exactly `name` from a list response.
pub(crate) fn decode_engagement_page(
    endpoint: &str,
    body: &str,
    name: &str,
) -> Result<Option<EngagementRef>, TrackerError> {
    let page: EngagementPage = serde_json::from_str(body).map_err(|e| TrackerError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;
    Ok(page.results.into_iter().find(|e| e.name == name))
}

/// Reads the test id from an import response; trackers name it differently.
pub(crate) fn decode_import_response(body: &str) -> ImportScanResponse {
    let value: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    let test_id = value
        .get("test_id")
        .or_else(|| value.get("test"))
        .and_then(serde_json::Value::as_u64);
    ImportScanResponse { test_id }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn find_engagement(
        &self,
        name: &str,
        token: &SecretString,
    ) -> Result<Option<EngagementRef>, TrackerError> {
        debug!(engagement = %name, "Looking up engagement");
        let this = self;
        self.retry
            .run("find_engagement", move || async move {
                this.find_once(name, token).await
            })
            .await
    }

    async fn create_engagement(
        &self,
        request: &EngagementRequest,
        token: &SecretString,
    ) -> Result<EngagementRef, TrackerError> {
        debug!(engagement = %request.name, "Creating engagement");
        let this = self;
        self.retry
            .run("create_engagement", move || async move {
                this.create_once(request, token).await
            })
            .await
    }

    async fn import_scan(
        &self,
        request: ImportScanRequest,
        token: &SecretString,
    ) -> Result<ImportScanResponse, TrackerError> {
        debug!(
            engagement = %request.engagement_name,
            scan_type = %request.scan_type,
            bytes = request.payload.len(),
            "Importing scan"
        );
        let this = self;
        let request = &request;
        self.retry
            .run("import_scan", move || async move {
                this.import_once(request, token).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScanType;

    fn client(base: &str) -> HttpTrackerClient {
        HttpTrackerClient::new(base, 1, Duration::from_secs(1))
            .unwrap()
            .with_retry(RetryPolicy::none())
    }

    fn token() -> SecretString {
        SecretString::from("tok-abcdef".to_string())
    }

    #[test]
    fn test_endpoint_join() {
        let c = client("https://tracker.local/api/v2/");
        assert_eq!(
            c.endpoint("/engagements/"),
            "https://tracker.local/api/v2/engagements/"
        );
    }

    #[test]
    fn test_authorization_is_sensitive() {
        let c = client("https://tracker.local/api/v2").with_auth_scheme("Token");
        let header = c.authorization(&token()).unwrap();
        assert!(header.is_sensitive());
        assert_eq!(header.to_str().unwrap(), "Token tok-abcdef");
        assert!(!format!("{c:?}").contains("tok-abcdef"));
    }

    #[test]
    fn test_decode_engagement_page_exact_match() {
        let body = r#"{"results": [
            {"id": 1, "name": "CI/CD Build 42 (retry)"},
            {"id": 2, "name": "CI/CD Build 42"}
        ]}"#;
        let found = decode_engagement_page("engagements/", body, "CI/CD Build 42").unwrap();
        assert_eq!(found.map(|e| e.id), Some(2));
        assert!(decode_engagement_page("engagements/", body, "CI/CD Build 4")
            .unwrap()
            .is_none());
        assert!(decode_engagement_page("engagements/", "oops", "x").is_err());
    }

    #[test]
    fn test_decode_import_response() {
        assert_eq!(decode_import_response(r#"{"test": 9}"#).test_id, Some(9));
        assert_eq!(decode_import_response(r#"{"test_id": 4}"#).test_id, Some(4));
        assert_eq!(decode_import_response("").test_id, None);
    }

    #[tokio::test]
    async fn test_unreachable_tracker_is_transient() {
        let request = ImportScanRequest {
            scan_type: ScanType::DynamicScan,
            product_name: "app".to_string(),
            engagement_name: "CI/CD Build 1".to_string(),
            file_name: "zap.xml".to_string(),
            payload: b"<xml/>".to_vec(),
            active: true,
            verified: true,
        };
        let err = client("http://127.0.0.1:1/api/v2")
            .import_scan(request, &token())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
