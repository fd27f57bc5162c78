//! Token endpoint client
//!
//! Performs `refresh_token` grants against a provider's token endpoint as described
//! by its template and maps the response into fresh OAuth2 credentials.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{RefreshError, RefreshErrorClassification};
use crate::models::{OAuth2Credentials, ProviderConfig};
use crate::providers::{ClientAuthMethod, ProviderTemplate, TokenResponseMapping};

/// Longest provider body kept on a rejection
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Largest token endpoint response read before giving up
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl TokenClient {
    /// Client whose requests are bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("credvault/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, timeout })
    }

    /// Exchange `refresh_token` for new credentials.
    ///
    /// A provider that omits a new refresh token keeps the one that was sent.
    pub async fn refresh(
        &self,
        template: &ProviderTemplate,
        config: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<OAuth2Credentials, RefreshError> {
        let request = self.request(template, config, refresh_token);
        let body = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| self.timeout_error())??;

        map_token_response(&template.token_response, body, Some(refresh_token), Utc::now())
    }

    async fn request(
        &self,
        template: &ProviderTemplate,
        config: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<JsonValue, RefreshError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if template.token_request_auth_method == ClientAuthMethod::Body {
            params.push(("client_id", config.oauth_client_id.as_str()));
            params.push(("client_secret", config.oauth_client_secret.as_str()));
        }
        params.extend(
            template
                .refresh_params
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        );

        let mut request = self
            .http
            .post(template.refresh_endpoint().clone())
            .header(ACCEPT, "application/json")
            .form(&params);
        if template.token_request_auth_method == ClientAuthMethod::Basic {
            request = request.basic_auth(
                &config.oauth_client_id,
                Some(&config.oauth_client_secret),
            );
        }

        debug!(endpoint = %template.refresh_endpoint(), provider = %template.name, "Calling token endpoint");
        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let text = self.read_body(response).await?;
        let json = serde_json::from_str::<JsonValue>(&text).ok();

        if !status.is_success() {
            return Err(rejection(status, json.as_ref(), &text, retry_after));
        }

        let body = json.ok_or_else(|| {
            RefreshError::MalformedResponse(format!(
                "token endpoint returned non-JSON body ({} bytes)",
                text.len()
            ))
        })?;

        // Slack and a few others answer 200 with an error payload.
        if body.get("error").is_some_and(JsonValue::is_string)
            && TokenResponseMapping::lookup(&body, &template.token_response.access_token).is_none()
        {
            return Err(rejection(status, Some(&body), &text, retry_after));
        }

        Ok(body)
    }

    /// Read the response body, refusing anything above `MAX_RESPONSE_BYTES`
    async fn read_body(&self, mut response: reqwest::Response) -> Result<String, RefreshError> {
        let too_large = || {
            RefreshError::MalformedResponse(format!(
                "token endpoint response exceeds {} bytes",
                MAX_RESPONSE_BYTES
            ))
        };

        if response
            .content_length()
            .is_some_and(|length| length > MAX_RESPONSE_BYTES as u64)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
            if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn transport_error(&self, error: reqwest::Error) -> RefreshError {
        if error.is_timeout() {
            self.timeout_error()
        } else {
            RefreshError::Network(error.to_string())
        }
    }

    fn timeout_error(&self) -> RefreshError {
        RefreshError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

fn rejection(
    status: StatusCode,
    json: Option<&JsonValue>,
    text: &str,
    retry_after: Option<u64>,
) -> RefreshError {
    let error_code = json
        .and_then(|body| body.get("error"))
        .and_then(JsonValue::as_str)
        .map(str::to_string);

    RefreshError::Rejected {
        status: status.as_u16(),
        classification: classify_refresh_error(status, error_code.as_deref(), text),
        error_code,
        body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        retry_after,
    }
}

/// Classify a token endpoint rejection
pub fn classify_refresh_error(
    status: StatusCode,
    error_code: Option<&str>,
    body: &str,
) -> RefreshErrorClassification {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return RefreshErrorClassification::RateLimited;
    }

    let error_lower = error_code.unwrap_or(body).to_lowercase();

    if error_lower.contains("invalid_grant")
        || error_lower.contains("invalid_client")
        || error_lower.contains("unauthorized_client")
        || error_lower.contains("invalid_refresh_token")
        || error_lower.contains("revoked")
        || error_lower.contains("access_denied")
        || error_lower.contains("unsupported_grant_type")
    {
        return RefreshErrorClassification::Permanent;
    }

    if error_lower.contains("rate_limit")
        || error_lower.contains("too_many_requests")
        || error_lower.contains("temporarily_unavailable")
        || error_lower.contains("quota_exceeded")
    {
        return RefreshErrorClassification::RateLimited;
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return RefreshErrorClassification::Permanent;
    }

    RefreshErrorClassification::Transient
}

/// Build OAuth2 credentials from a token response body
pub fn map_token_response(
    mapping: &TokenResponseMapping,
    body: JsonValue,
    previous_refresh_token: Option<&str>,
    now: DateTime<Utc>,
) -> Result<OAuth2Credentials, RefreshError> {
    let access_token = TokenResponseMapping::lookup(&body, &mapping.access_token)
        .and_then(JsonValue::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            RefreshError::MalformedResponse(format!(
                "token response has no '{}' field",
                mapping.access_token
            ))
        })?;

    let refresh_token = TokenResponseMapping::lookup(&body, &mapping.refresh_token)
        .and_then(JsonValue::as_str)
        .filter(|token| !token.is_empty())
        .or(previous_refresh_token)
        .map(str::to_string);

    let expires_at = TokenResponseMapping::lookup(&body, &mapping.expires)
        .map(|value| mapping.expiry_format.resolve(value, now))
        .transpose()
        .map_err(RefreshError::MalformedResponse)?;

    Ok(OAuth2Credentials {
        access_token,
        refresh_token,
        expires_at,
        raw: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ExpiryFormat;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;
    use url::Url;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> ProviderConfig {
        ProviderConfig {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            unique_key: "acme-prod".to_string(),
            provider: "acme".to_string(),
            oauth_client_id: "client-id".to_string(),
            oauth_client_secret: "client-secret".to_string(),
            oauth_scopes: String::new(),
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    fn template(server: &MockServer) -> ProviderTemplate {
        let url = Url::parse(&format!("{}/oauth/token", server.uri())).unwrap();
        ProviderTemplate::oauth2("acme", url)
    }

    fn client() -> TokenClient {
        TokenClient::new(std::time::Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn refresh_posts_form_with_client_credentials_in_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(header("accept", "application/json"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=R1"))
            .and(body_string_contains("client_id=client-id"))
            .and(body_string_contains("client_secret=client-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let before = Utc::now();
        let credentials = client()
            .refresh(&template(&server), &config(), "R1")
            .await
            .expect("refresh succeeds");

        assert_eq!(credentials.access_token, "A2");
        assert_eq!(credentials.refresh_token.as_deref(), Some("R1"));
        let expires_at = credentials.expires_at.expect("expiry mapped");
        assert!(expires_at >= before + ChronoDuration::seconds(3600));
        assert!(expires_at <= Utc::now() + ChronoDuration::seconds(3600));
        assert_eq!(credentials.raw["access_token"], "A2");
    }

    #[tokio::test]
    async fn basic_auth_and_refresh_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(header_exists("authorization"))
            .and(body_string_contains("scope=offline_access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A2",
                "refresh_token": "R2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let template = template(&server)
            .with_client_auth(ClientAuthMethod::Basic)
            .with_refresh_param("scope", "offline_access");

        let credentials = client()
            .refresh(&template, &config(), "R1")
            .await
            .expect("refresh succeeds");

        assert_eq!(credentials.refresh_token.as_deref(), Some("R2"));
        assert_eq!(credentials.expires_at, None);

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(!body.contains("client_secret"));
    }

    #[tokio::test]
    async fn invalid_grant_is_permanent_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let error = client()
            .refresh(&template(&server), &config(), "R1")
            .await
            .unwrap_err();

        match error {
            RefreshError::Rejected {
                status,
                error_code,
                classification,
                ..
            } => {
                assert_eq!(status, 400);
                assert_eq!(error_code.as_deref(), Some("invalid_grant"));
                assert_eq!(classification, RefreshErrorClassification::Permanent);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "42")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let error = client()
            .refresh(&template(&server), &config(), "R1")
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            RefreshError::Rejected {
                classification: RefreshErrorClassification::RateLimited,
                retry_after: Some(42),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn error_payload_with_200_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "invalid_refresh_token"})),
            )
            .mount(&server)
            .await;

        let error = client()
            .refresh(&template(&server), &config(), "R1")
            .await
            .unwrap_err();
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn missing_access_token_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token_type": "bearer"})))
            .mount(&server)
            .await;

        let error = client()
            .refresh(&template(&server), &config(), "R1")
            .await
            .unwrap_err();
        assert!(matches!(error, RefreshError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "late"}))
                    .set_delay(std::time::Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = TokenClient::new(std::time::Duration::from_millis(100)).unwrap();
        let error = client
            .refresh(&template(&server), &config(), "R1")
            .await
            .unwrap_err();
        assert!(matches!(error, RefreshError::Timeout { timeout_ms: 100 }));
    }

    #[tokio::test]
    async fn oversized_response_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(MAX_RESPONSE_BYTES + 1)))
            .mount(&server)
            .await;

        let error = client()
            .refresh(&template(&server), &config(), "R1")
            .await
            .unwrap_err();
        assert!(matches!(error, RefreshError::MalformedResponse(message) if message.contains("exceeds")));
    }

    #[tokio::test]
    async fn refresh_reads_fields_through_template_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "authed_user": {"access_token": "xoxp-2", "refresh_token": "R2", "expires_at": 1_900_000_000}
            })))
            .mount(&server)
            .await;

        let template = template(&server).with_token_response(TokenResponseMapping {
            access_token: "authed_user.access_token".to_string(),
            refresh_token: "authed_user.refresh_token".to_string(),
            expires: "authed_user.expires_at".to_string(),
            expiry_format: ExpiryFormat::UnixTimestamp,
        });

        let credentials = client()
            .refresh(&template, &config(), "R1")
            .await
            .expect("refresh succeeds");
        assert_eq!(credentials.access_token, "xoxp-2");
        assert_eq!(credentials.refresh_token.as_deref(), Some("R2"));
        assert_eq!(credentials.expires_at, DateTime::from_timestamp(1_900_000_000, 0));
    }

    #[test]
    fn overflowing_expires_in_is_malformed() {
        let error = map_token_response(
            &TokenResponseMapping::default(),
            json!({"access_token": "A2", "expires_in": 9_000_000_000_000_000i64}),
            Some("R1"),
            Utc::now(),
        )
        .unwrap_err();

        match error {
            RefreshError::MalformedResponse(message) => assert!(message.contains("out of range")),
            other => panic!("expected malformed response, got {:?}", other),
        }
    }

    #[test]
    fn classification_heuristics() {
        assert_eq!(
            classify_refresh_error(StatusCode::BAD_REQUEST, Some("invalid_client"), ""),
            RefreshErrorClassification::Permanent
        );
        assert_eq!(
            classify_refresh_error(StatusCode::BAD_REQUEST, Some("temporarily_unavailable"), ""),
            RefreshErrorClassification::RateLimited
        );
        assert_eq!(
            classify_refresh_error(StatusCode::SERVICE_UNAVAILABLE, None, "upstream down"),
            RefreshErrorClassification::Transient
        );
        assert_eq!(
            classify_refresh_error(StatusCode::UNAUTHORIZED, None, ""),
            RefreshErrorClassification::Permanent
        );
    }

    #[test]
    fn maps_nested_fields_and_timestamps() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mapping = TokenResponseMapping {
            access_token: "data.token".to_string(),
            refresh_token: "data.refresh".to_string(),
            expires: "data.expires_at".to_string(),
            expiry_format: ExpiryFormat::Rfc3339,
        };

        let credentials = map_token_response(
            &mapping,
            json!({"data": {"token": "A9", "expires_at": "2025-06-01T01:00:00Z"}}),
            Some("R-old"),
            now,
        )
        .unwrap();

        assert_eq!(credentials.access_token, "A9");
        assert_eq!(credentials.refresh_token.as_deref(), Some("R-old"));
        assert_eq!(credentials.expires_at, Some(now + ChronoDuration::hours(1)));
    }
}
