use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json;
use std::convert::Infallible;
use thiserror::Error;

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);

pub const MAILBOX_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.modify",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + buffer >= self.expires_at
    }
}

/// Client registration used for the consent redirect and token calls.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_endpoint: String,
    pub token_endpoint: String,
}

impl OAuthApp {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            auth_endpoint: AUTH_ENDPOINT.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
        }
    }

    pub fn with_auth_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.auth_endpoint = endpoint.into();
        self
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Consent URL requesting offline access so a refresh secret is issued.
    pub fn authorization_url(&self, state: &ConnectState) -> Result<String, OAuthError> {
        let state_json = serde_json::to_string(state)?;
        let scope = MAILBOX_SCOPES.join(" ");
        let url = Url::parse_with_params(
            &self.auth_endpoint,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("scope", scope.as_str()),
                ("state", state_json.as_str()),
            ],
        )
        .map_err(|err| OAuthError::InvalidEndpoint(err.to_string()))?;
        Ok(url.into())
    }

    pub async fn exchange_code(
        &self,
        client: &reqwest::Client,
        code: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        let response = client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await?;
        let payload = decode_token_response(response).await?;
        let refresh_token = payload
            .refresh_token
            .filter(|token| !token.is_empty())
            .ok_or(OAuthError::MissingRefreshToken)?;

        Ok(OAuthTokens {
            access_token: payload.access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(payload.expires_in),
        })
    }

    pub async fn refresh(
        &self,
        client: &reqwest::Client,
        tokens: &OAuthTokens,
    ) -> Result<OAuthTokens, OAuthError> {
        refresh_access_token_with_endpoint(
            client,
            &self.client_id,
            &self.client_secret,
            tokens,
            &self.token_endpoint,
        )
        .await
    }
}

/// Round-tripped through the consent screen in the `state` parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectState {
    pub tenant_id: String,
    #[serde(default)]
    pub return_to: Option<String>,
}

impl ConnectState {
    pub fn parse(raw: &str) -> Result<Self, OAuthError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token")]
    MissingRefreshToken,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
    #[error("invalid oauth endpoint: {0}")]
    InvalidEndpoint(String),
}

impl OAuthError {
    /// The provider rejected the grant itself; retrying cannot succeed.
    pub fn is_revocation(&self) -> bool {
        match self {
            OAuthError::MissingRefreshToken => true,
            OAuthError::TokenEndpoint { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error>;

    /// Record that the stored grant is no longer usable.
    async fn mark_revoked(&self, reason: &str) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopTokenStore;

#[async_trait]
impl TokenStore for NoopTokenStore {
    type Error = Infallible;

    async fn save_tokens(&self, _tokens: &OAuthTokens) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn mark_revoked(&self, _reason: &str) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

async fn decode_token_response(response: reqwest::Response) -> Result<TokenResponse, OAuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.text().await?;
    let payload: TokenResponse = serde_json::from_str(&body)?;
    if payload.expires_in <= 0 {
        return Err(OAuthError::InvalidExpires(payload.expires_in));
    }
    Ok(payload)
}

pub async fn refresh_access_token_with_endpoint(
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    tokens: &OAuthTokens,
    endpoint: &str,
) -> Result<OAuthTokens, OAuthError> {
    if tokens.refresh_token.is_empty() {
        return Err(OAuthError::MissingRefreshToken);
    }

    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", tokens.refresh_token.as_str()),
        ])
        .send()
        .await?;
    let payload = decode_token_response(response).await?;

    let refresh_token = payload
        .refresh_token
        .filter(|token| !token.is_empty())
        .unwrap_or_else(|| tokens.refresh_token.clone());

    Ok(OAuthTokens {
        access_token: payload.access_token,
        refresh_token,
        expires_at: Utc::now() + Duration::seconds(payload.expires_in),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn expired_tokens(refresh: &str) -> OAuthTokens {
        OAuthTokens {
            access_token: "old".into(),
            refresh_token: refresh.into(),
            expires_at: Utc::now(),
        }
    }

    fn app_for(server: &MockServer) -> OAuthApp {
        OAuthApp::new("client", "secret", "http://localhost/callback")
            .with_token_endpoint(format!("{}/token", server.uri()))
    }

    #[test]
    fn needs_refresh_respects_buffer() {
        let tokens = OAuthTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now() + Duration::minutes(4),
        };

        assert!(tokens.needs_refresh(Utc::now(), Duration::minutes(5)));
        assert!(!tokens.needs_refresh(Utc::now(), Duration::minutes(1)));
    }

    #[test]
    fn authorization_url_requests_offline_consent_and_carries_state() {
        let app = OAuthApp::new("client-1", "secret", "http://localhost/cb");
        let state = ConnectState {
            tenant_id: "tenant-9".into(),
            return_to: Some("/settings".into()),
        };
        let raw = app.authorization_url(&state).expect("url");
        let url = Url::parse(&raw).expect("parse url");
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["client_id"], "client-1");
        assert!(params["scope"].contains("gmail.send"));
        assert_eq!(ConnectState::parse(&params["state"]).expect("state"), state);
    }

    #[tokio::test]
    async fn refresh_updates_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new_access",
                "refresh_token": "new_refresh",
                "expires_in": 3600,
                "token_type": "Bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = expired_tokens("old_refresh");
        let refreshed = app_for(&server)
            .refresh(&reqwest::Client::new(), &tokens)
            .await
            .expect("refresh succeeds");

        assert_eq!(refreshed.access_token, "new_access");
        assert_eq!(refreshed.refresh_token, "new_refresh");
        assert!(refreshed.expires_at > tokens.expires_at);
    }

    #[tokio::test]
    async fn refresh_keeps_existing_refresh_token_when_omitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new_access",
                "expires_in": 1200
            })))
            .expect(1)
            .mount(&server)
            .await;

        let refreshed = app_for(&server)
            .refresh(&reqwest::Client::new(), &expired_tokens("keep_me"))
            .await
            .expect("refresh succeeds");
        assert_eq!(refreshed.refresh_token, "keep_me");
    }

    #[tokio::test]
    async fn rejected_grant_is_a_revocation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = app_for(&server)
            .refresh(&reqwest::Client::new(), &expired_tokens("r"))
            .await
            .expect_err("should fail on 400");
        assert!(matches!(err, OAuthError::TokenEndpoint { status: 400, .. }));
        assert!(err.is_revocation());
    }

    #[tokio::test]
    async fn server_errors_are_not_revocations() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = app_for(&server)
            .refresh(&reqwest::Client::new(), &expired_tokens("r"))
            .await
            .expect_err("should fail on 503");
        assert!(!err.is_revocation());
    }

    #[tokio::test]
    async fn refresh_validates_expires_and_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new",
                "expires_in": 0,
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let app = app_for(&server);
        let client = reqwest::Client::new();
        let err = app
            .refresh(&client, &expired_tokens("r"))
            .await
            .expect_err("zero expires should fail");
        assert!(matches!(err, OAuthError::InvalidExpires(0)));

        let err = app
            .refresh(&client, &expired_tokens("r"))
            .await
            .expect_err("should surface decode errors");
        assert!(matches!(err, OAuthError::Decode(_)));
    }

    #[tokio::test]
    async fn refresh_requires_refresh_token() {
        let app = OAuthApp::new("client", "secret", "http://localhost/cb")
            .with_token_endpoint("http://localhost/token");
        let err = app
            .refresh(&reqwest::Client::new(), &expired_tokens(""))
            .await
            .expect_err("missing refresh token");
        assert!(matches!(err, OAuthError::MissingRefreshToken));
        assert!(err.is_revocation());
    }

    #[tokio::test]
    async fn exchange_code_requires_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "refresh_token": "refresh",
                "expires_in": 3599,
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "expires_in": 3599,
            })))
            .mount(&server)
            .await;

        let app = app_for(&server);
        let client = reqwest::Client::new();
        let tokens = app
            .exchange_code(&client, "auth-code")
            .await
            .expect("exchange");
        assert_eq!(tokens.refresh_token, "refresh");
        assert!(tokens.expires_at > Utc::now());

        let err = app
            .exchange_code(&client, "auth-code")
            .await
            .expect_err("no refresh token");
        assert!(matches!(err, OAuthError::MissingRefreshToken));
    }
}
