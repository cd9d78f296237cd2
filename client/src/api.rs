use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::auth::{AuthContext, TokenPair, UserProfile};
use crate::protocol::MemberSummary;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not signed in")]
    NoSession,
    #[error("session expired; sign in again")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("server returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid API url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
    user: UserProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub host_id: Option<Uuid>,
    pub members: Vec<MemberSummary>,
    pub capacity: usize,
    pub passcode_enabled: bool,
}

#[derive(Serialize)]
struct GuestRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// REST client that owns token attachment and refresh.
///
/// Authorized calls refresh ahead of expiry and retry exactly once after a
/// 401 with whatever token the refresh produced.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
    auth: Arc<AuthContext>,
}

impl ApiClient {
    pub fn new(base_url: &str, auth: Arc<AuthContext>) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base: Url::parse(base_url)?,
            auth,
        })
    }

    pub fn auth(&self) -> &Arc<AuthContext> {
        &self.auth
    }

    pub async fn health(&self) -> Result<(), ApiError> {
        let response = self.http.get(self.endpoint("/healthz")?).send().await?;
        check_status(response, "/healthz").await.map(|_| ())
    }

    /// Start a guest session and keep its tokens
    pub async fn login_guest(&self, display_name: Option<&str>) -> Result<UserProfile, ApiError> {
        let response = self
            .http
            .post(self.endpoint("/api/auth/guest")?)
            .json(&GuestRequest { display_name })
            .send()
            .await?;
        let tokens: TokenResponse = check_status(response, "/api/auth/guest").await?.json().await?;
        tracing::info!("Signed in as {}", tokens.user.display_name);
        Ok(self.adopt(tokens))
    }

    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        let profile: UserProfile = self.get_json("/api/me").await?;
        self.auth.set_profile(profile.clone());
        Ok(profile)
    }

    pub async fn room(&self, room_id: &str) -> Result<RoomSummary, ApiError> {
        let path = format!("/api/rooms/{}", urlencoding::encode(room_id));
        self.get_json(&path).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send_authorized(Method::GET, path, |req| req).await?;
        Ok(response.json().await?)
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send_authorized(Method::POST, path, |req| req.json(body))
            .await?;
        Ok(response.json().await?)
    }

    async fn send_authorized<F>(
        &self,
        method: Method,
        path: &str,
        build: F,
    ) -> Result<Response, ApiError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let url = self.endpoint(path)?;
        let mut token = self.auth.access_token().ok_or(ApiError::NoSession)?;
        if self.auth.needs_refresh() {
            token = self.refresh_from(&token).await?;
        }

        let response = build(self.http.request(method.clone(), url.clone()))
            .bearer_auth(&token)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response, path).await;
        }

        tracing::debug!("{} rejected the access token; refreshing", path);
        let token = self.refresh_from(&token).await?;
        let response = build(self.http.request(method, url))
            .bearer_auth(&token)
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        check_status(response, path).await
    }

    /// Refresh unless someone else already replaced `stale`; returns the token to use.
    pub async fn refresh_from(&self, stale: &str) -> Result<String, ApiError> {
        let _guard = self.auth.refresh_guard().await;
        if let Some(current) = self.auth.access_token() {
            if current != stale {
                return Ok(current);
            }
        }

        let refresh_token = self.auth.refresh_token().ok_or(ApiError::NoSession)?;
        let response = self
            .http
            .post(self.endpoint("/api/auth/refresh")?)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("Refresh token rejected; clearing session");
            self.auth.clear();
            return Err(ApiError::Unauthorized);
        }
        let tokens: TokenResponse = check_status(response, "/api/auth/refresh")
            .await?
            .json()
            .await?;
        tracing::debug!("Access token refreshed");
        let access = tokens.access_token.clone();
        self.adopt(tokens);
        Ok(access)
    }

    fn adopt(&self, tokens: TokenResponse) -> UserProfile {
        self.auth.set_tokens(TokenPair::from_lifetime(
            tokens.access_token,
            tokens.refresh_token,
            tokens.expires_in,
        ));
        self.auth.set_profile(tokens.user.clone());
        tokens.user
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path)?)
    }
}

async fn check_status(response: Response, path: &str) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(path.to_string()));
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ApiError::Status { status, message })
}
