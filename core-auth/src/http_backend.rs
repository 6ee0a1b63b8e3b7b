//! HTTP implementation of [`AuthBackend`].
//!
//! Talks to two services:
//! - the hosted auth service (`{auth_url}/auth/v1/*`, profiles under
//!   `{auth_url}/rest/v1/*`)
//! - the application API (`{api_base_url}/api/auth/*`) for one-time codes and
//!   provider discovery
//!
//! Every request carries the public `apikey` header. Requests made on behalf of
//! a user carry their access token as bearer; anonymous ones carry the API key.

use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use chrono::{Duration as ChronoDuration, Utc};
use core_runtime::config::AuthConfig;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::backend::{ApiReply, AuthBackend, OtpTarget, SignUpReply};
use crate::error::{AuthError, Result};
use crate::types::{AuthProviders, OAuthProvider, Profile, Session, User};

const PROFILES_TABLE: &str = "user_profiles";
const PGRST_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Token endpoint reply. Older deployments omit `expires_at`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(flatten)]
    session: Session,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let mut session = self.session;
        if session.expires_at.is_none() {
            session.expires_at = self
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        }
        session
    }
}

#[derive(Debug, Deserialize)]
struct SettingsResponse {
    #[serde(default)]
    external: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ProvidersResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: AuthProviders,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpAuthBackend {
    http_client: Arc<dyn HttpClient>,
    auth_url: String,
    api_key: String,
    api_base_url: String,
    timeout: Duration,
}

impl HttpAuthBackend {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        auth_url: impl Into<String>,
        api_key: impl Into<String>,
        api_base_url: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            auth_url: auth_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            timeout: core_runtime::config::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            Arc::clone(&config.http_client),
            config.auth_url.clone(),
            config.api_key.clone(),
            config.api_base_url.clone(),
        )
        .with_timeout(config.request_timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn auth_endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<String> {
        endpoint(&self.auth_url, path, query)
    }

    fn api_endpoint(&self, path: &str) -> Result<String> {
        endpoint(&self.api_base_url, path, &[])
    }

    fn request(&self, method: HttpMethod, url: String, access_token: Option<&str>) -> HttpRequest {
        HttpRequest::new(method, url)
            .header("apikey", self.api_key.as_str())
            .bearer_token(access_token.unwrap_or(self.api_key.as_str()))
            .header("Accept", "application/json")
            .timeout(self.timeout)
    }

    fn with_json(request: HttpRequest, body: &Value) -> Result<HttpRequest> {
        request
            .json(body)
            .map_err(|e| AuthError::Internal(format!("Failed to encode request: {}", e)))
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = request.method;
        let url = request.log_url().to_string();
        let response = self.http_client.execute(request).await.map_err(|e| {
            warn!(method = method.as_str(), error = %e, transient = e.is_transient(), "Auth backend unreachable");
            AuthError::transport(e)
        })?;

        debug!(method = method.as_str(), url = %url, status = response.status, "Auth backend replied");

        // An unavailable service has not judged the request.
        if response.status >= 500 {
            warn!(method = method.as_str(), status = response.status, "Auth backend unavailable");
            return Err(AuthError::Network(format!(
                "Auth service unavailable (status {})",
                response.status
            )));
        }
        Ok(response)
    }

    /// Sends a request and requires a 2xx reply.
    async fn send_expecting_success(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(rejection(&response))
        }
    }

    async fn send_token_request(&self, request: HttpRequest) -> Result<Session> {
        let response = self.send_expecting_success(request).await?;
        let token: TokenResponse = parse(&response, "token response")?;
        Ok(token.into_session())
    }

    /// Sends a request to the application API.
    ///
    /// A 4xx reply that still carries the `{ success: false }` envelope is
    /// returned as a reply, not an error.
    async fn send_api(&self, request: HttpRequest) -> Result<ApiReply> {
        let response = self.send(request).await?;
        if response.is_success() {
            return parse(&response, "API reply");
        }

        match response.json::<ApiReply>() {
            Ok(reply) if !reply.success && reply.failure_message().is_some() => Ok(reply),
            _ => Err(rejection(&response)),
        }
    }
}

fn endpoint(base: &str, path: &str, query: &[(&str, &str)]) -> Result<String> {
    let mut url = Url::parse(&format!("{}{}", base, path))
        .map_err(|e| AuthError::Configuration(format!("Invalid endpoint URL: {}", e)))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.to_string())
}

fn parse<T: serde::de::DeserializeOwned>(response: &HttpResponse, what: &str) -> Result<T> {
    response
        .json()
        .map_err(|e| AuthError::Network(format!("Failed to parse {}: {}", what, e)))
}

/// Builds the rejection for a non-2xx reply, using whichever message field
/// the service populated.
fn rejection(response: &HttpResponse) -> AuthError {
    let message = response
        .json::<Value>()
        .ok()
        .and_then(|body| {
            ["msg", "message", "error_description", "error"]
                .iter()
                .find_map(|key| body.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| format!("Request failed with status {}", response.status));

    warn!(status = response.status, message = %message, "Auth backend rejected request");

    AuthError::BackendRejected {
        status: Some(response.status),
        message,
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let url = self.auth_endpoint("/auth/v1/token", &[("grant_type", "password")])?;
        let request = Self::with_json(
            self.request(HttpMethod::Post, url, None),
            &json!({ "email": email, "password": password }),
        )?;
        self.send_token_request(request).await
    }

    async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<SignUpReply> {
        let url = self.auth_endpoint("/auth/v1/signup", &[])?;
        let request = Self::with_json(
            self.request(HttpMethod::Post, url, None),
            &json!({
                "email": email,
                "password": password,
                "data": { "username": username, "display_name": username },
            }),
        )?;
        let response = self.send_expecting_success(request).await?;
        let body: Value = parse(&response, "sign-up response")?;

        // Auto-confirmed projects answer with a full token response; otherwise
        // the bare user awaiting confirmation comes back.
        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)
                .map_err(|e| AuthError::Network(format!("Failed to parse sign-up response: {}", e)))?;
            let session = token.into_session();
            return Ok(SignUpReply {
                user: Some(session.user.clone()),
                session: Some(session),
            });
        }

        let user_value = body.get("user").cloned().unwrap_or(body);
        let user = serde_json::from_value::<User>(user_value).ok();
        Ok(SignUpReply {
            user,
            session: None,
        })
    }

    async fn send_email_otp(&self, email: &str) -> Result<ApiReply> {
        let url = self.api_endpoint("/api/auth/send-email-otp")?;
        let request = Self::with_json(
            self.request(HttpMethod::Post, url, None),
            &json!({ "email": email }),
        )?;
        self.send_api(request).await
    }

    async fn send_phone_otp(&self, phone: &str) -> Result<ApiReply> {
        let url = self.api_endpoint("/api/auth/send-phone-otp")?;
        let request = Self::with_json(
            self.request(HttpMethod::Post, url, None),
            &json!({ "phone": phone }),
        )?;
        self.send_api(request).await
    }

    async fn verify_otp(&self, target: &OtpTarget, code: &str) -> Result<ApiReply> {
        let url = self.api_endpoint("/api/auth/verify-otp")?;
        let body = match target {
            OtpTarget::Email(email) => json!({ "email": email, "code": code }),
            OtpTarget::Phone(phone) => json!({ "phone": phone, "code": code }),
        };
        let request = Self::with_json(self.request(HttpMethod::Post, url, None), &body)?;
        self.send_api(request).await
    }

    async fn send_magic_link(
        &self,
        email: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<()> {
        let url = self.auth_endpoint("/auth/v1/otp", &[("redirect_to", redirect_to)])?;
        let request = Self::with_json(
            self.request(HttpMethod::Post, url, None),
            &json!({
                "email": email,
                "create_user": true,
                "code_challenge": code_challenge,
                "code_challenge_method": "s256",
            }),
        )?;
        self.send_expecting_success(request).await?;
        Ok(())
    }

    async fn provider_enabled(&self, provider: OAuthProvider) -> Result<bool> {
        let url = self.auth_endpoint("/auth/v1/settings", &[])?;
        let response = self
            .send_expecting_success(self.request(HttpMethod::Get, url, None))
            .await?;
        let settings: SettingsResponse = parse(&response, "auth settings")?;

        Ok(settings
            .external
            .get(provider.as_str())
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    fn authorize_url(
        &self,
        provider: OAuthProvider,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<String> {
        self.auth_endpoint(
            "/auth/v1/authorize",
            &[
                ("provider", provider.as_str()),
                ("redirect_to", redirect_to),
                ("code_challenge", code_challenge),
                ("code_challenge_method", "s256"),
            ],
        )
    }

    async fn exchange_code(&self, auth_code: &str, code_verifier: &str) -> Result<Session> {
        let url = self.auth_endpoint("/auth/v1/token", &[("grant_type", "pkce")])?;
        let request = Self::with_json(
            self.request(HttpMethod::Post, url, None),
            &json!({ "auth_code": auth_code, "code_verifier": code_verifier }),
        )?;
        self.send_token_request(request).await
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        let url = self.auth_endpoint("/auth/v1/logout", &[])?;
        let response = self
            .send(self.request(HttpMethod::Post, url, Some(access_token)))
            .await?;

        match response.status {
            status if (200..300).contains(&status) => Ok(()),
            // The session is already gone server-side.
            401 | 403 | 404 => {
                debug!(status = response.status, "Session already revoked");
                Ok(())
            }
            _ => Err(rejection(&response)),
        }
    }

    async fn reset_password(&self, email: &str, redirect_to: &str) -> Result<()> {
        let url = self.auth_endpoint("/auth/v1/recover", &[("redirect_to", redirect_to)])?;
        let request = Self::with_json(
            self.request(HttpMethod::Post, url, None),
            &json!({ "email": email }),
        )?;
        self.send_expecting_success(request).await?;
        Ok(())
    }

    async fn update_password(&self, access_token: &str, new_password: &str) -> Result<User> {
        let url = self.auth_endpoint("/auth/v1/user", &[])?;
        let request = Self::with_json(
            self.request(HttpMethod::Put, url, Some(access_token)),
            &json!({ "password": new_password }),
        )?;
        let response = self.send_expecting_success(request).await?;
        parse(&response, "user")
    }

    async fn fetch_profile(&self, access_token: &str, user_id: &str) -> Result<Profile> {
        let id_filter = format!("eq.{}", user_id);
        let url = self.auth_endpoint(
            &format!("/rest/v1/{}", PROFILES_TABLE),
            &[("id", id_filter.as_str()), ("select", "*")],
        )?;
        let request = self
            .request(HttpMethod::Get, url, Some(access_token))
            .header("Accept", PGRST_OBJECT);
        let response = self.send_expecting_success(request).await?;
        parse(&response, "profile")
    }

    async fn update_profile(
        &self,
        access_token: &str,
        user_id: &str,
        updates: &Map<String, Value>,
    ) -> Result<Profile> {
        let id_filter = format!("eq.{}", user_id);
        let url = self.auth_endpoint(
            &format!("/rest/v1/{}", PROFILES_TABLE),
            &[("id", id_filter.as_str())],
        )?;
        let request = Self::with_json(
            self.request(HttpMethod::Patch, url, Some(access_token))
                .header("Accept", PGRST_OBJECT)
                .header("Prefer", "return=representation"),
            &Value::Object(updates.clone()),
        )?;
        let response = self.send_expecting_success(request).await?;
        parse(&response, "profile")
    }

    async fn auth_providers(&self) -> Result<AuthProviders> {
        let url = self.api_endpoint("/api/auth/providers")?;
        let response = self
            .send_expecting_success(self.request(HttpMethod::Get, url, None))
            .await?;
        let providers: ProvidersResponse = parse(&response, "providers")?;

        if providers.success {
            Ok(providers.data)
        } else {
            Err(AuthError::rejected(
                providers
                    .error
                    .unwrap_or_else(|| "Failed to load auth providers".to_string()),
            ))
        }
    }
}
