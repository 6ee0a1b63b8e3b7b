//! Shared doubles for unit tests.

use async_trait::async_trait;
use bridge_traits::storage::SecureStore;
use chrono::{Duration, Utc};
use mockall::mock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{ApiReply, AuthBackend, OtpTarget, SignUpReply};
use crate::error::Result;
use crate::types::{AuthProviders, OAuthProvider, Profile, Session, User};

mock! {
    pub Backend {}

    #[async_trait]
    impl AuthBackend for Backend {
        async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;
        async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<SignUpReply>;
        async fn send_email_otp(&self, email: &str) -> Result<ApiReply>;
        async fn send_phone_otp(&self, phone: &str) -> Result<ApiReply>;
        async fn verify_otp(&self, target: &OtpTarget, code: &str) -> Result<ApiReply>;
        async fn send_magic_link(&self, email: &str, redirect_to: &str, code_challenge: &str) -> Result<()>;
        async fn provider_enabled(&self, provider: OAuthProvider) -> Result<bool>;
        fn authorize_url(&self, provider: OAuthProvider, redirect_to: &str, code_challenge: &str) -> Result<String>;
        async fn exchange_code(&self, auth_code: &str, code_verifier: &str) -> Result<Session>;
        async fn sign_out(&self, access_token: &str) -> Result<()>;
        async fn reset_password(&self, email: &str, redirect_to: &str) -> Result<()>;
        async fn update_password(&self, access_token: &str, new_password: &str) -> Result<User>;
        async fn fetch_profile(&self, access_token: &str, user_id: &str) -> Result<Profile>;
        async fn update_profile(&self, access_token: &str, user_id: &str, updates: &Map<String, Value>) -> Result<Profile>;
        async fn auth_providers(&self) -> Result<AuthProviders>;
    }
}

/// In-memory SecureStore for testing
#[derive(Clone, Default)]
pub struct MemorySecureStore {
    storage: Arc<tokio::sync::Mutex<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> bridge_traits::error::Result<()> {
        self.storage
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> bridge_traits::error::Result<Option<Vec<u8>>> {
        Ok(self.storage.lock().await.get(key).cloned())
    }

    async fn delete_secret(&self, key: &str) -> bridge_traits::error::Result<()> {
        self.storage.lock().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> bridge_traits::error::Result<Vec<String>> {
        Ok(self.storage.lock().await.keys().cloned().collect())
    }

    async fn clear_all(&self) -> bridge_traits::error::Result<()> {
        self.storage.lock().await.clear();
        Ok(())
    }
}

pub fn user(id: &str) -> User {
    User::new(id).with_email(format!("{}@example.com", id))
}

pub fn session_for(id: &str) -> Session {
    Session {
        access_token: format!("access-{}", id),
        refresh_token: Some(format!("refresh-{}", id)),
        expires_at: Some(Utc::now() + Duration::hours(1)),
        user: user(id),
    }
}

pub fn api_ok() -> ApiReply {
    ApiReply {
        success: true,
        ..ApiReply::default()
    }
}

pub fn api_failure(message: &str) -> ApiReply {
    ApiReply {
        success: false,
        error: Some(message.to_string()),
        ..ApiReply::default()
    }
}
