//! Profile reads and partial updates for the signed-in user.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::AuthBackend;
use crate::error::{AuthError, Result};
use crate::types::{Profile, Session};

/// Columns callers may not change.
const READ_ONLY_FIELDS: &[&str] = &["id", "created_at"];

pub struct ProfileAccessor {
    backend: Arc<dyn AuthBackend>,
}

impl ProfileAccessor {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        Self { backend }
    }

    /// Reads the profile of the session's user.
    pub async fn fetch(&self, session: Option<&Session>) -> Result<Profile> {
        let session = session.ok_or(AuthError::NotAuthenticated)?;
        let profile = self
            .backend
            .fetch_profile(&session.access_token, session.user.id.as_str())
            .await?;

        debug!(user_id = %session.user.id, fields = profile.fields.len(), "Profile loaded");
        Ok(profile)
    }

    /// Applies a partial update and returns the stored profile.
    pub async fn update(
        &self,
        session: Option<&Session>,
        updates: &Map<String, Value>,
    ) -> Result<Profile> {
        let session = session.ok_or(AuthError::NotAuthenticated)?;
        validate_updates(updates)?;

        let profile = self
            .backend
            .update_profile(&session.access_token, session.user.id.as_str(), updates)
            .await?;

        info!(
            user_id = %session.user.id,
            fields = ?updates.keys().collect::<Vec<_>>(),
            "Profile updated"
        );
        Ok(profile)
    }
}

fn validate_updates(updates: &Map<String, Value>) -> Result<()> {
    if updates.is_empty() {
        return Err(AuthError::Validation("No profile fields to update".to_string()));
    }

    if let Some(field) = READ_ONLY_FIELDS.iter().find(|f| updates.contains_key(**f)) {
        return Err(AuthError::Validation(format!(
            "Profile field '{}' cannot be changed",
            field
        )));
    }

    Ok(())
}
