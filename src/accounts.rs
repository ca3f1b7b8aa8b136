//! Account registration over HTTP.
//!
//! `POST /register` is the only way to create an identity. Passwords are
//! hashed with bcrypt on the blocking pool; plaintext never reaches the store.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::state::RelayState;

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 32;
pub const PASSWORD_MIN_LEN: usize = 6;
/// bcrypt ignores everything past 72 bytes.
pub const PASSWORD_MAX_LEN: usize = 72;
pub const DISPLAY_NAME_MAX_LEN: usize = 64;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub username: String,
    pub display_name: String,
}

/// Usernames are case-insensitive; they are stored and compared lowercased.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        return Err(RelayError::Validation(format!(
            "username must be {}-{} characters",
            USERNAME_MIN_LEN, USERNAME_MAX_LEN
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(RelayError::Validation(
            "username may only contain lowercase letters and digits".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.len() < PASSWORD_MIN_LEN || password.len() > PASSWORD_MAX_LEN {
        return Err(RelayError::Validation(format!(
            "password must be {}-{} bytes",
            PASSWORD_MIN_LEN, PASSWORD_MAX_LEN
        )));
    }
    Ok(())
}

/// Trim and check a display name, returning the trimmed value.
pub fn validate_display_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(RelayError::Validation("display name is empty".to_string()));
    }
    if name.chars().count() > DISPLAY_NAME_MAX_LEN {
        return Err(RelayError::Validation(format!(
            "display name is longer than {} characters",
            DISPLAY_NAME_MAX_LEN
        )));
    }
    Ok(name.to_string())
}

async fn hash_password(password: String, cost: u32) -> Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| RelayError::StoreUnavailable(format!("hashing task failed: {}", e)))?
        .map_err(RelayError::from)
}

/// Validate, hash and persist a new identity.
pub async fn register(state: &RelayState, request: RegisterRequest) -> Result<RegisterResponse> {
    let username = normalize_username(&request.username);
    validate_username(&username)?;
    validate_password(&request.password)?;
    let display_name = match request.display_name.as_deref() {
        Some(raw) => validate_display_name(raw)?,
        None => username.clone(),
    };

    if state.identities.find_by_username(&username)?.is_some() {
        return Err(RelayError::Conflict(format!("username {} is taken", username)));
    }

    let hash = hash_password(request.password, state.config.bcrypt_cost).await?;
    // The insert is the real uniqueness check; the lookup above only avoids
    // hashing for an obviously taken name.
    let identity = state.identities.create(&username, &hash, &display_name)?;

    Ok(RegisterResponse {
        username: identity.username,
        display_name: identity.display_name,
    })
}

/// `POST /register`
pub async fn register_handler(
    State(state): State<RelayState>,
    Json(request): Json<RegisterRequest>,
) -> std::result::Result<impl IntoResponse, RelayError> {
    let created = register(&state, request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::notify::NoopNotifier;
    use crate::state::RelayConfig;
    use crate::store::SqliteStore;

    fn test_state() -> RelayState {
        RelayState::with_sqlite(
            RelayConfig {
                bcrypt_cost: 4,
                ..RelayConfig::default()
            },
            SqliteStore::open_in_memory().unwrap(),
            Arc::new(NoopNotifier),
        )
    }

    fn request(username: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
            display_name: None,
        }
    }

    #[test]
    fn test_username_rules() {
        assert_eq!(normalize_username("  Alice "), "alice");
        assert!(validate_username("alice01").is_ok());
        assert!(validate_username("alice_01").is_err());
        assert!(validate_username("al").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
        assert!(validate_username("al ice").is_err());
        assert!(validate_username("alice!").is_err());
    }

    #[test]
    fn test_display_name_is_trimmed() {
        assert_eq!(validate_display_name("  Alice  ").unwrap(), "Alice");
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn test_register_hashes_password() {
        let state = test_state();
        let created = register(&state, request("Alice", "hunter22")).await.unwrap();
        assert_eq!(created.username, "alice");
        assert_eq!(created.display_name, "alice");

        let stored = state.identities.find_by_username("alice").unwrap().unwrap();
        assert_ne!(stored.password_hash, "hunter22");
        assert!(bcrypt::verify("hunter22", &stored.password_hash).unwrap());
    }

    #[tokio::test]
    async fn test_register_duplicate_conflicts() {
        let state = test_state();
        register(&state, request("alice", "hunter22")).await.unwrap();

        let err = register(&state, request("ALICE", "other-pass")).await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_short_password() {
        let state = test_state();
        let err = register(&state, request("alice", "123")).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert!(state.identities.find_by_username("alice").unwrap().is_none());
    }
}
