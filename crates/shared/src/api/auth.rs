use crate::constants::{MAX_DISPLAY_NAME_LENGTH, MAX_USERNAME_LENGTH};
use crate::error::KemChatError;
use crate::ids::UserId;
use serde::{Deserialize, Serialize};

/// Registration request. The server stores a verifier derived from
/// `authentication_key`, never the password or the decryption key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub display_name: String,
    pub authentication_key: String,
    pub public_key: String,
    pub encrypted_private_key: String,
    pub salt: String,
}

impl SignupRequest {
    /// Reject empty or oversized names and missing key material.
    pub fn validate(&self) -> Result<(), KemChatError> {
        validate_username(&self.username)?;
        if self.display_name.trim().is_empty() {
            return Err(KemChatError::Validation("display name is required".into()));
        }
        if self.display_name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
            return Err(KemChatError::Validation("display name too long".into()));
        }
        if self.authentication_key.is_empty() {
            return Err(KemChatError::Validation("authentication key is required".into()));
        }
        if self.public_key.is_empty() || self.encrypted_private_key.is_empty() {
            return Err(KemChatError::Validation("key material is required".into()));
        }
        if self.salt.is_empty() {
            return Err(KemChatError::Validation("salt is required".into()));
        }
        Ok(())
    }
}

/// Registration response with the new user ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupResponse {
    pub user_id: UserId,
}

/// Salt lookup response; the client needs it before it can derive its keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaltResponse {
    pub salt: String,
}

/// Login request carrying the authentication half of the master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub authentication_key: String,
}

/// Login response returning the stored identity for local unwrapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub display_name: String,
    pub public_key: String,
    pub encrypted_private_key: String,
}

pub fn validate_username(username: &str) -> Result<(), KemChatError> {
    if username.trim().is_empty() {
        return Err(KemChatError::Validation("username is required".into()));
    }
    if username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(KemChatError::Validation("username too long".into()));
    }
    Ok(())
}
