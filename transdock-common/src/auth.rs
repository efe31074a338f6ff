//! Authentication types shared between the API and its clients

use serde::{Deserialize, Serialize};

/// User account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub role: String, // admin, user
    pub enabled: bool,
}

/// Login request
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login response carrying the issued token pair
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64, // seconds until the access token expires
    pub username: String,
    pub role: String,
}

/// Refresh request
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// JWT claims carried by both access and refresh tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,        // username
    pub role: String,       // role name
    pub token_type: String, // "access" or "refresh"
    pub exp: i64,           // expiry, unix seconds
    pub iat: i64,           // issued at, unix seconds
}

/// Token blacklist statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistStats {
    pub total: usize,
    pub active: usize,
    pub last_cleanup: String,
    pub next_cleanup: String,
}
