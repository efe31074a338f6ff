//! Authentication: JWT issue/verify, seed users, token blacklist
//!
//! Kept deliberately small: two seeded accounts (admin, user) with
//! argon2-hashed passwords, HS-family JWTs, and an expiring blacklist that
//! makes logout effective before token expiry.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use transdock_common::auth::{BlacklistStats, Claims, LoginResponse};
use transdock_common::{Error, Result};

use crate::config::AuthConfig;

const TOKEN_TYPE_ACCESS: &str = "access";
const TOKEN_TYPE_REFRESH: &str = "refresh";
const CLEANUP_INTERVAL_SECS: i64 = 3600;

/// Expiring set of invalidated tokens.
pub struct TokenBlacklist {
    inner: Mutex<BlacklistInner>,
}

struct BlacklistInner {
    entries: HashMap<String, Option<DateTime<Utc>>>,
    last_cleanup: DateTime<Utc>,
}

impl TokenBlacklist {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BlacklistInner {
                entries: HashMap::new(),
                last_cleanup: Utc::now(),
            }),
        }
    }

    /// Add a token; entries without an expiry are kept until restart.
    pub fn blacklist(&self, token: &str, expires_at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().expect("blacklist lock poisoned");
        inner.entries.insert(token.to_string(), expires_at);
        Self::cleanup_if_needed(&mut inner);
    }

    pub fn is_blacklisted(&self, token: &str) -> bool {
        let mut inner = self.inner.lock().expect("blacklist lock poisoned");
        Self::cleanup_if_needed(&mut inner);
        match inner.entries.get(token) {
            Some(Some(expiry)) => {
                if *expiry < Utc::now() {
                    inner.entries.remove(token);
                    false
                } else {
                    true
                }
            }
            Some(None) => true,
            None => false,
        }
    }

    pub fn stats(&self) -> BlacklistStats {
        let inner = self.inner.lock().expect("blacklist lock poisoned");
        let now = Utc::now();
        let active = inner
            .entries
            .values()
            .filter(|expiry| expiry.map_or(true, |e| e >= now))
            .count();
        BlacklistStats {
            total: inner.entries.len(),
            active,
            last_cleanup: inner.last_cleanup.to_rfc3339(),
            next_cleanup: (inner.last_cleanup + Duration::seconds(CLEANUP_INTERVAL_SECS))
                .to_rfc3339(),
        }
    }

    fn cleanup_if_needed(inner: &mut BlacklistInner) {
        let now = Utc::now();
        if (now - inner.last_cleanup).num_seconds() < CLEANUP_INTERVAL_SECS {
            return;
        }
        let before = inner.entries.len();
        inner.entries.retain(|_, expiry| expiry.map_or(true, |e| e >= now));
        inner.last_cleanup = now;
        info!(
            "Token blacklist cleanup removed {} expired entries",
            before - inner.entries.len()
        );
    }
}

impl Default for TokenBlacklist {
    fn default() -> Self {
        Self::new()
    }
}

struct StoredUser {
    username: String,
    role: String,
    password_hash: String,
}

/// JWT + user store + blacklist behind one service.
pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    access_token_expire_minutes: i64,
    refresh_token_expire_days: i64,
    users: Mutex<HashMap<String, StoredUser>>,
    pub blacklist: TokenBlacklist,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let algorithm = match config.jwt_algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(Error::validation(
                    "jwt_algorithm",
                    format!("unsupported algorithm: {}", other),
                ))
            }
        };

        let secret = if config.jwt_secret_key.is_empty() {
            // Testing mode only; config validation rejects this in production.
            warn!("JWT secret not set, generating an ephemeral one");
            use rand::Rng;
            let bytes: [u8; 32] = rand::thread_rng().gen();
            bytes.to_vec()
        } else {
            config.jwt_secret_key.as_bytes().to_vec()
        };

        let service = Self {
            encoding_key: EncodingKey::from_secret(&secret),
            decoding_key: DecodingKey::from_secret(&secret),
            algorithm,
            access_token_expire_minutes: config.access_token_expire_minutes,
            refresh_token_expire_days: config.refresh_token_expire_days,
            users: Mutex::new(HashMap::new()),
            blacklist: TokenBlacklist::new(),
        };

        service.seed_user("admin", "admin", &config.admin_password)?;
        service.seed_user("user", "user", &config.user_password)?;
        Ok(service)
    }

    fn seed_user(&self, username: &str, role: &str, password: &str) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::unexpected("PASSWORD_HASH", e.to_string()))?
            .to_string();

        self.users.lock().expect("user lock poisoned").insert(
            username.to_string(),
            StoredUser {
                username: username.to_string(),
                role: role.to_string(),
                password_hash: hash,
            },
        );
        Ok(())
    }

    /// Verify credentials and issue an access + refresh token pair.
    pub fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let users = self.users.lock().expect("user lock poisoned");
        let user = users
            .get(username)
            .ok_or_else(|| Error::validation("credentials", "invalid username or password"))?;

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| Error::unexpected("PASSWORD_HASH", e.to_string()))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| Error::validation("credentials", "invalid username or password"))?;

        info!("User logged in: {}", username);
        self.issue_pair(&user.username, &user.role)
    }

    /// Exchange a refresh token for a fresh pair; the old refresh token is
    /// blacklisted.
    pub fn refresh(&self, refresh_token: &str) -> Result<LoginResponse> {
        let claims = self.decode_token(refresh_token)?;
        if claims.token_type != TOKEN_TYPE_REFRESH {
            return Err(Error::validation("token", "not a refresh token"));
        }
        if self.blacklist.is_blacklisted(refresh_token) {
            return Err(Error::validation("token", "token has been revoked"));
        }

        self.blacklist.blacklist(
            refresh_token,
            Utc.timestamp_opt(claims.exp, 0).single(),
        );
        self.issue_pair(&claims.sub, &claims.role)
    }

    /// Blacklist a token until its natural expiry.
    pub fn logout(&self, token: &str) -> Result<()> {
        let expiry = match self.decode_token(token) {
            Ok(claims) => Utc.timestamp_opt(claims.exp, 0).single(),
            // Undecodable tokens are blacklisted forever; better safe.
            Err(_) => None,
        };
        self.blacklist.blacklist(token, expiry);
        Ok(())
    }

    /// Validate an access token, rejecting revoked and refresh tokens.
    pub fn verify_access_token(&self, token: &str) -> Result<Claims> {
        if self.blacklist.is_blacklisted(token) {
            return Err(Error::validation("token", "token has been revoked"));
        }
        let claims = self.decode_token(token)?;
        if claims.token_type != TOKEN_TYPE_ACCESS {
            return Err(Error::validation("token", "not an access token"));
        }
        Ok(claims)
    }

    fn issue_pair(&self, username: &str, role: &str) -> Result<LoginResponse> {
        let access_expires = Duration::minutes(self.access_token_expire_minutes);
        let access_token = self.issue(username, role, TOKEN_TYPE_ACCESS, access_expires)?;
        let refresh_token = self.issue(
            username,
            role,
            TOKEN_TYPE_REFRESH,
            Duration::days(self.refresh_token_expire_days),
        )?;

        Ok(LoginResponse {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
            expires_in: access_expires.num_seconds() as u64,
            username: username.to_string(),
            role: role.to_string(),
        })
    }

    fn issue(
        &self,
        username: &str,
        role: &str,
        token_type: &str,
        validity: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            role: role.to_string(),
            token_type: token_type.to_string(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
        };

        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| Error::unexpected("JWT_ENCODE", e.to_string()))
    }

    fn decode_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::validation("token", format!("invalid token: {}", e)))
    }
}
