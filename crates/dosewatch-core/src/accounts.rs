//! User accounts: registration, sign-in, and password reset.
//!
//! Passwords are stored as
//! `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AccountError, CoreError, Result, ValidationError};
use crate::storage::Database;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LENGTH] {
    let mut out = [0u8; HASH_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str, iterations: u32) -> String {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = derive(password, &salt, iterations);
    format!("{SCHEME}${iterations}${}${}", hex::encode(salt), hex::encode(hash))
}

/// Check a password against a stored hash in constant time.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, AccountError> {
    let mut parts = stored.split('$');
    let (Some(SCHEME), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(AccountError::MalformedHash);
    };
    let iterations: u32 = iterations.parse().map_err(|_| AccountError::MalformedHash)?;
    let salt = hex::decode(salt).map_err(|_| AccountError::MalformedHash)?;
    let expected = hex::decode(expected).map_err(|_| AccountError::MalformedHash)?;
    if iterations == 0 || expected.len() != HASH_LENGTH {
        return Err(AccountError::MalformedHash);
    }

    let computed = derive(password, &salt, iterations);
    Ok(bool::from(computed.as_slice().ct_eq(expected.as_slice())))
}

fn normalize_email(email: &str) -> Result<String, ValidationError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ValidationError::MissingField("email"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(ValidationError::invalid("email", format!("'{email}' is not an email address"))),
    }
}

fn require_password(password: &str) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::MissingField("password"));
    }
    Ok(())
}

/// Account operations over the user table.
pub struct AccountService {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    iterations: u32,
}

impl AccountService {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, iterations: u32) -> Self {
        Self {
            db,
            clock,
            iterations: iterations.max(1),
        }
    }

    pub fn register(&self, name: &str, email: &str, password: &str) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingField("name").into());
        }
        let email = normalize_email(email)?;
        require_password(password)?;

        let user = User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.clone(),
            password_hash: hash_password(password, self.iterations),
            created_at: self.clock.now(),
        };
        if !self.db.insert_user(&user)? {
            return Err(AccountError::EmailTaken(email).into());
        }
        tracing::info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Unknown email and wrong password fail the same way.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        let email = normalize_email(email).map_err(|_| AccountError::InvalidCredentials)?;
        let Some(user) = self.db.find_user_by_email(&email)? else {
            return Err(AccountError::InvalidCredentials.into());
        };
        if verify_password(password, &user.password_hash)? {
            Ok(user)
        } else {
            Err(AccountError::InvalidCredentials.into())
        }
    }

    /// Replace a user's password. The current password must verify first;
    /// unknown emails fail the same way as a wrong password.
    pub fn reset_password(
        &self,
        email: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        require_password(new_password)?;
        let user = self.authenticate(email, current_password)?;
        let hash = hash_password(new_password, self.iterations);
        if !self.db.update_password_hash(&user.id, &hash)? {
            return Err(CoreError::user_not_found(user.id));
        }
        tracing::info!(user_id = %user.id, "password reset");
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<User> {
        self.db
            .get_user(id)?
            .ok_or_else(|| CoreError::user_not_found(id))
    }
}
