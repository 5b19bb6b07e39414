use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simplebank_core::{Entity, VerifyEmailId};

/// How long a verification secret stays valid.
pub const VERIFY_EMAIL_TTL_MINUTES: i64 = 15;

/// A registered user. `username` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Entity for User {
    type Id = String;

    fn id(&self) -> &Self::Id {
        &self.username
    }
}

/// Already-validated registration fields. Hashing happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

/// Email verification challenge issued after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmail {
    pub id: VerifyEmailId,
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl Entity for VerifyEmail {
    type Id = VerifyEmailId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl VerifyEmail {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expired_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVerifyEmailParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
}
