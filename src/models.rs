// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted by the user service once a new user has been committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user_id: i64,
    pub username: String,
    pub email: String,
}

impl UserCreated {
    pub fn new(user_id: i64, username: &str, email: &str) -> Self {
        Self {
            user_id,
            username: username.to_string(),
            email: email.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentAccount {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub email: String,
    pub balance: f64,
    pub created_at: DateTime<Utc>,
}
