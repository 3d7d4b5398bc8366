use crate::payments::{AccountId, AccountProvisioner, Provisioned, ProvisioningError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, Once};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    });
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAccount {
    pub id: AccountId,
    pub username: String,
    pub email: String,
    pub balance: f64,
}

/// Keeps accounts keyed by user id, mirroring the unique constraint.
#[derive(Default)]
pub struct InMemoryProvisioner {
    accounts: Mutex<HashMap<i64, StoredAccount>>,
    calls: Mutex<Vec<i64>>,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self, user_id: i64) -> Option<StoredAccount> {
        self.accounts.lock().unwrap().get(&user_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().unwrap().len()
    }

    /// User ids in the order they were handed to `create_if_absent`.
    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountProvisioner for InMemoryProvisioner {
    async fn create_if_absent(
        &self,
        user_id: i64,
        username: &str,
        email: &str,
    ) -> Result<Provisioned, ProvisioningError> {
        self.calls.lock().unwrap().push(user_id);

        let mut accounts = self.accounts.lock().unwrap();
        if let Some(existing) = accounts.get(&user_id) {
            return Ok(Provisioned::Existing(existing.id));
        }

        let id = accounts.len() as AccountId + 1;
        accounts.insert(
            user_id,
            StoredAccount {
                id,
                username: username.to_string(),
                email: email.to_string(),
                balance: 0.0,
            },
        );
        Ok(Provisioned::Created(id))
    }
}

/// Fails for every user id in `failing`, delegates the rest.
pub struct FlakyProvisioner {
    pub inner: InMemoryProvisioner,
    pub failing: Vec<i64>,
}

#[async_trait]
impl AccountProvisioner for FlakyProvisioner {
    async fn create_if_absent(
        &self,
        user_id: i64,
        username: &str,
        email: &str,
    ) -> Result<Provisioned, ProvisioningError> {
        if self.failing.contains(&user_id) {
            self.inner.calls.lock().unwrap().push(user_id);
            return Err(ProvisioningError::DatabaseError {
                user_id,
                source: sqlx::Error::PoolTimedOut,
            });
        }
        self.inner.create_if_absent(user_id, username, email).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_user_gets_one_account_with_zero_balance() {
        let provisioner = InMemoryProvisioner::new();
        let outcome = provisioner.create_if_absent(1, "bob", "b@x.com").await.unwrap();

        assert!(outcome.is_created());
        let account = provisioner.account(1).unwrap();
        assert_eq!(account.balance, 0.0);
        assert_eq!(account.username, "bob");
        assert_eq!(provisioner.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_user_is_a_noop() {
        let provisioner = InMemoryProvisioner::new();
        let first = provisioner.create_if_absent(1, "bob", "b@x.com").await.unwrap();
        let second = provisioner.create_if_absent(1, "robert", "r@x.com").await.unwrap();

        assert_eq!(second, Provisioned::Existing(first.account_id()));
        assert_eq!(provisioner.account(1).unwrap().username, "bob");
        assert_eq!(provisioner.len(), 1);
    }
}
