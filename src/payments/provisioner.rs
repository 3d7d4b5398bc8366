use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, info};

use super::ProvisioningError;
use crate::models::PaymentAccount;

pub type AccountId = i64;

// Embed the migrations directory at compile time
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Result of a create-if-absent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created(AccountId),
    Existing(AccountId),
}

impl Provisioned {
    pub fn account_id(&self) -> AccountId {
        match self {
            Provisioned::Created(id) | Provisioned::Existing(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Provisioned::Created(_))
    }
}

/// Creates a payment account for a user unless one already exists.
///
/// Implementations must be idempotent per `user_id`: repeated or concurrent
/// calls for the same user leave exactly one account behind and all succeed.
#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    async fn create_if_absent(
        &self,
        user_id: i64,
        username: &str,
        email: &str,
    ) -> Result<Provisioned, ProvisioningError>;
}

/// Opens a pool against `dsn` and checks the database answers.
#[tracing::instrument(skip(dsn), err)]
pub async fn init_db(dsn: &str) -> Result<PgPool, ProvisioningError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(dsn)
        .await
        .map_err(|source| ProvisioningError::ConnectError { source })?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|source| ProvisioningError::ConnectError { source })?;

    debug!("Payments database reachable");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), ProvisioningError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgAccountProvisioner {
    pool: PgPool,
}

impl PgAccountProvisioner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn find_by_user_id(
        &self,
        user_id: i64,
    ) -> Result<Option<PaymentAccount>, ProvisioningError> {
        sqlx::query_as::<_, PaymentAccount>(
            r#"
            SELECT id, user_id, username, email, balance::float8 AS balance, created_at
            FROM payment_accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|source| ProvisioningError::DatabaseError { user_id, source })
    }
}

#[async_trait]
impl AccountProvisioner for PgAccountProvisioner {
    #[tracing::instrument(skip(self, username, email), err)]
    async fn create_if_absent(
        &self,
        user_id: i64,
        username: &str,
        email: &str,
    ) -> Result<Provisioned, ProvisioningError> {
        // The unique constraint on user_id arbitrates racing inserts
        let inserted: Option<AccountId> = sqlx::query_scalar(
            r#"
            INSERT INTO payment_accounts (user_id, username, email, balance)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|source| ProvisioningError::DatabaseError { user_id, source })?;

        if let Some(id) = inserted {
            info!(account_id = id, user_id, username, email, "Created payment account");
            return Ok(Provisioned::Created(id));
        }

        let existing: AccountId =
            sqlx::query_scalar("SELECT id FROM payment_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|source| ProvisioningError::DatabaseError { user_id, source })?;

        info!(account_id = existing, user_id, "Payment account already exists, skipping creation");
        Ok(Provisioned::Existing(existing))
    }
}
