#[derive(thiserror::Error, Debug)]
pub enum ProvisioningError {
    #[error("Could not connect to the payments database")]
    ConnectError {
        #[source]
        source: sqlx::Error,
    },

    #[error("Payments database migrations failed")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Payment account for user {user_id} could not be written")]
    DatabaseError {
        user_id: i64,
        #[source]
        source: sqlx::Error,
    },
}
