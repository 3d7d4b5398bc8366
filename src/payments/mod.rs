mod errors;
mod provisioner;

pub use errors::ProvisioningError;
pub use provisioner::{
    init_db, run_migrations, AccountId, AccountProvisioner, PgAccountProvisioner, Provisioned,
};
