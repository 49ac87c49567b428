//! Tenant registry error types

use store::TenantId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tenant {0} not found")]
    NotFound(TenantId),

    #[error("tenant name {0:?} already registered")]
    NameCollision(String),

    #[error("scope {0:?} does not match the required pattern")]
    InvalidScopeFormat(String),

    #[error("instance url {instance_url} does not share an origin with region {region}'s endpoint")]
    RegionMismatch { region: String, instance_url: String },

    #[error("unknown region {0:?}")]
    UnknownRegion(String),

    #[error("credential decryption failed for tenant {0}")]
    DecryptError(TenantId),

    #[error(transparent)]
    Store(#[from] store::Error),

    #[error(transparent)]
    Crypto(#[from] crypto::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
