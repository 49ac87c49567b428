//! Store error types

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tenant {0} not found")]
    TenantNotFound(Uuid),

    #[error("tenant name {0:?} already registered")]
    NameCollision(String),

    #[error("no oauth config for tenant {0}")]
    OAuthConfigMissing(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection pool exhausted")]
    PoolExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Error::PoolExhausted,
            sqlx::Error::RowNotFound => Error::Database("row not found".into()),
            other => Error::Database(other.to_string()),
        }
    }
}
