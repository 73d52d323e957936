//! Typed errors raised by the item store.
//!
//! Most of the crate works with `anyhow::Result`; these variants exist so the
//! HTTP layer can recover the failure class with `downcast_ref` and pick a
//! status code.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("invalid item id '{0}': use 1-64 characters from [A-Za-z0-9_-]")]
    InvalidId(String),

    #[error("invalid item reference '{0}': expected <kind>/<id>")]
    InvalidRef(String),

    #[error("unknown item kind '{0}'")]
    UnknownKind(String),

    #[error("invalid item: {0}")]
    Invalid(String),
}
