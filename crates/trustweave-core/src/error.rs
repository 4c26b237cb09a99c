//! Error types for trustweave

use thiserror::Error;

use crate::store::{Address, StoreShape};

/// Main error type for trustweave operations
#[derive(Error, Debug)]
pub enum Error {
    /// A string could not be parsed as a store address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// An account or device identifier is malformed
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// A write did not match the declared shape of the store
    #[error("Store {address} is a {actual} store, operation requires {expected}")]
    ShapeMismatch {
        /// Address of the store
        address: Address,
        /// Shape the store was opened with
        actual: StoreShape,
        /// Shape the operation needs
        expected: StoreShape,
    },

    /// A dynamic set received several branches but no way to tell them apart
    #[error("Cannot derive a deduplication code for {branches} branches")]
    MissingDedupCode {
        /// Number of branches the root produced
        branches: usize,
    },

    /// The store backend failed to open or write a store
    #[error("Store error: {0}")]
    Store(String),

    /// Error during gossip transport operations
    #[error("Gossip error: {0}")]
    Gossip(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Identity-related error (keys, signatures)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error during local storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The component this handle refers to has already shut down
    #[error("Tracker closed")]
    Closed,
}

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MissingDedupCode { branches: 3 };
        assert_eq!(
            format!("{}", err),
            "Cannot derive a deduplication code for 3 branches"
        );
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = Error::ShapeMismatch {
            address: Address::derive("trust", "alice"),
            actual: StoreShape::KeyValue,
            expected: StoreShape::Collection,
        };
        let text = err.to_string();
        assert!(text.contains("key-value store"));
        assert!(text.contains("requires collection"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
