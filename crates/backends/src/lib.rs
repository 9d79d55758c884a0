//! Storage backends: the internal relational store and the external
//! SQL source reader, plus the query lowering shared by both.
//!
//! A model reads through exactly one backend, chosen by its manifest
//! resource. The [`Backend`] seam is an explicit enum rather than a
//! trait object: the two variants differ in capability (only the
//! internal store accepts writes) and callers match on that.

pub mod query;

mod postgres;
mod sql;

pub use postgres::{
    ModelTables, PostgresStore, ReadTransaction, SqlQuery, WriteTransaction,
};
pub use sql::SqlSource;

use manifest::Action;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Domain(#[from] manifest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Keymap(#[from] keymap::Error),

    #[error("{model}: row {id} was changed by another transaction (expected revision {expected:?})")]
    RevisionMismatch {
        model: String,
        id: String,
        expected: String,
    },

    #[error("model {model:?} has no tables prepared in this store")]
    UnpreparedModel { model: String },
}

impl Error {
    /// HTTP status for this failure. Domain errors carry their own
    /// mapping; a revision mismatch is a write conflict; the rest are
    /// internal faults.
    pub fn status(&self) -> u16 {
        match self {
            Error::Domain(err) => err.status(),
            Error::RevisionMismatch { .. } => 409,
            _ => 500,
        }
    }
}

/// One data item moving through a write operation.
#[derive(Debug, Clone)]
pub struct DataItem {
    pub action: Action,
    /// Incoming fields, reserved and plain.
    pub patch: serde_json::Map<String, serde_json::Value>,
    /// The currently saved row, present for update/patch/delete.
    pub saved: Option<serde_json::Map<String, serde_json::Value>>,
}

impl DataItem {
    pub fn insert(patch: serde_json::Map<String, serde_json::Value>) -> DataItem {
        DataItem {
            action: Action::Insert,
            patch,
            saved: None,
        }
    }
}

/// The backend a model resolves to.
#[derive(Clone, Copy)]
pub enum Backend<'a> {
    Internal(&'a PostgresStore),
    Sql(&'a SqlSource),
}
