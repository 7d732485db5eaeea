//! Repository layer over the single-table item store.
//!
//! # Responsibility
//! - Map themes, ownership links and entries onto store items.
//! - Own the multi-item write protocols that keep denormalized copies
//!   consistent under partial failure.
//! - Translate store failures into the repository error taxonomy.
//!
//! # Invariants
//! - Raw `StoreError` values never cross this boundary except wrapped in
//!   `RepoError::Unavailable`.
//! - Every store call issued on behalf of one operation receives the
//!   caller's `CallContext`, including compensating calls.
//! - Persisted attribute names are the on-disk format and must not change.

use crate::model::ValidationError;
use crate::store::{Attributes, Item, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod entry_repo;
pub mod theme_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Entity named in not-found/conflict errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Theme,
    Entry,
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Theme => write!(f, "theme"),
            Self::Entry => write!(f, "entry"),
        }
    }
}

/// Coarse error class used by outer layers to choose a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    AlreadyExists,
    Conflict,
    InvalidArgument,
    Unavailable,
    Inconsistent,
}

#[derive(Debug)]
pub enum RepoError {
    NotFound {
        kind: EntityKind,
        id: Uuid,
    },
    /// Authenticated but not the owner.
    Forbidden {
        kind: EntityKind,
        id: Uuid,
    },
    /// Default themes can never be updated or deleted.
    DefaultThemeImmutable(Uuid),
    AlreadyExists {
        kind: EntityKind,
        id: Uuid,
    },
    Conflict {
        kind: EntityKind,
        id: Uuid,
        reason: String,
    },
    InvalidArgument(String),
    Validation(ValidationError),
    /// The theme does not enable the requested aggregation.
    FeatureNotSupported {
        theme_id: Uuid,
        feature: String,
    },
    Unavailable(StoreError),
    /// A compensating write failed and denormalized data may have drifted.
    Inconsistent(String),
    /// A persisted item could not be decoded.
    InvalidData(String),
}

impl RepoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden { .. } | Self::DefaultThemeImmutable(_) => ErrorKind::Forbidden,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InvalidArgument(_) | Self::Validation(_) | Self::FeatureNotSupported { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Inconsistent(_) | Self::InvalidData(_) => ErrorKind::Inconsistent,
        }
    }

    /// Whether the caller may retry (with fresh identifiers for collisions).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AlreadyExists | ErrorKind::Conflict | ErrorKind::Unavailable
        )
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::Forbidden { kind, id } => write!(f, "{kind} access forbidden: {id}"),
            Self::DefaultThemeImmutable(id) => {
                write!(f, "default theme cannot be modified or deleted: {id}")
            }
            Self::AlreadyExists { kind, id } => write!(f, "{kind} already exists: {id}"),
            Self::Conflict { kind, id, reason } => write!(f, "{kind} conflict on {id}: {reason}"),
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::FeatureNotSupported { theme_id, feature } => {
                write!(f, "theme {theme_id} does not support `{feature}`")
            }
            Self::Unavailable(err) => write!(f, "store unavailable: {err}"),
            Self::Inconsistent(message) => write!(f, "inconsistent state: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Unavailable(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for RepoError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<StoreError> for RepoError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::CorruptItem { key, reason } => {
                Self::InvalidData(format!("item {key}: {reason}"))
            }
            other => Self::Unavailable(other),
        }
    }
}

pub(crate) fn require_id(id: Uuid, what: &str) -> RepoResult<Uuid> {
    if id.is_nil() {
        return Err(RepoError::invalid_argument(format!("{what} is required")));
    }
    Ok(id)
}

/// Serializes a persisted record into item attributes.
pub(crate) fn encode_record<T: Serialize>(record: &T) -> RepoResult<Attributes> {
    match serde_json::to_value(record) {
        Ok(Value::Object(attributes)) => Ok(attributes),
        Ok(_) => Err(RepoError::InvalidData(
            "record did not serialize to an attribute map".to_string(),
        )),
        Err(err) => Err(RepoError::InvalidData(format!(
            "record serialization failed: {err}"
        ))),
    }
}

/// Decodes item attributes back into a persisted record.
pub(crate) fn decode_record<T: DeserializeOwned>(item: &Item) -> RepoResult<T> {
    serde_json::from_value(Value::Object(item.attributes.clone())).map_err(|err| {
        RepoError::InvalidData(format!("item {} cannot be decoded: {err}", item.key))
    })
}
