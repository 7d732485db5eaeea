//! Calendar domain model.
//!
//! # Responsibility
//! - Define themes (user-definable record schemas) and entries (dated
//!   records conforming to a theme).
//! - Validate entity payloads before they reach persistence.
//!
//! # Invariants
//! - Default themes have no owner; non-default themes have exactly one.
//! - Entry data keys are a subset of the referenced theme's field names.

use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod entry;
pub mod theme;

/// Validation failure for theme definitions or entry payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyThemeName,
    NoFields,
    InvalidFieldName { index: usize, name: String },
    EmptyFieldLabel { name: String },
    DuplicateFieldName(String),
    EmptyFeatureName { index: usize },
    DuplicateFeature(String),
    UndefinedField(String),
    MissingRequiredField(String),
    EmptyRequiredField(String),
    TypeMismatch {
        field: String,
        expected: &'static str,
    },
    InvalidDateValue { field: String, value: String },
    MissingEntryValue { entry_id: Uuid, field: String },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyThemeName => write!(f, "theme name is required"),
            Self::NoFields => write!(f, "theme must have at least one field"),
            Self::InvalidFieldName { index, name } => write!(
                f,
                "field {index} (`{name}`): name must match ^[a-z_][a-z0-9_]*$"
            ),
            Self::EmptyFieldLabel { name } => write!(f, "field `{name}`: label is required"),
            Self::DuplicateFieldName(name) => write!(f, "field name `{name}` is duplicated"),
            Self::EmptyFeatureName { index } => {
                write!(f, "feature {index}: name cannot be empty")
            }
            Self::DuplicateFeature(name) => write!(f, "feature name `{name}` is duplicated"),
            Self::UndefinedField(name) => {
                write!(f, "field `{name}` is not defined in the theme")
            }
            Self::MissingRequiredField(name) => write!(f, "required field `{name}` is missing"),
            Self::EmptyRequiredField(name) => {
                write!(f, "required field `{name}` cannot be empty")
            }
            Self::TypeMismatch { field, expected } => {
                write!(f, "field `{field}` expects {expected}")
            }
            Self::InvalidDateValue { field, value } => {
                write!(f, "field `{field}` has invalid date/time value `{value}`")
            }
            Self::MissingEntryValue { entry_id, field } => {
                write!(f, "entry {entry_id} has no `{field}` value")
            }
        }
    }
}

impl Error for ValidationError {}
