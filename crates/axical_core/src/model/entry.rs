//! Entry domain model.
//!
//! # Responsibility
//! - Define dated records whose data conforms to a theme's fields.
//! - Check entry data against field definitions.
//!
//! # Invariants
//! - `theme_id` is immutable after creation.
//! - `entry_date` participates in the storage key; changing it moves the
//!   record.

use super::theme::{FieldType, OwnerId, ThemeField, ThemeId};
use super::ValidationError;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub type EntryId = Uuid;

/// Field name to value mapping stored with an entry.
pub type EntryData = BTreeMap<String, Value>;

pub const ENTRY_DATE_FORMAT: &str = "%Y-%m-%d";

/// Field summed by the `SumAll` feature.
pub const AMOUNT_FIELD: &str = "amount";

/// A dated record conforming to a theme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Nil until assigned; `create` generates one when nil.
    pub entry_id: EntryId,
    pub theme_id: ThemeId,
    pub owner_id: OwnerId,
    pub entry_date: NaiveDate,
    pub data: EntryData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    /// Builds an entry draft with a nil id, to be assigned on create.
    pub fn new(owner_id: OwnerId, theme_id: ThemeId, entry_date: NaiveDate, data: EntryData) -> Self {
        let now = Utc::now();
        Self {
            entry_id: Uuid::nil(),
            theme_id,
            owner_id,
            entry_date,
            data,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks `data` against the referenced theme's field definitions.
    ///
    /// Null values are accepted for optional fields only.
    pub fn validate_against(&self, fields: &[ThemeField]) -> Result<(), ValidationError> {
        let defined: HashMap<&str, &ThemeField> = fields
            .iter()
            .map(|field| (field.name.as_str(), field))
            .collect();

        for field in fields.iter().filter(|field| field.required) {
            match self.data.get(&field.name) {
                None => return Err(ValidationError::MissingRequiredField(field.name.clone())),
                Some(Value::Null) => {
                    return Err(ValidationError::EmptyRequiredField(field.name.clone()))
                }
                Some(Value::String(text)) if field.field_type.is_textual() && text.is_empty() => {
                    return Err(ValidationError::EmptyRequiredField(field.name.clone()))
                }
                Some(_) => {}
            }
        }

        for (key, value) in &self.data {
            let field = defined
                .get(key.as_str())
                .ok_or_else(|| ValidationError::UndefinedField(key.clone()))?;
            if value.is_null() {
                continue;
            }
            check_value_type(field, value)?;
        }

        Ok(())
    }
}

fn check_value_type(field: &ThemeField, value: &Value) -> Result<(), ValidationError> {
    let mismatch = |expected: &'static str| ValidationError::TypeMismatch {
        field: field.name.clone(),
        expected,
    };

    match field.field_type {
        FieldType::Text | FieldType::Textarea | FieldType::Select => {
            value.as_str().map(|_| ()).ok_or_else(|| mismatch("a string"))
        }
        FieldType::Number => {
            if value.is_number() {
                Ok(())
            } else {
                Err(mismatch("a number"))
            }
        }
        FieldType::Boolean => value.as_bool().map(|_| ()).ok_or_else(|| mismatch("a boolean")),
        FieldType::Date => {
            let text = value
                .as_str()
                .ok_or_else(|| mismatch("a date string (YYYY-MM-DD)"))?;
            parse_entry_date(text)
                .map(|_| ())
                .ok_or_else(|| ValidationError::InvalidDateValue {
                    field: field.name.clone(),
                    value: text.to_string(),
                })
        }
        FieldType::DateTime => {
            let text = value
                .as_str()
                .ok_or_else(|| mismatch("a datetime string (RFC 3339)"))?;
            DateTime::parse_from_rfc3339(text)
                .map(|_| ())
                .map_err(|_| ValidationError::InvalidDateValue {
                    field: field.name.clone(),
                    value: text.to_string(),
                })
        }
    }
}

/// Sums the `amount` value of every entry.
///
/// An entry without an `amount` key fails the whole sum; null counts as zero.
pub fn sum_amounts(entries: &[Entry]) -> Result<f64, ValidationError> {
    entries.iter().try_fold(0.0, |sum, entry| match entry.data.get(AMOUNT_FIELD) {
        None => Err(ValidationError::MissingEntryValue {
            entry_id: entry.entry_id,
            field: AMOUNT_FIELD.to_string(),
        }),
        Some(Value::Null) => Ok(sum),
        Some(value) => value
            .as_f64()
            .map(|amount| sum + amount)
            .ok_or_else(|| ValidationError::TypeMismatch {
                field: AMOUNT_FIELD.to_string(),
                expected: "a number",
            }),
    })
}

/// Whether `date` renders as a four-digit year, so that its key text sorts
/// in calendar order.
pub fn is_storable_date(date: NaiveDate) -> bool {
    (0..=9999).contains(&date.year())
}

/// Formats a date the way it is embedded in keys and attributes.
pub fn format_entry_date(date: NaiveDate) -> String {
    date.format(ENTRY_DATE_FORMAT).to_string()
}

pub fn parse_entry_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, ENTRY_DATE_FORMAT).ok()
}
