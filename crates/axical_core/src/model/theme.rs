//! Theme domain model.
//!
//! # Responsibility
//! - Define the theme schema record and its ownership link projection.
//! - Validate field definitions and supported feature identifiers.
//!
//! # Invariants
//! - `is_default` is immutable after creation.
//! - `owner_id` is `Some` iff `is_default == false`.
//! - Field names are unique and match `^[a-z_][a-z0-9_]*$`.

use super::ValidationError;
use chrono::{DateTime, Utc};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub type ThemeId = Uuid;

/// Opaque identifier of the authenticated caller owning data.
pub type OwnerId = Uuid;

static FIELD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("valid field name regex"));

/// Enables summing entry amounts over a date range.
pub const SUM_ALL_FEATURE: &str = "SumAll";

/// Feature identifiers the aggregation layer knows how to execute.
pub const KNOWN_FEATURES: &[&str] = &[
    "monthly_summary",
    "category_aggregation",
    SUM_ALL_FEATURE,
];

/// Value type of one theme field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Number,
    Boolean,
    Textarea,
    Select,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Textarea => "textarea",
            Self::Select => "select",
        }
    }

    /// Whether values of this type are free-form strings that must be
    /// non-empty when the field is required.
    pub fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::Textarea | Self::Select)
    }
}

/// One field definition inside a theme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeField {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
}

impl ThemeField {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        field_type: FieldType,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            field_type,
            required,
        }
    }
}

/// User- or system-owned record schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    /// Nil until assigned; `create` generates one when nil.
    pub theme_id: ThemeId,
    pub theme_name: String,
    pub fields: Vec<ThemeField>,
    pub is_default: bool,
    pub owner_id: Option<OwnerId>,
    pub supported_features: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Theme {
    /// Builds an owned theme draft with a nil id, to be assigned on create.
    pub fn new(owner_id: OwnerId, theme_name: impl Into<String>, fields: Vec<ThemeField>) -> Self {
        let now = Utc::now();
        Self {
            theme_id: Uuid::nil(),
            theme_name: theme_name.into(),
            fields,
            is_default: false,
            owner_id: Some(owner_id),
            supported_features: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds a system theme visible to every caller.
    pub fn new_default(theme_name: impl Into<String>, fields: Vec<ThemeField>) -> Self {
        let mut theme = Self::new(Uuid::nil(), theme_name, fields);
        theme.owner_id = None;
        theme.is_default = true;
        theme
    }

    /// Returns whether `owner_id` may read this theme.
    pub fn is_visible_to(&self, owner_id: OwnerId) -> bool {
        self.is_default || self.owner_id == Some(owner_id)
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.supported_features.iter().any(|name| name == feature)
    }

    pub fn field(&self, name: &str) -> Option<&ThemeField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Checks name, field definitions and supported features.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.theme_name.trim().is_empty() {
            return Err(ValidationError::EmptyThemeName);
        }
        validate_fields(&self.fields)?;
        validate_supported_features(&self.supported_features)
    }
}

/// Denormalized link letting an owner's partition enumerate its themes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeOwnershipLink {
    pub owner_id: OwnerId,
    pub theme_id: ThemeId,
    pub theme_name: String,
    pub created_at: DateTime<Utc>,
}

pub fn is_valid_field_name(name: &str) -> bool {
    FIELD_NAME_RE.is_match(name)
}

pub fn validate_fields(fields: &[ThemeField]) -> Result<(), ValidationError> {
    if fields.is_empty() {
        return Err(ValidationError::NoFields);
    }

    let mut seen = HashSet::new();
    for (index, field) in fields.iter().enumerate() {
        if !is_valid_field_name(&field.name) {
            return Err(ValidationError::InvalidFieldName {
                index,
                name: field.name.clone(),
            });
        }
        if field.label.trim().is_empty() {
            return Err(ValidationError::EmptyFieldLabel {
                name: field.name.clone(),
            });
        }
        if !seen.insert(field.name.as_str()) {
            return Err(ValidationError::DuplicateFieldName(field.name.clone()));
        }
    }

    Ok(())
}

/// Unknown feature names are accepted but logged.
pub fn validate_supported_features(features: &[String]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for (index, feature) in features.iter().enumerate() {
        if feature.is_empty() {
            return Err(ValidationError::EmptyFeatureName { index });
        }
        if !KNOWN_FEATURES.contains(&feature.as_str()) {
            warn!(
                "event=theme_validate module=model status=warn reason=unknown_feature feature={}",
                feature
            );
        }
        if !seen.insert(feature.as_str()) {
            return Err(ValidationError::DuplicateFeature(feature.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount_field() -> ThemeField {
        ThemeField::new("amount", "Amount", FieldType::Number, true)
    }

    #[test]
    fn field_name_pattern() {
        assert!(is_valid_field_name("amount"));
        assert!(is_valid_field_name("_private_1"));
        assert!(!is_valid_field_name("Amount"));
        assert!(!is_valid_field_name("1st"));
        assert!(!is_valid_field_name("with-dash"));
        assert!(!is_valid_field_name(""));
    }

    #[test]
    fn validate_accepts_well_formed_theme() {
        let mut theme = Theme::new(Uuid::new_v4(), "Expenses", vec![amount_field()]);
        theme.supported_features = vec!["monthly_summary".to_string()];
        theme.validate().unwrap();
    }

    #[test]
    fn validate_rejects_missing_fields_and_duplicates() {
        let theme = Theme::new(Uuid::new_v4(), "Empty", Vec::new());
        assert_eq!(theme.validate(), Err(ValidationError::NoFields));

        let theme = Theme::new(
            Uuid::new_v4(),
            "Dup",
            vec![amount_field(), amount_field()],
        );
        assert_eq!(
            theme.validate(),
            Err(ValidationError::DuplicateFieldName("amount".to_string()))
        );
    }

    #[test]
    fn validate_rejects_blank_name_and_label() {
        let theme = Theme::new(Uuid::new_v4(), "  ", vec![amount_field()]);
        assert_eq!(theme.validate(), Err(ValidationError::EmptyThemeName));

        let theme = Theme::new(
            Uuid::new_v4(),
            "No label",
            vec![ThemeField::new("amount", "", FieldType::Number, false)],
        );
        assert!(matches!(
            theme.validate(),
            Err(ValidationError::EmptyFieldLabel { .. })
        ));
    }

    #[test]
    fn unknown_features_pass_but_duplicates_fail() {
        let features = vec!["custom_chart".to_string()];
        validate_supported_features(&features).unwrap();

        let features = vec!["SumAll".to_string(), "SumAll".to_string()];
        assert_eq!(
            validate_supported_features(&features),
            Err(ValidationError::DuplicateFeature("SumAll".to_string()))
        );
    }

    #[test]
    fn default_theme_is_visible_to_everyone() {
        let theme = Theme::new_default("Diary", vec![amount_field()]);
        assert!(theme.owner_id.is_none());
        assert!(theme.is_visible_to(Uuid::new_v4()));

        let owner = Uuid::new_v4();
        let owned = Theme::new(owner, "Mine", vec![amount_field()]);
        assert!(owned.is_visible_to(owner));
        assert!(!owned.is_visible_to(Uuid::new_v4()));
    }

    #[test]
    fn field_type_serializes_lowercase() {
        let json = serde_json::to_string(&FieldType::DateTime).unwrap();
        assert_eq!(json, "\"datetime\"");
        let parsed: FieldType = serde_json::from_str("\"textarea\"").unwrap();
        assert_eq!(parsed, FieldType::Textarea);
    }
}
