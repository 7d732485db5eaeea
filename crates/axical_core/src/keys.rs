//! Key derivation for the single-table layout.
//!
//! # Responsibility
//! - Map entity identifiers to primary and secondary-index keys.
//! - Provide the bounds and prefixes used by range queries.
//!
//! # Invariants
//! - Derivation is pure and deterministic; callers reject nil identifiers
//!   before deriving keys.
//! - Theme metadata lives under `THEME#` partitions, everything owned by a
//!   caller lives under `OWNER#` partitions. Inside an owner partition links
//!   sort under `THEME#` and entries under `ENTRY#`, so the two repositories
//!   never derive the same key.
//! - Entry sort keys embed the date before the id, index sort keys embed the
//!   date before the theme, so per-owner items are ordered by date.

use crate::model::entry::{format_entry_date, EntryId};
use crate::model::theme::{OwnerId, ThemeId};
use chrono::NaiveDate;

pub const THEME_PREFIX: &str = "THEME#";
pub const OWNER_PREFIX: &str = "OWNER#";
pub const ENTRY_PREFIX: &str = "ENTRY#";
pub const ENTRY_DATE_PREFIX: &str = "ENTRY_DATE#";
pub const METADATA_SORT_KEY: &str = "METADATA";

/// Appended to an upper bound so it sorts after every key sharing its prefix.
pub const HIGH_SENTINEL: char = '\u{ff}';

/// Primary key of one stored item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.pk, self.sk)
    }
}

/// Key of an item inside the by-date secondary index (`GSI1PK`/`GSI1SK`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    pub pk: String,
    pub sk: String,
}

impl IndexKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

pub fn owner_partition(owner_id: OwnerId) -> String {
    format!("{OWNER_PREFIX}{owner_id}")
}

pub fn theme_partition(theme_id: ThemeId) -> String {
    format!("{THEME_PREFIX}{theme_id}")
}

/// `THEME#<ThemeID>` / `METADATA`.
pub fn theme_metadata_key(theme_id: ThemeId) -> ItemKey {
    ItemKey::new(theme_partition(theme_id), METADATA_SORT_KEY)
}

/// `OWNER#<OwnerID>` / `THEME#<ThemeID>`.
pub fn ownership_link_key(owner_id: OwnerId, theme_id: ThemeId) -> ItemKey {
    ItemKey::new(
        owner_partition(owner_id),
        format!("{THEME_PREFIX}{theme_id}"),
    )
}

/// Sort-key prefix shared by every ownership link in an owner partition.
pub fn ownership_link_prefix() -> &'static str {
    THEME_PREFIX
}

/// `OWNER#<OwnerID>` / `ENTRY#<EntryDate>#<EntryID>`.
pub fn entry_key(owner_id: OwnerId, entry_date: NaiveDate, entry_id: EntryId) -> ItemKey {
    ItemKey::new(
        owner_partition(owner_id),
        format!(
            "{ENTRY_PREFIX}{}#{entry_id}",
            format_entry_date(entry_date)
        ),
    )
}

/// `OWNER#<OwnerID>` / `ENTRY_DATE#<EntryDate>#<ThemeID>`.
pub fn entry_index_key(owner_id: OwnerId, entry_date: NaiveDate, theme_id: ThemeId) -> IndexKey {
    IndexKey::new(
        owner_partition(owner_id),
        format!(
            "{}#{theme_id}",
            entry_date_lower_bound(entry_date)
        ),
    )
}

/// Inclusive lower bound for entries dated `date` or later.
pub fn entry_date_lower_bound(date: NaiveDate) -> String {
    format!("{ENTRY_DATE_PREFIX}{}", format_entry_date(date))
}

/// Inclusive upper bound covering every index key of `date`.
pub fn entry_date_upper_bound(date: NaiveDate) -> String {
    let mut bound = entry_date_lower_bound(date);
    bound.push(HIGH_SENTINEL);
    bound
}

/// Index sort-key prefix selecting one calendar month.
pub fn entry_month_prefix(year: i32, month: u32) -> String {
    format!("{ENTRY_DATE_PREFIX}{year:04}-{month:02}")
}

/// Index sort-key prefix selecting one exact date and theme.
pub fn entry_date_theme_prefix(date: NaiveDate, theme_id: ThemeId) -> String {
    format!("{}#{theme_id}", entry_date_lower_bound(date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn theme_keys_follow_layout() {
        let theme_id = Uuid::parse_str("3b7b0c57-8a7f-4ef5-9a57-1d7f5d1c2f10").unwrap();
        let owner_id = Uuid::parse_str("0e4b3f6c-7b43-4a0b-9d1f-4a3e2a5f6b7c").unwrap();

        let meta = theme_metadata_key(theme_id);
        assert_eq!(meta.pk, "THEME#3b7b0c57-8a7f-4ef5-9a57-1d7f5d1c2f10");
        assert_eq!(meta.sk, "METADATA");

        let link = ownership_link_key(owner_id, theme_id);
        assert_eq!(link.pk, "OWNER#0e4b3f6c-7b43-4a0b-9d1f-4a3e2a5f6b7c");
        assert_eq!(link.sk, "THEME#3b7b0c57-8a7f-4ef5-9a57-1d7f5d1c2f10");
    }

    #[test]
    fn entry_keys_embed_date_before_identifiers() {
        let owner_id = Uuid::new_v4();
        let entry_id = Uuid::new_v4();
        let theme_id = Uuid::new_v4();
        let day = date("2024-01-10");

        let key = entry_key(owner_id, day, entry_id);
        assert_eq!(key.pk, format!("OWNER#{owner_id}"));
        assert_eq!(key.sk, format!("ENTRY#2024-01-10#{entry_id}"));

        let index = entry_index_key(owner_id, day, theme_id);
        assert_eq!(index.pk, key.pk);
        assert_eq!(index.sk, format!("ENTRY_DATE#2024-01-10#{theme_id}"));
    }

    #[test]
    fn upper_bound_covers_whole_end_date_only() {
        let theme_id = Uuid::new_v4();
        let end = date("2024-01-31");
        let upper = entry_date_upper_bound(end);
        let on_end = entry_index_key(Uuid::new_v4(), end, theme_id).sk;
        let next_day = entry_index_key(Uuid::new_v4(), date("2024-02-01"), theme_id).sk;

        assert!(entry_date_lower_bound(end) <= on_end);
        assert!(on_end <= upper);
        assert!(next_day > upper);
    }

    #[test]
    fn month_prefix_is_zero_padded() {
        assert_eq!(entry_month_prefix(2024, 3), "ENTRY_DATE#2024-03");
        let index = entry_index_key(Uuid::new_v4(), date("2024-03-09"), Uuid::new_v4());
        assert!(index.sk.starts_with(&entry_month_prefix(2024, 3)));
    }

    #[test]
    fn date_theme_prefix_selects_one_day_of_one_theme() {
        let owner_id = Uuid::new_v4();
        let theme_id = Uuid::new_v4();
        let prefix = entry_date_theme_prefix(date("2024-03-09"), theme_id);

        assert!(entry_index_key(owner_id, date("2024-03-09"), theme_id)
            .sk
            .starts_with(&prefix));
        assert!(!entry_index_key(owner_id, date("2024-03-09"), Uuid::new_v4())
            .sk
            .starts_with(&prefix));
        assert!(!entry_index_key(owner_id, date("2024-03-10"), theme_id)
            .sk
            .starts_with(&prefix));
    }

    #[test]
    fn link_and_entry_sort_keys_never_collide() {
        let owner_id = Uuid::new_v4();
        let id = Uuid::new_v4();
        let link = ownership_link_key(owner_id, id);
        let entry = entry_key(owner_id, date("2024-01-01"), id);
        assert_eq!(link.pk, entry.pk);
        assert_ne!(link.sk, entry.sk);
        assert!(!entry.sk.starts_with(ownership_link_prefix()));
    }
}
