//! Entry use-case service.
//!
//! # Responsibility
//! - Validate entry data against the referenced theme before writing.
//! - Provide id-only deletion and aggregation over entries: monthly counts,
//!   range counts and the `SumAll` amount total.
//!
//! # Invariants
//! - An entry is only written after its theme was read with the caller's
//!   identity, so callers cannot write entries against invisible themes.

use crate::model::entry::{sum_amounts, Entry, EntryId, AMOUNT_FIELD};
use crate::model::theme::{FieldType, OwnerId, ThemeId, SUM_ALL_FEATURE};
use crate::repo::entry_repo::EntryRepository;
use crate::repo::theme_repo::ThemeRepository;
use crate::repo::{RepoError, RepoResult};
use crate::store::CallContext;
use chrono::NaiveDate;
use log::{debug, warn};
use std::collections::BTreeMap;

pub struct EntryService<E: EntryRepository, T: ThemeRepository> {
    entries: E,
    themes: T,
}

impl<E: EntryRepository, T: ThemeRepository> EntryService<E, T> {
    pub fn new(entries: E, themes: T) -> Self {
        Self { entries, themes }
    }

    pub fn create(&self, ctx: &CallContext, entry: &mut Entry) -> RepoResult<()> {
        self.validate(ctx, entry.owner_id, entry.theme_id, entry)?;
        self.entries.create(ctx, entry)
    }

    /// Validates against the stored entry's theme when `entry.theme_id` is nil.
    pub fn update(&self, ctx: &CallContext, entry: &mut Entry) -> RepoResult<()> {
        let theme_id = if entry.theme_id.is_nil() {
            self.entries
                .get_by_id(ctx, entry.owner_id, entry.entry_id)?
                .theme_id
        } else {
            entry.theme_id
        };
        self.validate(ctx, entry.owner_id, theme_id, entry)?;
        self.entries.update(ctx, entry)
    }

    pub fn get(&self, ctx: &CallContext, owner_id: OwnerId, entry_id: EntryId) -> RepoResult<Entry> {
        self.entries.get_by_id(ctx, owner_id, entry_id)
    }

    pub fn list_by_date_range(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> RepoResult<Vec<Entry>> {
        self.entries
            .list_by_date_range(ctx, owner_id, start, end, theme_id)
    }

    pub fn list_for_month(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        year: i32,
        month: u32,
    ) -> RepoResult<Vec<Entry>> {
        self.entries
            .list_for_month(ctx, owner_id, theme_id, year, month)
    }

    pub fn list_for_date(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        date: NaiveDate,
    ) -> RepoResult<Vec<Entry>> {
        self.entries.list_for_date(ctx, owner_id, theme_id, date)
    }

    /// Deletes an entry knowing only its id; the stored date is looked up.
    pub fn delete_by_id(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        entry_id: EntryId,
    ) -> RepoResult<()> {
        let entry = self.entries.get_by_id(ctx, owner_id, entry_id)?;
        self.entries
            .delete(ctx, owner_id, entry_id, entry.entry_date)
    }

    /// Counts entries per `YYYY-MM` month between `start` and `end`.
    pub fn monthly_counts(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> RepoResult<BTreeMap<String, usize>> {
        let entries = self
            .entries
            .list_by_date_range(ctx, owner_id, start, end, theme_id)?;

        let mut counts = BTreeMap::new();
        for entry in &entries {
            *counts
                .entry(entry.entry_date.format("%Y-%m").to_string())
                .or_insert(0) += 1;
        }
        debug!(
            "event=entry_monthly_counts module=service status=ok owner_id={} theme_id={} months={} entries={}",
            owner_id,
            theme_id,
            counts.len(),
            entries.len()
        );
        Ok(counts)
    }

    /// Counts entries of a theme visible to the caller dated `start..=end`.
    pub fn count_in_range(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> RepoResult<usize> {
        self.themes.get(ctx, owner_id, theme_id)?;
        self.entries
            .count_by_date_range(ctx, owner_id, start, end, theme_id)
    }

    /// Sums the `amount` field of entries dated `start..=end`.
    ///
    /// The theme must enable `SumAll` and define `amount` as a number.
    pub fn sum_all(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> RepoResult<f64> {
        let theme = self.themes.get(ctx, owner_id, theme_id)?;
        if !theme.supports(SUM_ALL_FEATURE) {
            return Err(RepoError::FeatureNotSupported {
                theme_id,
                feature: SUM_ALL_FEATURE.to_string(),
            });
        }
        match theme.field(AMOUNT_FIELD).map(|field| field.field_type) {
            Some(FieldType::Number) => {}
            Some(other) => {
                return Err(RepoError::invalid_argument(format!(
                    "theme {theme_id} field `{AMOUNT_FIELD}` is {}, not number",
                    other.as_str()
                )))
            }
            None => {
                return Err(RepoError::invalid_argument(format!(
                    "theme {theme_id} has no `{AMOUNT_FIELD}` field"
                )))
            }
        }

        let entries = self
            .entries
            .list_by_date_range(ctx, owner_id, start, end, theme_id)?;
        let total = sum_amounts(&entries).map_err(|err| {
            warn!(
                "event=entry_sum_all module=service status=error owner_id={} theme_id={} error={}",
                owner_id, theme_id, err
            );
            RepoError::from(err)
        })?;
        debug!(
            "event=entry_sum_all module=service status=ok owner_id={} theme_id={} entries={} total={}",
            owner_id,
            theme_id,
            entries.len(),
            total
        );
        Ok(total)
    }

    fn validate(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        entry: &Entry,
    ) -> RepoResult<()> {
        let theme = self.themes.get(ctx, owner_id, theme_id)?;
        entry.validate_against(&theme.fields)?;
        Ok(())
    }
}
