//! Entry persistence over the item store.
//!
//! # Responsibility
//! - Store entries under `OWNER#<owner>` with a date-ordered primary sort key
//!   and a by-date index key for range reads.
//! - Move an entry atomically when its date changes.
//!
//! # Invariants
//! - Every read and write is scoped to the caller's partition, so another
//!   owner's entry is indistinguishable from a missing one.
//! - A date change never leaves zero or two copies of an entry: the old item
//!   is deleted and the new one written in one transaction.
//! - `theme_id` and `created_at` never change after creation.
//! - Only dates in years 0000..=9999 are written or queried; other years do
//!   not sort chronologically as key text.

use crate::keys::{
    entry_date_lower_bound, entry_date_theme_prefix, entry_date_upper_bound, entry_index_key,
    entry_key, entry_month_prefix, owner_partition, ItemKey, ENTRY_DATE_PREFIX,
};
use crate::model::entry::{is_storable_date, Entry, EntryData, EntryId};
use crate::model::theme::{OwnerId, ThemeId};
use crate::repo::{
    decode_record, encode_record, require_id, EntityKind, RepoError, RepoResult,
};
use crate::store::{
    for_each_page, CallContext, CancellationReason, Condition, Filter, Index, Item, ItemStore,
    ItemUpdate, Page, PageToken, Precondition, StoreError, TransactOp,
};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub trait EntryRepository {
    fn get_by_id(&self, ctx: &CallContext, owner_id: OwnerId, entry_id: EntryId)
        -> RepoResult<Entry>;
    /// Entries of one theme dated `start..=end`, in index order.
    fn list_by_date_range(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        theme_id: ThemeId,
    ) -> RepoResult<Vec<Entry>>;
    /// Assigns the id (when nil) and timestamps on `entry`.
    fn create(&self, ctx: &CallContext, entry: &mut Entry) -> RepoResult<()>;
    fn update(&self, ctx: &CallContext, entry: &mut Entry) -> RepoResult<()>;
    fn delete(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        entry_id: EntryId,
        entry_date: NaiveDate,
    ) -> RepoResult<()>;
    fn list_for_month(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        year: i32,
        month: u32,
    ) -> RepoResult<Vec<Entry>>;
    fn list_for_date(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        date: NaiveDate,
    ) -> RepoResult<Vec<Entry>>;
    /// Number of entries `list_by_date_range` would return, without decoding them.
    fn count_by_date_range(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        theme_id: ThemeId,
    ) -> RepoResult<usize>;
}

impl<R: EntryRepository + ?Sized> EntryRepository for &R {
    fn get_by_id(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        entry_id: EntryId,
    ) -> RepoResult<Entry> {
        (**self).get_by_id(ctx, owner_id, entry_id)
    }

    fn list_by_date_range(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        theme_id: ThemeId,
    ) -> RepoResult<Vec<Entry>> {
        (**self).list_by_date_range(ctx, owner_id, start, end, theme_id)
    }

    fn create(&self, ctx: &CallContext, entry: &mut Entry) -> RepoResult<()> {
        (**self).create(ctx, entry)
    }

    fn update(&self, ctx: &CallContext, entry: &mut Entry) -> RepoResult<()> {
        (**self).update(ctx, entry)
    }

    fn delete(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        entry_id: EntryId,
        entry_date: NaiveDate,
    ) -> RepoResult<()> {
        (**self).delete(ctx, owner_id, entry_id, entry_date)
    }

    fn list_for_month(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        year: i32,
        month: u32,
    ) -> RepoResult<Vec<Entry>> {
        (**self).list_for_month(ctx, owner_id, theme_id, year, month)
    }

    fn list_for_date(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        date: NaiveDate,
    ) -> RepoResult<Vec<Entry>> {
        (**self).list_for_date(ctx, owner_id, theme_id, date)
    }

    fn count_by_date_range(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        theme_id: ThemeId,
    ) -> RepoResult<usize> {
        (**self).count_by_date_range(ctx, owner_id, start, end, theme_id)
    }
}

/// Store writes needed to apply an entry update.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryUpdatePlan {
    /// Date unchanged: merge attributes into the existing item.
    InPlace { key: ItemKey, update: ItemUpdate },
    /// Date changed: delete `from` and write `to` in one transaction.
    Migrate { from: ItemKey, to: Item },
}

/// Plans the writes turning `existing` into `updated` at time `now`.
///
/// `updated` must carry the stored theme id; `created_at` is always taken
/// from `existing`.
pub fn plan_update(
    existing: &Entry,
    updated: &Entry,
    now: DateTime<Utc>,
) -> RepoResult<EntryUpdatePlan> {
    let new_index_key = entry_index_key(existing.owner_id, updated.entry_date, existing.theme_id);

    if existing.entry_date == updated.entry_date {
        let update = ItemUpdate::default()
            .set("Data", encode_value(&updated.data)?)
            .set("EntryDate", encode_value(&updated.entry_date)?)
            .set("UpdatedAt", encode_value(&now)?)
            .with_index_key(new_index_key);
        return Ok(EntryUpdatePlan::InPlace {
            key: entry_key(existing.owner_id, existing.entry_date, existing.entry_id),
            update,
        });
    }

    let moved = Entry {
        entry_id: existing.entry_id,
        theme_id: existing.theme_id,
        owner_id: existing.owner_id,
        entry_date: updated.entry_date,
        data: updated.data.clone(),
        created_at: existing.created_at,
        updated_at: now,
    };
    Ok(EntryUpdatePlan::Migrate {
        from: entry_key(existing.owner_id, existing.entry_date, existing.entry_id),
        to: encode_entry(&moved)?,
    })
}

pub struct StoreEntryRepository<S> {
    store: S,
}

impl<S: ItemStore> StoreEntryRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Drains an index page sequence into decoded entries.
    fn collect_index<F>(&self, fetch: F) -> RepoResult<Vec<Entry>>
    where
        F: FnMut(Option<&PageToken>) -> RepoResult<Page>,
    {
        let mut entries = Vec::new();
        for_each_page(fetch, |item| {
            entries.push(decode_entry(&item)?);
            Ok(true)
        })?;
        Ok(entries)
    }

    fn apply_plan(
        &self,
        ctx: &CallContext,
        entry_id: EntryId,
        plan: &EntryUpdatePlan,
    ) -> RepoResult<()> {
        let not_found = RepoError::NotFound {
            kind: EntityKind::Entry,
            id: entry_id,
        };
        match plan {
            EntryUpdatePlan::InPlace { key, update } => {
                match self.store.update(ctx, key, update, &Precondition::MustExist) {
                    Ok(()) => Ok(()),
                    Err(StoreError::PreconditionFailed) => Err(not_found),
                    Err(err) => Err(err.into()),
                }
            }
            EntryUpdatePlan::Migrate { from, to } => {
                let ops = [
                    TransactOp::Delete {
                        key: from.clone(),
                        precondition: Precondition::MustExist,
                    },
                    TransactOp::Put {
                        item: to.clone(),
                        precondition: Precondition::MustNotExist,
                    },
                ];
                match self.store.transact(ctx, &ops) {
                    Ok(()) => Ok(()),
                    Err(StoreError::TransactionCanceled { reasons }) => {
                        let failed = |index: usize| {
                            reasons.get(index) == Some(&CancellationReason::ConditionalCheckFailed)
                        };
                        if failed(0) {
                            Err(not_found)
                        } else if failed(1) {
                            Err(RepoError::Conflict {
                                kind: EntityKind::Entry,
                                id: entry_id,
                                reason: format!("target key {} already occupied", to.key),
                            })
                        } else {
                            Err(RepoError::Unavailable(StoreError::TransactionCanceled {
                                reasons,
                            }))
                        }
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

impl<S: ItemStore> EntryRepository for StoreEntryRepository<S> {
    fn get_by_id(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        entry_id: EntryId,
    ) -> RepoResult<Entry> {
        require_id(owner_id, "owner id")?;
        require_id(entry_id, "entry id")?;

        let partition = owner_partition(owner_id);
        let filter = Filter::from(Condition::attribute_equals(
            "EntryID",
            entry_id.to_string(),
        ));
        let mut found = None;
        for_each_page(
            |token| {
                self.store
                    .query_index_prefix(
                        ctx,
                        Index::ByDate,
                        &partition,
                        ENTRY_DATE_PREFIX,
                        Some(&filter),
                        token,
                    )
                    .map_err(RepoError::from)
            },
            |item| {
                let entry = decode_entry(&item)?;
                if entry.entry_id != entry_id {
                    return Ok(true);
                }
                found = Some(entry);
                Ok(false)
            },
        )?;

        found.ok_or(RepoError::NotFound {
            kind: EntityKind::Entry,
            id: entry_id,
        })
    }

    fn list_by_date_range(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        theme_id: ThemeId,
    ) -> RepoResult<Vec<Entry>> {
        let range = DateRangeQuery::new(owner_id, start, end, theme_id)?;
        let entries = self.collect_index(|token| range.fetch(&self.store, ctx, token))?;
        debug!(
            "event=entry_list module=repo status=ok owner_id={} theme_id={} start={} end={} count={}",
            owner_id,
            theme_id,
            start,
            end,
            entries.len()
        );
        Ok(entries)
    }

    fn create(&self, ctx: &CallContext, entry: &mut Entry) -> RepoResult<()> {
        require_id(entry.owner_id, "owner id")?;
        require_id(entry.theme_id, "theme id")?;
        require_storable_date(entry.entry_date)?;

        if entry.entry_id.is_nil() {
            entry.entry_id = Uuid::new_v4();
        }
        let now = Utc::now();
        entry.created_at = now;
        entry.updated_at = now;

        let item = encode_entry(entry)?;
        match self.store.put(ctx, &item, &Precondition::MustNotExist) {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed) => {
                return Err(RepoError::AlreadyExists {
                    kind: EntityKind::Entry,
                    id: entry.entry_id,
                })
            }
            Err(err) => return Err(err.into()),
        }
        info!(
            "event=entry_create module=repo status=ok entry_id={} owner_id={} theme_id={} key={}",
            entry.entry_id, entry.owner_id, entry.theme_id, item.key
        );
        Ok(())
    }

    fn update(&self, ctx: &CallContext, entry: &mut Entry) -> RepoResult<()> {
        require_storable_date(entry.entry_date)?;
        let existing = self.get_by_id(ctx, entry.owner_id, entry.entry_id)?;
        if entry.theme_id.is_nil() {
            entry.theme_id = existing.theme_id;
        } else if entry.theme_id != existing.theme_id {
            return Err(RepoError::invalid_argument(format!(
                "theme id of entry {} cannot change",
                entry.entry_id
            )));
        }

        let now = Utc::now();
        let plan = plan_update(&existing, entry, now)?;
        let migrated = matches!(plan, EntryUpdatePlan::Migrate { .. });
        self.apply_plan(ctx, entry.entry_id, &plan)?;

        entry.created_at = existing.created_at;
        entry.updated_at = now;
        info!(
            "event=entry_update module=repo status=ok entry_id={} owner_id={} migrated={} from_date={} to_date={}",
            entry.entry_id, entry.owner_id, migrated, existing.entry_date, entry.entry_date
        );
        Ok(())
    }

    fn delete(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        entry_id: EntryId,
        entry_date: NaiveDate,
    ) -> RepoResult<()> {
        require_id(owner_id, "owner id")?;
        require_id(entry_id, "entry id")?;
        require_storable_date(entry_date)?;

        let key = entry_key(owner_id, entry_date, entry_id);
        match self.store.delete(ctx, &key, &Precondition::MustExist) {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed) => {
                return Err(RepoError::NotFound {
                    kind: EntityKind::Entry,
                    id: entry_id,
                })
            }
            Err(err) => return Err(err.into()),
        }
        info!(
            "event=entry_delete module=repo status=ok entry_id={} owner_id={} key={}",
            entry_id, owner_id, key
        );
        Ok(())
    }

    fn list_for_month(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        year: i32,
        month: u32,
    ) -> RepoResult<Vec<Entry>> {
        require_id(owner_id, "owner id")?;
        require_id(theme_id, "theme id")?;
        if !(1..=12).contains(&month) {
            return Err(RepoError::invalid_argument(format!(
                "month {month} is out of range"
            )));
        }
        if !(0..=9999).contains(&year) {
            return Err(RepoError::invalid_argument(format!(
                "year {year} is out of range"
            )));
        }

        let partition = owner_partition(owner_id);
        let prefix = entry_month_prefix(year, month);
        let filter = theme_filter(theme_id);
        self.collect_index(|token| {
            self.store
                .query_index_prefix(
                    ctx,
                    Index::ByDate,
                    &partition,
                    &prefix,
                    Some(&filter),
                    token,
                )
                .map_err(RepoError::from)
        })
    }

    fn list_for_date(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
        date: NaiveDate,
    ) -> RepoResult<Vec<Entry>> {
        require_id(owner_id, "owner id")?;
        require_id(theme_id, "theme id")?;
        require_storable_date(date)?;

        let partition = owner_partition(owner_id);
        let prefix = entry_date_theme_prefix(date, theme_id);
        self.collect_index(|token| {
            self.store
                .query_index_prefix(ctx, Index::ByDate, &partition, &prefix, None, token)
                .map_err(RepoError::from)
        })
    }

    fn count_by_date_range(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        theme_id: ThemeId,
    ) -> RepoResult<usize> {
        let range = DateRangeQuery::new(owner_id, start, end, theme_id)?;
        let mut count = 0;
        for_each_page(
            |token| range.fetch(&self.store, ctx, token),
            |_| {
                count += 1;
                Ok(true)
            },
        )?;
        Ok(count)
    }
}

/// Validated by-date index range over one owner's entries of one theme.
struct DateRangeQuery {
    partition: String,
    lower: String,
    upper: String,
    filter: Filter,
}

impl DateRangeQuery {
    fn new(
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        theme_id: ThemeId,
    ) -> RepoResult<Self> {
        require_id(owner_id, "owner id")?;
        require_id(theme_id, "theme id")?;
        require_storable_date(start)?;
        require_storable_date(end)?;
        if start > end {
            return Err(RepoError::invalid_argument(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self {
            partition: owner_partition(owner_id),
            lower: entry_date_lower_bound(start),
            upper: entry_date_upper_bound(end),
            filter: theme_filter(theme_id),
        })
    }

    fn fetch<S: ItemStore>(
        &self,
        store: &S,
        ctx: &CallContext,
        token: Option<&PageToken>,
    ) -> RepoResult<Page> {
        store
            .query_index_range(
                ctx,
                Index::ByDate,
                &self.partition,
                &self.lower,
                &self.upper,
                Some(&self.filter),
                token,
            )
            .map_err(RepoError::from)
    }
}

fn require_storable_date(date: NaiveDate) -> RepoResult<NaiveDate> {
    if !is_storable_date(date) {
        return Err(RepoError::invalid_argument(format!(
            "date {date} is outside 0000-01-01..=9999-12-31"
        )));
    }
    Ok(date)
}

fn theme_filter(theme_id: ThemeId) -> Filter {
    Filter::from(Condition::attribute_equals("ThemeID", theme_id.to_string()))
}

fn encode_value<T: Serialize>(value: &T) -> RepoResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| RepoError::InvalidData(format!("attribute serialization failed: {err}")))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EntryRecord {
    #[serde(rename = "EntryID")]
    entry_id: EntryId,
    #[serde(rename = "ThemeID")]
    theme_id: ThemeId,
    #[serde(rename = "OwnerID")]
    owner_id: OwnerId,
    entry_date: NaiveDate,
    #[serde(default)]
    data: EntryData,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn encode_entry(entry: &Entry) -> RepoResult<Item> {
    let record = EntryRecord {
        entry_id: entry.entry_id,
        theme_id: entry.theme_id,
        owner_id: entry.owner_id,
        entry_date: entry.entry_date,
        data: entry.data.clone(),
        created_at: entry.created_at,
        updated_at: entry.updated_at,
    };
    Ok(Item::new(
        entry_key(entry.owner_id, entry.entry_date, entry.entry_id),
        encode_record(&record)?,
    )
    .with_index_key(entry_index_key(
        entry.owner_id,
        entry.entry_date,
        entry.theme_id,
    )))
}

fn decode_entry(item: &Item) -> RepoResult<Entry> {
    let record: EntryRecord = decode_record(item)?;
    Ok(Entry {
        entry_id: record.entry_id,
        theme_id: record.theme_id,
        owner_id: record.owner_id,
        entry_date: record.entry_date,
        data: record.data,
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}
