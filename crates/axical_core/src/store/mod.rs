//! Ordered keyed item store contract and backends.
//!
//! # Responsibility
//! - Define the capability surface repositories rely on: keyed get/put/
//!   update/delete with existence preconditions, index range and prefix
//!   queries, atomic multi-item transactions and full scans.
//! - Keep backend details (SQLite rows, in-memory maps) out of repositories.
//!
//! # Invariants
//! - Every call checks its `CallContext` before touching data.
//! - A failed precondition never mutates anything; a cancelled transaction
//!   applies none of its operations.
//! - Query and scan results are ordered by (sort key, primary key) and paged;
//!   filters are applied after paging, so a page may be empty while still
//!   carrying a continuation token.

use crate::db::DbError;
use crate::keys::{IndexKey, ItemKey};
use serde_json::Value;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod context;
mod memory;
mod sqlite;

pub use context::CallContext;
pub use memory::MemoryItemStore;
pub use sqlite::SqliteItemStore;

/// Default number of items evaluated per query or scan page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Upper bound on operations in one transaction.
pub const MAX_TRANSACT_ITEMS: usize = 100;

/// Non-key attributes of an item.
pub type Attributes = serde_json::Map<String, Value>;

pub type StoreResult<T> = Result<T, StoreError>;

/// One stored item: primary key, optional by-date index key, attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub key: ItemKey,
    pub index_key: Option<IndexKey>,
    pub attributes: Attributes,
}

impl Item {
    pub fn new(key: ItemKey, attributes: Attributes) -> Self {
        Self {
            key,
            index_key: None,
            attributes,
        }
    }

    pub fn with_index_key(mut self, index_key: IndexKey) -> Self {
        self.index_key = Some(index_key);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Attribute merge applied by `ItemStore::update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    /// Attributes overwritten (or added) on the stored item.
    pub set: Attributes,
    /// Replacement index key; `None` leaves the current one untouched.
    pub index_key: Option<IndexKey>,
}

impl ItemUpdate {
    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set.insert(name.into(), value);
        self
    }

    pub fn with_index_key(mut self, index_key: IndexKey) -> Self {
        self.index_key = Some(index_key);
        self
    }

    pub(crate) fn apply_to(&self, item: &mut Item) {
        for (name, value) in &self.set {
            item.attributes.insert(name.clone(), value.clone());
        }
        if let Some(index_key) = &self.index_key {
            item.index_key = Some(index_key.clone());
        }
    }
}

/// Single predicate over an item.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    SortKeyEquals(String),
    AttributeEquals(String, Value),
}

impl Condition {
    pub fn attribute_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::AttributeEquals(name.into(), value.into())
    }

    fn matches(&self, item: &Item) -> bool {
        match self {
            Self::SortKeyEquals(sk) => item.key.sk == *sk,
            Self::AttributeEquals(name, value) => item.attributes.get(name) == Some(value),
        }
    }
}

/// Conjunction of conditions; the empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.conditions.iter().all(|condition| condition.matches(item))
    }
}

impl From<Condition> for Filter {
    fn from(condition: Condition) -> Self {
        Self::new().and(condition)
    }
}

/// Existence predicate attached to a write.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Precondition {
    #[default]
    None,
    MustExist,
    MustNotExist,
    /// The item exists and matches every condition of the filter.
    MustMatch(Filter),
}

impl Precondition {
    pub fn holds(&self, existing: Option<&Item>) -> bool {
        match self {
            Self::None => true,
            Self::MustExist => existing.is_some(),
            Self::MustNotExist => existing.is_none(),
            Self::MustMatch(filter) => existing.is_some_and(|item| filter.matches(item)),
        }
    }
}

/// Which key projection a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    /// Primary (`PK`, `SK`).
    Primary,
    /// By-date secondary index (`GSI1PK`, `GSI1SK`).
    ByDate,
}

impl Index {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::ByDate => "gsi1",
        }
    }
}

/// Sort-key selection inside one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKeyRange {
    /// Inclusive on both ends.
    Between { lower: String, upper: String },
    BeginsWith(String),
}

impl SortKeyRange {
    pub fn contains(&self, sort_key: &str) -> bool {
        match self {
            Self::Between { lower, upper } => lower.as_str() <= sort_key && sort_key <= upper.as_str(),
            Self::BeginsWith(prefix) => sort_key.starts_with(prefix.as_str()),
        }
    }
}

/// Partition-scoped query over one index.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub index: Index,
    pub partition: String,
    pub range: SortKeyRange,
    pub filter: Option<Filter>,
}

/// Position after which the next page starts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageToken {
    pub(crate) sort_key: String,
    pub(crate) key: ItemKey,
}

impl PageToken {
    pub(crate) fn after(sort_key: &str, key: &ItemKey) -> Self {
        Self {
            sort_key: sort_key.to_string(),
            key: key.clone(),
        }
    }
}

/// One page of a query or scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    /// `Some` when more items may follow.
    pub next: Option<PageToken>,
}

/// Write operation submitted inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactOp {
    Put {
        item: Item,
        precondition: Precondition,
    },
    Delete {
        key: ItemKey,
        precondition: Precondition,
    },
}

impl TransactOp {
    pub fn key(&self) -> &ItemKey {
        match self {
            Self::Put { item, .. } => &item.key,
            Self::Delete { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Self::Put { precondition, .. } | Self::Delete { precondition, .. } => precondition,
        }
    }
}

/// Per-operation outcome reported when a transaction is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    None,
    ConditionalCheckFailed,
}

#[derive(Debug)]
pub enum StoreError {
    /// The write's precondition did not hold; nothing changed.
    PreconditionFailed,
    /// One reason per submitted operation, in submission order.
    TransactionCanceled { reasons: Vec<CancellationReason> },
    /// The transaction was malformed and never evaluated.
    InvalidTransaction(String),
    Cancelled,
    DeadlineExceeded,
    CorruptItem { key: ItemKey, reason: String },
    Serialization(serde_json::Error),
    Db(DbError),
    Backend(String),
}

impl StoreError {
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, Self::PreconditionFailed)
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreconditionFailed => write!(f, "conditional check failed"),
            Self::TransactionCanceled { reasons } => {
                let failed = reasons
                    .iter()
                    .enumerate()
                    .filter(|(_, reason)| **reason == CancellationReason::ConditionalCheckFailed)
                    .map(|(index, _)| index.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "transaction cancelled; failed operations [{failed}]")
            }
            Self::InvalidTransaction(message) => write!(f, "invalid transaction: {message}"),
            Self::Cancelled => write!(f, "call cancelled"),
            Self::DeadlineExceeded => write!(f, "call deadline exceeded"),
            Self::CorruptItem { key, reason } => write!(f, "corrupt item {key}: {reason}"),
            Self::Serialization(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Backend(message) => write!(f, "store backend failure: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Serialization(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Capability surface of the single-table store.
///
/// Implementations must be linearizable per call: a conditional write
/// observes and mutates the item atomically with respect to other calls.
pub trait ItemStore {
    fn get(&self, ctx: &CallContext, key: &ItemKey) -> StoreResult<Option<Item>>;

    fn put(&self, ctx: &CallContext, item: &Item, precondition: &Precondition) -> StoreResult<()>;

    /// Merges `update` into the item at `key`. Without a precondition a
    /// missing item is created from the update alone.
    fn update(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        update: &ItemUpdate,
        precondition: &Precondition,
    ) -> StoreResult<()>;

    fn delete(&self, ctx: &CallContext, key: &ItemKey, precondition: &Precondition)
        -> StoreResult<()>;

    /// Reads one page of `query`, starting after `start_after`.
    fn query(
        &self,
        ctx: &CallContext,
        query: &Query,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page>;

    /// Applies all operations or none of them.
    fn transact(&self, ctx: &CallContext, ops: &[TransactOp]) -> StoreResult<()>;

    /// Reads one page of every item in primary-key order.
    fn scan_all(
        &self,
        ctx: &CallContext,
        filter: Option<&Filter>,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page>;

    /// Inclusive sort-key range query inside one index partition.
    fn query_index_range(
        &self,
        ctx: &CallContext,
        index: Index,
        partition: &str,
        lower: &str,
        upper: &str,
        filter: Option<&Filter>,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        let query = Query {
            index,
            partition: partition.to_string(),
            range: SortKeyRange::Between {
                lower: lower.to_string(),
                upper: upper.to_string(),
            },
            filter: filter.cloned(),
        };
        self.query(ctx, &query, start_after)
    }

    /// Sort-key prefix query inside one index partition.
    fn query_index_prefix(
        &self,
        ctx: &CallContext,
        index: Index,
        partition: &str,
        prefix: &str,
        filter: Option<&Filter>,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        let query = Query {
            index,
            partition: partition.to_string(),
            range: SortKeyRange::BeginsWith(prefix.to_string()),
            filter: filter.cloned(),
        };
        self.query(ctx, &query, start_after)
    }
}

impl<S: ItemStore + ?Sized> ItemStore for &S {
    fn get(&self, ctx: &CallContext, key: &ItemKey) -> StoreResult<Option<Item>> {
        (**self).get(ctx, key)
    }

    fn put(&self, ctx: &CallContext, item: &Item, precondition: &Precondition) -> StoreResult<()> {
        (**self).put(ctx, item, precondition)
    }

    fn update(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        update: &ItemUpdate,
        precondition: &Precondition,
    ) -> StoreResult<()> {
        (**self).update(ctx, key, update, precondition)
    }

    fn delete(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        precondition: &Precondition,
    ) -> StoreResult<()> {
        (**self).delete(ctx, key, precondition)
    }

    fn query(
        &self,
        ctx: &CallContext,
        query: &Query,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        (**self).query(ctx, query, start_after)
    }

    fn transact(&self, ctx: &CallContext, ops: &[TransactOp]) -> StoreResult<()> {
        (**self).transact(ctx, ops)
    }

    fn scan_all(
        &self,
        ctx: &CallContext,
        filter: Option<&Filter>,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        (**self).scan_all(ctx, filter, start_after)
    }
}

/// Drives a page sequence until `visit` returns `false` or pages run out.
///
/// `fetch` receives the continuation token of the previous page.
pub fn for_each_page<F, V, E>(mut fetch: F, mut visit: V) -> Result<(), E>
where
    F: FnMut(Option<&PageToken>) -> Result<Page, E>,
    V: FnMut(Item) -> Result<bool, E>,
{
    let mut token: Option<PageToken> = None;
    loop {
        let page = fetch(token.as_ref())?;
        for item in page.items {
            if !visit(item)? {
                return Ok(());
            }
        }
        match page.next {
            Some(next) => token = Some(next),
            None => return Ok(()),
        }
    }
}

/// Rejects empty, oversized or key-duplicating transactions.
pub(crate) fn validate_transaction(ops: &[TransactOp]) -> StoreResult<()> {
    if ops.is_empty() {
        return Err(StoreError::InvalidTransaction(
            "transaction has no operations".to_string(),
        ));
    }
    if ops.len() > MAX_TRANSACT_ITEMS {
        return Err(StoreError::InvalidTransaction(format!(
            "transaction has {} operations; limit is {MAX_TRANSACT_ITEMS}",
            ops.len()
        )));
    }
    let mut seen = HashSet::new();
    for op in ops {
        if !seen.insert(op.key()) {
            return Err(StoreError::InvalidTransaction(format!(
                "key {} appears more than once",
                op.key()
            )));
        }
    }
    Ok(())
}

/// Evaluates every precondition against the supplied lookup.
///
/// Returns `None` when all hold, or the per-operation reasons otherwise.
pub(crate) fn evaluate_transaction<L>(
    ops: &[TransactOp],
    mut lookup: L,
) -> StoreResult<Option<Vec<CancellationReason>>>
where
    L: FnMut(&ItemKey) -> StoreResult<Option<Item>>,
{
    let mut reasons = Vec::with_capacity(ops.len());
    let mut any_failed = false;
    for op in ops {
        let existing = lookup(op.key())?;
        if op.precondition().holds(existing.as_ref()) {
            reasons.push(CancellationReason::None);
        } else {
            any_failed = true;
            reasons.push(CancellationReason::ConditionalCheckFailed);
        }
    }
    Ok(any_failed.then_some(reasons))
}
