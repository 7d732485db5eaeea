//! In-memory implementation of [`ItemStore`].
//!
//! [`MemoryItemStore`] keeps every item in one `BTreeMap` behind a mutex.
//! Each call holds the lock for its whole duration, which makes conditional
//! writes and transactions linearizable across threads. Semantics match the
//! SQLite backend, so tests and ephemeral sessions can use either.

use super::{
    evaluate_transaction, validate_transaction, CallContext, Filter, Index, Item, ItemStore,
    ItemUpdate, Page, PageToken, Precondition, Query, StoreError, StoreResult, TransactOp,
    DEFAULT_PAGE_SIZE,
};
use crate::keys::ItemKey;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

type Items = BTreeMap<ItemKey, Item>;

#[derive(Debug)]
pub struct MemoryItemStore {
    items: Mutex<Items>,
    page_size: usize,
}

impl Default for MemoryItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates a store returning at most `page_size` evaluated items per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Number of stored items.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Copies every stored item in primary-key order.
    pub fn snapshot(&self) -> StoreResult<Vec<Item>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Items>> {
        self.items
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }

    fn paginate<'a, I>(
        &self,
        ordered: I,
        filter: Option<&Filter>,
        start_after: Option<&PageToken>,
    ) -> Page
    where
        I: Iterator<Item = (String, &'a Item)>,
    {
        let mut evaluated = ordered
            .filter(|(sort_key, item)| match start_after {
                Some(token) => {
                    (sort_key.as_str(), &item.key) > (token.sort_key.as_str(), &token.key)
                }
                None => true,
            })
            .take(self.page_size + 1)
            .collect::<Vec<_>>();

        let next = if evaluated.len() > self.page_size {
            evaluated.truncate(self.page_size);
            evaluated
                .last()
                .map(|(sort_key, item)| PageToken::after(sort_key, &item.key))
        } else {
            None
        };

        let items = evaluated
            .into_iter()
            .filter(|(_, item)| filter.map_or(true, |filter| filter.matches(item)))
            .map(|(_, item)| item.clone())
            .collect();

        Page { items, next }
    }
}

fn check(precondition: &Precondition, existing: Option<&Item>) -> StoreResult<()> {
    if precondition.holds(existing) {
        Ok(())
    } else {
        Err(StoreError::PreconditionFailed)
    }
}

impl ItemStore for MemoryItemStore {
    fn get(&self, ctx: &CallContext, key: &ItemKey) -> StoreResult<Option<Item>> {
        ctx.check()?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, ctx: &CallContext, item: &Item, precondition: &Precondition) -> StoreResult<()> {
        ctx.check()?;
        let mut items = self.lock()?;
        check(precondition, items.get(&item.key))?;
        items.insert(item.key.clone(), item.clone());
        Ok(())
    }

    fn update(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        update: &ItemUpdate,
        precondition: &Precondition,
    ) -> StoreResult<()> {
        ctx.check()?;
        let mut items = self.lock()?;
        check(precondition, items.get(key))?;
        let item = items
            .entry(key.clone())
            .or_insert_with(|| Item::new(key.clone(), Default::default()));
        update.apply_to(item);
        Ok(())
    }

    fn delete(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        precondition: &Precondition,
    ) -> StoreResult<()> {
        ctx.check()?;
        let mut items = self.lock()?;
        check(precondition, items.get(key))?;
        items.remove(key);
        Ok(())
    }

    fn query(
        &self,
        ctx: &CallContext,
        query: &Query,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        ctx.check()?;
        let items = self.lock()?;

        let mut matching = items
            .values()
            .filter_map(|item| {
                let (partition, sort_key) = match query.index {
                    Index::Primary => (item.key.pk.as_str(), item.key.sk.as_str()),
                    Index::ByDate => {
                        let index_key = item.index_key.as_ref()?;
                        (index_key.pk.as_str(), index_key.sk.as_str())
                    }
                };
                (partition == query.partition && query.range.contains(sort_key))
                    .then(|| (sort_key.to_string(), item))
            })
            .collect::<Vec<_>>();
        matching.sort_by(|(a_sort, a), (b_sort, b)| (a_sort, &a.key).cmp(&(b_sort, &b.key)));

        Ok(self.paginate(matching.into_iter(), query.filter.as_ref(), start_after))
    }

    fn transact(&self, ctx: &CallContext, ops: &[TransactOp]) -> StoreResult<()> {
        ctx.check()?;
        validate_transaction(ops)?;
        let mut items = self.lock()?;

        if let Some(reasons) = evaluate_transaction(ops, |key| Ok(items.get(key).cloned()))? {
            return Err(StoreError::TransactionCanceled { reasons });
        }

        for op in ops {
            match op {
                TransactOp::Put { item, .. } => {
                    items.insert(item.key.clone(), item.clone());
                }
                TransactOp::Delete { key, .. } => {
                    items.remove(key);
                }
            }
        }
        Ok(())
    }

    fn scan_all(
        &self,
        ctx: &CallContext,
        filter: Option<&Filter>,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        ctx.check()?;
        let items = self.lock()?;
        let ordered = items.values().map(|item| (item.key.pk.clone(), item));
        Ok(self.paginate(ordered, filter, start_after))
    }
}
