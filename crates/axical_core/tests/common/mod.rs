#![allow(dead_code)]

use axical_core::keys::ItemKey;
use axical_core::store::{
    CallContext, Filter, Item, ItemStore, ItemUpdate, MemoryItemStore, Page, PageToken,
    Precondition, Query, StoreError, StoreResult, TransactOp,
};
use axical_core::{Entry, EntryData, FieldType, OwnerId, ThemeField};
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::{Arc, Barrier, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Put,
    Update,
    Delete,
    Transact,
}

/// Wraps a memory store and fails selected writes on keys whose sort key
/// starts with a prefix.
pub struct FaultyStore<'a> {
    inner: &'a MemoryItemStore,
    faults: Mutex<Vec<(FaultOp, String)>>,
    transact_gate: Option<Arc<Barrier>>,
    cancel_after: Mutex<Option<(CallContext, usize)>>,
}

impl<'a> FaultyStore<'a> {
    pub fn new(inner: &'a MemoryItemStore) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            transact_gate: None,
            cancel_after: Mutex::new(None),
        }
    }

    /// Every transaction first waits on `gate`.
    pub fn with_transact_gate(mut self, gate: Arc<Barrier>) -> Self {
        self.transact_gate = Some(gate);
        self
    }

    pub fn fail(&self, op: FaultOp, sort_key_prefix: &str) {
        self.faults
            .lock()
            .unwrap()
            .push((op, sort_key_prefix.to_string()));
    }

    pub fn clear(&self) {
        self.faults.lock().unwrap().clear();
    }

    /// Cancels `ctx` once `calls` store calls, reads included, have succeeded.
    pub fn cancel_after(&self, ctx: &CallContext, calls: usize) {
        assert!(calls > 0);
        *self.cancel_after.lock().unwrap() = Some((ctx.clone(), calls));
    }

    fn record<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if result.is_ok() {
            let mut pending = self.cancel_after.lock().unwrap();
            let fire = match pending.as_mut() {
                Some((_, remaining)) => {
                    *remaining -= 1;
                    *remaining == 0
                }
                None => false,
            };
            if fire {
                if let Some((ctx, _)) = pending.take() {
                    ctx.cancel();
                }
            }
        }
        result
    }

    fn inject(&self, op: FaultOp, key: &ItemKey) -> StoreResult<()> {
        let faults = self.faults.lock().unwrap();
        if faults
            .iter()
            .any(|(fault_op, prefix)| *fault_op == op && key.sk.starts_with(prefix.as_str()))
        {
            return Err(StoreError::Backend(format!("injected {op:?} fault on {key}")));
        }
        Ok(())
    }
}

impl ItemStore for FaultyStore<'_> {
    fn get(&self, ctx: &CallContext, key: &ItemKey) -> StoreResult<Option<Item>> {
        self.record(self.inner.get(ctx, key))
    }

    fn put(&self, ctx: &CallContext, item: &Item, precondition: &Precondition) -> StoreResult<()> {
        self.inject(FaultOp::Put, &item.key)?;
        self.record(self.inner.put(ctx, item, precondition))
    }

    fn update(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        update: &ItemUpdate,
        precondition: &Precondition,
    ) -> StoreResult<()> {
        self.inject(FaultOp::Update, key)?;
        self.record(self.inner.update(ctx, key, update, precondition))
    }

    fn delete(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        precondition: &Precondition,
    ) -> StoreResult<()> {
        self.inject(FaultOp::Delete, key)?;
        self.record(self.inner.delete(ctx, key, precondition))
    }

    fn query(
        &self,
        ctx: &CallContext,
        query: &Query,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        self.record(self.inner.query(ctx, query, start_after))
    }

    fn transact(&self, ctx: &CallContext, ops: &[TransactOp]) -> StoreResult<()> {
        if let Some(gate) = &self.transact_gate {
            gate.wait();
        }
        for op in ops {
            self.inject(FaultOp::Transact, op.key())?;
        }
        self.record(self.inner.transact(ctx, ops))
    }

    fn scan_all(
        &self,
        ctx: &CallContext,
        filter: Option<&Filter>,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        self.record(self.inner.scan_all(ctx, filter, start_after))
    }
}

pub fn owner() -> OwnerId {
    Uuid::new_v4()
}

pub fn date(value: &str) -> NaiveDate {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
}

pub fn data(value: Value) -> EntryData {
    serde_json::from_value(value).unwrap()
}

pub fn amount_fields() -> Vec<ThemeField> {
    vec![ThemeField::new("amount", "Amount", FieldType::Number, true)]
}

pub fn expense_fields() -> Vec<ThemeField> {
    vec![
        ThemeField::new("amount", "Amount", FieldType::Number, true),
        ThemeField::new("category", "Category", FieldType::Select, true),
        ThemeField::new("note", "Note", FieldType::Textarea, false),
    ]
}

pub fn entry(owner_id: OwnerId, theme_id: Uuid, day: &str, amount: i64) -> Entry {
    Entry::new(
        owner_id,
        theme_id,
        date(day),
        data(serde_json::json!({ "amount": amount })),
    )
}
