//! SQLite implementation of [`ItemStore`].
//!
//! # Responsibility
//! - Persist items in the single `items` table created by `db::migrations`.
//! - Map conditional writes and transactions onto SQLite transactions.
//!
//! # Invariants
//! - Every conditional write reads and writes inside one SQLite transaction.
//! - `attributes` always holds a JSON object; anything else is reported as a
//!   corrupt item instead of being masked.
//! - Index queries order by `(gsi1sk, pk, sk)`, primary queries and scans by
//!   `(pk, sk)`.

use super::{
    evaluate_transaction, validate_transaction, Attributes, CallContext, Filter, Index, Item,
    ItemStore, ItemUpdate, Page, PageToken, Precondition, Query, SortKeyRange, StoreError,
    StoreResult, TransactOp, DEFAULT_PAGE_SIZE,
};
use crate::keys::{IndexKey, ItemKey};
use log::debug;
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde_json::Value;

const ITEM_COLUMNS: &str = "pk, sk, gsi1pk, gsi1sk, attributes";

/// SQLite-backed item store over a migrated connection.
pub struct SqliteItemStore<'conn> {
    conn: &'conn Connection,
    page_size: usize,
}

impl<'conn> SqliteItemStore<'conn> {
    /// Wraps a connection returned by `db::open_db*`.
    pub fn new(conn: &'conn Connection) -> Self {
        Self::with_page_size(conn, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(conn: &'conn Connection, page_size: usize) -> Self {
        Self {
            conn,
            page_size: page_size.max(1),
        }
    }

    fn load(&self, key: &ItemKey) -> StoreResult<Option<Item>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE pk = ?1 AND sk = ?2;"))?;
        let row = stmt
            .query_row(params![key.pk, key.sk], read_raw_row)
            .optional()?;
        row.map(RawRow::into_item).transpose()
    }

    fn store(&self, item: &Item) -> StoreResult<()> {
        let attributes = serde_json::to_string(&item.attributes)?;
        let (gsi1pk, gsi1sk) = match &item.index_key {
            Some(index_key) => (Some(index_key.pk.as_str()), Some(index_key.sk.as_str())),
            None => (None, None),
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO items (pk, sk, gsi1pk, gsi1sk, attributes)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![item.key.pk, item.key.sk, gsi1pk, gsi1sk, attributes],
        )?;
        Ok(())
    }

    fn remove(&self, key: &ItemKey) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM items WHERE pk = ?1 AND sk = ?2;",
            params![key.pk, key.sk],
        )?;
        Ok(())
    }

    /// Runs `body` inside an immediate transaction, committing only on `Ok`.
    fn in_transaction<T>(&self, body: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let value = body()?;
        tx.commit()?;
        Ok(value)
    }

    fn fetch_page(
        &self,
        sql: &str,
        mut binds: Vec<SqlValue>,
        sort_key_of: fn(&Item) -> String,
        filter: Option<&Filter>,
    ) -> StoreResult<Page> {
        binds.push(SqlValue::Integer(i64::try_from(self.page_size + 1).unwrap_or(i64::MAX)));
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(binds))?;
        let mut evaluated = Vec::new();
        while let Some(row) = rows.next()? {
            evaluated.push(read_raw_row(row)?.into_item()?);
        }

        let next = if evaluated.len() > self.page_size {
            evaluated.truncate(self.page_size);
            evaluated
                .last()
                .map(|item| PageToken::after(&sort_key_of(item), &item.key))
        } else {
            None
        };

        let items = evaluated
            .into_iter()
            .filter(|item| filter.map_or(true, |filter| filter.matches(item)))
            .collect();
        Ok(Page { items, next })
    }
}

fn check(precondition: &Precondition, existing: Option<&Item>) -> StoreResult<()> {
    if precondition.holds(existing) {
        Ok(())
    } else {
        Err(StoreError::PreconditionFailed)
    }
}

impl ItemStore for SqliteItemStore<'_> {
    fn get(&self, ctx: &CallContext, key: &ItemKey) -> StoreResult<Option<Item>> {
        ctx.check()?;
        self.load(key)
    }

    fn put(&self, ctx: &CallContext, item: &Item, precondition: &Precondition) -> StoreResult<()> {
        ctx.check()?;
        self.in_transaction(|| {
            if *precondition != Precondition::None {
                check(precondition, self.load(&item.key)?.as_ref())?;
            }
            self.store(item)
        })
    }

    fn update(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        update: &ItemUpdate,
        precondition: &Precondition,
    ) -> StoreResult<()> {
        ctx.check()?;
        self.in_transaction(|| {
            let existing = self.load(key)?;
            check(precondition, existing.as_ref())?;
            let mut item = existing.unwrap_or_else(|| Item::new(key.clone(), Attributes::new()));
            update.apply_to(&mut item);
            self.store(&item)
        })
    }

    fn delete(
        &self,
        ctx: &CallContext,
        key: &ItemKey,
        precondition: &Precondition,
    ) -> StoreResult<()> {
        ctx.check()?;
        self.in_transaction(|| {
            if *precondition != Precondition::None {
                check(precondition, self.load(key)?.as_ref())?;
            }
            self.remove(key)
        })
    }

    fn query(
        &self,
        ctx: &CallContext,
        query: &Query,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        ctx.check()?;
        let (partition_col, sort_col, order_by, sort_key_of): (_, _, _, fn(&Item) -> String) =
            match query.index {
                Index::Primary => ("pk", "sk", "sk, pk", primary_sort_key),
                Index::ByDate => ("gsi1pk", "gsi1sk", "gsi1sk, pk, sk", index_sort_key),
            };

        let mut sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE {partition_col} = ?");
        let mut binds = vec![SqlValue::Text(query.partition.clone())];

        match &query.range {
            SortKeyRange::Between { lower, upper } => {
                sql.push_str(&format!(" AND {sort_col} >= ? AND {sort_col} <= ?"));
                binds.push(SqlValue::Text(lower.clone()));
                binds.push(SqlValue::Text(upper.clone()));
            }
            SortKeyRange::BeginsWith(prefix) => {
                sql.push_str(&format!(" AND substr({sort_col}, 1, length(?)) = ?"));
                binds.push(SqlValue::Text(prefix.clone()));
                binds.push(SqlValue::Text(prefix.clone()));
            }
        }

        if let Some(token) = start_after {
            sql.push_str(&format!(" AND ({sort_col}, pk, sk) > (?, ?, ?)"));
            binds.push(SqlValue::Text(token.sort_key.clone()));
            binds.push(SqlValue::Text(token.key.pk.clone()));
            binds.push(SqlValue::Text(token.key.sk.clone()));
        }

        sql.push_str(&format!(" ORDER BY {order_by} LIMIT ?;"));
        debug!(
            "event=store_query module=store status=start index={} partition={}",
            query.index.as_str(),
            query.partition
        );
        self.fetch_page(&sql, binds, sort_key_of, query.filter.as_ref())
    }

    fn transact(&self, ctx: &CallContext, ops: &[TransactOp]) -> StoreResult<()> {
        ctx.check()?;
        validate_transaction(ops)?;
        self.in_transaction(|| {
            if let Some(reasons) = evaluate_transaction(ops, |key| self.load(key))? {
                return Err(StoreError::TransactionCanceled { reasons });
            }
            for op in ops {
                match op {
                    TransactOp::Put { item, .. } => self.store(item)?,
                    TransactOp::Delete { key, .. } => self.remove(key)?,
                }
            }
            Ok(())
        })
    }

    fn scan_all(
        &self,
        ctx: &CallContext,
        filter: Option<&Filter>,
        start_after: Option<&PageToken>,
    ) -> StoreResult<Page> {
        ctx.check()?;
        let mut sql = format!("SELECT {ITEM_COLUMNS} FROM items");
        let mut binds = Vec::new();
        if let Some(token) = start_after {
            sql.push_str(" WHERE (pk, sk) > (?, ?)");
            binds.push(SqlValue::Text(token.key.pk.clone()));
            binds.push(SqlValue::Text(token.key.sk.clone()));
        }
        sql.push_str(" ORDER BY pk, sk LIMIT ?;");
        self.fetch_page(&sql, binds, partition_key, filter)
    }
}

fn primary_sort_key(item: &Item) -> String {
    item.key.sk.clone()
}

fn index_sort_key(item: &Item) -> String {
    item.index_key
        .as_ref()
        .map(|index_key| index_key.sk.clone())
        .unwrap_or_default()
}

fn partition_key(item: &Item) -> String {
    item.key.pk.clone()
}

struct RawRow {
    key: ItemKey,
    gsi1pk: Option<String>,
    gsi1sk: Option<String>,
    attributes: String,
}

impl RawRow {
    fn into_item(self) -> StoreResult<Item> {
        let attributes = match serde_json::from_str::<Value>(&self.attributes) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(StoreError::CorruptItem {
                    key: self.key,
                    reason: format!("attributes must be a JSON object, got `{other}`"),
                })
            }
            Err(err) => {
                return Err(StoreError::CorruptItem {
                    key: self.key,
                    reason: format!("attributes are not valid JSON: {err}"),
                })
            }
        };

        let index_key = match (self.gsi1pk, self.gsi1sk) {
            (Some(pk), Some(sk)) => Some(IndexKey::new(pk, sk)),
            (None, None) => None,
            _ => {
                return Err(StoreError::CorruptItem {
                    key: self.key,
                    reason: "index key columns must be set together".to_string(),
                })
            }
        };

        Ok(Item {
            key: self.key,
            index_key,
            attributes,
        })
    }
}

fn read_raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        key: ItemKey::new(row.get::<_, String>("pk")?, row.get::<_, String>("sk")?),
        gsi1pk: row.get("gsi1pk")?,
        gsi1sk: row.get("gsi1sk")?,
        attributes: row.get("attributes")?,
    })
}
