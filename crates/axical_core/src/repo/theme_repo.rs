//! Theme persistence over the item store.
//!
//! # Responsibility
//! - Store theme metadata under `THEME#<id>` and the owner's link under
//!   `OWNER#<owner>`.
//! - Enforce visibility: default themes are readable by everyone, owned
//!   themes only by their owner.
//!
//! # Invariants
//! - Create never leaves a link without metadata. With the compensating
//!   strategy a link failure rolls the metadata back; if the rollback fails
//!   the call reports `Inconsistent`.
//! - Update and delete never touch default themes or themes owned by
//!   someone else; ownership is checked by the conditional write itself.
//! - Link maintenance after a committed update or delete is best-effort and
//!   never fails the call.

use crate::keys::{
    owner_partition, ownership_link_key, ownership_link_prefix, theme_metadata_key,
    METADATA_SORT_KEY,
};
use crate::model::theme::{FieldType, OwnerId, Theme, ThemeField, ThemeId, ThemeOwnershipLink};
use crate::repo::{
    decode_record, encode_record, require_id, EntityKind, RepoError, RepoResult,
};
use crate::store::{
    for_each_page, CallContext, CancellationReason, Condition, Filter, Index, Item, ItemStore,
    ItemUpdate, Precondition, StoreError, TransactOp,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How `create` writes the metadata item and the ownership link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum LinkWriteStrategy {
    /// Both items in one transaction.
    #[default]
    Atomic,
    /// Metadata first, then the link, deleting the metadata if the link fails.
    Compensating,
}

impl LinkWriteStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Compensating => "compensating",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "atomic" => Some(Self::Atomic),
            "compensating" => Some(Self::Compensating),
            _ => None,
        }
    }
}

impl TryFrom<String> for LinkWriteStrategy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("`{value}` is not one of atomic|compensating"))
    }
}

pub trait ThemeRepository {
    fn get(&self, ctx: &CallContext, owner_id: OwnerId, theme_id: ThemeId) -> RepoResult<Theme>;
    fn list(&self, ctx: &CallContext, owner_id: OwnerId) -> RepoResult<Vec<Theme>>;
    /// Assigns the id (when nil) and timestamps on `theme`.
    fn create(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()>;
    fn update(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()>;
    fn delete(&self, ctx: &CallContext, owner_id: OwnerId, theme_id: ThemeId) -> RepoResult<()>;
    fn list_links(&self, ctx: &CallContext, owner_id: OwnerId)
        -> RepoResult<Vec<ThemeOwnershipLink>>;
    /// Writes a system theme visible to every owner. No link is written.
    fn install_default(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()>;
}

impl<R: ThemeRepository + ?Sized> ThemeRepository for &R {
    fn get(&self, ctx: &CallContext, owner_id: OwnerId, theme_id: ThemeId) -> RepoResult<Theme> {
        (**self).get(ctx, owner_id, theme_id)
    }

    fn list(&self, ctx: &CallContext, owner_id: OwnerId) -> RepoResult<Vec<Theme>> {
        (**self).list(ctx, owner_id)
    }

    fn create(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        (**self).create(ctx, theme)
    }

    fn update(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        (**self).update(ctx, theme)
    }

    fn delete(&self, ctx: &CallContext, owner_id: OwnerId, theme_id: ThemeId) -> RepoResult<()> {
        (**self).delete(ctx, owner_id, theme_id)
    }

    fn list_links(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
    ) -> RepoResult<Vec<ThemeOwnershipLink>> {
        (**self).list_links(ctx, owner_id)
    }

    fn install_default(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        (**self).install_default(ctx, theme)
    }
}

pub struct StoreThemeRepository<S> {
    store: S,
    strategy: LinkWriteStrategy,
}

impl<S: ItemStore> StoreThemeRepository<S> {
    pub fn new(store: S) -> Self {
        Self::with_strategy(store, LinkWriteStrategy::default())
    }

    pub fn with_strategy(store: S, strategy: LinkWriteStrategy) -> Self {
        Self { store, strategy }
    }

    pub fn strategy(&self) -> LinkWriteStrategy {
        self.strategy
    }

    fn create_atomic(
        &self,
        ctx: &CallContext,
        theme_id: ThemeId,
        meta: Item,
        link: Item,
    ) -> RepoResult<()> {
        let ops = [
            TransactOp::Put {
                item: meta,
                precondition: Precondition::MustNotExist,
            },
            // A link left behind by a failed link delete is overwritten.
            TransactOp::Put {
                item: link,
                precondition: Precondition::None,
            },
        ];
        match self.store.transact(ctx, &ops) {
            Ok(()) => Ok(()),
            Err(StoreError::TransactionCanceled { reasons })
                if reasons.first() == Some(&CancellationReason::ConditionalCheckFailed) =>
            {
                Err(RepoError::AlreadyExists {
                    kind: EntityKind::Theme,
                    id: theme_id,
                })
            }
            Err(StoreError::TransactionCanceled { reasons }) => Err(RepoError::Unavailable(
                StoreError::TransactionCanceled { reasons },
            )),
            Err(err) => Err(err.into()),
        }
    }

    fn create_compensating(
        &self,
        ctx: &CallContext,
        theme_id: ThemeId,
        meta: Item,
        link: Item,
    ) -> RepoResult<()> {
        match self.store.put(ctx, &meta, &Precondition::MustNotExist) {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed) => {
                return Err(RepoError::AlreadyExists {
                    kind: EntityKind::Theme,
                    id: theme_id,
                })
            }
            Err(err) => return Err(err.into()),
        }

        let link_err = match self.store.put(ctx, &link, &Precondition::None) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        warn!(
            "event=theme_create_rollback module=repo status=start theme_id={} link_key={} error={}",
            theme_id, link.key, link_err
        );

        match self.store.delete(ctx, &meta.key, &Precondition::None) {
            Ok(()) => {
                warn!(
                    "event=theme_create_rollback module=repo status=ok theme_id={}",
                    theme_id
                );
                Err(link_err.into())
            }
            Err(rollback_err) => {
                error!(
                    "event=theme_create_rollback module=repo status=error theme_id={} meta_key={} link_error={} rollback_error={}",
                    theme_id, meta.key, link_err, rollback_err
                );
                Err(RepoError::Inconsistent(format!(
                    "theme {theme_id} metadata left without ownership link: link write failed ({link_err}), rollback failed ({rollback_err})"
                )))
            }
        }
    }

    /// Resolves why a conditional update or delete of an owned theme failed.
    fn explain_condition_failure(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        theme_id: ThemeId,
    ) -> RepoError {
        match self.get(ctx, owner_id, theme_id) {
            Ok(theme) if theme.is_default => RepoError::DefaultThemeImmutable(theme_id),
            Ok(_) => RepoError::Conflict {
                kind: EntityKind::Theme,
                id: theme_id,
                reason: "theme changed concurrently".to_string(),
            },
            Err(err) => err,
        }
    }
}

impl<S: ItemStore> ThemeRepository for StoreThemeRepository<S> {
    fn get(&self, ctx: &CallContext, owner_id: OwnerId, theme_id: ThemeId) -> RepoResult<Theme> {
        require_id(owner_id, "owner id")?;
        require_id(theme_id, "theme id")?;

        let item = self
            .store
            .get(ctx, &theme_metadata_key(theme_id))?
            .ok_or(RepoError::NotFound {
                kind: EntityKind::Theme,
                id: theme_id,
            })?;
        let theme = decode_theme(&item)?;
        if !theme.is_visible_to(owner_id) {
            return Err(RepoError::Forbidden {
                kind: EntityKind::Theme,
                id: theme_id,
            });
        }
        Ok(theme)
    }

    fn list(&self, ctx: &CallContext, owner_id: OwnerId) -> RepoResult<Vec<Theme>> {
        require_id(owner_id, "owner id")?;

        let filter = Filter::from(Condition::SortKeyEquals(METADATA_SORT_KEY.to_string()));
        let mut themes = Vec::new();
        for_each_page(
            |token| {
                self.store
                    .scan_all(ctx, Some(&filter), token)
                    .map_err(RepoError::from)
            },
            |item| {
                let theme = decode_theme(&item)?;
                if theme.is_visible_to(owner_id) {
                    themes.push(theme);
                }
                Ok(true)
            },
        )?;

        themes.sort_by(|a, b| {
            (!a.is_default, &a.theme_name, a.theme_id).cmp(&(!b.is_default, &b.theme_name, b.theme_id))
        });
        debug!(
            "event=theme_list module=repo status=ok owner_id={} count={}",
            owner_id,
            themes.len()
        );
        Ok(themes)
    }

    fn create(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        let owner_id = theme
            .owner_id
            .filter(|owner| !owner.is_nil())
            .ok_or_else(|| RepoError::invalid_argument("owner id is required to create a theme"))?;

        if theme.theme_id.is_nil() {
            theme.theme_id = Uuid::new_v4();
        }
        let now = Utc::now();
        theme.is_default = false;
        theme.created_at = now;
        theme.updated_at = now;

        let meta = encode_theme(theme)?;
        let link = encode_link(&ThemeOwnershipLink {
            owner_id,
            theme_id: theme.theme_id,
            theme_name: theme.theme_name.clone(),
            created_at: now,
        })?;

        match self.strategy {
            LinkWriteStrategy::Atomic => self.create_atomic(ctx, theme.theme_id, meta, link)?,
            LinkWriteStrategy::Compensating => {
                self.create_compensating(ctx, theme.theme_id, meta, link)?
            }
        }
        info!(
            "event=theme_create module=repo status=ok theme_id={} owner_id={} strategy={}",
            theme.theme_id,
            owner_id,
            self.strategy.as_str()
        );
        Ok(())
    }

    fn update(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        let theme_id = require_id(theme.theme_id, "theme id")?;
        let owner_id = theme
            .owner_id
            .filter(|owner| !owner.is_nil())
            .ok_or_else(|| RepoError::invalid_argument("owner id is required to update a theme"))?;

        let now = Utc::now();
        let fields = encode_value(&theme.fields.iter().map(FieldRecord::from).collect::<Vec<_>>())?;
        let update = ItemUpdate::default()
            .set("ThemeName", Value::String(theme.theme_name.clone()))
            .set("Fields", fields)
            .set("SupportedFeatures", encode_value(&theme.supported_features)?)
            .set("UpdatedAt", encode_value(&now)?);

        match self.store.update(
            ctx,
            &theme_metadata_key(theme_id),
            &update,
            &owned_theme_condition(owner_id),
        ) {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed) => {
                return Err(self.explain_condition_failure(ctx, owner_id, theme_id))
            }
            Err(err) => return Err(err.into()),
        }
        theme.is_default = false;
        theme.updated_at = now;

        let link_update =
            ItemUpdate::default().set("ThemeName", Value::String(theme.theme_name.clone()));
        if let Err(err) = self.store.update(
            ctx,
            &ownership_link_key(owner_id, theme_id),
            &link_update,
            &Precondition::MustExist,
        ) {
            warn!(
                "event=theme_link_rename module=repo status=warn theme_id={} owner_id={} error={}",
                theme_id, owner_id, err
            );
        }

        info!(
            "event=theme_update module=repo status=ok theme_id={} owner_id={}",
            theme_id, owner_id
        );
        Ok(())
    }

    fn delete(&self, ctx: &CallContext, owner_id: OwnerId, theme_id: ThemeId) -> RepoResult<()> {
        let theme = self.get(ctx, owner_id, theme_id)?;
        if theme.is_default {
            return Err(RepoError::DefaultThemeImmutable(theme_id));
        }

        match self.store.delete(
            ctx,
            &theme_metadata_key(theme_id),
            &owned_theme_condition(owner_id),
        ) {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed) => {
                return Err(self.explain_condition_failure(ctx, owner_id, theme_id))
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.store.delete(
            ctx,
            &ownership_link_key(owner_id, theme_id),
            &Precondition::None,
        ) {
            warn!(
                "event=theme_link_delete module=repo status=warn theme_id={} owner_id={} error={}",
                theme_id, owner_id, err
            );
        }

        info!(
            "event=theme_delete module=repo status=ok theme_id={} owner_id={}",
            theme_id, owner_id
        );
        Ok(())
    }

    fn list_links(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
    ) -> RepoResult<Vec<ThemeOwnershipLink>> {
        require_id(owner_id, "owner id")?;
        let partition = owner_partition(owner_id);

        let mut links: Vec<ThemeOwnershipLink> = Vec::new();
        for_each_page(
            |token| {
                self.store
                    .query_index_prefix(
                        ctx,
                        Index::Primary,
                        &partition,
                        ownership_link_prefix(),
                        None,
                        token,
                    )
                    .map_err(RepoError::from)
            },
            |item| {
                let record: LinkRecord = decode_record(&item)?;
                links.push(ThemeOwnershipLink::from(record));
                Ok(true)
            },
        )?;
        Ok(links)
    }

    fn install_default(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        if theme.theme_id.is_nil() {
            theme.theme_id = Uuid::new_v4();
        }
        let now = Utc::now();
        theme.is_default = true;
        theme.owner_id = None;
        theme.created_at = now;
        theme.updated_at = now;

        let meta = encode_theme(theme)?;
        match self.store.put(ctx, &meta, &Precondition::MustNotExist) {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed) => {
                return Err(RepoError::AlreadyExists {
                    kind: EntityKind::Theme,
                    id: theme.theme_id,
                })
            }
            Err(err) => return Err(err.into()),
        }
        info!(
            "event=theme_install_default module=repo status=ok theme_id={}",
            theme.theme_id
        );
        Ok(())
    }
}

/// Condition met only by a non-default theme owned by `owner_id`.
fn owned_theme_condition(owner_id: OwnerId) -> Precondition {
    Precondition::MustMatch(
        Filter::new()
            .and(Condition::attribute_equals("IsDefault", false))
            .and(Condition::attribute_equals("OwnerID", owner_id.to_string())),
    )
}

fn encode_value<T: Serialize>(value: &T) -> RepoResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| RepoError::InvalidData(format!("attribute serialization failed: {err}")))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FieldRecord {
    name: String,
    label: String,
    #[serde(rename = "Type")]
    field_type: FieldType,
    required: bool,
}

impl From<&ThemeField> for FieldRecord {
    fn from(field: &ThemeField) -> Self {
        Self {
            name: field.name.clone(),
            label: field.label.clone(),
            field_type: field.field_type,
            required: field.required,
        }
    }
}

impl From<FieldRecord> for ThemeField {
    fn from(record: FieldRecord) -> Self {
        Self {
            name: record.name,
            label: record.label,
            field_type: record.field_type,
            required: record.required,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ThemeRecord {
    #[serde(rename = "ThemeID")]
    theme_id: ThemeId,
    theme_name: String,
    fields: Vec<FieldRecord>,
    is_default: bool,
    #[serde(rename = "OwnerID", default, skip_serializing_if = "Option::is_none")]
    owner_id: Option<OwnerId>,
    #[serde(default)]
    supported_features: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LinkRecord {
    #[serde(rename = "OwnerID")]
    owner_id: OwnerId,
    #[serde(rename = "ThemeID")]
    theme_id: ThemeId,
    theme_name: String,
    created_at: DateTime<Utc>,
}

impl From<LinkRecord> for ThemeOwnershipLink {
    fn from(record: LinkRecord) -> Self {
        Self {
            owner_id: record.owner_id,
            theme_id: record.theme_id,
            theme_name: record.theme_name,
            created_at: record.created_at,
        }
    }
}

fn encode_theme(theme: &Theme) -> RepoResult<Item> {
    let record = ThemeRecord {
        theme_id: theme.theme_id,
        theme_name: theme.theme_name.clone(),
        fields: theme.fields.iter().map(FieldRecord::from).collect(),
        is_default: theme.is_default,
        owner_id: if theme.is_default { None } else { theme.owner_id },
        supported_features: theme.supported_features.clone(),
        created_at: theme.created_at,
        updated_at: theme.updated_at,
    };
    Ok(Item::new(
        theme_metadata_key(theme.theme_id),
        encode_record(&record)?,
    ))
}

fn decode_theme(item: &Item) -> RepoResult<Theme> {
    let record: ThemeRecord = decode_record(item)?;
    if !record.is_default && record.owner_id.is_none() {
        return Err(RepoError::InvalidData(format!(
            "item {}: owned theme has no OwnerID",
            item.key
        )));
    }
    Ok(Theme {
        theme_id: record.theme_id,
        theme_name: record.theme_name,
        fields: record.fields.into_iter().map(ThemeField::from).collect(),
        is_default: record.is_default,
        owner_id: if record.is_default {
            None
        } else {
            record.owner_id
        },
        supported_features: record.supported_features,
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}

fn encode_link(link: &ThemeOwnershipLink) -> RepoResult<Item> {
    let record = LinkRecord {
        owner_id: link.owner_id,
        theme_id: link.theme_id,
        theme_name: link.theme_name.clone(),
        created_at: link.created_at,
    };
    Ok(Item::new(
        ownership_link_key(link.owner_id, link.theme_id),
        encode_record(&record)?,
    ))
}
