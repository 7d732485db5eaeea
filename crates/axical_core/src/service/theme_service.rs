//! Theme use-case service.
//!
//! # Responsibility
//! - Validate theme schemas before create and update.
//! - Delegate persistence to a `ThemeRepository`.

use crate::model::theme::{OwnerId, Theme, ThemeField, ThemeId, ThemeOwnershipLink};
use crate::repo::theme_repo::ThemeRepository;
use crate::repo::RepoResult;
use crate::store::CallContext;

/// Use-case service wrapper for theme operations.
pub struct ThemeService<R: ThemeRepository> {
    repo: R,
}

impl<R: ThemeRepository> ThemeService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Builds, validates and persists an owned theme, returning it with its
    /// assigned id and timestamps.
    pub fn create_theme(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
        name: impl Into<String>,
        fields: Vec<ThemeField>,
        supported_features: Vec<String>,
    ) -> RepoResult<Theme> {
        let mut theme = Theme::new(owner_id, name, fields);
        theme.supported_features = supported_features;
        self.create(ctx, &mut theme)?;
        Ok(theme)
    }

    pub fn create(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        theme.validate()?;
        self.repo.create(ctx, theme)
    }

    pub fn update(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        theme.validate()?;
        self.repo.update(ctx, theme)
    }

    pub fn get(&self, ctx: &CallContext, owner_id: OwnerId, theme_id: ThemeId) -> RepoResult<Theme> {
        self.repo.get(ctx, owner_id, theme_id)
    }

    pub fn list(&self, ctx: &CallContext, owner_id: OwnerId) -> RepoResult<Vec<Theme>> {
        self.repo.list(ctx, owner_id)
    }

    pub fn delete(&self, ctx: &CallContext, owner_id: OwnerId, theme_id: ThemeId) -> RepoResult<()> {
        self.repo.delete(ctx, owner_id, theme_id)
    }

    pub fn list_links(
        &self,
        ctx: &CallContext,
        owner_id: OwnerId,
    ) -> RepoResult<Vec<ThemeOwnershipLink>> {
        self.repo.list_links(ctx, owner_id)
    }

    /// Validates and installs a system theme visible to every owner.
    pub fn install_default(&self, ctx: &CallContext, theme: &mut Theme) -> RepoResult<()> {
        theme.validate()?;
        self.repo.install_default(ctx, theme)
    }
}
