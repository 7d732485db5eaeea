//! Persistence core for axicalendar.
//! Themes, entries and their single-table storage layout live here.

pub mod config;
pub mod db;
pub mod keys;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;

pub use crate::config::{ConfigError, CoreConfig};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entry::{Entry, EntryData, EntryId};
pub use model::theme::{
    FieldType, OwnerId, Theme, ThemeField, ThemeId, ThemeOwnershipLink, SUM_ALL_FEATURE,
};
pub use model::ValidationError;
pub use repo::entry_repo::{plan_update, EntryRepository, EntryUpdatePlan, StoreEntryRepository};
pub use repo::theme_repo::{LinkWriteStrategy, StoreThemeRepository, ThemeRepository};
pub use repo::{EntityKind, ErrorKind, RepoError, RepoResult};
pub use service::entry_service::EntryService;
pub use service::theme_service::ThemeService;
pub use store::{CallContext, ItemStore, MemoryItemStore, SqliteItemStore};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
