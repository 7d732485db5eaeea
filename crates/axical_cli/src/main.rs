//! CLI smoke entry point.
//!
//! # Responsibility
//! - Load configuration from an optional JSON file (first argument) and the
//!   environment, then open the item store.
//! - Print the core version and the number of stored items.

use axical_core::db::{open_db_in_memory, open_db_with};
use axical_core::store::{for_each_page, StoreError};
use axical_core::{CallContext, CoreConfig, ItemStore, SqliteItemStore};
use log::{error, info};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_run module=cli status=error error={}", err);
            eprintln!("axical: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = CoreConfig::load(config_path.as_deref())?;
    if let Some(log_dir) = &config.log_dir {
        axical_core::init_logging(&config.log_level, log_dir)?;
    }

    let conn = match &config.db_path {
        Some(path) => open_db_with(path, config.open_options())?,
        None => open_db_in_memory()?,
    };
    let store = SqliteItemStore::with_page_size(&conn, config.page_size);

    let ctx = CallContext::new();
    let mut items = 0usize;
    for_each_page(
        |token| store.scan_all(&ctx, None, token),
        |_| -> Result<bool, StoreError> {
            items += 1;
            Ok(true)
        },
    )?;

    info!(
        "event=cli_run module=cli status=ok items={} strategy={}",
        items,
        config.theme_link_strategy.as_str()
    );
    println!("axical_core ping={}", axical_core::ping());
    println!("axical_core version={}", axical_core::core_version());
    println!("items={items}");
    Ok(())
}
