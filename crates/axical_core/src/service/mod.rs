//! Core use-case services.
//!
//! # Responsibility
//! - Validate caller input before it reaches persistence.
//! - Compose repository calls into use-case level APIs.
//!
//! # Invariants
//! - Services never touch the item store directly.

pub mod entry_service;
pub mod theme_service;
