//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the driver:
//! - Logging setup
//! - Keyed, lazily loaded caches

pub mod cache;
pub mod logging;

pub use cache::KeyedCache;
