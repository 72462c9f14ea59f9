//! # ensemble-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`EnsembleSettings::default()`])
//! 2. **User file** `~/.ensemble/settings.json`, deep-merged over defaults
//! 3. **Environment variables** `ENSEMBLE_*` overrides (highest priority)
//!
//! There is no global instance; callers load settings once and pass the
//! pieces they need into the engine.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, ensemble_home, load_settings, load_settings_from_path,
    resolve_db_path, settings_path,
};
pub use types::*;
