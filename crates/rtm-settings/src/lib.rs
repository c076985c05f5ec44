//! # rtm-settings
//!
//! Broker configuration loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`RtmSettings::default()`]
//! 2. **Settings file** — `~/.rtm/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `RTM_*` overrides (highest priority)
//!
//! Unlike a global singleton, the loaded [`RtmSettings`] value is owned by
//! the binary and handed to the server at construction.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
