//! Configuration loading, validation and env substitution.
//!
//! Config files: `switchboard.toml`, `switchboard.yaml`, or `switchboard.json`,
//! searched in `./` then the user config directory (`~/.config/switchboard/`).
//!
//! Supports `${ENV_VAR}` substitution in all string values and a small set
//! of `SWITCHBOARD_*` environment overrides.

pub mod duration;
pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    duration::parse_duration,
    loader::{
        apply_env_overrides, config_dir, data_dir, discover_and_load, find_config_file, load_config,
    },
    schema::{
        AiConfig, AiProviderKind, HandoverConfig, MetricsConfig, ReplyConfig, ServerConfig,
        StoreConfig, SupervisorConfig, SwitchboardConfig, TransportKind, WhatsAppConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate_config},
};
