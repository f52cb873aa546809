//! Identifiers, site configuration, and mutation specs for Stagecraft.
//!
//! This crate defines the schema layer: strongly-typed identifiers for stages,
//! owners and sites (`StageId`, `OwnerToken`, `SiteKey`), the TOML site
//! configuration (`StageConfig`), and the normalized description of a package
//! mutation to perform inside a stage (`MutationSpec`).

pub mod config;
pub mod mutation;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, ConfigError, ExecutorSection, LockSection, SiteSection,
    StageConfig, StatusSection, ValidatorsSection, CONFIG_FILE_NAME,
};
pub use mutation::{MutationError, MutationSpec};
pub use types::{OwnerToken, SiteKey, StageId};
