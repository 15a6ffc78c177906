//! chaldeploy-core — shared building blocks for chaldeploy crates.
//!
//! - [`config`] — the challenge configuration and its environment loader
//! - [`naming`] — deterministic resource-group names derived from a
//!   challenge name and a team id
//! - [`labels`] — label keys used to tag and rediscover cluster resources

pub mod config;
pub mod error;
pub mod labels;
pub mod naming;

pub use config::ChallengeConfig;
pub use error::{ConfigError, ConfigResult, TenantKeyError};
pub use naming::{
    ChallengeIdentity, hash_string, image_name, resource_group_name, validate_tenant_key,
};
