//! Deterministic naming for per-team resource groups.
//!
//! Names are a pure function of the challenge name and the team id, so a
//! restarted process derives the same names and can find its resources
//! again by label.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use sha2::{Digest, Sha256};

use crate::error::TenantKeyError;

/// Prefix shared by every resource group this service creates.
pub const RESOURCE_GROUP_PREFIX: &str = "chaldeploy";

/// Longest DNS label, and longest label value.
pub const MAX_NAME_LEN: usize = 63;

/// Number of hex characters kept from the SHA-256 digest.
const HASH_LEN: usize = 16;

static HASH_CACHE: LazyLock<RwLock<HashMap<String, String>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Short, stable hash of a string: the first 16 hex chars of its SHA-256.
///
/// Results are memoized for the lifetime of the process.
pub fn hash_string(message: &str) -> String {
    if let Ok(cache) = HASH_CACHE.read() {
        if let Some(digest) = cache.get(message) {
            return digest.clone();
        }
    }

    let digest = Sha256::digest(message.as_bytes());
    let mut short = hex::encode(digest);
    short.truncate(HASH_LEN);

    if let Ok(mut cache) = HASH_CACHE.write() {
        cache.insert(message.to_string(), short.clone());
    }

    short
}

/// Resource-group name for a team's instance of a challenge.
///
/// Only ASCII alphanumerics of the team id are kept, so the result is a
/// valid DNS label component: `chaldeploy-<hash>-<team>` in lower case.
pub fn resource_group_name(challenge_name: &str, tenant_key: &str) -> String {
    let tenant: String = tenant_key
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    format!(
        "{RESOURCE_GROUP_PREFIX}-{}-{tenant}",
        hash_string(challenge_name)
    )
    .to_lowercase()
}

/// Check that a team id yields a usable resource-group name and can be
/// stored as a label value.
pub fn validate_tenant_key(challenge_name: &str, tenant_key: &str) -> Result<(), TenantKeyError> {
    if !tenant_key.chars().any(|c| c.is_ascii_alphanumeric()) {
        return Err(TenantKeyError::NoAlphanumerics);
    }

    let len = resource_group_name(challenge_name, tenant_key).len();
    if len > MAX_NAME_LEN {
        return Err(TenantKeyError::NameTooLong {
            len,
            max: MAX_NAME_LEN,
        });
    }

    // Label values: alphanumeric at both ends, `-_.` allowed inside.
    let bytes = tenant_key.as_bytes();
    let ends_ok = bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric);
    let chars_ok = bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(*b, b'-' | b'_' | b'.'));
    if tenant_key.len() > MAX_NAME_LEN || !ends_ok || !chars_ok {
        return Err(TenantKeyError::InvalidLabelValue);
    }
    Ok(())
}

/// Bare image name of a reference like `registry/path/name:tag`.
pub fn image_name(image: &str) -> &str {
    let last = image.rsplit('/').next().unwrap_or(image);
    last.split(':').next().unwrap_or(last)
}

/// The challenge this process deploys, with its hash computed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeIdentity {
    name: String,
    hash: String,
}

impl ChallengeIdentity {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hash: hash_string(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of the challenge label on every managed resource.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Resource-group name for one team.
    pub fn group_name(&self, tenant_key: &str) -> String {
        resource_group_name(&self.name, tenant_key)
    }

    pub fn validate_tenant_key(&self, tenant_key: &str) -> Result<(), TenantKeyError> {
        validate_tenant_key(&self.name, tenant_key)
    }
}
