//! Label keys and values attached to managed cluster resources.
//!
//! Resource groups carry the full set so that startup reconciliation can
//! rebuild the registry from a label-selector listing alone.

/// Standard "managed by" label understood by cluster tooling.
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value for [`APP_MANAGED_BY`].
pub const APP_MANAGED_BY_VALUE: &str = "chaldeploy";

/// Marker used in the reconciliation selector.
pub const MANAGED_BY: &str = "chaldeploy.dev/managed-by";
/// Value for [`MANAGED_BY`].
pub const MANAGED_BY_VALUE: &str = "yes";

/// Hash of the challenge name.
pub const CHALLENGE: &str = "chaldeploy.dev/chal";
/// Team id that owns the resource.
pub const TEAM_ID: &str = "chaldeploy.dev/team-id";
/// Planned expiration as Unix seconds (resource groups only).
pub const EXPIRATION_TIME: &str = "chaldeploy.dev/expiration-time";
/// Workload/endpoint selector label; value is the resource-group name.
pub const APP: &str = "app";

/// Label selector matching every resource group of one challenge.
pub fn managed_selector(challenge_hash: &str) -> String {
    format!("{MANAGED_BY}={MANAGED_BY_VALUE},{CHALLENGE}={challenge_hash}")
}
