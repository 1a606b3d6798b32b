//! Dispatch requests and launch-path routing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::file_ref::FileReference;
use super::size_tier::SizeTier;

/// Which kind of remote unit runs a tier.
///
/// Function units start fast but have a short ceiling; container units take
/// longer to place but may run for much longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchPath {
    Function,
    Container,
}

impl LaunchPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Container => "container",
        }
    }

    /// Path chosen for `tier` under the default routing.
    pub fn for_tier(tier: SizeTier) -> Self {
        LaunchRouting::default().path_for(tier)
    }
}

impl std::fmt::Display for LaunchPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Routes tiers to launch paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRouting {
    /// Largest tier still sent to the function path. `None` sends every tier
    /// to containers.
    #[serde(default = "default_function_max_tier")]
    pub function_max_tier: Option<SizeTier>,
}

fn default_function_max_tier() -> Option<SizeTier> {
    Some(SizeTier::Small)
}

impl Default for LaunchRouting {
    fn default() -> Self {
        Self {
            function_max_tier: default_function_max_tier(),
        }
    }
}

impl LaunchRouting {
    pub fn path_for(&self, tier: SizeTier) -> LaunchPath {
        match self.function_max_tier {
            Some(max) if tier <= max => LaunchPath::Function,
            _ => LaunchPath::Container,
        }
    }
}

/// Tag keys attached to every dispatch request.
pub mod tags {
    pub const BUCKET: &str = "bucket";
    pub const KEY: &str = "key";
    pub const SIZE_BYTES: &str = "size_bytes";
    pub const SIZE_TIER: &str = "size_tier";
    pub const EXECUTION_TYPE: &str = "execution_type";
}

/// One unit of work handed to the external scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Scheduler idempotency key, derived from the file identity.
    pub run_key: String,
    pub file: FileReference,
    pub tier: SizeTier,
    pub launch_path: LaunchPath,
    /// Observability tags.
    pub tags: BTreeMap<String, String>,
}

impl DispatchRequest {
    pub fn new(file: FileReference, tier: SizeTier, launch_path: LaunchPath) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(tags::BUCKET.to_string(), file.bucket.clone());
        tags.insert(tags::KEY.to_string(), file.key.clone());
        tags.insert(tags::SIZE_BYTES.to_string(), file.size_bytes.to_string());
        tags.insert(tags::SIZE_TIER.to_string(), tier.to_string());
        tags.insert(
            tags::EXECUTION_TYPE.to_string(),
            launch_path.as_str().to_string(),
        );

        Self {
            run_key: file.identity().run_key(),
            file,
            tier,
            launch_path,
            tags,
        }
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }
}
