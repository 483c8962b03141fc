// Profile file format (see spec §6 "External Interfaces").
//
// Stored as pretty-printed, two-space-indent JSON under
// `<home>/.llxprt/profiles/<name>.json`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// `version=1` is the only version this core understands.
pub const PROFILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    Standard,
    Loadbalancer,
}

/// One concrete backend in a load-balancer ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProfile {
    pub name: String,
    pub provider_name: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub model_params: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerPolicy {
    Roundrobin,
    Failover,
    TpmThreshold,
    Bucket,
}

/// A profile as read from `<home>/.llxprt/profiles/<name>.json`.
///
/// `loadbalancer`-type profiles additionally carry `policy` and `profiles`,
/// referring to saved standard profiles by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub version: u32,
    #[serde(rename = "type", default)]
    pub profile_type: Option<ProfileType>,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub model_params: HashMap<String, Value>,
    #[serde(default)]
    pub ephemeral_settings: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<LoadBalancerPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<SubProfile>>,
}

impl Profile {
    pub fn is_loadbalancer(&self) -> bool {
        matches!(self.profile_type, Some(ProfileType::Loadbalancer))
    }
}

/// Errors from loading a profile off disk. Messages are bit-exact per
/// spec §6 so callers can match on text for user-facing display.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Profile '{0}' not found")]
    NotFound(String),

    #[error("Profile '{0}' is corrupted")]
    Corrupted(String),

    #[error("Profile '{0}' is invalid: missing required fields")]
    MissingFields(String),

    #[error("unsupported profile version")]
    UnsupportedVersion,
}
