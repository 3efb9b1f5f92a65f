//! Config-driven feature gating.
//!
//! Features are declared in a JSON file and evaluated against the deployment
//! environment, the caller's user group, and a percentage rollout. Rollout
//! bucketing hashes the user ID with FNV-1a, so a user's bucket is stable
//! across processes and reloads.

use creditmeter_core::{BillingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Deployment environment a flag set is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    Development,
    /// Pre-production staging.
    Staging,
    /// Production.
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            _ => Err(format!("unknown environment: {s}")),
        }
    }
}

impl Environment {
    /// Resolve the environment from `CREDITMETER_ENV`.
    ///
    /// Unset or unrecognised values read as [`Environment::Development`].
    pub fn from_env() -> Self {
        std::env::var("CREDITMETER_ENV")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Self::Development)
    }
}

fn default_rollout() -> u8 {
    100
}

/// Declaration of one gated feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    /// Master switch; a disabled feature is off everywhere.
    #[serde(default)]
    pub enabled: bool,
    /// Per-environment switches. An environment missing from the map reads
    /// as disabled.
    #[serde(default)]
    pub environments: HashMap<String, bool>,
    /// User groups allowed to use the feature; empty means all groups.
    #[serde(default)]
    pub user_groups: Vec<String>,
    /// Percentage of users the feature is rolled out to.
    #[serde(default = "default_rollout")]
    pub rollout_percentage: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FlagsFile {
    #[serde(default)]
    features: HashMap<String, FeatureFlag>,
}

/// Evaluates feature flags for one deployment environment.
///
/// Constructed with an explicit [`Environment`] so tests and multi-tenant
/// tooling can evaluate against any environment without touching process
/// state; binaries use [`Environment::from_env`].
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    features: HashMap<String, FeatureFlag>,
    environment: Environment,
}

impl FeatureFlags {
    /// Create an empty flag set: every feature reads as disabled.
    pub fn empty(environment: Environment) -> Self {
        Self {
            features: HashMap::new(),
            environment,
        }
    }

    /// Create a flag set from already-parsed declarations.
    pub fn new(features: HashMap<String, FeatureFlag>, environment: Environment) -> Self {
        Self {
            features,
            environment,
        }
    }

    /// Load flag declarations from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Config`] if the file cannot be read or the
    /// JSON is invalid.
    pub fn load(path: &Path, environment: Environment) -> Result<Self> {
        let file = read_flags_file(path)?;
        Ok(Self::new(file.features, environment))
    }

    /// Replace the flag declarations with the file's current contents.
    ///
    /// On error the existing declarations are kept.
    pub fn reload(&mut self, path: &Path) -> Result<()> {
        let file = read_flags_file(path)?;
        self.features = file.features;
        Ok(())
    }

    /// The environment this flag set evaluates against.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Whether `feature` is enabled for the given user group and user.
    ///
    /// An unknown feature is disabled. A feature with a partial rollout and
    /// no `user_id` to bucket is enabled — callers that need deterministic
    /// rollout must pass the user.
    pub fn is_enabled(
        &self,
        feature: &str,
        user_group: Option<&str>,
        user_id: Option<&str>,
    ) -> bool {
        let Some(flag) = self.features.get(feature) else {
            return false;
        };
        if !flag.enabled {
            return false;
        }
        if !flag
            .environments
            .get(&self.environment.to_string())
            .copied()
            .unwrap_or(false)
        {
            return false;
        }
        if let Some(group) = user_group {
            if !flag.user_groups.is_empty() && !flag.user_groups.iter().any(|g| g == group) {
                return false;
            }
        }
        if flag.rollout_percentage < 100 {
            if let Some(user_id) = user_id {
                if rollout_bucket(user_id) >= flag.rollout_percentage {
                    return false;
                }
            }
        }
        true
    }

    /// List every feature enabled for the given user group and user.
    pub fn enabled_features(&self, user_group: Option<&str>, user_id: Option<&str>) -> Vec<String> {
        let mut enabled: Vec<String> = self
            .features
            .keys()
            .filter(|name| self.is_enabled(name, user_group, user_id))
            .cloned()
            .collect();
        enabled.sort();
        enabled
    }

    /// The full declaration of a feature, if declared.
    pub fn feature_config(&self, feature: &str) -> Option<&FeatureFlag> {
        self.features.get(feature)
    }

    /// Fail with [`BillingError::Validation`] unless `feature` is enabled.
    pub fn ensure_enabled(
        &self,
        feature: &str,
        user_group: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<()> {
        if self.is_enabled(feature, user_group, user_id) {
            Ok(())
        } else {
            Err(BillingError::Validation(format!(
                "feature '{feature}' is not enabled"
            )))
        }
    }
}

fn read_flags_file(path: &Path) -> Result<FlagsFile> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        BillingError::Config(format!("failed to read flags file {}: {e}", path.display()))
    })?;
    serde_json::from_str(&contents)
        .map_err(|e| BillingError::Config(format!("failed to parse flags JSON: {e}")))
}

/// Bucket a user into `0..100` with FNV-1a over the user ID.
fn rollout_bucket(user_id: &str) -> u8 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLAGS_JSON: &str = r#"{
        "features": {
            "voice_agent": {
                "enabled": true,
                "environments": {"development": true, "production": true},
                "user_groups": ["admin", "sales"],
                "rollout_percentage": 100
            },
            "campaign_autopilot": {
                "enabled": true,
                "environments": {"development": true},
                "rollout_percentage": 50
            },
            "linkedin_integration": {
                "enabled": false,
                "environments": {"development": true}
            }
        }
    }"#;

    fn flags(environment: Environment) -> FeatureFlags {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(FLAGS_JSON.as_bytes()).unwrap();
        FeatureFlags::load(f.path(), environment).unwrap()
    }

    #[test]
    fn environment_roundtrip() {
        for env in [
            Environment::Development,
            Environment::Staging,
            Environment::Production,
        ] {
            let parsed: Environment = env.to_string().parse().unwrap();
            assert_eq!(parsed, env);
        }
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn unknown_and_disabled_features_are_off() {
        let flags = flags(Environment::Development);
        assert!(!flags.is_enabled("no_such_feature", None, None));
        assert!(!flags.is_enabled("linkedin_integration", None, None));
    }

    #[test]
    fn environment_gates_features() {
        assert!(flags(Environment::Development).is_enabled("voice_agent", None, None));
        assert!(flags(Environment::Production).is_enabled("voice_agent", None, None));
        // Not declared for staging
        assert!(!flags(Environment::Staging).is_enabled("voice_agent", None, None));
        assert!(!flags(Environment::Production).is_enabled("campaign_autopilot", None, None));
    }

    #[test]
    fn group_list_restricts_when_present() {
        let flags = flags(Environment::Development);
        assert!(flags.is_enabled("voice_agent", Some("admin"), None));
        assert!(!flags.is_enabled("voice_agent", Some("basic"), None));
        // No group supplied skips the check
        assert!(flags.is_enabled("voice_agent", None, None));
        // Empty group list admits everyone
        assert!(flags.is_enabled("campaign_autopilot", Some("basic"), None));
    }

    #[test]
    fn rollout_buckets_are_deterministic() {
        let flags = flags(Environment::Development);

        // Without a user to bucket, a partial rollout passes
        assert!(flags.is_enabled("campaign_autopilot", None, None));

        for user in ["user_1", "user_2", "user_42"] {
            let first = flags.is_enabled("campaign_autopilot", None, Some(user));
            let second = flags.is_enabled("campaign_autopilot", None, Some(user));
            assert_eq!(first, second);
            assert_eq!(
                first,
                rollout_bucket(user) < 50,
                "bucket and gate disagree for {user}"
            );
        }
    }

    #[test]
    fn rollout_zero_excludes_every_bucketed_user() {
        let mut features = HashMap::new();
        features.insert(
            "dark_launch".to_string(),
            FeatureFlag {
                enabled: true,
                environments: HashMap::from([("development".to_string(), true)]),
                user_groups: Vec::new(),
                rollout_percentage: 0,
            },
        );
        let flags = FeatureFlags::new(features, Environment::Development);
        for user in ["a", "b", "c"] {
            assert!(!flags.is_enabled("dark_launch", None, Some(user)));
        }
    }

    #[test]
    fn enabled_features_lists_what_passes() {
        let flags = flags(Environment::Production);
        assert_eq!(
            flags.enabled_features(Some("admin"), None),
            vec!["voice_agent".to_string()]
        );
    }

    #[test]
    fn ensure_enabled_errors_with_feature_name() {
        let flags = flags(Environment::Staging);
        let err = flags.ensure_enabled("voice_agent", None, None).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(err.to_string().contains("voice_agent"));
    }

    #[test]
    fn reload_replaces_declarations() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(FLAGS_JSON.as_bytes()).unwrap();
        let mut flags = FeatureFlags::load(f.path(), Environment::Development).unwrap();
        assert!(flags.is_enabled("voice_agent", None, None));

        let mut updated = tempfile::NamedTempFile::new().unwrap();
        updated
            .write_all(br#"{"features": {}}"#)
            .unwrap();
        flags.reload(updated.path()).unwrap();
        assert!(!flags.is_enabled("voice_agent", None, None));
    }

    #[test]
    fn load_missing_file_is_a_config_error() {
        let result = FeatureFlags::load(
            Path::new("/nonexistent/flags.json"),
            Environment::Development,
        );
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    fn empty_flag_set_disables_everything() {
        let flags = FeatureFlags::empty(Environment::Production);
        assert!(!flags.is_enabled("voice_agent", None, None));
        assert!(flags.enabled_features(None, None).is_empty());
    }
}
