//! Feature-flag definitions and rollout evaluation.
//!
//! Flags decide, for a flag name and optional caller identity, whether a
//! capability is active. Percentage rollout is deterministic: the same
//! identity always receives the same answer for a given threshold, and
//! raising the threshold only ever adds identities. Definitions are
//! persisted through the abstract [`FlagStore`]; store failures never fail
//! the caller.

mod store;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use self::store::{FlagStore, MemoryFlagStore, StoreError, FLAG_KEY_PREFIX};

/// Rule by which a flag decides applicability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Active for every caller.
    All,
    /// Active for no caller.
    None,
    /// Active for a deterministic percentage of identities.
    Percentage,
    /// Active for explicitly listed user identifiers.
    Users,
    /// Active for explicitly listed group identifiers.
    Groups,
    /// Percentage rollout whose threshold is ramped over time by callers.
    Gradual,
}

/// One feature flag definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    /// Unique flag name.
    pub name: String,
    /// Master switch; when false the strategy is never consulted.
    pub enabled: bool,
    /// Human description.
    pub description: String,
    /// Rollout rule.
    pub strategy: RolloutStrategy,
    /// Threshold for percentage-style strategies, 0..=100.
    pub percentage: u8,
    /// Explicitly enabled user identifiers.
    pub users: BTreeSet<String>,
    /// Explicitly enabled group identifiers.
    pub groups: BTreeSet<String>,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
    /// When the flag was created.
    pub created_at: DateTime<Utc>,
    /// When the flag was last updated.
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    /// Create an enabled flag with the given strategy and empty target sets.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, strategy: RolloutStrategy) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            enabled: true,
            description: description.into(),
            strategy,
            percentage: 0,
            users: BTreeSet::new(),
            groups: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to an existing flag. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct FlagUpdate {
    /// New master-switch value.
    pub enabled: Option<bool>,
    /// New description.
    pub description: Option<String>,
    /// New rollout strategy.
    pub strategy: Option<RolloutStrategy>,
    /// New percentage threshold.
    pub percentage: Option<u8>,
    /// Replacement user set.
    pub users: Option<BTreeSet<String>>,
    /// Replacement group set.
    pub groups: Option<BTreeSet<String>>,
    /// Replacement metadata.
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Flag management errors.
#[derive(Debug, Error)]
pub enum FlagError {
    /// No flag with the given name exists.
    #[error("unknown feature flag: {0}")]
    NotFound(String),

    /// A flag with the given name already exists.
    #[error("feature flag already exists: {0}")]
    AlreadyExists(String),

    /// Percentage outside 0..=100.
    #[error("percentage {0} out of range 0..=100")]
    InvalidPercentage(u8),
}

/// Read-only roll-up of flag state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagStats {
    /// Number of defined flags.
    pub total: usize,
    /// Number of flags with the master switch on.
    pub enabled: usize,
    /// Flag count by strategy label.
    pub by_strategy: BTreeMap<String, usize>,
}

/// Feature-flag manager.
///
/// Owns the in-memory flag map; every mutation is written through to the
/// store. Evaluation reads only in-memory state and never fails.
pub struct FeatureFlags {
    flags: Mutex<HashMap<String, FeatureFlag>>,
    store: Arc<dyn FlagStore>,
}

impl std::fmt::Debug for FeatureFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureFlags")
            .field("flags", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl FeatureFlags {
    /// Create a manager backed by `store`, seeded with whatever the store
    /// already holds. A store load failure starts the manager empty.
    #[must_use]
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        let flags = match store.load_all() {
            Ok(loaded) => loaded
                .into_iter()
                .map(|flag| (flag.name.clone(), flag))
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to load persisted flags, starting empty");
                HashMap::new()
            },
        };
        Self {
            flags: Mutex::new(flags),
            store,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FeatureFlag>> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write one flag through to the store, logging and swallowing failure.
    fn persist(&self, flag: &FeatureFlag) {
        if let Err(err) = self.store.save(flag) {
            tracing::warn!(flag = %flag.name, error = %err, "failed to persist flag");
        }
    }

    /// Register the default catalogue idempotently: flags already present
    /// (for instance loaded from the store) are left untouched.
    pub fn register_defaults(&self) {
        for (name, description, strategy, enabled) in [
            (
                "enable_caching",
                "Cache gate results between scans",
                RolloutStrategy::All,
                true,
            ),
            (
                "async_processing",
                "Run gate batches on the async pipeline",
                RolloutStrategy::All,
                true,
            ),
            (
                "usage_analytics",
                "Collect anonymised usage analytics",
                RolloutStrategy::Percentage,
                true,
            ),
            (
                "fca_handbook_gates",
                "FCA handbook gate module",
                RolloutStrategy::All,
                true,
            ),
            (
                "gdpr_gates",
                "GDPR / UK DPA gate module",
                RolloutStrategy::All,
                true,
            ),
            (
                "tax_evasion_gates",
                "Criminal Finances Act facilitation gate module",
                RolloutStrategy::Groups,
                false,
            ),
        ] {
            let mut flags = self.lock();
            if flags.contains_key(name) {
                continue;
            }
            let mut flag = FeatureFlag::new(name, description, strategy);
            flag.enabled = enabled;
            if matches!(strategy, RolloutStrategy::Percentage) {
                flag.percentage = 100;
            }
            flags.insert(name.to_string(), flag.clone());
            drop(flags);
            self.persist(&flag);
        }
    }

    /// Create a new flag and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::AlreadyExists`] for a duplicate name and
    /// [`FlagError::InvalidPercentage`] for a threshold above 100.
    pub fn create_flag(&self, flag: FeatureFlag) -> Result<(), FlagError> {
        if flag.percentage > 100 {
            return Err(FlagError::InvalidPercentage(flag.percentage));
        }
        let mut flags = self.lock();
        if flags.contains_key(&flag.name) {
            return Err(FlagError::AlreadyExists(flag.name));
        }
        flags.insert(flag.name.clone(), flag.clone());
        drop(flags);
        self.persist(&flag);
        Ok(())
    }

    /// Apply a partial update to an existing flag and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::NotFound`] for an unknown name; an update never
    /// creates a flag.
    pub fn update_flag(&self, name: &str, update: FlagUpdate) -> Result<(), FlagError> {
        if let Some(pct) = update.percentage {
            if pct > 100 {
                return Err(FlagError::InvalidPercentage(pct));
            }
        }
        let mut flags = self.lock();
        let flag = flags
            .get_mut(name)
            .ok_or_else(|| FlagError::NotFound(name.to_string()))?;

        if let Some(enabled) = update.enabled {
            flag.enabled = enabled;
        }
        if let Some(description) = update.description {
            flag.description = description;
        }
        if let Some(strategy) = update.strategy {
            flag.strategy = strategy;
        }
        if let Some(percentage) = update.percentage {
            flag.percentage = percentage;
        }
        if let Some(users) = update.users {
            flag.users = users;
        }
        if let Some(groups) = update.groups {
            flag.groups = groups;
        }
        if let Some(metadata) = update.metadata {
            flag.metadata = metadata;
        }
        flag.updated_at = Utc::now();

        let snapshot = flag.clone();
        drop(flags);
        self.persist(&snapshot);
        Ok(())
    }

    /// Delete a flag and its persisted record.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::NotFound`] for an unknown name.
    pub fn delete_flag(&self, name: &str) -> Result<(), FlagError> {
        let removed = self.lock().remove(name);
        if removed.is_none() {
            return Err(FlagError::NotFound(name.to_string()));
        }
        if let Err(err) = self.store.delete(name) {
            tracing::warn!(flag = name, error = %err, "failed to delete persisted flag");
        }
        Ok(())
    }

    /// Fetch one flag definition.
    #[must_use]
    pub fn get_flag(&self, name: &str) -> Option<FeatureFlag> {
        self.lock().get(name).cloned()
    }

    /// All flag definitions, name-sorted.
    #[must_use]
    pub fn list_flags(&self) -> Vec<FeatureFlag> {
        let mut flags: Vec<FeatureFlag> = self.lock().values().cloned().collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        flags
    }

    /// Decide whether a capability is active for the given identity.
    ///
    /// Unknown flags and percentage evaluation without an identity yield
    /// `default`. A globally disabled flag yields `false` regardless of
    /// strategy. Evaluation never fails.
    #[must_use]
    pub fn is_enabled(
        &self,
        name: &str,
        user_id: Option<&str>,
        group: Option<&str>,
        default: bool,
    ) -> bool {
        let flags = self.lock();
        let Some(flag) = flags.get(name) else {
            return default;
        };
        if !flag.enabled {
            return false;
        }

        match flag.strategy {
            RolloutStrategy::All => true,
            RolloutStrategy::None => false,
            RolloutStrategy::Users => {
                user_id.is_some_and(|user| flag.users.contains(user))
            },
            RolloutStrategy::Groups => {
                group.is_some_and(|group| flag.groups.contains(group))
            },
            RolloutStrategy::Percentage | RolloutStrategy::Gradual => match user_id {
                Some(user) => rollout_bucket(name, user) < u64::from(flag.percentage),
                None => default,
            },
        }
    }

    /// Read-only roll-up for the orchestrator facade.
    #[must_use]
    pub fn get_stats(&self) -> FlagStats {
        let flags = self.lock();
        let mut by_strategy: BTreeMap<String, usize> = BTreeMap::new();
        for flag in flags.values() {
            let label = match flag.strategy {
                RolloutStrategy::All => "all",
                RolloutStrategy::None => "none",
                RolloutStrategy::Percentage => "percentage",
                RolloutStrategy::Users => "users",
                RolloutStrategy::Groups => "groups",
                RolloutStrategy::Gradual => "gradual",
            };
            *by_strategy.entry(label.to_string()).or_insert(0) += 1;
        }
        FlagStats {
            total: flags.len(),
            enabled: flags.values().filter(|f| f.enabled).count(),
            by_strategy,
        }
    }
}

/// Deterministic rollout bucket in `0..100` for one `(flag, identity)` pair.
///
/// SHA-256 keeps the assignment stable across processes and releases, so a
/// persisted percentage threshold keeps selecting the same identities.
/// Raising the threshold only ever adds identities (the bucket itself never
/// changes), which makes rollout monotonic.
fn rollout_bucket(flag_name: &str, user_id: &str) -> u64 {
    let digest = Sha256::digest(format!("{flag_name}:{user_id}").as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % 100
}

#[cfg(test)]
mod tests {
    use super::store::testing::FailingFlagStore;
    use super::*;

    fn manager() -> FeatureFlags {
        FeatureFlags::new(Arc::new(MemoryFlagStore::new()))
    }

    fn percentage_flag(name: &str, percentage: u8) -> FeatureFlag {
        let mut flag = FeatureFlag::new(name, "", RolloutStrategy::Percentage);
        flag.percentage = percentage;
        flag
    }

    #[test]
    fn test_all_and_none_strategies() {
        let flags = manager();
        flags
            .create_flag(FeatureFlag::new("everyone", "", RolloutStrategy::All))
            .unwrap();
        flags
            .create_flag(FeatureFlag::new("nobody", "", RolloutStrategy::None))
            .unwrap();

        assert!(flags.is_enabled("everyone", None, None, false));
        assert!(!flags.is_enabled("nobody", Some("u1"), None, true));
        // Unknown flags fall back to the caller default.
        assert!(flags.is_enabled("missing", None, None, true));
    }

    #[test]
    fn test_disabled_flag_overrides_strategy() {
        let flags = manager();
        let mut flag = FeatureFlag::new("switched-off", "", RolloutStrategy::All);
        flag.enabled = false;
        flags.create_flag(flag).unwrap();

        assert!(!flags.is_enabled("switched-off", Some("u1"), None, true));
    }

    #[test]
    fn test_user_and_group_membership() {
        let flags = manager();
        let mut flag = FeatureFlag::new("pilot", "", RolloutStrategy::Users);
        flag.users.insert("alice".to_string());
        flags.create_flag(flag).unwrap();

        let mut flag = FeatureFlag::new("tenants", "", RolloutStrategy::Groups);
        flag.groups.insert("legal".to_string());
        flags.create_flag(flag).unwrap();

        assert!(flags.is_enabled("pilot", Some("alice"), None, false));
        assert!(!flags.is_enabled("pilot", Some("bob"), None, false));
        assert!(!flags.is_enabled("pilot", None, None, false));
        assert!(flags.is_enabled("tenants", None, Some("legal"), false));
        assert!(!flags.is_enabled("tenants", None, Some("sales"), false));
    }

    #[test]
    fn test_percentage_deterministic() {
        let flags = manager();
        flags.create_flag(percentage_flag("ramp", 50)).unwrap();

        for user in ["alice", "bob", "carol", "dave"] {
            let first = flags.is_enabled("ramp", Some(user), None, false);
            for _ in 0..10 {
                assert_eq!(first, flags.is_enabled("ramp", Some(user), None, false));
            }
        }
    }

    #[test]
    fn test_percentage_monotonic() {
        let flags = manager();
        flags.create_flag(percentage_flag("ramp", 0)).unwrap();

        let users: Vec<String> = (0..200).map(|i| format!("user-{i}")).collect();
        let mut previously_enabled: Vec<&String> = Vec::new();
        for pct in [10, 25, 50, 75, 100] {
            flags
                .update_flag(
                    "ramp",
                    FlagUpdate {
                        percentage: Some(pct),
                        ..FlagUpdate::default()
                    },
                )
                .unwrap();
            for user in &previously_enabled {
                assert!(
                    flags.is_enabled("ramp", Some(user), None, false),
                    "raising the percentage must never disable {user}"
                );
            }
            previously_enabled = users
                .iter()
                .filter(|u| flags.is_enabled("ramp", Some(u), None, false))
                .collect();
        }
        // At 100% everyone is in.
        assert_eq!(previously_enabled.len(), users.len());
    }

    #[test]
    fn test_percentage_without_identity_uses_default() {
        let flags = manager();
        flags.create_flag(percentage_flag("ramp", 50)).unwrap();

        assert!(flags.is_enabled("ramp", None, None, true));
        assert!(!flags.is_enabled("ramp", None, None, false));
    }

    #[test]
    fn test_update_unknown_flag_is_not_found() {
        let flags = manager();
        let err = flags
            .update_flag("ghost", FlagUpdate::default())
            .unwrap_err();
        assert!(matches!(err, FlagError::NotFound(_)));
        assert!(flags.get_flag("ghost").is_none());
    }

    #[test]
    fn test_crud_persists_to_store() {
        let store = Arc::new(MemoryFlagStore::new());
        let flags = FeatureFlags::new(Arc::clone(&store) as Arc<dyn FlagStore>);
        flags
            .create_flag(FeatureFlag::new("persisted", "", RolloutStrategy::All))
            .unwrap();

        // A fresh manager over the same store sees the flag.
        let reloaded = FeatureFlags::new(store);
        assert!(reloaded.get_flag("persisted").is_some());

        reloaded.delete_flag("persisted").unwrap();
        assert!(matches!(
            reloaded.delete_flag("persisted"),
            Err(FlagError::NotFound(_))
        ));
    }

    #[test]
    fn test_store_failure_never_fails_evaluation() {
        let flags = FeatureFlags::new(Arc::new(FailingFlagStore));
        flags
            .create_flag(FeatureFlag::new("resilient", "", RolloutStrategy::All))
            .unwrap();

        // In-memory state stays authoritative despite the failing store.
        assert!(flags.is_enabled("resilient", None, None, false));
        flags
            .update_flag(
                "resilient",
                FlagUpdate {
                    enabled: Some(false),
                    ..FlagUpdate::default()
                },
            )
            .unwrap();
        assert!(!flags.is_enabled("resilient", None, None, true));
    }

    #[test]
    fn test_register_defaults_idempotent() {
        let flags = manager();
        flags.register_defaults();
        let total = flags.get_stats().total;
        assert!(total >= 6);

        // Re-registering neither duplicates nor resets.
        flags
            .update_flag(
                "enable_caching",
                FlagUpdate {
                    enabled: Some(false),
                    ..FlagUpdate::default()
                },
            )
            .unwrap();
        flags.register_defaults();
        assert_eq!(flags.get_stats().total, total);
        assert!(!flags.get_flag("enable_caching").unwrap().enabled);
    }
}
