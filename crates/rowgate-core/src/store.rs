//! Registered policies and per-collection enforcement modes.
//!
//! The store publishes immutable, versioned snapshots. Every mutation copies
//! the current snapshot, applies the change and swaps the new snapshot in, so
//! readers holding an older snapshot never see a partially applied change.
//! Writers are serialized; readers only take a read lock long enough to clone
//! an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::ConfigurationError;
use crate::policy::{Command, Policy, PolicyDef};

/// Row-level enforcement mode of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Policies apply, except to bypass-capable principals.
    #[default]
    #[serde(alias = "ENABLED")]
    Enabled,
    /// Policies are not evaluated.
    #[serde(alias = "DISABLED")]
    Disabled,
    /// Policies apply to every principal, including bypass-capable ones.
    #[serde(alias = "FORCED")]
    Forced,
}

impl EnforcementMode {
    /// Check if policies are evaluated at all in this mode.
    pub fn enforces(self) -> bool {
        self != EnforcementMode::Disabled
    }

    /// Keyword form.
    pub fn as_str(self) -> &'static str {
        match self {
            EnforcementMode::Enabled => "ENABLED",
            EnforcementMode::Disabled => "DISABLED",
            EnforcementMode::Forced => "FORCED",
        }
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnforcementMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enabled" => Ok(EnforcementMode::Enabled),
            "disabled" => Ok(EnforcementMode::Disabled),
            "forced" => Ok(EnforcementMode::Forced),
            _ => Err(ConfigurationError::UnknownMode(s.to_string())),
        }
    }
}

/// Advisory notice that a command on a collection denies everything because
/// enforcement is on and no policy exists for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutWarning {
    /// Locked collection.
    pub collection: String,
    /// Locked command.
    pub command: Command,
}

impl fmt::Display for LockoutWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row-level security is enforced on '{}' but no policy exists for {}; every {} is denied",
            self.collection, self.command, self.command
        )
    }
}

/// Serializable set of policies and modes, loaded atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBundle {
    /// Enforcement mode per collection.
    #[serde(default)]
    pub modes: BTreeMap<String, EnforcementMode>,
    /// Policies in registration order.
    #[serde(default)]
    pub policies: Vec<PolicyDef>,
}

/// Immutable view of the registered policies at one version.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    version: u64,
    policies: BTreeMap<String, Vec<Arc<Policy>>>,
    modes: BTreeMap<String, EnforcementMode>,
}

impl PolicySnapshot {
    /// Version number; increases with every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Policies for a command and role, in registration order.
    ///
    /// Includes policies registered for `ALL`. A policy without roles applies
    /// to every role.
    pub fn policies_for(&self, collection: &str, command: Command, role: &str) -> Vec<Arc<Policy>> {
        self.policies(collection)
            .iter()
            .filter(|p| p.applies_to(command, role))
            .cloned()
            .collect()
    }

    /// Every policy on a collection, in registration order.
    pub fn policies(&self, collection: &str) -> &[Arc<Policy>] {
        self.policies
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Check if any policy, for any role, covers a command.
    pub fn has_policies(&self, collection: &str, command: Command) -> bool {
        self.policies(collection)
            .iter()
            .any(|p| p.command.covers(command))
    }

    /// Mode set explicitly on a collection, if any.
    pub fn explicit_mode(&self, collection: &str) -> Option<EnforcementMode> {
        self.modes.get(collection).copied()
    }

    /// Effective mode, falling back to `default` when none was set.
    pub fn mode(&self, collection: &str, default: EnforcementMode) -> EnforcementMode {
        self.explicit_mode(collection).unwrap_or(default)
    }

    /// Every collection that has policies or an explicit mode, sorted.
    pub fn collections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .policies
            .keys()
            .chain(self.modes.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Explicit modes, by collection.
    pub fn modes(&self) -> &BTreeMap<String, EnforcementMode> {
        &self.modes
    }

    /// Total number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.values().map(Vec::len).sum()
    }

    /// Check if no policy is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commands locked out on known collections.
    pub fn lockouts(&self, default: EnforcementMode) -> Vec<LockoutWarning> {
        let mut out = Vec::new();
        for collection in self.collections() {
            if !self.mode(collection, default).enforces() {
                continue;
            }
            for command in Command::CONCRETE {
                if !self.has_policies(collection, command) {
                    out.push(LockoutWarning {
                        collection: collection.to_string(),
                        command,
                    });
                }
            }
        }
        out
    }

    /// Export as a bundle in text form.
    pub fn to_bundle(&self) -> PolicyBundle {
        PolicyBundle {
            modes: self.modes.clone(),
            policies: self
                .policies
                .values()
                .flatten()
                .map(|p| PolicyDef::from(Policy::clone(p)))
                .collect(),
        }
    }

    fn insert(&mut self, policy: Policy) -> bool {
        let list = self.policies.entry(policy.collection.clone()).or_default();
        let existing = list
            .iter()
            .position(|p| p.command == policy.command && p.name == policy.name);
        match existing {
            Some(index) => {
                list[index] = Arc::new(policy);
                true
            }
            None => {
                list.push(Arc::new(policy));
                false
            }
        }
    }

    fn remove(&mut self, collection: &str, command: Command, name: &str) -> bool {
        let Some(list) = self.policies.get_mut(collection) else {
            return false;
        };
        let before = list.len();
        list.retain(|p| !(p.command == command && p.name == name));
        let removed = list.len() != before;
        if list.is_empty() {
            self.policies.remove(collection);
        }
        removed
    }
}

/// Reject an enforcement mode keyed by a blank collection name.
pub(crate) fn check_mode_target(collection: &str) -> Result<(), ConfigurationError> {
    if collection.trim().is_empty() {
        return Err(ConfigurationError::Invalid(format!(
            "enforcement mode set on an invalid collection name '{}'",
            collection
        )));
    }
    Ok(())
}

/// Thread-safe, copy-on-write policy registry.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
    writer: Mutex<()>,
    config: EngineConfig,
}

impl PolicyStore {
    /// Create an empty store with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an empty store.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(PolicySnapshot::default())),
            writer: Mutex::new(()),
            config,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current snapshot. Hold it for the duration of one decision.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Register a policy, replacing one with the same collection, command
    /// and name in place.
    pub fn register(&self, policy: Policy) -> Result<(), ConfigurationError> {
        self.check(&policy)?;
        self.mutate(|snapshot| {
            Self::apply(snapshot, policy);
            Ok(())
        })
    }

    /// Policies for a command and role, in registration order.
    pub fn policies_for(&self, collection: &str, command: Command, role: &str) -> Vec<Arc<Policy>> {
        self.snapshot().policies_for(collection, command, role)
    }

    /// Remove a policy. Returns whether it existed.
    pub fn drop_policy(&self, collection: &str, command: Command, name: &str) -> bool {
        let removed = self
            .mutate(|snapshot| Ok(snapshot.remove(collection, command, name)))
            .unwrap_or(false);
        if removed {
            info!(collection = %collection, command = %command, policy = %name, "Dropped policy");
        }
        removed
    }

    /// Set the enforcement mode of a collection.
    pub fn set_mode(&self, collection: &str, mode: EnforcementMode) -> Result<(), ConfigurationError> {
        check_mode_target(collection)?;
        self.mutate(|snapshot| {
            snapshot.modes.insert(collection.to_string(), mode);
            Ok(())
        })?;
        info!(collection = %collection, mode = %mode, "Set enforcement mode");
        Ok(())
    }

    /// Effective enforcement mode of a collection.
    pub fn mode(&self, collection: &str) -> EnforcementMode {
        self.snapshot().mode(collection, self.config.default_mode)
    }

    /// Remove a collection's policies and mode together.
    pub fn drop_collection(&self, collection: &str) -> bool {
        let removed = self
            .mutate(|snapshot| {
                let policies = snapshot.policies.remove(collection).is_some();
                let mode = snapshot.modes.remove(collection).is_some();
                Ok(policies || mode)
            })
            .unwrap_or(false);
        if removed {
            info!(collection = %collection, "Dropped collection policies");
        }
        removed
    }

    /// Commands currently locked out on known collections.
    pub fn lockouts(&self) -> Vec<LockoutWarning> {
        self.snapshot().lockouts(self.config.default_mode)
    }

    /// Register a bundle atomically. On any error nothing is applied.
    pub fn load_bundle(&self, bundle: PolicyBundle) -> Result<(), ConfigurationError> {
        let policies = bundle
            .policies
            .into_iter()
            .map(Policy::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        for policy in &policies {
            self.check(policy)?;
        }
        for collection in bundle.modes.keys() {
            check_mode_target(collection)?;
        }

        let count = policies.len();
        self.mutate(|snapshot| {
            for policy in policies {
                Self::apply(snapshot, policy);
            }
            snapshot.modes.extend(bundle.modes);
            Ok(())
        })?;
        info!(policies = count, "Loaded policy bundle");
        Ok(())
    }

    /// Export the current policies and modes.
    pub fn export(&self) -> PolicyBundle {
        self.snapshot().to_bundle()
    }

    fn check(&self, policy: &Policy) -> Result<(), ConfigurationError> {
        policy.validate()?;
        for root in policy.claim_roots() {
            if self.config.is_untrusted_root(&root) {
                warn!(
                    collection = %policy.collection,
                    policy = %policy.name,
                    claim_root = %root,
                    "Policy references a self-editable claim; do not base trust decisions on it"
                );
            }
        }
        Ok(())
    }

    fn apply(snapshot: &mut PolicySnapshot, policy: Policy) {
        let collection = policy.collection.clone();
        let command = policy.command;
        let name = policy.name.clone();
        if snapshot.insert(policy) {
            info!(collection = %collection, command = %command, policy = %name, "Replaced policy");
        } else {
            info!(collection = %collection, command = %command, policy = %name, "Registered policy");
        }
    }

    /// Copy the current snapshot, apply `f`, and publish the result if `f`
    /// succeeds.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut PolicySnapshot) -> Result<R, ConfigurationError>,
    ) -> Result<R, ConfigurationError> {
        let _writer = self.writer.lock();
        let mut next = PolicySnapshot::clone(&self.current.read());
        let result = f(&mut next)?;
        next.version += 1;
        *self.current.write() = Arc::new(next);
        Ok(result)
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn owner_policy(name: &str) -> Policy {
        Policy::new(name, "projects", Command::Select)
            .using(Expr::eq(Expr::column("owner_id"), Expr::claim("sub")))
    }

    #[test]
    fn test_register_and_lookup() {
        let store = PolicyStore::new();
        store.register(owner_policy("owner_can_read")).unwrap();

        let found = store.policies_for("projects", Command::Select, "authenticated");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "owner_can_read");
        assert!(store.policies_for("projects", Command::Delete, "authenticated").is_empty());
        assert!(store.policies_for("tasks", Command::Select, "authenticated").is_empty());
    }

    #[test]
    fn test_debug_shows_current_snapshot() {
        let store = PolicyStore::new();
        store.register(owner_policy("owner_can_read")).unwrap();
        let rendered = format!("{:?}", store);
        assert!(rendered.contains("PolicyStore"));
        assert!(rendered.contains("owner_can_read"));
    }

    #[test]
    fn test_role_filtering() {
        let store = PolicyStore::new();
        store
            .register(owner_policy("staff_only").for_role("staff"))
            .unwrap();

        assert_eq!(store.policies_for("projects", Command::Select, "staff").len(), 1);
        assert!(store.policies_for("projects", Command::Select, "anon").is_empty());
    }

    #[test]
    fn test_insertion_order_and_all_command() {
        let store = PolicyStore::new();
        store.register(owner_policy("first")).unwrap();
        store
            .register(Policy::new("second", "projects", Command::All))
            .unwrap();
        store.register(owner_policy("third")).unwrap();

        let names: Vec<_> = store
            .policies_for("projects", Command::Select, "r")
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);

        let names: Vec<_> = store
            .policies_for("projects", Command::Insert, "r")
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["second"]);
    }

    #[test]
    fn test_register_replaces_in_place() {
        let store = PolicyStore::new();
        store.register(owner_policy("a")).unwrap();
        store.register(owner_policy("b")).unwrap();
        store.register(owner_policy("a").restrictive()).unwrap();

        let policies = store.policies_for("projects", Command::Select, "r");
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].name, "a");
        assert!(policies[0].is_restrictive());
    }

    #[test]
    fn test_register_rejects_invalid() {
        let store = PolicyStore::new();
        let before = store.snapshot().version();
        let err = store.register(Policy::new("p", "projects", Command::Insert));
        assert!(matches!(err, Err(ConfigurationError::MissingExpression { .. })));
        assert_eq!(store.snapshot().version(), before);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = PolicyStore::new();
        store.register(owner_policy("a")).unwrap();
        let held = store.snapshot();

        store.register(owner_policy("b")).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(store.snapshot().len(), 2);
        assert!(store.snapshot().version() > held.version());
    }

    #[test]
    fn test_drop_policy() {
        let store = PolicyStore::new();
        store.register(owner_policy("a")).unwrap();
        assert!(!store.drop_policy("projects", Command::Delete, "a"));
        assert!(store.drop_policy("projects", Command::Select, "a"));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_modes() {
        let store = PolicyStore::new();
        assert_eq!(store.mode("projects"), EnforcementMode::Enabled);
        store.set_mode("projects", EnforcementMode::Forced).unwrap();
        assert_eq!(store.mode("projects"), EnforcementMode::Forced);
        assert!(store.set_mode("", EnforcementMode::Disabled).is_err());

        let relaxed = PolicyStore::with_config(
            EngineConfig::new().with_default_mode(EnforcementMode::Disabled),
        );
        assert_eq!(relaxed.mode("projects"), EnforcementMode::Disabled);
    }

    #[test]
    fn test_drop_collection() {
        let store = PolicyStore::new();
        store.register(owner_policy("a")).unwrap();
        store.set_mode("projects", EnforcementMode::Forced).unwrap();

        assert!(store.drop_collection("projects"));
        assert!(store.snapshot().is_empty());
        assert_eq!(store.snapshot().explicit_mode("projects"), None);
        assert!(!store.drop_collection("projects"));
    }

    #[test]
    fn test_lockouts() {
        let store = PolicyStore::new();
        store.register(owner_policy("a")).unwrap();
        store.set_mode("audit", EnforcementMode::Disabled).unwrap();

        let lockouts = store.lockouts();
        let commands: Vec<_> = lockouts.iter().map(|l| l.command).collect();
        assert_eq!(
            commands,
            vec![Command::Insert, Command::Update, Command::Delete]
        );
        assert!(lockouts.iter().all(|l| l.collection == "projects"));
        assert!(lockouts[0].to_string().contains("INSERT"));
    }

    #[test]
    fn test_load_bundle_is_atomic() {
        let store = PolicyStore::new();
        let bundle: PolicyBundle = serde_json::from_str(
            r#"{
                "modes": {"projects": "forced"},
                "policies": [
                    {"name": "ok", "collection": "projects", "command": "SELECT", "using": "true"},
                    {"name": "bad", "collection": "projects", "command": "INSERT"}
                ]
            }"#,
        )
        .unwrap();
        assert!(store.load_bundle(bundle).is_err());
        assert!(store.snapshot().is_empty());
        assert_eq!(store.snapshot().explicit_mode("projects"), None);

        let bundle: PolicyBundle = serde_json::from_str(
            r#"{
                "modes": {"projects": "forced"},
                "policies": [
                    {"name": "ok", "collection": "projects", "command": "SELECT", "using": "true"}
                ]
            }"#,
        )
        .unwrap();
        store.load_bundle(bundle).unwrap();
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.mode("projects"), EnforcementMode::Forced);

        let exported = store.export();
        assert_eq!(exported.policies[0].using.as_deref(), Some("true"));
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let store = Arc::new(PolicyStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..100 {
                    store.register(owner_policy(&format!("p{}", i))).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let snapshot = store.snapshot();
                        // A snapshot's contents match its version.
                        assert_eq!(snapshot.len() as u64, snapshot.version());
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.snapshot().len(), 100);
    }
}
