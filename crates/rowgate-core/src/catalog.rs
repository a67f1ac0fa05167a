//! Persistent policy catalog.
//!
//! Persists policies and enforcement modes using sled so a policy set can be
//! reloaded into a [`PolicyStore`] across restarts. Policies are stored in
//! their text form; loading re-parses and re-validates every policy.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::CatalogError;
use crate::policy::{Command, Policy, PolicyDef};
use crate::store::{check_mode_target, EnforcementMode, PolicyBundle, PolicyStore};

const CATALOG_TREE_NAME: &[u8] = b"security:policies";
const POLICY_PREFIX: &[u8] = b"policy:";
const MODE_PREFIX: &[u8] = b"mode:";

/// Sled-backed store of policy definitions and modes.
pub struct PolicyCatalog {
    db: sled::Db,
    tree: sled::Tree,
}

impl PolicyCatalog {
    /// Open the catalog tree in a database.
    pub fn open(db: &sled::Db) -> Result<Self, CatalogError> {
        let tree = db.open_tree(CATALOG_TREE_NAME)?;
        Ok(Self {
            db: db.clone(),
            tree,
        })
    }

    /// Save a policy. A policy with the same collection, command and name
    /// is overwritten and keeps its position.
    pub fn put_policy(&self, policy: &Policy) -> Result<(), CatalogError> {
        policy.validate()?;
        let key = match self.find(&policy.collection, policy.command, &policy.name)? {
            Some(key) => key,
            None => self.next_policy_key(&policy.collection)?,
        };
        self.tree.insert(key, Self::serialize_policy(policy)?)?;
        Ok(())
    }

    /// Remove a policy. Returns whether it existed.
    pub fn remove_policy(
        &self,
        collection: &str,
        command: Command,
        name: &str,
    ) -> Result<bool, CatalogError> {
        match self.find(collection, command, name)? {
            Some(key) => Ok(self.tree.remove(key)?.is_some()),
            None => Ok(false),
        }
    }

    /// Save the enforcement mode of a collection.
    pub fn set_mode(&self, collection: &str, mode: EnforcementMode) -> Result<(), CatalogError> {
        check_mode_target(collection)?;
        self.tree
            .insert(Self::mode_key(collection), Self::serialize_mode(mode)?)?;
        Ok(())
    }

    /// Remove a collection's policies and mode.
    pub fn drop_collection(&self, collection: &str) -> Result<bool, CatalogError> {
        let mut batch = sled::Batch::default();
        let mut removed = false;
        for (key, def) in self.scan_collection(collection)? {
            if def.collection == collection {
                batch.remove(key);
                removed = true;
            }
        }
        if self.tree.contains_key(Self::mode_key(collection))? {
            batch.remove(Self::mode_key(collection));
            removed = true;
        }
        self.tree.apply_batch(batch)?;
        Ok(removed)
    }

    /// All policies, grouped by collection in registration order.
    pub fn policies(&self) -> Result<Vec<Policy>, CatalogError> {
        let mut policies = Vec::new();
        for result in self.tree.scan_prefix(POLICY_PREFIX) {
            let (_, value) = result?;
            let def = Self::deserialize_def(&value)?;
            policies.push(Policy::try_from(def)?);
        }
        Ok(policies)
    }

    /// Explicit modes by collection.
    pub fn modes(&self) -> Result<BTreeMap<String, EnforcementMode>, CatalogError> {
        let mut modes = BTreeMap::new();
        for result in self.tree.scan_prefix(MODE_PREFIX) {
            let (key, value) = result?;
            let collection = String::from_utf8_lossy(&key[MODE_PREFIX.len()..]).into_owned();
            let mode: EnforcementMode = serde_json::from_slice(&value).map_err(|e| {
                CatalogError::Serialization(format!("deserialization error: {}", e))
            })?;
            modes.insert(collection, mode);
        }
        Ok(modes)
    }

    /// Everything in the catalog as a bundle.
    pub fn to_bundle(&self) -> Result<PolicyBundle, CatalogError> {
        Ok(PolicyBundle {
            modes: self.modes()?,
            policies: self.policies()?.into_iter().map(PolicyDef::from).collect(),
        })
    }

    /// Persist a bundle in one batch. Every policy and mode is validated
    /// before anything is written.
    pub fn import(&self, bundle: &PolicyBundle) -> Result<usize, CatalogError> {
        let policies = bundle
            .policies
            .iter()
            .cloned()
            .map(Policy::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        for policy in &policies {
            policy.validate()?;
        }
        for collection in bundle.modes.keys() {
            check_mode_target(collection)?;
        }

        let mut batch = sled::Batch::default();
        let mut staged: Vec<(&Policy, sled::IVec)> = Vec::with_capacity(policies.len());
        for policy in &policies {
            let staged_key = staged
                .iter()
                .find(|(p, _)| {
                    p.collection == policy.collection
                        && p.command == policy.command
                        && p.name == policy.name
                })
                .map(|(_, key)| key.clone());
            let key = match staged_key {
                Some(key) => key,
                None => match self.find(&policy.collection, policy.command, &policy.name)? {
                    Some(key) => key,
                    None => self.next_policy_key(&policy.collection)?,
                },
            };
            batch.insert(key.clone(), Self::serialize_policy(policy)?);
            staged.push((policy, key));
        }
        for (collection, mode) in &bundle.modes {
            batch.insert(Self::mode_key(collection), Self::serialize_mode(*mode)?);
        }
        self.tree.apply_batch(batch)?;

        info!(policies = policies.len(), modes = bundle.modes.len(), "Imported policy bundle");
        Ok(policies.len())
    }

    /// Register every stored policy and mode in a store, atomically.
    pub fn load_into(&self, store: &PolicyStore) -> Result<usize, CatalogError> {
        let bundle = self.to_bundle()?;
        let count = bundle.policies.len();
        store.load_bundle(bundle)?;
        Ok(count)
    }

    /// Remove everything.
    pub fn clear(&self) -> Result<(), CatalogError> {
        self.tree.clear()?;
        Ok(())
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), CatalogError> {
        self.tree.flush()?;
        Ok(())
    }

    fn find(
        &self,
        collection: &str,
        command: Command,
        name: &str,
    ) -> Result<Option<sled::IVec>, CatalogError> {
        Ok(self
            .scan_collection(collection)?
            .into_iter()
            .find(|(_, def)| def.collection == collection && def.command == command && def.name == name)
            .map(|(key, _)| key))
    }

    fn scan_collection(&self, collection: &str) -> Result<Vec<(sled::IVec, PolicyDef)>, CatalogError> {
        let mut out = Vec::new();
        for result in self.tree.scan_prefix(Self::policy_prefix(collection)) {
            let (key, value) = result?;
            out.push((key, Self::deserialize_def(&value)?));
        }
        Ok(out)
    }

    fn next_policy_key(&self, collection: &str) -> Result<sled::IVec, CatalogError> {
        let seq = self.db.generate_id()?;
        let mut key = Self::policy_prefix(collection);
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key.into())
    }

    fn policy_prefix(collection: &str) -> Vec<u8> {
        let mut key = POLICY_PREFIX.to_vec();
        key.extend_from_slice(collection.as_bytes());
        key.push(b':');
        key
    }

    fn mode_key(collection: &str) -> Vec<u8> {
        let mut key = MODE_PREFIX.to_vec();
        key.extend_from_slice(collection.as_bytes());
        key
    }

    fn serialize_policy(policy: &Policy) -> Result<Vec<u8>, CatalogError> {
        serde_json::to_vec(&PolicyDef::from(policy.clone()))
            .map_err(|e| CatalogError::Serialization(format!("serialization error: {}", e)))
    }

    fn serialize_mode(mode: EnforcementMode) -> Result<Vec<u8>, CatalogError> {
        serde_json::to_vec(&mode)
            .map_err(|e| CatalogError::Serialization(format!("serialization error: {}", e)))
    }

    fn deserialize_def(bytes: &[u8]) -> Result<PolicyDef, CatalogError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CatalogError::Serialization(format!("deserialization error: {}", e)))
    }
}
