//! Request-scoped claims context.
//!
//! The claims context carries the identity, role and verified claims of the
//! acting principal for exactly one operation. It is produced by the
//! authentication collaborator and treated as read-only, already-verified
//! input: the engine performs no signature or token work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Role assigned to requests without an authenticated principal.
pub const ANONYMOUS_ROLE: &str = "anon";

/// Role assigned to trusted service principals.
pub const SERVICE_ROLE: &str = "service_role";

/// Result of resolving a dotted claim path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClaimLookup<'a> {
    /// The path resolved to a value (which may itself be `Null`).
    Present(&'a Value),
    /// Some segment of the path does not exist.
    Absent,
    /// The path is syntactically invalid (empty, or has an empty segment).
    Malformed,
}

impl<'a> ClaimLookup<'a> {
    /// The resolved value, if present.
    pub fn value(self) -> Option<&'a Value> {
        match self {
            ClaimLookup::Present(v) => Some(v),
            _ => None,
        }
    }
}

/// Immutable snapshot of the acting principal for one request.
///
/// `bypass_capable` is owned by the authentication collaborator. Nothing in
/// the engine, and no policy expression, can set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimsContext {
    principal_id: String,
    role: String,
    #[serde(default)]
    claims: BTreeMap<String, Value>,
    #[serde(default)]
    bypass_capable: bool,
}

impl ClaimsContext {
    /// Create a context for an authenticated principal.
    pub fn new(principal_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            role: role.into(),
            claims: BTreeMap::new(),
            bypass_capable: false,
        }
    }

    /// Create an anonymous context with no claims.
    pub fn anonymous() -> Self {
        Self::new("", ANONYMOUS_ROLE)
    }

    /// Create a bypass-capable service context.
    pub fn service(principal_id: impl Into<String>) -> Self {
        Self::new(principal_id, SERVICE_ROLE).with_bypass(true)
    }

    /// Set a top-level claim.
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    /// Set multiple top-level claims.
    pub fn with_claims(mut self, claims: BTreeMap<String, Value>) -> Self {
        self.claims.extend(claims);
        self
    }

    /// Mark the principal as bypass-capable (or not).
    pub fn with_bypass(mut self, bypass_capable: bool) -> Self {
        self.bypass_capable = bypass_capable;
        self
    }

    /// Opaque principal identifier.
    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    /// Role tag.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Top-level claims.
    pub fn claims(&self) -> &BTreeMap<String, Value> {
        &self.claims
    }

    /// Whether the principal may skip policy evaluation on non-forced collections.
    pub fn is_bypass_capable(&self) -> bool {
        self.bypass_capable
    }

    /// Resolve a dotted claim path such as `app_metadata.org_id`.
    ///
    /// Object segments select keys, numeric segments index arrays. Walking
    /// into a scalar or a missing key yields `Absent`.
    pub fn claim_path(&self, path: &str) -> ClaimLookup<'_> {
        let mut segments = path.split('.');
        let Some(first) = segments.next().filter(|s| !s.is_empty()) else {
            return ClaimLookup::Malformed;
        };

        let mut current = match self.claims.get(first) {
            Some(v) => v,
            None => {
                // Still reject malformed tails so diagnostics are stable.
                if segments.any(str::is_empty) {
                    return ClaimLookup::Malformed;
                }
                return ClaimLookup::Absent;
            }
        };

        let mut absent = false;
        for segment in segments {
            if segment.is_empty() {
                return ClaimLookup::Malformed;
            }
            if absent {
                continue;
            }
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => absent = true,
            }
        }

        if absent {
            ClaimLookup::Absent
        } else {
            ClaimLookup::Present(current)
        }
    }
}
