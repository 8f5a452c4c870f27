//! Identities and trust for the remote transport.
//!
//! A [`Principal`] owns its default [`Blessings`]. A [`RemoteContext`] pairs a
//! principal with the set of roots it trusts. Contexts are values: installing
//! a root produces a new context instead of mutating shared state.

use std::sync::{Arc, RwLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::CredentialBlob;

const KEY_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("empty credential blob")]
    Empty,

    #[error("malformed credential blob: {0}")]
    Malformed(String),
}

/// Proof of identity presented during the remote handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blessings {
    name: String,
    /// Base64 of a random 32-byte key.
    key: String,
}

impl Blessings {
    /// Fresh blessings with a random key.
    pub fn self_signed(name: impl Into<String>) -> Self {
        let mut key = Vec::with_capacity(KEY_BYTES);
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self {
            name: name.into(),
            key: STANDARD.encode(key),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialize into an opaque blob for relaying.
    pub fn encode(&self) -> Result<CredentialBlob, CredentialError> {
        serde_json::to_vec(self)
            .map(CredentialBlob::new)
            .map_err(|e| CredentialError::Malformed(e.to_string()))
    }

    pub fn decode(blob: &CredentialBlob) -> Result<Self, CredentialError> {
        if blob.is_empty() {
            return Err(CredentialError::Empty);
        }
        let blessings: Blessings = serde_json::from_slice(blob.as_bytes())
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        blessings.validate()?;
        Ok(blessings)
    }

    fn validate(&self) -> Result<(), CredentialError> {
        if self.name.is_empty() {
            return Err(CredentialError::Malformed("empty blessing name".to_string()));
        }
        let key = STANDARD
            .decode(self.key.as_bytes())
            .map_err(|e| CredentialError::Malformed(format!("bad key: {e}")))?;
        if key.len() != KEY_BYTES {
            return Err(CredentialError::Malformed(format!(
                "key is {} bytes, expected {KEY_BYTES}",
                key.len()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Blessings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// An identity. Readers always see a whole blessings snapshot.
#[derive(Debug)]
pub struct Principal {
    default: RwLock<Blessings>,
}

impl Principal {
    pub fn new(blessings: Blessings) -> Arc<Self> {
        Arc::new(Self {
            default: RwLock::new(blessings),
        })
    }

    pub fn default_blessings(&self) -> Blessings {
        match self.default.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the default blessings atomically.
    pub fn set_default_blessings(&self, blessings: Blessings) {
        tracing::info!(blessings = %blessings, "Rotating default blessings");
        match self.default.write() {
            Ok(mut guard) => *guard = blessings,
            Err(poisoned) => *poisoned.into_inner() = blessings,
        }
    }
}

/// Security context for remote calls: who we are and whom we trust.
#[derive(Debug, Clone)]
pub struct RemoteContext {
    principal: Arc<Principal>,
    roots: Arc<Vec<Blessings>>,
}

impl RemoteContext {
    pub fn new(principal: Arc<Principal>) -> Self {
        Self {
            principal,
            roots: Arc::new(Vec::new()),
        }
    }

    /// New context with a freshly blessed principal named `identity`.
    pub fn init(identity: &str) -> Self {
        let ctx = Self::new(Principal::new(Blessings::self_signed(identity)));
        tracing::debug!(identity, "Initialized remote context");
        ctx
    }

    pub fn principal(&self) -> &Arc<Principal> {
        &self.principal
    }

    /// Current default blessings of the principal.
    pub fn blessings(&self) -> Blessings {
        self.principal.default_blessings()
    }

    pub fn roots(&self) -> &[Blessings] {
        &self.roots
    }

    /// Copy of this context that also trusts `root`.
    pub fn with_root(&self, root: Blessings) -> Self {
        let mut roots = self.roots.as_ref().clone();
        if !roots.contains(&root) {
            roots.push(root);
        }
        Self {
            principal: Arc::clone(&self.principal),
            roots: Arc::new(roots),
        }
    }

    /// Whether `blessings` are our own or one of our installed roots.
    pub fn trusts(&self, blessings: &Blessings) -> bool {
        *blessings == self.blessings() || self.roots.contains(blessings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip_preserves_identity() {
        let blessings = Blessings::self_signed("echo-server");
        let blob = blessings.encode().unwrap();
        let decoded = Blessings::decode(&blob).unwrap();
        assert_eq!(decoded, blessings);
        assert_eq!(decoded.name(), "echo-server");
    }

    #[test]
    fn self_signed_keys_differ() {
        assert_ne!(Blessings::self_signed("a"), Blessings::self_signed("a"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Blessings::decode(&CredentialBlob::new(Vec::new())),
            Err(CredentialError::Empty)
        ));
        assert!(matches!(
            Blessings::decode(&CredentialBlob::new(b"B1".to_vec())),
            Err(CredentialError::Malformed(_))
        ));

        let short_key = serde_json::to_vec(&serde_json::json!({"name": "x", "key": "QjE="})).unwrap();
        assert!(matches!(
            Blessings::decode(&CredentialBlob::new(short_key)),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn with_root_returns_new_context() {
        let server = Blessings::self_signed("server");
        let ctx = RemoteContext::init("client");
        assert!(!ctx.trusts(&server));

        let trusting = ctx.with_root(server.clone());
        assert!(trusting.trusts(&server));
        assert!(!ctx.trusts(&server));
        assert_eq!(trusting.roots().len(), 1);
        assert_eq!(trusting.with_root(server).roots().len(), 1);
    }

    #[test]
    fn context_trusts_itself() {
        let ctx = RemoteContext::init("self");
        assert!(ctx.trusts(&ctx.blessings()));
    }

    #[test]
    fn rotation_is_seen_by_all_contexts() {
        let ctx = RemoteContext::init("server");
        let copy = ctx.with_root(Blessings::self_signed("other"));
        let rotated = Blessings::self_signed("server-v2");

        ctx.principal().set_default_blessings(rotated.clone());
        assert_eq!(copy.blessings(), rotated);
    }
}
