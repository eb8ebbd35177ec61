//! Trust levels, the signer trust store, and the install-time trust policy.

mod signature;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use signature::{content_hash, sign_unit, verify_unit, SignatureFile, SigningIdentity, ALGORITHM};

use crate::error::{BridgeError, BridgeResult};

/// Ordered trust classification. Declared lowest first so the derived
/// ordering gives `Official > Verified > Community > Unsigned > Experimental`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Experimental,
    Unsigned,
    Community,
    Verified,
    Official,
}

impl Default for TrustLevel {
    fn default() -> Self {
        Self::Unsigned
    }
}

impl TrustLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Experimental => "experimental",
            Self::Unsigned => "unsigned",
            Self::Community => "community",
            Self::Verified => "verified",
            Self::Official => "official",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "experimental" => Some(Self::Experimental),
            "unsigned" => Some(Self::Unsigned),
            "community" => Some(Self::Community),
            "verified" => Some(Self::Verified),
            "official" => Some(Self::Official),
            _ => None,
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of signature verification for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    pub trust_level: TrustLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub verified: bool,
}

impl TrustRecord {
    /// Record for a unit without a signature.
    pub fn unsigned() -> Self {
        Self {
            algorithm: None,
            signer: None,
            trust_level: TrustLevel::Unsigned,
            content_hash: None,
            signed_at: None,
            expires_at: None,
            verified: false,
        }
    }

    /// Record for a hard-registered core unit, trusted by construction.
    pub fn builtin() -> Self {
        Self { trust_level: TrustLevel::Official, verified: true, ..Self::unsigned() }
    }
}

impl Default for TrustRecord {
    fn default() -> Self {
        Self::unsigned()
    }
}

/// A signer the host trusts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedSigner {
    pub id: String,
    /// Base64-encoded ed25519 public key.
    pub public_key: String,
    /// Highest level this signer may grant.
    pub max_level: TrustLevel,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Known signers and revocations, stored as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustStore {
    #[serde(default)]
    pub signers: BTreeMap<String, TrustedSigner>,

    /// Signer ids whose signatures are no longer accepted.
    #[serde(default)]
    pub revoked_signers: BTreeSet<String>,

    /// Content hashes that are refused regardless of signer.
    #[serde(default)]
    pub revoked_hashes: BTreeSet<String>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl TrustStore {
    /// Load the store from `path`, or an empty store bound to it if absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut store = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Self>(&content)?
        } else {
            Self::default()
        };
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Save to the path the store was loaded from. In-memory stores are a no-op.
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Default location: `~/.config/jupiter/trust.json`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("jupiter").join("trust.json"))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Trust a signer's public key up to `max_level`.
    pub fn add_signer(&mut self, id: &str, public_key: &str, max_level: TrustLevel) -> BridgeResult<()> {
        signature::decode_verifying_key(public_key)
            .map_err(|reason| BridgeError::Validation(format!("signer '{id}': {reason}")))?;
        self.revoked_signers.remove(id);
        self.signers.insert(
            id.to_string(),
            TrustedSigner {
                id: id.to_string(),
                public_key: public_key.trim().to_string(),
                max_level,
                added_at: Utc::now(),
                description: None,
            },
        );
        Ok(())
    }

    pub fn remove_signer(&mut self, id: &str) -> bool {
        self.signers.remove(id).is_some()
    }

    pub fn revoke_signer(&mut self, id: &str) {
        self.revoked_signers.insert(id.to_string());
    }

    pub fn revoke_hash(&mut self, content_hash: &str) {
        self.revoked_hashes.insert(content_hash.trim().to_ascii_lowercase());
    }

    pub fn signer(&self, id: &str) -> Option<&TrustedSigner> {
        self.signers.get(id)
    }

    pub fn is_signer_revoked(&self, id: &str) -> bool {
        self.revoked_signers.contains(id)
    }

    pub fn is_hash_revoked(&self, content_hash: &str) -> bool {
        self.revoked_hashes.contains(&content_hash.trim().to_ascii_lowercase())
    }
}

/// Install-time trust requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    pub min_level: TrustLevel,
    /// Unverified units need operator confirmation outside dev mode.
    pub require_confirmation: bool,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self { min_level: TrustLevel::Unsigned, require_confirmation: true }
    }
}

impl TrustPolicy {
    /// Decide whether a unit with this trust record may be installed.
    pub fn check_install(
        &self,
        unit_id: &str,
        record: &TrustRecord,
        dev_mode: bool,
        confirmed: bool,
    ) -> BridgeResult<()> {
        if dev_mode {
            tracing::debug!(unit = %unit_id, level = %record.trust_level, "Dev mode, skipping trust policy");
            return Ok(());
        }

        if record.trust_level < self.min_level {
            return Err(BridgeError::InsufficientTrust {
                unit: unit_id.to_string(),
                actual: record.trust_level.to_string(),
                required: self.min_level.to_string(),
            });
        }

        if !record.verified && self.require_confirmation && !confirmed {
            return Err(BridgeError::Signature {
                unit: unit_id.to_string(),
                reason: "unsigned unit requires operator confirmation".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_level_ordering() {
        assert!(TrustLevel::Official > TrustLevel::Verified);
        assert!(TrustLevel::Verified > TrustLevel::Community);
        assert!(TrustLevel::Community > TrustLevel::Unsigned);
        assert!(TrustLevel::Unsigned > TrustLevel::Experimental);
        assert_eq!(TrustLevel::default(), TrustLevel::Unsigned);
        assert_eq!(TrustLevel::parse("OFFICIAL"), Some(TrustLevel::Official));
    }

    #[test]
    fn test_store_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trust.json");
        let identity = SigningIdentity::generate("acme");

        let mut store = TrustStore::load(&path).unwrap();
        store.add_signer("acme", &identity.public_key_base64(), TrustLevel::Verified).unwrap();
        store.revoke_hash("ABCDEF");
        store.save().unwrap();

        let loaded = TrustStore::load(&path).unwrap();
        assert_eq!(loaded.signer("acme").unwrap().max_level, TrustLevel::Verified);
        assert!(loaded.is_hash_revoked("abcdef"));
        assert!(!loaded.is_signer_revoked("acme"));
    }

    #[test]
    fn test_add_signer_rejects_bad_key() {
        let mut store = TrustStore::default();
        assert!(store.add_signer("bad", "not-base64!", TrustLevel::Community).is_err());
        assert!(store.add_signer("short", "AAAA", TrustLevel::Community).is_err());
    }

    #[test]
    fn test_install_policy() {
        let policy = TrustPolicy { min_level: TrustLevel::Community, require_confirmation: true };
        let unsigned = TrustRecord::unsigned();

        let err = policy.check_install("acme.x", &unsigned, false, true).unwrap_err();
        assert!(matches!(err, BridgeError::InsufficientTrust { .. }));
        assert!(policy.check_install("acme.x", &unsigned, true, false).is_ok());

        let lenient = TrustPolicy::default();
        assert!(matches!(
            lenient.check_install("acme.x", &unsigned, false, false),
            Err(BridgeError::Signature { .. })
        ));
        assert!(lenient.check_install("acme.x", &unsigned, false, true).is_ok());

        let signed = TrustRecord { trust_level: TrustLevel::Verified, verified: true, ..TrustRecord::unsigned() };
        assert!(policy.check_install("acme.x", &signed, false, false).is_ok());
    }
}
