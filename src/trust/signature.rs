//! Content hashing, signing and signature verification for unit directories.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::{TrustLevel, TrustRecord, TrustStore};
use crate::error::{BridgeError, BridgeResult};
use crate::manifest::Manifest;

/// The only supported signature algorithm.
pub const ALGORITHM: &str = "ed25519";

/// Contents of a unit's signature file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFile {
    pub algorithm: String,
    pub unit_id: String,
    pub version: String,
    pub signer: String,
    pub trust_level: TrustLevel,
    pub content_hash: String,
    pub signed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Base64-encoded ed25519 signature over [`SignatureFile::payload`].
    pub signature: String,
}

impl SignatureFile {
    /// Canonical bytes covered by the signature.
    pub fn payload(&self) -> String {
        format!(
            "jupiter-unit-sig-v1:{}:{}:{}:{}:{}:{}:{}",
            self.unit_id,
            self.version,
            self.content_hash,
            self.trust_level,
            self.signer,
            self.signed_at.to_rfc3339(),
            self.expires_at.map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
        )
    }
}

/// A named ed25519 signing key.
pub struct SigningIdentity {
    signer: String,
    key: SigningKey,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("signer", &self.signer)
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

impl SigningIdentity {
    /// Generate a fresh keypair.
    pub fn generate(signer: &str) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self { signer: signer.to_string(), key: SigningKey::generate(&mut rng) }
    }

    /// Restore from a base64-encoded 32-byte secret key.
    pub fn from_secret_base64(signer: &str, secret: &str) -> BridgeResult<Self> {
        let bytes = decode_base64_fixed::<32>("secret key", secret).map_err(BridgeError::Validation)?;
        Ok(Self { signer: signer.to_string(), key: SigningKey::from_bytes(&bytes) })
    }

    pub fn signer(&self) -> &str {
        &self.signer
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.key.verifying_key().to_bytes())
    }

    pub fn secret_key_base64(&self) -> String {
        BASE64.encode(self.key.to_bytes())
    }
}

/// SHA-256 over every regular file under `dir` except the signature file,
/// in sorted relative-path order. Paths are hashed with `/` separators so
/// the digest is platform independent.
pub fn content_hash(dir: &Path, signature_file: &str) -> BridgeResult<String> {
    if !dir.is_dir() {
        return Err(BridgeError::SourceNotFound(dir.to_path_buf()));
    }

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if relative == signature_file {
            continue;
        }

        let bytes = std::fs::read(entry.path())?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Sign a unit directory and write its signature file.
pub fn sign_unit(
    dir: &Path,
    manifest: &Manifest,
    identity: &SigningIdentity,
    trust_level: TrustLevel,
    expires_at: Option<DateTime<Utc>>,
) -> BridgeResult<SignatureFile> {
    let mut file = SignatureFile {
        algorithm: ALGORITHM.to_string(),
        unit_id: manifest.id.clone(),
        version: manifest.version.to_string(),
        signer: identity.signer.clone(),
        trust_level,
        content_hash: content_hash(dir, manifest.signature_file())?,
        signed_at: Utc::now(),
        expires_at,
        signature: String::new(),
    };
    let signature = identity.key.sign(file.payload().as_bytes());
    file.signature = BASE64.encode(signature.to_bytes());

    std::fs::write(dir.join(manifest.signature_file()), serde_json::to_string_pretty(&file)?)?;
    tracing::info!(unit = %manifest.id, signer = %identity.signer, level = %trust_level, "Signed unit");
    Ok(file)
}

/// Verify a unit directory against the trust store.
///
/// A unit without a signature file is `unsigned`, not an error. A signature
/// file that fails any check is a `Signature` error.
pub fn verify_unit(dir: &Path, manifest: &Manifest, store: &TrustStore) -> BridgeResult<TrustRecord> {
    let sig_path = dir.join(manifest.signature_file());
    if !sig_path.is_file() {
        return Ok(TrustRecord::unsigned());
    }

    let fail = |reason: String| BridgeError::Signature { unit: manifest.id.clone(), reason };

    let content = std::fs::read_to_string(&sig_path)?;
    let file: SignatureFile =
        serde_json::from_str(&content).map_err(|e| fail(format!("malformed signature file: {e}")))?;

    if file.algorithm != ALGORITHM {
        return Err(fail(format!("unsupported algorithm '{}'", file.algorithm)));
    }
    if file.unit_id != manifest.id || file.version != manifest.version.to_string() {
        return Err(fail(format!(
            "signature is for {} {}, not {} {}",
            file.unit_id, file.version, manifest.id, manifest.version
        )));
    }

    if store.is_signer_revoked(&file.signer) {
        return Err(fail(format!("signer '{}' has been revoked", file.signer)));
    }
    let signer = store
        .signer(&file.signer)
        .ok_or_else(|| fail(format!("unknown signer '{}'", file.signer)))?;
    if file.trust_level > signer.max_level {
        return Err(fail(format!(
            "signer '{}' may grant at most {}, signature claims {}",
            file.signer, signer.max_level, file.trust_level
        )));
    }
    if let Some(expires_at) = file.expires_at {
        if expires_at <= Utc::now() {
            return Err(fail(format!("signature expired at {expires_at}")));
        }
    }

    let actual = content_hash(dir, manifest.signature_file())?;
    if actual != file.content_hash.trim().to_ascii_lowercase() {
        return Err(fail("content hash mismatch".to_string()));
    }
    if store.is_hash_revoked(&actual) {
        return Err(fail("content hash has been revoked".to_string()));
    }

    verify_ed25519_signature(file.payload().as_bytes(), &file.signature, &signer.public_key)
        .map_err(fail)?;

    tracing::debug!(unit = %manifest.id, signer = %file.signer, level = %file.trust_level, "Signature verified");
    Ok(TrustRecord {
        algorithm: Some(file.algorithm),
        signer: Some(file.signer),
        trust_level: file.trust_level,
        content_hash: Some(actual),
        signed_at: Some(file.signed_at),
        expires_at: file.expires_at,
        verified: true,
    })
}

fn verify_ed25519_signature(
    message: &[u8],
    signature_base64: &str,
    public_key_base64: &str,
) -> Result<(), String> {
    let verifying_key = decode_verifying_key(public_key_base64)?;
    let signature_bytes = decode_base64_fixed::<64>("signature", signature_base64)?;
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key
        .verify_strict(message, &signature)
        .map_err(|error| format!("invalid ed25519 signature: {error}"))
}

pub(super) fn decode_verifying_key(public_key_base64: &str) -> Result<VerifyingKey, String> {
    let bytes = decode_base64_fixed::<32>("public key", public_key_base64)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| format!("invalid ed25519 public key: {e}"))
}

fn decode_base64_fixed<const N: usize>(label: &str, value: &str) -> Result<[u8; N], String> {
    let decoded = BASE64
        .decode(value.trim())
        .map_err(|e| format!("failed to decode {label} from base64: {e}"))?;
    decoded.try_into().map_err(|_| format!("{label} must decode to {N} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnitType;
    use tempfile::TempDir;

    fn unit_dir() -> (TempDir, Manifest) {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("plugin.toml"),
            "id = \"acme.signed\"\nversion = \"1.0.0\"\ntype = \"tool\"\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib").join("main.txt"), b"hello plugin").unwrap();
        let manifest = Manifest::builder("acme.signed", "1.0.0", UnitType::Tool).build().unwrap();
        (dir, manifest)
    }

    fn store_with(identity: &SigningIdentity, max: TrustLevel) -> TrustStore {
        let mut store = TrustStore::default();
        store.add_signer(identity.signer(), &identity.public_key_base64(), max).unwrap();
        store
    }

    #[test]
    fn test_sign_then_verify() {
        let (dir, manifest) = unit_dir();
        let identity = SigningIdentity::generate("jupiter");
        let store = store_with(&identity, TrustLevel::Official);

        sign_unit(dir.path(), &manifest, &identity, TrustLevel::Official, None).unwrap();
        let record = verify_unit(dir.path(), &manifest, &store).unwrap();

        assert!(record.verified);
        assert_eq!(record.trust_level, TrustLevel::Official);
        assert_eq!(record.signer.as_deref(), Some("jupiter"));
    }

    #[test]
    fn test_one_byte_corruption_fails() {
        let (dir, manifest) = unit_dir();
        let identity = SigningIdentity::generate("jupiter");
        let store = store_with(&identity, TrustLevel::Official);
        sign_unit(dir.path(), &manifest, &identity, TrustLevel::Official, None).unwrap();

        let target = dir.path().join("lib").join("main.txt");
        let mut bytes = std::fs::read(&target).unwrap();
        bytes[0] ^= 0x01;
        std::fs::write(&target, bytes).unwrap();

        let err = verify_unit(dir.path(), &manifest, &store).unwrap_err();
        assert!(matches!(err, BridgeError::Signature { .. }));
    }

    #[test]
    fn test_unsigned_when_no_signature_file() {
        let (dir, manifest) = unit_dir();
        let record = verify_unit(dir.path(), &manifest, &TrustStore::default()).unwrap();
        assert_eq!(record.trust_level, TrustLevel::Unsigned);
        assert!(!record.verified);
    }

    #[test]
    fn test_unknown_and_revoked_signers() {
        let (dir, manifest) = unit_dir();
        let identity = SigningIdentity::generate("acme");
        sign_unit(dir.path(), &manifest, &identity, TrustLevel::Community, None).unwrap();

        let err = verify_unit(dir.path(), &manifest, &TrustStore::default()).unwrap_err();
        assert!(err.to_string().contains("unknown signer"));

        let mut store = store_with(&identity, TrustLevel::Community);
        assert!(verify_unit(dir.path(), &manifest, &store).is_ok());
        store.revoke_signer("acme");
        let err = verify_unit(dir.path(), &manifest, &store).unwrap_err();
        assert!(err.to_string().contains("revoked"));
    }

    #[test]
    fn test_signer_cannot_exceed_max_level() {
        let (dir, manifest) = unit_dir();
        let identity = SigningIdentity::generate("community-dev");
        let store = store_with(&identity, TrustLevel::Community);
        sign_unit(dir.path(), &manifest, &identity, TrustLevel::Official, None).unwrap();

        let err = verify_unit(dir.path(), &manifest, &store).unwrap_err();
        assert!(err.to_string().contains("at most community"));
    }

    #[test]
    fn test_expired_signature() {
        let (dir, manifest) = unit_dir();
        let identity = SigningIdentity::generate("jupiter");
        let store = store_with(&identity, TrustLevel::Official);
        let past = Utc::now() - chrono::Duration::hours(1);
        sign_unit(dir.path(), &manifest, &identity, TrustLevel::Verified, Some(past)).unwrap();

        let err = verify_unit(dir.path(), &manifest, &store).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_hash_ignores_signature_file_and_tracks_paths() {
        let (dir, _) = unit_dir();
        let before = content_hash(dir.path(), "plugin.sig").unwrap();
        std::fs::write(dir.path().join("plugin.sig"), "{}").unwrap();
        assert_eq!(content_hash(dir.path(), "plugin.sig").unwrap(), before);

        std::fs::rename(dir.path().join("lib").join("main.txt"), dir.path().join("lib").join("other.txt"))
            .unwrap();
        assert_ne!(content_hash(dir.path(), "plugin.sig").unwrap(), before);
    }

    #[test]
    fn test_identity_round_trip() {
        let identity = SigningIdentity::generate("acme");
        let restored = SigningIdentity::from_secret_base64("acme", &identity.secret_key_base64()).unwrap();
        assert_eq!(restored.public_key_base64(), identity.public_key_base64());
    }
}
