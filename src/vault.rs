//! Encrypted-at-rest storage for sandbox credentials.
//!
//! The configuration record is serialized to JSON and sealed with ChaCha20-Poly1305
//! under a key derived from the master password with PBKDF2-HMAC-SHA256. A fresh
//! salt is drawn on every save and stored next to the ciphertext.

use crate::config::expand_home;
use crate::error::{Result, SandfixError};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// PBKDF2 work factor for vaults written by this build
pub const PBKDF2_ITERATIONS: u32 = 480_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Field names the extension map may not shadow
const RESERVED_KEYS: &[&str] = &[
    "sandbox_path",
    "git_username",
    "git_email",
    "git_token",
    "service_api_key",
    "openai_api_key",
    "ssh_private_key",
    "ssh_public_key",
];

/// Decrypted configuration. Extension entries are flattened next to the named fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    #[serde(default)]
    pub sandbox_path: String,
    #[serde(default)]
    pub git_username: Option<String>,
    #[serde(default)]
    pub git_email: Option<String>,
    #[serde(default)]
    pub git_token: Option<String>,
    #[serde(default, alias = "openai_api_key")]
    pub service_api_key: Option<String>,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl ConfigRecord {
    pub fn new(sandbox_path: impl Into<String>) -> Self {
        Self {
            sandbox_path: sandbox_path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sandbox_path.trim().is_empty() {
            return Err(SandfixError::Validation(
                "The sandbox path is required. Configure it with `sandfix config`.".to_string(),
            ));
        }
        if let Some(key) = self.extra.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(SandfixError::Validation(format!(
                "Extra key '{}' collides with a built-in field",
                key
            )));
        }
        Ok(())
    }

    /// Key/value view with every secret replaced by a marker, for display.
    pub fn redacted_view(&self) -> Vec<(String, String)> {
        fn plain(value: &Option<String>) -> String {
            value.clone().unwrap_or_else(|| "not set".to_string())
        }
        fn secret(value: &Option<String>) -> String {
            match value {
                Some(_) => "****configured****".to_string(),
                None => "not set".to_string(),
            }
        }

        let mut view = vec![
            ("sandbox_path".to_string(), self.sandbox_path.clone()),
            ("git_username".to_string(), plain(&self.git_username)),
            ("git_email".to_string(), plain(&self.git_email)),
            ("git_token".to_string(), secret(&self.git_token)),
            ("service_api_key".to_string(), secret(&self.service_api_key)),
            ("ssh_private_key".to_string(), secret(&self.ssh_private_key)),
            ("ssh_public_key".to_string(), plain(&self.ssh_public_key)),
        ];
        for (key, value) in &self.extra {
            view.push((key.clone(), value.clone()));
        }
        view
    }
}

/// Treat `value` as a path when it names an existing file, otherwise as literal content.
pub fn resolve_inline_or_file(value: &str) -> Result<String> {
    let candidate = expand_home(value);
    if candidate.is_file() {
        debug!(path = %candidate.display(), "Reading value from file");
        return Ok(fs::read_to_string(&candidate)?);
    }
    Ok(value.to_string())
}

/// Salt plus sealed record. `ciphertext` is the nonce followed by the AEAD output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(with = "base64_field")]
    pub salt: Vec<u8>,
    #[serde(rename = "data", with = "base64_field")]
    pub ciphertext: Vec<u8>,
}

mod base64_field {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone)]
pub struct VaultCipher {
    iterations: u32,
}

impl Default for VaultCipher {
    fn default() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

impl VaultCipher {
    /// Cheaper work factor so debug-build tests stay fast.
    #[cfg(test)]
    pub(crate) fn with_iterations(iterations: u32) -> Self {
        Self { iterations }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn derive_key(&self, password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut key);
        key
    }

    pub fn encrypt(&self, record: &ConfigRecord, password: &str) -> Result<EncryptedPayload> {
        if password.is_empty() {
            return Err(SandfixError::Validation(
                "The master password cannot be empty".to_string(),
            ));
        }

        let plaintext = serde_json::to_vec(record)?;

        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(password, &salt);
        let aead = ChaCha20Poly1305::new(Key::from_slice(&key));
        let sealed = aead
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| SandfixError::Configuration(format!("Failed to encrypt configuration: {}", e)))?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);

        Ok(EncryptedPayload { salt, ciphertext })
    }

    /// Fails closed: any authentication failure is reported as `Decryption`.
    pub fn decrypt(&self, payload: &EncryptedPayload, password: &str) -> Result<ConfigRecord> {
        if payload.ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(SandfixError::Decryption);
        }
        let (nonce, sealed) = payload.ciphertext.split_at(NONCE_LEN);

        let key = self.derive_key(password, &payload.salt);
        let aead = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SandfixError::Decryption)?;

        serde_json::from_slice(&plaintext).map_err(|_| SandfixError::Decryption)
    }
}

/// On-disk vault: a single JSON file `{ "salt": ..., "data": ... }`.
#[derive(Debug, Clone)]
pub struct Vault {
    path: PathBuf,
    cipher: VaultCipher,
}

impl Vault {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cipher: VaultCipher::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_cipher(path: PathBuf, cipher: VaultCipher) -> Self {
        Self { path, cipher }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Encrypt and write the record, replacing any previous vault file in full.
    pub fn save(&self, record: &ConfigRecord, password: &str) -> Result<()> {
        record.validate()?;
        let payload = self.cipher.encrypt(record, password)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_private(&self.path, serde_json::to_string_pretty(&payload)?.as_bytes())?;

        debug!(path = %self.path.display(), iterations = self.cipher.iterations(), "Vault saved");
        Ok(())
    }

    pub fn load(&self, password: &str) -> Result<ConfigRecord> {
        if !self.exists() {
            return Err(SandfixError::NotFound(format!(
                "No encrypted configuration found at {}. Run `sandfix config` first.",
                self.path.display()
            )));
        }

        let raw = fs::read_to_string(&self.path)?;
        let payload: EncryptedPayload =
            serde_json::from_str(&raw).map_err(|_| SandfixError::Decryption)?;
        self.cipher.decrypt(&payload, password)
    }

    /// `save` on the blocking pool, so key derivation never stalls the runtime.
    pub async fn save_async(&self, record: &ConfigRecord, password: &str) -> Result<()> {
        let vault = self.clone();
        let record = record.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || vault.save(&record, &password)).await?
    }

    /// `load` on the blocking pool.
    pub async fn load_async(&self, password: &str) -> Result<ConfigRecord> {
        let vault = self.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || vault.load(&password)).await?
    }
}

/// Owner-only from the moment the file exists. `mode` only applies on creation,
/// so a file left by an older save is tightened before any byte is written.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}
