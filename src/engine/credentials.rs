//! Credential resolution and private-key proofs
//!
//! A single command-line argument selects the authentication mode:
//! `<username>:<password>` for password login, anything else is taken as the
//! path to a private-key file. Key files are plain text:
//!
//! ```text
//! # comment
//! user alice
//! operateas alice
//! pubkey <base64 raw Ed25519 public key>
//! privkey <base64 PKCS#8 Ed25519 key>
//! ```

use super::error::{EngineError, Result};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::fmt;
use std::path::{Path, PathBuf};

// First group is non-greedy but non-empty, so ":x:y" splits as (":x", "y").
static PASSWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.+?):(.+)$").expect("password pattern is a valid regex")
});

/// How the client proves its identity
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password { username: String, password: String },
    PrivateKey { path: PathBuf },
}

impl Credential {
    /// Classify a raw `user:pass` or key-path argument. Never fails.
    pub fn resolve(arg: &str) -> Self {
        match PASSWORD_PATTERN.captures(arg) {
            Some(caps) => Credential::Password {
                username: caps[1].to_string(),
                password: caps[2].to_string(),
            },
            None => Credential::PrivateKey {
                path: PathBuf::from(arg),
            },
        }
    }

    /// Human-readable mode, safe to log
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::PrivateKey { .. } => "private-key",
        }
    }
}

// Passwords must never reach logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::PrivateKey { path } => {
                f.debug_struct("PrivateKey").field("path", path).finish()
            }
        }
    }
}

/// What gets sent to the authentication service
#[derive(Clone, PartialEq, Eq)]
pub enum AuthProof {
    Password {
        username: String,
        password: String,
    },
    Signature {
        username: String,
        operate_as: String,
        public_key: Vec<u8>,
        nonce: Vec<u8>,
        signature: Vec<u8>,
    },
}

impl fmt::Debug for AuthProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthProof::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            AuthProof::Signature {
                username,
                operate_as,
                ..
            } => f
                .debug_struct("Signature")
                .field("username", username)
                .field("operate_as", operate_as)
                .finish_non_exhaustive(),
        }
    }
}

/// Parsed private-key file
pub struct PrivateKeyFile {
    pub user: String,
    pub operate_as: String,
    key_pair: Ed25519KeyPair,
}

impl fmt::Debug for PrivateKeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyFile")
            .field("user", &self.user)
            .field("operate_as", &self.operate_as)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl PrivateKeyFile {
    /// Read and parse a key file from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Authentication(format!(
                "cannot read private key file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&contents)
            .map_err(|e| EngineError::Authentication(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let mut user = None;
        let mut operate_as = None;
        let mut pubkey = None;
        let mut privkey = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .ok_or_else(|| format!("malformed line '{}'", line))?;
            match key {
                "user" => user = Some(value.to_string()),
                "operateas" => operate_as = Some(value.to_string()),
                "pubkey" => pubkey = Some(decode_b64(key, value)?),
                "privkey" => privkey = Some(decode_b64(key, value)?),
                // Unknown keys are tolerated for forward compatibility
                _ => {}
            }
        }

        let user = user.ok_or("missing 'user' entry")?;
        let privkey = privkey.ok_or("missing 'privkey' entry")?;
        let key_pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(&privkey)
            .map_err(|e| format!("invalid private key: {}", e))?;

        if let Some(pubkey) = pubkey {
            if pubkey.as_slice() != key_pair.public_key().as_ref() {
                return Err("'pubkey' does not match 'privkey'".to_string());
            }
        }

        Ok(Self {
            operate_as: operate_as.unwrap_or_else(|| user.clone()),
            user,
            key_pair,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    /// Sign a server-issued challenge
    pub fn prove(&self, nonce: &[u8]) -> AuthProof {
        AuthProof::Signature {
            username: self.user.clone(),
            operate_as: self.operate_as.clone(),
            public_key: self.public_key().to_vec(),
            nonce: nonce.to_vec(),
            signature: self.key_pair.sign(nonce).as_ref().to_vec(),
        }
    }
}

fn decode_b64(key: &str, value: &str) -> std::result::Result<Vec<u8>, String> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| format!("'{}' is not valid base64: {}", key, e))
}
