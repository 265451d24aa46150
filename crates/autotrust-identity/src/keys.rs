//! Signing and encryption key material.
//!
//! Signatures are ed25519. Encryption is X25519 key agreement, a BLAKE3
//! derived key, then ChaCha20-Poly1305 with a random nonce. A key set either
//! holds its secret (locally owned) or only the public half (received from a
//! peer). Keys serialize as hex strings.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const BOX_CONTEXT: &str = "autotrust 2024-01 identity box key";

/// ed25519 key pair, or just the verifying key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureKeys {
    #[serde(with = "hex_key")]
    public: [u8; 32],
    #[serde(with = "hex_key_opt")]
    secret: Option<[u8; 32]>,
}

impl SignatureKeys {
    /// Fresh random key pair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        Self {
            public: signing.verifying_key().to_bytes(),
            secret: Some(seed),
        }
    }

    /// Public-only key set from verifying key bytes.
    pub fn from_public(public: [u8; 32]) -> Result<Self> {
        VerifyingKey::from_bytes(&public).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self {
            public,
            secret: None,
        })
    }

    pub fn publish(&self) -> Self {
        Self {
            public: self.public,
            secret: None,
        }
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        let seed = self
            .secret
            .ok_or_else(|| Error::PermissionDenied("no signing key".into()))?;
        Ok(SigningKey::from_bytes(&seed).sign(msg).to_bytes().to_vec())
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(sig) else {
            return false;
        };
        key.verify(msg, &sig).is_ok()
    }
}

impl std::fmt::Debug for SignatureKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureKeys")
            .field("public", &hex::encode(&self.public[..8]))
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

/// An authenticated ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// X25519 key pair, or just the public key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptorKeys {
    #[serde(with = "hex_key")]
    public: [u8; 32],
    #[serde(with = "hex_key_opt")]
    secret: Option<[u8; 32]>,
}

impl EncryptorKeys {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let public = MontgomeryPoint::mul_base(&Scalar::from_bytes_mod_order(secret));
        Self {
            public: public.to_bytes(),
            secret: Some(secret),
        }
    }

    pub fn from_public(public: [u8; 32]) -> Self {
        Self {
            public,
            secret: None,
        }
    }

    pub fn publish(&self) -> Self {
        Self::from_public(self.public)
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Encrypt for the holder of `their_public`.
    pub fn seal(&self, msg: &[u8], their_public: &[u8; 32]) -> Result<Sealed> {
        let cipher = self.cipher(their_public)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, msg).map_err(|_| Error::Encryption)?;
        Ok(Sealed {
            nonce: nonce.into(),
            ciphertext,
        })
    }

    /// Decrypt a message sealed by the holder of `their_public`.
    pub fn open(&self, sealed: &Sealed, their_public: &[u8; 32]) -> Result<Vec<u8>> {
        let cipher = self.cipher(their_public)?;
        cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
            .map_err(|_| Error::Decryption)
    }

    fn cipher(&self, their_public: &[u8; 32]) -> Result<ChaCha20Poly1305> {
        let secret = self
            .secret
            .ok_or_else(|| Error::PermissionDenied("no encryption key".into()))?;
        let shared = Scalar::from_bytes_mod_order(secret) * MontgomeryPoint(*their_public);
        let key = blake3::derive_key(BOX_CONTEXT, shared.as_bytes());
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }
}

impl std::fmt::Debug for EncryptorKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptorKeys")
            .field("public", &hex::encode(&self.public[..8]))
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        hex::encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn decode(s: &str) -> Result<[u8; 32], String> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        bytes
            .try_into()
            .map_err(|_| "expected 32 bytes".to_string())
    }
}

mod hex_key_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        bytes.map(hex::encode).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| super::hex_key::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
