//! A peer's cryptographic identity.

use std::fmt;

use autotrust_agreement::{AgreementKind, AgreementProof, AgreementVoter};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::keys::{EncryptorKeys, Sealed, SignatureKeys};

/// Strip any `/suffix` from a network address.
pub fn bare_address(address: &str) -> &str {
    address.split_once('/').map_or(address, |(head, _)| head)
}

/// Identity details that can be saved to file or transmitted.
///
/// Only a locally owned identity holds private keys. Copies received from
/// peers are public-only and refuse to sign, encrypt or decrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    uuid: Uuid,
    address: String,
    fullname: String,
    nickname: String,
    signature: SignatureKeys,
    encryptor: EncryptorKeys,
    petname: String,
    public_only: bool,
    rank: i64,
    agreement: AgreementKind,
}

impl Identity {
    /// Fresh identity with new keys and a random uuid.
    pub fn initialize(fullname: &str, nickname: &str, address: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            address: bare_address(address).to_string(),
            fullname: fullname.to_string(),
            nickname: nickname.to_string(),
            signature: SignatureKeys::generate(),
            encryptor: EncryptorKeys::generate(),
            petname: "me".to_string(),
            public_only: false,
            rank: 0,
            agreement: AgreementKind::default(),
        }
    }

    #[must_use]
    pub fn with_agreement(mut self, agreement: AgreementKind) -> Self {
        self.agreement = agreement;
        self
    }

    #[must_use]
    pub fn with_rank(mut self, rank: i64) -> Self {
        self.rank = rank;
        self
    }

    /// Public-only copy for transmission.
    pub fn publish(&self) -> Self {
        Self {
            signature: self.signature.publish(),
            encryptor: self.encryptor.publish(),
            petname: String::new(),
            public_only: true,
            ..self.clone()
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn signature(&self) -> &SignatureKeys {
        &self.signature
    }

    pub fn encryptor(&self) -> &EncryptorKeys {
        &self.encryptor
    }

    pub fn petname(&self) -> &str {
        &self.petname
    }

    pub fn set_petname(&mut self, petname: impl Into<String>) {
        self.petname = petname.into();
    }

    pub fn rank(&self) -> i64 {
        self.rank
    }

    pub fn set_rank(&mut self, rank: i64) {
        self.rank = rank;
    }

    pub fn public_only(&self) -> bool {
        self.public_only
    }

    pub fn agreement(&self) -> AgreementKind {
        self.agreement
    }

    /// Whether either public key is shared with `other`.
    pub fn shares_keys_with(&self, other: &Identity) -> bool {
        self.signature.public() == other.signature.public()
            || self.encryptor.public() == other.encryptor.public()
    }

    /// Sign my own message.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        self.require_private("sign")?;
        self.signature.sign(msg)
    }

    /// Verify someone's signature against this identity's public key.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        self.signature.verify(msg, sig)
    }

    /// Encrypt my own message for `whom`.
    pub fn encrypt(&self, msg: &[u8], whom: &Identity) -> Result<Sealed> {
        self.require_private("encrypt")?;
        self.encryptor.seal(msg, whom.encryptor.public())
    }

    /// Decrypt a message sent to me by `whom`.
    pub fn decrypt(&self, sealed: &Sealed, whom: &Identity) -> Result<Vec<u8>> {
        self.require_private("decrypt")?;
        self.encryptor.open(sealed, whom.encryptor.public())
    }

    fn require_private(&self, action: &str) -> Result<()> {
        if self.public_only {
            return Err(Error::PermissionDenied(format!(
                "cannot {action} as {} ({} is not you)",
                self.nickname, self.uuid
            )));
        }
        Ok(())
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
            && self.fullname == other.fullname
            && self.nickname == other.nickname
            && self.signature.public() == other.signature.public()
            && self.encryptor.public() == other.encryptor.public()
    }
}

impl Eq for Identity {}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.nickname, self.address)
    }
}

impl AgreementVoter for Identity {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn rank(&self) -> i64 {
        self.rank
    }

    fn verify(&self, proof: &AgreementProof, sig: &[u8]) -> bool {
        self.signature.verify(&proof.to_bytes(), sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_strips_address_suffix() {
        let me = Identity::initialize("Alice Example", "alice", "10.0.0.1/24");
        assert_eq!(me.address(), "10.0.0.1");
        assert!(!me.public_only());
        assert_eq!(bare_address("10.0.0.2"), "10.0.0.2");
    }

    #[test]
    fn published_copy_is_public_only() {
        let me = Identity::initialize("Alice Example", "alice", "10.0.0.1");
        let public = me.publish();
        assert!(public.public_only());
        assert_eq!(public, me);
        assert!(!public.signature().has_secret());
        assert!(!public.encryptor().has_secret());
    }

    #[test]
    fn public_only_refuses_private_operations() {
        let me = Identity::initialize("Alice Example", "alice", "10.0.0.1");
        let bob = Identity::initialize("Bob Example", "bob", "10.0.0.2");
        let public = me.publish();
        assert!(matches!(public.sign(b"x"), Err(Error::PermissionDenied(_))));
        assert!(matches!(public.encrypt(b"x", &bob), Err(Error::PermissionDenied(_))));
        let sealed = bob.encrypt(b"x", &me).unwrap();
        assert!(matches!(public.decrypt(&sealed, &bob), Err(Error::PermissionDenied(_))));
    }

    #[test]
    fn sign_verify_through_public_copy() {
        let me = Identity::initialize("Alice Example", "alice", "10.0.0.1");
        let sig = me.sign(b"hello").unwrap();
        assert!(me.publish().verify(b"hello", &sig));
        let other = Identity::initialize("Alice Example", "alice", "10.0.0.1");
        assert!(!other.verify(b"hello", &sig));
    }

    #[test]
    fn encrypt_between_identities() {
        let alice = Identity::initialize("Alice Example", "alice", "10.0.0.1");
        let bob = Identity::initialize("Bob Example", "bob", "10.0.0.2");
        let sealed = alice.encrypt(b"psst", &bob.publish()).unwrap();
        assert_eq!(bob.decrypt(&sealed, &alice.publish()).unwrap(), b"psst");
    }

    #[test]
    fn equality_ignores_mutable_fields() {
        let me = Identity::initialize("Alice Example", "alice", "10.0.0.1");
        let mut other = me.clone();
        other.set_rank(9);
        other.set_petname("boss");
        assert_eq!(me, other);
        let stranger = Identity::initialize("Alice Example", "alice", "10.0.0.1");
        assert_ne!(me, stranger);
    }

    #[test]
    fn votes_verify_with_identity_key() {
        let me = Identity::initialize("Alice Example", "alice", "10.0.0.1");
        let proof = AgreementProof::new(me.uuid(), autotrust_structures::hash(b"x"), true);
        let sig = me.sign(&proof.to_bytes()).unwrap();
        assert!(AgreementVoter::verify(&me.publish(), &proof, &sig));
    }

    #[test]
    fn bincode_round_trip_keeps_keys() {
        let me = Identity::initialize("Alice Example", "alice", "10.0.0.1").with_rank(3);
        let bytes = bincode::serialize(&me).unwrap();
        let back: Identity = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, me);
        assert_eq!(back.rank(), 3);
        assert!(back.sign(b"still mine").is_ok());
    }
}
