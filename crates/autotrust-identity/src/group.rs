//! The membership group and its shared key.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::bare_address;
use crate::keys::{EncryptorKeys, Sealed};

/// Group details, including the key every member shares.
///
/// Group traffic is sealed under a key derived from the group keypair, so
/// only holders of the group secret can read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    uuid: Uuid,
    members: Vec<(Uuid, String)>,
    nickname: String,
    encryptor: EncryptorKeys,
    public_only: bool,
}

impl Group {
    /// New group with a fresh key.
    pub fn initialize(members: Vec<(Uuid, String)>, nickname: &str) -> Self {
        let mut group = Self {
            uuid: Uuid::new_v4(),
            members: Vec::with_capacity(members.len()),
            nickname: nickname.to_string(),
            encryptor: EncryptorKeys::generate(),
            public_only: false,
        };
        for (uuid, address) in members {
            group.add_address(uuid, &address);
        }
        group
    }

    /// A random `group-xxxxxx` nickname.
    pub fn random_nickname() -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        format!("group-{suffix}")
    }

    pub fn publish(&self) -> Self {
        Self {
            encryptor: self.encryptor.publish(),
            public_only: true,
            ..self.clone()
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn public_only(&self) -> bool {
        self.public_only
    }

    pub fn members(&self) -> &[(Uuid, String)] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member addresses in join order.
    pub fn addresses(&self) -> Vec<&str> {
        self.members.iter().map(|(_, address)| address.as_str()).collect()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.members.iter().any(|(member, _)| member == uuid)
    }

    /// Record a member's address. An entry holding the same address under a
    /// different uuid is replaced.
    pub fn add_address(&mut self, uuid: Uuid, address: &str) {
        let address = bare_address(address);
        self.members
            .retain(|(member, held)| *member == uuid || held != address);
        match self.members.iter_mut().find(|(member, _)| *member == uuid) {
            Some(entry) => entry.1 = address.to_string(),
            None => self.members.push((uuid, address.to_string())),
        }
    }

    pub fn remove_member(&mut self, uuid: &Uuid) -> bool {
        let before = self.members.len();
        self.members.retain(|(member, _)| member != uuid);
        self.members.len() != before
    }

    /// Whether this group should replace `other`: more members, or as many
    /// and a smaller uuid.
    pub fn outranks(&self, other: &Group) -> bool {
        match self.len().cmp(&other.len()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.uuid < other.uuid,
        }
    }

    pub fn encrypt(&self, msg: &[u8]) -> Result<Sealed> {
        self.require_private("encrypt")?;
        self.encryptor.seal(msg, self.encryptor.public())
    }

    pub fn decrypt(&self, sealed: &Sealed) -> Result<Vec<u8>> {
        self.require_private("decrypt")?;
        self.encryptor.open(sealed, self.encryptor.public())
    }

    fn require_private(&self, action: &str) -> Result<()> {
        if self.public_only {
            return Err(Error::PermissionDenied(format!(
                "cannot {action} for group {} without its secret",
                self.nickname
            )));
        }
        Ok(())
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.encryptor.public() == other.encryptor.public()
    }
}

impl Eq for Group {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_keep_join_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let group = Group::initialize(vec![(a, "10.0.0.1".into()), (b, "10.0.0.2/8".into())], "g");
        assert_eq!(group.addresses(), vec!["10.0.0.1", "10.0.0.2"]);
        assert!(group.contains(&b));
    }

    #[test]
    fn address_collision_replaces_old_member() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut group = Group::initialize(vec![(a, "10.0.0.1".into())], "g");
        group.add_address(b, "10.0.0.1");
        assert_eq!(group.members(), &[(b, "10.0.0.1".to_string())]);
        group.add_address(b, "10.0.0.5");
        assert_eq!(group.addresses(), vec!["10.0.0.5"]);
    }

    #[test]
    fn members_share_the_key() {
        let group = Group::initialize(vec![], "g");
        let sealed = group.encrypt(b"members only").unwrap();
        let json = serde_json::to_string(&group).unwrap();
        let copy: Group = serde_json::from_str(&json).unwrap();
        assert_eq!(copy.decrypt(&sealed).unwrap(), b"members only");
        assert!(Group::initialize(vec![], "g").decrypt(&sealed).is_err());
    }

    #[test]
    fn published_group_cannot_decrypt() {
        let group = Group::initialize(vec![], "g");
        let sealed = group.encrypt(b"x").unwrap();
        let public = group.publish();
        assert_eq!(public, group);
        assert!(matches!(public.decrypt(&sealed), Err(Error::PermissionDenied(_))));
    }

    #[test]
    fn outranks_by_size_then_uuid() {
        let a = Group::initialize(vec![(Uuid::new_v4(), "10.0.0.1".into())], "a");
        let mut b = Group::initialize(vec![(Uuid::new_v4(), "10.0.0.2".into())], "b");
        assert_ne!(a.outranks(&b), b.outranks(&a));
        assert!(!a.outranks(&a));
        b.add_address(Uuid::new_v4(), "10.0.0.3");
        assert!(b.outranks(&a));
        assert!(!a.outranks(&b));
    }

    #[test]
    fn random_nickname_shape() {
        let name = Group::random_nickname();
        assert!(name.starts_with("group-"));
        assert_eq!(name.len(), 12);
    }
}
