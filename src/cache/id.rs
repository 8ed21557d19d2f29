//! Object identifiers.
//!
//! An [`ObjectId`] is the sole key shared by the registry, every tier and
//! every auxiliary index. It is 16 opaque bytes compared byte-wise.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Size of an object id in bytes.
pub const ID_LEN: usize = 16;

/// Fixed-size opaque object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ObjectId([u8; ID_LEN]);

impl ObjectId {
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Random id, handy for callers without a natural key.
    pub fn new_random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Index of the registry bucket this id lives in.
    pub fn bucket(&self) -> usize {
        self.0[0] as usize
    }

    /// Lowercase hex, 32 characters.
    pub fn to_hex(&self) -> String {
        Uuid::from_bytes(self.0).simple().to_string()
    }
}

impl From<Uuid> for ObjectId {
    fn from(uuid: Uuid) -> Self {
        Self(*uuid.as_bytes())
    }
}

impl From<ObjectId> for Uuid {
    fn from(id: ObjectId) -> Self {
        Uuid::from_bytes(id.0)
    }
}

impl From<[u8; ID_LEN]> for ObjectId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = uuid::Error;

    /// Accepts both the 32-digit hex form and the hyphenated UUID form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self::from)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for ObjectId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
