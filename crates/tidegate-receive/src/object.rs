use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const OBJECT_ID_LENGTH: usize = 20;
pub const OBJECT_ID_STRING_LENGTH: usize = OBJECT_ID_LENGTH * 2;

#[derive(Debug, Error, PartialEq)]
pub enum ObjectIdError {
    #[error("object id must be 40 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("object id is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A git object name (SHA-1).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId([u8; OBJECT_ID_LENGTH]);

impl ObjectId {
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0; OBJECT_ID_LENGTH])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != OBJECT_ID_STRING_LENGTH {
            return Err(ObjectIdError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; OBJECT_ID_LENGTH];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    pub name: String,
    pub object_id: ObjectId,
}

impl Ref {
    pub fn new(name: impl Into<String>, object_id: ObjectId) -> Self {
        Self {
            name: name.into(),
            object_id,
        }
    }
}

/// Well-known reference namespaces.
pub mod ref_names {
    pub const HEAD: &str = "HEAD";
    pub const REFS_HEADS: &str = "refs/heads/";
    pub const REFS_CHANGES: &str = "refs/changes/";
    pub const REFS_CACHE_AUTOMERGE: &str = "refs/cache-automerge/";
    /// Prefix clients push to in order to create or update reviews.
    pub const NEW_CHANGE: &str = "refs/for/";

    pub fn is_magic_branch(name: &str) -> bool {
        name.starts_with(NEW_CHANGE)
    }
}
