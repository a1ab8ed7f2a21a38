use bytes::Bytes;
use data_encoding::BASE64;
use thiserror::Error;

/// A fixed-width content address for a snapshot [Tree](crate::Tree) or blob,
/// the blake3 hash of the object's canonical encoding.
#[derive(PartialEq, Eq, Hash)]
pub struct Digest(Bytes);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
}

pub const DIGEST_LEN: usize = blake3::OUT_LEN;

impl Digest {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Hashes raw blob contents into their content address.
    pub fn for_blob(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"driftfs:blob\0");
        hasher.update(data);
        Self(Bytes::copy_from_slice(hasher.finalize().as_bytes()))
    }
}

impl From<Digest> for Bytes {
    fn from(val: Digest) -> Self {
        val.0
    }
}

impl From<blake3::Hash> for Digest {
    fn from(value: blake3::Hash) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl TryFrom<Vec<u8>> for Digest {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != DIGEST_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl TryFrom<Bytes> for Digest {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if value.len() != DIGEST_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value))
        }
    }
}

impl From<&[u8; DIGEST_LEN]> for Digest {
    fn from(value: &[u8; DIGEST_LEN]) -> Self {
        Self(value.to_vec().into())
    }
}

impl Clone for Digest {
    fn clone(&self) -> Self {
        Self(self.0.to_owned())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", BASE64.encode(&self.0))
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", BASE64.encode(&self.0))
    }
}
