//! SHA-256 message digests over canonically serialized payloads.

use std::fmt;

use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};
use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

use crate::bft::error::*;

/// An incremental hashing context.
pub struct Context {
    inner: digest::Context,
}

impl Context {
    pub fn new() -> Self {
        let inner = digest::Context::new(&SHA256);
        Context { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> Digest {
        let h = self.inner.finish();
        Digest::from_bytes_unchecked(h.as_ref())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of hashing a byte buffer.
///
/// On the wire a `Digest` travels as a lowercase hex string, which is
/// also its `Display` form in logs.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    /// Hashes a whole buffer in one call.
    pub fn compute(data: &[u8]) -> Self {
        let mut ctx = Context::new();
        ctx.update(data);
        ctx.finish()
    }

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err(Error::Crypto("digest has an invalid length"));
        }
        Ok(Self::from_bytes_unchecked(raw_bytes))
    }

    fn from_bytes_unchecked(raw_bytes: &[u8]) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Self(inner)
    }

    fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 2 * Self::LENGTH || !hex.is_ascii() {
            return Err(Error::Crypto("digest hex has an invalid length"));
        }
        let mut inner = [0; Self::LENGTH];
        for (i, byte) in inner.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::Crypto("digest hex has an invalid character"))?;
        }
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HexVisitor;

        impl<'de> Visitor<'de> for HexVisitor {
            type Value = Digest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a lowercase hex encoded SHA-256 digest")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Digest, E> {
                Digest::from_hex(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}
