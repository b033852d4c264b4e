//! ECDSA signatures over the P-256 curve, as used by the signed wire
//! envelope.
//!
//! Signatures use the fixed-width encoding, i.e. the 32 byte big-endian
//! scalars `r || s`, so the two components can travel separately in the
//! envelope and be reassembled for verification.

use num_bigint::BigUint;
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair,
    KeyPair as RKeyPair,
    UnparsedPublicKey,
    ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};

use crate::bft::error::*;

/// Length in bytes of one signature scalar.
const SCALAR_LENGTH: usize = 32;

/// A private signing key paired with its public verification key.
pub struct KeyPair {
    sk: EcdsaKeyPair,
    pk_bytes: Vec<u8>,
    rng: SystemRandom,
}

/// A public key used to verify envelopes from one peer.
///
/// Wraps the uncompressed P-256 point, as produced by
/// [`KeyPair::public_key_bytes`].
pub struct PublicKey {
    raw: Vec<u8>,
    pk: UnparsedPublicKey<Vec<u8>>,
}

/// A fixed-width ECDSA P-256 signature.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(transparent)]
pub struct Signature([u8; Signature::LENGTH]);

impl KeyPair {
    /// Loads a key pair from a PKCS#8 v1 document, the format the key
    /// loading collaborator hands us.
    pub fn from_pkcs8(document: &[u8]) -> Result<Self> {
        let sk = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, document)
            .map_err(|_| Error::Crypto("invalid pkcs#8 ecdsa key document"))?;
        let pk_bytes = sk.public_key().as_ref().to_vec();
        Ok(KeyPair {
            sk,
            pk_bytes,
            rng: SystemRandom::new(),
        })
    }

    /// Generates a fresh key pair. Used by test harnesses; production
    /// keys come from the key files.
    pub fn generate() -> Result<Self> {
        Self::from_pkcs8(&Self::generate_pkcs8()?)
    }

    /// Generates a fresh key pair as a PKCS#8 document, for callers
    /// that also need to persist or re-load it.
    pub fn generate_pkcs8() -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| Error::Crypto("failed to generate ecdsa key pair"))?;
        Ok(document.as_ref().to_vec())
    }

    /// The uncompressed public point of this key pair.
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.pk_bytes
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_bytes(&self.pk_bytes)
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signature = self
            .sk
            .sign(&self.rng, message)
            .map_err(|_| Error::Crypto("ecdsa signing failed"))?;
        Signature::from_bytes(signature.as_ref())
    }
}

impl PublicKey {
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        // an uncompressed P-256 point: 0x04 || x || y
        if raw_bytes.len() != 1 + 2 * SCALAR_LENGTH || raw_bytes[0] != 0x04 {
            return Err(Error::Crypto("invalid uncompressed p256 public key"));
        }
        let raw = raw_bytes.to_vec();
        let pk = UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, raw.clone());
        Ok(PublicKey { raw, pk })
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.pk
            .verify(message, signature.as_ref())
            .map_err(|_| Error::Crypto("invalid signature"))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

impl Signature {
    pub const LENGTH: usize = 2 * SCALAR_LENGTH;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err(Error::Crypto("signature has an invalid length"));
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Self(inner))
    }

    /// Reassembles a signature from its `(r, s)` scalar components.
    pub fn from_parts(r: &BigUint, s: &BigUint) -> Result<Self> {
        let mut inner = [0; Self::LENGTH];
        copy_scalar(&mut inner[..SCALAR_LENGTH], r)?;
        copy_scalar(&mut inner[SCALAR_LENGTH..], s)?;
        Ok(Self(inner))
    }

    /// The `r` scalar of the signature.
    pub fn r(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0[..SCALAR_LENGTH])
    }

    /// The `s` scalar of the signature.
    pub fn s(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0[SCALAR_LENGTH..])
    }
}

fn copy_scalar(into: &mut [u8], scalar: &BigUint) -> Result<()> {
    let raw = scalar.to_bytes_be();
    if raw.len() > SCALAR_LENGTH {
        return Err(Error::Crypto("signature scalar out of range"));
    }
    // big-endian, right aligned; leading zeroes restored on the left
    into[SCALAR_LENGTH - raw.len()..].copy_from_slice(&raw);
    Ok(())
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let keys = KeyPair::generate().unwrap();
        let pk = keys.public_key().unwrap();
        let sig = keys.sign(b"message under test").unwrap();

        pk.verify(b"message under test", &sig).unwrap();
        assert!(pk.verify(b"another message", &sig).is_err());
    }

    #[test]
    fn parts_round_trip() {
        let keys = KeyPair::generate().unwrap();
        let sig = keys.sign(b"split me").unwrap();

        let rebuilt = Signature::from_parts(&sig.r(), &sig.s()).unwrap();
        assert_eq!(rebuilt, sig);

        let pk = keys.public_key().unwrap();
        pk.verify(b"split me", &rebuilt).unwrap();
    }

    #[test]
    fn rejects_foreign_key() {
        let keys = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();
        let sig = keys.sign(b"message").unwrap();

        assert!(other.public_key().unwrap().verify(b"message", &sig).is_err());
    }
}
