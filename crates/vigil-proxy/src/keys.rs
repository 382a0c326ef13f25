//! Keypair generation for CA and leaf certificates.

use rcgen::KeyPair;

use crate::error::CryptoError;

/// Generates asymmetric keypairs for the root authority and for leaf
/// certificates.
///
/// Prefers ECDSA P-256 and falls back to the rcgen default algorithm when
/// the preferred one is unavailable in the linked crypto backend.
pub struct KeyPairFactory;

impl KeyPairFactory {
    /// Generates a fresh keypair.
    pub fn generate() -> Result<KeyPair, CryptoError> {
        KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .or_else(|_| KeyPair::generate())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_keypairs() {
        let a = KeyPairFactory::generate().unwrap();
        let b = KeyPairFactory::generate().unwrap();
        assert_ne!(a.serialize_pem(), b.serialize_pem());
    }
}
