//! Windows CNG `BCRYPT_RSAKEY_BLOB` public-key serialization and the JWK
//! encodings the enrollment service accepts as transport keys.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine,
};
use rsa::{traits::PublicKeyParts, BigUint, RsaPublicKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const MAGIC: &[u8; 4] = b"RSA1";
const HEADER_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum CngError {
    #[error("blob does not start with the RSA1 magic value")]
    Magic,
    #[error("blob is truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("blob does not contain a valid RSA public key: {0}")]
    Key(#[from] rsa::Error),
}

/// Serialize an RSA public key as a CNG `BCRYPT_RSAKEY_BLOB` public blob:
/// a little-endian header `"RSA1" || bits || exp_len || mod_len || 0 || 0`
/// followed by the big-endian exponent and modulus.
pub fn public_key_blob(key: &RsaPublicKey) -> Vec<u8> {
    let exponent = key.e().to_bytes_be();
    let modulus = key.n().to_bytes_be();

    let mut blob = Vec::with_capacity(HEADER_LEN + exponent.len() + modulus.len());
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&((key.size() * 8) as u32).to_le_bytes());
    blob.extend_from_slice(&(exponent.len() as u32).to_le_bytes());
    blob.extend_from_slice(&(modulus.len() as u32).to_le_bytes());
    // No private key halves in a public blob.
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob.extend_from_slice(&exponent);
    blob.extend_from_slice(&modulus);
    blob
}

/// Reconstruct the public key from a CNG public blob.
pub fn parse_public_key_blob(blob: &[u8]) -> Result<RsaPublicKey, CngError> {
    if blob.len() < HEADER_LEN {
        return Err(CngError::Truncated {
            expected: HEADER_LEN,
            found: blob.len(),
        });
    }
    if &blob[..4] != MAGIC {
        return Err(CngError::Magic);
    }

    let exp_len = u32::from_le_bytes(blob[8..12].try_into().unwrap()) as usize;
    let mod_len = u32::from_le_bytes(blob[12..16].try_into().unwrap()) as usize;

    let expected = HEADER_LEN + exp_len + mod_len;
    if blob.len() < expected {
        return Err(CngError::Truncated {
            expected,
            found: blob.len(),
        });
    }

    let exponent = BigUint::from_bytes_be(&blob[HEADER_LEN..HEADER_LEN + exp_len]);
    let modulus = BigUint::from_bytes_be(&blob[HEADER_LEN + exp_len..expected]);

    Ok(RsaPublicKey::new(modulus, exponent)?)
}

/// Key id for a registered key: standard base64 of the SHA-256 of the blob.
pub fn key_id(key: &RsaPublicKey) -> String {
    STANDARD.encode(Sha256::digest(public_key_blob(key)))
}

#[derive(Serialize)]
struct Jwk {
    kty: &'static str,
    e: String,
    n: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    alg: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// JWK for the enrollment service's registration body: standard base64
/// parameters plus `alg` and an uppercase random `kid`. Compact JSON.
pub fn registration_jwk(key: &RsaPublicKey) -> String {
    let jwk = Jwk {
        kty: "RSA",
        e: STANDARD.encode(key.e().to_bytes_be()),
        n: STANDARD.encode(key.n().to_bytes_be()),
        alg: Some("RS256"),
        kid: Some(Uuid::new_v4().to_string().to_uppercase()),
    };
    serde_json::to_string(&jwk).expect("JWK serialization cannot fail")
}

/// General-purpose JWK (RFC 7517): URL-safe base64, key parameters only.
pub fn public_jwk(key: &RsaPublicKey) -> String {
    let jwk = Jwk {
        kty: "RSA",
        e: URL_SAFE.encode(key.e().to_bytes_be()),
        n: URL_SAFE.encode(key.n().to_bytes_be()),
        alg: None,
        kid: None,
    };
    serde_json::to_string(&jwk).expect("JWK serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn test_key() -> RsaPublicKey {
        // Small fixed modulus to keep the test fast; the blob layout is
        // size-agnostic.
        let n = BigUint::parse_bytes(
            b"c9c013b0e1a6ec85742eb1fafac0f77f9bf2270e0da78f6c01c8e38360e955\
              8b15e5058d8b8c4e5ffe51d25f6db0334f1e0f7a9a5ac6d321a1a046c6b5b1c5",
            16,
        )
        .unwrap();
        RsaPublicKey::new(n, BigUint::from(65537u32)).unwrap()
    }

    #[test]
    fn blob_roundtrip_preserves_public_numbers() {
        let key = test_key();
        let blob = public_key_blob(&key);

        assert_eq!(&blob[..4], b"RSA1");
        let bits = u32::from_le_bytes(blob[4..8].try_into().unwrap());
        assert_eq!(bits as usize, key.size() * 8);

        let parsed = parse_public_key_blob(&blob).unwrap();
        assert_eq!(parsed.n(), key.n());
        assert_eq!(parsed.e(), key.e());
    }

    #[test]
    fn blob_exponent_is_minimum_length_big_endian() {
        let blob = public_key_blob(&test_key());
        let exp_len = u32::from_le_bytes(blob[8..12].try_into().unwrap());
        assert_eq!(exp_len, 3);
        assert_eq!(&blob[20..23], &[0x01, 0x00, 0x01]);
    }

    #[test]
    fn rejects_garbage() {
        assert_matches!(parse_public_key_blob(b"RSA2aaaaaaaaaaaaaaaaaaaa"), Err(CngError::Magic));
        assert_matches!(parse_public_key_blob(b"RSA1"), Err(CngError::Truncated { .. }));
    }

    #[test]
    fn jwks_are_compact() {
        let key = test_key();
        let registration = registration_jwk(&key);
        let general = public_jwk(&key);

        assert!(!registration.contains(' '));
        assert!(!general.contains(' '));

        let parsed: serde_json::Value = serde_json::from_str(&registration).unwrap();
        assert_eq!(parsed["kty"], "RSA");
        assert_eq!(parsed["alg"], "RS256");
        let kid = parsed["kid"].as_str().unwrap();
        assert_eq!(kid, kid.to_uppercase());

        let parsed: serde_json::Value = serde_json::from_str(&general).unwrap();
        assert!(parsed.get("alg").is_none());
        assert!(parsed.get("kid").is_none());
    }

    #[test]
    fn key_id_is_hash_of_blob() {
        let key = test_key();
        let expected = STANDARD.encode(Sha256::digest(public_key_blob(&key)));
        assert_eq!(key_id(&key), expected);
    }
}
