//! Key derivation for session-key bound requests.
//!
//! The identity platform derives per-request signing keys from the PRT
//! session key with an SP 800-108 counter-mode KBKDF over HMAC-SHA256. Two
//! schemes exist: the original one (v1) feeds an opaque context straight into
//! the KDF, while v2 first binds the context to the JWT body being signed by
//! hashing both together.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

const LABEL: &[u8] = b"AzureAD-SecureConversation";

/// Output size in bits, encoded into the fixed data per SP 800-108.
const DERIVED_KEY_BITS: u32 = 256;

/// Derive a 32-byte signing key from a session key and a context (KDF v1).
///
/// Counter-mode KBKDF with a 4-byte big-endian counter placed before the
/// fixed data `label || 0x00 || context || [L]_4`. The output is a single
/// HMAC-SHA256 block.
pub fn derive_key_v1(session_key: &[u8], context: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(session_key).expect("HMAC accepts keys of any length");
    mac.update(&1u32.to_be_bytes());
    mac.update(LABEL);
    mac.update(&[0]);
    mac.update(context);
    mac.update(&DERIVED_KEY_BITS.to_be_bytes());
    mac.finalize().into_bytes().into()
}

/// Derive a signing key bound to the JWT body being signed (KDF v2).
///
/// Computes `SHA256(context || jwt_body)` and feeds that into the v1 KDF.
/// Used whenever a JWT header carries `kdf_ver: 2`.
pub fn derive_key_v2(session_key: &[u8], context: &[u8], jwt_body: &[u8]) -> [u8; 32] {
    let mut digest = Sha256::new();
    digest.update(context);
    digest.update(jwt_body);
    derive_key_v1(session_key, &digest.finalize())
}

/// Fresh 24-byte KDF context.
pub fn random_context() -> [u8; 24] {
    let mut context = [0u8; 24];
    rand::thread_rng().fill(&mut context);
    context
}
