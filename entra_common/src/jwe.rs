//! Compact JWE (RFC 7516) parsing and the session-key decryption paths used
//! for encrypted token replies.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use aes_gcm::{
    aead::{Aead, Payload},
    Aes256Gcm, KeyInit, Nonce,
};
use serde::Deserialize;

use crate::{kdf, utils};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum JweError {
    #[error("malformed JWE: expected 5 segments, found {0}")]
    Segments(usize),
    #[error("JSON error in JWE header: {0}")]
    Header(#[source] serde_json::Error),
    #[error("base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("JWE header is missing the key derivation context")]
    MissingContext,
    #[error("AES-GCM decryption failed, authentication tag mismatch")]
    Decryption,
    #[error("AES-CBC initialization vector must be 16 bytes, found {0}")]
    IvLength(usize),
    #[error("AES-CBC padding is invalid")]
    Padding,
    #[error("decrypted payload is not valid JSON: {0}")]
    Payload(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JweHeader {
    pub alg: Option<String>,
    pub enc: Option<String>,
    /// Key derivation context, standard base64.
    pub ctx: Option<String>,
}

/// The five segments of a compact JWE, with the header parsed. Segment
/// contents stay base64 until a decryption path needs them.
#[derive(Debug)]
pub struct CompactJwe<'a> {
    pub protected: &'a str,
    pub header: JweHeader,
    pub encrypted_key: &'a str,
    pub iv: &'a str,
    pub ciphertext: &'a str,
    pub tag: &'a str,
}

pub fn parse_compact(token: &str) -> Result<CompactJwe<'_>, JweError> {
    let segments: Vec<&str> = token.split('.').collect();
    let [protected, encrypted_key, iv, ciphertext, tag] = segments[..] else {
        return Err(JweError::Segments(segments.len()));
    };
    let header = serde_json::from_slice(&utils::decode_urlsafe(protected)?).map_err(JweError::Header)?;

    Ok(CompactJwe {
        protected,
        header,
        encrypted_key,
        iv,
        ciphertext,
        tag,
    })
}

/// Decrypt a session-key encrypted reply.
///
/// The signing key is derived (KDF v1) from the session key and the `ctx`
/// value in the JWE header. A 12-byte IV selects AES-256-GCM with the raw
/// protected header as additional data and the tag appended to the
/// ciphertext; any other IV length selects the legacy AES-256-CBC framing
/// with PKCS#7 padding, whose trailing segment is not an AEAD tag and is
/// ignored.
pub fn decrypt_with_session_key(token: &str, session_key: &[u8]) -> Result<Vec<u8>, JweError> {
    let jwe = parse_compact(token)?;
    let context = utils::decode_standard(jwe.header.ctx.as_deref().ok_or(JweError::MissingContext)?)?;
    let derived_key = kdf::derive_key_v1(session_key, &context);

    let iv = utils::decode_urlsafe(jwe.iv)?;
    let ciphertext = utils::decode_urlsafe(jwe.ciphertext)?;

    if iv.len() == 12 {
        let mut message = ciphertext;
        message.extend_from_slice(&utils::decode_urlsafe(jwe.tag)?);

        let cipher = Aes256Gcm::new_from_slice(&derived_key).expect("derived key is 32 bytes");
        cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &message,
                    aad: jwe.protected.as_bytes(),
                },
            )
            .map_err(|_| JweError::Decryption)
    } else {
        let decryptor = Aes256CbcDec::new_from_slices(&derived_key, &iv)
            .map_err(|_| JweError::IvLength(iv.len()))?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| JweError::Padding)
    }
}

/// Decrypt an authentication response that may or may not be encrypted.
/// Replies that already start with a JSON object are passed through.
pub fn decrypt_auth_response(data: &str, session_key: &[u8]) -> Result<Vec<u8>, JweError> {
    if data.starts_with("{\"") {
        return Ok(data.as_bytes().to_vec());
    }
    decrypt_with_session_key(data.trim(), session_key)
}

pub fn decrypt_auth_response_json(data: &str, session_key: &[u8]) -> Result<serde_json::Value, JweError> {
    let plaintext = decrypt_auth_response(data, session_key)?;
    serde_json::from_slice(&plaintext).map_err(JweError::Payload)
}
