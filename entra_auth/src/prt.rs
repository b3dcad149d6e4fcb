//! Primary Refresh Token material and PRT cookie construction.

use std::{collections::HashMap, path::Path};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::info;

use entra_common::{
    jwt::{Jwt, JwsHeader},
    kdf, utils,
};

use crate::error::AuthenticationError;

/// A PRT and its session key in wire-ready form.
#[derive(Debug, Clone)]
pub struct PrtMaterial {
    pub prt: String,
    pub session_key: Vec<u8>,
}

impl PrtMaterial {
    pub fn new(prt: &str, session_key: &str) -> Result<Self, AuthenticationError> {
        Ok(PrtMaterial {
            prt: normalize_prt(prt)?,
            session_key: decode_session_key(session_key)?,
        })
    }

    /// Load from a JSON file with `refresh_token` and `session_key` fields,
    /// as written by [`save_prt_data`].
    pub fn load(path: &Path) -> Result<Self, AuthenticationError> {
        let stored: StoredPrt = serde_json::from_slice(&std::fs::read(path)?)?;
        Self::new(&stored.refresh_token, &stored.session_key)
    }
}

#[derive(Deserialize)]
struct StoredPrt {
    refresh_token: String,
    session_key: String,
}

/// Reply of a PRT request after post-processing: the session key is stored
/// hex-encoded once unwrapped, and decrypted Kerberos client keys are added
/// alongside their `tgt_*` source fields.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrtData {
    pub token_type: Option<String>,
    pub refresh_token: Option<String>,
    pub session_key: Option<String>,
    pub session_key_jwe: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: Option<serde_json::Value>,
    pub expires_on: Option<serde_json::Value>,
    pub tgt_ad: Option<String>,
    pub tgt_cloud: Option<String>,
    pub tgt_ad_sessionkey: Option<String>,
    pub tgt_cloud_sessionkey: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Persist PRT data; [`PrtMaterial::load`] reads the relevant fields back.
pub fn save_prt_data(data: &PrtData, path: &Path) -> Result<(), AuthenticationError> {
    std::fs::write(path, serde_json::to_vec_pretty(data)?)?;
    info!("saved PRT to {}", path.display());
    Ok(())
}

/// Bring a PRT into its raw form. PRTs are passed around either raw
/// (containing `.`) or base64-encoded.
pub fn normalize_prt(prt: &str) -> Result<String, AuthenticationError> {
    if prt.contains('.') {
        return Ok(prt.to_string());
    }
    let decoded = utils::decode_standard(prt)?;
    String::from_utf8(decoded).map_err(|_| AuthenticationError::InvalidPrt)
}

/// Decode a session key given as 44-character base64 or as hex.
pub fn decode_session_key(session_key: &str) -> Result<Vec<u8>, AuthenticationError> {
    if session_key.len() == 44 {
        Ok(STANDARD.decode(session_key)?)
    } else {
        Ok(hex::decode(session_key.replace(' ', ""))?)
    }
}

/// Decode a derived key or context given as hex.
pub fn decode_hex_key(value: &str) -> Result<Vec<u8>, AuthenticationError> {
    Ok(hex::decode(value.replace(' ', ""))?)
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
struct PrtCookiePayload<'a> {
    refresh_token: &'a str,
    is_primary: &'a str,
    request_nonce: Option<&'a str>,
    iat: Option<String>,
}

/// PRT cookie with a caller-derived key (legacy v1 KDF). The header carries
/// the KDF context that produced `derived_key`.
pub fn create_prt_cookie_v1(
    prt: &str,
    derived_key: &[u8],
    context: &[u8],
    nonce: &str,
) -> Result<Jwt<serde_json::Value>, AuthenticationError> {
    let mut header = JwsHeader::hs256();
    header.ctx = Some(STANDARD.encode(context));

    let payload = serde_json::to_value(PrtCookiePayload {
        refresh_token: prt,
        is_primary: "true",
        request_nonce: Some(nonce),
        iat: None,
    })?;

    Ok(Jwt::sign_hs256(&payload, &header, derived_key)?)
}

/// PRT cookie with the v2 KDF: the signing key is bound to the serialized
/// cookie body. A first pass with a throwaway key produces the canonical
/// body bytes, the derived key is computed over them, and the cookie is
/// signed again with that key. Without a nonce the cookie falls back to an
/// issued-at timestamp.
pub fn create_prt_cookie_v2(
    prt: &str,
    session_key: &[u8],
    nonce: Option<&str>,
) -> Result<Jwt<serde_json::Value>, AuthenticationError> {
    let context = kdf::random_context();
    let mut header = JwsHeader::hs256();
    header.ctx = Some(STANDARD.encode(context));
    header.kdf_ver = Some(2);

    let payload = serde_json::to_value(PrtCookiePayload {
        refresh_token: prt,
        is_primary: "true",
        request_nonce: nonce,
        iat: nonce.is_none().then(|| Utc::now().timestamp().to_string()),
    })?;

    let throwaway: Jwt<serde_json::Value> =
        Jwt::sign_hs256(&payload, &header, &utils::random_bytes(32))?;
    let body = throwaway.body_bytes()?;
    let derived_key = kdf::derive_key_v2(session_key, &context, &body);

    Ok(Jwt::sign_hs256(&payload, &header, &derived_key)?)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use entra_common::utils::random_bytes;

    use super::*;

    #[test]
    fn prt_normalization() {
        // Raw PRTs pass through untouched.
        assert_eq!(normalize_prt("0.AXEAmP.rest").unwrap(), "0.AXEAmP.rest");

        // Base64 forms are unwrapped, with or without padding.
        let encoded = STANDARD.encode("0.AXEAmP.rest");
        assert_eq!(normalize_prt(&encoded).unwrap(), "0.AXEAmP.rest");
        assert_eq!(normalize_prt(encoded.trim_end_matches('=')).unwrap(), "0.AXEAmP.rest");
    }

    #[test]
    fn session_key_accepts_base64_and_hex() {
        let key = random_bytes(32);

        let b64 = STANDARD.encode(&key);
        assert_eq!(b64.len(), 44);
        assert_eq!(decode_session_key(&b64).unwrap(), key);

        assert_eq!(decode_session_key(&hex::encode(&key)).unwrap(), key);

        // Hex with spaces, as copied out of debugger output.
        let spaced = hex::encode(&key)
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(decode_session_key(&spaced).unwrap(), key);
    }

    #[test]
    fn v1_cookie_carries_context_and_nonce() {
        let derived_key = random_bytes(32);
        let context = random_bytes(24);
        let cookie = create_prt_cookie_v1("the-prt", &derived_key, &context, "AwABAAEA").unwrap();

        let (header, claims) = cookie.parse_and_verify_hs256(&derived_key).unwrap();
        assert_eq!(header.ctx.as_deref(), Some(STANDARD.encode(&context).as_str()));
        assert_eq!(header.kdf_ver, None);
        assert_eq!(claims["refresh_token"], "the-prt");
        assert_eq!(claims["is_primary"], "true");
        assert_eq!(claims["request_nonce"], "AwABAAEA");
    }

    #[test]
    fn v2_cookie_key_is_bound_to_body() {
        let session_key = random_bytes(32);
        let cookie = create_prt_cookie_v2("the-prt", &session_key, Some("AwABAAEA")).unwrap();

        let (header, _): (_, serde_json::Value) = cookie.parse_unverified().unwrap();
        assert_eq!(header.kdf_ver, Some(2));
        let context = utils::decode_standard(header.ctx.as_deref().unwrap()).unwrap();
        assert_eq!(context.len(), 24);

        // Recompute the derived key from the context and the cookie body;
        // the signature must verify under it.
        let body = cookie.body_bytes().unwrap();
        let derived_key = kdf::derive_key_v2(&session_key, &context, &body);
        let (_, claims) = cookie.parse_and_verify_hs256(&derived_key).unwrap();
        assert_eq!(claims["request_nonce"], "AwABAAEA");
        assert!(claims.get("iat").is_none());
    }

    #[test]
    fn v2_cookie_without_nonce_uses_issued_at() {
        let cookie = create_prt_cookie_v2("the-prt", &random_bytes(32), None).unwrap();
        let (_, claims): (_, serde_json::Value) = cookie.parse_unverified().unwrap();
        assert!(claims.get("request_nonce").is_none());
        // iat is a stringified unix timestamp.
        let iat = claims["iat"].as_str().unwrap();
        assert!(iat.parse::<i64>().is_ok());
    }

    #[test]
    fn prt_data_roundtrips_through_file_format() {
        let data = PrtData {
            token_type: Some("Bearer".to_string()),
            refresh_token: Some("0.prt.value".to_string()),
            session_key: Some(hex::encode(random_bytes(32))),
            ..Default::default()
        };

        let serialized = serde_json::to_string_pretty(&data).unwrap();
        let parsed: StoredPrt = serde_json::from_str(&serialized).unwrap();
        let material = PrtMaterial::new(&parsed.refresh_token, &parsed.session_key).unwrap();
        assert_eq!(material.prt, "0.prt.value");
        assert_eq!(material.session_key.len(), 32);
    }

    #[test]
    fn invalid_session_key_is_rejected() {
        assert_matches!(
            decode_session_key("zz not hex"),
            Err(AuthenticationError::Hex(_))
        );
    }

    #[test]
    fn extra_reply_fields_are_preserved() {
        let reply = json!({
            "token_type": "Bearer",
            "refresh_token": "prt",
            "session_key_jwe": "a.b.c.d.e",
            "client_info": "eyJ1aWQi",
        });
        let data: PrtData = serde_json::from_value(reply).unwrap();
        assert_eq!(data.extra["client_info"], "eyJ1aWQi");
        let back = serde_json::to_value(&data).unwrap();
        assert_eq!(back["client_info"], "eyJ1aWQi");
    }
}
