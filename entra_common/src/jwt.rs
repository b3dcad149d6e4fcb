use std::marker::PhantomData;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{crypto, Algorithm, DecodingKey, EncodingKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::utils;

pub type Result<T, E = JwtError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),
    #[error("base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed JWT: expected at least {expected} segments, found {found}")]
    Segments { expected: usize, found: usize },
    #[error("error signing JWT: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error("invalid signing key: {0}")]
    Key(#[source] jsonwebtoken::errors::Error),
    #[error("error verifying JWT: {0}")]
    Verification(#[source] jsonwebtoken::errors::Error),
    #[error("JWT signature does not match the given key")]
    SignatureMismatch,
}

/// JOSE header for the token shapes used against the identity platform.
///
/// `jsonwebtoken`'s own `Header` cannot carry the `ctx`/`kdf_ver` fields that
/// session-key signed tokens require, so headers are serialized from this
/// struct and the compact form is composed manually.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    pub typ: Option<String>,
    /// Key derivation context, standard base64.
    pub ctx: Option<String>,
    pub kdf_ver: Option<u8>,
    /// Device certificate as base64 DER. The token endpoint accepts a bare
    /// string here rather than the RFC 7515 string array.
    pub x5c: Option<String>,
    pub kid: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,
}

impl JwsHeader {
    pub fn hs256() -> Self {
        JwsHeader {
            alg: "HS256".to_string(),
            ..Default::default()
        }
    }

    pub fn rs256() -> Self {
        JwsHeader {
            alg: "RS256".to_string(),
            ..Default::default()
        }
    }
}

/// A JWT of payload type `T`, kept in compact serialized form.
#[derive(Debug, Clone)]
pub struct Jwt<T>(pub String, PhantomData<T>);

impl<T, S: Into<String>> From<S> for Jwt<T> {
    fn from(val: S) -> Self {
        Jwt(val.into(), PhantomData)
    }
}

impl<T> AsRef<str> for Jwt<T> {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<T> Jwt<T>
where
    T: Serialize,
{
    /// Sign with a raw symmetric key (session keys and keys derived from them).
    pub fn sign_hs256(claims: &T, header: &JwsHeader, key: &[u8]) -> Result<Jwt<T>> {
        Self::sign(claims, header, &EncodingKey::from_secret(key), Algorithm::HS256)
    }

    /// Sign with an RSA private key in PEM form (device and Windows Hello keys).
    pub fn sign_rs256(claims: &T, header: &JwsHeader, private_key_pem: &[u8]) -> Result<Jwt<T>> {
        let key = EncodingKey::from_rsa_pem(private_key_pem).map_err(JwtError::Key)?;
        Self::sign(claims, header, &key, Algorithm::RS256)
    }

    fn sign(claims: &T, header: &JwsHeader, key: &EncodingKey, algorithm: Algorithm) -> Result<Jwt<T>> {
        let encoded_header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
        let encoded_claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let message = [encoded_header, encoded_claims].join(".");

        let signature = crypto::sign(message.as_bytes(), key, algorithm).map_err(JwtError::Signing)?;

        Ok([message, signature].join(".").into())
    }
}

impl<T> Jwt<T>
where
    T: DeserializeOwned,
{
    /// Parse header and payload without checking the signature. Callers that
    /// only need to inspect claims (e.g. to read a nonce out of a PRT cookie)
    /// use this; token issuance paths never rely on unverified content for
    /// anything security-relevant.
    pub fn parse_unverified(&self) -> Result<(JwsHeader, T)> {
        let header = serde_json::from_slice(&self.segment(0)?)?;
        let claims = serde_json::from_slice(&self.segment(1)?)?;
        Ok((header, claims))
    }

    /// Verify an HS256 signature with the given key, then parse.
    pub fn parse_and_verify_hs256(&self, key: &[u8]) -> Result<(JwsHeader, T)> {
        let (message, signature) = self.0.rsplit_once('.').ok_or(JwtError::Segments {
            expected: 3,
            found: 1,
        })?;
        let valid = crypto::verify(
            signature,
            message.as_bytes(),
            &DecodingKey::from_secret(key),
            Algorithm::HS256,
        )
        .map_err(JwtError::Verification)?;
        if !valid {
            return Err(JwtError::SignatureMismatch);
        }
        self.parse_unverified()
    }
}

impl<T> Jwt<T> {
    /// Decode the i-th dot-separated segment (padding-tolerant base64url).
    pub fn segment(&self, index: usize) -> Result<Vec<u8>> {
        let found = self.0.split('.').count();
        let segment = self.0.split('.').nth(index).ok_or(JwtError::Segments {
            expected: index + 1,
            found,
        })?;
        Ok(utils::decode_urlsafe(segment)?)
    }

    /// The decoded payload segment. The v2 KDF derives its signing key from
    /// these exact bytes, so they must come from the serialized token rather
    /// than from re-serializing the claims.
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        self.segment(1)
    }
}

impl<T> Serialize for Jwt<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        String::serialize(&self.0, serializer)
    }
}

impl<'de, T> Deserialize<'de> for Jwt<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Jwt::from)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ToyClaims {
        refresh_token: String,
        is_primary: String,
    }

    fn toy_claims() -> ToyClaims {
        ToyClaims {
            refresh_token: "0.AXEAmP".to_string(),
            is_primary: "true".to_string(),
        }
    }

    #[test]
    fn hs256_sign_parse_roundtrip() {
        let key = crate::utils::random_bytes(32);
        let mut header = JwsHeader::hs256();
        header.ctx = Some("Y29udGV4dA==".to_string());
        header.kdf_ver = Some(2);

        let jwt = Jwt::sign_hs256(&toy_claims(), &header, &key).unwrap();

        let (parsed_header, parsed_claims) = jwt.parse_and_verify_hs256(&key).unwrap();
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_claims, toy_claims());

        // Wrong key must be rejected.
        assert_matches!(
            jwt.parse_and_verify_hs256(&crate::utils::random_bytes(32)),
            Err(JwtError::SignatureMismatch)
        );
    }

    #[test]
    fn unverified_parse_reads_header_and_claims() {
        let key = b"secret";
        let header = JwsHeader::hs256();
        let jwt = Jwt::sign_hs256(&json!({"request_nonce": "AwAB"}), &header, key).unwrap();

        let (parsed_header, claims): (JwsHeader, serde_json::Value) = jwt.parse_unverified().unwrap();
        assert_eq!(parsed_header.alg, "HS256");
        assert_eq!(claims["request_nonce"], "AwAB");
    }

    #[test]
    fn optional_header_fields_are_omitted() {
        let jwt = Jwt::sign_hs256(&toy_claims(), &JwsHeader::hs256(), b"k").unwrap();
        let header_json: serde_json::Value = serde_json::from_slice(&jwt.segment(0).unwrap()).unwrap();
        assert_eq!(header_json, json!({"alg": "HS256"}));
    }

    #[test]
    fn body_bytes_match_serialized_claims() {
        let jwt = Jwt::sign_hs256(&toy_claims(), &JwsHeader::hs256(), b"k").unwrap();
        let body = jwt.body_bytes().unwrap();
        let parsed: ToyClaims = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, toy_claims());
    }
}
