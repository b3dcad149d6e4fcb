use entra_common::{jwe::JweError, jwt::JwtError};

use crate::http::HttpClientError;

#[derive(Debug, thiserror::Error)]
pub enum AuthenticationError {
    #[error("token endpoint returned an error: {0}")]
    TokenEndpoint(String),
    #[error("desktop SSO endpoint returned an error: {0}")]
    DesktopSso(String),
    #[error("device registration failed: {0}")]
    Enrollment(String),
    #[error("bulk enrollment failed: {0}")]
    BulkEnrollment(String),
    #[error("PKCE is not supported for authorization code redemption")]
    PkceNotSupported,
    #[error("no nonce was returned by the server")]
    NoNonce,
    #[error("the PRT cookie has no nonce and no key material was provided to re-sign it")]
    CookieWithoutNonce,
    #[error("PRT cookie signature does not match the given derived key")]
    CookieSignature,
    #[error("no authentication code was returned; the PRT cookie may be invalid or blocked by Conditional Access")]
    NoAuthorizationCode,
    #[error("authorize endpoint redirected with a fresh nonce; the old nonce may be expired")]
    StaleNonce { new_nonce: String },
    #[error("sign-in page reported: {0}")]
    SignInPage(String),
    #[error("token reply did not contain a session key JWE")]
    MissingSessionKey,
    #[error("missing {0}")]
    MissingCredential(&'static str),
    #[error("no device certificate is loaded")]
    MissingDeviceCertificate,
    #[error("no device key is loaded")]
    MissingDeviceKey,
    #[error("no transport key is loaded")]
    MissingTransportKey,
    #[error("no Windows Hello key is loaded")]
    MissingHelloKey,
    #[error("no PRT and session key are loaded")]
    MissingPrt,
    #[error("PRT is not valid UTF-8 after base64 decoding")]
    InvalidPrt,
    #[error("malformed access token: {0}")]
    AccessToken(&'static str),
    #[error("could not parse certificate: {0}")]
    Certificate(String),
    #[error("certificate request construction failed: {0}")]
    CertificateRequest(#[from] rcgen::Error),
    #[error("networking error: {0}")]
    Http(#[from] HttpClientError),
    #[error("JWT error: {0}")]
    Jwt(#[from] JwtError),
    #[error("JWE error: {0}")]
    Jwe(#[from] JweError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("header value is not valid ASCII: {0}")]
    HeaderValue(#[from] http::header::InvalidHeaderValue),
    #[error("base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("key encoding error: {0}")]
    KeyEncoding(#[from] rsa::pkcs1::Error),
    #[error("key encoding error: {0}")]
    KeyEncodingPkcs8(#[from] rsa::pkcs8::Error),
    #[error("signing failed: {0}")]
    Signing(#[from] rsa::signature::Error),
    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
