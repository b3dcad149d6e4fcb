//! Client-side Entra ID (Azure AD) authentication.
//!
//! Covers the OAuth2 token grants against the v1 and v2 endpoints, device
//! registration against the enrollment service, and the Primary Refresh
//! Token protocol: device-bound PRT acquisition, session key unwrapping,
//! PRT cookies and session-key signed token requests.

pub mod aliases;
pub mod constants;
pub mod device;
pub mod error;
pub mod http;
pub mod oauth;
pub mod prt;
pub mod settings;
pub mod token;

pub use device::{DeviceAuthenticator, DeviceKey, TransportKey};
pub use error::AuthenticationError;
pub use http::{HttpClient, HttpResponse, ReqwestHttpClient};
pub use oauth::Authenticator;
pub use prt::PrtData;
pub use token::TokenData;
