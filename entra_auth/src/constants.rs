//! Endpoints, well-known application ids and protocol constants.

/// Authority host for the v1 and v2 token and authorize endpoints.
pub const AUTHORITY: &str = "https://login.microsoftonline.com";

/// Device enrollment service.
pub const ENROLLMENT_SERVICE: &str = "https://enterpriseregistration.windows.net/EnrollmentServer";

/// Desktop SSO trust endpoints.
pub const AUTOLOGON: &str = "https://autologon.microsoftazuread-sso.com";

/// Default public client: Azure AD PowerShell module.
pub const DEFAULT_CLIENT_ID: &str = "1b730954-1685-4b74-9bfd-dac224a7b894";

/// Default resource: Azure AD Graph.
pub const DEFAULT_RESOURCE: &str = "https://graph.windows.net/";

/// Client id used for device-bound PRT requests.
pub const PRT_CLIENT_ID: &str = "38aa3b87-a06d-4817-b275-7a316988d93b";

/// Broker client id used when bootstrapping a PRT from a refresh token.
pub const BROKER_CLIENT_ID: &str = "29d9ed98-a469-4536-ade2-f981bc1d605e";

/// Client id recorded on tokens minted through bulk enrollment.
pub const BULK_ENROLLMENT_CLIENT_ID: &str = "b90d5b8f-5503-4153-b545-b31cecfaece2";

/// Native client redirect URI for first-party desktop applications.
pub const NATIVE_CLIENT_REDIRECT_URI: &str = "https://login.microsoftonline.com/common/oauth2/nativeclient";

pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
pub const SAML_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:saml1_1-bearer";

/// Scope requested on PRTs; `aza` asks for broker capabilities, `ugs` for
/// Kerberos ticket material.
pub const PRT_SCOPE: &str = "openid aza ugs";

/// Subject placeholder in enrollment CSRs; the service assigns the real
/// device id and returns it as the certificate subject.
pub const CSR_SUBJECT_PLACEHOLDER: &str = "7E980AD9-B86D-4306-9425-9AC066FB014A";

/// Windows build advertised in device-bound PRT requests.
pub const PRT_WINDOWS_VERSION: &str = "10.0.19041.868";

/// Windows build advertised by the broker plugin.
pub const BROKER_WINDOWS_VERSION: &str = "10.0.19041.1620";

pub const DSREG_USER_AGENT: &str = "Dsreg/10.0 (Windows 10.0.19044.1826)";

/// Browser user agent presented on sign-in page requests when the caller has
/// not configured one.
pub const SIGNIN_USER_AGENT: &str =
    "Mozilla/4.0 (compatible; MSIE 7.0; Windows NT 10.0; Win64; x64; Trident/7.0; .NET4.0C; .NET4.0E)";

/// Desktop PC client identification sent on authorize and token requests
/// that emulate the Windows sign-in stack.
pub const CLIENT_SKU: &str = "PCL.Desktop";
pub const CLIENT_VERSION: &str = "3.19.7.16602";
pub const CLIENT_CPU: &str = "x64";
pub const CLIENT_OS: &str = "Microsoft Windows NT 10.0.19569.0";
pub const CLIENT_REQUEST_ID: &str = "19ac39db-81d2-4713-8046-b0b7240592be";
pub const SITE_ID: &str = "501358";
