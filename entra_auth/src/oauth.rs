//! OAuth2 flow engine for the v1 and v2 token endpoints, desktop SSO and
//! the PRT-cookie sign-in path.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration, Local, Utc};
use http::{
    header::{self, HeaderMap, HeaderValue},
    StatusCode,
};
use quick_xml::events::Event;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use entra_common::{jwe, jwt::{Jwt, JwsHeader}, kdf};

use crate::{
    aliases,
    constants::*,
    error::AuthenticationError,
    http::{HttpClient, HttpResponse, ReqwestHttpClient},
    prt,
    settings::Settings,
    token::{TokenData, TokenResponse},
};

/// Server challenge reply; carries the nonce used in PRT requests.
#[derive(Debug, Clone, Deserialize)]
pub struct SrvChallenge {
    #[serde(rename = "Nonce")]
    pub nonce: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Optional key material and behavior switches for
/// [`Authenticator::authenticate_with_prt_cookie`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PrtCookieOptions<'a> {
    /// KDF context matching `derived_key`, or the context to re-sign with.
    pub context: Option<&'a [u8]>,
    /// Pre-derived signing key for the cookie.
    pub derived_key: Option<&'a [u8]>,
    /// Raw session key; a derived key is computed when none is given.
    pub session_key: Option<&'a [u8]>,
    /// Check the cookie signature against the key material and stop.
    pub verify_only: bool,
    /// Redirect URI to request instead of the native client URI.
    pub redirect_uri: Option<&'a str>,
    /// Return the authorization code instead of redeeming it.
    pub return_code: bool,
}

/// Result of a PRT-cookie sign-in.
#[derive(Debug)]
pub enum CookieAuthOutcome {
    Token(TokenData),
    Code(String),
    /// `verify_only` was set and the signature checked out.
    Verified,
}

/// Drives token grants for one identity context. Owns the mutable
/// configuration bundle and the last normalized token record.
#[derive(Debug)]
pub struct Authenticator<H = ReqwestHttpClient> {
    http: H,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant: Option<String>,
    pub client_id: String,
    pub resource_uri: String,
    pub scope: Option<String>,
    pub user_agent: Option<String>,
    pub token_data: Option<TokenData>,
}

impl Authenticator<ReqwestHttpClient> {
    pub fn from_settings(settings: &Settings) -> Result<Self, AuthenticationError> {
        let http = ReqwestHttpClient::new(&settings.client_settings())?;
        let mut authenticator = Authenticator::new(http);
        authenticator.username = settings.username.clone();
        authenticator.password = settings.password.clone();
        authenticator.tenant = settings.tenant.clone();
        authenticator.set_client_id(&settings.client_id);
        authenticator.set_resource_uri(&settings.resource);
        authenticator.scope = settings.scope.clone();
        authenticator.user_agent = settings.user_agent.as_deref().map(aliases::resolve_user_agent);
        Ok(authenticator)
    }
}

impl<H: HttpClient> Authenticator<H> {
    pub fn new(http: H) -> Self {
        Authenticator {
            http,
            username: None,
            password: None,
            tenant: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            resource_uri: DEFAULT_RESOURCE.to_string(),
            scope: None,
            user_agent: None,
            token_data: None,
        }
    }

    /// Set the client id, accepting aliases.
    pub fn set_client_id(&mut self, client_id: &str) {
        self.client_id = aliases::resolve_client(client_id);
    }

    /// Set the resource URI, accepting aliases.
    pub fn set_resource_uri(&mut self, resource: &str) {
        self.resource_uri = aliases::resolve_resource(resource);
    }

    /// Set the user agent, accepting aliases.
    pub fn set_user_agent(&mut self, user_agent: &str) {
        self.user_agent = Some(aliases::resolve_user_agent(user_agent));
    }

    /// Authority URL for the configured tenant, or the given default.
    pub fn authority_url(&self, default_tenant: &str) -> String {
        let tenant = self.tenant.as_deref().unwrap_or(default_tenant);
        format!("{AUTHORITY}/{tenant}")
    }

    /// Discover whether a user is federated.
    pub async fn user_discovery(&self, username: &str) -> Result<serde_json::Value, AuthenticationError> {
        // The tenant-specific endpoint does not answer this, always use common.
        let url = format!("{AUTHORITY}/common/UserRealm/{}?api-version=2.0", quote(username));
        let response = self.http.get(&url, HeaderMap::new(), true).await?;
        if !response.is_success() {
            return Err(AuthenticationError::TokenEndpoint(response.text().into_owned()));
        }
        Ok(response.json()?)
    }

    /// Username + password against the v1 endpoint. Does not work for
    /// accounts that require multi-factor authentication.
    pub async fn authenticate_username_password(
        &mut self,
        client_secret: Option<&str>,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        let username = self.require(self.username.clone(), "username")?;
        let password = self.require(self.password.clone(), "password")?;

        let mut form = form_pairs(&[
            ("client_id", &self.client_id),
            ("grant_type", "password"),
            ("resource", &self.resource_uri),
            ("username", &username),
            ("password", &password),
        ]);
        if let Some(scope) = &self.scope {
            form.push(("scope".to_string(), scope.clone()));
        }
        push_secret(&mut form, client_secret);
        form.extend(extra_params.iter().cloned());

        let url = format!("{}/oauth2/token", self.authority_url("common"));
        let reply = self.post_token(&url, HeaderMap::new(), form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// Username + password against the identity platform v2 endpoint.
    pub async fn authenticate_username_password_v2(
        &mut self,
        client_secret: Option<&str>,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        let username = self.require(self.username.clone(), "username")?;
        let password = self.require(self.password.clone(), "password")?;
        let scope = self.require(self.scope.clone(), "scope")?;

        let mut form = form_pairs(&[
            ("client_id", &self.client_id),
            ("grant_type", "password"),
            ("scope", &scope),
            ("username", &username),
            ("password", &password),
        ]);
        push_secret(&mut form, client_secret);
        form.extend(extra_params.iter().cloned());

        let url = format!("{}/oauth2/v2.0/token", self.authority_url("organizations"));
        let reply = self.post_token(&url, HeaderMap::new(), form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// Redeem a refresh token against the v1 endpoint.
    pub async fn authenticate_with_refresh_token(
        &mut self,
        refresh_token: &str,
        client_secret: Option<&str>,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        let mut form = form_pairs(&[
            ("client_id", &self.client_id),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("resource", &self.resource_uri),
        ]);
        push_secret(&mut form, client_secret);
        form.extend(extra_params.iter().cloned());

        let url = format!("{}/oauth2/token", self.authority_url("common"));
        let reply = self.post_token(&url, HeaderMap::new(), form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// Redeem a refresh token against the v2 endpoint; requires a scope.
    pub async fn authenticate_with_refresh_token_v2(
        &mut self,
        refresh_token: &str,
        client_secret: Option<&str>,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        let scope = self.require(self.scope.clone(), "scope")?;
        let mut form = form_pairs(&[
            ("client_id", &self.client_id),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", &scope),
        ]);
        push_secret(&mut form, client_secret);
        form.extend(extra_params.iter().cloned());

        let url = format!("{}/oauth2/v2.0/token", self.authority_url("common"));
        let reply = self.post_token(&url, HeaderMap::new(), form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// Redeem an authorization code against the v1 endpoint.
    pub async fn authenticate_with_authorization_code(
        &mut self,
        code: &str,
        redirect_uri: &str,
        client_secret: Option<&str>,
        pkce_verifier: Option<&str>,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        if pkce_verifier.is_some() {
            return Err(AuthenticationError::PkceNotSupported);
        }
        let mut form = form_pairs(&[
            ("client_id", &self.client_id),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("resource", &self.resource_uri),
        ]);
        push_secret(&mut form, client_secret);
        form.extend(extra_params.iter().cloned());

        let url = format!("{}/oauth2/token", self.authority_url("common"));
        let reply = self.post_token(&url, HeaderMap::new(), form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// Redeem an authorization code against the v2 endpoint; requires a scope.
    pub async fn authenticate_with_authorization_code_v2(
        &mut self,
        code: &str,
        redirect_uri: &str,
        client_secret: Option<&str>,
        pkce_verifier: Option<&str>,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        if pkce_verifier.is_some() {
            return Err(AuthenticationError::PkceNotSupported);
        }
        let scope = self.require(self.scope.clone(), "scope")?;
        let mut form = form_pairs(&[
            ("client_id", &self.client_id),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("scope", &scope),
        ]);
        push_secret(&mut form, client_secret);
        form.extend(extra_params.iter().cloned());

        let url = format!("{}/oauth2/v2.0/token", self.authority_url("common"));
        let reply = self.post_token(&url, HeaderMap::new(), form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// Redeem an authorization code whose reply is encrypted with a PRT
    /// session key.
    pub async fn authenticate_with_code_encrypted(
        &self,
        code: &str,
        session_key: &[u8],
        redirect_uri: &str,
    ) -> Result<TokenResponse, AuthenticationError> {
        let form = form_pairs(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.client_id),
            ("client_info", "1"),
            ("windows_api_version", "2.0"),
        ]);
        let url = format!("{}/oauth2/token", self.authority_url("common"));
        let response = self.http.post_form(&url, HeaderMap::new(), form).await?;
        if !response.is_success() {
            return Err(AuthenticationError::TokenEndpoint(response.text().into_owned()));
        }
        let reply = jwe::decrypt_auth_response_json(&response.text(), session_key)?;
        Ok(serde_json::from_value(reply)?)
    }

    /// SAML 1.1 bearer assertion against the v1 endpoint.
    pub async fn authenticate_with_saml(
        &mut self,
        saml_token: &str,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        let assertion = STANDARD.encode(saml_token.as_bytes());
        let mut form = form_pairs(&[
            ("client_id", &self.client_id),
            ("grant_type", SAML_BEARER_GRANT),
            ("assertion", &assertion),
            ("resource", &self.resource_uri),
        ]);
        form.extend(extra_params.iter().cloned());

        let url = format!("{}/oauth2/token", self.authority_url("common"));
        let reply = self.post_token(&url, HeaderMap::new(), form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// SAML 1.1 bearer assertion against the v2 endpoint; requires a scope.
    pub async fn authenticate_with_saml_v2(
        &mut self,
        saml_token: &str,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        let scope = self.require(self.scope.clone(), "scope")?;
        let assertion = STANDARD.encode(saml_token.as_bytes());
        let mut form = form_pairs(&[
            ("client_id", &self.client_id),
            ("grant_type", SAML_BEARER_GRANT),
            ("assertion", &assertion),
            ("scope", &scope),
        ]);
        form.extend(extra_params.iter().cloned());

        let url = format!("{}/oauth2/v2.0/token", self.authority_url("common"));
        let reply = self.post_token(&url, HeaderMap::new(), form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// Fetch a desktop SSO token with a username and password.
    pub async fn get_desktop_sso_token(
        &self,
        username: &str,
        password: &str,
    ) -> Result<String, AuthenticationError> {
        let tenant = self.require(self.tenant.clone(), "tenant")?;
        let body = desktop_sso_userpass_envelope(&tenant, username, password);
        let url = format!(
            "{AUTOLOGON}/{tenant}/winauth/trust/2005/usernamemixed?client-request-id={CLIENT_REQUEST_ID}"
        );
        let headers = soap_headers(None)?;
        let response = self.http.post_raw(&url, headers, body).await?;
        Self::desktop_sso_token_from_reply(&response)
    }

    /// Fetch a desktop SSO token with a Kerberos ticket for the autologon
    /// service (`Negotiate` authentication).
    pub async fn get_desktop_sso_token_kerberos(
        &self,
        kerberos_token: &str,
    ) -> Result<String, AuthenticationError> {
        let tenant = self.require(self.tenant.clone(), "tenant")?;
        let body = desktop_sso_kerberos_envelope(&tenant);
        let url = format!(
            "{AUTOLOGON}/{tenant}/winauth/trust/2005/windowstransport?client-request-id={CLIENT_REQUEST_ID}"
        );
        let headers = soap_headers(Some(kerberos_token))?;
        let response = self.http.post_raw(&url, headers, body).await?;
        Self::desktop_sso_token_from_reply(&response)
    }

    fn desktop_sso_token_from_reply(response: &HttpResponse) -> Result<String, AuthenticationError> {
        let body = response.text();
        if let Some(token) = xml_element_text(&body, b"DesktopSsoToken") {
            return Ok(token);
        }
        // Surface the SOAP fault text when the service rejected the request.
        let fault = xml_element_text(&body, b"text").unwrap_or_else(|| body.into_owned());
        Err(AuthenticationError::DesktopSso(fault))
    }

    /// Redeem a desktop SSO token for an access token. The token rides in a
    /// SAML assertion wrapper on the v1 endpoint.
    pub async fn authenticate_with_desktop_sso_token(
        &mut self,
        dsso_token: &str,
        extra_params: &[(String, String)],
    ) -> Result<TokenData, AuthenticationError> {
        let claim = STANDARD.encode(format!(
            "<saml:Assertion xmlns:saml=\"urn:oasis:names:tc:SAML:1.0:assertion\">\
             <DesktopSsoToken>{dsso_token}</DesktopSsoToken></saml:Assertion>"
        ));
        let mut form = form_pairs(&[
            ("resource", &self.resource_uri),
            ("client_id", &self.client_id),
            ("grant_type", SAML_BEARER_GRANT),
            ("assertion", &claim),
        ]);
        form.extend(extra_params.iter().cloned());

        // Header names must be lowercase for the static HeaderMap insert.
        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("x-client-sku", CLIENT_SKU),
            ("x-client-ver", CLIENT_VERSION),
            ("x-client-cpu", CLIENT_CPU),
            ("x-client-os", "Microsoft Windows NT 10.0.18363.0"),
            ("x-ms-pkeyauth", "1.0"),
            ("client-request-id", CLIENT_REQUEST_ID),
            ("return-client-request-id", "true"),
        ] {
            headers.insert(name, HeaderValue::from_static(value));
        }

        let url = format!("{}/oauth2/token", self.authority_url("common"));
        let reply = self.post_token(&url, headers, form).await?;
        Ok(self.store(TokenData::from_reply(&reply, None)))
    }

    /// Obtain a bulk enrollment token. Starts the flow, then polls once a
    /// second until the service reports completion.
    pub async fn get_bulk_enrollment_token(
        &mut self,
        access_token: &str,
    ) -> Result<TokenData, AuthenticationError> {
        let headers = bearer_headers(access_token)?;
        let body = json!({
            "pid": Uuid::new_v4().to_string(),
            "name": "bulktoken",
            "exp": (Local::now() + Duration::days(90)).format("%Y-%m-%d %H:%M:%S").to_string(),
        });

        let begin_url = format!("{AUTHORITY}/webapp/bulkaadjtoken/begin");
        let response = self.http.post_json(&begin_url, headers.clone(), body).await?;
        let reply: serde_json::Value = response.json()?;

        if bulk_state(&reply)? == "CompleteError" {
            return Err(bulk_error(&reply));
        }
        let flow_token = reply["flowToken"]
            .as_str()
            .ok_or_else(|| AuthenticationError::BulkEnrollment(format!("no flow token found: {reply}")))?
            .to_string();

        info!("got flow token, polling for token creation");
        let poll_url = format!("{AUTHORITY}/webapp/bulkaadjtoken/poll/?flowtoken={flow_token}");
        loop {
            let response = self.http.get(&poll_url, headers.clone(), true).await?;
            let reply: serde_json::Value = response.json()?;
            match bulk_state(&reply)? {
                "CompleteError" => return Err(bulk_error(&reply)),
                "CompleteSuccess" => {
                    let result_data = reply["resultData"]
                        .as_str()
                        .ok_or_else(|| AuthenticationError::BulkEnrollment(format!("no result data: {reply}")))?;
                    let mut result: TokenResponse = serde_json::from_str(result_data)?;
                    // The reply carries the token in id_token form.
                    result.access_token = result.id_token.clone();
                    return Ok(self.store(TokenData::from_reply(&result, Some(BULK_ENROLLMENT_CLIENT_ID))));
                }
                _ => tokio::time::sleep(std::time::Duration::from_secs(1)).await,
            }
        }
    }

    /// Request a server challenge nonce for PRT flows.
    pub async fn get_srv_challenge(&self) -> Result<SrvChallenge, AuthenticationError> {
        request_srv_challenge(&self.http).await
    }

    /// Build an authorize URL; a scope selects the v2 endpoint, otherwise the
    /// v1 endpoint with the configured resource is used.
    pub fn build_authorize_url(
        &self,
        redirect_uri: &str,
        response_type: &str,
        scope: Option<&str>,
        state: Option<&str>,
    ) -> String {
        let tenant = self.tenant.as_deref().unwrap_or("common");
        let state = state.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

        match scope {
            Some(scope) => format!(
                "{AUTHORITY}/{}/oauth2/v2.0/authorize?response_type={}&client_id={}&scope={}&redirect_uri={}&state={}",
                quote(tenant),
                quote(response_type),
                quote(&self.client_id),
                quote(scope),
                quote(redirect_uri),
                quote(&state),
            ),
            None => format!(
                "{AUTHORITY}/{}/oauth2/authorize?response_type={}&client_id={}&resource={}&redirect_uri={}&state={}",
                quote(tenant),
                quote(response_type),
                quote(&self.client_id),
                quote(&self.resource_uri),
                quote(redirect_uri),
                quote(&state),
            ),
        }
    }

    /// Request a sign-in nonce from the sign-in page, the way a browser
    /// holding a PRT cookie does.
    pub async fn get_prt_cookie_nonce(&self) -> Result<String, AuthenticationError> {
        let params = [
            ("resource", self.resource_uri.clone()),
            ("client_id", self.client_id.clone()),
            ("response_type", "code".to_string()),
            ("haschrome", "1".to_string()),
            ("redirect_uri", NATIVE_CLIENT_REDIRECT_URI.to_string()),
            ("client-request-id", Uuid::new_v4().to_string()),
            ("x-client-SKU", CLIENT_SKU.to_string()),
            ("x-client-Ver", CLIENT_VERSION.to_string()),
            ("x-client-CPU", CLIENT_CPU.to_string()),
            ("x-client-OS", CLIENT_OS.to_string()),
            ("site_id", SITE_ID.to_string()),
            ("mscrid", Uuid::new_v4().to_string()),
        ];
        let url = format!("{AUTHORITY}/Common/oauth2/authorize/?{}", encode_query(&params));

        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(SIGNIN_USER_AGENT));
        headers.insert("ua-cpu", HeaderValue::from_static("AMD64"));

        let response = self.http.get(&url, headers, false).await?;
        if response.status == StatusCode::FOUND {
            let location = response.location().unwrap_or_default();
            return match query_param(location, "sso_nonce") {
                Some(nonce) => Ok(nonce),
                None => {
                    warn!("no nonce found in redirect");
                    Err(AuthenticationError::NoNonce)
                }
            };
        }

        // No redirect; the nonce may be embedded in the sign-in page config.
        match extract_config_json(&response.body) {
            Some(config) => config["bsso"]["nonce"]
                .as_str()
                .map(str::to_string)
                .ok_or(AuthenticationError::NoNonce),
            None => {
                warn!("no redirect or nonce config was returned");
                Err(AuthenticationError::NoNonce)
            }
        }
    }

    /// Sign in with a PRT and v1 key material (legacy KDF). The derived key
    /// is computed from the session key when only that is given.
    pub async fn authenticate_with_prt(
        &mut self,
        prt: &str,
        context: Option<&[u8]>,
        derived_key: Option<&[u8]>,
        session_key: Option<&[u8]>,
    ) -> Result<CookieAuthOutcome, AuthenticationError> {
        let (context, derived_key) = match (derived_key, session_key) {
            (Some(key), _) => {
                let context = context.ok_or(AuthenticationError::MissingCredential("context for the derived key"))?;
                (context.to_vec(), key.to_vec())
            }
            (None, Some(session_key)) => {
                let context = context.map_or_else(|| kdf::random_context().to_vec(), <[u8]>::to_vec);
                let derived = kdf::derive_key_v1(session_key, &context);
                (context, derived.to_vec())
            }
            (None, None) => return Err(AuthenticationError::MissingCredential("derived key or session key")),
        };

        let nonce = self.get_prt_cookie_nonce().await?;
        let cookie = prt::create_prt_cookie_v1(prt, &derived_key, &context, &nonce)?;
        self.authenticate_with_prt_cookie(cookie.as_ref(), PrtCookieOptions::default())
            .await
    }

    /// Sign in with a PRT and session key using the v2 KDF.
    pub async fn authenticate_with_prt_v2(
        &mut self,
        prt: &str,
        session_key: &[u8],
    ) -> Result<CookieAuthOutcome, AuthenticationError> {
        let nonce = self.get_prt_cookie_nonce().await?;
        let cookie = prt::create_prt_cookie_v2(prt, session_key, Some(&nonce))?;
        self.authenticate_with_prt_cookie(cookie.as_ref(), PrtCookieOptions::default())
            .await
    }

    /// Sign in with a PRT cookie, optionally re-signing it with the given
    /// key material first. Drives authorize → code → redemption.
    pub async fn authenticate_with_prt_cookie(
        &mut self,
        cookie: &str,
        options: PrtCookieOptions<'_>,
    ) -> Result<CookieAuthOutcome, AuthenticationError> {
        let mut cookie: Jwt<serde_json::Value> = cookie.into();
        let (_, mut claims) = cookie.parse_unverified()?;

        let mut nonce = match claims.get("request_nonce").and_then(serde_json::Value::as_str) {
            Some(nonce) => nonce.to_string(),
            None => {
                let nonce = self.get_prt_cookie_nonce().await?;
                info!("requested nonce from server to use with the PRT cookie: {nonce}");
                if options.derived_key.is_none() && options.session_key.is_none() {
                    return Err(AuthenticationError::CookieWithoutNonce);
                }
                nonce
            }
        };

        // Work out the signing key: an explicit derived key wins, otherwise
        // one is derived from the session key and the (possibly fresh) context.
        let mut context = options.context.map(<[u8]>::to_vec);
        let derived_key = match (options.derived_key, options.session_key) {
            (Some(key), _) => Some(key.to_vec()),
            (None, Some(session_key)) => {
                let ctx = context.unwrap_or_else(|| kdf::random_context().to_vec());
                let derived = kdf::derive_key_v1(session_key, &ctx);
                context = Some(ctx);
                Some(derived.to_vec())
            }
            (None, None) => None,
        };

        if let Some(key) = &derived_key {
            let (header, _) = cookie.parse_unverified()?;

            if context.is_none() || options.verify_only {
                if cookie.parse_and_verify_hs256(key).is_err() {
                    warn!("signature invalid with given derived key");
                    return Err(AuthenticationError::CookieSignature);
                }
                if options.verify_only {
                    info!("PRT cookie verified with the given derived key");
                    return Ok(CookieAuthOutcome::Verified);
                }
            }

            // A key was supplied, so the cookie is re-signed over a fresh nonce.
            nonce = self.get_prt_cookie_nonce().await?;
            claims["request_nonce"] = json!(nonce);

            let mut new_header = JwsHeader::hs256();
            match &context {
                Some(context) => {
                    new_header.ctx = Some(STANDARD.encode(context));
                    cookie = Jwt::sign_hs256(&claims, &new_header, key)?;
                    info!("re-signed PRT cookie using custom context");
                }
                None => {
                    new_header.ctx = header.ctx;
                    cookie = Jwt::sign_hs256(&claims, &new_header, key)?;
                    info!("re-signed PRT cookie using derived key");
                }
            }
        }

        let redirect_uri = options.redirect_uri.unwrap_or(NATIVE_CLIENT_REDIRECT_URI);
        let mut params = vec![
            ("client_id", self.client_id.clone()),
            ("response_type", "code".to_string()),
            ("haschrome", "1".to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client-request-id", Uuid::new_v4().to_string()),
            ("x-client-SKU", CLIENT_SKU.to_string()),
            ("x-client-Ver", CLIENT_VERSION.to_string()),
            ("x-client-CPU", CLIENT_CPU.to_string()),
            ("x-client-OS", CLIENT_OS.to_string()),
            ("site_id", SITE_ID.to_string()),
            ("sso_nonce", nonce),
            ("mscrid", Uuid::new_v4().to_string()),
        ];
        let url = if let Some(scope) = &self.scope {
            params.push(("scope", scope.clone()));
            format!("{}/oauth2/v2.0/authorize", self.authority_url("common"))
        } else {
            params.push(("resource", self.resource_uri.clone()));
            format!("{}/oauth2/authorize", self.authority_url("common"))
        };
        let url = format!("{url}?{}", encode_query(&params));

        let mut headers = HeaderMap::new();
        headers.insert("ua-cpu", HeaderValue::from_static("AMD64"));
        if self.user_agent.is_none() {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(SIGNIN_USER_AGENT));
        }
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("x-ms-RefreshTokenCredential={}", cookie.as_ref()))?,
        );

        let response = self.http.get(&url, headers, false).await?;

        if response.status == StatusCode::FOUND {
            let location = response.location().unwrap_or_default().to_string();

            if location.to_lowercase().starts_with(&redirect_uri.to_lowercase()) {
                let code = query_param(&location, "code").ok_or(AuthenticationError::NoAuthorizationCode)?;
                if options.return_code {
                    return Ok(CookieAuthOutcome::Code(code));
                }
                let token = if self.scope.is_some() {
                    self.authenticate_with_authorization_code_v2(&code, redirect_uri, None, None, &[])
                        .await?
                } else {
                    self.authenticate_with_authorization_code(&code, redirect_uri, None, None, &[])
                        .await?
                };
                return Ok(CookieAuthOutcome::Token(token));
            }

            if location.to_lowercase().contains("sso_nonce") {
                if let Some(new_nonce) = query_param(&location, "sso_nonce") {
                    warn!("redirected with new nonce, the old nonce may be expired");
                    return Err(AuthenticationError::StaleNonce { new_nonce });
                }
            }
        }

        if let Some(config) = extract_config_json(&response.body) {
            if let Some(message) = sign_in_error_message(&config) {
                return Err(AuthenticationError::SignInPage(message));
            }
        }

        Err(AuthenticationError::NoAuthorizationCode)
    }

    async fn post_token(
        &self,
        url: &str,
        headers: HeaderMap,
        form: Vec<(String, String)>,
    ) -> Result<TokenResponse, AuthenticationError> {
        let response = self.http.post_form(url, headers, form).await?;
        if !response.is_success() {
            return Err(AuthenticationError::TokenEndpoint(response.text().into_owned()));
        }
        Ok(response.json()?)
    }

    fn store(&mut self, data: TokenData) -> TokenData {
        self.token_data = Some(data.clone());
        data
    }

    fn require<T>(&self, value: Option<T>, name: &'static str) -> Result<T, AuthenticationError> {
        value.ok_or(AuthenticationError::MissingCredential(name))
    }
}

pub(crate) async fn request_srv_challenge<H: HttpClient>(http: &H) -> Result<SrvChallenge, AuthenticationError> {
    let url = format!("{AUTHORITY}/common/oauth2/token");
    let form = form_pairs(&[("grant_type", "srv_challenge")]);
    let response = http.post_form(&url, HeaderMap::new(), form).await?;
    if !response.is_success() {
        return Err(AuthenticationError::TokenEndpoint(response.text().into_owned()));
    }
    Ok(response.json()?)
}

pub(crate) fn form_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn push_secret(form: &mut Vec<(String, String)>, client_secret: Option<&str>) {
    if let Some(secret) = client_secret {
        form.push(("client_secret".to_string(), secret.to_string()));
    }
}

pub(crate) fn bearer_headers(access_token: &str) -> Result<HeaderMap, AuthenticationError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {access_token}"))?,
    );
    Ok(headers)
}

fn soap_headers(negotiate_token: Option<&str>) -> Result<HeaderMap, AuthenticationError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/soap+xml; charset=utf-8"),
    );
    headers.insert(
        "soapaction",
        HeaderValue::from_static("http://schemas.xmlsoap.org/ws/2005/02/trust/RST/Issue"),
    );
    if let Some(token) = negotiate_token {
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Negotiate {token}"))?,
        );
    }
    Ok(headers)
}

/// Percent-encode a query value (form encoding, spaces become `+`).
fn quote(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", quote(key), quote(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn bulk_state(reply: &serde_json::Value) -> Result<&str, AuthenticationError> {
    reply["state"]
        .as_str()
        .ok_or_else(|| AuthenticationError::BulkEnrollment(format!("no state returned: {reply}")))
}

fn bulk_error(reply: &serde_json::Value) -> AuthenticationError {
    let detail = reply["resultData"].as_str().map_or_else(|| reply.to_string(), str::to_string);
    AuthenticationError::BulkEnrollment(detail)
}

/// Pull the text content of the first XML element with the given local name.
fn xml_element_text(xml: &str, local_name: &[u8]) -> Option<String> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => inside = element.local_name().as_ref() == local_name,
            Ok(Event::Text(text)) if inside => return text.unescape().ok().map(|value| value.into_owned()),
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Extract the `$Config = {...}` JSON blob embedded in sign-in pages.
fn extract_config_json(body: &[u8]) -> Option<serde_json::Value> {
    let start = find_subsequence(body, b"$Config=")? + b"$Config=".len();
    let stop = find_subsequence(body, b"//]]></script>")?.checked_sub(2)?;
    let slice = body.get(start..stop)?;
    match serde_json::from_slice(slice) {
        Ok(config) => Some(config),
        Err(error) => {
            warn!("failed to parse sign-in page config JSON: {error}");
            None
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn sign_in_error_message(config: &serde_json::Value) -> Option<String> {
    let main = config["strMainMessage"].as_str()?;
    let mut message = main.to_string();
    if let Some(additional) = config["strAdditionalMessage"].as_str() {
        message = format!("{message} ({additional})");
    }
    if let Some(exception) = config["strServiceExceptionMessage"].as_str() {
        message = format!("{message}: {exception}");
    }
    Some(message)
}

fn desktop_sso_userpass_envelope(tenant: &str, username: &str, password: &str) -> String {
    let created = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let expires = (Utc::now() + Duration::minutes(10)).format("%Y-%m-%dT%H:%M:%SZ");
    let message_id = Uuid::new_v4();
    let username = quick_xml::escape::escape(username);
    let password = quick_xml::escape::escape(password);

    format!(
        r#"<?xml version='1.0' encoding='UTF-8'?>
<s:Envelope xmlns:s='http://www.w3.org/2003/05/soap-envelope' xmlns:wsse='http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd' xmlns:wsp='http://schemas.xmlsoap.org/ws/2004/09/policy' xmlns:wsu='http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd' xmlns:wsa='http://www.w3.org/2005/08/addressing' xmlns:wst='http://schemas.xmlsoap.org/ws/2005/02/trust'>
  <s:Header>
    <wsa:Action s:mustUnderstand='1'>http://schemas.xmlsoap.org/ws/2005/02/trust/RST/Issue</wsa:Action>
    <wsa:MessageID>urn:uuid:{message_id}</wsa:MessageID>
    <wsa:To s:mustUnderstand='1'>https://autologon.microsoftazuread-sso.com/{tenant}/winauth/trust/2005/usernamemixed</wsa:To>
    <wsse:Security s:mustUnderstand='1'>
      <wsu:Timestamp wsu:Id='_0'>
        <wsu:Created>{created}</wsu:Created>
        <wsu:Expires>{expires}</wsu:Expires>
      </wsu:Timestamp>
      <wsse:UsernameToken wsu:Id='uuid-{message_id}'>
        <wsse:Username>{username}</wsse:Username>
        <wsse:Password>{password}</wsse:Password>
      </wsse:UsernameToken>
    </wsse:Security>
  </s:Header>
  <s:Body>
    <wst:RequestSecurityToken Id='RST0'>
      <wst:RequestType>http://schemas.xmlsoap.org/ws/2005/02/trust/Issue</wst:RequestType>
      <wsp:AppliesTo>
        <wsa:EndpointReference>
          <wsa:Address>urn:federation:MicrosoftOnline</wsa:Address>
        </wsa:EndpointReference>
      </wsp:AppliesTo>
      <wst:KeyType>http://schemas.xmlsoap.org/ws/2005/05/identity/NoProofKey</wst:KeyType>
    </wst:RequestSecurityToken>
  </s:Body>
</s:Envelope>"#
    )
}

fn desktop_sso_kerberos_envelope(tenant: &str) -> String {
    let message_id = Uuid::new_v4();

    format!(
        r#"<?xml version='1.0' encoding='UTF-8'?>
<s:Envelope xmlns:s='http://www.w3.org/2003/05/soap-envelope' xmlns:wsp='http://schemas.xmlsoap.org/ws/2004/09/policy' xmlns:wsa='http://www.w3.org/2005/08/addressing' xmlns:wst='http://schemas.xmlsoap.org/ws/2005/02/trust'>
  <s:Header>
    <wsa:Action s:mustUnderstand='1'>http://schemas.xmlsoap.org/ws/2005/02/trust/RST/Issue</wsa:Action>
    <wsa:MessageID>urn:uuid:{message_id}</wsa:MessageID>
    <wsa:To s:mustUnderstand='1'>https://autologon.microsoftazuread-sso.com/{tenant}/winauth/trust/2005/windowstransport</wsa:To>
  </s:Header>
  <s:Body>
    <wst:RequestSecurityToken Id='RST0'>
      <wst:RequestType>http://schemas.xmlsoap.org/ws/2005/02/trust/Issue</wst:RequestType>
      <wsp:AppliesTo>
        <wsa:EndpointReference>
          <wsa:Address>urn:federation:MicrosoftOnline</wsa:Address>
        </wsa:EndpointReference>
      </wsp:AppliesTo>
      <wst:KeyType>http://schemas.xmlsoap.org/ws/2005/05/identity/NoProofKey</wst:KeyType>
    </wst:RequestSecurityToken>
  </s:Body>
</s:Envelope>"#
    )
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use entra_common::utils::random_bytes;

    use crate::{
        http::MockHttpClient,
        token::test_support::fake_access_token,
    };

    use super::*;

    const TENANT_ID: &str = "6287f28f-4f7f-4322-9651-a8697d8fe1bc";

    fn json_response(body: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    fn text_response(status: StatusCode, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn redirect_response(location: &str) -> HttpResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_str(location).unwrap());
        HttpResponse {
            status: StatusCode::FOUND,
            headers,
            body: Vec::new(),
        }
    }

    fn token_reply() -> serde_json::Value {
        json!({
            "token_type": "Bearer",
            "expires_in": "3600",
            "access_token": fake_access_token(json!({
                "tid": TENANT_ID,
                "appid": DEFAULT_CLIENT_ID,
                "exp": 1700000000,
            })),
            "refresh_token": "R",
        })
    }

    fn form_value<'a>(form: &'a [(String, String)], key: &str) -> Option<&'a str> {
        form.iter().find(|(name, _)| name == key).map(|(_, value)| value.as_str())
    }

    #[tokio::test]
    async fn password_flow_posts_to_v1_endpoint_and_normalizes() {
        let mut http = MockHttpClient::new();
        http.expect_post_form()
            .withf(|url, _, form| {
                url == "https://login.microsoftonline.com/common/oauth2/token"
                    && form_value(form, "grant_type") == Some("password")
                    && form_value(form, "resource") == Some("https://graph.windows.net/")
                    && form_value(form, "username") == Some("user@tenant.onmicrosoft.com")
                    && form_value(form, "password") == Some("Passw0rd")
                    && form_value(form, "scope").is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(json_response(token_reply())));

        let mut authenticator = Authenticator::new(http);
        authenticator.username = Some("user@tenant.onmicrosoft.com".to_string());
        authenticator.password = Some("Passw0rd".to_string());

        let data = authenticator.authenticate_username_password(None, &[]).await.unwrap();
        assert_eq!(data.token_type, "Bearer");
        assert_eq!(data.tenant_id.as_deref(), Some(TENANT_ID));
        assert_eq!(data.client_id.as_deref(), Some(DEFAULT_CLIENT_ID));
        assert_eq!(data.refresh_token.as_deref(), Some("R"));
        assert!(!data.expires_on.is_empty());
        assert_eq!(authenticator.token_data, Some(data));
    }

    #[tokio::test]
    async fn refresh_flow_with_scope_targets_v2_endpoint() {
        let mut http = MockHttpClient::new();
        http.expect_post_form()
            .withf(|url, _, form| {
                url == "https://login.microsoftonline.com/common/oauth2/v2.0/token"
                    && form_value(form, "grant_type") == Some("refresh_token")
                    && form_value(form, "refresh_token") == Some("R")
                    && form_value(form, "scope") == Some("openid profile")
                    && form_value(form, "resource").is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(json_response(token_reply())));

        let mut authenticator = Authenticator::new(http);
        authenticator.scope = Some("openid profile".to_string());

        authenticator
            .authenticate_with_refresh_token_v2("R", None, &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_success_status_surfaces_raw_body() {
        let mut http = MockHttpClient::new();
        http.expect_post_form().returning(|_, _, _| {
            Ok(text_response(
                StatusCode::BAD_REQUEST,
                r#"{"error":"invalid_grant","error_description":"AADSTS70008"}"#,
            ))
        });

        let mut authenticator = Authenticator::new(http);
        let error = authenticator
            .authenticate_with_refresh_token("R", None, &[])
            .await
            .unwrap_err();
        assert_matches!(error, AuthenticationError::TokenEndpoint(body) if body.contains("AADSTS70008"));
    }

    #[tokio::test]
    async fn extra_params_are_merged_after_fixed_fields() {
        let mut http = MockHttpClient::new();
        http.expect_post_form()
            .withf(|_, _, form| {
                form.last().map(|(name, value)| (name.as_str(), value.as_str())) == Some(("claims", "{}"))
            })
            .returning(|_, _, _| Ok(json_response(token_reply())));

        let mut authenticator = Authenticator::new(http);
        authenticator
            .authenticate_with_refresh_token("R", None, &[("claims".to_string(), "{}".to_string())])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pkce_verifier_is_rejected() {
        let mut authenticator = Authenticator::new(MockHttpClient::new());
        let error = authenticator
            .authenticate_with_authorization_code("code", "https://x/y", None, Some("verifier"), &[])
            .await
            .unwrap_err();
        assert_matches!(error, AuthenticationError::PkceNotSupported);
    }

    #[test]
    fn authorize_url_v2_literal() {
        let mut authenticator = Authenticator::new(MockHttpClient::new());
        authenticator.tenant = Some("T".to_string());
        authenticator.client_id = "C".to_string();

        let url = authenticator.build_authorize_url("https://x/y", "code", Some("S"), Some("S0"));
        assert_eq!(
            url,
            "https://login.microsoftonline.com/T/oauth2/v2.0/authorize?response_type=code&client_id=C&scope=S&redirect_uri=https%3A%2F%2Fx%2Fy&state=S0"
        );
    }

    #[test]
    fn authorize_url_v1_uses_resource_and_random_state() {
        let mut authenticator = Authenticator::new(MockHttpClient::new());
        authenticator.resource_uri = "https://graph.windows.net/".to_string();

        let url = authenticator.build_authorize_url("https://x/y", "code", None, None);
        assert!(url.starts_with(
            "https://login.microsoftonline.com/common/oauth2/authorize?response_type=code&client_id=1b730954-1685-4b74-9bfd-dac224a7b894&resource=https%3A%2F%2Fgraph.windows.net%2F&redirect_uri=https%3A%2F%2Fx%2Fy&state="
        ));
        // The generated state is a UUID.
        let state = url.rsplit("state=").next().unwrap();
        assert!(Uuid::parse_str(state).is_ok());
    }

    #[tokio::test]
    async fn srv_challenge_returns_nonce() {
        let mut http = MockHttpClient::new();
        http.expect_post_form()
            .withf(|url, _, form| {
                url == "https://login.microsoftonline.com/common/oauth2/token"
                    && *form == form_pairs(&[("grant_type", "srv_challenge")])
            })
            .returning(|_, _, _| Ok(json_response(json!({"Nonce": "AwABAAEA", "Type": "nonce"}))));

        let authenticator = Authenticator::new(http);
        let challenge = authenticator.get_srv_challenge().await.unwrap();
        assert_eq!(challenge.nonce, "AwABAAEA");
        assert_eq!(challenge.extra["Type"], "nonce");
    }

    #[tokio::test]
    async fn desktop_sso_token_is_extracted_from_envelope() {
        let mut http = MockHttpClient::new();
        http.expect_post_raw()
            .withf(|url, headers, body| {
                url.starts_with("https://autologon.microsoftazuread-sso.com/tenant.example/winauth/trust/2005/usernamemixed")
                    && headers.get("SOAPAction").is_some()
                    && body.contains("<wsse:Username>user&amp;name</wsse:Username>")
            })
            .returning(|_, _, _| {
                Ok(text_response(
                    StatusCode::OK,
                    "<S:Envelope><S:Body><DesktopSsoToken>dGhlLXRva2Vu</DesktopSsoToken></S:Body></S:Envelope>",
                ))
            });

        let mut authenticator = Authenticator::new(http);
        authenticator.tenant = Some("tenant.example".to_string());

        let token = authenticator
            .get_desktop_sso_token("user&name", "hunter2")
            .await
            .unwrap();
        assert_eq!(token, "dGhlLXRva2Vu");
    }

    #[tokio::test]
    async fn desktop_sso_fault_text_is_surfaced() {
        let mut http = MockHttpClient::new();
        http.expect_post_raw().returning(|_, _, _| {
            Ok(text_response(
                StatusCode::OK,
                "<S:Envelope><psf:text>Authentication Failure</psf:text></S:Envelope>",
            ))
        });

        let mut authenticator = Authenticator::new(http);
        authenticator.tenant = Some("tenant.example".to_string());

        let error = authenticator.get_desktop_sso_token("u", "p").await.unwrap_err();
        assert_matches!(error, AuthenticationError::DesktopSso(text) if text == "Authentication Failure");
    }

    #[tokio::test]
    async fn prt_cookie_nonce_comes_from_redirect() {
        let mut http = MockHttpClient::new();
        http.expect_get()
            .withf(|url, headers, follow_redirects| {
                url.starts_with("https://login.microsoftonline.com/Common/oauth2/authorize/?resource=")
                    && headers.get(header::USER_AGENT).is_some()
                    && !follow_redirects
            })
            .returning(|_, _, _| {
                Ok(redirect_response(
                    "https://login.microsoftonline.com/common/oauth2/authorize?sso_nonce=AwABEAEA",
                ))
            });

        let authenticator = Authenticator::new(http);
        assert_eq!(authenticator.get_prt_cookie_nonce().await.unwrap(), "AwABEAEA");
    }

    #[tokio::test]
    async fn prt_cookie_nonce_falls_back_to_page_config() {
        let mut http = MockHttpClient::new();
        http.expect_get().returning(|_, _, _| {
            Ok(text_response(
                StatusCode::OK,
                "<script>$Config={\"bsso\":{\"nonce\":\"AwABFQEA\"}};\n//]]></script>",
            ))
        });

        let authenticator = Authenticator::new(http);
        assert_eq!(authenticator.get_prt_cookie_nonce().await.unwrap(), "AwABFQEA");
    }

    #[tokio::test]
    async fn cookie_redemption_extracts_code_and_redeems_it() {
        let session_key = random_bytes(32);
        let cookie = crate::prt::create_prt_cookie_v2("the-prt", &session_key, Some("AwABAAEA")).unwrap();
        let cookie_string = cookie.as_ref().to_string();

        let mut http = MockHttpClient::new();
        let expected_cookie = format!("x-ms-RefreshTokenCredential={cookie_string}");
        http.expect_get()
            .withf(move |url, headers, follow_redirects| {
                let sent_cookie = headers
                    .get(header::COOKIE)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default();
                url.starts_with("https://login.microsoftonline.com/common/oauth2/authorize?")
                    && url.contains("sso_nonce=AwABAAEA")
                    && sent_cookie == expected_cookie
                    && !follow_redirects
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(redirect_response(
                    "https://login.microsoftonline.com/common/oauth2/nativeclient?code=ABC&state=123",
                ))
            });
        http.expect_post_form()
            .withf(|url, _, form| {
                url == "https://login.microsoftonline.com/common/oauth2/token"
                    && form_value(form, "grant_type") == Some("authorization_code")
                    && form_value(form, "code") == Some("ABC")
                    && form_value(form, "redirect_uri") == Some(NATIVE_CLIENT_REDIRECT_URI)
            })
            .times(1)
            .returning(|_, _, _| Ok(json_response(token_reply())));

        let mut authenticator = Authenticator::new(http);
        let outcome = authenticator
            .authenticate_with_prt_cookie(&cookie_string, PrtCookieOptions::default())
            .await
            .unwrap();

        assert_matches!(outcome, CookieAuthOutcome::Token(data) if data.refresh_token.as_deref() == Some("R"));
    }

    #[tokio::test]
    async fn cookie_redemption_surfaces_fresh_nonce() {
        let mut http = MockHttpClient::new();
        http.expect_get().returning(|_, _, _| {
            Ok(redirect_response(
                "https://login.microsoftonline.com/common/oauth2/authorize?sso_nonce=NEWNONCE",
            ))
        });

        let session_key = random_bytes(32);
        let cookie = crate::prt::create_prt_cookie_v2("the-prt", &session_key, Some("OLD")).unwrap();

        let mut authenticator = Authenticator::new(http);
        let error = authenticator
            .authenticate_with_prt_cookie(cookie.as_ref(), PrtCookieOptions::default())
            .await
            .unwrap_err();
        assert_matches!(error, AuthenticationError::StaleNonce { new_nonce } if new_nonce == "NEWNONCE");
    }

    #[tokio::test]
    async fn cookie_redemption_surfaces_sts_error_page() {
        let mut http = MockHttpClient::new();
        let config = json!({
            "strMainMessage": "Your sign-in was blocked",
            "strServiceExceptionMessage": "AADSTS53003",
        });
        let body = format!("<script>$Config={config};\n//]]></script>");
        http.expect_get().returning(move |_, _, _| Ok(text_response(StatusCode::OK, &body)));

        let session_key = random_bytes(32);
        let cookie = crate::prt::create_prt_cookie_v2("the-prt", &session_key, Some("N")).unwrap();

        let mut authenticator = Authenticator::new(http);
        let error = authenticator
            .authenticate_with_prt_cookie(cookie.as_ref(), PrtCookieOptions::default())
            .await
            .unwrap_err();
        assert_matches!(
            error,
            AuthenticationError::SignInPage(message)
                if message.contains("Your sign-in was blocked") && message.contains("AADSTS53003")
        );
    }

    #[tokio::test]
    async fn cookie_without_nonce_and_without_keys_is_rejected() {
        let mut http = MockHttpClient::new();
        http.expect_get().returning(|_, _, _| {
            Ok(redirect_response(
                "https://login.microsoftonline.com/common/oauth2/authorize?sso_nonce=FRESH",
            ))
        });

        // Cookie with an iat instead of a nonce.
        let cookie = crate::prt::create_prt_cookie_v2("the-prt", &random_bytes(32), None).unwrap();

        let mut authenticator = Authenticator::new(http);
        let error = authenticator
            .authenticate_with_prt_cookie(cookie.as_ref(), PrtCookieOptions::default())
            .await
            .unwrap_err();
        assert_matches!(error, AuthenticationError::CookieWithoutNonce);
    }

    #[tokio::test]
    async fn verify_only_checks_cookie_signature() {
        let session_key = random_bytes(32);
        let derived_key;
        let cookie;
        {
            let context = random_bytes(24);
            derived_key = kdf::derive_key_v1(&session_key, &context);
            cookie = crate::prt::create_prt_cookie_v1("the-prt", &derived_key, &context, "AwAB").unwrap();
        }

        let mut authenticator = Authenticator::new(MockHttpClient::new());
        let outcome = authenticator
            .authenticate_with_prt_cookie(
                cookie.as_ref(),
                PrtCookieOptions {
                    derived_key: Some(&derived_key),
                    verify_only: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_matches!(outcome, CookieAuthOutcome::Verified);

        // A wrong key must fail the check.
        let wrong_key = random_bytes(32);
        let error = authenticator
            .authenticate_with_prt_cookie(
                cookie.as_ref(),
                PrtCookieOptions {
                    derived_key: Some(&wrong_key),
                    verify_only: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_matches!(error, AuthenticationError::CookieSignature);
    }

    #[tokio::test]
    async fn bulk_enrollment_error_state_is_surfaced() {
        let mut http = MockHttpClient::new();
        http.expect_post_json().returning(|_, _, _| {
            Ok(json_response(json!({
                "state": "CompleteError",
                "resultData": "MSA accounts cannot do this",
            })))
        });

        let mut authenticator = Authenticator::new(http);
        let error = authenticator.get_bulk_enrollment_token("token").await.unwrap_err();
        assert_matches!(
            error,
            AuthenticationError::BulkEnrollment(detail) if detail == "MSA accounts cannot do this"
        );
    }

    #[tokio::test]
    async fn bulk_enrollment_polls_until_success() {
        let mut http = MockHttpClient::new();
        http.expect_post_json()
            .withf(|url, headers, body| {
                url == "https://login.microsoftonline.com/webapp/bulkaadjtoken/begin"
                    && headers.get(header::AUTHORIZATION).is_some()
                    && body["name"] == "bulktoken"
                    && body["exp"].is_string()
                    && body["pid"].is_string()
            })
            .times(1)
            .returning(|_, _, _| Ok(json_response(json!({"state": "Running", "flowToken": "FT"}))));

        let id_token = fake_access_token(json!({"tid": TENANT_ID, "exp": 1700000000}));
        let result_data =
            serde_json::to_string(&json!({"token_type": "Bearer", "expires_in": 3600, "id_token": id_token}))
                .unwrap();
        http.expect_get()
            .withf(|url, _, _| {
                url == "https://login.microsoftonline.com/webapp/bulkaadjtoken/poll/?flowtoken=FT"
            })
            .times(1)
            .returning(move |_, _, _| {
                Ok(json_response(json!({"state": "CompleteSuccess", "resultData": result_data})))
            });

        let mut authenticator = Authenticator::new(http);
        let data = authenticator.get_bulk_enrollment_token("token").await.unwrap();
        assert_eq!(data.client_id.as_deref(), Some(BULK_ENROLLMENT_CLIENT_ID));
        // The id_token doubles as the access token in this flow.
        assert!(data.access_token.is_some());
        assert_eq!(data.access_token, data.id_token);
        assert_eq!(data.tenant_id.as_deref(), Some(TENANT_ID));
    }

    #[tokio::test]
    async fn user_discovery_quotes_the_username() {
        let mut http = MockHttpClient::new();
        http.expect_get()
            .withf(|url, _, _| {
                url == "https://login.microsoftonline.com/common/UserRealm/user%40tenant.example?api-version=2.0"
            })
            .returning(|_, _, _| Ok(json_response(json!({"NameSpaceType": "Managed"}))));

        let authenticator = Authenticator::new(http);
        let realm = authenticator.user_discovery("user@tenant.example").await.unwrap();
        assert_eq!(realm["NameSpaceType"], "Managed");
    }
}
