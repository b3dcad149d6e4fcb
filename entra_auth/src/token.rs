//! Token reply decoding and the normalized token record.

use std::{collections::HashMap, path::Path};

use chrono::{DateTime, Duration, Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_aux::field_attributes::deserialize_option_number_from_string;
use serde_with::skip_serializing_none;

use entra_common::utils;

use crate::error::AuthenticationError;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Raw reply from a `/token` endpoint. Azure sends `expires_in`/`expires_on`
/// sometimes as numbers and sometimes as strings; both are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub expires_in: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub expires_on: Option<i64>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub scope: Option<String>,
    pub client_info: Option<String>,
    pub session_key_jwe: Option<String>,
    pub tgt_ad: Option<String>,
    pub tgt_cloud: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Normalized token record. Field names follow the legacy ADAL cache layout
/// so persisted files stay interchangeable with existing tooling.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub token_type: String,
    pub expires_on: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(rename = "_clientId")]
    pub client_id: Option<String>,
}

impl TokenData {
    /// Convert a `/token` reply into the normalized record. `expires_on` is
    /// taken from the reply's epoch when present, otherwise derived from
    /// `expires_in`. Tenant and client ids come from the access token's
    /// claims; a caller-supplied `client_id` wins over the `appid` claim.
    pub fn from_reply(reply: &TokenResponse, client_id: Option<&str>) -> Self {
        let expires_on = match reply.expires_on {
            Some(epoch) => format_epoch(epoch),
            None => format_datetime(Local::now() + Duration::seconds(reply.expires_in.unwrap_or_default())),
        };

        let claims = reply
            .access_token
            .as_deref()
            .and_then(|token| access_token_claims(token).ok());
        let claim = |name: &str| {
            claims
                .as_ref()
                .and_then(|claims| claims.get(name))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };

        TokenData {
            token_type: reply.token_type.clone().unwrap_or_else(|| "Bearer".to_string()),
            expires_on,
            access_token: reply.access_token.clone(),
            refresh_token: reply.refresh_token.clone(),
            id_token: reply.id_token.clone(),
            tenant_id: claim("tid"),
            client_id: client_id.map(str::to_string).or_else(|| claim("appid")),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), AuthenticationError> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, AuthenticationError> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

/// Decode the claims segment of an access token. The signature is not
/// checked; this is only used to read informational claims out of tokens the
/// server just issued to us.
pub fn access_token_claims(
    token: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, AuthenticationError> {
    let claims = token
        .split('.')
        .nth(1)
        .ok_or(AuthenticationError::AccessToken("token has no claims segment"))?;
    Ok(serde_json::from_slice(&utils::decode_urlsafe(claims)?)?)
}

/// Parse an access token into a normalized record plus its raw claims.
pub fn parse_access_token(
    token: &str,
) -> Result<(TokenData, serde_json::Map<String, serde_json::Value>), AuthenticationError> {
    let claims = access_token_claims(token)?;
    let expires = claims
        .get("exp")
        .and_then(serde_json::Value::as_i64)
        .ok_or(AuthenticationError::AccessToken("token is missing the exp claim"))?;
    let claim = |name: &str| {
        claims
            .get(name)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };

    let data = TokenData {
        token_type: "Bearer".to_string(),
        expires_on: format_epoch(expires),
        access_token: Some(token.to_string()),
        refresh_token: None,
        id_token: None,
        tenant_id: claim("tid"),
        client_id: claim("appid"),
    };

    Ok((data, claims))
}

fn format_epoch(epoch: i64) -> String {
    Local
        .timestamp_opt(epoch, 0)
        .single()
        .map_or_else(|| epoch.to_string(), format_datetime)
}

fn format_datetime(datetime: DateTime<Local>) -> String {
    datetime.format(TIME_FORMAT).to_string()
}
