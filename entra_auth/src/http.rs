//! Injectable HTTP transport.
//!
//! The flow engines never construct HTTP clients themselves; they consume an
//! implementation of [`HttpClient`]. The [`ReqwestHttpClient`] implementation
//! carries two inner clients so that individual requests can opt out of
//! redirect following, which the authorize endpoints require.

use std::{borrow::Cow, time::Duration};

use http::{header, HeaderMap, StatusCode};
use reqwest::redirect::Policy;
use serde::de::DeserializeOwned;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("networking error: {0}")]
    Networking(#[from] reqwest::Error),
    #[error("could not construct HTTP client: {0}")]
    Builder(#[source] reqwest::Error),
    #[error("invalid proxy URL: {0}")]
    Proxy(#[source] reqwest::Error),
    #[error("invalid client certificate or key: {0}")]
    Identity(#[source] reqwest::Error),
}

/// Transport-level settings shared by every request a client makes.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub proxy: Option<String>,
    pub verify_tls: bool,
    pub user_agent: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            proxy: None,
            verify_tls: true,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get(header::LOCATION).and_then(|value| value.to_str().ok())
    }
}

#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait HttpClient {
    async fn get(
        &self,
        url: &str,
        headers: HeaderMap,
        follow_redirects: bool,
    ) -> Result<HttpResponse, HttpClientError>;

    async fn post_form(
        &self,
        url: &str,
        headers: HeaderMap,
        form: Vec<(String, String)>,
    ) -> Result<HttpResponse, HttpClientError>;

    async fn post_json(
        &self,
        url: &str,
        headers: HeaderMap,
        body: serde_json::Value,
    ) -> Result<HttpResponse, HttpClientError>;

    /// POST a raw body (SOAP envelopes); the content type rides in `headers`.
    async fn post_raw(
        &self,
        url: &str,
        headers: HeaderMap,
        body: String,
    ) -> Result<HttpResponse, HttpClientError>;

    async fn delete(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, HttpClientError>;
}

/// [`HttpClient`] over a [`reqwest::Client`] pair.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    no_redirect_client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, HttpClientError> {
        let client = Self::builder(settings)?.build().map_err(HttpClientError::Builder)?;
        let no_redirect_client = Self::builder(settings)?
            .redirect(Policy::none())
            .build()
            .map_err(HttpClientError::Builder)?;

        Ok(ReqwestHttpClient {
            client,
            no_redirect_client,
        })
    }

    /// Client that presents a TLS client certificate, for endpoints that
    /// authenticate the device via mutual TLS (device deletion).
    pub fn with_client_certificate(
        settings: &ClientSettings,
        certificate_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<Self, HttpClientError> {
        let mut identity_pem = Vec::with_capacity(certificate_pem.len() + key_pem.len() + 1);
        identity_pem.extend_from_slice(key_pem);
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(certificate_pem);
        let identity = reqwest::Identity::from_pem(&identity_pem).map_err(HttpClientError::Identity)?;

        let client = Self::builder(settings)?
            .identity(identity.clone())
            .build()
            .map_err(HttpClientError::Builder)?;
        let no_redirect_client = Self::builder(settings)?
            .identity(identity)
            .redirect(Policy::none())
            .build()
            .map_err(HttpClientError::Builder)?;

        Ok(ReqwestHttpClient {
            client,
            no_redirect_client,
        })
    }

    fn builder(settings: &ClientSettings) -> Result<reqwest::ClientBuilder, HttpClientError> {
        let mut builder = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT);
        if let Some(proxy) = &settings.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(HttpClientError::Proxy)?);
        }
        if !settings.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(user_agent) = &settings.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(builder)
    }

    fn client_for(&self, follow_redirects: bool) -> &reqwest::Client {
        if follow_redirects {
            &self.client
        } else {
            &self.no_redirect_client
        }
    }

    async fn into_response(response: reqwest::Response) -> Result<HttpResponse, HttpClientError> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse { status, headers, body })
    }
}

impl HttpClient for ReqwestHttpClient {
    async fn get(
        &self,
        url: &str,
        headers: HeaderMap,
        follow_redirects: bool,
    ) -> Result<HttpResponse, HttpClientError> {
        let response = self.client_for(follow_redirects).get(url).headers(headers).send().await?;
        Self::into_response(response).await
    }

    async fn post_form(
        &self,
        url: &str,
        headers: HeaderMap,
        form: Vec<(String, String)>,
    ) -> Result<HttpResponse, HttpClientError> {
        let response = self.client.post(url).headers(headers).form(&form).send().await?;
        Self::into_response(response).await
    }

    async fn post_json(
        &self,
        url: &str,
        headers: HeaderMap,
        body: serde_json::Value,
    ) -> Result<HttpResponse, HttpClientError> {
        let response = self.client.post(url).headers(headers).json(&body).send().await?;
        Self::into_response(response).await
    }

    async fn post_raw(
        &self,
        url: &str,
        headers: HeaderMap,
        body: String,
    ) -> Result<HttpResponse, HttpClientError> {
        let response = self.client.post(url).headers(headers).body(body).send().await?;
        Self::into_response(response).await
    }

    async fn delete(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, HttpClientError> {
        let response = self.client.delete(url).headers(headers).send().await?;
        Self::into_response(response).await
    }
}
