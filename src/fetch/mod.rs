mod client;
mod basic;
pub mod auth;

pub use client::HttpClient;
pub use basic::BasicClient;

use std::sync::Arc;

use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use serde::{Deserialize, Serialize};

use crate::config::{FeedAuthConfig, FeedSource};
use crate::error::{FeedError, Result};
use auth::{ApiKey, UrlParam};

/// Cache validators returned by the server for the last full download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_response(resp: &reqwest::Response) -> Self {
        let header = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Sends a GET for `url`, adding `If-None-Match` / `If-Modified-Since` when
/// validators from a previous download are available.
pub async fn conditional_get<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
    validators: Option<&Validators>,
) -> Result<reqwest::Response> {
    let mut req = reqwest::Request::new(
        reqwest::Method::GET,
        url.parse().map_err(|e| FeedError::download(url, e))?,
    );

    if let Some(v) = validators {
        let headers = req.headers_mut();
        if let Some(etag) = v.etag.as_deref().and_then(|e| e.parse().ok()) {
            headers.insert(IF_NONE_MATCH, etag);
        }
        if let Some(lm) = v.last_modified.as_deref().and_then(|e| e.parse().ok()) {
            headers.insert(IF_MODIFIED_SINCE, lm);
        }
    }

    client
        .execute(req)
        .await
        .map_err(|e| FeedError::download(url, e))
}

/// Wraps `base` with the API-key decorator configured for `source`.
pub fn client_for(base: Arc<dyn HttpClient>, source: &FeedSource) -> Result<Arc<dyn HttpClient>> {
    let Some(auth) = &source.auth else {
        return Ok(base);
    };
    let key = auth.resolve_key()?;
    let client: Arc<dyn HttpClient> = match auth {
        FeedAuthConfig::UrlParam { param_name, .. } => Arc::new(UrlParam {
            inner: base,
            param_name: param_name.clone(),
            key,
        }),
        FeedAuthConfig::Header { header_name, .. } => Arc::new(ApiKey::new(base, header_name, &key)?),
        FeedAuthConfig::Bearer { .. } => Arc::new(ApiKey::bearer(base, &key)?),
    };
    Ok(client)
}
