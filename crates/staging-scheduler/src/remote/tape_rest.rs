// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the WLCG tape REST API.
//!
//! The API base of a storage endpoint is discovered once through
//! `/.well-known/wlcg-tape-rest-api` and cached per authority. Staging
//! requests are created with `POST {api}/stage`, whose request id is the
//! bring-online token, and followed with `GET {api}/stage/{id}`. Deletion is
//! a plain `DELETE` on every URL.
//!
//! Transport and HTTP failures are mapped to errno codes so the retry rules
//! apply to them unchanged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::*;

const DISCOVERY_PATH: &str = "/.well-known/wlcg-tape-rest-api";
const API_VERSION: &str = "v1";

type EndpointCache = Arc<Mutex<HashMap<String, String>>>;

#[derive(Debug, Deserialize)]
struct Discovery {
    #[serde(default)]
    endpoints: Vec<DiscoveredEndpoint>,
}

#[derive(Debug, Deserialize)]
struct DiscoveredEndpoint {
    uri: String,
    version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StageFile<'a> {
    path: &'a str,
    disk_lifetime: String,
}

#[derive(Debug, Serialize)]
struct StageRequest<'a> {
    files: Vec<StageFile<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageCreated {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct StageStatus {
    #[serde(default)]
    files: Vec<FileStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileStatus {
    path: String,
    #[serde(default)]
    on_disk: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelPaths<'a> {
    paths: Vec<&'a str>,
}

/// Tape REST client.
#[derive(Clone)]
pub struct TapeRestClient {
    timeout: Duration,
    endpoints: EndpointCache,
}

impl TapeRestClient {
    /// Create a client whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for TapeRestClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

fn build_http(
    timeout: Duration,
    identity: Option<reqwest::Identity>,
) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(identity) = identity {
        builder = builder.identity(identity);
    }
    builder.build()
}

#[async_trait]
impl RemoteStagingClient for TapeRestClient {
    fn client_type(&self) -> &'static str {
        "tape-rest"
    }

    async fn open_session(
        &self,
        operation: Operation,
        _config: &SessionConfig,
    ) -> Result<Box<dyn RemoteSession>> {
        let http = build_http(self.timeout, None).map_err(|e| RemoteError::SessionInit {
            operation,
            code: Errno::EIO as i32,
            message: e.to_string(),
        })?;
        Ok(Box::new(TapeRestSession {
            http,
            timeout: self.timeout,
            endpoints: self.endpoints.clone(),
        }))
    }
}

struct TapeRestSession {
    http: reqwest::Client,
    timeout: Duration,
    endpoints: EndpointCache,
}

fn transport_error(e: reqwest::Error) -> UrlError {
    if e.is_timeout() {
        UrlError::new(Errno::ETIMEDOUT as i32, format!("Connection timed out: {e}"))
    } else if let Some(status) = e.status() {
        status_error(status, &e.to_string())
    } else if e.is_connect() {
        UrlError::new(Errno::ECONNREFUSED as i32, e.to_string())
    } else {
        UrlError::new(Errno::EIO as i32, e.to_string())
    }
}

fn status_error(status: StatusCode, message: &str) -> UrlError {
    let code = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Errno::EACCES,
        StatusCode::NOT_FOUND => Errno::ENOENT,
        StatusCode::SERVICE_UNAVAILABLE => Errno::EAGAIN,
        _ => Errno::EIO,
    };
    let message = if message.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {message}")
    };
    UrlError::new(code as i32, message)
}

async fn expect_success(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, UrlError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body.trim()))
}

fn parse_surl(surl: &str) -> std::result::Result<Url, UrlError> {
    Url::parse(surl).map_err(|e| UrlError::new(Errno::EINVAL as i32, format!("{surl}: {e}")))
}

fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}://{}:{}", url.scheme(), host, port),
        (Some(host), None) => format!("{}://{}", url.scheme(), host),
        (None, _) => url.scheme().to_string(),
    }
}

fn file_path(surl: &str) -> String {
    Url::parse(surl)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| surl.to_string())
}

fn fail_all<T: Clone>(count: usize, error: T) -> Vec<Option<T>> {
    vec![Some(error); count]
}

impl TapeRestSession {
    async fn api_base(&self, surl: &str) -> std::result::Result<String, UrlError> {
        let url = parse_surl(surl)?;
        let authority = authority(&url);

        let cached = self
            .endpoints
            .lock()
            .ok()
            .and_then(|cache| cache.get(&authority).cloned());
        if let Some(base) = cached {
            return Ok(base);
        }

        let response = self
            .http
            .get(format!("{authority}{DISCOVERY_PATH}"))
            .send()
            .await
            .map_err(transport_error)?;
        let discovery: Discovery = expect_success(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let endpoint = discovery
            .endpoints
            .into_iter()
            .find(|e| e.version == API_VERSION)
            .ok_or_else(|| {
                UrlError::new(
                    Errno::EOPNOTSUPP as i32,
                    format!("{authority} has no {API_VERSION} tape REST endpoint"),
                )
            })?;
        let base = endpoint.uri.trim_end_matches('/').to_string();
        debug!(authority = %authority, api = %base, "Discovered tape REST endpoint");

        if let Ok(mut cache) = self.endpoints.lock() {
            cache.insert(authority, base.clone());
        }
        Ok(base)
    }

    async fn create_stage(
        &self,
        urls: &[String],
        pin_lifetime: i64,
    ) -> std::result::Result<String, UrlError> {
        let first = urls
            .first()
            .ok_or_else(|| UrlError::new(Errno::EINVAL as i32, "no url to stage"))?;
        let base = self.api_base(first).await?;

        let paths: Vec<String> = urls.iter().map(|u| file_path(u)).collect();
        let body = StageRequest {
            files: paths
                .iter()
                .map(|path| StageFile {
                    path,
                    disk_lifetime: format!("PT{}S", pin_lifetime.max(0)),
                })
                .collect(),
        };

        let response = self
            .http
            .post(format!("{base}/stage"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let created: StageCreated = expect_success(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(created.request_id)
    }

    async fn stage_status(
        &self,
        token: &str,
        urls: &[String],
    ) -> std::result::Result<StageStatus, UrlError> {
        let first = urls
            .first()
            .ok_or_else(|| UrlError::new(Errno::EINVAL as i32, "no url to poll"))?;
        let base = self.api_base(first).await?;
        let response = self
            .http
            .get(format!("{base}/stage/{token}"))
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(response)
            .await?
            .json()
            .await
            .map_err(transport_error)
    }

    async fn cancel_stage(&self, token: &str, urls: &[String]) -> std::result::Result<(), UrlError> {
        let first = urls
            .first()
            .ok_or_else(|| UrlError::new(Errno::EINVAL as i32, "no url to cancel"))?;
        let base = self.api_base(first).await?;
        let paths: Vec<String> = urls.iter().map(|u| file_path(u)).collect();
        let response = self
            .http
            .post(format!("{base}/stage/{token}/cancel"))
            .json(&CancelPaths {
                paths: paths.iter().map(String::as_str).collect(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(response).await.map(|_| ())
    }

    async fn delete(&self, surl: &str) -> std::result::Result<(), UrlError> {
        let url = parse_surl(surl)?;
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(response).await.map(|_| ())
    }
}

#[async_trait]
impl RemoteSession for TapeRestSession {
    fn set_credential(&mut self, proxy_path: &str) -> Result<()> {
        let option_error = |message: String| RemoteError::Option {
            option: "X509 credential",
            message,
        };
        let pem = std::fs::read(proxy_path).map_err(|e| option_error(format!("{proxy_path}: {e}")))?;
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| option_error(e.to_string()))?;
        self.http = build_http(self.timeout, Some(identity)).map_err(|e| option_error(e.to_string()))?;
        Ok(())
    }

    fn set_space_token(&mut self, space_token: &str) -> Result<()> {
        // the tape REST API has no space tokens, staging goes to the default pool
        debug!(space_token, "Space token ignored by tape REST");
        Ok(())
    }

    async fn bring_online(
        &mut self,
        urls: &[String],
        pin_lifetime: i64,
        _timeout: i64,
    ) -> BringOnlineResult {
        match self.create_stage(urls, pin_lifetime).await {
            Ok(request_id) => BringOnlineResult {
                status: 0,
                token: Some(request_id),
                errors: vec![None; urls.len()],
            },
            Err(error) => BringOnlineResult {
                status: -1,
                token: None,
                errors: fail_all(urls.len(), error),
            },
        }
    }

    async fn poll_bring_online(&mut self, token: &str, urls: &[String]) -> BulkResult {
        let status = match self.stage_status(token, urls).await {
            Ok(status) => status,
            Err(error) => {
                return BulkResult {
                    status: -1,
                    errors: fail_all(urls.len(), error),
                };
            }
        };

        let by_path: HashMap<&str, &FileStatus> = status
            .files
            .iter()
            .map(|f| (f.path.as_str(), f))
            .collect();

        let errors: Vec<Option<UrlError>> = urls
            .iter()
            .map(|surl| {
                let path = file_path(surl);
                match by_path.get(path.as_str()) {
                    None => Some(UrlError::new(
                        Errno::ENOENT as i32,
                        format!("{path} is not part of request {token}"),
                    )),
                    Some(file) => match &file.error {
                        Some(message) => Some(UrlError::new(Errno::EIO as i32, message.clone())),
                        None if file.on_disk => None,
                        None => Some(UrlError::new(Errno::EAGAIN as i32, "still staging")),
                    },
                }
            })
            .collect();

        let pending = errors
            .iter()
            .flatten()
            .any(|e| e.code == Errno::EAGAIN as i32);
        BulkResult {
            status: if pending { 0 } else { 1 },
            errors,
        }
    }

    async fn abort(&mut self, token: &str, urls: &[String]) -> BulkResult {
        if token.is_empty() || urls.is_empty() {
            return BulkResult {
                status: 0,
                errors: vec![None; urls.len()],
            };
        }
        match self.cancel_stage(token, urls).await {
            Ok(()) => BulkResult {
                status: 0,
                errors: vec![None; urls.len()],
            },
            Err(error) => BulkResult {
                status: -1,
                errors: fail_all(urls.len(), error),
            },
        }
    }

    async fn unlink(&mut self, urls: &[String]) -> BulkResult {
        let mut errors = Vec::with_capacity(urls.len());
        for surl in urls {
            let outcome = self.delete(surl).await.err();
            if let Some(e) = &outcome {
                warn!(surl = %surl, code = e.code, message = %e.message, "Delete failed");
            }
            errors.push(outcome);
        }
        let status = if errors.iter().any(Option::is_some) { -1 } else { 0 };
        BulkResult { status, errors }
    }
}
