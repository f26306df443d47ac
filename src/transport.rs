//! The HTTP side of a download, kept behind a trait so the session can be driven by
//! something other than a real network (tests, embedding applications with their own stack).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{
    HeaderName, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RANGE,
};
use reqwest::{redirect, Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::error::DownloadError;
use crate::models::{ProxyConfig, ProxyServer};

const USER_AGENT: &str = concat!("resumable-downloader/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type BodyStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// Headers of a metadata-only request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

pub enum GetResponse {
    Body {
        /// Length of this response's body, which is the remaining length for ranged requests.
        content_length: Option<u64>,
        /// `true` when the server honoured the range (206).
        partial: bool,
        stream: BodyStream,
    },
    /// The server answered with a redirect; the target is already resolved.
    Redirect(Url),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Metadata-only request. Redirects are not followed.
    async fn head(&self, url: &Url, timeout: Duration) -> Result<HeadResponse, DownloadError>;

    /// Starts a GET, optionally asking for `bytes=<range_start>-`.
    async fn get(&self, url: &Url, range_start: Option<u64>) -> Result<GetResponse, DownloadError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(proxy: &ProxyConfig) -> Result<Self, DownloadError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            // The session restarts the transfer itself on redirects.
            .redirect(redirect::Policy::none());

        match proxy {
            ProxyConfig::System => {}
            ProxyConfig::Socks5(server) => builder = builder.proxy(socks5_proxy(server)?),
            ProxyConfig::Http(server) => builder = builder.proxy(http_proxy(server)?),
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

fn check_server(server: &ProxyServer) -> Result<(), DownloadError> {
    if server.host.is_empty() || server.port == 0 {
        return Err(DownloadError::invalid(format!(
            "proxy needs a host and a port, got {}:{}",
            server.host, server.port
        )));
    }
    Ok(())
}

fn socks5_proxy(server: &ProxyServer) -> Result<reqwest::Proxy, DownloadError> {
    check_server(server)?;
    let url = if server.user.is_empty() {
        format!("socks5://{}:{}", server.host, server.port)
    } else {
        format!(
            "socks5://{}:{}@{}:{}",
            urlencoding::encode(&server.user),
            urlencoding::encode(&server.password),
            server.host,
            server.port
        )
    };
    Ok(reqwest::Proxy::all(url)?)
}

fn http_proxy(server: &ProxyServer) -> Result<reqwest::Proxy, DownloadError> {
    check_server(server)?;
    let mut proxy = reqwest::Proxy::all(format!("http://{}:{}", server.host, server.port))?;
    if !server.user.is_empty() {
        proxy = proxy.basic_auth(&server.user, &server.password);
    }
    Ok(proxy)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head(&self, url: &Url, timeout: Duration) -> Result<HeadResponse, DownloadError> {
        let response = self.client.head(url.clone()).timeout(timeout).send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let headers = response.headers();
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        // `Response::content_length` is 0 for HEAD, the header carries the real size.
        let content_length = header(CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());

        Ok(HeadResponse {
            status: status.as_u16(),
            content_length,
            content_type: header(CONTENT_TYPE),
            content_disposition: header(CONTENT_DISPOSITION),
        })
    }

    async fn get(&self, url: &Url, range_start: Option<u64>) -> Result<GetResponse, DownloadError> {
        let mut request = self.client.get(url.clone());
        if let Some(start) = range_start {
            request = request.header(RANGE, format!("bytes={start}-"));
        }
        let response = request.send().await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    DownloadError::Transfer(format!("HTTP {status} from {url} without a Location"))
                })?;
            let target = url.join(location).map_err(|e| {
                DownloadError::Transfer(format!("invalid redirect target {location:?}: {e}"))
            })?;
            debug!(from = %url, to = %target, "redirect");
            return Ok(GetResponse::Redirect(target));
        }

        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(GetResponse::Body {
            content_length: response.content_length(),
            partial: status == StatusCode::PARTIAL_CONTENT,
            stream: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(DownloadError::from))
                .boxed(),
        })
    }
}
