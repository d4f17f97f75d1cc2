use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use reqwest::Client;
use url::Url;

use crate::error::TransportError;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// The HTTP operations the measurement engine needs.
///
/// URLs passed in are already cache-busted. Implementations must not cache
/// responses and only the byte length of response bodies matters.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One minimal round trip. Any HTTP response counts as success.
    async fn probe(&self, url: &Url) -> Result<(), TransportError>;

    /// Opens a streaming GET and yields the body as it arrives.
    async fn open_download(&self, url: &Url) -> Result<ByteStream, TransportError>;

    /// POSTs `body` and waits for the server to acknowledge it.
    async fn upload(&self, url: &Url, body: Bytes) -> Result<(), TransportError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("speedgauge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &Url) -> Result<(), TransportError> {
        self.client
            .head(url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await?;
        Ok(())
    }

    async fn open_download(&self, url: &Url) -> Result<ByteStream, TransportError> {
        let response = self
            .client
            .get(url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed())
    }

    async fn upload(&self, url: &Url, body: Bytes) -> Result<(), TransportError> {
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CACHE_CONTROL, "no-cache")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
