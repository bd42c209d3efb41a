use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::schema::Schema;

/// Streaming response body, ready for `tokio::io::copy`.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub skip_verify: bool,
}

/// Options shared by every node client a driver constructs.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub header_timeout: Duration,
    pub retry_period: Duration,
    pub tls: Option<TlsOptions>,
    pub auth_token: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            header_timeout: Duration::from_secs(3),
            retry_period: Duration::from_secs(60),
            tls: None,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub uri: String,
}

#[derive(Deserialize)]
struct DiskUsageResponse {
    usage: u64,
}

#[derive(Deserialize)]
struct ShardsResponse {
    shards: Vec<u64>,
}

/// What a driver needs from one cluster node. `NodeClient` is the wire
/// implementation; tests substitute spies.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn schema(&self) -> ClientResult<Schema>;
    async fn disk_usage(&self, index: Option<&str>) -> ClientResult<u64>;
    async fn id_allocation_data(&self) -> ClientResult<ByteStream>;
    async fn available_shards(&self, index: &str) -> ClientResult<Vec<u64>>;
    async fn fragment_nodes(&self, index: &str, shard: u64) -> ClientResult<Vec<NodeInfo>>;
    async fn shard_data(&self, index: &str, shard: u64) -> ClientResult<ByteStream>;
    async fn index_translate_data(&self, index: &str, partition: usize)
        -> ClientResult<ByteStream>;
    async fn field_translate_data(&self, index: &str, field: &str) -> ClientResult<ByteStream>;
}

/// Constructs node clients bound to a URI, all sharing one set of options.
pub trait ClientFactory: Send + Sync {
    fn node(&self, uri: &str) -> ClientResult<Arc<dyn NodeApi>>;
}

pub struct RemoteClientFactory {
    options: ClientOptions,
}

impl RemoteClientFactory {
    pub fn new(options: ClientOptions) -> RemoteClientFactory {
        RemoteClientFactory { options }
    }
}

impl ClientFactory for RemoteClientFactory {
    fn node(&self, uri: &str) -> ClientResult<Arc<dyn NodeApi>> {
        Ok(Arc::new(NodeClient::new(uri, self.options.clone())?))
    }
}

/// HTTP client bound to one cluster node. Requests retry transient failures
/// with capped backoff until the retry period elapses.
pub struct NodeClient {
    base: Url,
    http: reqwest::Client,
    options: ClientOptions,
}

impl NodeClient {
    pub fn new(uri: &str, options: ClientOptions) -> ClientResult<NodeClient> {
        let mut base = normalize_uri(uri)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut builder = reqwest::Client::builder().connect_timeout(options.header_timeout);
        if let Some(tls) = &options.tls {
            if let Some(path) = &tls.ca_cert_path {
                let pem = std::fs::read(path)?;
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }
            if let (Some(cert), Some(key)) = (&tls.cert_path, &tls.key_path) {
                let mut pem = std::fs::read(cert)?;
                pem.extend(std::fs::read(key)?);
                builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
            }
            if tls.skip_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }
        if let Some(token) = &options.auth_token {
            let mut headers = HeaderMap::new();
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| ClientError::bad_input(format!("invalid auth token: {err}")))?;
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        Ok(NodeClient {
            base,
            http: builder.build()?,
            options,
        })
    }

    pub fn uri(&self) -> &Url {
        &self.base
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> ClientResult<reqwest::Response> {
        let mut url = self.base.join(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        let deadline = Instant::now() + self.options.retry_period;
        let mut delay = INITIAL_RETRY_DELAY;
        loop {
            match self.try_get(url.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && Instant::now() + delay < deadline => {
                    log::debug!("retrying {url}: {err}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_get(&self, url: Url) -> ClientResult<reqwest::Response> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn into_stream(response: reqwest::Response) -> ByteStream {
        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
        Box::pin(StreamReader::new(stream))
    }
}

#[async_trait]
impl NodeApi for NodeClient {
    async fn schema(&self) -> ClientResult<Schema> {
        Ok(self.get("schema", &[]).await?.json().await?)
    }

    async fn disk_usage(&self, index: Option<&str>) -> ClientResult<u64> {
        let path = match index {
            Some(index) => format!("internal/disk-usage/{index}"),
            None => "internal/disk-usage".to_string(),
        };
        let response: DiskUsageResponse = self.get(&path, &[]).await?.json().await?;
        Ok(response.usage)
    }

    async fn id_allocation_data(&self) -> ClientResult<ByteStream> {
        Ok(Self::into_stream(
            self.get("internal/idalloc/data", &[]).await?,
        ))
    }

    async fn available_shards(&self, index: &str) -> ClientResult<Vec<u64>> {
        let response: ShardsResponse = self
            .get(&format!("internal/index/{index}/shards"), &[])
            .await?
            .json()
            .await?;
        Ok(response.shards)
    }

    /// Replica nodes holding the shard, in preference order.
    async fn fragment_nodes(&self, index: &str, shard: u64) -> ClientResult<Vec<NodeInfo>> {
        Ok(self
            .get(
                "internal/fragment/nodes",
                &[("index", index.to_string()), ("shard", shard.to_string())],
            )
            .await?
            .json()
            .await?)
    }

    async fn shard_data(&self, index: &str, shard: u64) -> ClientResult<ByteStream> {
        Ok(Self::into_stream(
            self.get(&format!("internal/index/{index}/shard/{shard}/data"), &[])
                .await?,
        ))
    }

    async fn index_translate_data(
        &self,
        index: &str,
        partition: usize,
    ) -> ClientResult<ByteStream> {
        Ok(Self::into_stream(
            self.get(
                "internal/translate/data",
                &[
                    ("index", index.to_string()),
                    ("partition", partition.to_string()),
                ],
            )
            .await?,
        ))
    }

    async fn field_translate_data(&self, index: &str, field: &str) -> ClientResult<ByteStream> {
        Ok(Self::into_stream(
            self.get(
                "internal/translate/data",
                &[("index", index.to_string()), ("field", field.to_string())],
            )
            .await?,
        ))
    }
}

fn normalize_uri(uri: &str) -> ClientResult<Url> {
    let with_scheme = if uri.contains("://") {
        uri.to_string()
    } else {
        format!("http://{uri}")
    };
    Ok(Url::parse(&with_scheme)?)
}
