//! 回源客户端。具体协议实现挂在注册表里，按 scheme 取用

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// 一次回源响应。长度未知时 content_length 为 None
pub struct SourceResponse {
    pub content_length: Option<u64>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// 只探测内容长度，探测不到返回 None
    async fn content_length(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Option<u64>>;

    /// 拉取内容。range 形如 "0-1023"，为空拉全量
    async fn download(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range: &str,
    ) -> Result<SourceResponse>;
}

pub struct HttpSourceClient {
    client: reqwest::Client,
}

impl HttpSourceClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn build_request(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let mut builder = self.client.get(url);
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        if !range.is_empty() {
            builder = builder.header("Range", format!("bytes={}", range));
        }
        Ok(builder)
    }
}

impl Default for HttpSourceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn content_length(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Option<u64>> {
        let resp = self.build_request(url, headers, "")?.send().await?;
        let resp = resp.error_for_status()?;
        Ok(resp.content_length())
    }

    async fn download(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range: &str,
    ) -> Result<SourceResponse> {
        let resp = self.build_request(url, headers, range)?.send().await?;
        let resp = resp.error_for_status()?;
        let content_length = resp.content_length();
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(SourceResponse {
            content_length,
            reader: Box::new(StreamReader::new(stream)),
        })
    }
}

/// scheme -> 客户端 的注册表。依赖注入传给需要回源的组件
pub struct SourceRegistry {
    clients: DashMap<String, Arc<dyn SourceClient>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// 带默认 http/https 客户端的注册表
    pub fn with_http() -> Arc<Self> {
        let registry = Self::new();
        let http: Arc<dyn SourceClient> = Arc::new(HttpSourceClient::new());
        registry.register("http", http.clone());
        registry.register("https", http);
        Arc::new(registry)
    }

    pub fn register(&self, scheme: &str, client: Arc<dyn SourceClient>) {
        self.clients.insert(scheme.to_string(), client);
    }

    pub fn unregister(&self, scheme: &str) {
        self.clients.remove(scheme);
    }

    /// 按 url 的 scheme 找客户端
    pub fn resolve(&self, url: &str) -> Result<Arc<dyn SourceClient>> {
        let parsed = url::Url::parse(url)?;
        self.clients
            .get(parsed.scheme())
            .map(|c| c.clone())
            .ok_or_else(|| anyhow!("没有 [{}] 协议的回源客户端", parsed.scheme()))
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
