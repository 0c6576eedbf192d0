use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FetchError;
use crate::notion::model::{QueryDatabaseResp, RawPage, RetrieveDatabaseResp};

pub mod model;

const NOTION_API_BASE: &str = "https://api.notion.com/";
pub const MAX_PAGE_SIZE: u32 = 100;

/// Source of raw Notion pages. Network, auth and pagination live behind it.
#[async_trait]
pub trait NotionSource: Send + Sync {
    /// Every page in the database, following `next_cursor` to the end.
    async fn fetch_all_pages(&self, database_id: &str) -> Result<Vec<RawPage>, FetchError>;

    async fn fetch_page(&self, page_id: &str) -> Result<RawPage, FetchError>;
}

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
    page_size: u32,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl NotionClient {
    pub fn new(token: String, version: String) -> Result<Self> {
        let base_url = Url::parse(NOTION_API_BASE)?;
        Self::with_base_url(token, version, base_url)
    }

    pub fn with_base_url(token: String, version: String, base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("studio-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            token,
            version,
            page_size: MAX_PAGE_SIZE,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let client = Self::new(cfg.notion.token.clone(), cfg.notion.version.clone())?;
        Ok(client.with_page_size(cfg.notion.page_size))
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version)
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::Decode(format!("invalid Notion url {path}: {e}")))
    }

    pub fn build_query_request(
        &self,
        database_id: &str,
        start_cursor: Option<&str>,
    ) -> Result<reqwest::Request, FetchError> {
        let endpoint = self.endpoint(&format!("v1/databases/{}/query", database_id))?;
        let body = build_query_body(self.page_size, start_cursor);
        let request = self
            .authorized(self.http.post(endpoint))
            .header("Content-Type", "application/json")
            .json(&body)
            .build()?;
        Ok(request)
    }

    async fn query_database(
        &self,
        database_id: &str,
        start_cursor: Option<&str>,
    ) -> Result<QueryDatabaseResp, FetchError> {
        let request = self.build_query_request(database_id, start_cursor)?;
        debug!(url = %request.url(), cursor = ?start_cursor, "querying notion database");
        let res = check_status(self.http.execute(request).await?).await?;
        res.json::<QueryDatabaseResp>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    pub async fn retrieve_database(&self, database_id: &str) -> Result<RetrieveDatabaseResp, FetchError> {
        let url = self.endpoint(&format!("v1/databases/{}", database_id))?;
        let res = check_status(self.authorized(self.http.get(url)).send().await?).await?;
        res.json::<RetrieveDatabaseResp>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl NotionSource for NotionClient {
    async fn fetch_all_pages(&self, database_id: &str) -> Result<Vec<RawPage>, FetchError> {
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;
        let mut batches = 0u32;
        loop {
            let resp = self.query_database(database_id, cursor.as_deref()).await?;
            batches += 1;
            for value in resp.results {
                pages.push(decode_page(value)?);
            }
            cursor = resp.next_cursor;
            if !resp.has_more || cursor.is_none() {
                break;
            }
        }
        info!(database_id, pages = pages.len(), batches, "fetched notion pages");
        Ok(pages)
    }

    async fn fetch_page(&self, page_id: &str) -> Result<RawPage, FetchError> {
        let url = self.endpoint(&format!("v1/pages/{}", page_id))?;
        let res = check_status(self.authorized(self.http.get(url)).send().await?).await?;
        let value: Value = res.json().await.map_err(|e| FetchError::Decode(e.to_string()))?;
        decode_page(value)
    }
}

fn decode_page(value: Value) -> Result<RawPage, FetchError> {
    RawPage::from_value(value).map_err(|e| FetchError::Decode(format!("page object: {e}")))
}

/// Map non-success statuses onto the fetch error taxonomy.
async fn check_status(res: Response) -> Result<Response, FetchError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let retry_after = res
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = res.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "notion api error");
    Err(FetchError::from_status(status.as_u16(), body, retry_after))
}

pub fn build_query_body(page_size: u32, start_cursor: Option<&str>) -> Value {
    let mut body = json!({ "page_size": page_size });
    if let Some(cursor) = start_cursor.filter(|c| !c.is_empty()) {
        body["start_cursor"] = json!(cursor);
    }
    body
}
