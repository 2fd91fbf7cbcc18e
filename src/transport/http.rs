//! `ShapeTransport` over HTTP, speaking the Electric shape protocol.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};

use crate::config::EngineConfig;
use crate::transport::{
    parse_column_schema, parse_schema_version, parse_shape_body, ShapeBatch, ShapeRequest,
    ShapeTransport, TransportError,
};

pub const HEADER_HANDLE: &str = "electric-handle";
pub const HEADER_OFFSET: &str = "electric-offset";
pub const HEADER_UP_TO_DATE: &str = "electric-up-to-date";
pub const HEADER_SCHEMA: &str = "electric-schema";

/// Parameters this transport owns; any copies already in the shape URL are
/// replaced.
const PROTOCOL_PARAMS: [&str; 3] = ["offset", "handle", "live"];

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    request_timeout: Duration,
    live_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("less-shapes/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            request_timeout: config.http_timeout(),
            live_timeout: config.live_poll_timeout(),
        })
    }
}

/// Build the request URL for one shape fetch.
pub fn shape_url(request: &ShapeRequest) -> Result<Url, TransportError> {
    let mut url = Url::parse(&request.url)
        .map_err(|e| TransportError::permanent(format!("invalid shape URL {:?}: {e}", request.url)))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !PROTOCOL_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let has_table = kept.iter().any(|(k, _)| k == "table");
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        if !has_table {
            query.append_pair("table", &request.table);
        }
        query.append_pair("offset", &request.token.offset);
        if let Some(handle) = &request.token.handle {
            query.append_pair("handle", handle);
        }
        if request.live {
            query.append_pair("live", "true");
        }
    }
    Ok(url)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if let Some(status) = err.status() {
        return TransportError::from_status(status.as_u16(), err.to_string());
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        TransportError::new(err.to_string())
    } else {
        TransportError::permanent(err.to_string())
    }
}

#[async_trait]
impl ShapeTransport for HttpTransport {
    async fn fetch_shape(&self, request: &ShapeRequest) -> Result<ShapeBatch, TransportError> {
        let url = shape_url(request)?;
        let timeout = if request.live {
            self.live_timeout
        } else {
            self.request_timeout
        };
        tracing::debug!(%url, live = request.live, "fetching shape");
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let offset = header(&headers, HEADER_OFFSET);
        let handle = header(&headers, HEADER_HANDLE);

        if status == StatusCode::CONFLICT {
            let mut batch = ShapeBatch::must_refetch();
            batch.handle = handle;
            return Ok(batch);
        }
        if status == StatusCode::NO_CONTENT {
            let mut batch = ShapeBatch::changes(Vec::new()).up_to_date();
            batch.offset = offset;
            batch.handle = handle;
            return Ok(batch);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.trim().to_string()
            };
            return Err(TransportError::from_status(status.as_u16(), message));
        }

        let schema = match header(&headers, HEADER_SCHEMA) {
            Some(raw) => parse_column_schema(&raw)?,
            None => Vec::new(),
        };
        let body = response.text().await.map_err(map_reqwest_error)?;
        let parsed = parse_shape_body(&body)?;
        Ok(ShapeBatch {
            payload: parsed.payload,
            offset,
            handle,
            up_to_date: parsed.up_to_date || headers.contains_key(HEADER_UP_TO_DATE),
            must_refetch: parsed.must_refetch,
            schema,
        })
    }

    async fn fetch_schema_version(&self, url: &str) -> Result<String, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::from_status(
                status.as_u16(),
                "schema version request failed",
            ));
        }
        let body = response.text().await.map_err(map_reqwest_error)?;
        parse_schema_version(&body)
    }
}
