/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const ACCEPT_JSON: &str = "application/json";

/// Raw answer of a remote GET. `body` is `Value::Null` when the response was
/// not JSON.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub status: u16,
    pub body: Value,
}

impl FetchedObject {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Fetches federation objects by URI. Transport failures are `Err`; HTTP error
/// statuses are returned as-is for the caller to judge.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<FetchedObject>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lysand-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<FetchedObject> {
        let resp = self
            .http
            .get(uri)
            .header(reqwest::header::ACCEPT, ACCEPT_JSON)
            .send()
            .await
            .with_context(|| format!("GET {uri}"))?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.with_context(|| format!("read body of {uri}"))?;
        let body = match serde_json::from_slice::<Value>(&bytes) {
            Ok(v) => v,
            Err(e) => {
                debug!(uri = %uri, status, "response body is not json: {e}");
                Value::Null
            }
        };
        Ok(FetchedObject { status, body })
    }
}
