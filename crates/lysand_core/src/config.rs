/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Public origin of this server, e.g. `https://social.example`.
    pub base_url: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Maximum nesting of reply/quote chasing during one resolution.
    #[serde(default = "default_max_resolve_depth")]
    pub max_resolve_depth: u32,
    /// Maximum remote GETs issued by one top-level resolution.
    #[serde(default = "default_max_fetches")]
    pub max_fetches_per_resolve: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_user_cache_ttl_secs")]
    pub user_cache_ttl_secs: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_resolve_depth: default_max_resolve_depth(),
            max_fetches_per_resolve: default_max_fetches(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            user_cache_ttl_secs: default_user_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_max_resolve_depth() -> u32 {
    16
}

fn default_max_fetches() -> u32 {
    64
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_user_cache_ttl_secs() -> u64 {
    300
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Minimal config for a server reachable at `base_url`; everything else defaulted.
    pub fn for_base_url(base_url: &str) -> Self {
        Self {
            http: HttpConfig {
                base_url: base_url.to_string(),
                bind: default_bind(),
                max_body_bytes: default_max_body_bytes(),
            },
            database: DatabaseConfig::default(),
            federation: FederationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let mut cfg: ServerConfig = serde_json::from_str(text).context("parse config json")?;
        cfg.http.base_url = cfg.http.base_url.trim().trim_end_matches('/').to_string();
        if cfg.http.base_url.is_empty() {
            anyhow::bail!("http.base_url must not be empty");
        }
        reqwest::Url::parse(&cfg.http.base_url)
            .with_context(|| format!("http.base_url is not a url: {}", cfg.http.base_url))?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn base_url(&self) -> &str {
        self.http.base_url.trim_end_matches('/')
    }

    /// Host (with port, if any) of the base URL. Used for `@user@host` handles.
    pub fn base_host(&self) -> String {
        reqwest::Url::parse(self.base_url())
            .ok()
            .and_then(|u| {
                let host = u.host_str()?.to_string();
                Some(match u.port() {
                    Some(p) => format!("{host}:{p}"),
                    None => host,
                })
            })
            .unwrap_or_default()
    }

    /// Remainder of `uri` after this server's base URL. The base must end at
    /// a path, query or fragment boundary, so `https://a.example.org` is not
    /// under `https://a.example`.
    pub fn local_path<'a>(&self, uri: &'a str) -> Option<&'a str> {
        let rest = uri.strip_prefix(self.base_url())?;
        match rest.chars().next() {
            None | Some('/' | '?' | '#') => Some(rest),
            Some(_) => None,
        }
    }

    pub fn is_local_uri(&self, uri: &str) -> bool {
        self.local_path(uri).is_some()
    }

    pub fn local_object_uri(&self, id: &str) -> String {
        format!("{}/objects/{id}", self.base_url())
    }

    pub fn local_user_uri(&self, id: &str) -> String {
        format!("{}/users/{id}", self.base_url())
    }

    pub fn masto_url(&self, username: &str, note_id: &str) -> String {
        format!("{}/@{username}/{note_id}", self.base_url())
    }

    /// Routes a media URL through this server's media proxy.
    pub fn proxy_url(&self, url: &str) -> String {
        if url.is_empty() {
            return String::new();
        }
        format!("{}/media/proxy/{}", self.base_url(), B64URL.encode(url.as_bytes()))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(p) => Ok(p.clone()),
            None => Ok(default_data_dir()?.join("lysand.db")),
        }
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("LYSAND_DATA_DIR") {
        if !v.trim().is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    let proj = ProjectDirs::from("org", "lysand", "Lysand")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}
