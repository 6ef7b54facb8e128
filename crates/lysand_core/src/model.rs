/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::ServerConfig;
use lysand_protocol::Visibility;

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub base_url: String,
    pub name: String,
}

impl Instance {
    pub fn host(&self) -> String {
        reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.base_url.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    /// Canonical remote URI; `None` for local users.
    pub uri: Option<String>,
    pub username: String,
    pub display_name: String,
    /// Bio, already HTML.
    pub note: String,
    pub avatar: Option<String>,
    pub header: Option<String>,
    pub is_bot: bool,
    pub is_locked: bool,
    pub is_discoverable: bool,
    pub instance: Option<Instance>,
    pub created_at_ms: i64,
}

impl User {
    pub fn is_local(&self) -> bool {
        self.instance.is_none()
    }

    pub fn is_remote(&self) -> bool {
        self.instance.is_some()
    }

    /// `username` for local users, `username@host` for remote ones.
    pub fn acct(&self) -> String {
        match &self.instance {
            None => self.username.clone(),
            Some(i) => format!("{}@{}", self.username, i.host()),
        }
    }

    pub fn uri(&self, cfg: &ServerConfig) -> String {
        match &self.uri {
            Some(u) => u.clone(),
            None => cfg.local_user_uri(&self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub url: String,
    pub remote_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub mime_type: String,
    pub description: Option<String>,
    pub blurhash: Option<String>,
    pub sha256: Option<String>,
    pub size: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<i64>,
    pub duration: Option<f64>,
    pub note_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emoji {
    pub id: String,
    pub shortcode: String,
    pub url: String,
    pub alt: Option<String>,
    pub content_type: String,
    pub visible_in_picker: bool,
    pub category: Option<String>,
    /// `None` for emojis defined on this server.
    pub instance_id: Option<String>,
}

/// A post with its relations hydrated for one viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub id: String,
    pub author: User,
    pub content: String,
    pub content_source: String,
    pub content_type: String,
    pub visibility: Visibility,
    pub sensitive: bool,
    pub spoiler_text: String,
    /// Canonical URI for fetched notes; `None` when authored here.
    pub uri: Option<String>,
    pub reply_id: Option<String>,
    pub quoting_id: Option<String>,
    pub reblog_id: Option<String>,
    pub application: Option<Application>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,

    pub mentions: Vec<User>,
    pub emojis: Vec<Emoji>,
    pub attachments: Vec<Attachment>,
    pub reblog: Option<Box<Note>>,
    pub reply_author_id: Option<String>,

    pub like_count: u64,
    pub reblog_count: u64,
    pub reply_count: u64,
    pub liked: bool,
    pub reblogged: bool,
    pub muted: bool,
    pub pinned: bool,
}

impl Note {
    pub fn is_remote(&self) -> bool {
        self.author.is_remote()
    }

    /// Canonical URI: the stored remote URI, or this server's object URI.
    pub fn uri(&self, cfg: &ServerConfig) -> String {
        match &self.uri {
            Some(u) => u.clone(),
            None => cfg.local_object_uri(&self.id),
        }
    }

    pub fn masto_url(&self, cfg: &ServerConfig) -> String {
        match &self.uri {
            Some(u) => u.clone(),
            None => cfg.masto_url(&self.author.username, &self.id),
        }
    }

    pub fn is_mentioned(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|m| m.id == user_id)
    }
}

pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn ms_to_rfc3339(ms: i64) -> Option<String> {
    let dt = time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()?;
    dt.format(&time::format_description::well_known::Rfc3339).ok()
}

pub fn rfc3339_to_ms(s: &str) -> Option<i64> {
    let dt = time::OffsetDateTime::parse(s.trim(), &time::format_description::well_known::Rfc3339).ok()?;
    i64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok()
}
