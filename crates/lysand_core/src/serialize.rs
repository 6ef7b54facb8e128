/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound shapes: Mastodon statuses for clients, wire notes for peers.

use crate::config::ServerConfig;
use crate::content::{self, MIME_HTML, MIME_PLAIN};
use crate::error::ResolveResult;
use crate::media;
use crate::model::{ms_to_rfc3339, Application, Attachment, Emoji, Note, User};
use crate::note_db;
use crate::notes::NoteEngine;
use anyhow::Result;
use lysand_protocol::{ContentEntry, ContentFormat, CustomEmojis, NoteExtensions, Visibility};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Quotes nested deeper than this are serialized as `null`.
pub const MAX_QUOTE_DEPTH: u32 = 4;

#[derive(Debug, Clone, Serialize)]
pub struct ApiStatus {
    pub id: String,
    pub in_reply_to_id: Option<String>,
    pub in_reply_to_account_id: Option<String>,
    pub account: ApiAccount,
    pub created_at: String,
    pub application: Option<ApiApplication>,
    pub card: Option<Value>,
    pub content: String,
    pub emojis: Vec<ApiEmoji>,
    pub favourited: bool,
    pub favourites_count: u64,
    pub media_attachments: Vec<ApiAttachment>,
    pub mentions: Vec<ApiMention>,
    pub language: Option<String>,
    pub muted: bool,
    pub pinned: bool,
    pub poll: Option<Value>,
    pub reblog: Option<Box<ApiStatus>>,
    pub reblogged: bool,
    pub reblogs_count: u64,
    pub replies_count: u64,
    pub sensitive: bool,
    pub spoiler_text: String,
    pub tags: Vec<Value>,
    pub uri: String,
    pub visibility: Visibility,
    pub url: String,
    pub bookmarked: bool,
    pub quote: Option<Box<ApiStatus>>,
    pub quote_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiAccount {
    pub id: String,
    pub username: String,
    pub acct: String,
    pub display_name: String,
    pub locked: bool,
    pub bot: bool,
    pub discoverable: bool,
    pub group: bool,
    pub created_at: String,
    pub note: String,
    pub url: String,
    pub avatar: String,
    pub avatar_static: String,
    pub header: String,
    pub header_static: String,
    pub followers_count: u64,
    pub following_count: u64,
    pub statuses_count: u64,
    pub emojis: Vec<ApiEmoji>,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiAttachment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub url: String,
    pub remote_url: Option<String>,
    pub preview_url: String,
    pub text_url: Option<String>,
    pub meta: Value,
    pub description: Option<String>,
    pub blurhash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEmoji {
    pub shortcode: String,
    pub url: String,
    pub static_url: String,
    pub visible_in_picker: bool,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiMention {
    pub id: String,
    pub username: String,
    pub acct: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiApplication {
    pub name: String,
    pub website: Option<String>,
}

/// Mastodon status for `note` as seen by `viewer`. `quote_depth` counts how
/// many quotes deep this status sits.
pub fn status_to_api(
    conn: &Connection,
    cfg: &ServerConfig,
    note: &Note,
    viewer: Option<&User>,
    quote_depth: u32,
) -> Result<ApiStatus> {
    let local_mentions: Vec<&str> = note
        .mentions
        .iter()
        .filter(|m| m.is_local())
        .map(|m| m.username.as_str())
        .collect();
    let html = content::rewrite_media_sources(&note.content, |url| cfg.proxy_url(url));
    let html = content::shorten_local_mentions(&html, &local_mentions, &cfg.base_host());

    let reblog = match &note.reblog {
        Some(r) => Some(Box::new(status_to_api(conn, cfg, r, viewer, quote_depth)?)),
        None => None,
    };
    let quote = match &note.quoting_id {
        Some(id) if quote_depth < MAX_QUOTE_DEPTH => {
            match note_db::get_note(conn, id, viewer.map(|v| v.id.as_str()))? {
                Some(q) => Some(Box::new(status_to_api(conn, cfg, &q, viewer, quote_depth + 1)?)),
                None => None,
            }
        }
        _ => None,
    };

    Ok(ApiStatus {
        id: note.id.clone(),
        in_reply_to_id: note.reply_id.clone(),
        in_reply_to_account_id: note.reply_author_id.clone(),
        account: account_to_api(conn, cfg, &note.author)?,
        created_at: ms_to_rfc3339(note.created_at_ms).unwrap_or_default(),
        application: note.application.as_ref().map(application_to_api),
        card: None,
        content: html,
        emojis: note.emojis.iter().map(|e| emoji_to_api(cfg, e)).collect(),
        favourited: note.liked,
        favourites_count: note.like_count,
        media_attachments: note.attachments.iter().map(|a| attachment_to_api(cfg, a)).collect(),
        mentions: note.mentions.iter().map(|m| mention_to_api(cfg, m)).collect(),
        language: None,
        muted: note.muted,
        pinned: note.pinned,
        poll: None,
        reblog,
        reblogged: note.reblogged,
        reblogs_count: note.reblog_count,
        replies_count: note.reply_count,
        sensitive: note.sensitive,
        spoiler_text: note.spoiler_text.clone(),
        tags: Vec::new(),
        uri: note.uri(cfg),
        visibility: note.visibility,
        url: note.masto_url(cfg),
        bookmarked: false,
        quote,
        quote_id: note.quoting_id.clone(),
    })
}

pub fn account_to_api(conn: &Connection, cfg: &ServerConfig, user: &User) -> Result<ApiAccount> {
    let counts = note_db::user_counts(conn, &user.id)?;
    let avatar = user.avatar.as_deref().map(|u| cfg.proxy_url(u)).unwrap_or_default();
    let header = user.header.as_deref().map(|u| cfg.proxy_url(u)).unwrap_or_default();
    Ok(ApiAccount {
        id: user.id.clone(),
        username: user.username.clone(),
        acct: user.acct(),
        display_name: user.display_name.clone(),
        locked: user.is_locked,
        bot: user.is_bot,
        discoverable: user.is_discoverable,
        group: false,
        created_at: ms_to_rfc3339(user.created_at_ms).unwrap_or_default(),
        note: user.note.clone(),
        url: user
            .uri
            .clone()
            .unwrap_or_else(|| format!("{}/@{}", cfg.base_url(), user.username)),
        avatar_static: avatar.clone(),
        avatar,
        header_static: header.clone(),
        header,
        followers_count: counts.followers,
        following_count: counts.following,
        statuses_count: counts.statuses,
        emojis: Vec::new(),
        fields: Vec::new(),
    })
}

fn attachment_to_api(cfg: &ServerConfig, a: &Attachment) -> ApiAttachment {
    let url = cfg.proxy_url(&a.url);
    let preview_url = a
        .thumbnail_url
        .as_deref()
        .map(|t| cfg.proxy_url(t))
        .unwrap_or_else(|| url.clone());
    ApiAttachment {
        id: a.id.clone(),
        kind: media::attachment_kind(&a.mime_type),
        url,
        remote_url: a.remote_url.clone(),
        preview_url,
        text_url: None,
        meta: json!({
            "width": a.width,
            "height": a.height,
            "fps": a.fps,
            "duration": a.duration,
            "size": a.size,
        }),
        description: a.description.clone(),
        blurhash: a.blurhash.clone(),
    }
}

fn emoji_to_api(cfg: &ServerConfig, e: &Emoji) -> ApiEmoji {
    let url = cfg.proxy_url(&e.url);
    ApiEmoji {
        shortcode: e.shortcode.clone(),
        static_url: url.clone(),
        url,
        visible_in_picker: e.visible_in_picker,
        category: e.category.clone(),
    }
}

fn mention_to_api(cfg: &ServerConfig, u: &User) -> ApiMention {
    ApiMention {
        id: u.id.clone(),
        username: u.username.clone(),
        acct: u.acct(),
        url: u.uri(cfg),
    }
}

fn application_to_api(a: &Application) -> ApiApplication {
    ApiApplication {
        name: a.name.clone(),
        website: a.website.clone(),
    }
}

/// Wire form of `note`. Linked notes are addressed by their canonical URI.
pub fn note_to_lysand(conn: &Connection, cfg: &ServerConfig, note: &Note) -> Result<lysand_protocol::Note> {
    let mut body = ContentFormat::new();
    body.insert(MIME_HTML.to_string(), ContentEntry::text(note.content.clone()));
    body.insert(MIME_PLAIN.to_string(), ContentEntry::text(content::html_to_text(&note.content)));

    let link_uri = |id: &str| -> Result<String> {
        Ok(note_db::stored_uri(conn, id)?.unwrap_or_else(|| cfg.local_object_uri(id)))
    };

    Ok(lysand_protocol::Note {
        ty: lysand_protocol::NOTE_TYPE.to_string(),
        id: note.id.clone(),
        uri: note.uri(cfg),
        author: note.author.uri(cfg),
        created_at: ms_to_rfc3339(note.created_at_ms),
        content: Some(body),
        attachments: note.attachments.iter().map(media::attachment_to_wire).collect(),
        is_sensitive: Some(note.sensitive),
        mentions: note.mentions.iter().map(|m| m.uri(cfg)).collect(),
        quotes: note.quoting_id.as_deref().map(link_uri).transpose()?,
        replies_to: note.reply_id.as_deref().map(link_uri).transpose()?,
        subject: Some(note.spoiler_text.clone()),
        visibility: Some(note.visibility.as_str().to_string()),
        extensions: NoteExtensions {
            custom_emojis: Some(CustomEmojis {
                emojis: note.emojis.iter().map(media::emoji_to_wire).collect(),
            }),
            other: BTreeMap::new(),
        },
    })
}

impl NoteEngine {
    pub async fn to_api(&self, note: &Note, viewer: Option<&User>) -> ResolveResult<ApiStatus> {
        let note = note.clone();
        let viewer = viewer.cloned();
        let cfg = self.config().clone();
        Ok(self
            .db()
            .run(move |db| status_to_api(&db.connect()?, &cfg, &note, viewer.as_ref(), 0))
            .await?)
    }

    pub async fn to_lysand(&self, note: &Note) -> ResolveResult<lysand_protocol::Note> {
        let note = note.clone();
        let cfg = self.config().clone();
        Ok(self
            .db()
            .run(move |db| note_to_lysand(&db.connect()?, &cfg, &note))
            .await?)
    }
}
