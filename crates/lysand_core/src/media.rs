/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::model::{Attachment, Emoji};
use crate::note_db::{self, NewAttachment, NewEmoji};
use anyhow::{anyhow, bail, Result};
use lysand_protocol::{ContentEntry, ContentFormat, ContentHash, CustomEmoji};
use rusqlite::Connection;

/// Validates one wire attachment. The first mime key wins.
pub fn attachment_from_wire(format: &ContentFormat) -> Result<NewAttachment> {
    let (mime, entry) = format.iter().next().ok_or_else(|| anyhow!("attachment has no content"))?;
    let url = checked_url(&entry.content)?;
    if mime.trim().is_empty() || !mime.contains('/') {
        bail!("attachment mime type is invalid: {mime:?}");
    }
    Ok(NewAttachment {
        url: url.clone(),
        remote_url: Some(url),
        thumbnail_url: None,
        mime_type: mime.trim().to_ascii_lowercase(),
        description: entry.description.clone().filter(|d| !d.trim().is_empty()),
        blurhash: entry.blurhash.clone(),
        sha256: entry.hash.as_ref().and_then(|h| h.sha256.clone()),
        size: entry.size.and_then(|v| i64::try_from(v).ok()),
        width: entry.width.map(i64::from),
        height: entry.height.map(i64::from),
        fps: entry.fps.map(i64::from),
        duration: entry.duration,
    })
}

pub fn attachment_to_wire(a: &Attachment) -> ContentFormat {
    let mut map = ContentFormat::new();
    map.insert(
        a.mime_type.clone(),
        ContentEntry {
            content: a.remote_url.clone().unwrap_or_else(|| a.url.clone()),
            description: a.description.clone(),
            size: a.size.and_then(|v| u64::try_from(v).ok()),
            hash: a.sha256.clone().map(|sha256| ContentHash { sha256: Some(sha256) }),
            blurhash: a.blurhash.clone(),
            width: a.width.and_then(|v| u32::try_from(v).ok()),
            height: a.height.and_then(|v| u32::try_from(v).ok()),
            fps: a.fps.and_then(|v| u32::try_from(v).ok()),
            duration: a.duration,
        },
    );
    map
}

/// Mastodon attachment type for a mime type.
pub fn attachment_kind(mime: &str) -> &'static str {
    match mime.split('/').next().unwrap_or_default() {
        "image" => "image",
        "video" => "video",
        "audio" => "audio",
        _ => "unknown",
    }
}

/// Validates one wire emoji for `instance_id` (`None` = this server).
pub fn emoji_from_wire(e: &CustomEmoji, instance_id: Option<&str>) -> Result<NewEmoji> {
    let shortcode = e.name.trim().trim_matches(':').to_string();
    if shortcode.is_empty()
        || !shortcode
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("emoji name is invalid: {:?}", e.name);
    }
    let (content_type, entry) = e
        .url
        .iter()
        .find(|(mime, _)| mime.starts_with("image/"))
        .or_else(|| e.url.iter().next())
        .ok_or_else(|| anyhow!("emoji {shortcode} has no url"))?;
    Ok(NewEmoji {
        url: checked_url(&entry.content)?,
        shortcode,
        alt: e.alt.clone().or_else(|| entry.description.clone()),
        content_type: content_type.clone(),
        visible_in_picker: true,
        category: None,
        instance_id: instance_id.map(str::to_string),
    })
}

pub fn emoji_to_wire(e: &Emoji) -> CustomEmoji {
    let mut url = ContentFormat::new();
    url.insert(
        e.content_type.clone(),
        ContentEntry {
            content: e.url.clone(),
            description: e.alt.clone(),
            ..ContentEntry::default()
        },
    );
    CustomEmoji {
        name: e.shortcode.clone(),
        url,
        alt: e.alt.clone(),
    }
}

/// Emoji with the same shortcode from the same instance, inserted if new.
pub fn find_or_insert_emoji(conn: &Connection, new: &NewEmoji) -> Result<Emoji> {
    if let Some(existing) = note_db::find_emoji(conn, &new.shortcode, new.instance_id.as_deref())? {
        return Ok(existing);
    }
    note_db::insert_emoji(conn, new)
}

fn checked_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let url = reqwest::Url::parse(raw).map_err(|e| anyhow!("invalid media url {raw:?}: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(raw.to_string()),
        other => bail!("unsupported media url scheme: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lysand_protocol::content_of;

    #[test]
    fn attachment_takes_first_mime_and_metadata() {
        let mut format = content_of("image/png", "https://cdn.example/a.png");
        if let Some(entry) = format.get_mut("image/png") {
            entry.description = Some("a cat".into());
            entry.width = Some(640);
            entry.hash = Some(ContentHash {
                sha256: Some("ab".into()),
            });
        }
        let a = attachment_from_wire(&format).unwrap();
        assert_eq!(a.mime_type, "image/png");
        assert_eq!(a.url, "https://cdn.example/a.png");
        assert_eq!(a.description.as_deref(), Some("a cat"));
        assert_eq!(a.width, Some(640));
        assert_eq!(a.sha256.as_deref(), Some("ab"));
    }

    #[test]
    fn attachment_with_bad_url_is_rejected() {
        assert!(attachment_from_wire(&content_of("image/png", "not a url")).is_err());
        assert!(attachment_from_wire(&content_of("image/png", "javascript:alert(1)")).is_err());
        assert!(attachment_from_wire(&ContentFormat::new()).is_err());
    }

    #[test]
    fn emoji_names_accept_colons() {
        let e = CustomEmoji {
            name: ":blob:".into(),
            url: content_of("image/webp", "https://r.example/blob.webp"),
            alt: None,
        };
        let new = emoji_from_wire(&e, Some("inst")).unwrap();
        assert_eq!(new.shortcode, "blob");
        assert_eq!(new.content_type, "image/webp");
        assert_eq!(new.instance_id.as_deref(), Some("inst"));
    }

    #[test]
    fn kinds_follow_mime_family() {
        assert_eq!(attachment_kind("image/png"), "image");
        assert_eq!(attachment_kind("video/mp4"), "video");
        assert_eq!(attachment_kind("audio/ogg"), "audio");
        assert_eq!(attachment_kind("application/pdf"), "unknown");
    }
}
