/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::ResolveResult;
use crate::model::{Note, User};
use crate::note_db;
use crate::notes::NoteEngine;
use anyhow::Result;
use lysand_protocol::Visibility;
use rusqlite::Connection;

/// May `viewer` (anonymous when `None`) see `note`? `follows(owner, subject)`
/// answers the follow check and is only consulted for private notes.
pub fn is_viewable_by(
    note: &Note,
    viewer: Option<&User>,
    follows: impl FnOnce(&str, &str) -> Result<bool>,
) -> Result<bool> {
    if viewer.is_some_and(|v| v.id == note.author.id) {
        return Ok(true);
    }
    match note.visibility {
        Visibility::Public | Visibility::Unlisted => Ok(true),
        Visibility::Private => match viewer {
            Some(v) => follows(&v.id, &note.author.id),
            None => Ok(false),
        },
        Visibility::Direct => Ok(viewer.is_some_and(|v| note.is_mentioned(&v.id))),
    }
}

pub fn is_viewable_by_user(conn: &Connection, note: &Note, viewer: Option<&User>) -> Result<bool> {
    is_viewable_by(note, viewer, |owner, subject| note_db::is_following(conn, owner, subject))
}

impl NoteEngine {
    pub async fn is_viewable_by_user(&self, note: &Note, viewer: Option<&User>) -> ResolveResult<bool> {
        let note = note.clone();
        let viewer = viewer.cloned();
        Ok(self
            .db()
            .run(move |db| is_viewable_by_user(&db.connect()?, &note, viewer.as_ref()))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            uri: None,
            username: id.to_string(),
            display_name: id.to_string(),
            note: String::new(),
            avatar: None,
            header: None,
            is_bot: false,
            is_locked: false,
            is_discoverable: false,
            instance: None,
            created_at_ms: 0,
        }
    }

    fn note(author: &str, visibility: Visibility, mentions: &[&str]) -> Note {
        Note {
            id: "n1".into(),
            author: user(author),
            content: String::new(),
            content_source: String::new(),
            content_type: "text/html".into(),
            visibility,
            sensitive: false,
            spoiler_text: String::new(),
            uri: None,
            reply_id: None,
            quoting_id: None,
            reblog_id: None,
            application: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            mentions: mentions.iter().map(|m| user(m)).collect(),
            emojis: vec![],
            attachments: vec![],
            reblog: None,
            reply_author_id: None,
            like_count: 0,
            reblog_count: 0,
            reply_count: 0,
            liked: false,
            reblogged: false,
            muted: false,
            pinned: false,
        }
    }

    fn never(_: &str, _: &str) -> Result<bool> {
        Ok(false)
    }

    #[test]
    fn author_always_sees_own_note() {
        let n = note("alice", Visibility::Direct, &[]);
        assert!(is_viewable_by(&n, Some(&user("alice")), never).unwrap());
    }

    #[test]
    fn public_and_unlisted_are_open() {
        for v in [Visibility::Public, Visibility::Unlisted] {
            assert!(is_viewable_by(&note("alice", v, &[]), None, never).unwrap());
        }
    }

    #[test]
    fn private_needs_follow() {
        let n = note("alice", Visibility::Private, &[]);
        assert!(!is_viewable_by(&n, None, never).unwrap());
        assert!(!is_viewable_by(&n, Some(&user("bob")), never).unwrap());
        let follows = |owner: &str, subject: &str| -> Result<bool> { Ok(owner == "bob" && subject == "alice") };
        assert!(is_viewable_by(&n, Some(&user("bob")), follows).unwrap());
    }

    #[test]
    fn direct_needs_mention() {
        let n = note("alice", Visibility::Direct, &["carol"]);
        assert!(!is_viewable_by(&n, None, never).unwrap());
        assert!(!is_viewable_by(&n, Some(&user("bob")), |_, _| Ok(true)).unwrap());
        assert!(is_viewable_by(&n, Some(&user("carol")), never).unwrap());
    }
}
