/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::ResolveResult;
use crate::model::{Note, User};
use crate::note_db::{self, NoteFilter, NoteOrder};
use crate::notes::NoteEngine;
use crate::visibility::is_viewable_by_user;
use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::warn;

/// Recursion depth past which descendants are listed but not expanded.
pub const MAX_DESCENDANT_DEPTH: u32 = 20;

/// Reply chain above `note`, root first, restricted to what `viewer` may see.
pub fn ancestors(conn: &Connection, note: &Note, viewer: Option<&User>) -> Result<Vec<Note>> {
    let viewer_id = viewer.map(|v| v.id.as_str());
    let mut seen = HashSet::from([note.id.clone()]);
    let mut chain = Vec::new();
    let mut next = note.reply_id.clone();
    while let Some(parent_id) = next {
        if !seen.insert(parent_id.clone()) {
            warn!(note_id = %note.id, at = %parent_id, "reply chain loops; stopping");
            break;
        }
        let Some(parent) = note_db::get_note(conn, &parent_id, viewer_id)? else {
            break;
        };
        next = parent.reply_id.clone();
        chain.push(parent);
    }

    let mut out = Vec::with_capacity(chain.len());
    for n in chain {
        if is_viewable_by_user(conn, &n, viewer)? {
            out.push(n);
        }
    }
    out.reverse();
    Ok(out)
}

/// Reply tree below `note` in pre-order, newest sibling first. Each node is
/// checked on its own; a hidden parent does not hide its replies.
pub fn descendants(conn: &Connection, note: &Note, viewer: Option<&User>) -> Result<Vec<Note>> {
    let viewer_id = viewer.map(|v| v.id.as_str());
    let mut seen = HashSet::from([note.id.clone()]);
    let mut tree = Vec::new();
    collect_descendants(conn, &note.id, viewer_id, 0, &mut seen, &mut tree)?;

    let mut out = Vec::with_capacity(tree.len());
    for n in tree {
        if is_viewable_by_user(conn, &n, viewer)? {
            out.push(n);
        }
    }
    Ok(out)
}

fn collect_descendants(
    conn: &Connection,
    parent_id: &str,
    viewer_id: Option<&str>,
    depth: u32,
    seen: &mut HashSet<String>,
    out: &mut Vec<Note>,
) -> Result<()> {
    let children = note_db::find_notes(
        conn,
        &NoteFilter::RepliesTo(parent_id.to_string()),
        NoteOrder::NewestFirst,
        None,
        0,
        viewer_id,
    )?;
    for child in children {
        if !seen.insert(child.id.clone()) {
            continue;
        }
        let child_id = child.id.clone();
        out.push(child);
        if depth < MAX_DESCENDANT_DEPTH {
            collect_descendants(conn, &child_id, viewer_id, depth + 1, seen, out)?;
        }
    }
    Ok(())
}

impl NoteEngine {
    pub async fn ancestors(&self, note: &Note, viewer: Option<&User>) -> ResolveResult<Vec<Note>> {
        let note = note.clone();
        let viewer = viewer.cloned();
        Ok(self
            .db()
            .run(move |db| ancestors(&db.connect()?, &note, viewer.as_ref()))
            .await?)
    }

    pub async fn descendants(&self, note: &Note, viewer: Option<&User>) -> ResolveResult<Vec<Note>> {
        let note = note.clone();
        let viewer = viewer.cloned();
        Ok(self
            .db()
            .run(move |db| descendants(&db.connect()?, &note, viewer.as_ref()))
            .await?)
    }
}
