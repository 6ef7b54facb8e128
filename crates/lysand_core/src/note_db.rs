/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::model::{now_ms, Application, Attachment, Emoji, Instance, Note, User};
use anyhow::{Context, Result};
use lysand_protocol::Visibility;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};

/// Handle on the SQLite file. Every call opens its own connection; write
/// helpers are free functions over `&Connection` so they compose inside
/// [`NoteDb::transaction`].
#[derive(Clone)]
pub struct NoteDb {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoteFilter {
    Id(String),
    Ids(Vec<String>),
    Uri(String),
    RepliesTo(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoteOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone)]
pub struct NewNote {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub content_source: String,
    pub visibility: Visibility,
    pub sensitive: bool,
    pub spoiler_text: String,
    pub uri: Option<String>,
    pub reply_id: Option<String>,
    pub quoting_id: Option<String>,
    pub reblog_id: Option<String>,
    pub application_id: Option<String>,
    pub created_at_ms: i64,
}

/// Column-level patch; `None` leaves a column alone. The nested options on
/// links distinguish "leave" from "clear".
#[derive(Debug, Clone, Default)]
pub struct NoteUpdate {
    pub content: Option<String>,
    pub content_source: Option<String>,
    pub visibility: Option<Visibility>,
    pub sensitive: Option<bool>,
    pub spoiler_text: Option<String>,
    pub reply_id: Option<Option<String>>,
    pub quoting_id: Option<Option<String>>,
    pub application_id: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub uri: Option<String>,
    pub username: String,
    pub display_name: String,
    pub note: String,
    pub avatar: Option<String>,
    pub header: Option<String>,
    pub is_bot: bool,
    pub is_locked: bool,
    pub is_discoverable: bool,
    pub instance_id: Option<String>,
    pub created_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewAttachment {
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
}

#[derive(Debug, Clone, Default)]
pub struct NewEmoji {
    pub shortcode: String,
    pub url: String,
    pub alt: Option<String>,
    pub content_type: String,
    pub visible_in_picker: bool,
    pub category: Option<String>,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: String,
    pub kind: String,
    pub account_id: String,
    pub notified_id: String,
    pub note_id: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCounts {
    pub followers: u64,
    pub following: u64,
    pub statuses: u64,
}

impl NoteDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create db dir: {}", parent.display()))?;
            }
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS instances (
              id TEXT PRIMARY KEY,
              base_url TEXT NOT NULL UNIQUE,
              name TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
              id TEXT PRIMARY KEY,
              uri TEXT NULL UNIQUE,
              username TEXT NOT NULL,
              display_name TEXT NOT NULL DEFAULT '',
              note TEXT NOT NULL DEFAULT '',
              avatar TEXT NULL,
              header TEXT NULL,
              is_bot INTEGER NOT NULL DEFAULT 0,
              is_locked INTEGER NOT NULL DEFAULT 0,
              is_discoverable INTEGER NOT NULL DEFAULT 0,
              instance_id TEXT NULL REFERENCES instances(id) ON DELETE CASCADE,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

            CREATE TABLE IF NOT EXISTS relationships (
              owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
              subject_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
              following INTEGER NOT NULL DEFAULT 0,
              muting INTEGER NOT NULL DEFAULT 0,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY(owner_id, subject_id)
            );
            CREATE INDEX IF NOT EXISTS idx_relationships_subject ON relationships(subject_id);

            CREATE TABLE IF NOT EXISTS applications (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              website TEXT NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notes (
              id TEXT PRIMARY KEY,
              author_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
              content TEXT NOT NULL DEFAULT '',
              content_source TEXT NOT NULL DEFAULT '',
              content_type TEXT NOT NULL DEFAULT 'text/html',
              visibility TEXT NOT NULL,
              sensitive INTEGER NOT NULL DEFAULT 0,
              spoiler_text TEXT NOT NULL DEFAULT '',
              uri TEXT NULL UNIQUE,
              reply_id TEXT NULL REFERENCES notes(id) ON DELETE SET NULL,
              quoting_id TEXT NULL REFERENCES notes(id) ON DELETE SET NULL,
              reblog_id TEXT NULL REFERENCES notes(id) ON DELETE CASCADE,
              application_id TEXT NULL REFERENCES applications(id) ON DELETE SET NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notes_author ON notes(author_id);
            CREATE INDEX IF NOT EXISTS idx_notes_reply ON notes(reply_id);
            CREATE INDEX IF NOT EXISTS idx_notes_quoting ON notes(quoting_id);
            CREATE INDEX IF NOT EXISTS idx_notes_reblog ON notes(reblog_id);

            CREATE TABLE IF NOT EXISTS attachments (
              id TEXT PRIMARY KEY,
              url TEXT NOT NULL,
              remote_url TEXT NULL,
              thumbnail_url TEXT NULL,
              mime_type TEXT NOT NULL,
              description TEXT NULL,
              blurhash TEXT NULL,
              sha256 TEXT NULL,
              size INTEGER NULL,
              width INTEGER NULL,
              height INTEGER NULL,
              fps INTEGER NULL,
              duration REAL NULL,
              note_id TEXT NULL REFERENCES notes(id) ON DELETE SET NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_note ON attachments(note_id);

            CREATE TABLE IF NOT EXISTS emojis (
              id TEXT PRIMARY KEY,
              shortcode TEXT NOT NULL,
              url TEXT NOT NULL,
              alt TEXT NULL,
              content_type TEXT NOT NULL,
              visible_in_picker INTEGER NOT NULL DEFAULT 1,
              category TEXT NULL,
              instance_id TEXT NULL REFERENCES instances(id) ON DELETE CASCADE,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_emojis_shortcode ON emojis(shortcode, instance_id);

            CREATE TABLE IF NOT EXISTS emoji_to_note (
              emoji_id TEXT NOT NULL REFERENCES emojis(id) ON DELETE CASCADE,
              note_id TEXT NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
              PRIMARY KEY(emoji_id, note_id)
            );
            CREATE INDEX IF NOT EXISTS idx_emoji_to_note_note ON emoji_to_note(note_id);

            CREATE TABLE IF NOT EXISTS note_to_mentions (
              note_id TEXT NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
              user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
              PRIMARY KEY(note_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS notifications (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              account_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
              notified_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
              note_id TEXT NULL REFERENCES notes(id) ON DELETE CASCADE,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_notified ON notifications(notified_id, created_at_ms DESC);

            CREATE TABLE IF NOT EXISTS likes (
              liker_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
              liked_id TEXT NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(liker_id, liked_id)
            );
            CREATE INDEX IF NOT EXISTS idx_likes_liked ON likes(liked_id);

            CREATE TABLE IF NOT EXISTS user_pinned_notes (
              user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
              note_id TEXT NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
              PRIMARY KEY(user_id, note_id)
            );
            "#,
        )?;
        Ok(Self { path })
    }

    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        Ok(conn)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Runs `f` inside one IMMEDIATE transaction: committed when `f` returns
    /// `Ok`, rolled back on every other exit (including panics, via drop).
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Connection) -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<anyhow::Error>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin transaction")?;
        let out = f(&tx)?;
        tx.commit().context("commit transaction")?;
        Ok(out)
    }

    /// Runs blocking store work off the async runtime.
    pub async fn run<T, E>(&self, f: impl FnOnce(&NoteDb) -> std::result::Result<T, E> + Send + 'static) -> std::result::Result<T, E>
    where
        T: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| E::from(anyhow::Error::new(e).context("db task failed")))?
    }

    pub fn find_notes(
        &self,
        filter: &NoteFilter,
        order: NoteOrder,
        limit: Option<u32>,
        offset: u32,
        viewer_id: Option<&str>,
    ) -> Result<Vec<Note>> {
        find_notes(&self.connect()?, filter, order, limit, offset, viewer_id)
    }

    pub fn get_note(&self, id: &str, viewer_id: Option<&str>) -> Result<Option<Note>> {
        get_note(&self.connect()?, id, viewer_id)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        get_user(&self.connect()?, id)
    }

    pub fn find_user_by_uri(&self, uri: &str) -> Result<Option<User>> {
        find_user_by_uri(&self.connect()?, uri)
    }

    pub fn is_following(&self, owner_id: &str, subject_id: &str) -> Result<bool> {
        is_following(&self.connect()?, owner_id, subject_id)
    }

    pub fn user_counts(&self, user_id: &str) -> Result<UserCounts> {
        user_counts(&self.connect()?, user_id)
    }

    pub fn list_notifications(&self, notified_id: &str) -> Result<Vec<Notification>> {
        list_notifications(&self.connect()?, notified_id)
    }
}

// ---------------------------------------------------------------------------
// Notes

const NOTE_COLUMNS: &str = "n.id, n.author_id, n.content, n.content_source, n.content_type, n.visibility, \
     n.sensitive, n.spoiler_text, n.uri, n.reply_id, n.quoting_id, n.reblog_id, n.application_id, \
     n.created_at_ms, n.updated_at_ms";

struct NoteRow {
    id: String,
    author_id: String,
    content: String,
    content_source: String,
    content_type: String,
    visibility: String,
    sensitive: bool,
    spoiler_text: String,
    uri: Option<String>,
    reply_id: Option<String>,
    quoting_id: Option<String>,
    reblog_id: Option<String>,
    application_id: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

fn note_row(r: &Row<'_>) -> rusqlite::Result<NoteRow> {
    Ok(NoteRow {
        id: r.get(0)?,
        author_id: r.get(1)?,
        content: r.get(2)?,
        content_source: r.get(3)?,
        content_type: r.get(4)?,
        visibility: r.get(5)?,
        sensitive: r.get::<_, i64>(6)? != 0,
        spoiler_text: r.get(7)?,
        uri: r.get(8)?,
        reply_id: r.get(9)?,
        quoting_id: r.get(10)?,
        reblog_id: r.get(11)?,
        application_id: r.get(12)?,
        created_at_ms: r.get(13)?,
        updated_at_ms: r.get(14)?,
    })
}

impl NoteFilter {
    fn where_clause(&self) -> (String, Vec<Value>) {
        match self {
            NoteFilter::Id(id) => ("n.id = ?".to_string(), vec![Value::Text(id.clone())]),
            NoteFilter::Ids(ids) => {
                if ids.is_empty() {
                    return ("0".to_string(), vec![]);
                }
                let marks = vec!["?"; ids.len()].join(", ");
                (
                    format!("n.id IN ({marks})"),
                    ids.iter().map(|id| Value::Text(id.clone())).collect(),
                )
            }
            NoteFilter::Uri(uri) => ("n.uri = ?".to_string(), vec![Value::Text(uri.clone())]),
            NoteFilter::RepliesTo(id) => ("n.reply_id = ?".to_string(), vec![Value::Text(id.clone())]),
        }
    }
}

impl NoteOrder {
    fn sql(self) -> &'static str {
        match self {
            NoteOrder::NewestFirst => "DESC",
            NoteOrder::OldestFirst => "ASC",
        }
    }
}

/// Filtered scan over notes, hydrated for `viewer_id`. `limit = None` scans
/// everything. Ordering is by id, which is time-ordered.
pub fn find_notes(
    conn: &Connection,
    filter: &NoteFilter,
    order: NoteOrder,
    limit: Option<u32>,
    offset: u32,
    viewer_id: Option<&str>,
) -> Result<Vec<Note>> {
    let (clause, mut args) = filter.where_clause();
    let sql = format!(
        "SELECT {NOTE_COLUMNS} FROM notes n WHERE {clause} ORDER BY n.id {} LIMIT ? OFFSET ?",
        order.sql()
    );
    args.push(Value::Integer(limit.map(i64::from).unwrap_or(-1)));
    args.push(Value::Integer(i64::from(offset)));

    let rows = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), note_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(note) = hydrate_note(conn, row, viewer_id, true)? {
            out.push(note);
        }
    }
    Ok(out)
}

pub fn get_note(conn: &Connection, id: &str, viewer_id: Option<&str>) -> Result<Option<Note>> {
    Ok(find_notes(conn, &NoteFilter::Id(id.to_string()), NoteOrder::NewestFirst, Some(1), 0, viewer_id)?
        .into_iter()
        .next())
}

fn load_note_row(conn: &Connection, id: &str) -> Result<Option<NoteRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {NOTE_COLUMNS} FROM notes n WHERE n.id=?1"),
            params![id],
            note_row,
        )
        .optional()?)
}

fn hydrate_note(conn: &Connection, row: NoteRow, viewer_id: Option<&str>, with_reblog: bool) -> Result<Option<Note>> {
    let Some(author) = get_user(conn, &row.author_id)? else {
        return Ok(None);
    };
    let application = match &row.application_id {
        Some(id) => get_application(conn, id)?,
        None => None,
    };
    let reblog = match (&row.reblog_id, with_reblog) {
        (Some(id), true) => match load_note_row(conn, id)? {
            Some(inner) => hydrate_note(conn, inner, viewer_id, false)?.map(Box::new),
            None => None,
        },
        _ => None,
    };
    let reply_author_id: Option<String> = match &row.reply_id {
        Some(id) => conn
            .query_row("SELECT author_id FROM notes WHERE id=?1", params![id], |r| r.get(0))
            .optional()?,
        None => None,
    };

    let like_count = count(conn, "SELECT COUNT(*) FROM likes WHERE liked_id=?1", &row.id)?;
    let reblog_count = count(conn, "SELECT COUNT(*) FROM notes WHERE reblog_id=?1", &row.id)?;
    let reply_count = count(conn, "SELECT COUNT(*) FROM notes WHERE reply_id=?1", &row.id)?;

    let (liked, reblogged, muted) = match viewer_id {
        Some(viewer) => (
            exists(
                conn,
                "SELECT 1 FROM likes WHERE liker_id=?1 AND liked_id=?2",
                params![viewer, row.id],
            )?,
            exists(
                conn,
                "SELECT 1 FROM notes WHERE author_id=?1 AND reblog_id=?2",
                params![viewer, row.id],
            )?,
            exists(
                conn,
                "SELECT 1 FROM relationships WHERE owner_id=?1 AND subject_id=?2 AND muting=1",
                params![viewer, row.author_id],
            )?,
        ),
        None => (false, false, false),
    };
    let pinned = exists(
        conn,
        "SELECT 1 FROM user_pinned_notes WHERE user_id=?1 AND note_id=?2",
        params![row.author_id, row.id],
    )?;

    Ok(Some(Note {
        mentions: note_mentions(conn, &row.id)?,
        emojis: note_emojis(conn, &row.id)?,
        attachments: note_attachments(conn, &row.id)?,
        id: row.id,
        author,
        content: row.content,
        content_source: row.content_source,
        content_type: row.content_type,
        visibility: Visibility::parse(&row.visibility),
        sensitive: row.sensitive,
        spoiler_text: row.spoiler_text,
        uri: row.uri,
        reply_id: row.reply_id,
        quoting_id: row.quoting_id,
        reblog_id: row.reblog_id,
        application,
        created_at_ms: row.created_at_ms,
        updated_at_ms: row.updated_at_ms,
        reblog,
        reply_author_id,
        like_count,
        reblog_count,
        reply_count,
        liked,
        reblogged,
        muted,
        pinned,
    }))
}

fn count(conn: &Connection, sql: &str, id: &str) -> Result<u64> {
    let n: i64 = conn.query_row(sql, params![id], |r| r.get(0))?;
    Ok(n.max(0) as u64)
}

fn exists(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<bool> {
    Ok(conn.query_row(sql, args, |_| Ok(())).optional()?.is_some())
}

pub fn note_id_by_uri(conn: &Connection, uri: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT id FROM notes WHERE uri=?1", params![uri], |r| r.get(0))
        .optional()?)
}

/// Remote URI stored on note `id`; `None` for local or unknown notes.
pub fn stored_uri(conn: &Connection, id: &str) -> Result<Option<String>> {
    let uri: Option<Option<String>> = conn
        .query_row("SELECT uri FROM notes WHERE id=?1", params![id], |r| r.get(0))
        .optional()?;
    Ok(uri.flatten())
}

pub fn insert_note(conn: &Connection, note: &NewNote) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO notes(id, author_id, content, content_source, content_type, visibility, sensitive,
                          spoiler_text, uri, reply_id, quoting_id, reblog_id, application_id,
                          created_at_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, 'text/html', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            note.id,
            note.author_id,
            note.content,
            note.content_source,
            note.visibility.as_str(),
            note.sensitive as i64,
            note.spoiler_text,
            note.uri,
            note.reply_id,
            note.quoting_id,
            note.reblog_id,
            note.application_id,
            note.created_at_ms,
            now_ms(),
        ],
    )
    .with_context(|| format!("insert note {}", note.id))?;
    Ok(())
}

/// Applies `patch` to note `id`. Returns false when no such note exists.
pub fn update_note(conn: &Connection, id: &str, patch: &NoteUpdate) -> Result<bool> {
    let mut sets: Vec<&str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    if let Some(v) = &patch.content {
        sets.push("content=?");
        args.push(Value::Text(v.clone()));
    }
    if let Some(v) = &patch.content_source {
        sets.push("content_source=?");
        args.push(Value::Text(v.clone()));
    }
    if let Some(v) = patch.visibility {
        sets.push("visibility=?");
        args.push(Value::Text(v.as_str().to_string()));
    }
    if let Some(v) = patch.sensitive {
        sets.push("sensitive=?");
        args.push(Value::Integer(v as i64));
    }
    if let Some(v) = &patch.spoiler_text {
        sets.push("spoiler_text=?");
        args.push(Value::Text(v.clone()));
    }
    for (column, value) in [
        ("reply_id=?", &patch.reply_id),
        ("quoting_id=?", &patch.quoting_id),
        ("application_id=?", &patch.application_id),
    ] {
        if let Some(v) = value {
            sets.push(column);
            args.push(v.clone().map(Value::Text).unwrap_or(Value::Null));
        }
    }
    sets.push("updated_at_ms=?");
    args.push(Value::Integer(now_ms()));
    args.push(Value::Text(id.to_string()));

    let sql = format!("UPDATE notes SET {} WHERE id=?", sets.join(", "));
    let changed = conn
        .execute(&sql, params_from_iter(args.iter()))
        .with_context(|| format!("update note {id}"))?;
    Ok(changed > 0)
}

pub fn delete_notes(conn: &Connection, ids: &[String]) -> Result<usize> {
    let mut deleted = 0;
    for id in ids {
        deleted += conn.execute("DELETE FROM notes WHERE id=?1", params![id])?;
    }
    Ok(deleted)
}

pub fn count_local_notes(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notes WHERE author_id IN (SELECT id FROM users WHERE instance_id IS NULL)",
        [],
        |r| r.get(0),
    )?;
    Ok(n.max(0) as u64)
}

/// True when `err` is a UNIQUE/constraint violation raised by SQLite.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
        )
    })
}

// ---------------------------------------------------------------------------
// Users, instances, relationships

const USER_COLUMNS: &str = "u.id, u.uri, u.username, u.display_name, u.note, u.avatar, u.header, \
     u.is_bot, u.is_locked, u.is_discoverable, u.created_at_ms, i.id, i.base_url, i.name";

fn user_row(r: &Row<'_>) -> rusqlite::Result<User> {
    let instance_id: Option<String> = r.get(11)?;
    let instance = match instance_id {
        Some(id) => Some(Instance {
            id,
            base_url: r.get(12)?,
            name: r.get(13)?,
        }),
        None => None,
    };
    Ok(User {
        id: r.get(0)?,
        uri: r.get(1)?,
        username: r.get(2)?,
        display_name: r.get(3)?,
        note: r.get(4)?,
        avatar: r.get(5)?,
        header: r.get(6)?,
        is_bot: r.get::<_, i64>(7)? != 0,
        is_locked: r.get::<_, i64>(8)? != 0,
        is_discoverable: r.get::<_, i64>(9)? != 0,
        created_at_ms: r.get(10)?,
        instance,
    })
}

fn find_user_where(conn: &Connection, clause: &str, arg: &str) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users u LEFT JOIN instances i ON i.id = u.instance_id WHERE {clause}"),
            params![arg],
            user_row,
        )
        .optional()?)
}

pub fn get_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    find_user_where(conn, "u.id=?1", id)
}

pub fn find_user_by_uri(conn: &Connection, uri: &str) -> Result<Option<User>> {
    find_user_where(conn, "u.uri=?1", uri)
}

/// Inserts a user; a remote user whose `uri` is already known is refreshed
/// in place instead. Returns the stored id.
pub fn upsert_user(conn: &Connection, user: &NewUser) -> Result<String> {
    let now = now_ms();
    let id = crate::model::new_id();
    conn.execute(
        r#"
        INSERT INTO users(id, uri, username, display_name, note, avatar, header, is_bot, is_locked,
                          is_discoverable, instance_id, created_at_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(uri) DO UPDATE SET
          username=excluded.username,
          display_name=excluded.display_name,
          note=excluded.note,
          avatar=excluded.avatar,
          header=excluded.header,
          is_bot=excluded.is_bot,
          is_locked=excluded.is_locked,
          is_discoverable=excluded.is_discoverable,
          instance_id=COALESCE(excluded.instance_id, users.instance_id),
          updated_at_ms=excluded.updated_at_ms
        "#,
        params![
            id,
            user.uri,
            user.username,
            user.display_name,
            user.note,
            user.avatar,
            user.header,
            user.is_bot as i64,
            user.is_locked as i64,
            user.is_discoverable as i64,
            user.instance_id,
            user.created_at_ms.unwrap_or(now),
            now,
        ],
    )
    .with_context(|| format!("upsert user {}", user.username))?;

    match &user.uri {
        Some(uri) => conn
            .query_row("SELECT id FROM users WHERE uri=?1", params![uri], |r| r.get(0))
            .with_context(|| format!("user row missing after upsert: {uri}")),
        None => Ok(id),
    }
}

pub fn upsert_instance(conn: &Connection, base_url: &str, name: &str) -> Result<Instance> {
    conn.execute(
        r#"
        INSERT INTO instances(id, base_url, name, created_at_ms) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(base_url) DO UPDATE SET name=excluded.name
        "#,
        params![crate::model::new_id(), base_url, name, now_ms()],
    )?;
    conn.query_row(
        "SELECT id, base_url, name FROM instances WHERE base_url=?1",
        params![base_url],
        |r| {
            Ok(Instance {
                id: r.get(0)?,
                base_url: r.get(1)?,
                name: r.get(2)?,
            })
        },
    )
    .with_context(|| format!("instance row missing after upsert: {base_url}"))
}

pub fn set_relationship(
    conn: &Connection,
    owner_id: &str,
    subject_id: &str,
    following: bool,
    muting: bool,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO relationships(owner_id, subject_id, following, muting, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(owner_id, subject_id) DO UPDATE SET
          following=excluded.following,
          muting=excluded.muting,
          updated_at_ms=excluded.updated_at_ms
        "#,
        params![owner_id, subject_id, following as i64, muting as i64, now_ms()],
    )?;
    Ok(())
}

pub fn is_following(conn: &Connection, owner_id: &str, subject_id: &str) -> Result<bool> {
    exists(
        conn,
        "SELECT 1 FROM relationships WHERE owner_id=?1 AND subject_id=?2 AND following=1",
        params![owner_id, subject_id],
    )
}

/// Remote users following `subject_id`.
pub fn remote_followers(conn: &Connection, subject_id: &str) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {USER_COLUMNS}
        FROM relationships r
        JOIN users u ON u.id = r.owner_id
        LEFT JOIN instances i ON i.id = u.instance_id
        WHERE r.subject_id=?1 AND r.following=1 AND u.instance_id IS NOT NULL
        ORDER BY u.id
        "#
    ))?;
    let rows = stmt
        .query_map(params![subject_id], user_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn user_counts(conn: &Connection, user_id: &str) -> Result<UserCounts> {
    Ok(UserCounts {
        followers: count(
            conn,
            "SELECT COUNT(*) FROM relationships WHERE subject_id=?1 AND following=1",
            user_id,
        )?,
        following: count(
            conn,
            "SELECT COUNT(*) FROM relationships WHERE owner_id=?1 AND following=1",
            user_id,
        )?,
        statuses: count(conn, "SELECT COUNT(*) FROM notes WHERE author_id=?1", user_id)?,
    })
}

// ---------------------------------------------------------------------------
// Applications

pub fn insert_application(conn: &Connection, name: &str, website: Option<&str>) -> Result<Application> {
    let id = crate::model::new_id();
    conn.execute(
        "INSERT INTO applications(id, name, website, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
        params![id, name, website, now_ms()],
    )?;
    Ok(Application {
        id,
        name: name.to_string(),
        website: website.map(str::to_string),
    })
}

pub fn get_application(conn: &Connection, id: &str) -> Result<Option<Application>> {
    Ok(conn
        .query_row(
            "SELECT id, name, website FROM applications WHERE id=?1",
            params![id],
            |r| {
                Ok(Application {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    website: r.get(2)?,
                })
            },
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Attachments

const ATTACHMENT_COLUMNS: &str = "id, url, remote_url, thumbnail_url, mime_type, description, blurhash, sha256, \
     size, width, height, fps, duration, note_id";

fn attachment_row(r: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: r.get(0)?,
        url: r.get(1)?,
        remote_url: r.get(2)?,
        thumbnail_url: r.get(3)?,
        mime_type: r.get(4)?,
        description: r.get(5)?,
        blurhash: r.get(6)?,
        sha256: r.get(7)?,
        size: r.get(8)?,
        width: r.get(9)?,
        height: r.get(10)?,
        fps: r.get(11)?,
        duration: r.get(12)?,
        note_id: r.get(13)?,
    })
}

pub fn insert_attachment(conn: &Connection, a: &NewAttachment) -> Result<Attachment> {
    let id = crate::model::new_id();
    conn.execute(
        r#"
        INSERT INTO attachments(id, url, remote_url, thumbnail_url, mime_type, description, blurhash, sha256,
                                size, width, height, fps, duration, note_id, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL, ?14)
        "#,
        params![
            id,
            a.url,
            a.remote_url,
            a.thumbnail_url,
            a.mime_type,
            a.description,
            a.blurhash,
            a.sha256,
            a.size,
            a.width,
            a.height,
            a.fps,
            a.duration,
            now_ms(),
        ],
    )?;
    get_attachment(conn, &id)?.with_context(|| format!("attachment row missing after insert: {id}"))
}

pub fn get_attachment(conn: &Connection, id: &str) -> Result<Option<Attachment>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id=?1"),
            params![id],
            attachment_row,
        )
        .optional()?)
}

pub fn note_attachments(conn: &Connection, note_id: &str) -> Result<Vec<Attachment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE note_id=?1 ORDER BY created_at_ms ASC, rowid ASC"
    ))?;
    let rows = stmt
        .query_map(params![note_id], attachment_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Points each listed attachment at `note_id`, taking it away from any
/// previous parent.
pub fn attach_to_note(conn: &Connection, note_id: &str, attachment_ids: &[String]) -> Result<()> {
    for id in attachment_ids {
        conn.execute(
            "UPDATE attachments SET note_id=?1 WHERE id=?2",
            params![note_id, id],
        )?;
    }
    Ok(())
}

pub fn detach_all(conn: &Connection, note_id: &str) -> Result<()> {
    conn.execute("UPDATE attachments SET note_id=NULL WHERE note_id=?1", params![note_id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Emojis

const EMOJI_COLUMNS: &str = "e.id, e.shortcode, e.url, e.alt, e.content_type, e.visible_in_picker, e.category, e.instance_id";

fn emoji_row(r: &Row<'_>) -> rusqlite::Result<Emoji> {
    Ok(Emoji {
        id: r.get(0)?,
        shortcode: r.get(1)?,
        url: r.get(2)?,
        alt: r.get(3)?,
        content_type: r.get(4)?,
        visible_in_picker: r.get::<_, i64>(5)? != 0,
        category: r.get(6)?,
        instance_id: r.get(7)?,
    })
}

pub fn insert_emoji(conn: &Connection, e: &NewEmoji) -> Result<Emoji> {
    let id = crate::model::new_id();
    conn.execute(
        r#"
        INSERT INTO emojis(id, shortcode, url, alt, content_type, visible_in_picker, category, instance_id, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            id,
            e.shortcode,
            e.url,
            e.alt,
            e.content_type,
            e.visible_in_picker as i64,
            e.category,
            e.instance_id,
            now_ms(),
        ],
    )?;
    Ok(Emoji {
        id,
        shortcode: e.shortcode.clone(),
        url: e.url.clone(),
        alt: e.alt.clone(),
        content_type: e.content_type.clone(),
        visible_in_picker: e.visible_in_picker,
        category: e.category.clone(),
        instance_id: e.instance_id.clone(),
    })
}

/// Emoji with `shortcode` from `instance_id` (`None` = local).
pub fn find_emoji(conn: &Connection, shortcode: &str, instance_id: Option<&str>) -> Result<Option<Emoji>> {
    Ok(conn
        .query_row(
            &format!("SELECT {EMOJI_COLUMNS} FROM emojis e WHERE e.shortcode=?1 AND e.instance_id IS ?2 LIMIT 1"),
            params![shortcode, instance_id],
            emoji_row,
        )
        .optional()?)
}

pub fn find_local_emojis(conn: &Connection, shortcodes: &[String]) -> Result<Vec<Emoji>> {
    let mut out = Vec::new();
    for code in shortcodes {
        if let Some(e) = find_emoji(conn, code, None)? {
            out.push(e);
        }
    }
    Ok(out)
}

pub fn note_emojis(conn: &Connection, note_id: &str) -> Result<Vec<Emoji>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EMOJI_COLUMNS} FROM emoji_to_note l JOIN emojis e ON e.id = l.emoji_id WHERE l.note_id=?1 ORDER BY l.rowid"
    ))?;
    let rows = stmt
        .query_map(params![note_id], emoji_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn link_emojis(conn: &Connection, note_id: &str, emoji_ids: &[String]) -> Result<()> {
    for id in emoji_ids {
        conn.execute(
            "INSERT OR IGNORE INTO emoji_to_note(emoji_id, note_id) VALUES (?1, ?2)",
            params![id, note_id],
        )?;
    }
    Ok(())
}

pub fn clear_note_emojis(conn: &Connection, note_id: &str) -> Result<()> {
    conn.execute("DELETE FROM emoji_to_note WHERE note_id=?1", params![note_id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Mentions, notifications, likes, pins

pub fn note_mentions(conn: &Connection, note_id: &str) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {USER_COLUMNS}
        FROM note_to_mentions m
        JOIN users u ON u.id = m.user_id
        LEFT JOIN instances i ON i.id = u.instance_id
        WHERE m.note_id=?1
        ORDER BY m.rowid
        "#
    ))?;
    let rows = stmt
        .query_map(params![note_id], user_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn link_mentions(conn: &Connection, note_id: &str, user_ids: &[String]) -> Result<()> {
    for id in user_ids {
        conn.execute(
            "INSERT OR IGNORE INTO note_to_mentions(note_id, user_id) VALUES (?1, ?2)",
            params![note_id, id],
        )?;
    }
    Ok(())
}

pub fn clear_note_mentions(conn: &Connection, note_id: &str) -> Result<()> {
    conn.execute("DELETE FROM note_to_mentions WHERE note_id=?1", params![note_id])?;
    Ok(())
}

pub fn insert_notification(
    conn: &Connection,
    kind: &str,
    account_id: &str,
    notified_id: &str,
    note_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO notifications(id, kind, account_id, notified_id, note_id, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![crate::model::new_id(), kind, account_id, notified_id, note_id, now_ms()],
    )?;
    Ok(())
}

pub fn list_notifications(conn: &Connection, notified_id: &str) -> Result<Vec<Notification>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, kind, account_id, notified_id, note_id, created_at_ms
        FROM notifications
        WHERE notified_id=?1
        ORDER BY id DESC
        "#,
    )?;
    let rows = stmt
        .query_map(params![notified_id], |r| {
            Ok(Notification {
                id: r.get(0)?,
                kind: r.get(1)?,
                account_id: r.get(2)?,
                notified_id: r.get(3)?,
                note_id: r.get(4)?,
                created_at_ms: r.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn insert_like(conn: &Connection, liker_id: &str, note_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO likes(liker_id, liked_id, created_at_ms) VALUES (?1, ?2, ?3)",
        params![liker_id, note_id, now_ms()],
    )?;
    Ok(())
}

pub fn pin_note(conn: &Connection, user_id: &str, note_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_pinned_notes(user_id, note_id) VALUES (?1, ?2)",
        params![user_id, note_id],
    )?;
    Ok(())
}
