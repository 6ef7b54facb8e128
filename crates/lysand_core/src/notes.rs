/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Note resolution: known-vs-fetch-vs-create-vs-merge decisions for notes
//! referenced by URI, and the fan-out writes behind local authoring.

use crate::config::ServerConfig;
use crate::content::{self, MentionLink};
use crate::error::{ResolveError, ResolveResult};
use crate::media;
use crate::model::{new_id, rfc3339_to_ms, Application, Emoji, Note, User};
use crate::note_db::{self, NewAttachment, NewEmoji, NewNote, NoteDb, NoteFilter, NoteOrder, NoteUpdate};
use crate::object_fetch::RemoteFetcher;
use crate::users::IdentityResolver;
use futures_util::future::{BoxFuture, FutureExt};
use lysand_protocol::{content_of, ContentFormat, CustomEmoji, Visibility, CUSTOM_EMOJIS_EXTENSION};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("valid uuid regex")
});

/// Input of a note creation. `emojis`, `mentions` and `media_attachments`
/// must already be stored.
#[derive(Debug, Clone)]
pub struct NoteDraft {
    pub author: User,
    pub content: ContentFormat,
    pub visibility: Visibility,
    pub sensitive: bool,
    pub spoiler_text: String,
    pub emojis: Vec<Emoji>,
    pub uri: Option<String>,
    pub mentions: Vec<User>,
    pub media_attachments: Vec<String>,
    pub reply_id: Option<String>,
    pub quote_id: Option<String>,
    pub application: Option<Application>,
    pub created_at_ms: Option<i64>,
}

impl NoteDraft {
    pub fn new(author: User, content: ContentFormat) -> Self {
        Self {
            author,
            content,
            visibility: Visibility::Public,
            sensitive: false,
            spoiler_text: String::new(),
            emojis: Vec::new(),
            uri: None,
            mentions: Vec::new(),
            media_attachments: Vec::new(),
            reply_id: None,
            quote_id: None,
            application: None,
            created_at_ms: None,
        }
    }
}

/// Partial update. `None` leaves a field as it is; for links the inner
/// `None` clears them. Supplied `emojis` / `mentions` replace the whole set;
/// supplied `media_attachments` (even empty) replace all attachments.
#[derive(Debug, Clone, Default)]
pub struct NotePatch {
    pub content: Option<ContentFormat>,
    pub visibility: Option<Visibility>,
    pub sensitive: Option<bool>,
    pub spoiler_text: Option<String>,
    pub emojis: Option<Vec<Emoji>>,
    pub mentions: Option<Vec<User>>,
    pub media_attachments: Option<Vec<String>>,
    pub reply_id: Option<Option<String>>,
    pub quote_id: Option<Option<String>>,
    pub application: Option<Option<Application>>,
}

/// In-process keyed lock: one check-then-write per URI at a time.
#[derive(Clone, Default)]
pub struct UriLocks {
    inner: Arc<StdMutex<HashMap<String, Weak<Mutex<()>>>>>,
}

impl UriLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, w| w.strong_count() > 0);
            match map.get(key).and_then(Weak::upgrade) {
                Some(m) => m,
                None => {
                    let m = Arc::new(Mutex::new(()));
                    map.insert(key.to_string(), Arc::downgrade(&m));
                    m
                }
            }
        };
        slot.lock_owned().await
    }
}

/// Limits of one top-level remote resolution: the chain of notes being
/// saved (cycle detection), its length, and the number of remote GETs.
#[derive(Debug)]
pub struct ResolveBudget {
    path: Vec<String>,
    max_depth: u32,
    fetches: u32,
    max_fetches: u32,
}

impl ResolveBudget {
    pub fn new(max_depth: u32, max_fetches: u32) -> Self {
        Self {
            path: Vec::new(),
            max_depth,
            fetches: 0,
            max_fetches,
        }
    }

    pub fn depth(&self) -> u32 {
        self.path.len() as u32
    }

    pub fn fetches(&self) -> u32 {
        self.fetches
    }

    fn enter(&mut self, uri: &str) -> ResolveResult<()> {
        if !uri.is_empty() && self.path.iter().any(|u| u == uri) {
            return Err(ResolveError::Cycle(uri.to_string()));
        }
        if self.depth() >= self.max_depth {
            return Err(ResolveError::DepthExceeded {
                uri: uri.to_string(),
                depth: self.depth(),
            });
        }
        self.path.push(uri.to_string());
        Ok(())
    }

    fn leave(&mut self) {
        self.path.pop();
    }

    fn take_fetch(&mut self, uri: &str) -> ResolveResult<()> {
        if self.fetches >= self.max_fetches {
            return Err(ResolveError::FetchBudgetExceeded(uri.to_string()));
        }
        self.fetches += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Link {
    Absent,
    Resolved(String),
    Unresolved,
}

impl Link {
    fn for_create(&self) -> Option<String> {
        match self {
            Link::Resolved(id) => Some(id.clone()),
            Link::Absent | Link::Unresolved => None,
        }
    }

    /// A payload without the link clears it; a link that could not be
    /// followed this time keeps whatever was stored.
    fn for_update(&self) -> Option<Option<String>> {
        match self {
            Link::Absent => Some(None),
            Link::Resolved(id) => Some(Some(id.clone())),
            Link::Unresolved => None,
        }
    }
}

/// Everything a remote save needs, gathered before the write transaction.
struct PreparedRemote {
    uri: String,
    author: User,
    content: ContentFormat,
    visibility: Visibility,
    sensitive: bool,
    spoiler_text: String,
    created_at_ms: Option<i64>,
    mentions: Vec<User>,
    attachments: Vec<NewAttachment>,
    emojis: Vec<NewEmoji>,
    reply: Link,
    quote: Link,
}

#[derive(Clone)]
pub struct NoteEngine {
    db: NoteDb,
    cfg: Arc<ServerConfig>,
    fetcher: Arc<dyn RemoteFetcher>,
    identities: Arc<dyn IdentityResolver>,
    locks: UriLocks,
}

impl NoteEngine {
    pub fn new(
        db: NoteDb,
        cfg: Arc<ServerConfig>,
        fetcher: Arc<dyn RemoteFetcher>,
        identities: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            db,
            cfg,
            fetcher,
            identities,
            locks: UriLocks::default(),
        }
    }

    pub fn db(&self) -> &NoteDb {
        &self.db
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.cfg
    }

    pub fn identities(&self) -> &Arc<dyn IdentityResolver> {
        &self.identities
    }

    pub fn new_budget(&self) -> ResolveBudget {
        ResolveBudget::new(
            self.cfg.federation.max_resolve_depth,
            self.cfg.federation.max_fetches_per_resolve,
        )
    }

    // -- lookups ----------------------------------------------------------

    pub async fn from_id(&self, id: &str, viewer_id: Option<&str>) -> ResolveResult<Option<Note>> {
        let id = id.to_string();
        let viewer = viewer_id.map(str::to_string);
        Ok(self.db.run(move |db| db.get_note(&id, viewer.as_deref())).await?)
    }

    pub async fn from_ids(&self, ids: &[String], viewer_id: Option<&str>) -> ResolveResult<Vec<Note>> {
        let filter = NoteFilter::Ids(ids.to_vec());
        let viewer = viewer_id.map(str::to_string);
        Ok(self
            .db
            .run(move |db| db.find_notes(&filter, NoteOrder::NewestFirst, None, 0, viewer.as_deref()))
            .await?)
    }

    pub async fn find_by_uri(&self, uri: &str) -> ResolveResult<Option<Note>> {
        let filter = NoteFilter::Uri(uri.to_string());
        Ok(self
            .db
            .run(move |db| db.find_notes(&filter, NoteOrder::NewestFirst, Some(1), 0, None))
            .await?
            .into_iter()
            .next())
    }

    /// Direct replies to `note_id`, newest first.
    pub async fn reply_children(&self, note_id: &str, viewer_id: Option<&str>) -> ResolveResult<Vec<Note>> {
        let filter = NoteFilter::RepliesTo(note_id.to_string());
        let viewer = viewer_id.map(str::to_string);
        Ok(self
            .db
            .run(move |db| db.find_notes(&filter, NoteOrder::NewestFirst, None, 0, viewer.as_deref()))
            .await?)
    }

    pub async fn count_local(&self) -> ResolveResult<u64> {
        Ok(self.db.run(|db| note_db::count_local_notes(&db.connect()?)).await?)
    }

    /// Remote users that should receive `note`: remote mentions plus remote
    /// followers of its author, each once.
    pub async fn federation_targets(&self, note: &Note) -> ResolveResult<Vec<User>> {
        let author_id = note.author.id.clone();
        let mentions = note.mentions.clone();
        Ok(self
            .db
            .run(move |db| -> anyhow::Result<Vec<User>> {
                let conn = db.connect()?;
                let mut out: Vec<User> = mentions.into_iter().filter(User::is_remote).collect();
                for follower in note_db::remote_followers(&conn, &author_id)? {
                    if !out.iter().any(|u| u.id == follower.id) {
                        out.push(follower);
                    }
                }
                Ok(out)
            })
            .await?)
    }

    pub fn local_uri(&self, note: &Note) -> String {
        self.cfg.local_object_uri(&note.id)
    }

    pub fn masto_url(&self, note: &Note) -> String {
        note.masto_url(&self.cfg)
    }

    // -- resolution -------------------------------------------------------

    /// Returns the stored note for `uri`, looking it up locally for this
    /// server's URIs and fetching it otherwise. Unreachable remote notes
    /// yield `Ok(None)`.
    pub async fn resolve(&self, uri: Option<&str>, payload: Option<Value>) -> ResolveResult<Option<Note>> {
        let mut budget = self.new_budget();
        match self.resolve_with(uri.map(str::to_string), payload, &mut budget).await {
            Err(ResolveError::NotFound(uri)) => {
                debug!(uri = %uri, "remote note not found");
                Ok(None)
            }
            other => other,
        }
    }

    /// Fetches (or takes the inline payload) and creates or updates the note.
    pub async fn save_from_remote(&self, uri: Option<&str>, payload: Option<Value>) -> ResolveResult<Note> {
        let mut budget = self.new_budget();
        let uri = uri.map(str::trim).filter(|u| !u.is_empty()).map(str::to_string);
        self.save_with(uri, payload, &mut budget).await
    }

    /// Re-fetches a remote note from its origin.
    pub async fn refetch(&self, note: &Note) -> ResolveResult<Note> {
        if !note.is_remote() {
            return Err(ResolveError::NotRemote(note.id.clone()));
        }
        let uri = note.uri(&self.cfg);
        self.save_from_remote(Some(&uri), None).await
    }

    pub fn resolve_with<'a>(
        &'a self,
        uri: Option<String>,
        payload: Option<Value>,
        budget: &'a mut ResolveBudget,
    ) -> BoxFuture<'a, ResolveResult<Option<Note>>> {
        async move {
            let uri = uri.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
            if uri.is_none() && payload.is_none() {
                return Err(ResolveError::MissingInput);
            }
            if let Some(uri) = &uri {
                if let Some(found) = self.find_by_uri(uri).await? {
                    return Ok(Some(found));
                }
                if self.cfg.is_local_uri(uri) {
                    let id = local_note_id(&self.cfg, uri)
                        .ok_or_else(|| ResolveError::MalformedLocalUri(uri.clone()))?;
                    return self.from_id(&id, None).await;
                }
            }
            self.save_with(uri, payload, budget).await.map(Some)
        }
        .boxed()
    }

    fn save_with<'a>(
        &'a self,
        uri: Option<String>,
        payload: Option<Value>,
        budget: &'a mut ResolveBudget,
    ) -> BoxFuture<'a, ResolveResult<Note>> {
        async move {
            if uri.is_none() && payload.is_none() {
                return Err(ResolveError::MissingInput);
            }
            let key = uri
                .clone()
                .or_else(|| {
                    payload
                        .as_ref()
                        .and_then(|p| p.get("uri"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_default();
            budget.enter(&key)?;
            let out = self.save_entered(uri, payload, budget).await;
            budget.leave();
            out
        }
        .boxed()
    }

    async fn save_entered(
        &self,
        uri: Option<String>,
        payload: Option<Value>,
        budget: &mut ResolveBudget,
    ) -> ResolveResult<Note> {
        let body = match &uri {
            Some(uri) => {
                reqwest::Url::parse(uri).map_err(|_| ResolveError::InvalidUri(uri.clone()))?;
                budget.take_fetch(uri)?;
                let fetched = match self.fetcher.fetch(uri).await {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(uri = %uri, "note fetch failed: {e:#}");
                        return Err(ResolveError::NotFound(uri.clone()));
                    }
                };
                if !fetched.is_success() || fetched.body.is_null() {
                    debug!(uri = %uri, status = fetched.status, "note fetch not ok");
                    return Err(ResolveError::NotFound(uri.clone()));
                }
                fetched.body
            }
            None => payload.ok_or(ResolveError::MissingInput)?,
        };

        let WireNote {
            note: wire,
            attachments: raw_attachments,
            emojis: raw_emojis,
            mentions: raw_mentions,
        } = parse_wire_note(body)?;
        let canonical = match (wire.uri.trim(), &uri) {
            (w, _) if !w.is_empty() => w.to_string(),
            (_, Some(u)) => u.clone(),
            _ => return Err(ResolveError::InvalidPayload("note has no uri".to_string())),
        };
        if self.cfg.is_local_uri(&canonical) {
            return Err(ResolveError::InvalidPayload(format!(
                "remote payload claims a local uri: {canonical}"
            )));
        }

        let author = match self.identities.resolve(&wire.author).await {
            Ok(Some(a)) if a.is_remote() => a,
            Ok(Some(_)) => {
                warn!(uri = %canonical, author = %wire.author, "remote note attributed to a local user");
                return Err(ResolveError::InvalidAuthor(wire.author.clone()));
            }
            Ok(None) => return Err(ResolveError::InvalidAuthor(wire.author.clone())),
            Err(e) => {
                warn!(uri = %canonical, author = %wire.author, "author resolution failed: {e:#}");
                return Err(ResolveError::InvalidAuthor(wire.author.clone()));
            }
        };

        let mut attachments = Vec::new();
        for (index, raw) in raw_attachments.into_iter().enumerate() {
            let parsed = serde_json::from_value::<ContentFormat>(raw)
                .map_err(anyhow::Error::from)
                .and_then(|f| media::attachment_from_wire(&f));
            match parsed {
                Ok(a) => attachments.push(a),
                Err(e) => warn!(uri = %canonical, index, "skipping attachment: {e:#}"),
            }
        }

        let instance_id = author.instance.as_ref().map(|i| i.id.clone());
        let mut emojis = Vec::new();
        for (index, raw) in raw_emojis.into_iter().enumerate() {
            let parsed = serde_json::from_value::<CustomEmoji>(raw)
                .map_err(anyhow::Error::from)
                .and_then(|e| media::emoji_from_wire(&e, instance_id.as_deref()));
            match parsed {
                Ok(e) => emojis.push(e),
                Err(e) => warn!(uri = %canonical, index, "skipping emoji: {e:#}"),
            }
        }

        let mut mentions: Vec<User> = Vec::new();
        for raw in &raw_mentions {
            let Some(mention) = raw.as_str() else {
                warn!(uri = %canonical, "skipping malformed mention: {raw}");
                continue;
            };
            match self.identities.resolve(mention).await {
                Ok(Some(user)) => {
                    if !mentions.iter().any(|m| m.id == user.id) {
                        mentions.push(user);
                    }
                }
                Ok(None) => warn!(uri = %canonical, mention = %mention, "skipping unknown mention"),
                Err(e) => warn!(uri = %canonical, mention = %mention, "skipping mention: {e:#}"),
            }
        }

        let reply = self.resolve_link(wire.replies_to.as_deref(), "reply", budget).await?;
        let quote = self.resolve_link(wire.quotes.as_deref(), "quote", budget).await?;

        let prepared = PreparedRemote {
            uri: canonical.clone(),
            author,
            content: wire
                .content
                .clone()
                .unwrap_or_else(|| content_of(content::MIME_PLAIN, "")),
            visibility: wire
                .visibility
                .as_deref()
                .map(Visibility::parse)
                .unwrap_or(Visibility::Public),
            sensitive: wire.is_sensitive.unwrap_or(false),
            spoiler_text: wire.subject.clone().unwrap_or_default(),
            created_at_ms: wire.created_at.as_deref().and_then(rfc3339_to_ms),
            mentions,
            attachments,
            emojis,
            reply,
            quote,
        };

        let _guard = self.locks.lock(&canonical).await;
        let cfg = self.cfg.clone();
        let id = self
            .db
            .run(move |db| db.transaction(|conn| write_remote(conn, &cfg, prepared)))
            .await?;
        let note = self
            .from_id(&id, None)
            .await?
            .ok_or_else(|| ResolveError::Invariant(format!("note {id} missing after save")))?;
        info!(uri = %canonical, id = %note.id, "remote note saved");
        Ok(note)
    }

    async fn resolve_link(
        &self,
        target: Option<&str>,
        kind: &'static str,
        budget: &mut ResolveBudget,
    ) -> ResolveResult<Link> {
        let Some(target) = target.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(Link::Absent);
        };
        match self.resolve_with(Some(target.to_string()), None, budget).await {
            Ok(Some(note)) => Ok(Link::Resolved(note.id)),
            Ok(None) => {
                warn!(uri = %target, link = kind, "link target not found");
                Ok(Link::Unresolved)
            }
            Err(e) if e.is_soft() => {
                warn!(uri = %target, link = kind, "leaving link unset: {e}");
                Ok(Link::Unresolved)
            }
            Err(e) => Err(e),
        }
    }

    // -- authoring --------------------------------------------------------

    /// Creates a note with all its fan-out rows in one transaction.
    pub async fn from_data(&self, draft: NoteDraft) -> ResolveResult<Note> {
        let _guard = match &draft.uri {
            Some(uri) => Some(self.locks.lock(uri).await),
            None => None,
        };
        let author_id = draft.author.id.clone();
        let cfg = self.cfg.clone();
        let id = self
            .db
            .run(move |db| db.transaction(|conn| create_in(conn, &cfg, &draft)))
            .await?;
        let note = self
            .from_id(&id, Some(&author_id))
            .await?
            .ok_or_else(|| ResolveError::Invariant(format!("note {id} missing after insert")))?;
        debug!(id = %note.id, "note created");
        Ok(note)
    }

    /// Applies `patch` to the stored version of `note`.
    pub async fn update_from_data(&self, note: &Note, patch: NotePatch) -> ResolveResult<Note> {
        let id = note.id.clone();
        let author_id = note.author.id.clone();
        let cfg = self.cfg.clone();
        let target = id.clone();
        self.db
            .run(move |db| {
                db.transaction(|conn| {
                    let current = note_db::get_note(conn, &target, None)?
                        .ok_or_else(|| ResolveError::Invariant(format!("note {target} missing before update")))?;
                    update_in(conn, &cfg, &current, &patch)
                })
            })
            .await?;
        let updated = self
            .from_id(&id, Some(&author_id))
            .await?
            .ok_or_else(|| ResolveError::Invariant(format!("note {id} missing after update")))?;
        debug!(id = %updated.id, "note updated");
        Ok(updated)
    }

    pub async fn delete(&self, note: &Note) -> ResolveResult<()> {
        self.delete_many(std::slice::from_ref(&note.id)).await.map(|_| ())
    }

    pub async fn delete_many(&self, ids: &[String]) -> ResolveResult<usize> {
        let ids = ids.to_vec();
        let deleted = self
            .db
            .run(move |db| db.transaction(|conn| note_db::delete_notes(conn, &ids)))
            .await?;
        info!(deleted, "notes deleted");
        Ok(deleted)
    }
}

/// Id of a local note out of one of this server's URIs.
pub fn local_note_id(cfg: &ServerConfig, uri: &str) -> Option<String> {
    let rest = cfg.local_path(uri)?;
    UUID_RE.find(rest).map(|m| m.as_str().to_ascii_lowercase())
}

/// A decoded wire note. Attachments, custom emojis and mentions stay raw so a
/// malformed entry only drops itself.
struct WireNote {
    note: lysand_protocol::Note,
    attachments: Vec<Value>,
    emojis: Vec<Value>,
    mentions: Vec<Value>,
}

/// Type and author are checked first so their errors win over generic
/// decoding failures.
fn parse_wire_note(body: Value) -> ResolveResult<WireNote> {
    let ty = body.get("type").and_then(Value::as_str).unwrap_or_default();
    if ty != lysand_protocol::NOTE_TYPE {
        return Err(ResolveError::InvalidObjectType(if ty.is_empty() {
            "<missing>".to_string()
        } else {
            ty.to_string()
        }));
    }
    match body.get("author").and_then(Value::as_str) {
        Some(a) if !a.trim().is_empty() => {}
        _ => return Err(ResolveError::InvalidAuthor("<missing>".to_string())),
    }
    let Value::Object(mut map) = body else {
        return Err(ResolveError::InvalidPayload("note is not an object".to_string()));
    };
    let attachments = take_list(&mut map, "attachments");
    let mentions = take_list(&mut map, "mentions");
    let emojis = match map.get_mut("extensions").and_then(Value::as_object_mut) {
        Some(ext) => match ext.remove(CUSTOM_EMOJIS_EXTENSION) {
            Some(Value::Object(mut e)) => take_list(&mut e, "emojis"),
            _ => Vec::new(),
        },
        None => Vec::new(),
    };
    let note = serde_json::from_value(Value::Object(map))
        .map_err(|e| ResolveError::InvalidPayload(e.to_string()))?;
    Ok(WireNote {
        note,
        attachments,
        emojis,
        mentions,
    })
}

/// Removes `key` from `map`; anything but an array counts as empty.
fn take_list(map: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match map.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn mention_links(cfg: &ServerConfig, users: &[User]) -> Vec<MentionLink> {
    users
        .iter()
        .map(|u| MentionLink {
            username: u.username.clone(),
            host: u.instance.as_ref().map(|i| i.host()),
            href: u.uri(cfg),
        })
        .collect()
}

fn union_emojis(base: &mut Vec<Emoji>, extra: Vec<Emoji>) {
    for e in extra {
        if !base.iter().any(|b| b.id == e.id) {
            base.push(e);
        }
    }
}

fn dedup_ids(users: &[User]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::with_capacity(users.len());
    for u in users {
        if !ids.contains(&u.id) {
            ids.push(u.id.clone());
        }
    }
    ids
}

fn create_in(conn: &Connection, cfg: &ServerConfig, draft: &NoteDraft) -> ResolveResult<String> {
    let html = content::content_to_html(&draft.content, &mention_links(cfg, &draft.mentions), &cfg.base_host());

    let mut emojis = draft.emojis.clone();
    if draft.author.is_local() {
        let parsed = note_db::find_local_emojis(conn, &content::parse_emoji_shortcodes(&html))?;
        union_emojis(&mut emojis, parsed);
    }

    let id = new_id();
    note_db::insert_note(
        conn,
        &NewNote {
            id: id.clone(),
            author_id: draft.author.id.clone(),
            content: html,
            content_source: content::content_source(&draft.content),
            visibility: draft.visibility,
            sensitive: draft.sensitive,
            spoiler_text: content::strip_html(&draft.spoiler_text),
            uri: draft.uri.clone().filter(|u| !u.trim().is_empty()),
            reply_id: draft.reply_id.clone(),
            quoting_id: draft.quote_id.clone(),
            reblog_id: None,
            application_id: draft.application.as_ref().map(|a| a.id.clone()),
            created_at_ms: draft.created_at_ms.unwrap_or_else(crate::model::now_ms),
        },
    )?;

    note_db::link_emojis(conn, &id, &emojis.iter().map(|e| e.id.clone()).collect::<Vec<_>>())?;
    note_db::link_mentions(conn, &id, &dedup_ids(&draft.mentions))?;
    if !draft.media_attachments.is_empty() {
        note_db::attach_to_note(conn, &id, &draft.media_attachments)?;
    }
    for mention in draft.mentions.iter().filter(|m| m.is_local()) {
        note_db::insert_notification(conn, "mention", &draft.author.id, &mention.id, Some(&id))?;
    }
    Ok(id)
}

fn update_in(conn: &Connection, cfg: &ServerConfig, note: &Note, patch: &NotePatch) -> ResolveResult<()> {
    let render_mentions = patch.mentions.as_deref().unwrap_or(&note.mentions);
    let html = patch
        .content
        .as_ref()
        .map(|c| content::content_to_html(c, &mention_links(cfg, render_mentions), &cfg.base_host()));

    let emojis = match (&html, note.author.is_local()) {
        (Some(html), true) => {
            let mut set = patch.emojis.clone().unwrap_or_else(|| note.emojis.clone());
            let parsed = note_db::find_local_emojis(conn, &content::parse_emoji_shortcodes(html))?;
            union_emojis(&mut set, parsed);
            Some(set)
        }
        _ => patch.emojis.clone(),
    };

    let changed = note_db::update_note(
        conn,
        &note.id,
        &NoteUpdate {
            content_source: patch.content.as_ref().map(content::content_source),
            content: html,
            visibility: patch.visibility,
            sensitive: patch.sensitive,
            spoiler_text: patch.spoiler_text.as_deref().map(content::strip_html),
            reply_id: patch.reply_id.clone(),
            quoting_id: patch.quote_id.clone(),
            application_id: patch
                .application
                .as_ref()
                .map(|a| a.as_ref().map(|a| a.id.clone())),
        },
    )?;
    if !changed {
        return Err(ResolveError::Invariant(format!("note {} vanished during update", note.id)));
    }

    if let Some(emojis) = emojis {
        note_db::clear_note_emojis(conn, &note.id)?;
        note_db::link_emojis(conn, &note.id, &emojis.iter().map(|e| e.id.clone()).collect::<Vec<_>>())?;
    }
    if let Some(mentions) = &patch.mentions {
        note_db::clear_note_mentions(conn, &note.id)?;
        note_db::link_mentions(conn, &note.id, &dedup_ids(mentions))?;
    }
    if let Some(attachments) = &patch.media_attachments {
        note_db::detach_all(conn, &note.id)?;
        note_db::attach_to_note(conn, &note.id, attachments)?;
    }
    Ok(())
}

fn write_remote(conn: &Connection, cfg: &ServerConfig, p: PreparedRemote) -> ResolveResult<String> {
    let mut attachment_ids = Vec::with_capacity(p.attachments.len());
    for a in &p.attachments {
        attachment_ids.push(note_db::insert_attachment(conn, a)?.id);
    }
    let mut emojis: Vec<Emoji> = Vec::with_capacity(p.emojis.len());
    for e in &p.emojis {
        let emoji = media::find_or_insert_emoji(conn, e)?;
        union_emojis(&mut emojis, vec![emoji]);
    }

    if let Some(id) = note_db::note_id_by_uri(conn, &p.uri)? {
        update_remote(conn, cfg, &id, &p, emojis, attachment_ids)?;
        return Ok(id);
    }

    let draft = NoteDraft {
        author: p.author.clone(),
        content: p.content.clone(),
        visibility: p.visibility,
        sensitive: p.sensitive,
        spoiler_text: p.spoiler_text.clone(),
        emojis: emojis.clone(),
        uri: Some(p.uri.clone()),
        mentions: p.mentions.clone(),
        media_attachments: attachment_ids.clone(),
        reply_id: p.reply.for_create(),
        quote_id: p.quote.for_create(),
        application: None,
        created_at_ms: p.created_at_ms,
    };
    match create_in(conn, cfg, &draft) {
        Ok(id) => Ok(id),
        Err(ResolveError::Store(e)) if note_db::is_constraint_violation(&e) => {
            let Some(id) = note_db::note_id_by_uri(conn, &p.uri)? else {
                return Err(ResolveError::Store(e));
            };
            warn!(uri = %p.uri, id = %id, "note appeared concurrently; updating in place");
            update_remote(conn, cfg, &id, &p, emojis, attachment_ids)?;
            Ok(id)
        }
        Err(e) => Err(e),
    }
}

fn update_remote(
    conn: &Connection,
    cfg: &ServerConfig,
    id: &str,
    p: &PreparedRemote,
    emojis: Vec<Emoji>,
    attachment_ids: Vec<String>,
) -> ResolveResult<()> {
    let current = note_db::get_note(conn, id, None)?
        .ok_or_else(|| ResolveError::Invariant(format!("note {id} missing before update")))?;
    let patch = NotePatch {
        content: Some(p.content.clone()),
        visibility: Some(p.visibility),
        sensitive: Some(p.sensitive),
        spoiler_text: Some(p.spoiler_text.clone()),
        emojis: Some(emojis),
        mentions: Some(p.mentions.clone()),
        media_attachments: Some(attachment_ids),
        reply_id: p.reply.for_update(),
        quote_id: p.quote.for_update(),
        application: None,
    };
    update_in(conn, cfg, &current, &patch)
}
