/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::ServerConfig;
use crate::content;
use crate::model::{rfc3339_to_ms, User};
use crate::note_db::{self, NewUser, NoteDb};
use crate::object_fetch::RemoteFetcher;
use anyhow::Result;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Resolves an author or mention reference to a stored user.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `uri_or_id` is a user URI (local or remote) or a local user id.
    /// `Ok(None)` means "no such user".
    async fn resolve(&self, uri_or_id: &str) -> Result<Option<User>>;
}

/// Store-backed resolver. Unknown remote users are fetched and persisted;
/// URIs that failed to resolve are remembered for a while so a busy thread
/// does not hammer a dead host.
#[derive(Clone)]
pub struct StoreIdentityResolver {
    db: NoteDb,
    cfg: Arc<ServerConfig>,
    fetcher: Arc<dyn RemoteFetcher>,
    misses: Arc<RwLock<HashMap<String, std::time::Instant>>>,
    miss_ttl: Duration,
}

impl StoreIdentityResolver {
    pub fn new(db: NoteDb, cfg: Arc<ServerConfig>, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        let miss_ttl = Duration::from_secs(cfg.federation.user_cache_ttl_secs);
        Self {
            db,
            cfg,
            fetcher,
            misses: Arc::new(RwLock::new(HashMap::new())),
            miss_ttl,
        }
    }

    async fn is_recent_miss(&self, uri: &str) -> bool {
        let mut misses = self.misses.write().await;
        let now = std::time::Instant::now();
        if let Some(until) = misses.get(uri) {
            if *until > now {
                return true;
            }
        }
        misses.remove(uri);
        false
    }

    async fn remember_miss(&self, uri: &str) {
        if self.miss_ttl.is_zero() {
            return;
        }
        let now = std::time::Instant::now();
        let mut misses = self.misses.write().await;
        misses.retain(|_, until| *until > now);
        misses.insert(uri.to_string(), now + self.miss_ttl);
    }

    async fn fetch_remote(&self, uri: &str) -> Result<Option<User>> {
        let fetched = match self.fetcher.fetch(uri).await {
            Ok(f) => f,
            Err(e) => {
                warn!(uri = %uri, "user fetch failed: {e:#}");
                self.remember_miss(uri).await;
                return Ok(None);
            }
        };
        if !fetched.is_success() {
            debug!(uri = %uri, status = fetched.status, "user fetch not ok");
            self.remember_miss(uri).await;
            return Ok(None);
        }
        let wire: lysand_protocol::User = match serde_json::from_value(fetched.body) {
            Ok(u) => u,
            Err(e) => {
                warn!(uri = %uri, "user payload invalid: {e}");
                self.remember_miss(uri).await;
                return Ok(None);
            }
        };
        if wire.ty != lysand_protocol::USER_TYPE {
            warn!(uri = %uri, ty = %wire.ty, "object is not a user");
            self.remember_miss(uri).await;
            return Ok(None);
        }
        let Some(origin) = origin_of(uri) else {
            self.remember_miss(uri).await;
            return Ok(None);
        };

        let canonical = if wire.uri.trim().is_empty() {
            uri.to_string()
        } else {
            wire.uri.trim().to_string()
        };
        let local_host = self.cfg.base_host();
        let new_user = NewUser {
            uri: Some(canonical),
            username: wire.username.clone(),
            display_name: wire.display_name.clone().unwrap_or_else(|| wire.username.clone()),
            note: wire
                .bio
                .as_ref()
                .map(|bio| content::content_to_html(bio, &[], &local_host))
                .unwrap_or_default(),
            avatar: wire.avatar.as_ref().and_then(|a| a.values().next()).map(|e| e.content.clone()),
            header: wire.header.as_ref().and_then(|h| h.values().next()).map(|e| e.content.clone()),
            is_bot: false,
            is_locked: wire.manually_approves_followers.unwrap_or(false),
            is_discoverable: wire.indexable.unwrap_or(false),
            instance_id: None,
            created_at_ms: wire.created_at.as_deref().and_then(rfc3339_to_ms),
        };

        let user = self
            .db
            .run(move |db| -> Result<Option<User>> {
                let conn = db.connect()?;
                let host = reqwest::Url::parse(&origin)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| origin.clone());
                let instance = note_db::upsert_instance(&conn, &origin, &host)?;
                let id = note_db::upsert_user(
                    &conn,
                    &NewUser {
                        instance_id: Some(instance.id),
                        ..new_user
                    },
                )?;
                note_db::get_user(&conn, &id)
            })
            .await?;
        if let Some(u) = &user {
            info!(uri = %uri, user_id = %u.id, acct = %u.acct(), "remote user stored");
        }
        Ok(user)
    }
}

#[async_trait]
impl IdentityResolver for StoreIdentityResolver {
    async fn resolve(&self, uri_or_id: &str) -> Result<Option<User>> {
        let key = uri_or_id.trim().to_string();
        if key.is_empty() {
            return Ok(None);
        }

        if !key.contains("://") {
            return self.db.run(move |db| db.get_user(&key)).await;
        }

        if self.cfg.is_local_uri(&key) {
            let Some(id) = local_user_id(&self.cfg, &key) else {
                debug!(uri = %key, "local user uri without id");
                return Ok(None);
            };
            return self.db.run(move |db| db.get_user(&id)).await;
        }

        let lookup = key.clone();
        if let Some(user) = self.db.run(move |db| db.find_user_by_uri(&lookup)).await? {
            return Ok(Some(user));
        }
        if self.is_recent_miss(&key).await {
            return Ok(None);
        }
        self.fetch_remote(&key).await
    }
}

/// Id out of `{base}/users/{id}`.
pub fn local_user_id(cfg: &ServerConfig, uri: &str) -> Option<String> {
    let rest = cfg.local_path(uri)?.strip_prefix("/users/")?;
    let id = rest.split(['/', '?', '#']).next().unwrap_or_default();
    (!id.is_empty()).then(|| id.to_string())
}

/// `scheme://host[:port]` of an absolute URL.
pub fn origin_of(uri: &str) -> Option<String> {
    let url = reqwest::Url::parse(uri).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(p) => format!("{}://{host}:{p}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_fetch::FetchedObject;

    #[test]
    fn local_user_ids_parse_from_uris() {
        let cfg = ServerConfig::for_base_url("https://local.example");
        assert_eq!(local_user_id(&cfg, "https://local.example/users/abc").as_deref(), Some("abc"));
        assert_eq!(local_user_id(&cfg, "https://local.example/users/abc/outbox").as_deref(), Some("abc"));
        assert_eq!(local_user_id(&cfg, "https://local.example/users/"), None);
        assert_eq!(local_user_id(&cfg, "https://local.example/objects/abc"), None);
    }

    struct Unreachable;

    #[async_trait]
    impl RemoteFetcher for Unreachable {
        async fn fetch(&self, _uri: &str) -> Result<FetchedObject> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn expired_misses_are_dropped_when_new_ones_land() {
        let dir = tempfile::tempdir().unwrap();
        let db = NoteDb::open(dir.path().join("users.db")).unwrap();
        let cfg = Arc::new(ServerConfig::for_base_url("https://local.example"));
        let resolver = StoreIdentityResolver::new(db, cfg, Arc::new(Unreachable));
        resolver
            .misses
            .write()
            .await
            .insert("https://gone.example/users/1".to_string(), std::time::Instant::now());

        assert!(resolver.resolve("https://down.example/users/2").await.unwrap().is_none());
        let misses = resolver.misses.read().await;
        assert!(!misses.contains_key("https://gone.example/users/1"));
        assert!(misses.contains_key("https://down.example/users/2"));
    }

    #[test]
    fn origins_keep_ports() {
        assert_eq!(origin_of("http://r.example:8080/users/1").as_deref(), Some("http://r.example:8080"));
        assert_eq!(origin_of("https://r.example/users/1").as_deref(), Some("https://r.example"));
        assert_eq!(origin_of("not a url"), None);
    }
}
