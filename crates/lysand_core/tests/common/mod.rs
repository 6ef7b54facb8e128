/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use lysand_core::note_db::{self, NewUser};
use lysand_core::object_fetch::{FetchedObject, RemoteFetcher};
use lysand_core::users::{IdentityResolver, StoreIdentityResolver};
use lysand_core::{NoteDb, NoteEngine, ServerConfig, User};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const REMOTE: &str = "https://remote.example";

/// Serves canned JSON per URI and counts every GET.
#[derive(Default)]
pub struct FakeFetcher {
    objects: Mutex<HashMap<String, Value>>,
    fetches: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, uri: &str, body: Value) {
        self.objects.lock().unwrap().insert(uri.to_string(), body);
    }

    pub fn count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteFetcher for FakeFetcher {
    async fn fetch(&self, uri: &str) -> Result<FetchedObject> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.objects.lock().unwrap().get(uri) {
            Some(body) => Ok(FetchedObject {
                status: 200,
                body: body.clone(),
            }),
            None => Ok(FetchedObject {
                status: 404,
                body: Value::Null,
            }),
        }
    }
}

pub struct TestServer {
    _dir: TempDir,
    pub cfg: Arc<ServerConfig>,
    pub db: NoteDb,
    pub fetcher: Arc<FakeFetcher>,
    pub engine: NoteEngine,
}

pub fn server(base_url: &str) -> TestServer {
    server_with(ServerConfig::for_base_url(base_url), FakeFetcher::new())
}

pub fn server_with(cfg: ServerConfig, fetcher: Arc<FakeFetcher>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let db = NoteDb::open(dir.path().join("lysand.db")).unwrap();
    let cfg = Arc::new(cfg);
    let remote: Arc<dyn RemoteFetcher> = fetcher.clone();
    let identities: Arc<dyn IdentityResolver> =
        Arc::new(StoreIdentityResolver::new(db.clone(), cfg.clone(), remote.clone()));
    let engine = NoteEngine::new(db.clone(), cfg.clone(), remote, identities);
    TestServer {
        _dir: dir,
        cfg,
        db,
        fetcher,
        engine,
    }
}

impl TestServer {
    pub fn local_user(&self, username: &str) -> User {
        let conn = self.db.connect().unwrap();
        let id = note_db::upsert_user(
            &conn,
            &NewUser {
                username: username.to_string(),
                display_name: username.to_string(),
                ..NewUser::default()
            },
        )
        .unwrap();
        note_db::get_user(&conn, &id).unwrap().unwrap()
    }

    /// Registers a remote user with the fake fetcher and returns its URI.
    pub fn serve_remote_user(&self, id: &str, username: &str) -> String {
        let uri = format!("{REMOTE}/users/{id}");
        self.fetcher.put(&uri, user_json(&uri, id, username));
        uri
    }

    pub async fn remote_user(&self, id: &str, username: &str) -> User {
        let uri = self.serve_remote_user(id, username);
        self.engine.identities().resolve(&uri).await.unwrap().unwrap()
    }
}

pub fn user_json(uri: &str, id: &str, username: &str) -> Value {
    json!({
        "type": "User",
        "id": id,
        "uri": uri,
        "username": username,
        "display_name": username.to_uppercase(),
        "created_at": "2024-01-02T03:04:05Z",
    })
}

pub fn note_json(uri: &str, author: &str, text: &str) -> Value {
    json!({
        "type": "Note",
        "id": uri.rsplit('/').next().unwrap_or("x"),
        "uri": uri,
        "author": author,
        "created_at": "2024-01-02T03:04:05Z",
        "content": { "text/plain": { "content": text } },
        "visibility": "public",
    })
}
