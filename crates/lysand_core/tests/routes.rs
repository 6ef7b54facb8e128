/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use axum::body::Body;
use common::{note_json, server, REMOTE};
use http::{Request, StatusCode};
use lysand_core::routes::router;
use lysand_core::note_db;
use lysand_core::NoteDraft;
use lysand_protocol::{content_of, Visibility};
use serde_json::{json, Value};
use tower::ServiceExt;

const LOCAL: &str = "https://local.example";

async fn send(app: axum::Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let s = server(LOCAL);
    let (status, body) = send(router(s.engine.clone()), get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn status_rewrites_media_and_local_mentions() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let bob = s.local_user("bob");
    let mut draft = NoteDraft::new(
        alice,
        content_of(
            "text/html",
            r#"<p>hi @bob <img src="https://cdn.example/a.png"></p>"#,
        ),
    );
    draft.mentions = vec![bob];
    let note = s.engine.from_data(draft).await.unwrap();
    assert!(note.content.contains("@bob@local.example"));

    let (status, body) = send(router(s.engine.clone()), get(&format!("/api/v1/statuses/{}", note.id))).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_slice(&body).unwrap();
    let content = v["content"].as_str().unwrap();
    assert!(content.contains(&s.cfg.proxy_url("https://cdn.example/a.png")));
    assert!(!content.contains("@bob@local.example"));
    assert!(content.contains(">@bob</a>"));
    assert_eq!(v["id"], json!(note.id));
    assert_eq!(v["account"]["acct"], json!("alice"));
    assert_eq!(v["uri"], json!(s.cfg.local_object_uri(&note.id)));
    assert_eq!(v["url"], json!(format!("{LOCAL}/@alice/{}", note.id)));
    assert_eq!(v["visibility"], json!("public"));
    assert_eq!(v["quote"], Value::Null);
    assert_eq!(v["mentions"][0]["acct"], json!("bob"));
}

#[tokio::test]
async fn quotes_are_serialized_inline() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let quoted = s
        .engine
        .from_data(NoteDraft::new(alice.clone(), content_of("text/plain", "original")))
        .await
        .unwrap();
    let mut draft = NoteDraft::new(alice, content_of("text/plain", "look at this"));
    draft.quote_id = Some(quoted.id.clone());
    let quoting = s.engine.from_data(draft).await.unwrap();

    let status = s.engine.to_api(&quoting, None).await.unwrap();
    assert_eq!(status.quote_id.as_deref(), Some(quoted.id.as_str()));
    assert_eq!(status.quote.as_ref().map(|q| q.id.as_str()), Some(quoted.id.as_str()));

    let wire = s.engine.to_lysand(&quoting).await.unwrap();
    assert_eq!(wire.quotes, Some(s.cfg.local_object_uri(&quoted.id)));
}

#[tokio::test]
async fn hidden_or_missing_statuses_are_404() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let mut draft = NoteDraft::new(alice, content_of("text/plain", "secret"));
    draft.visibility = Visibility::Direct;
    let note = s.engine.from_data(draft).await.unwrap();

    let app = router(s.engine.clone());
    let (status, _) = send(app.clone(), get(&format!("/api/v1/statuses/{}", note.id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = send(app, get("/api/v1/statuses/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert!(v["error"].is_string());
}

#[tokio::test]
async fn objects_serve_local_notes_in_wire_form() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let note = s
        .engine
        .from_data(NoteDraft::new(alice.clone(), content_of("text/plain", "wire me")))
        .await
        .unwrap();

    let (status, body) = send(router(s.engine.clone()), get(&format!("/objects/{}", note.id))).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["type"], json!("Note"));
    assert_eq!(v["uri"], json!(s.cfg.local_object_uri(&note.id)));
    assert_eq!(v["author"], json!(s.cfg.local_user_uri(&alice.id)));
    assert_eq!(v["content"]["text/plain"]["content"], json!("wire me"));
    assert_eq!(v["visibility"], json!("public"));
}

#[tokio::test]
async fn inbox_stores_delivered_notes() {
    let s = server(LOCAL);
    let author = s.serve_remote_user("bob", "bob");
    let uri = format!("{REMOTE}/objects/delivered");
    let app = router(s.engine.clone());

    let (status, body) = send(app.clone(), post_json("/inbox", &note_json(&uri, &author, "incoming"))).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["uri"], json!(uri));
    assert_eq!(v["account"]["acct"], json!("bob@remote.example"));
    assert!(s.engine.find_by_uri(&uri).await.unwrap().is_some());

    // remote notes are not served as local objects
    let id = v["id"].as_str().unwrap().to_string();
    let (status, _) = send(app.clone(), get(&format!("/objects/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(app.clone(), post_json("/inbox", &json!({"type": "Like", "id": "x"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let bad = Request::builder()
        .method("POST")
        .uri("/inbox")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(app, bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn context_lists_both_directions() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let root = s
        .engine
        .from_data(NoteDraft::new(alice.clone(), content_of("text/plain", "root")))
        .await
        .unwrap();
    let mut mid = NoteDraft::new(alice.clone(), content_of("text/plain", "mid"));
    mid.reply_id = Some(root.id.clone());
    let mid = s.engine.from_data(mid).await.unwrap();
    let mut leaf = NoteDraft::new(alice, content_of("text/plain", "leaf"));
    leaf.reply_id = Some(mid.id.clone());
    let leaf = s.engine.from_data(leaf).await.unwrap();

    let (status, body) = send(
        router(s.engine.clone()),
        get(&format!("/api/v1/statuses/{}/context", mid.id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["ancestors"][0]["id"], json!(root.id));
    assert_eq!(v["descendants"][0]["id"], json!(leaf.id));
    assert_eq!(v["descendants"][0]["in_reply_to_id"], json!(mid.id));
    assert_eq!(v["descendants"][0]["in_reply_to_account_id"], json!(mid.author.id));
}

#[tokio::test]
async fn status_reports_likes_pins_and_application() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let bob = s.local_user("bob");
    let app = {
        let conn = s.db.connect().unwrap();
        note_db::insert_application(&conn, "Pinafore", Some("https://pinafore.example")).unwrap()
    };
    let mut draft = NoteDraft::new(alice.clone(), content_of("text/plain", "pin me"));
    draft.application = Some(app);
    let note = s.engine.from_data(draft).await.unwrap();
    {
        let conn = s.db.connect().unwrap();
        note_db::insert_like(&conn, &bob.id, &note.id).unwrap();
        note_db::insert_like(&conn, &bob.id, &note.id).unwrap();
        note_db::pin_note(&conn, &alice.id, &note.id).unwrap();
    }

    let seen_by_bob = s.engine.from_id(&note.id, Some(&bob.id)).await.unwrap().unwrap();
    let status = s.engine.to_api(&seen_by_bob, Some(&bob)).await.unwrap();
    assert!(status.favourited);
    assert_eq!(status.favourites_count, 1);
    assert!(status.pinned);
    let application = status.application.as_ref().unwrap();
    assert_eq!(application.name, "Pinafore");
    assert_eq!(application.website.as_deref(), Some("https://pinafore.example"));

    let (status, body) = send(router(s.engine.clone()), get(&format!("/api/v1/statuses/{}", note.id))).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["favourited"], json!(false));
    assert_eq!(v["favourites_count"], json!(1));
    assert_eq!(v["pinned"], json!(true));
    assert_eq!(v["application"]["name"], json!("Pinafore"));
}
