/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::{server, TestServer};
use lysand_core::note_db;
use lysand_core::{Note, NoteDraft, User};
use lysand_protocol::{content_of, Visibility};

const LOCAL: &str = "https://local.example";

async fn post(s: &TestServer, author: &User, text: &str, reply_to: Option<&Note>, visibility: Visibility) -> Note {
    let mut draft = NoteDraft::new(author.clone(), content_of("text/plain", text));
    draft.reply_id = reply_to.map(|n| n.id.clone());
    draft.visibility = visibility;
    s.engine.from_data(draft).await.unwrap()
}

#[tokio::test]
async fn ancestors_are_listed_root_first() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let a = post(&s, &alice, "a", None, Visibility::Public).await;
    let b = post(&s, &alice, "b", Some(&a), Visibility::Public).await;
    let c = post(&s, &alice, "c", Some(&b), Visibility::Public).await;

    let ids: Vec<String> = s
        .engine
        .ancestors(&c, None)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);
    assert!(s.engine.ancestors(&a, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn descendants_stop_expanding_past_depth_twenty() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let root = post(&s, &alice, "root", None, Visibility::Public).await;
    let mut parent = root.clone();
    for i in 0..25 {
        parent = post(&s, &alice, &format!("reply {i}"), Some(&parent), Visibility::Public).await;
    }

    let descendants = s.engine.descendants(&root, None).await.unwrap();
    assert_eq!(descendants.len(), 21);
    assert_eq!(descendants[0].reply_id.as_deref(), Some(root.id.as_str()));
    for pair in descendants.windows(2) {
        assert_eq!(pair[1].reply_id.as_deref(), Some(pair[0].id.as_str()));
    }
}

#[tokio::test]
async fn descendants_are_pre_order() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let root = post(&s, &alice, "root", None, Visibility::Public).await;
    let x = post(&s, &alice, "x", Some(&root), Visibility::Public).await;
    let x1 = post(&s, &alice, "x1", Some(&x), Visibility::Public).await;
    let y = post(&s, &alice, "y", Some(&root), Visibility::Public).await;

    let ids: Vec<String> = s
        .engine
        .descendants(&root, None)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(ids.len(), 3);
    let pos = |id: &str| ids.iter().position(|i| i == id).unwrap();
    assert_eq!(pos(&x1.id), pos(&x.id) + 1);
    assert!(ids.contains(&y.id));
}

#[tokio::test]
async fn private_notes_need_a_follow() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let bob = s.local_user("bob");
    let note = post(&s, &alice, "followers only", None, Visibility::Private).await;

    assert!(s.engine.is_viewable_by_user(&note, Some(&alice)).await.unwrap());
    assert!(!s.engine.is_viewable_by_user(&note, None).await.unwrap());
    assert!(!s.engine.is_viewable_by_user(&note, Some(&bob)).await.unwrap());

    let conn = s.db.connect().unwrap();
    note_db::set_relationship(&conn, &bob.id, &alice.id, true, false).unwrap();
    assert!(s.engine.is_viewable_by_user(&note, Some(&bob)).await.unwrap());
}

#[tokio::test]
async fn direct_notes_need_a_mention() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let bob = s.local_user("bob");
    let carol = s.local_user("carol");
    let mut draft = NoteDraft::new(alice.clone(), content_of("text/plain", "psst @carol"));
    draft.visibility = Visibility::Direct;
    draft.mentions = vec![carol.clone()];
    let note = s.engine.from_data(draft).await.unwrap();

    assert!(s.engine.is_viewable_by_user(&note, Some(&carol)).await.unwrap());
    assert!(!s.engine.is_viewable_by_user(&note, Some(&bob)).await.unwrap());
    assert!(!s.engine.is_viewable_by_user(&note, None).await.unwrap());
}

#[tokio::test]
async fn thread_filtering_is_per_note() {
    let s = server(LOCAL);
    let alice = s.local_user("alice");
    let root = post(&s, &alice, "root", None, Visibility::Public).await;
    let hidden = post(&s, &alice, "hidden", Some(&root), Visibility::Private).await;
    let open = post(&s, &alice, "open", Some(&hidden), Visibility::Public).await;

    let seen: Vec<String> = s
        .engine
        .descendants(&root, None)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(seen, vec![open.id.clone()]);

    let above: Vec<String> = s
        .engine
        .ancestors(&open, None)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(above, vec![root.id.clone()]);

    let as_author = s.engine.descendants(&root, Some(&alice)).await.unwrap();
    assert_eq!(as_author.len(), 2);
}
