/*
 * protocol_integration.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of mailcore, a self-hosted multi-tenant mail server.
 *
 * mailcore is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * mailcore is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with mailcore.  If not, see <http://www.gnu.org/licenses/>.
 */

//! End-to-end coverage across the protocol sessions against a real (tempfile)
//! SQLite store: SMTP reception visible over IMAP, POP3's deferred-delete
//! semantics, IMAP APPEND round-tripping, and the account lockout window.

use chrono::Utc;
use mailcore::auth::LockoutPolicy;
use mailcore::message_service::{FlagQuery, ListFilter, SortBy, SortOrder};
use mailcore::protocol::imap::ImapSession;
use mailcore::protocol::pop3::Pop3Session;
use mailcore::protocol::smtp::SmtpSession;
use mailcore::store::{FolderRepo, Id, MessageFilter, MessageRepo, Role, SortKey, Store, SystemFolderType, UserRepo};
use mailcore::user_directory::CreateUserRequest;
use mailcore::{AuthError, Authenticator, Clock, DeliveryEngine, FixedClock, FolderManager, MessageService, UserDirectory};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

async fn test_store() -> (Arc<Store>, NamedTempFile) {
    let file = NamedTempFile::new().expect("tempfile");
    let url = format!("sqlite://{}", file.path().display());
    let store = Store::connect(&url).await.expect("store connects and migrates");
    (Arc::new(store), file)
}

struct TestUser {
    id: Id,
    email: String,
}

async fn create_user(store: &Arc<Store>, domain: &str, username: &str, password: &str) -> TestUser {
    {
        let mut conn = store.pool().acquire().await.expect("acquire");
        if UserRepo::find_domain_by_name(&mut conn, domain).await.expect("lookup domain").is_none() {
            UserRepo::create_domain(&mut conn, domain).await.expect("create domain");
        }
    }
    let directory = UserDirectory::new(store.clone());
    let user = directory
        .create_user(CreateUserRequest { username, domain_name: domain, password, full_name: None, role: Role::User })
        .await
        .expect("create user");
    TestUser { id: user.id, email: format!("{username}@{domain}") }
}

async fn deliver_test_message(store: &Arc<Store>, to: &str, subject: &str) {
    let delivery = DeliveryEngine::new(store.clone());
    let raw = format!("From: sender@external.test\r\nTo: {to}\r\nSubject: {subject}\r\n\r\nBody text.\r\n");
    let report = delivery.deliver("sender@external.test", &[to.to_string()], raw.as_bytes()).await.expect("deliver");
    assert!(report.any_succeeded());
}

async fn read_line_trimmed<R: AsyncBufReadExt + Unpin>(r: &mut R) -> String {
    let mut line = String::new();
    r.read_line(&mut line).await.expect("read line");
    line.trim_end_matches(['\r', '\n']).to_string()
}

/// Reads lines until one begins with `"{tag} "`, returning all of them
/// (untagged responses included, the tagged completion line last).
async fn read_until_tagged<R: AsyncBufReadExt + Unpin>(r: &mut R, tag: &str) -> Vec<String> {
    let prefix = format!("{tag} ");
    let mut lines = Vec::new();
    loop {
        let line = read_line_trimmed(r).await;
        let done = line.starts_with(&prefix);
        lines.push(line);
        if done {
            break;
        }
    }
    lines
}

fn test_authenticator(store: &Arc<Store>) -> Arc<Authenticator> {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
    Arc::new(Authenticator::new(store.clone(), clock, LockoutPolicy::default()))
}

#[tokio::test]
async fn smtp_delivery_is_visible_over_imap_select() {
    let (store, _tmp) = test_store().await;
    let alice = create_user(&store, "local.test", "alice", "supersecret1").await;
    let authenticator = test_authenticator(&store);
    let delivery = Arc::new(DeliveryEngine::new(store.clone()));

    let (client, server) = tokio::io::duplex(8192);
    let session = SmtpSession::new("mailcore-test", authenticator.clone(), delivery.clone());
    let smtp_handle = tokio::spawn(async move { session.run(server).await });

    let (cr, mut cw) = tokio::io::split(client);
    let mut r = BufReader::new(cr);
    assert!(read_line_trimmed(&mut r).await.starts_with("220"));

    cw.write_all(b"EHLO client.test\r\n").await.unwrap();
    while read_line_trimmed(&mut r).await.starts_with("250-") {}

    cw.write_all(b"MAIL FROM:<sender@external.test>\r\n").await.unwrap();
    assert_eq!(read_line_trimmed(&mut r).await, "250 OK");
    cw.write_all(format!("RCPT TO:<{}>\r\n", alice.email).as_bytes()).await.unwrap();
    assert_eq!(read_line_trimmed(&mut r).await, "250 OK");
    cw.write_all(b"DATA\r\n").await.unwrap();
    assert!(read_line_trimmed(&mut r).await.starts_with("354"));
    cw.write_all(b"From: sender@external.test\r\nTo: alice@local.test\r\nSubject: Hello\r\n\r\nHi Alice.\r\n.\r\n")
        .await
        .unwrap();
    assert_eq!(read_line_trimmed(&mut r).await, "250 OK");
    cw.write_all(b"QUIT\r\n").await.unwrap();
    assert!(read_line_trimmed(&mut r).await.starts_with("221"));
    smtp_handle.await.unwrap().unwrap();

    // Delivery lands in INBOX stamped with the folder's own uid_validity, not a literal constant.
    let mut conn = store.pool().acquire().await.unwrap();
    let inbox = FolderRepo::find_system(&mut conn, alice.id, SystemFolderType::Inbox).await.unwrap().unwrap();
    assert_eq!(inbox.exists, 1);
    let rows = MessageRepo::list_in_folder(&mut conn, inbox.id, alice.id, &MessageFilter::default(), SortKey::UidAsc, 10, 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].message.uid_validity, inbox.uid_validity);
    drop(conn);

    let folder_manager = Arc::new(FolderManager::new(store.clone()));
    let message_service = Arc::new(MessageService::new(store.clone()));
    let (iclient, iserver) = tokio::io::duplex(8192);
    let imap_session =
        ImapSession::new("mailcore-test", authenticator.clone(), folder_manager.clone(), message_service.clone(), store.clone());
    let imap_handle = tokio::spawn(async move { imap_session.run(iserver).await });
    let (icr, mut icw) = tokio::io::split(iclient);
    let mut ir = BufReader::new(icr);
    assert!(read_line_trimmed(&mut ir).await.starts_with("* OK"));

    icw.write_all(format!("a1 LOGIN \"{}\" \"supersecret1\"\r\n", alice.email).as_bytes()).await.unwrap();
    assert!(read_until_tagged(&mut ir, "a1").await.last().unwrap().starts_with("a1 OK"));

    icw.write_all(b"a2 SELECT INBOX\r\n").await.unwrap();
    let select_lines = read_until_tagged(&mut ir, "a2").await;
    assert!(select_lines.iter().any(|l| l == "* 1 EXISTS"));
    assert!(select_lines.last().unwrap().starts_with("a2 OK"));

    icw.write_all(b"a3 UID FETCH 1:* (UID RFC822.SIZE FLAGS)\r\n").await.unwrap();
    let fetch_lines = read_until_tagged(&mut ir, "a3").await;
    assert!(fetch_lines.iter().any(|l| l.contains("UID 1") && l.contains("RFC822.SIZE")));
    assert!(fetch_lines.last().unwrap().starts_with("a3 OK"));

    icw.write_all(b"a4 LOGOUT\r\n").await.unwrap();
    let _ = read_until_tagged(&mut ir, "a4").await;
    imap_handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn pop3_delete_is_deferred_until_quit() {
    let (store, _tmp) = test_store().await;
    let bob = create_user(&store, "local.test", "bob", "supersecret1").await;
    deliver_test_message(&store, &bob.email, "One").await;

    let authenticator = test_authenticator(&store);
    let message_service = Arc::new(MessageService::new(store.clone()));

    // First connection: DELE, then disconnect without QUIT.
    {
        let (client, server) = tokio::io::duplex(8192);
        let session = Pop3Session::new(authenticator.clone(), message_service.clone(), store.clone());
        let handle = tokio::spawn(async move { session.run(server).await });
        let (cr, mut cw) = tokio::io::split(client);
        let mut r = BufReader::new(cr);
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        cw.write_all(format!("USER {}\r\n", bob.email).as_bytes()).await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        cw.write_all(b"PASS supersecret1\r\n").await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK 1 messages"));
        cw.write_all(b"DELE 1\r\n").await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        drop(cw);
        drop(r);
        handle.await.unwrap().unwrap();
    }

    // Second connection: the message is still there, since the delete was never committed.
    {
        let (client, server) = tokio::io::duplex(8192);
        let session = Pop3Session::new(authenticator.clone(), message_service.clone(), store.clone());
        let handle = tokio::spawn(async move { session.run(server).await });
        let (cr, mut cw) = tokio::io::split(client);
        let mut r = BufReader::new(cr);
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        cw.write_all(format!("USER {}\r\n", bob.email).as_bytes()).await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        cw.write_all(b"PASS supersecret1\r\n").await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK 1 messages"));
        cw.write_all(b"DELE 1\r\n").await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        cw.write_all(b"QUIT\r\n").await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK 1 messages deleted"));
        handle.await.unwrap().unwrap();
    }

    // Third connection: the deleted message has moved to Trash, so INBOX is empty.
    {
        let (client, server) = tokio::io::duplex(8192);
        let session = Pop3Session::new(authenticator.clone(), message_service.clone(), store.clone());
        let handle = tokio::spawn(async move { session.run(server).await });
        let (cr, mut cw) = tokio::io::split(client);
        let mut r = BufReader::new(cr);
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        cw.write_all(format!("USER {}\r\n", bob.email).as_bytes()).await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        cw.write_all(b"PASS supersecret1\r\n").await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK 0 messages"));
        cw.write_all(b"QUIT\r\n").await.unwrap();
        assert!(read_line_trimmed(&mut r).await.starts_with("+OK"));
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn imap_append_round_trips_into_selected_mailbox() {
    let (store, _tmp) = test_store().await;
    let carol = create_user(&store, "local.test", "carol", "supersecret1").await;
    let authenticator = test_authenticator(&store);
    let folder_manager = Arc::new(FolderManager::new(store.clone()));
    let message_service = Arc::new(MessageService::new(store.clone()));

    let (client, server) = tokio::io::duplex(8192);
    let session =
        ImapSession::new("mailcore-test", authenticator.clone(), folder_manager.clone(), message_service.clone(), store.clone());
    let handle = tokio::spawn(async move { session.run(server).await });
    let (cr, mut cw) = tokio::io::split(client);
    let mut r = BufReader::new(cr);
    assert!(read_line_trimmed(&mut r).await.starts_with("* OK"));

    cw.write_all(format!("a1 LOGIN \"{}\" \"supersecret1\"\r\n", carol.email).as_bytes()).await.unwrap();
    assert!(read_until_tagged(&mut r, "a1").await.last().unwrap().starts_with("a1 OK"));

    let raw = b"From: carol@local.test\r\nTo: carol@local.test\r\nSubject: Draft note\r\n\r\nAppended body text.\r\n";
    cw.write_all(format!("a2 APPEND INBOX (\\Seen) {{{}}}\r\n", raw.len()).as_bytes()).await.unwrap();
    assert_eq!(read_line_trimmed(&mut r).await, "+ Ready for literal data");
    cw.write_all(raw).await.unwrap();
    cw.write_all(b"\r\n").await.unwrap();
    let append_lines = read_until_tagged(&mut r, "a2").await;
    assert!(append_lines.last().unwrap().contains("APPENDUID"));

    cw.write_all(b"a3 SELECT INBOX\r\n").await.unwrap();
    let select_lines = read_until_tagged(&mut r, "a3").await;
    assert!(select_lines.iter().any(|l| l == "* 1 EXISTS"));

    cw.write_all(b"a4 UID FETCH 1:* (UID FLAGS BODY.PEEK[])\r\n").await.unwrap();
    let fetch_lines = read_until_tagged(&mut r, "a4").await;
    let joined = fetch_lines.join("\n");
    assert!(joined.contains("Appended body text."));
    assert!(joined.contains("\\Seen"));

    cw.write_all(b"a5 LOGOUT\r\n").await.unwrap();
    let _ = read_until_tagged(&mut r, "a5").await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn message_list_applies_sort_flag_filter_and_next_url() {
    let (store, _tmp) = test_store().await;
    let erin = create_user(&store, "local.test", "erin", "supersecret1").await;
    deliver_test_message(&store, &erin.email, "Alpha").await;
    deliver_test_message(&store, &erin.email, "Beta").await;
    deliver_test_message(&store, &erin.email, "Gamma").await;

    let message_service = MessageService::new(store.clone());
    let mut conn = store.pool().acquire().await.unwrap();
    let inbox = FolderRepo::find_system(&mut conn, erin.id, SystemFolderType::Inbox).await.unwrap().unwrap();
    drop(conn);

    // Subject-ascending sort, first page of 2: Alpha, Beta, with a next_url
    // since a third row (Gamma) remains.
    let page = message_service
        .list(erin.id, inbox.id, &ListFilter::default(), 0, 2, SortBy::Subject, SortOrder::Asc)
        .await
        .expect("list page 1");
    assert_eq!(page.total_count, 3);
    let subjects: Vec<_> = page.items.iter().map(|v| v.message.subject.clone().unwrap()).collect();
    assert_eq!(subjects, vec!["Alpha", "Beta"]);
    assert!(page.next_url.is_some());
    assert!(page.next_url.unwrap().contains("skip=2"));

    // Second page picks up the remainder, with no next_url left.
    let page2 = message_service
        .list(erin.id, inbox.id, &ListFilter::default(), 2, 2, SortBy::Subject, SortOrder::Asc)
        .await
        .expect("list page 2");
    assert_eq!(page2.items.len(), 1);
    assert_eq!(page2.items[0].message.subject.as_deref(), Some("Gamma"));
    assert!(page2.next_url.is_none());

    // Mark Beta \Answered, then filter on it.
    let beta_id = page.items[1].message.id;
    message_service
        .update_flags(erin.id, beta_id, &mailcore::message_service::FlagPatch { answered: Some(true), ..Default::default() })
        .await
        .expect("mark answered");
    let answered_filter = ListFilter { flags: Some(FlagQuery::Answered), ..Default::default() };
    let answered_page = message_service
        .list(erin.id, inbox.id, &answered_filter, 0, 10, SortBy::Date, SortOrder::Desc)
        .await
        .expect("list answered");
    assert_eq!(answered_page.items.len(), 1);
    assert_eq!(answered_page.items[0].message.subject.as_deref(), Some("Beta"));
    assert!(answered_page.applied_filters.contains(&("flags", "answered".to_string())));
    assert!(answered_page.next_url.is_none());
}

#[tokio::test]
async fn account_locks_after_max_failures_and_unlocks_after_duration() {
    let (store, _tmp) = test_store().await;
    let dave = create_user(&store, "local.test", "dave", "supersecret1").await;

    let clock = Arc::new(FixedClock::new(Utc::now()));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let policy = LockoutPolicy::default();
    let authenticator = Authenticator::new(store.clone(), dyn_clock, policy);

    for _ in 0..policy.max_failed_attempts {
        let result = authenticator.authenticate(&dave.email, "wrong-password").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    let locked = authenticator.authenticate(&dave.email, "supersecret1").await;
    assert!(matches!(locked, Err(AuthError::AccountLocked)));

    clock.advance(chrono::Duration::minutes(16));
    let unlocked = authenticator.authenticate(&dave.email, "supersecret1").await;
    assert!(unlocked.is_ok());
}
