/*
 * store_concurrency.rs
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

//! Concurrent-delivery UID allocation (§5): N deliveries racing against one
//! INBOX must never hand out the same UID twice.

use mailcore::store::{FolderRepo, MessageFilter, MessageRepo, Role, SortKey, Store, SystemFolderType, UserRepo};
use mailcore::user_directory::CreateUserRequest;
use mailcore::{DeliveryEngine, UserDirectory};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::NamedTempFile;

const CONCURRENT_DELIVERIES: usize = 16;

#[tokio::test]
async fn concurrent_deliveries_yield_distinct_uids() {
    let file = NamedTempFile::new().expect("tempfile");
    let url = format!("sqlite://{}", file.path().display());
    let store = Arc::new(Store::connect(&url).await.expect("store connects and migrates"));

    {
        let mut conn = store.pool().acquire().await.expect("acquire");
        UserRepo::create_domain(&mut conn, "local.test").await.expect("create domain");
    }
    let directory = UserDirectory::new(store.clone());
    let erin = directory
        .create_user(CreateUserRequest {
            username: "erin",
            domain_name: "local.test",
            password: "supersecret1",
            full_name: None,
            role: Role::User,
        })
        .await
        .expect("create user");

    let mut handles = Vec::with_capacity(CONCURRENT_DELIVERIES);
    for i in 0..CONCURRENT_DELIVERIES {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let delivery = DeliveryEngine::new(store);
            let raw = format!("From: sender@external.test\r\nTo: erin@local.test\r\nSubject: Msg {i}\r\n\r\nBody {i}.\r\n");
            delivery
                .deliver("sender@external.test", &["erin@local.test".to_string()], raw.as_bytes())
                .await
                .expect("deliver")
        }));
    }
    for handle in handles {
        let report = handle.await.expect("task join");
        assert!(report.any_succeeded());
    }

    let mut conn = store.pool().acquire().await.unwrap();
    let inbox = FolderRepo::find_system(&mut conn, erin.id, SystemFolderType::Inbox).await.unwrap().unwrap();
    assert_eq!(inbox.exists, CONCURRENT_DELIVERIES as i64);

    let rows = MessageRepo::list_in_folder(
        &mut conn,
        inbox.id,
        erin.id,
        &MessageFilter::default(),
        SortKey::UidAsc,
        CONCURRENT_DELIVERIES as i64 + 10,
        0,
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), CONCURRENT_DELIVERIES);

    let uids: HashSet<i64> = rows.iter().map(|r| r.placement.uid).collect();
    assert_eq!(uids.len(), CONCURRENT_DELIVERIES, "every concurrent delivery must get a distinct UID");
    let expected: HashSet<i64> = (1..=CONCURRENT_DELIVERIES as i64).collect();
    assert_eq!(uids, expected, "UIDs must be exactly 1..=N with no gaps or duplicates");
}
