/*
 * message_service.rs
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

//! MessageService: list/get/create/update/delete over a user's mailbox (§4.F).

use crate::message_id::generate_header_message_id;
use crate::store::{
    FolderRepo, Id, MessageFilter as StoreFilter, MessageRepo, MessageView, NewMessage, SortKey, Store, StoreError,
    SystemFolderType, STANDARD_FLAGS,
};
use chrono::Utc;
use thiserror::Error;
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message not found")]
    NotFound,
    #[error("the message is not a draft")]
    NotDraft,
    #[error("user has no Trash folder")]
    NoTrash,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagQuery {
    Read,
    Unread,
    Seen,
    Unseen,
    Flagged,
    Answered,
    Draft,
    Deleted,
}

/// The folder itself is always the separate, mandatory `folder_id` argument
/// to `list()` (every caller already has it resolved), so unlike the other
/// fields here it is not repeated inside the filter.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub q: Option<String>,
    pub flags: Option<FlagQuery>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub since: Option<chrono::DateTime<Utc>>,
    pub before: Option<chrono::DateTime<Utc>>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
}

impl ListFilter {
    /// Query-string fragments for every filter actually set, in a fixed
    /// order, for `ListPage::next_url` and `applied_filters` (§4.F).
    fn applied(&self) -> Vec<(&'static str, String)> {
        let mut applied = Vec::new();
        if let Some(q) = &self.q {
            applied.push(("q", q.clone()));
        }
        if let Some(flags) = self.flags {
            applied.push(("flags", flags.as_str().to_string()));
        }
        if let Some(from) = &self.from {
            applied.push(("from", from.clone()));
        }
        if let Some(to) = &self.to {
            applied.push(("to", to.clone()));
        }
        if let Some(since) = self.since {
            applied.push(("since", since.to_rfc3339()));
        }
        if let Some(before) = self.before {
            applied.push(("before", before.to_rfc3339()));
        }
        if let Some(min_size) = self.min_size {
            applied.push(("minSize", min_size.to_string()));
        }
        if let Some(max_size) = self.max_size {
            applied.push(("maxSize", max_size.to_string()));
        }
        applied
    }
}

impl FlagQuery {
    fn as_str(self) -> &'static str {
        match self {
            FlagQuery::Read => "read",
            FlagQuery::Unread => "unread",
            FlagQuery::Seen => "seen",
            FlagQuery::Unseen => "unseen",
            FlagQuery::Flagged => "flagged",
            FlagQuery::Answered => "answered",
            FlagQuery::Draft => "draft",
            FlagQuery::Deleted => "deleted",
        }
    }
}

/// Percent-encodes a query-parameter value. No HTTP surface is wired up yet
/// (the admin API is out of scope), so this only needs to be correct, not fast.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Date,
    Subject,
    Sender,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

pub struct ListPage {
    pub items: Vec<MessageView>,
    pub skip: i64,
    pub take: i64,
    pub total_count: i64,
    /// Present iff `skip + take < total_count`; round-trips every non-default
    /// filter from the request that produced this page (§4.F).
    pub next_url: Option<String>,
    pub applied_filters: Vec<(&'static str, String)>,
}

pub struct CreateMessageRequest<'a> {
    pub from_addr: &'a str,
    pub to_addr: &'a str,
    pub cc: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub in_reply_to: Option<&'a str>,
    pub references: Option<&'a str>,
    pub body: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct FlagPatch {
    pub seen: Option<bool>,
    pub answered: Option<bool>,
    pub flagged: Option<bool>,
    pub deleted: Option<bool>,
    pub draft: Option<bool>,
    /// Replaces the entire custom-flag set when present (unset flags are
    /// turned off, not deleted — §4.F).
    pub custom_flags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentPatch {
    pub subject: Option<String>,
    pub body: Option<String>,
    pub body_html: Option<String>,
}

pub struct MessageService {
    store: Arc<Store>,
}

impl MessageService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// §4.F list: `take` clamped to 100, substring/flag/size/date filters
    /// applied, default sort `date desc`.
    pub async fn list(
        &self,
        user_id: Id,
        folder_id: Id,
        filter: &ListFilter,
        skip: i64,
        take: i64,
        sort_by: SortBy,
        sort_order: SortOrder,
    ) -> Result<ListPage, MessageError> {
        let take = take.clamp(0, 100);
        let sort_key = match (sort_by, sort_order) {
            (SortBy::Date, SortOrder::Asc) => SortKey::DateAsc,
            (SortBy::Date, SortOrder::Desc) => SortKey::DateDesc,
            (SortBy::Subject, SortOrder::Asc) => SortKey::SubjectAsc,
            (SortBy::Subject, SortOrder::Desc) => SortKey::SubjectDesc,
            (SortBy::Sender, SortOrder::Asc) => SortKey::SenderAsc,
            (SortBy::Sender, SortOrder::Desc) => SortKey::SenderDesc,
            (SortBy::Size, SortOrder::Asc) => SortKey::SizeAsc,
            (SortBy::Size, SortOrder::Desc) => SortKey::SizeDesc,
        };
        let store_filter = StoreFilter {
            q: filter.q.clone(),
            seen: match filter.flags {
                Some(FlagQuery::Seen) | Some(FlagQuery::Read) => Some(true),
                Some(FlagQuery::Unseen) | Some(FlagQuery::Unread) => Some(false),
                _ => None,
            },
            flagged: match filter.flags {
                Some(FlagQuery::Flagged) => Some(true),
                _ => None,
            },
            answered: match filter.flags {
                Some(FlagQuery::Answered) => Some(true),
                _ => None,
            },
            draft: match filter.flags {
                Some(FlagQuery::Draft) => Some(true),
                _ => None,
            },
            deleted: match filter.flags {
                Some(FlagQuery::Deleted) => Some(true),
                _ => None,
            },
            from_contains: filter.from.clone(),
            to_contains: filter.to.clone(),
            since: filter.since,
            before: filter.before,
            min_size: filter.min_size,
            max_size: filter.max_size,
        };
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        let items = MessageRepo::list_in_folder(&mut conn, folder_id, user_id, &store_filter, sort_key, take, skip).await?;
        let total_count = MessageRepo::count_in_folder(&mut conn, folder_id, user_id, &store_filter).await?;

        let applied_filters = filter.applied();
        let next_url = (skip + take < total_count).then(|| {
            let mut params: Vec<(&str, String)> = vec![
                ("skip", (skip + take).to_string()),
                ("take", take.to_string()),
            ];
            params.extend(applied_filters.iter().cloned());
            let query = params
                .into_iter()
                .map(|(k, v)| format!("{k}={}", percent_encode(&v)))
                .collect::<Vec<_>>()
                .join("&");
            format!("/messages?{query}")
        });
        Ok(ListPage { items, skip, take, total_count, next_url, applied_filters })
    }

    pub async fn get(&self, user_id: Id, folder_id: Id, uid: i64) -> Result<MessageView, MessageError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        let Some(placement) = MessageRepo::find_placement_by_uid(&mut conn, folder_id, uid).await? else {
            return Err(MessageError::NotFound);
        };
        if placement.user_id != user_id {
            return Err(MessageError::NotFound);
        }
        Ok(MessageRepo::view_by_placement(&mut conn, placement).await?)
    }

    /// §4.F create: composes a Sent-folder message from request fields,
    /// marking it `\Seen` since the sender's own outbox reads as read.
    pub async fn create(&self, user_id: Id, from_domain: &str, request: CreateMessageRequest<'_>) -> Result<MessageView, MessageError> {
        let from_addr = request.from_addr.to_string();
        let to_addr = request.to_addr.to_string();
        let cc = request.cc.map(|s| s.to_string());
        let subject = request.subject.map(|s| s.to_string());
        let in_reply_to = request.in_reply_to.map(|s| s.to_string());
        let references = request.references.map(|s| s.to_string());
        let body = request.body.to_string();
        let from_domain = from_domain.to_string();

        self.store
            .with_tx(move |tx| {
                let from_addr = from_addr.clone();
                let to_addr = to_addr.clone();
                let cc = cc.clone();
                let subject = subject.clone();
                let in_reply_to = in_reply_to.clone();
                let references = references.clone();
                let body = body.clone();
                let from_domain = from_domain.clone();
                Box::pin(async move {
                    let Some(sent) = FolderRepo::find_system(tx, user_id, SystemFolderType::Sent).await? else {
                        return Err(StoreError::Internal("user has no Sent folder".into()));
                    };
                    let uid = FolderRepo::allocate_uid(tx, sent.id).await?;
                    let now = Utc::now();
                    let header_message_id = generate_header_message_id(&from_domain);
                    let mut headers = format!(
                        "Message-ID: {header_message_id}\r\nDate: {date}\r\nFrom: {from_addr}\r\nTo: {to_addr}\r\n",
                        date = now.to_rfc2822(),
                    );
                    if let Some(subject) = &subject {
                        headers.push_str(&format!("Subject: {subject}\r\n"));
                    }
                    if let Some(cc) = &cc {
                        headers.push_str(&format!("Cc: {cc}\r\n"));
                    }
                    if let Some(irt) = &in_reply_to {
                        headers.push_str(&format!("In-Reply-To: {irt}\r\n"));
                    }
                    if let Some(refs) = &references {
                        headers.push_str(&format!("References: {refs}\r\n"));
                    }
                    headers.push_str("MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Transfer-Encoding: 8bit\r\n");

                    let new_message = NewMessage {
                        header_message_id: &header_message_id,
                        from_addr: &from_addr,
                        to_addr: Some(&to_addr),
                        cc: cc.as_deref(),
                        bcc: None,
                        subject: subject.as_deref(),
                        headers: &headers,
                        body: Some(&body),
                        body_html: None,
                        message_size: (headers.len() + body.len()) as i64,
                        sent_date: Some(now),
                        in_reply_to: in_reply_to.as_deref(),
                        references: references.as_deref(),
                        body_structure: serde_json::json!({"type": "text/plain"}),
                        envelope: serde_json::json!({"from": from_addr, "to": to_addr}),
                    };
                    let message = MessageRepo::insert(tx, new_message, uid, sent.uid_validity).await?;
                    let placement = MessageRepo::place(tx, message.id, user_id, sent.id, uid).await?;
                    MessageRepo::set_flag(tx, message.id, user_id, "\\Seen", true).await?;
                    FolderRepo::adjust_counters(tx, sent.id, 1, 0, 0).await?;
                    let view = MessageRepo::view_by_placement(tx, placement).await?;
                    Ok(view)
                })
            })
            .await
            .map_err(MessageError::from)
    }

    pub async fn update_flags(&self, user_id: Id, message_id: Id, patch: &FlagPatch) -> Result<(), MessageError> {
        let patch = patch.clone();
        self.store
            .with_tx(move |tx| {
                let patch = patch.clone();
                Box::pin(async move {
                    if let Some(v) = patch.seen {
                        MessageRepo::set_flag(tx, message_id, user_id, "\\Seen", v).await?;
                    }
                    if let Some(v) = patch.answered {
                        MessageRepo::set_flag(tx, message_id, user_id, "\\Answered", v).await?;
                    }
                    if let Some(v) = patch.flagged {
                        MessageRepo::set_flag(tx, message_id, user_id, "\\Flagged", v).await?;
                    }
                    if let Some(v) = patch.deleted {
                        MessageRepo::set_flag(tx, message_id, user_id, "\\Deleted", v).await?;
                    }
                    if let Some(v) = patch.draft {
                        MessageRepo::set_flag(tx, message_id, user_id, "\\Draft", v).await?;
                    }
                    if let Some(custom) = &patch.custom_flags {
                        let current = MessageRepo::get_flags(tx, message_id, user_id).await?;
                        for existing in &current.custom {
                            if !custom.contains(existing) {
                                MessageRepo::set_flag(tx, message_id, user_id, existing, false).await?;
                            }
                        }
                        for name in custom {
                            if STANDARD_FLAGS.contains(&name.as_str()) {
                                continue;
                            }
                            MessageRepo::set_flag(tx, message_id, user_id, name, true).await?;
                        }
                    }
                    Ok(())
                })
            })
            .await
            .map_err(MessageError::from)
    }

    /// Moves a placement to a different folder, reassigning folder-scoped
    /// UID/sequence number and adjusting both folders' `exists` counters.
    pub async fn move_to_folder(&self, user_message_id: Id, dest_folder_id: Id) -> Result<(), MessageError> {
        self.store
            .with_tx(move |tx| {
                Box::pin(async move {
                    let Some(placement) = MessageRepo::find_placement_by_id(tx, user_message_id).await? else {
                        return Err(StoreError::not_found("message"));
                    };
                    if placement.folder_id == dest_folder_id {
                        return Ok(());
                    }
                    let dest_uid = FolderRepo::allocate_uid(tx, dest_folder_id).await?;
                    FolderRepo::adjust_counters(tx, placement.folder_id, -1, 0, 0).await?;
                    FolderRepo::adjust_counters(tx, dest_folder_id, 1, 0, 0).await?;
                    MessageRepo::move_placement(tx, user_message_id, dest_folder_id, dest_uid).await?;
                    MessageRepo::renumber_folder(tx, placement.folder_id).await?;
                    MessageRepo::renumber_folder(tx, dest_folder_id).await?;
                    Ok(())
                })
            })
            .await
            .map_err(MessageError::from)
    }

    /// Content edits are only allowed while `\Draft` is set for this user.
    pub async fn update_content(&self, user_id: Id, message_id: Id, patch: &ContentPatch) -> Result<(), MessageError> {
        let patch = patch.clone();
        self.store
            .with_tx(move |tx| {
                let patch = patch.clone();
                Box::pin(async move {
                    let flags = MessageRepo::get_flags(tx, message_id, user_id).await?;
                    if !flags.draft {
                        return Ok(Err(MessageError::NotDraft));
                    }
                    let Some(mut message) = MessageRepo::find_by_id(tx, message_id).await? else {
                        return Ok(Err(MessageError::NotFound));
                    };
                    if let Some(subject) = &patch.subject {
                        message.subject = Some(subject.clone());
                    }
                    if let Some(body) = &patch.body {
                        message.body = Some(body.clone());
                    }
                    if let Some(body_html) = &patch.body_html {
                        message.body_html = Some(body_html.clone());
                    }
                    let new_size = message.headers.len()
                        + message.body.as_deref().unwrap_or("").len()
                        + message.body_html.as_deref().unwrap_or("").len();
                    sqlx::query("UPDATE messages SET subject = ?, body = ?, body_html = ?, message_size = ? WHERE id = ?")
                        .bind(&message.subject)
                        .bind(&message.body)
                        .bind(&message.body_html)
                        .bind(new_size as i64)
                        .bind(message_id)
                        .execute(&mut *tx)
                        .await?;
                    Ok(Ok(()))
                })
            })
            .await?
    }

    /// §4.F delete: soft delete by moving the placement to Trash with a
    /// fresh UID and `\Deleted = true`.
    pub async fn delete(&self, user_id: Id, message_id: Id, user_message_id: Id) -> Result<(), MessageError> {
        self.store
            .with_tx(move |tx| {
                Box::pin(async move {
                    let Some(trash) = FolderRepo::find_system(tx, user_id, SystemFolderType::Trash).await? else {
                        return Ok(Err(MessageError::NoTrash));
                    };
                    let Some(placement) = MessageRepo::find_placement_by_id(tx, user_message_id).await? else {
                        return Ok(Err(MessageError::NotFound));
                    };
                    let dest_uid = FolderRepo::allocate_uid(tx, trash.id).await?;
                    FolderRepo::adjust_counters(tx, placement.folder_id, -1, 0, 0).await?;
                    FolderRepo::adjust_counters(tx, trash.id, 1, 0, 0).await?;
                    MessageRepo::move_placement(tx, user_message_id, trash.id, dest_uid).await?;
                    MessageRepo::renumber_folder(tx, placement.folder_id).await?;
                    MessageRepo::renumber_folder(tx, trash.id).await?;
                    MessageRepo::set_flag(tx, message_id, user_id, "\\Deleted", true).await?;
                    Ok(Ok(()))
                })
            })
            .await?
    }
}
