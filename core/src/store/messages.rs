/*
 * messages.rs
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

//! Message, UserMessage and MessageFlag repository functions (§4.F).

use super::error::StoreError;
use super::models::{Attachment, Id, Message, MessageFlags, MessageView, UserMessage, STANDARD_FLAGS};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

pub struct MessageRepo;

/// Everything MessageRepo::insert needs to build a `messages` row. Plain
/// struct rather than a dozen positional args, since DeliveryEngine and
/// MessageService (draft creation) both populate one of these.
pub struct NewMessage<'a> {
    pub header_message_id: &'a str,
    pub from_addr: &'a str,
    pub to_addr: Option<&'a str>,
    pub cc: Option<&'a str>,
    pub bcc: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub headers: &'a str,
    pub body: Option<&'a str>,
    pub body_html: Option<&'a str>,
    pub message_size: i64,
    pub sent_date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<&'a str>,
    pub references: Option<&'a str>,
    pub body_structure: serde_json::Value,
    pub envelope: serde_json::Value,
}

fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
    let body_structure: String = row.try_get("body_structure").map_err(|e| StoreError::Internal(e.to_string()))?;
    let envelope: String = row.try_get("envelope").map_err(|e| StoreError::Internal(e.to_string()))?;
    Ok(Message {
        id: row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?,
        header_message_id: row.try_get("header_message_id").map_err(|e| StoreError::Internal(e.to_string()))?,
        from_addr: row.try_get("from_addr").map_err(|e| StoreError::Internal(e.to_string()))?,
        to_addr: row.try_get("to_addr").map_err(|e| StoreError::Internal(e.to_string()))?,
        cc: row.try_get("cc").map_err(|e| StoreError::Internal(e.to_string()))?,
        bcc: row.try_get("bcc").map_err(|e| StoreError::Internal(e.to_string()))?,
        subject: row.try_get("subject").map_err(|e| StoreError::Internal(e.to_string()))?,
        headers: row.try_get("headers").map_err(|e| StoreError::Internal(e.to_string()))?,
        body: row.try_get("body").map_err(|e| StoreError::Internal(e.to_string()))?,
        body_html: row.try_get("body_html").map_err(|e| StoreError::Internal(e.to_string()))?,
        message_size: row.try_get("message_size").map_err(|e| StoreError::Internal(e.to_string()))?,
        received_at: row.try_get("received_at").map_err(|e| StoreError::Internal(e.to_string()))?,
        sent_date: row.try_get("sent_date").map_err(|e| StoreError::Internal(e.to_string()))?,
        in_reply_to: row.try_get("in_reply_to").map_err(|e| StoreError::Internal(e.to_string()))?,
        references: row.try_get("msg_references").map_err(|e| StoreError::Internal(e.to_string()))?,
        body_structure: serde_json::from_str(&body_structure).map_err(|e| StoreError::Internal(e.to_string()))?,
        envelope: serde_json::from_str(&envelope).map_err(|e| StoreError::Internal(e.to_string()))?,
        uid: row.try_get("uid").map_err(|e| StoreError::Internal(e.to_string()))?,
        uid_validity: row.try_get("uid_validity").map_err(|e| StoreError::Internal(e.to_string()))?,
    })
}

fn row_to_placement(row: &SqliteRow) -> Result<UserMessage, StoreError> {
    Ok(UserMessage {
        id: row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?,
        user_id: row.try_get("user_id").map_err(|e| StoreError::Internal(e.to_string()))?,
        message_id: row.try_get("message_id").map_err(|e| StoreError::Internal(e.to_string()))?,
        folder_id: row.try_get("folder_id").map_err(|e| StoreError::Internal(e.to_string()))?,
        uid: row.try_get("uid").map_err(|e| StoreError::Internal(e.to_string()))?,
        sequence_number: row.try_get("sequence_number").map_err(|e| StoreError::Internal(e.to_string()))?,
        received_at: row.try_get("received_at").map_err(|e| StoreError::Internal(e.to_string()))?,
    })
}

/// Sort key for §4.F's list operation. `Date*` sorts by `sent_date`,
/// falling back to `received_at` when null, per §4.F's sort-key definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    DateAsc,
    DateDesc,
    SubjectAsc,
    SubjectDesc,
    SenderAsc,
    SenderDesc,
    SizeAsc,
    SizeDesc,
    UidAsc,
}

impl SortKey {
    fn sql(self) -> &'static str {
        match self {
            SortKey::DateAsc => "COALESCE(m.sent_date, m.received_at) ASC",
            SortKey::DateDesc => "COALESCE(m.sent_date, m.received_at) DESC",
            SortKey::SubjectAsc => "m.subject ASC",
            SortKey::SubjectDesc => "m.subject DESC",
            SortKey::SenderAsc => "m.from_addr ASC",
            SortKey::SenderDesc => "m.from_addr DESC",
            SortKey::SizeAsc => "m.message_size ASC",
            SortKey::SizeDesc => "m.message_size DESC",
            SortKey::UidAsc => "um.uid ASC",
        }
    }
}

/// §4.F list/count filter. `q` matches subject, body, or sender
/// substring (SQLite's `LIKE` is already ASCII case-insensitive). Exactly
/// one of `seen`/`flagged`/`answered`/`draft`/`deleted` is set at a time in
/// practice, mirroring the single `flags` filter enum at the service layer.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub q: Option<String>,
    pub seen: Option<bool>,
    pub flagged: Option<bool>,
    pub answered: Option<bool>,
    pub draft: Option<bool>,
    pub deleted: Option<bool>,
    pub from_contains: Option<String>,
    pub to_contains: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
}

fn escape_like_needle(needle: &str) -> String {
    format!("%{}%", needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"))
}

/// Appends this filter's `WHERE` fragments (each as `AND ...`) to `sql`.
/// `list_in_folder` and `count_in_folder` share this so the predicates a
/// page was built from are exactly the predicates its `totalCount` counts.
fn push_filter_clause(sql: &mut String, filter: &MessageFilter) {
    if filter.q.is_some() {
        sql.push_str(" AND (m.subject LIKE ? ESCAPE '\\' OR m.body LIKE ? ESCAPE '\\' OR m.from_addr LIKE ? ESCAPE '\\')");
    }
    if filter.seen.is_some() {
        sql.push_str(" AND EXISTS (SELECT 1 FROM message_flags f WHERE f.message_id = um.message_id AND f.user_id = um.user_id AND f.flag_name = '\\Seen' AND f.is_set = ?)");
    }
    if filter.flagged.is_some() {
        sql.push_str(" AND EXISTS (SELECT 1 FROM message_flags f WHERE f.message_id = um.message_id AND f.user_id = um.user_id AND f.flag_name = '\\Flagged' AND f.is_set = ?)");
    }
    if filter.answered.is_some() {
        sql.push_str(" AND EXISTS (SELECT 1 FROM message_flags f WHERE f.message_id = um.message_id AND f.user_id = um.user_id AND f.flag_name = '\\Answered' AND f.is_set = ?)");
    }
    if filter.draft.is_some() {
        sql.push_str(" AND EXISTS (SELECT 1 FROM message_flags f WHERE f.message_id = um.message_id AND f.user_id = um.user_id AND f.flag_name = '\\Draft' AND f.is_set = ?)");
    }
    if filter.deleted.is_some() {
        sql.push_str(" AND EXISTS (SELECT 1 FROM message_flags f WHERE f.message_id = um.message_id AND f.user_id = um.user_id AND f.flag_name = '\\Deleted' AND f.is_set = ?)");
    }
    if filter.from_contains.is_some() {
        sql.push_str(" AND m.from_addr LIKE ? ESCAPE '\\'");
    }
    if filter.to_contains.is_some() {
        sql.push_str(" AND m.to_addr LIKE ? ESCAPE '\\'");
    }
    if filter.since.is_some() {
        sql.push_str(" AND COALESCE(m.sent_date, m.received_at) >= ?");
    }
    if filter.before.is_some() {
        sql.push_str(" AND COALESCE(m.sent_date, m.received_at) <= ?");
    }
    if filter.min_size.is_some() {
        sql.push_str(" AND m.message_size >= ?");
    }
    if filter.max_size.is_some() {
        sql.push_str(" AND m.message_size <= ?");
    }
}

/// Binds this filter's values in the same order `push_filter_clause` wrote
/// their placeholders.
fn bind_filter<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filter: &'q MessageFilter,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(needle) = &filter.q {
        let pattern = escape_like_needle(needle);
        query = query.bind(pattern.clone()).bind(pattern.clone()).bind(pattern);
    }
    if let Some(seen) = filter.seen {
        query = query.bind(seen);
    }
    if let Some(flagged) = filter.flagged {
        query = query.bind(flagged);
    }
    if let Some(answered) = filter.answered {
        query = query.bind(answered);
    }
    if let Some(draft) = filter.draft {
        query = query.bind(draft);
    }
    if let Some(deleted) = filter.deleted {
        query = query.bind(deleted);
    }
    if let Some(needle) = &filter.from_contains {
        query = query.bind(escape_like_needle(needle));
    }
    if let Some(needle) = &filter.to_contains {
        query = query.bind(escape_like_needle(needle));
    }
    if let Some(since) = filter.since {
        query = query.bind(since);
    }
    if let Some(before) = filter.before {
        query = query.bind(before);
    }
    if let Some(min_size) = filter.min_size {
        query = query.bind(min_size);
    }
    if let Some(max_size) = filter.max_size {
        query = query.bind(max_size);
    }
    query
}

impl MessageRepo {
    pub async fn insert(
        exec: &mut SqliteConnection,
        new: NewMessage<'_>,
        uid: i64,
        uid_validity: i64,
    ) -> Result<Message, StoreError> {
        let now = Utc::now();
        let body_structure = serde_json::to_string(&new.body_structure).map_err(|e| StoreError::Internal(e.to_string()))?;
        let envelope = serde_json::to_string(&new.envelope).map_err(|e| StoreError::Internal(e.to_string()))?;
        let id = sqlx::query(
            "INSERT INTO messages (header_message_id, from_addr, to_addr, cc, bcc, subject, headers, body, body_html,
              message_size, received_at, sent_date, in_reply_to, msg_references, body_structure, envelope, uid, uid_validity)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.header_message_id)
        .bind(new.from_addr)
        .bind(new.to_addr)
        .bind(new.cc)
        .bind(new.bcc)
        .bind(new.subject)
        .bind(new.headers)
        .bind(new.body)
        .bind(new.body_html)
        .bind(new.message_size)
        .bind(now)
        .bind(new.sent_date)
        .bind(new.in_reply_to)
        .bind(new.references)
        .bind(body_structure)
        .bind(envelope)
        .bind(uid)
        .bind(uid_validity)
        .execute(&mut *exec)
        .await?
        .last_insert_rowid();
        Self::find_by_id(exec, id)
            .await?
            .ok_or_else(|| StoreError::Internal("message vanished after insert".into()))
    }

    pub async fn find_by_id(exec: &mut SqliteConnection, id: Id) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(exec)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    /// Places a stored message into a user's folder at `uid`, assigning the
    /// next sequence number (count of live placements in the folder).
    pub async fn place(
        exec: &mut SqliteConnection,
        message_id: Id,
        user_id: Id,
        folder_id: Id,
        uid: i64,
    ) -> Result<UserMessage, StoreError> {
        let now = Utc::now();
        let seq_row = sqlx::query("SELECT COUNT(*) AS n FROM user_messages WHERE folder_id = ?")
            .bind(folder_id)
            .fetch_one(&mut *exec)
            .await?;
        let seq: i64 = seq_row.try_get("n").map_err(|e| StoreError::Internal(e.to_string()))? + 1;
        let id = sqlx::query(
            "INSERT INTO user_messages (user_id, message_id, folder_id, uid, sequence_number, received_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(message_id)
        .bind(folder_id)
        .bind(uid)
        .bind(seq)
        .bind(now)
        .execute(&mut *exec)
        .await?
        .last_insert_rowid();
        let row = sqlx::query("SELECT * FROM user_messages WHERE id = ?")
            .bind(id)
            .fetch_one(exec)
            .await?;
        row_to_placement(&row)
    }

    pub async fn find_placement_by_uid(
        exec: &mut SqliteConnection,
        folder_id: Id,
        uid: i64,
    ) -> Result<Option<UserMessage>, StoreError> {
        let row = sqlx::query("SELECT * FROM user_messages WHERE folder_id = ? AND uid = ?")
            .bind(folder_id)
            .bind(uid)
            .fetch_optional(exec)
            .await?;
        row.as_ref().map(row_to_placement).transpose()
    }

    pub async fn find_placement_by_id(
        exec: &mut SqliteConnection,
        user_message_id: Id,
    ) -> Result<Option<UserMessage>, StoreError> {
        let row = sqlx::query("SELECT * FROM user_messages WHERE id = ?")
            .bind(user_message_id)
            .fetch_optional(exec)
            .await?;
        row.as_ref().map(row_to_placement).transpose()
    }

    /// Moves a placement to another folder, reassigning folder-scoped UID and
    /// sequence number (used by IMAP COPY/MOVE and soft-delete-to-Trash).
    pub async fn move_placement(
        exec: &mut SqliteConnection,
        user_message_id: Id,
        dest_folder_id: Id,
        dest_uid: i64,
    ) -> Result<(), StoreError> {
        let seq_row = sqlx::query("SELECT COUNT(*) AS n FROM user_messages WHERE folder_id = ?")
            .bind(dest_folder_id)
            .fetch_one(&mut *exec)
            .await?;
        let seq: i64 = seq_row.try_get("n").map_err(|e| StoreError::Internal(e.to_string()))? + 1;
        sqlx::query("UPDATE user_messages SET folder_id = ?, uid = ?, sequence_number = ? WHERE id = ?")
            .bind(dest_folder_id)
            .bind(dest_uid)
            .bind(seq)
            .bind(user_message_id)
            .execute(exec)
            .await?;
        Ok(())
    }

    /// Deletes a placement and its per-user flags. Only deletes the shared
    /// `messages` row too if no other placement still references it (a
    /// message can be copied into several folders/mailboxes).
    pub async fn delete_placement(exec: &mut SqliteConnection, user_message_id: Id) -> Result<(), StoreError> {
        let Some(placement) = Self::find_placement_by_id(exec, user_message_id).await? else {
            return Err(StoreError::not_found("message"));
        };
        sqlx::query("DELETE FROM message_flags WHERE message_id = ? AND user_id = ?")
            .bind(placement.message_id)
            .bind(placement.user_id)
            .execute(&mut *exec)
            .await?;
        sqlx::query("DELETE FROM user_messages WHERE id = ?")
            .bind(user_message_id)
            .execute(&mut *exec)
            .await?;
        let remaining = sqlx::query("SELECT COUNT(*) AS n FROM user_messages WHERE message_id = ?")
            .bind(placement.message_id)
            .fetch_one(&mut *exec)
            .await?
            .try_get::<i64, _>("n")
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if remaining == 0 {
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(placement.message_id)
                .execute(exec)
                .await?;
        }
        Ok(())
    }

    pub async fn set_flag(
        exec: &mut SqliteConnection,
        message_id: Id,
        user_id: Id,
        flag_name: &str,
        is_set: bool,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO message_flags (message_id, user_id, flag_name, is_set, modified_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(message_id, user_id, flag_name) DO UPDATE SET is_set = excluded.is_set, modified_at = excluded.modified_at",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(flag_name)
        .bind(is_set)
        .bind(now)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn get_flags(
        exec: &mut SqliteConnection,
        message_id: Id,
        user_id: Id,
    ) -> Result<MessageFlags, StoreError> {
        let rows = sqlx::query("SELECT flag_name, is_set FROM message_flags WHERE message_id = ? AND user_id = ? AND is_set = 1")
            .bind(message_id)
            .bind(user_id)
            .fetch_all(exec)
            .await?;
        let mut flags = MessageFlags::default();
        for row in &rows {
            let name: String = row.try_get("flag_name").map_err(|e| StoreError::Internal(e.to_string()))?;
            match name.as_str() {
                "\\Seen" => flags.seen = true,
                "\\Answered" => flags.answered = true,
                "\\Flagged" => flags.flagged = true,
                "\\Deleted" => flags.deleted = true,
                "\\Draft" => flags.draft = true,
                "\\Recent" => flags.recent = true,
                other if !STANDARD_FLAGS.contains(&other) => flags.custom.push(other.to_string()),
                _ => {}
            }
        }
        Ok(flags)
    }

    pub async fn view_by_placement(
        exec: &mut SqliteConnection,
        placement: UserMessage,
    ) -> Result<MessageView, StoreError> {
        let message = Self::find_by_id(exec, placement.message_id)
            .await?
            .ok_or_else(|| StoreError::Internal("placement references missing message".into()))?;
        let folder_name: String = sqlx::query("SELECT name FROM folders WHERE id = ?")
            .bind(placement.folder_id)
            .fetch_one(&mut *exec)
            .await?
            .try_get("name")
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let flags = Self::get_flags(exec, placement.message_id, placement.user_id).await?;
        Ok(MessageView { message, placement, folder_name, flags })
    }

    /// Lists messages in a folder for a user, applying the filter/sort/page
    /// parameters from §4.F. Pagination is offset-based (small mailboxes by
    /// design — see Non-goals).
    pub async fn list_in_folder(
        exec: &mut SqliteConnection,
        folder_id: Id,
        user_id: Id,
        filter: &MessageFilter,
        sort: SortKey,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageView>, StoreError> {
        let mut sql = String::from(
            "SELECT um.* FROM user_messages um JOIN messages m ON m.id = um.message_id WHERE um.folder_id = ? AND um.user_id = ?",
        );
        push_filter_clause(&mut sql, filter);
        sql.push_str(&format!(" ORDER BY {} LIMIT ? OFFSET ?", sort.sql()));

        let query = sqlx::query(&sql).bind(folder_id).bind(user_id);
        let query = bind_filter(query, filter).bind(limit).bind(offset);

        let rows = query.fetch_all(&mut *exec).await?;
        let placements: Vec<UserMessage> = rows.iter().map(row_to_placement).collect::<Result<_, _>>()?;
        let mut views = Vec::with_capacity(placements.len());
        for placement in placements {
            views.push(Self::view_by_placement(exec, placement).await?);
        }
        Ok(views)
    }

    /// Counts messages matching the same filter `list_in_folder` applies,
    /// ignoring `limit`/`offset`, for the page's `totalCount`.
    pub async fn count_in_folder(
        exec: &mut SqliteConnection,
        folder_id: Id,
        user_id: Id,
        filter: &MessageFilter,
    ) -> Result<i64, StoreError> {
        let mut sql = String::from(
            "SELECT COUNT(*) AS n FROM user_messages um JOIN messages m ON m.id = um.message_id WHERE um.folder_id = ? AND um.user_id = ?",
        );
        push_filter_clause(&mut sql, filter);
        let query = sqlx::query(&sql).bind(folder_id).bind(user_id);
        let query = bind_filter(query, filter);
        query
            .fetch_one(exec)
            .await?
            .try_get::<i64, _>("n")
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    /// Renumbers sequence numbers for a folder after one or more
    /// placements are removed (IMAP EXPUNGE, §4.H).
    pub async fn renumber_folder(exec: &mut SqliteConnection, folder_id: Id) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT id FROM user_messages WHERE folder_id = ? ORDER BY uid ASC")
            .bind(folder_id)
            .fetch_all(&mut *exec)
            .await?;
        for (idx, row) in rows.iter().enumerate() {
            let id: Id = row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?;
            sqlx::query("UPDATE user_messages SET sequence_number = ? WHERE id = ?")
                .bind(idx as i64 + 1)
                .bind(id)
                .execute(&mut *exec)
                .await?;
        }
        Ok(())
    }

    pub async fn insert_attachment(
        exec: &mut SqliteConnection,
        message_id: Id,
        filename: &str,
        content_type: &str,
        size: i64,
        file_guid: &str,
        file_extension: &str,
        file_path: &str,
    ) -> Result<Attachment, StoreError> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO attachments (message_id, filename, content_type, size, file_guid, file_extension, file_path, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(filename)
        .bind(content_type)
        .bind(size)
        .bind(file_guid)
        .bind(file_extension)
        .bind(file_path)
        .bind(now)
        .execute(&mut *exec)
        .await?
        .last_insert_rowid();
        sqlx::query_as::<_, Attachment>("SELECT * FROM attachments WHERE id = ?")
            .bind(id)
            .fetch_one(exec)
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_attachments(exec: &mut SqliteConnection, message_id: Id) -> Result<Vec<Attachment>, StoreError> {
        sqlx::query_as::<_, Attachment>("SELECT * FROM attachments WHERE message_id = ?")
            .bind(message_id)
            .fetch_all(exec)
            .await
            .map_err(StoreError::from)
    }
}
