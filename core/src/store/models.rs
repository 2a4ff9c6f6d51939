/*
 * models.rs
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

//! Entity rows backing the Store (§3 of the data model): Domain, User, Folder,
//! Message, UserMessage, MessageFlag, Attachment, DkimKey.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Id = i64;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Domain {
    pub id: Id,
    pub name: String,
    pub is_active: bool,
    pub catch_all_user_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    DomainAdmin,
    HostAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::DomainAdmin => "DomainAdmin",
            Role::HostAdmin => "HostAdmin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "User" => Some(Role::User),
            "DomainAdmin" => Some(Role::DomainAdmin),
            "HostAdmin" => Some(Role::HostAdmin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub domain_id: Id,
    pub password_hash: String,
    pub password_salt: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub can_receive: bool,
    pub can_login: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub failed_login_attempts: i64,
    pub lockout_end: Option<DateTime<Utc>>,
    pub last_failed_login: Option<DateTime<Utc>>,
}

/// A User joined with its Domain, avoiding a second round trip at call sites
/// that need the external identity `username@domain.name`.
#[derive(Debug, Clone)]
pub struct UserWithDomain {
    pub user: User,
    pub domain: Domain,
}

impl UserWithDomain {
    pub fn email(&self) -> String {
        format!("{}@{}", self.user.username, self.domain.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemFolderType {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Outbox,
}

impl SystemFolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemFolderType::Inbox => "INBOX",
            SystemFolderType::Sent => "SENT",
            SystemFolderType::Drafts => "DRAFTS",
            SystemFolderType::Trash => "TRASH",
            SystemFolderType::Spam => "SPAM",
            SystemFolderType::Outbox => "OUTBOX",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INBOX" => Some(SystemFolderType::Inbox),
            "SENT" => Some(SystemFolderType::Sent),
            "DRAFTS" => Some(SystemFolderType::Drafts),
            "TRASH" => Some(SystemFolderType::Trash),
            "SPAM" => Some(SystemFolderType::Spam),
            "OUTBOX" => Some(SystemFolderType::Outbox),
            _ => None,
        }
    }

    /// The six default folders created for every new user, in display order.
    pub const DEFAULTS: [SystemFolderType; 6] = [
        SystemFolderType::Inbox,
        SystemFolderType::Sent,
        SystemFolderType::Drafts,
        SystemFolderType::Trash,
        SystemFolderType::Spam,
        SystemFolderType::Outbox,
    ];
}

#[derive(Debug, Clone)]
pub struct Folder {
    pub id: Id,
    pub user_id: Id,
    pub name: String,
    pub delimiter: char,
    pub system_type: Option<SystemFolderType>,
    pub attributes: Vec<String>,
    pub uid_next: i64,
    pub uid_validity: i64,
    pub exists: i64,
    pub recent: i64,
    pub unseen: i64,
    pub subscribed: bool,
    pub created_at: DateTime<Utc>,
}

impl Folder {
    pub fn is_system(&self) -> bool {
        self.system_type.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: Id,
    pub header_message_id: String,
    pub from_addr: String,
    pub to_addr: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: Option<String>,
    pub headers: String,
    pub body: Option<String>,
    pub body_html: Option<String>,
    pub message_size: i64,
    pub received_at: DateTime<Utc>,
    pub sent_date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub body_structure: serde_json::Value,
    pub envelope: serde_json::Value,
    pub uid: i64,
    pub uid_validity: i64,
}

#[derive(Debug, Clone)]
pub struct UserMessage {
    pub id: Id,
    pub user_id: Id,
    pub message_id: Id,
    pub folder_id: Id,
    pub uid: i64,
    pub sequence_number: i64,
    pub received_at: DateTime<Utc>,
}

/// A message as seen by a particular user in a particular folder: the join of
/// Message + UserMessage + the user's MessageFlag rows, as returned by
/// MessageService (§4.F).
#[derive(Debug, Clone)]
pub struct MessageView {
    pub message: Message,
    pub placement: UserMessage,
    pub folder_name: String,
    pub flags: MessageFlags,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFlags {
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub draft: bool,
    pub recent: bool,
    pub custom: Vec<String>,
}

pub const STANDARD_FLAGS: [&str; 6] = [
    "\\Seen",
    "\\Answered",
    "\\Flagged",
    "\\Deleted",
    "\\Draft",
    "\\Recent",
];

#[derive(Debug, Clone)]
pub struct MessageFlag {
    pub id: Id,
    pub message_id: Id,
    pub user_id: Id,
    pub flag_name: String,
    pub is_set: bool,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Id,
    pub message_id: Id,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub file_guid: String,
    pub file_extension: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct DkimKey {
    pub id: Id,
    pub domain_id: Id,
    pub selector: String,
    pub private_key: String,
    pub public_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
