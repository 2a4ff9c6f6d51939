/*
 * mod.rs
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

//! POP3 session (§4.H.2): maildrop snapshot taken on successful `PASS`,
//! deletes deferred to `QUIT`.

use crate::auth::Authenticator;
use crate::message_service::{ListFilter, MessageError, MessageService, SortBy, SortOrder};
use crate::protocol::smtp::dot_stuffer::DotStuffer;
use crate::store::{FolderRepo, Id, Store, StoreError, SystemFolderType};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

const MAILDROP_PAGE_SIZE: i64 = 100;
/// §4.H idle read timeout: 10 minutes, the "otherwise" default.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// One entry of the maildrop snapshot taken at `PASS` time; numbering is
/// stable for the session's lifetime even as `deletedSet` hides entries.
struct MaildropEntry {
    message_id: Id,
    user_message_id: Id,
    size: i64,
}

pub struct Pop3Session {
    authenticator: Arc<Authenticator>,
    message_service: Arc<MessageService>,
    store: Arc<Store>,
}

impl Pop3Session {
    pub fn new(authenticator: Arc<Authenticator>, message_service: Arc<MessageService>, store: Arc<Store>) -> Self {
        Self { authenticator, message_service, store }
    }

    pub async fn run<S>(&self, socket: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut w) = tokio::io::split(socket);
        let mut r = BufReader::new(read_half);
        w.write_all(b"+OK Server ready\r\n").await?;

        let mut pending_user: Option<String> = None;
        let mut user_id: Option<Id> = None;
        let mut maildrop: Vec<MaildropEntry> = Vec::new();
        let mut deleted: HashSet<usize> = HashSet::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = match tokio::time::timeout(IDLE_TIMEOUT, r.read_line(&mut line)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("pop3 session idle timeout exceeded");
                    let _ = w.write_all(b"-ERR idle timeout exceeded, closing connection\r\n").await;
                    return Ok(());
                }
            };
            if n == 0 {
                return Ok(());
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            debug!(command = %trimmed, "pop3 command");
            let mut parts = trimmed.splitn(2, char::is_whitespace);
            let verb = parts.next().unwrap_or("").to_ascii_uppercase();
            let arg = parts.next().map(str::trim).unwrap_or("");

            match verb.as_str() {
                "CAPA" => {
                    w.write_all(b"+OK Capability list follows\r\nTOP\r\nUIDL\r\nUSER\r\n.\r\n").await?;
                }
                "NOOP" => {
                    w.write_all(b"+OK\r\n").await?;
                }
                "QUIT" => {
                    if let Some(uid) = user_id {
                        let mut deleted_count = 0;
                        for &idx in &deleted {
                            if let Some(entry) = maildrop.get(idx - 1) {
                                if let Err(e) = self.message_service.delete(uid, entry.message_id, entry.user_message_id).await {
                                    warn!(error = %e, "pop3 delete on quit failed");
                                    continue;
                                }
                                deleted_count += 1;
                            }
                        }
                        w.write_all(format!("+OK {deleted_count} messages deleted\r\n").as_bytes()).await?;
                    } else {
                        w.write_all(b"+OK Bye\r\n").await?;
                    }
                    return Ok(());
                }
                "USER" if user_id.is_none() => {
                    pending_user = Some(arg.to_string());
                    w.write_all(b"+OK\r\n").await?;
                }
                "PASS" if user_id.is_none() => {
                    let Some(email) = pending_user.take() else {
                        w.write_all(b"-ERR USER first\r\n").await?;
                        continue;
                    };
                    match self.authenticator.authenticate(&email, arg).await {
                        Ok(with_domain) => {
                            match self.load_maildrop(with_domain.user.id).await {
                                Ok(entries) => {
                                    info!(user = %with_domain.email(), messages = entries.len(), "pop3 session authenticated");
                                    user_id = Some(with_domain.user.id);
                                    maildrop = entries;
                                    deleted.clear();
                                    w.write_all(format!("+OK {} messages\r\n", maildrop.len()).as_bytes()).await?;
                                }
                                Err(e) => {
                                    warn!(error = %e, "pop3 maildrop snapshot failed");
                                    w.write_all(b"-ERR unable to lock maildrop\r\n").await?;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "pop3 auth failed");
                            w.write_all(b"-ERR authentication failed\r\n").await?;
                        }
                    }
                }
                _ if user_id.is_none() => {
                    w.write_all(b"-ERR authentication required\r\n").await?;
                }
                "STAT" => {
                    let (count, size) = live_totals(&maildrop, &deleted);
                    w.write_all(format!("+OK {count} {size}\r\n").as_bytes()).await?;
                }
                "LIST" => {
                    self.handle_list_or_uidl(&mut w, &maildrop, &deleted, arg, false).await?;
                }
                "UIDL" => {
                    self.handle_list_or_uidl(&mut w, &maildrop, &deleted, arg, true).await?;
                }
                "DELE" => match parse_index(arg, maildrop.len(), &deleted) {
                    Some(idx) => {
                        deleted.insert(idx);
                        w.write_all(format!("+OK message {idx} deleted\r\n").as_bytes()).await?;
                    }
                    None => w.write_all(b"-ERR no such message\r\n").await?,
                },
                "RSET" => {
                    deleted.clear();
                    w.write_all(b"+OK\r\n").await?;
                }
                "RETR" => match parse_index(arg, maildrop.len(), &deleted) {
                    Some(idx) => self.send_message(&mut w, &maildrop[idx - 1], None).await?,
                    None => w.write_all(b"-ERR no such message\r\n").await?,
                },
                "TOP" => {
                    let mut top_parts = arg.splitn(2, char::is_whitespace);
                    let idx_arg = top_parts.next().unwrap_or("");
                    let lines: usize = top_parts.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
                    match parse_index(idx_arg, maildrop.len(), &deleted) {
                        Some(idx) => self.send_message(&mut w, &maildrop[idx - 1], Some(lines)).await?,
                        None => w.write_all(b"-ERR no such message\r\n").await?,
                    }
                }
                _ => {
                    w.write_all(b"-ERR unknown command\r\n").await?;
                }
            }
        }
    }

    /// §4.H.2: the maildrop is a snapshot of INBOX taken once at `PASS` time;
    /// `MessageService::list` caps a single page at 100 rows, so a mailbox
    /// larger than that is paged through in full here.
    async fn load_maildrop(&self, user_id: Id) -> Result<Vec<MaildropEntry>, MessageError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        let Some(inbox) = FolderRepo::find_system(&mut conn, user_id, SystemFolderType::Inbox).await? else {
            return Err(MessageError::NotFound);
        };
        drop(conn);

        let mut entries = Vec::new();
        let mut skip = 0i64;
        loop {
            let page = self
                .message_service
                .list(user_id, inbox.id, &ListFilter::default(), skip, MAILDROP_PAGE_SIZE, SortBy::Date, SortOrder::Asc)
                .await?;
            let got = page.items.len();
            entries.extend(page.items.into_iter().map(|view| MaildropEntry {
                message_id: view.message.id,
                user_message_id: view.placement.id,
                size: view.message.message_size,
            }));
            if (got as i64) < MAILDROP_PAGE_SIZE {
                break;
            }
            skip += MAILDROP_PAGE_SIZE;
        }
        Ok(entries)
    }

    async fn handle_list_or_uidl<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        maildrop: &[MaildropEntry],
        deleted: &HashSet<usize>,
        arg: &str,
        uidl: bool,
    ) -> std::io::Result<()> {
        if arg.is_empty() {
            let (count, size) = live_totals(maildrop, deleted);
            if uidl {
                w.write_all(b"+OK\r\n").await?;
            } else {
                w.write_all(format!("+OK {count} messages ({size} octets)\r\n").as_bytes()).await?;
            }
            for (i, entry) in maildrop.iter().enumerate() {
                let idx = i + 1;
                if deleted.contains(&idx) {
                    continue;
                }
                if uidl {
                    w.write_all(format!("{idx} {}\r\n", entry.message_id).as_bytes()).await?;
                } else {
                    w.write_all(format!("{idx} {}\r\n", entry.size).as_bytes()).await?;
                }
            }
            w.write_all(b".\r\n").await?;
        } else {
            match parse_index(arg, maildrop.len(), deleted) {
                Some(idx) => {
                    let entry = &maildrop[idx - 1];
                    if uidl {
                        w.write_all(format!("+OK {idx} {}\r\n", entry.message_id).as_bytes()).await?;
                    } else {
                        w.write_all(format!("+OK {idx} {}\r\n", entry.size).as_bytes()).await?;
                    }
                }
                None => w.write_all(b"-ERR no such message\r\n").await?,
            }
        }
        Ok(())
    }

    /// `RETR` (`max_lines = None`) or `TOP n lines` (`Some(lines)`): headers,
    /// blank line, body (all or the first `lines` lines), dot-stuffed,
    /// terminated by a lone `.`.
    async fn send_message<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        entry: &MaildropEntry,
        max_lines: Option<usize>,
    ) -> std::io::Result<()> {
        let view = {
            let mut conn = match self.store.pool().acquire().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "pop3 retr failed to acquire connection");
                    w.write_all(b"-ERR message unavailable\r\n").await?;
                    return Ok(());
                }
            };
            match crate::store::MessageRepo::find_by_id(&mut conn, entry.message_id).await {
                Ok(Some(message)) => message,
                _ => {
                    w.write_all(b"-ERR message unavailable\r\n").await?;
                    return Ok(());
                }
            }
        };
        w.write_all(format!("+OK {} octets\r\n", entry.size).as_bytes()).await?;

        let mut stuffer = DotStuffer::new();
        let mut out = Vec::new();
        stuffer.process_chunk(view.headers.as_bytes(), |s| out.extend_from_slice(s));
        stuffer.process_chunk(b"\r\n", |s| out.extend_from_slice(s));
        if let Some(limit) = max_lines {
            let body = view.body.as_deref().unwrap_or("");
            for line in body.split("\r\n").take(limit) {
                stuffer.process_chunk(line.as_bytes(), |s| out.extend_from_slice(s));
                stuffer.process_chunk(b"\r\n", |s| out.extend_from_slice(s));
            }
        } else if let Some(body) = &view.body {
            stuffer.process_chunk(body.as_bytes(), |s| out.extend_from_slice(s));
        }
        stuffer.end_message(|s| out.extend_from_slice(s));
        w.write_all(&out).await?;
        Ok(())
    }
}

fn live_totals(maildrop: &[MaildropEntry], deleted: &HashSet<usize>) -> (usize, i64) {
    let mut count = 0;
    let mut size = 0;
    for (i, entry) in maildrop.iter().enumerate() {
        if !deleted.contains(&(i + 1)) {
            count += 1;
            size += entry.size;
        }
    }
    (count, size)
}

fn parse_index(arg: &str, len: usize, deleted: &HashSet<usize>) -> Option<usize> {
    let idx: usize = arg.trim().parse().ok()?;
    if idx == 0 || idx > len || deleted.contains(&idx) {
        return None;
    }
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_index_rejects_zero_and_out_of_range() {
        let deleted = HashSet::new();
        assert_eq!(parse_index("0", 5, &deleted), None);
        assert_eq!(parse_index("6", 5, &deleted), None);
        assert_eq!(parse_index("3", 5, &deleted), Some(3));
    }

    #[test]
    fn parse_index_rejects_deleted_entries() {
        let mut deleted = HashSet::new();
        deleted.insert(2);
        assert_eq!(parse_index("2", 5, &deleted), None);
    }

    #[test]
    fn live_totals_excludes_deleted() {
        let maildrop = vec![
            MaildropEntry { message_id: 1, user_message_id: 1, size: 100 },
            MaildropEntry { message_id: 2, user_message_id: 2, size: 200 },
        ];
        let mut deleted = HashSet::new();
        deleted.insert(1);
        assert_eq!(live_totals(&maildrop, &deleted), (1, 200));
    }
}
