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

//! IMAP session (§4.H.3): `NotAuthenticated → Authenticated → Selected →
//! Logout`, with a snapshot of the selected mailbox's UID ordering refreshed
//! on `SELECT`/`EXAMINE` and at other command boundaries.

use crate::auth::Authenticator;
use crate::delivery::extract_headers_block;
use crate::folder_manager::FolderManager;
use crate::message_service::{FlagPatch, MessageService};
use crate::mime::body_extract::extract_structured_body;
use crate::mime::rfc5322::parse_envelope;
use crate::store::{Folder, FolderRepo, Id, Message, MessageFilter as StoreFilter, MessageFlags, MessageRepo, NewMessage, SortKey, Store, StoreError, SystemFolderType};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

const SNAPSHOT_LIMIT: i64 = 1_000_000;
const STANDARD_FLAG_NAMES: &str = "\\Seen \\Answered \\Flagged \\Deleted \\Draft";
/// §4.H idle read timeout: this session never enters IDLE (unimplemented),
/// so every command wait falls into the 10-minute "otherwise" bucket rather
/// than IDLE's 30-minute one.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    NotAuthenticated,
    Authenticated,
    Selected,
}

struct SnapshotEntry {
    message_id: Id,
    user_message_id: Id,
    uid: i64,
}

pub struct ImapSession {
    hostname: String,
    authenticator: Arc<Authenticator>,
    folder_manager: Arc<FolderManager>,
    message_service: Arc<MessageService>,
    store: Arc<Store>,
}

impl ImapSession {
    pub fn new(
        hostname: impl Into<String>,
        authenticator: Arc<Authenticator>,
        folder_manager: Arc<FolderManager>,
        message_service: Arc<MessageService>,
        store: Arc<Store>,
    ) -> Self {
        Self { hostname: hostname.into(), authenticator, folder_manager, message_service, store }
    }

    pub async fn run<S>(&self, socket: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut w) = tokio::io::split(socket);
        let mut r = BufReader::new(read_half);
        w.write_all(b"* OK [CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN] Server ready\r\n").await?;

        let mut stage = Stage::NotAuthenticated;
        let mut user_id: Option<Id> = None;
        let mut domain_id: Option<Id> = None;
        let mut selected_folder: Option<Folder> = None;
        let mut read_only = false;
        let mut snapshot: Vec<SnapshotEntry> = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = match tokio::time::timeout(IDLE_TIMEOUT, r.read_line(&mut line)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("imap session idle timeout exceeded");
                    let _ = w.write_all(b"* BYE Autologout; idle timeout exceeded\r\n").await;
                    return Ok(());
                }
            };
            if n == 0 {
                return Ok(());
            }
            let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
            if trimmed.is_empty() {
                continue;
            }
            debug!(command = %trimmed, "imap command");
            let (tag, command, rest) = split_tagged(&trimmed);
            if command.is_empty() {
                w.write_all(format!("{tag} BAD missing command\r\n").as_bytes()).await?;
                continue;
            }

            match command.to_ascii_uppercase().as_str() {
                "CAPABILITY" => {
                    w.write_all(b"* CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN\r\n").await?;
                    w.write_all(format!("{tag} OK CAPABILITY completed\r\n").as_bytes()).await?;
                }
                "NOOP" => {
                    if stage == Stage::Selected {
                        if let Some(folder) = &selected_folder {
                            if let Ok(Some(fresh)) = self.find_folder_by_id(folder.id).await {
                                w.write_all(format!("* {} EXISTS\r\n", fresh.exists).as_bytes()).await?;
                                w.write_all(format!("* {} RECENT\r\n", fresh.recent).as_bytes()).await?;
                                selected_folder = Some(fresh);
                            }
                        }
                    }
                    w.write_all(format!("{tag} OK NOOP completed\r\n").as_bytes()).await?;
                }
                "LOGIN" => {
                    if stage != Stage::NotAuthenticated {
                        w.write_all(format!("{tag} BAD already authenticated\r\n").as_bytes()).await?;
                        continue;
                    }
                    let Some((email, rest2)) = parse_astring(rest) else {
                        w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
                        continue;
                    };
                    let Some((password, _)) = parse_astring(rest2) else {
                        w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
                        continue;
                    };
                    match self.authenticator.authenticate(&email, &password).await {
                        Ok(with_domain) => {
                            info!(user = %with_domain.email(), "imap session authenticated");
                            user_id = Some(with_domain.user.id);
                            domain_id = Some(with_domain.domain.id);
                            stage = Stage::Authenticated;
                            w.write_all(format!("{tag} OK LOGIN completed\r\n").as_bytes()).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "imap login failed");
                            w.write_all(format!("{tag} NO authentication failed\r\n").as_bytes()).await?;
                        }
                    }
                }
                "LOGOUT" => {
                    w.write_all(b"* BYE logging out\r\n").await?;
                    w.write_all(format!("{tag} OK LOGOUT completed\r\n").as_bytes()).await?;
                    return Ok(());
                }
                "LIST" => {
                    if stage == Stage::NotAuthenticated {
                        w.write_all(format!("{tag} NO authentication required\r\n").as_bytes()).await?;
                        continue;
                    }
                    let Some((reference, rest2)) = parse_astring(rest) else {
                        w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
                        continue;
                    };
                    let Some((mailbox_pattern, _)) = parse_astring(rest2) else {
                        w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
                        continue;
                    };
                    let folders = self.folder_manager.list(user_id.unwrap()).await.unwrap_or_default();
                    let full_pattern = format!("{reference}{mailbox_pattern}");
                    for folder in folders {
                        if wildcard_match(&full_pattern, &folder.name) {
                            let attrs = if folder.is_system() { "\\HasNoChildren" } else { "\\HasNoChildren" };
                            w.write_all(format!("* LIST ({attrs}) \"/\" \"{}\"\r\n", folder.name).as_bytes()).await?;
                        }
                    }
                    w.write_all(format!("{tag} OK LIST completed\r\n").as_bytes()).await?;
                }
                "SELECT" | "EXAMINE" => {
                    if stage == Stage::NotAuthenticated {
                        w.write_all(format!("{tag} NO authentication required\r\n").as_bytes()).await?;
                        continue;
                    }
                    let Some((name, _)) = parse_astring(rest) else {
                        w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
                        continue;
                    };
                    match self.select_mailbox(user_id.unwrap(), &name).await {
                        Ok((folder, entries)) => {
                            read_only = command.eq_ignore_ascii_case("EXAMINE");
                            w.write_all(format!("* {} EXISTS\r\n", folder.exists).as_bytes()).await?;
                            w.write_all(format!("* {} RECENT\r\n", folder.recent).as_bytes()).await?;
                            w.write_all(format!("* OK [UIDVALIDITY {}]\r\n", folder.uid_validity).as_bytes()).await?;
                            w.write_all(format!("* OK [UIDNEXT {}]\r\n", folder.uid_next).as_bytes()).await?;
                            w.write_all(format!("* FLAGS ({STANDARD_FLAG_NAMES})\r\n").as_bytes()).await?;
                            snapshot = entries;
                            selected_folder = Some(folder);
                            stage = Stage::Selected;
                            let mode = if read_only { "READ-ONLY" } else { "READ-WRITE" };
                            w.write_all(format!("{tag} OK [{mode}] {command} completed\r\n").as_bytes()).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "imap select failed");
                            w.write_all(format!("{tag} NO no such mailbox\r\n").as_bytes()).await?;
                        }
                    }
                }
                "CLOSE" => {
                    if stage != Stage::Selected {
                        w.write_all(format!("{tag} BAD no mailbox selected\r\n").as_bytes()).await?;
                        continue;
                    }
                    if !read_only {
                        if let Some(folder) = &selected_folder {
                            let _ = self.expunge(user_id.unwrap(), folder.id, &snapshot).await;
                        }
                    }
                    stage = Stage::Authenticated;
                    selected_folder = None;
                    snapshot.clear();
                    w.write_all(format!("{tag} OK CLOSE completed\r\n").as_bytes()).await?;
                }
                "EXPUNGE" => {
                    if stage != Stage::Selected {
                        w.write_all(format!("{tag} BAD no mailbox selected\r\n").as_bytes()).await?;
                        continue;
                    }
                    let folder_id = selected_folder.as_ref().unwrap().id;
                    match self.expunge(user_id.unwrap(), folder_id, &snapshot).await {
                        Ok(expunged_seqs) => {
                            for seq in expunged_seqs.iter().rev() {
                                w.write_all(format!("* {seq} EXPUNGE\r\n").as_bytes()).await?;
                            }
                            if let Ok((folder, entries)) = self.select_mailbox(user_id.unwrap(), &selected_folder.as_ref().unwrap().name).await {
                                selected_folder = Some(folder);
                                snapshot = entries;
                            }
                            w.write_all(format!("{tag} OK EXPUNGE completed\r\n").as_bytes()).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "imap expunge failed");
                            w.write_all(format!("{tag} NO expunge failed\r\n").as_bytes()).await?;
                        }
                    }
                }
                "FETCH" => {
                    if stage != Stage::Selected {
                        w.write_all(format!("{tag} BAD no mailbox selected\r\n").as_bytes()).await?;
                        continue;
                    }
                    self.handle_fetch(&mut w, user_id.unwrap(), tag, rest, &snapshot, false).await?;
                }
                "STORE" => {
                    if stage != Stage::Selected {
                        w.write_all(format!("{tag} BAD no mailbox selected\r\n").as_bytes()).await?;
                        continue;
                    }
                    self.handle_store(&mut w, user_id.unwrap(), tag, rest, &snapshot, false).await?;
                }
                "SEARCH" => {
                    if stage != Stage::Selected {
                        w.write_all(format!("{tag} BAD no mailbox selected\r\n").as_bytes()).await?;
                        continue;
                    }
                    self.handle_search(&mut w, user_id.unwrap(), tag, rest, &snapshot, false).await?;
                }
                "UID" => {
                    if stage != Stage::Selected {
                        w.write_all(format!("{tag} BAD no mailbox selected\r\n").as_bytes()).await?;
                        continue;
                    }
                    let (sub, sub_rest) = split_verb(rest);
                    match sub.to_ascii_uppercase().as_str() {
                        "FETCH" => self.handle_fetch(&mut w, user_id.unwrap(), tag, sub_rest, &snapshot, true).await?,
                        "STORE" => self.handle_store(&mut w, user_id.unwrap(), tag, sub_rest, &snapshot, true).await?,
                        "SEARCH" => self.handle_search(&mut w, user_id.unwrap(), tag, sub_rest, &snapshot, true).await?,
                        _ => w.write_all(format!("{tag} BAD unsupported UID subcommand\r\n").as_bytes()).await?,
                    }
                }
                "APPEND" => {
                    if stage == Stage::NotAuthenticated {
                        w.write_all(format!("{tag} NO authentication required\r\n").as_bytes()).await?;
                        continue;
                    }
                    self.handle_append(&mut r, &mut w, user_id.unwrap(), tag, rest).await?;
                }
                _ => {
                    w.write_all(format!("{tag} BAD unknown command\r\n").as_bytes()).await?;
                }
            }
        }
    }

    async fn find_folder_by_id(&self, folder_id: Id) -> Result<Option<Folder>, StoreError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        FolderRepo::find_by_id(&mut conn, folder_id).await
    }

    async fn select_mailbox(&self, user_id: Id, name: &str) -> Result<(Folder, Vec<SnapshotEntry>), StoreError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        let resolved = if name.eq_ignore_ascii_case("INBOX") { SystemFolderType::Inbox.as_str() } else { name };
        let Some(folder) = FolderRepo::find_by_name(&mut conn, user_id, resolved).await? else {
            return Err(StoreError::not_found("folder"));
        };
        let store_filter = StoreFilter::default();
        let rows = MessageRepo::list_in_folder(&mut conn, folder.id, user_id, &store_filter, SortKey::UidAsc, SNAPSHOT_LIMIT, 0).await?;
        let entries = rows
            .into_iter()
            .map(|view| SnapshotEntry { message_id: view.message.id, user_message_id: view.placement.id, uid: view.placement.uid })
            .collect();
        Ok((folder, entries))
    }

    /// Moves every `\Deleted` message in the snapshot to Trash, returning the
    /// sequence numbers that were expunged (in ascending order).
    async fn expunge(&self, user_id: Id, _folder_id: Id, snapshot: &[SnapshotEntry]) -> Result<Vec<usize>, StoreError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        let mut expunged = Vec::new();
        for (i, entry) in snapshot.iter().enumerate() {
            let flags = MessageRepo::get_flags(&mut conn, entry.message_id, user_id).await?;
            if flags.deleted {
                self.message_service
                    .delete(user_id, entry.message_id, entry.user_message_id)
                    .await
                    .map_err(|e| StoreError::Internal(e.to_string()))?;
                expunged.push(i + 1);
            }
        }
        Ok(expunged)
    }

    async fn handle_fetch<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        user_id: Id,
        tag: &str,
        rest: &str,
        snapshot: &[SnapshotEntry],
        by_uid: bool,
    ) -> std::io::Result<()> {
        let Some((set_spec, items_spec)) = split_once_ws(rest) else {
            w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
            return Ok(());
        };
        let seqs = if by_uid {
            resolve_uid_set(set_spec, snapshot)
        } else {
            parse_sequence_set(set_spec, snapshot.len())
        };
        let items: Vec<String> = strip_parens(items_spec.trim()).split_whitespace().map(|s| s.to_ascii_uppercase()).collect();

        let mut conn = match self.store.pool().acquire().await {
            Ok(c) => c,
            Err(e) => {
                w.write_all(format!("{tag} NO {e}\r\n").as_bytes()).await?;
                return Ok(());
            }
        };
        for seq in seqs {
            let Some(entry) = snapshot.get(seq - 1) else { continue };
            let Ok(Some(message)) = MessageRepo::find_by_id(&mut conn, entry.message_id).await else { continue };
            let flags = MessageRepo::get_flags(&mut conn, entry.message_id, user_id).await.unwrap_or_default();
            let rendered = render_fetch_items(&items, seq, entry.uid, &message, &flags);
            w.write_all(&rendered).await?;
        }
        w.write_all(format!("{tag} OK FETCH completed\r\n").as_bytes()).await?;
        Ok(())
    }

    async fn handle_store<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        user_id: Id,
        tag: &str,
        rest: &str,
        snapshot: &[SnapshotEntry],
        by_uid: bool,
    ) -> std::io::Result<()> {
        let Some((set_spec, after_set)) = split_once_ws(rest) else {
            w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
            return Ok(());
        };
        let Some((mode_raw, flags_raw)) = split_once_ws(after_set) else {
            w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
            return Ok(());
        };
        let mode = mode_raw.to_ascii_uppercase();
        let silent = mode.contains(".SILENT");
        let flag_names: Vec<String> = strip_parens(flags_raw.trim()).split_whitespace().map(|s| s.to_string()).collect();

        let seqs = if by_uid { resolve_uid_set(set_spec, snapshot) } else { parse_sequence_set(set_spec, snapshot.len()) };
        let mut patch = FlagPatch::default();
        let has = |wanted: &str| flag_names.iter().any(|f| f.eq_ignore_ascii_case(wanted));
        if mode.starts_with("+FLAGS") {
            if has("\\Seen") {
                patch.seen = Some(true);
            }
            if has("\\Answered") {
                patch.answered = Some(true);
            }
            if has("\\Flagged") {
                patch.flagged = Some(true);
            }
            if has("\\Deleted") {
                patch.deleted = Some(true);
            }
            if has("\\Draft") {
                patch.draft = Some(true);
            }
        } else if mode.starts_with("-FLAGS") {
            if has("\\Seen") {
                patch.seen = Some(false);
            }
            if has("\\Answered") {
                patch.answered = Some(false);
            }
            if has("\\Flagged") {
                patch.flagged = Some(false);
            }
            if has("\\Deleted") {
                patch.deleted = Some(false);
            }
            if has("\\Draft") {
                patch.draft = Some(false);
            }
        } else if mode.starts_with("FLAGS") {
            patch.seen = Some(has("\\Seen"));
            patch.answered = Some(has("\\Answered"));
            patch.flagged = Some(has("\\Flagged"));
            patch.deleted = Some(has("\\Deleted"));
            patch.draft = Some(has("\\Draft"));
        } else {
            w.write_all(format!("{tag} BAD unsupported STORE mode\r\n").as_bytes()).await?;
            return Ok(());
        }

        let mut conn = match self.store.pool().acquire().await {
            Ok(c) => c,
            Err(e) => {
                w.write_all(format!("{tag} NO {e}\r\n").as_bytes()).await?;
                return Ok(());
            }
        };
        for seq in seqs {
            let Some(entry) = snapshot.get(seq - 1) else { continue };
            if let Err(e) = self.message_service.update_flags(user_id, entry.message_id, &patch).await {
                warn!(error = %e, "imap store failed");
                continue;
            }
            if !silent {
                let flags = MessageRepo::get_flags(&mut conn, entry.message_id, user_id).await.unwrap_or_default();
                w.write_all(format!("* {seq} FETCH (FLAGS ({}))\r\n", render_flag_list(&flags)).as_bytes()).await?;
            }
        }
        w.write_all(format!("{tag} OK STORE completed\r\n").as_bytes()).await?;
        Ok(())
    }

    async fn handle_search<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        user_id: Id,
        tag: &str,
        rest: &str,
        snapshot: &[SnapshotEntry],
        by_uid: bool,
    ) -> std::io::Result<()> {
        let criteria: Vec<String> = rest.split_whitespace().map(|s| s.to_ascii_uppercase()).collect();
        let mut conn = match self.store.pool().acquire().await {
            Ok(c) => c,
            Err(e) => {
                w.write_all(format!("{tag} NO {e}\r\n").as_bytes()).await?;
                return Ok(());
            }
        };
        let mut matches = Vec::new();
        for (i, entry) in snapshot.iter().enumerate() {
            let flags = MessageRepo::get_flags(&mut conn, entry.message_id, user_id).await.unwrap_or_default();
            if criteria.iter().all(|c| matches_criterion(c, &flags)) {
                matches.push(if by_uid { entry.uid } else { (i + 1) as i64 });
            }
        }
        let rendered = matches.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        w.write_all(format!("* SEARCH {rendered}\r\n").as_bytes()).await?;
        w.write_all(format!("{tag} OK SEARCH completed\r\n").as_bytes()).await?;
        Ok(())
    }

    async fn handle_append<R, W>(&self, r: &mut BufReader<R>, w: &mut W, user_id: Id, tag: &str, rest: &str) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some((mailbox, rest2)) = parse_astring(rest) else {
            w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
            return Ok(());
        };
        let rest2 = rest2.trim();
        let (flags_raw, literal_spec) = if let Some(stripped) = rest2.strip_prefix('(') {
            let Some(end) = stripped.find(')') else {
                w.write_all(format!("{tag} BAD syntax error\r\n").as_bytes()).await?;
                return Ok(());
            };
            (stripped[..end].to_string(), stripped[end + 1..].trim())
        } else {
            (String::new(), rest2)
        };
        let Some(len) = literal_spec.trim().strip_prefix('{').and_then(|s| s.strip_suffix('}')).and_then(|s| s.parse::<usize>().ok()) else {
            w.write_all(format!("{tag} BAD expected literal\r\n").as_bytes()).await?;
            return Ok(());
        };

        w.write_all(b"+ Ready for literal data\r\n").await?;
        let mut raw = vec![0u8; len];
        r.read_exact(&mut raw).await?;
        let mut trailer = String::new();
        r.read_line(&mut trailer).await?;

        let flag_names: Vec<String> = flags_raw.split_whitespace().map(|s| s.to_string()).collect();
        match self.append_message(user_id, &mailbox, &raw, &flag_names).await {
            Ok((uid_validity, uid)) => {
                w.write_all(format!("{tag} OK [APPENDUID {uid_validity} {uid}] APPEND completed\r\n").as_bytes()).await?;
            }
            Err(e) => {
                warn!(error = %e, "imap append failed");
                w.write_all(format!("{tag} NO append failed\r\n").as_bytes()).await?;
            }
        }
        Ok(())
    }

    /// Parses `raw` as an RFC 5322 message and inserts it directly into
    /// `mailbox`, the way `DeliveryEngine` inserts into INBOX, but targeting
    /// an arbitrary destination folder and honoring the client-supplied flags.
    async fn append_message(&self, user_id: Id, mailbox: &str, raw: &[u8], flag_names: &[String]) -> Result<(i64, i64), StoreError> {
        let envelope_headers = parse_envelope(raw).map_err(|e| StoreError::Internal(e.to_string()))?;
        let (body_plain, body_html, _attachments) = extract_structured_body(raw).map_err(|e| StoreError::Internal(e.to_string()))?;
        let headers_block = extract_headers_block(raw);
        let message_id_header = envelope_headers
            .message_id
            .as_ref()
            .map(|id| format!("<{}@{}>", id.get_local_part(), id.get_domain()))
            .unwrap_or_else(|| crate::message_id::generate_header_message_id("localhost"));
        let subject = envelope_headers.subject.clone();
        let from_addr = envelope_headers.from.first().map(|a| a.address()).unwrap_or_default();
        let to_header = envelope_headers.to.iter().map(|a| a.address()).collect::<Vec<_>>().join(", ");
        let sent_date = envelope_headers.date.map(|d| d.with_timezone(&chrono::Utc));
        let message_size = raw.len() as i64;
        let mailbox = mailbox.to_string();
        let flag_names = flag_names.to_vec();

        self.store
            .with_tx(move |tx| {
                let headers_block = headers_block.clone();
                let message_id_header = message_id_header.clone();
                let subject = subject.clone();
                let from_addr = from_addr.clone();
                let to_header = to_header.clone();
                let mailbox = mailbox.clone();
                let flag_names = flag_names.clone();
                let body_plain = body_plain.clone();
                let body_html = body_html.clone();
                Box::pin(async move {
                    let resolved = if mailbox.eq_ignore_ascii_case("INBOX") { SystemFolderType::Inbox.as_str() } else { mailbox.as_str() };
                    let Some(folder) = FolderRepo::find_by_name(tx, user_id, resolved).await? else {
                        return Err(StoreError::not_found("folder"));
                    };
                    let uid = FolderRepo::allocate_uid(tx, folder.id).await?;
                    let new_message = NewMessage {
                        header_message_id: &message_id_header,
                        from_addr: &from_addr,
                        to_addr: Some(&to_header),
                        cc: None,
                        bcc: None,
                        subject: subject.as_deref(),
                        headers: &headers_block,
                        body: body_plain.as_deref(),
                        body_html: body_html.as_deref(),
                        message_size,
                        sent_date,
                        in_reply_to: None,
                        references: None,
                        body_structure: serde_json::json!({"hasHtml": body_html.is_some(), "hasText": body_plain.is_some()}),
                        envelope: serde_json::json!({"from": from_addr, "to": to_header}),
                    };
                    let message = MessageRepo::insert(tx, new_message, uid, folder.uid_validity).await?;
                    MessageRepo::place(tx, message.id, user_id, folder.id, uid).await?;
                    for name in &flag_names {
                        MessageRepo::set_flag(tx, message.id, user_id, name, true).await?;
                    }
                    FolderRepo::adjust_counters(tx, folder.id, 1, 1, if flag_names.iter().any(|f| f.eq_ignore_ascii_case("\\Seen")) { 0 } else { 1 }).await?;
                    Ok((folder.uid_validity, uid))
                })
            })
            .await
    }
}

fn render_flag_list(flags: &MessageFlags) -> String {
    let mut names = Vec::new();
    if flags.seen {
        names.push("\\Seen");
    }
    if flags.answered {
        names.push("\\Answered");
    }
    if flags.flagged {
        names.push("\\Flagged");
    }
    if flags.deleted {
        names.push("\\Deleted");
    }
    if flags.draft {
        names.push("\\Draft");
    }
    if flags.recent {
        names.push("\\Recent");
    }
    let mut all: Vec<String> = names.into_iter().map(String::from).collect();
    all.extend(flags.custom.iter().cloned());
    all.join(" ")
}

fn render_fetch_items(items: &[String], seq: usize, uid: i64, message: &Message, flags: &MessageFlags) -> Vec<u8> {
    let mut parts = Vec::new();
    let mut trailing_literal: Option<Vec<u8>> = None;
    for item in items {
        match item.as_str() {
            "FLAGS" => parts.push(format!("FLAGS ({})", render_flag_list(flags))),
            "UID" => parts.push(format!("UID {uid}")),
            "RFC822.SIZE" => parts.push(format!("RFC822.SIZE {}", message.message_size)),
            "RFC822" | "BODY[]" | "BODY.PEEK[]" => {
                let full = format!("{}\r\n{}", message.headers, message.body.as_deref().unwrap_or(""));
                let bytes = full.into_bytes();
                parts.push(format!("RFC822 {{{}}}", bytes.len()));
                trailing_literal = Some(bytes);
            }
            _ => {}
        }
    }
    let mut out = format!("* {seq} FETCH ({})", parts.join(" ")).into_bytes();
    if let Some(literal) = trailing_literal {
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&literal);
    }
    out.extend_from_slice(b")\r\n");
    out
}

fn matches_criterion(criterion: &str, flags: &MessageFlags) -> bool {
    match criterion {
        "ALL" => true,
        "SEEN" => flags.seen,
        "UNSEEN" => !flags.seen,
        "ANSWERED" => flags.answered,
        "UNANSWERED" => !flags.answered,
        "FLAGGED" => flags.flagged,
        "UNFLAGGED" => !flags.flagged,
        "DELETED" => flags.deleted,
        "UNDELETED" => !flags.deleted,
        "DRAFT" => flags.draft,
        "UNDRAFT" => !flags.draft,
        _ => true,
    }
}

/// Splits `"tag COMMAND rest-of-line"`.
fn split_tagged(line: &str) -> (&str, &str, &str) {
    let mut parts = line.splitn(3, char::is_whitespace);
    let tag = parts.next().unwrap_or("*");
    let rest_after_tag = &line[tag.len()..].trim_start();
    let (command, rest) = split_verb(rest_after_tag);
    (tag, command, rest)
}

fn split_verb(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    }
}

fn split_once_ws(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    let i = s.find(char::is_whitespace)?;
    Some((&s[..i], s[i..].trim_start()))
}

/// Parses an IMAP "astring": a quoted string (surrounding `"` stripped) or a
/// bare atom, returning the value and the remaining unparsed text.
fn parse_astring(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    if let Some(rest) = s.strip_prefix('"') {
        let end = rest.find('"')?;
        Some((rest[..end].to_string(), &rest[end + 1..]))
    } else {
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        if end == 0 {
            return None;
        }
        Some((s[..end].to_string(), &s[end..]))
    }
}

fn strip_parens(s: &str) -> &str {
    s.strip_prefix('(').and_then(|s| s.strip_suffix(')')).unwrap_or(s)
}

/// `%` matches any run of characters except the folder delimiter `/`; `*`
/// matches any run of characters including `/`.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    fn is_match(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => (0..=n.len()).any(|i| is_match(&p[1..], &n[i..])),
            Some(b'%') => (0..=n.len()).filter(|&i| !n[..i].contains(&b'/')).any(|i| is_match(&p[1..], &n[i..])),
            Some(c) => !n.is_empty() && n[0] == *c && is_match(&p[1..], &n[1..]),
        }
    }
    is_match(pattern.as_bytes(), name.as_bytes())
}

/// Parses a sequence-set spec (`"2"`, `"2:4"`, `"2,5,7"`, `"3:*"`) into
/// 1-based sequence numbers clamped to `[1, len]`.
fn parse_sequence_set(spec: &str, len: usize) -> Vec<usize> {
    let mut out = Vec::new();
    for part in spec.split(',') {
        if let Some((lo, hi)) = part.split_once(':') {
            let lo: usize = lo.parse().unwrap_or(1);
            let hi = if hi == "*" { len } else { hi.parse().unwrap_or(len) };
            for n in lo.min(hi)..=lo.max(hi).min(len) {
                if n >= 1 {
                    out.push(n);
                }
            }
        } else if part == "*" {
            if len > 0 {
                out.push(len);
            }
        } else if let Ok(n) = part.parse::<usize>() {
            if n >= 1 && n <= len {
                out.push(n);
            }
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Resolves a UID-based sequence-set spec against the snapshot's UIDs,
/// returning matching 1-based sequence numbers.
fn resolve_uid_set(spec: &str, snapshot: &[SnapshotEntry]) -> Vec<usize> {
    let mut wanted_ranges: Vec<(i64, i64)> = Vec::new();
    for part in spec.split(',') {
        if let Some((lo, hi)) = part.split_once(':') {
            let lo: i64 = lo.parse().unwrap_or(0);
            let hi = if hi == "*" { i64::MAX } else { hi.parse().unwrap_or(i64::MAX) };
            wanted_ranges.push((lo.min(hi), lo.max(hi)));
        } else if part == "*" {
            wanted_ranges.push((i64::MAX, i64::MAX));
        } else if let Ok(n) = part.parse::<i64>() {
            wanted_ranges.push((n, n));
        }
    }
    let max_uid = snapshot.last().map(|e| e.uid).unwrap_or(0);
    let mut out = Vec::new();
    for (i, entry) in snapshot.iter().enumerate() {
        let hit = wanted_ranges.iter().any(|&(lo, hi)| {
            let hi = if hi == i64::MAX { max_uid } else { hi };
            let lo = if lo == i64::MAX { max_uid } else { lo };
            entry.uid >= lo && entry.uid <= hi
        });
        if hit {
            out.push(i + 1);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_percent_stops_at_delimiter() {
        assert!(wildcard_match("%", "INBOX"));
        assert!(!wildcard_match("%", "Work/Archive"));
        assert!(wildcard_match("Work/%", "Work/Archive"));
    }

    #[test]
    fn wildcard_star_matches_any_depth() {
        assert!(wildcard_match("*", "Work/Archive/2020"));
    }

    #[test]
    fn sequence_set_parses_ranges_and_lists() {
        assert_eq!(parse_sequence_set("1,3:5", 10), vec![1, 3, 4, 5]);
        assert_eq!(parse_sequence_set("8:*", 10), vec![8, 9, 10]);
    }

    #[test]
    fn astring_strips_quotes() {
        let (value, rest) = parse_astring("\"alice@local.test\" \"pw\"").unwrap();
        assert_eq!(value, "alice@local.test");
        assert_eq!(rest.trim(), "\"pw\"");
    }
}
