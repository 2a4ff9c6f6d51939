/*
 * delivery.rs
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

//! DeliveryEngine: parses a raw RFC 5322 message once and fans it out to
//! every recipient's INBOX (§4.G).

use crate::mime::body_extract::extract_structured_body;
use crate::mime::rfc5322::parse_envelope;
use crate::store::{FolderRepo, MessageRepo, NewMessage, Store, StoreError, SystemFolderType, UserRepo};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-recipient outcome; a delivery attempt never aborts the whole batch on
/// one bad address (§4.G step 3: overall success if any recipient succeeded).
#[derive(Debug)]
pub enum RecipientOutcome {
    Delivered,
    UnknownRecipient,
    CannotReceive,
}

pub struct DeliveryReport {
    pub results: Vec<(String, RecipientOutcome)>,
}

impl DeliveryReport {
    pub fn any_succeeded(&self) -> bool {
        self.results.iter().any(|(_, o)| matches!(o, RecipientOutcome::Delivered))
    }
}

pub struct DeliveryEngine {
    store: Arc<Store>,
}

impl DeliveryEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Delivers `raw_message` (full RFC 5322 bytes, already un-dot-stuffed)
    /// from `from_addr` to each address in `recipients`.
    pub async fn deliver(&self, from_addr: &str, recipients: &[String], raw_message: &[u8]) -> Result<DeliveryReport, StoreError> {
        let envelope_headers = parse_envelope(raw_message).map_err(|e| StoreError::Internal(e.to_string()))?;
        let (body_plain, body_html, _attachments) =
            extract_structured_body(raw_message).map_err(|e| StoreError::Internal(e.to_string()))?;
        let headers_block = extract_headers_block(raw_message);
        let subject = envelope_headers.subject.clone();
        let message_id_header = envelope_headers
            .message_id
            .as_ref()
            .map(|id| format!("<{}@{}>", id.get_local_part(), id.get_domain()))
            .unwrap_or_else(|| crate::message_id::generate_header_message_id("localhost"));
        let sent_date = envelope_headers.date.map(|d| d.with_timezone(&chrono::Utc));
        let to_header = envelope_headers.to.iter().map(|a| a.address()).collect::<Vec<_>>().join(", ");
        let cc_header = envelope_headers.cc.iter().map(|a| a.address()).collect::<Vec<_>>().join(", ");
        let message_size = raw_message.len() as i64;

        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let outcome = self
                .deliver_one(
                    from_addr,
                    recipient,
                    &headers_block,
                    &message_id_header,
                    subject.as_deref(),
                    body_plain.as_deref(),
                    body_html.as_deref(),
                    sent_date,
                    &to_header,
                    if cc_header.is_empty() { None } else { Some(cc_header.as_str()) },
                    message_size,
                )
                .await?;
            results.push((recipient.clone(), outcome));
        }
        Ok(DeliveryReport { results })
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_one(
        &self,
        from_addr: &str,
        recipient: &str,
        headers_block: &str,
        message_id_header: &str,
        subject: Option<&str>,
        body: Option<&str>,
        body_html: Option<&str>,
        sent_date: Option<chrono::DateTime<chrono::Utc>>,
        to_header: &str,
        cc_header: Option<&str>,
        message_size: i64,
    ) -> Result<RecipientOutcome, StoreError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        let Some(with_domain) = UserRepo::find_user_with_domain_by_email(&mut conn, recipient).await? else {
            warn!(recipient, "delivery attempted for unknown recipient");
            return Ok(RecipientOutcome::UnknownRecipient);
        };
        if !with_domain.user.can_receive {
            return Ok(RecipientOutcome::CannotReceive);
        }
        let user_id = with_domain.user.id;
        let from_addr = from_addr.to_string();
        let recipient = recipient.to_string();
        let headers_block = headers_block.to_string();
        let message_id_header = message_id_header.to_string();
        let subject = subject.map(|s| s.to_string());
        let body = body.map(|s| s.to_string());
        let body_html = body_html.map(|s| s.to_string());
        let to_header = to_header.to_string();
        let cc_header = cc_header.map(|s| s.to_string());

        self.store
            .with_tx(move |tx| {
                let from_addr = from_addr.clone();
                let recipient = recipient.clone();
                let headers_block = headers_block.clone();
                let message_id_header = message_id_header.clone();
                let subject = subject.clone();
                let body = body.clone();
                let body_html = body_html.clone();
                let to_header = to_header.clone();
                let cc_header = cc_header.clone();
                Box::pin(async move {
                    let Some(inbox) = FolderRepo::find_system(tx, user_id, SystemFolderType::Inbox).await? else {
                        // invariant 3: every user has an INBOX; its absence is internal, not a per-recipient failure.
                        return Err(StoreError::Internal(format!("user {user_id} has no INBOX")));
                    };
                    let uid = FolderRepo::allocate_uid(tx, inbox.id).await?;
                    let new_message = NewMessage {
                        header_message_id: &message_id_header,
                        from_addr: &from_addr,
                        to_addr: Some(&to_header),
                        cc: cc_header.as_deref(),
                        bcc: None,
                        subject: subject.as_deref(),
                        headers: &headers_block,
                        body: body.as_deref(),
                        body_html: body_html.as_deref(),
                        message_size,
                        sent_date,
                        in_reply_to: None,
                        references: None,
                        body_structure: serde_json::json!({"hasHtml": body_html.is_some(), "hasText": body.is_some()}),
                        envelope: serde_json::json!({"from": from_addr, "to": recipient}),
                    };
                    let message = MessageRepo::insert(tx, new_message, uid, inbox.uid_validity).await?;
                    MessageRepo::place(tx, message.id, user_id, inbox.id, uid).await?;
                    MessageRepo::set_flag(tx, message.id, user_id, "\\Recent", true).await?;
                    FolderRepo::adjust_counters(tx, inbox.id, 1, 1, 1).await?;
                    Ok(())
                })
            })
            .await?;
        info!(recipient = %recipient, "message delivered");
        Ok(RecipientOutcome::Delivered)
    }
}

/// Takes source lines up to the first blank line and normalizes to CRLF,
/// per §4.G's headers-block extraction rule.
pub(crate) fn extract_headers_block(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut block = String::new();
    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if line.is_empty() {
            break;
        }
        block.push_str(line);
        block.push_str("\r\n");
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_block_stops_at_blank_line() {
        let raw = b"From: a@b\r\nTo: c@d\r\n\r\nBody here\r\nMore body";
        let block = extract_headers_block(raw);
        assert_eq!(block, "From: a@b\r\nTo: c@d\r\n");
    }
}
