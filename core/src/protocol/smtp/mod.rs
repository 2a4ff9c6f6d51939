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

//! SMTP session state machine (§4.H.1): `Greeting → Identified → (MailFrom)
//! → RcptTo+ → Data → Identified`.

pub mod dot_stuffer;

use crate::auth::Authenticator;
use crate::delivery::DeliveryEngine;
use crate::sasl::{base64_decode, parse_plain_credentials};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// §4.H idle read timeout: 5 minutes for SMTP.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Envelope state collected between `MAIL FROM` and `DATA`; absent fields
/// mean the corresponding command hasn't been seen yet (the `Identified`
/// vs. `MailFrom` vs. `RcptTo` states of §4.H.1 are just this struct's
/// emptiness at any given point).
#[derive(Debug, Default)]
struct Envelope {
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

impl Envelope {
    fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }
}

pub struct SmtpSession {
    hostname: String,
    authenticator: Arc<Authenticator>,
    delivery: Arc<DeliveryEngine>,
}

impl SmtpSession {
    pub fn new(hostname: impl Into<String>, authenticator: Arc<Authenticator>, delivery: Arc<DeliveryEngine>) -> Self {
        Self { hostname: hostname.into(), authenticator, delivery }
    }

    /// Drives one connection to completion; returns once the client sends
    /// `QUIT`, disconnects, or a fatal I/O error occurs.
    pub async fn run<S>(&self, socket: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(socket);
        let mut reader = BufReader::new(read_half);
        write_half
            .write_all(format!("220 {} ESMTP ready\r\n", self.hostname).as_bytes())
            .await?;

        let mut identified = false;
        let mut authenticated = false;
        let mut envelope = Envelope::default();
        let mut line = String::new();

        loop {
            line.clear();
            let n = match tokio::time::timeout(IDLE_TIMEOUT, reader.read_line(&mut line)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("smtp session idle timeout exceeded");
                    let _ = write_half.write_all(b"421 4.4.2 idle timeout exceeded, closing connection\r\n").await;
                    return Ok(());
                }
            };
            if n == 0 {
                info!("smtp client disconnected without QUIT");
                return Ok(());
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            debug!(command = %trimmed, "smtp command");
            let (verb, rest) = split_verb(trimmed);

            match verb.to_ascii_uppercase().as_str() {
                "HELO" => {
                    identified = true;
                    envelope.reset();
                    write_half.write_all(format!("250 {} Hello\r\n", self.hostname).as_bytes()).await?;
                }
                "EHLO" => {
                    identified = true;
                    envelope.reset();
                    let banner = format!(
                        "250-{host} Hello\r\n250-AUTH PLAIN LOGIN\r\n250-8BITMIME\r\n250 ENHANCEDSTATUSCODES\r\n",
                        host = self.hostname,
                    );
                    write_half.write_all(banner.as_bytes()).await?;
                }
                "AUTH" => {
                    authenticated = self.handle_auth(rest, &mut reader, &mut write_half).await?;
                }
                "MAIL" => {
                    if !identified {
                        write_half.write_all(b"503 Bad sequence of commands\r\n").await?;
                        continue;
                    }
                    match parse_addr_arg(rest, "FROM") {
                        Some(addr) => {
                            envelope.reset();
                            envelope.mail_from = Some(addr);
                            write_half.write_all(b"250 OK\r\n").await?;
                        }
                        None => write_half.write_all(b"500 Syntax error\r\n").await?,
                    }
                }
                "RCPT" => {
                    if envelope.mail_from.is_none() {
                        write_half.write_all(b"503 Bad sequence of commands\r\n").await?;
                        continue;
                    }
                    match parse_addr_arg(rest, "TO") {
                        Some(addr) => {
                            envelope.rcpt_to.push(addr);
                            write_half.write_all(b"250 OK\r\n").await?;
                        }
                        None => write_half.write_all(b"500 Syntax error\r\n").await?,
                    }
                }
                "DATA" => {
                    if envelope.mail_from.is_none() || envelope.rcpt_to.is_empty() {
                        write_half.write_all(b"503 Bad sequence of commands\r\n").await?;
                        continue;
                    }
                    write_half.write_all(b"354 Start mail input; end with <CRLF>.<CRLF>\r\n").await?;
                    let raw = read_data(&mut reader).await?;
                    let from = envelope.mail_from.clone().unwrap_or_default();
                    let report = self.delivery.deliver(&from, &envelope.rcpt_to, &raw).await;
                    match report {
                        Ok(report) if report.any_succeeded() => {
                            write_half.write_all(b"250 OK\r\n").await?;
                        }
                        Ok(_) => {
                            write_half.write_all(b"550 Mailbox unavailable\r\n").await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "delivery failed");
                            write_half.write_all(b"451 Requested action aborted: local error\r\n").await?;
                        }
                    }
                    envelope.reset();
                }
                "NOOP" => {
                    write_half.write_all(b"250 OK\r\n").await?;
                }
                "RSET" => {
                    envelope.reset();
                    write_half.write_all(b"250 OK\r\n").await?;
                }
                "HELP" => {
                    write_half
                        .write_all(b"214-Commands supported:\r\n214 HELO EHLO AUTH MAIL RCPT DATA NOOP RSET QUIT HELP\r\n")
                        .await?;
                }
                "QUIT" => {
                    write_half.write_all(b"221 Bye\r\n").await?;
                    return Ok(());
                }
                "" => {
                    write_half.write_all(b"500 Syntax error\r\n").await?;
                }
                _ => {
                    let _ = authenticated;
                    write_half.write_all(b"500 Syntax error, command unrecognized\r\n").await?;
                }
            }
        }
    }

    /// `AUTH PLAIN <base64>` / `AUTH PLAIN` (challenge-response) / `AUTH LOGIN`.
    async fn handle_auth<R, W>(&self, rest: &str, reader: &mut BufReader<R>, writer: &mut W) -> std::io::Result<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg = parts.next().map(str::trim);

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let response = match arg {
                    Some(initial) => initial.to_string(),
                    None => {
                        writer.write_all(b"334 \r\n").await?;
                        read_challenge_response(reader).await?
                    }
                };
                base64_decode(response.as_bytes()).ok().and_then(|bytes| parse_plain_credentials(&bytes).ok())
            }
            "LOGIN" => {
                writer.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
                let user_b64 = read_challenge_response(reader).await?;
                writer.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
                let pass_b64 = read_challenge_response(reader).await?;
                let user = base64_decode(user_b64.as_bytes()).ok().and_then(|b| String::from_utf8(b).ok());
                let pass = base64_decode(pass_b64.as_bytes()).ok().and_then(|b| String::from_utf8(b).ok());
                user.zip(pass).map(|(u, p)| (String::new(), u, p))
            }
            _ => None,
        };

        let Some((_, username, password)) = credentials else {
            writer.write_all(b"535 Authentication failed\r\n").await?;
            return Ok(false);
        };
        match self.authenticator.authenticate(&username, &password).await {
            Ok(_) => {
                writer.write_all(b"235 Authentication successful\r\n").await?;
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "smtp auth failed");
                writer.write_all(b"535 Authentication failed\r\n").await?;
                Ok(false)
            }
        }
    }
}

async fn read_challenge_response<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> std::io::Result<String> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Splits `"VERB rest-of-line"` into `(verb, rest)`.
fn split_verb(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    }
}

/// Parses `"FROM:<addr>"` / `"TO:<addr>"`-shaped RCPT/MAIL arguments,
/// tolerating missing angle brackets and trailing ESMTP parameters.
fn parse_addr_arg(rest: &str, keyword: &str) -> Option<String> {
    let rest = rest.strip_prefix(keyword)?.trim_start();
    let rest = rest.strip_prefix(':')?;
    let rest = rest.split_whitespace().next().unwrap_or("").trim();
    let addr = rest.strip_prefix('<').and_then(|s| s.strip_suffix('>')).unwrap_or(rest);
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_string())
    }
}

/// Reads `DATA` lines until a line containing only `.`, reversing
/// dot-stuffing (`..` at line start becomes `.`) and normalizing to CRLF.
async fn read_data<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "." {
            break;
        }
        let unstuffed = trimmed.strip_prefix("..").map(|rest| format!(".{rest}"));
        out.extend_from_slice(unstuffed.as_deref().unwrap_or(trimmed).as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mail_from_with_brackets() {
        assert_eq!(parse_addr_arg("FROM:<a@b.com>", "FROM").as_deref(), Some("a@b.com"));
    }

    #[test]
    fn parses_rcpt_to_with_params() {
        assert_eq!(parse_addr_arg("TO:<a@b.com> SIZE=100", "TO").as_deref(), Some("a@b.com"));
    }

    #[test]
    fn rejects_wrong_keyword() {
        assert_eq!(parse_addr_arg("TO:<a@b.com>", "FROM"), None);
    }
}
