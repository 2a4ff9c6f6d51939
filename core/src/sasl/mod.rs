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

//! Server-side SASL: just enough to authenticate an AUTH PLAIN exchange
//! over SMTP/IMAP/POP3 (§4.H). No STARTTLS, so PLAIN is the only mechanism
//! offered; the session layer is responsible for deciding whether to accept
//! it over a plaintext connection.

mod plain;

pub use plain::{base64_decode, parse_plain_credentials};

#[derive(Debug)]
pub struct SaslError {
    pub message: String,
}

impl SaslError {
    pub fn invalid(msg: &str) -> Self {
        Self { message: msg.to_string() }
    }

    pub fn plain_invalid() -> Self {
        Self::invalid("invalid PLAIN credentials format")
    }
}

impl std::fmt::Display for SaslError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SaslError {}
