/*
 * message_id.rs
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

//! Generates RFC 5322 `Message-ID` header values for locally composed
//! messages (drafts with no client-supplied id; DeliveryEngine falls back
//! to this when a submitted message lacks one).

use uuid::Uuid;

/// Builds `<uuid@domain>` in the angle-bracket form RFC 5322 §3.6.4 requires.
pub fn generate_header_message_id(domain: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_bracketed_and_domain_qualified() {
        let id = generate_header_message_id("example.com");
        assert!(id.starts_with('<'));
        assert!(id.ends_with('>'));
        assert!(id.contains("@example.com"));
    }
}
