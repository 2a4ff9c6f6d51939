/*
 * lib.rs
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

//! mailcore: Store, authentication, mailbox and message services, MIME
//! parsing, and the SMTP/IMAP/POP3 protocol sessions that sit on top of them.

pub mod auth;
pub mod clock;
pub mod delivery;
pub mod dkim;
pub mod folder_manager;
pub mod message_id;
pub mod message_service;
pub mod mime;
pub mod protocol;
pub mod sasl;
pub mod store;
pub mod user_directory;

pub use auth::{AuthError, Authenticator, JwtCodec, RefreshTokenStore};
pub use clock::{Clock, FixedClock, SystemClock};
pub use delivery::{DeliveryEngine, DeliveryReport, RecipientOutcome};
pub use dkim::{DkimError, DkimManager};
pub use folder_manager::{FolderError, FolderManager};
pub use message_service::{MessageError, MessageService};
pub use store::{Store, StoreError};
pub use user_directory::{DirectoryError, UserDirectory};
