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

//! Store: transactional SQLite persistence for domains, users, folders,
//! messages, flags, attachments, and DKIM keys (§4.A).

mod dkim;
mod error;
mod folders;
mod messages;
pub mod models;
mod users;

pub use dkim::DkimRepo;
pub use error::StoreError;
pub use folders::FolderRepo;
pub use messages::{MessageFilter, MessageRepo, NewMessage, SortKey};
pub use models::*;
pub use users::UserRepo;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

/// Owns the connection pool and embedded migrations; the single entry point
/// other components use to reach persistence. All multi-row updates go
/// through `with_tx`.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect using a `sqlite:` connection string (e.g. `sqlite:///var/lib/mail/mail.db`
    /// or `sqlite::memory:` for a single-connection test) and run embedded migrations.
    pub async fn connect(connection_string: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            // SQLite is single-writer; under concurrent deliveries a second
            // writer blocks on "database is locked" instead of failing
            // outright as long as it clears within this window (§5).
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;
        sqlx::migrate!("migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `f` inside one SQLite transaction; commits on `Ok`, rolls back on `Err`.
    /// Used for every multi-row update in §4.E/§4.F/§4.G so that the counters
    /// and the rows that caused them change atomically (§5).
    pub async fn with_tx<F, Fut, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Transaction<'_, Sqlite>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}
