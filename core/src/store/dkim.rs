/*
 * dkim.rs
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

//! DKIM key repository functions. A domain may have at most one active key
//! per selector; rotating a selector deactivates the old row rather than
//! deleting it, so historical signatures stay verifiable against it.

use super::error::StoreError;
use super::models::{DkimKey, Id};
use chrono::Utc;
use sqlx::{Sqlite, SqliteConnection};

pub struct DkimRepo;

impl DkimRepo {
    pub async fn find_active(
        exec: &mut SqliteConnection,
        domain_id: Id,
        selector: &str,
    ) -> Result<Option<DkimKey>, StoreError> {
        sqlx::query_as::<Sqlite, DkimKey>(
            "SELECT * FROM dkim_keys WHERE domain_id = ? AND selector = ? AND is_active = 1",
        )
        .bind(domain_id)
        .bind(selector)
        .fetch_optional(exec)
        .await
        .map_err(StoreError::from)
    }

    pub async fn list_for_domain(
        exec: &mut SqliteConnection,
        domain_id: Id,
    ) -> Result<Vec<DkimKey>, StoreError> {
        sqlx::query_as::<Sqlite, DkimKey>("SELECT * FROM dkim_keys WHERE domain_id = ? ORDER BY created_at DESC")
            .bind(domain_id)
            .fetch_all(exec)
            .await
            .map_err(StoreError::from)
    }

    /// Deactivates any existing active key for `(domain_id, selector)` and
    /// inserts the new keypair in its place, within the same transaction.
    pub async fn rotate(
        exec: &mut SqliteConnection,
        domain_id: Id,
        selector: &str,
        private_key_pem: &str,
        public_key_b64: &str,
    ) -> Result<DkimKey, StoreError> {
        sqlx::query("UPDATE dkim_keys SET is_active = 0 WHERE domain_id = ? AND selector = ? AND is_active = 1")
            .bind(domain_id)
            .bind(selector)
            .execute(&mut *exec)
            .await?;
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO dkim_keys (domain_id, selector, private_key, public_key, is_active, created_at)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(domain_id)
        .bind(selector)
        .bind(private_key_pem)
        .bind(public_key_b64)
        .bind(now)
        .execute(&mut *exec)
        .await?
        .last_insert_rowid();
        sqlx::query_as::<Sqlite, DkimKey>("SELECT * FROM dkim_keys WHERE id = ?")
            .bind(id)
            .fetch_one(exec)
            .await
            .map_err(StoreError::from)
    }
}
