/*
 * folders.rs
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

//! Folder repository functions (§4.E). `uid_next`/`uid_validity` live here
//! because Folder is their owner (§9 open-question resolution).

use super::error::StoreError;
use super::models::{Folder, Id, SystemFolderType};
use super::users::UserRepo;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

pub struct FolderRepo;

fn row_to_folder(row: &SqliteRow) -> Result<Folder, StoreError> {
    let system_type: Option<String> = row.try_get("system_type").map_err(|e| StoreError::Internal(e.to_string()))?;
    let delimiter: String = row.try_get("delimiter").map_err(|e| StoreError::Internal(e.to_string()))?;
    let attributes: Option<String> = row.try_get("attributes").map_err(|e| StoreError::Internal(e.to_string()))?;
    Ok(Folder {
        id: row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?,
        user_id: row.try_get("user_id").map_err(|e| StoreError::Internal(e.to_string()))?,
        name: row.try_get("name").map_err(|e| StoreError::Internal(e.to_string()))?,
        delimiter: delimiter.chars().next().unwrap_or('/'),
        system_type: system_type.as_deref().and_then(SystemFolderType::from_str),
        attributes: attributes
            .map(|s| s.split(',').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
            .unwrap_or_default(),
        uid_next: row.try_get("uid_next").map_err(|e| StoreError::Internal(e.to_string()))?,
        uid_validity: row.try_get("uid_validity").map_err(|e| StoreError::Internal(e.to_string()))?,
        exists: row.try_get("exists_count").map_err(|e| StoreError::Internal(e.to_string()))?,
        recent: row.try_get("recent").map_err(|e| StoreError::Internal(e.to_string()))?,
        unseen: row.try_get("unseen").map_err(|e| StoreError::Internal(e.to_string()))?,
        subscribed: row.try_get("subscribed").map_err(|e| StoreError::Internal(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Internal(e.to_string()))?,
    })
}

impl FolderRepo {
    /// Mints a fresh UIDVALIDITY: current Unix-seconds masked to 31 bits,
    /// bumped forward by the domain's monotonic sequence if two folders are
    /// (re)created within the same second (invariant 1 must hold even then).
    pub async fn mint_uid_validity(
        exec: &mut SqliteConnection,
        domain_id: Id,
    ) -> Result<i64, StoreError> {
        let now_masked = (Utc::now().timestamp() & 0x7FFF_FFFF).max(1);
        let seq = UserRepo::next_uid_validity(exec, domain_id).await?;
        Ok(now_masked.max(seq))
    }

    pub async fn find_by_id(
        exec: &mut SqliteConnection,
        id: Id,
    ) -> Result<Option<Folder>, StoreError> {
        let row = sqlx::query("SELECT * FROM folders WHERE id = ?")
            .bind(id)
            .fetch_optional(exec)
            .await?;
        row.as_ref().map(row_to_folder).transpose()
    }

    pub async fn find_by_name(
        exec: &mut SqliteConnection,
        user_id: Id,
        name: &str,
    ) -> Result<Option<Folder>, StoreError> {
        let row = sqlx::query("SELECT * FROM folders WHERE user_id = ? AND name = ?")
            .bind(user_id)
            .bind(name)
            .fetch_optional(exec)
            .await?;
        row.as_ref().map(row_to_folder).transpose()
    }

    pub async fn find_system(
        exec: &mut SqliteConnection,
        user_id: Id,
        system_type: SystemFolderType,
    ) -> Result<Option<Folder>, StoreError> {
        let row = sqlx::query("SELECT * FROM folders WHERE user_id = ? AND system_type = ?")
            .bind(user_id)
            .bind(system_type.as_str())
            .fetch_optional(exec)
            .await?;
        row.as_ref().map(row_to_folder).transpose()
    }

    pub async fn list_by_user(
        exec: &mut SqliteConnection,
        user_id: Id,
    ) -> Result<Vec<Folder>, StoreError> {
        let rows = sqlx::query("SELECT * FROM folders WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(exec)
            .await?;
        rows.iter().map(row_to_folder).collect()
    }

    pub async fn find_descendants(
        exec: &mut SqliteConnection,
        user_id: Id,
        name_prefix_with_delimiter: &str,
    ) -> Result<Vec<Folder>, StoreError> {
        let pattern = format!("{}%", escape_like(name_prefix_with_delimiter));
        let rows = sqlx::query("SELECT * FROM folders WHERE user_id = ? AND name LIKE ? ESCAPE '\\'")
            .bind(user_id)
            .bind(pattern)
            .fetch_all(exec)
            .await?;
        rows.iter().map(row_to_folder).collect()
    }

    pub async fn create(
        exec: &mut SqliteConnection,
        user_id: Id,
        name: &str,
        delimiter: char,
        system_type: Option<SystemFolderType>,
        uid_validity: i64,
    ) -> Result<Folder, StoreError> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO folders (user_id, name, delimiter, system_type, uid_next, uid_validity, exists_count, recent, unseen, subscribed, created_at)
             VALUES (?, ?, ?, ?, 1, ?, 0, 0, 0, 1, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(delimiter.to_string())
        .bind(system_type.map(|t| t.as_str()))
        .bind(uid_validity)
        .bind(now)
        .execute(&mut *exec)
        .await?
        .last_insert_rowid();
        Self::find_by_id(exec, id)
            .await?
            .ok_or_else(|| StoreError::Internal("folder vanished after insert".into()))
    }

    pub async fn rename(
        exec: &mut SqliteConnection,
        folder_id: Id,
        new_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
            .bind(new_name)
            .bind(folder_id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn set_subscribed(
        exec: &mut SqliteConnection,
        folder_id: Id,
        subscribed: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE folders SET subscribed = ? WHERE id = ?")
            .bind(subscribed)
            .bind(folder_id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn delete(exec: &mut SqliteConnection, folder_id: Id) -> Result<(), StoreError> {
        let n = sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(folder_id)
            .execute(exec)
            .await?
            .rows_affected();
        if n == 0 {
            return Err(StoreError::not_found("folder"));
        }
        Ok(())
    }

    /// Allocates the next UID for `folder_id` and advances `uid_next`, in
    /// one atomic `UPDATE ... RETURNING` statement so two concurrent
    /// deliveries into the same folder can never read the same `uid_next`
    /// before either writes it back (§5 "N concurrent deliveries ... yield
    /// N distinct UIDs"). Must be called inside the same transaction as the
    /// row insert that consumes the UID (§5 ordering guarantee); lock
    /// contention between concurrent transactions is absorbed by the busy
    /// timeout set on the pool's connection options in `Store::connect`
    /// rather than by retrying here.
    pub async fn allocate_uid(
        exec: &mut SqliteConnection,
        folder_id: Id,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "UPDATE folders SET uid_next = uid_next + 1 WHERE id = ? RETURNING uid_next - 1 AS allocated_uid",
        )
        .bind(folder_id)
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| StoreError::not_found("folder"))?;
        row.try_get("allocated_uid").map_err(|e| StoreError::Internal(e.to_string()))
    }

    pub async fn adjust_counters(
        exec: &mut SqliteConnection,
        folder_id: Id,
        d_exists: i64,
        d_recent: i64,
        d_unseen: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE folders SET exists_count = exists_count + ?, recent = recent + ?, unseen = unseen + ? WHERE id = ?",
        )
        .bind(d_exists)
        .bind(d_recent)
        .bind(d_unseen)
        .bind(folder_id)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn clear_recent(exec: &mut SqliteConnection, folder_id: Id) -> Result<(), StoreError> {
        sqlx::query("UPDATE folders SET recent = 0 WHERE id = ?")
            .bind(folder_id)
            .execute(exec)
            .await?;
        Ok(())
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
