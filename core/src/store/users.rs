/*
 * users.rs
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

//! Domain and User repository functions. Callers pass any executor
//! (a pool connection for reads, a transaction for writes that must be
//! atomic with other rows) so the same queries serve both cases.

use super::error::StoreError;
use super::models::{Domain, Id, Role, User, UserWithDomain};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection};

pub struct UserRepo;

fn row_to_user(row: &SqliteRow) -> Result<User, StoreError> {
    let role_str: String = row.try_get("role").map_err(|e| StoreError::Internal(e.to_string()))?;
    Ok(User {
        id: row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?,
        username: row.try_get("username").map_err(|e| StoreError::Internal(e.to_string()))?,
        domain_id: row.try_get("domain_id").map_err(|e| StoreError::Internal(e.to_string()))?,
        password_hash: row.try_get("password_hash").map_err(|e| StoreError::Internal(e.to_string()))?,
        password_salt: row.try_get("password_salt").map_err(|e| StoreError::Internal(e.to_string()))?,
        full_name: row.try_get("full_name").map_err(|e| StoreError::Internal(e.to_string()))?,
        role: Role::from_str(&role_str).ok_or_else(|| StoreError::Internal(format!("bad role {role_str}")))?,
        can_receive: row.try_get("can_receive").map_err(|e| StoreError::Internal(e.to_string()))?,
        can_login: row.try_get("can_login").map_err(|e| StoreError::Internal(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Internal(e.to_string()))?,
        last_login: row.try_get("last_login").map_err(|e| StoreError::Internal(e.to_string()))?,
        failed_login_attempts: row.try_get("failed_login_attempts").map_err(|e| StoreError::Internal(e.to_string()))?,
        lockout_end: row.try_get("lockout_end").map_err(|e| StoreError::Internal(e.to_string()))?,
        last_failed_login: row.try_get("last_failed_login").map_err(|e| StoreError::Internal(e.to_string()))?,
    })
}

impl UserRepo {
    pub async fn find_domain_by_name(
        exec: &mut SqliteConnection,
        name: &str,
    ) -> Result<Option<Domain>, StoreError> {
        let row = sqlx::query_as::<Sqlite, Domain>("SELECT * FROM domains WHERE name = ?")
            .bind(name.to_ascii_lowercase())
            .fetch_optional(exec)
            .await?;
        Ok(row)
    }

    pub async fn find_domain_by_id(
        exec: &mut SqliteConnection,
        id: Id,
    ) -> Result<Option<Domain>, StoreError> {
        let row = sqlx::query_as::<Sqlite, Domain>("SELECT * FROM domains WHERE id = ?")
            .bind(id)
            .fetch_optional(exec)
            .await?;
        Ok(row)
    }

    pub async fn create_domain(
        exec: &mut SqliteConnection,
        name: &str,
    ) -> Result<Domain, StoreError> {
        let now = Utc::now();
        let id = sqlx::query("INSERT INTO domains (name, is_active, created_at) VALUES (?, 1, ?)")
            .bind(name.to_ascii_lowercase())
            .bind(now)
            .execute(&mut *exec)
            .await?
            .last_insert_rowid();
        Self::find_domain_by_id(exec, id)
            .await?
            .ok_or_else(|| StoreError::Internal("domain vanished after insert".into()))
    }

    pub async fn set_catch_all(
        exec: &mut SqliteConnection,
        domain_id: Id,
        user_id: Option<Id>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE domains SET catch_all_user_id = ? WHERE id = ?")
            .bind(user_id)
            .bind(domain_id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn find_user_by_id(
        exec: &mut SqliteConnection,
        id: Id,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(exec)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    pub async fn find_user_by_natural_key(
        exec: &mut SqliteConnection,
        username: &str,
        domain_id: Id,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ? AND domain_id = ?")
            .bind(username)
            .bind(domain_id)
            .fetch_optional(exec)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    /// Splits `email` at the last `@` and joins user+domain in two queries
    /// (the domain lookup is cheap and rarely repeated within a request).
    pub async fn find_user_with_domain_by_email(
        exec: &mut SqliteConnection,
        email: &str,
    ) -> Result<Option<UserWithDomain>, StoreError> {
        let Some((local, domain_name)) = email.rsplit_once('@') else {
            return Ok(None);
        };
        let Some(domain) = Self::find_domain_by_name(exec, domain_name).await? else {
            return Ok(None);
        };
        let Some(user) = Self::find_user_by_natural_key(exec, local, domain.id).await? else {
            return Ok(None);
        };
        Ok(Some(UserWithDomain { user, domain }))
    }

    pub async fn find_user_with_domain_by_id(
        exec: &mut SqliteConnection,
        user_id: Id,
    ) -> Result<Option<UserWithDomain>, StoreError> {
        let Some(user) = Self::find_user_by_id(exec, user_id).await? else {
            return Ok(None);
        };
        let Some(domain) = Self::find_domain_by_id(exec, user.domain_id).await? else {
            return Err(StoreError::Internal("user references missing domain".into()));
        };
        Ok(Some(UserWithDomain { user, domain }))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_user(
        exec: &mut SqliteConnection,
        username: &str,
        domain_id: Id,
        password_hash: &str,
        password_salt: &str,
        full_name: Option<&str>,
        role: Role,
    ) -> Result<User, StoreError> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO users (username, domain_id, password_hash, password_salt, full_name, role, can_receive, can_login, created_at, failed_login_attempts)
             VALUES (?, ?, ?, ?, ?, ?, 1, 1, ?, 0)",
        )
        .bind(username)
        .bind(domain_id)
        .bind(password_hash)
        .bind(password_salt)
        .bind(full_name)
        .bind(role.as_str())
        .bind(now)
        .execute(&mut *exec)
        .await?
        .last_insert_rowid();
        Self::find_user_by_id(exec, id)
            .await?
            .ok_or_else(|| StoreError::Internal("user vanished after insert".into()))
    }

    pub async fn update_user_profile(
        exec: &mut SqliteConnection,
        user_id: Id,
        full_name: Option<&str>,
        can_receive: bool,
        can_login: bool,
    ) -> Result<(), StoreError> {
        let n = sqlx::query(
            "UPDATE users SET full_name = ?, can_receive = ?, can_login = ? WHERE id = ?",
        )
        .bind(full_name)
        .bind(can_receive)
        .bind(can_login)
        .bind(user_id)
        .execute(exec)
        .await?
        .rows_affected();
        if n == 0 {
            return Err(StoreError::not_found("user"));
        }
        Ok(())
    }

    pub async fn update_password(
        exec: &mut SqliteConnection,
        user_id: Id,
        password_hash: &str,
        password_salt: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE users SET password_hash = ?, password_salt = ?, failed_login_attempts = 0, lockout_end = NULL WHERE id = ?",
        )
        .bind(password_hash)
        .bind(password_salt)
        .bind(user_id)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn delete_user(exec: &mut SqliteConnection, user_id: Id) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM message_flags WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *exec)
            .await?;
        sqlx::query("DELETE FROM user_messages WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *exec)
            .await?;
        sqlx::query("DELETE FROM folders WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *exec)
            .await?;
        let n = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(exec)
            .await?
            .rows_affected();
        if n == 0 {
            return Err(StoreError::not_found("user"));
        }
        Ok(())
    }

    /// Records the full outcome of an authentication attempt (§4.C) in one
    /// transactional update: lockout/failure counters and last_login all move
    /// together.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_login_outcome(
        exec: &mut SqliteConnection,
        user_id: Id,
        failed_login_attempts: i64,
        lockout_end: Option<chrono::DateTime<Utc>>,
        last_failed_login: Option<chrono::DateTime<Utc>>,
        last_login: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE users SET failed_login_attempts = ?, lockout_end = ?, last_failed_login = ?, last_login = COALESCE(?, last_login) WHERE id = ?",
        )
        .bind(failed_login_attempts)
        .bind(lockout_end)
        .bind(last_failed_login)
        .bind(last_login)
        .bind(user_id)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn next_uid_validity(
        exec: &mut SqliteConnection,
        domain_id: Id,
    ) -> Result<i64, StoreError> {
        sqlx::query("INSERT INTO uid_validity_seq (domain_id, counter) VALUES (?, 0) ON CONFLICT(domain_id) DO NOTHING")
            .bind(domain_id)
            .execute(&mut *exec)
            .await?;
        sqlx::query("UPDATE uid_validity_seq SET counter = counter + 1 WHERE domain_id = ?")
            .bind(domain_id)
            .execute(&mut *exec)
            .await?;
        let row = sqlx::query("SELECT counter FROM uid_validity_seq WHERE domain_id = ?")
            .bind(domain_id)
            .fetch_one(exec)
            .await?;
        row.try_get::<i64, _>("counter")
            .map_err(|e| StoreError::Internal(e.to_string()))
    }
}
