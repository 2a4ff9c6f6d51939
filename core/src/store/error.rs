/*
 * error.rs
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

//! Store errors (§4.A, §7): StorageUnavailable / UniqueViolation / NotFound,
//! surfaced to callers and never swallowed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    pub fn permission(what: impl Into<String>) -> Self {
        Self::Permission(what.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".into()),
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("2067") || db_err.code().as_deref() == Some("1555") {
                    StoreError::UniqueViolation(db_err.message().to_string())
                } else {
                    StoreError::Internal(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::StorageUnavailable(e.to_string())
            }
            other => StoreError::Internal(other.to_string()),
        }
    }
}
