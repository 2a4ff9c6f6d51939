/*
 * user_directory.rs
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

//! UserDirectory: user lifecycle on top of the Store (§4.D).

use crate::auth::hash_new_password;
use crate::folder_manager::FolderManager;
use crate::store::{Role, Store, StoreError, User, UserRepo, UserWithDomain};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid username: must match [a-zA-Z0-9._-]+")]
    InvalidUsername,
    #[error("password must be at least 8 characters")]
    PasswordTooShort,
    #[error("domain does not exist")]
    UnknownDomain,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn validate_username(username: &str) -> Result<(), DirectoryError> {
    if !username.is_empty()
        && username
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
    {
        Ok(())
    } else {
        Err(DirectoryError::InvalidUsername)
    }
}

pub fn validate_password(password: &str) -> Result<(), DirectoryError> {
    if password.len() >= 8 {
        Ok(())
    } else {
        Err(DirectoryError::PasswordTooShort)
    }
}

pub struct CreateUserRequest<'a> {
    pub username: &'a str,
    pub domain_name: &'a str,
    pub password: &'a str,
    pub full_name: Option<&'a str>,
    pub role: Role,
}

pub struct UserDirectory {
    store: Arc<Store>,
}

impl UserDirectory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Validates, persists the user, and creates the six default system
    /// folders, all within one transaction (§4.D/§4.E).
    pub async fn create_user(&self, request: CreateUserRequest<'_>) -> Result<User, DirectoryError> {
        validate_username(request.username)?;
        validate_password(request.password)?;
        let (password_hash, password_salt) = hash_new_password(request.password);

        let username = request.username.to_string();
        let domain_name = request.domain_name.to_string();
        let full_name = request.full_name.map(|s| s.to_string());
        let role = request.role;

        let result = self
            .store
            .with_tx(move |tx| {
                let username = username.clone();
                let domain_name = domain_name.clone();
                let full_name = full_name.clone();
                let password_hash = password_hash.clone();
                let password_salt = password_salt.clone();
                Box::pin(async move {
                    let Some(domain) = UserRepo::find_domain_by_name(tx, &domain_name).await? else {
                        return Ok(Err(DirectoryError::UnknownDomain));
                    };
                    if UserRepo::find_user_by_natural_key(tx, &username, domain.id).await?.is_some() {
                        return Ok(Err(DirectoryError::Store(StoreError::conflict("username already exists in domain"))));
                    }
                    let user = UserRepo::create_user(
                        tx,
                        &username,
                        domain.id,
                        &password_hash,
                        &password_salt,
                        full_name.as_deref(),
                        role,
                    )
                    .await?;
                    FolderManager::create_default_folders(tx, domain.id, user.id).await?;
                    Ok(Ok(user))
                })
            })
            .await?;
        result
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<UserWithDomain>, StoreError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        UserRepo::find_user_with_domain_by_email(&mut conn, email).await
    }

    pub async fn update_user(
        &self,
        user_id: i64,
        full_name: Option<&str>,
        can_receive: bool,
        can_login: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        UserRepo::update_user_profile(&mut conn, user_id, full_name, can_receive, can_login).await
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<(), StoreError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        UserRepo::delete_user(&mut conn, user_id).await
    }

    /// Updates the password and resets lockout counters (§4.D).
    pub async fn update_password(&self, user_id: i64, new_password: &str) -> Result<(), DirectoryError> {
        validate_password(new_password)?;
        let (hash, salt) = hash_new_password(new_password);
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        UserRepo::update_password(&mut conn, user_id, &hash, &salt).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_regex_rejects_at_sign() {
        assert!(validate_username("al.ice_2-3").is_ok());
        assert!(validate_username("alice@example").is_err());
        assert!(validate_username("").is_err());
    }

    #[test]
    fn password_length_enforced() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("longenough").is_ok());
    }
}
