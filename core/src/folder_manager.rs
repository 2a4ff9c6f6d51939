/*
 * folder_manager.rs
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

//! FolderManager: create/rename/delete/list mailbox folders (§4.E).

use crate::store::{Folder, FolderRepo, Id, Store, StoreError, SystemFolderType};
use sqlx::SqliteConnection;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FolderError {
    #[error("a folder with that name already exists")]
    DuplicateName,
    #[error("parent folder does not exist")]
    MissingParent,
    #[error("system folders cannot be renamed or deleted")]
    SystemFolderProtected,
    #[error("folder still contains messages")]
    NotEmpty,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct FolderManager {
    store: Arc<Store>,
}

impl FolderManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Creates the six default system folders for a brand-new user, inside
    /// the caller's transaction (called from `UserDirectory::create_user`).
    pub async fn create_default_folders(
        exec: &mut SqliteConnection,
        domain_id: Id,
        user_id: Id,
    ) -> Result<(), StoreError> {
        for system_type in SystemFolderType::DEFAULTS {
            let uid_validity = FolderRepo::mint_uid_validity(exec, domain_id).await?;
            FolderRepo::create(exec, user_id, system_type.as_str(), '/', Some(system_type), uid_validity).await?;
        }
        Ok(())
    }

    pub async fn create(
        &self,
        user_id: Id,
        domain_id: Id,
        name: &str,
        delimiter: char,
    ) -> Result<Folder, FolderError> {
        let name = name.to_string();
        self.store
            .with_tx(move |tx| {
                let name = name.clone();
                Box::pin(async move {
                    if FolderRepo::find_by_name(tx, user_id, &name).await?.is_some() {
                        return Ok(Err(FolderError::DuplicateName));
                    }
                    if let Some(parent_end) = name.rfind(delimiter) {
                        let parent_name = &name[..parent_end];
                        if !parent_name.is_empty() && FolderRepo::find_by_name(tx, user_id, parent_name).await?.is_none() {
                            return Ok(Err(FolderError::MissingParent));
                        }
                    }
                    let uid_validity = FolderRepo::mint_uid_validity(tx, domain_id).await?;
                    let folder = FolderRepo::create(tx, user_id, &name, delimiter, None, uid_validity).await?;
                    Ok(Ok(folder))
                })
            })
            .await?
    }

    /// Renames a folder, rewriting the name prefix of every descendant
    /// (`oldName + delimiter` → `newName + delimiter`).
    pub async fn rename(&self, user_id: Id, old_name: &str, new_name: &str) -> Result<(), FolderError> {
        let old_name = old_name.to_string();
        let new_name = new_name.to_string();
        self.store
            .with_tx(move |tx| {
                let old_name = old_name.clone();
                let new_name = new_name.clone();
                Box::pin(async move {
                    let Some(folder) = FolderRepo::find_by_name(tx, user_id, &old_name).await? else {
                        return Ok(Err(FolderError::Store(StoreError::not_found("folder"))));
                    };
                    if folder.is_system() {
                        return Ok(Err(FolderError::SystemFolderProtected));
                    }
                    if FolderRepo::find_by_name(tx, user_id, &new_name).await?.is_some() {
                        return Ok(Err(FolderError::DuplicateName));
                    }
                    let prefix = format!("{}{}", old_name, folder.delimiter);
                    let descendants = FolderRepo::find_descendants(tx, user_id, &prefix).await?;
                    for descendant in descendants {
                        let rewritten = format!("{}{}", new_name, &descendant.name[old_name.len()..]);
                        FolderRepo::rename(tx, descendant.id, &rewritten).await?;
                    }
                    FolderRepo::rename(tx, folder.id, &new_name).await?;
                    Ok(Ok(()))
                })
            })
            .await?
    }

    pub async fn set_subscribed(&self, user_id: Id, name: &str, subscribed: bool) -> Result<(), FolderError> {
        let name = name.to_string();
        self.store
            .with_tx(move |tx| {
                let name = name.clone();
                Box::pin(async move {
                    let Some(folder) = FolderRepo::find_by_name(tx, user_id, &name).await? else {
                        return Ok(Err(FolderError::Store(StoreError::not_found("folder"))));
                    };
                    FolderRepo::set_subscribed(tx, folder.id, subscribed).await?;
                    Ok(Ok(()))
                })
            })
            .await?
    }

    /// Deletes a folder and its descendants; refuses system folders and
    /// any folder subtree that still holds messages (§4.E).
    pub async fn delete(&self, user_id: Id, name: &str) -> Result<(), FolderError> {
        let name = name.to_string();
        self.store
            .with_tx(move |tx| {
                let name = name.clone();
                Box::pin(async move {
                    let Some(folder) = FolderRepo::find_by_name(tx, user_id, &name).await? else {
                        return Ok(Err(FolderError::Store(StoreError::not_found("folder"))));
                    };
                    if folder.is_system() {
                        return Ok(Err(FolderError::SystemFolderProtected));
                    }
                    let prefix = format!("{}{}", name, folder.delimiter);
                    let mut subtree = FolderRepo::find_descendants(tx, user_id, &prefix).await?;
                    subtree.push(folder.clone());
                    for f in &subtree {
                        if f.exists > 0 {
                            return Ok(Err(FolderError::NotEmpty));
                        }
                    }
                    for f in &subtree {
                        FolderRepo::delete(tx, f.id).await?;
                    }
                    Ok(Ok(()))
                })
            })
            .await?
    }

    /// Lists a user's folders, system folders first in `SystemFolderType`
    /// order, then the rest alphabetically.
    pub async fn list(&self, user_id: Id) -> Result<Vec<Folder>, StoreError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        let mut folders = FolderRepo::list_by_user(&mut conn, user_id).await?;
        folders.sort_by(|a, b| {
            let rank = |f: &Folder| f.system_type.map(|t| SystemFolderType::DEFAULTS.iter().position(|d| *d == t)).flatten();
            match (rank(a), rank(b)) {
                (Some(ra), Some(rb)) => ra.cmp(&rb),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.name.cmp(&b.name),
            }
        });
        Ok(folders)
    }
}
