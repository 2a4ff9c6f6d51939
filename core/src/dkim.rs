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

//! DkimManager: generates outbound-signing DKIM keypairs and rotates them
//! into the store (§3 DkimKey, §4.G note on outbound signing preparation).
//!
//! Signing messages with the active key is out of scope here; this crate
//! prepares the keys a future signing step would use.

use crate::store::{DkimKey, Id, Store, StoreError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::sync::Arc;
use thiserror::Error;

const KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum DkimError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct DkimManager {
    store: Arc<Store>,
}

impl DkimManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Generates a fresh 2048-bit RSA keypair for `(domain_id, selector)`
    /// and installs it as the active key, deactivating whatever was active
    /// before (§3: "Generating a new key for a domain deactivates prior keys").
    pub async fn generate_key(&self, domain_id: Id, selector: &str) -> Result<DkimKey, DkimError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|e| DkimError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| DkimError::KeyGeneration(e.to_string()))?
            .to_string();
        let public_der = public_key
            .to_public_key_der()
            .map_err(|e| DkimError::KeyGeneration(e.to_string()))?;
        let public_b64 = BASE64.encode(public_der.as_bytes());
        let selector = selector.to_string();

        self.store
            .with_tx(move |tx| {
                let selector = selector.clone();
                let private_pem = private_pem.clone();
                let public_b64 = public_b64.clone();
                Box::pin(async move {
                    crate::store::DkimRepo::rotate(tx, domain_id, &selector, &private_pem, &public_b64).await
                })
            })
            .await
            .map_err(DkimError::from)
    }

    pub async fn active_key(&self, domain_id: Id, selector: &str) -> Result<Option<DkimKey>, DkimError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        crate::store::DkimRepo::find_active(&mut conn, domain_id, selector)
            .await
            .map_err(DkimError::from)
    }

    pub async fn list_keys(&self, domain_id: Id) -> Result<Vec<DkimKey>, DkimError> {
        let mut conn = self.store.pool().acquire().await.map_err(StoreError::from)?;
        crate::store::DkimRepo::list_for_domain(&mut conn, domain_id)
            .await
            .map_err(DkimError::from)
    }
}
