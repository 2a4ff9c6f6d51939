/*
 * config.rs
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

//! Configuration (§6): a TOML file merged with `MAILCORE_`-prefixed
//! environment overrides, covering `Ports.*`, `Jwt.*`, `AccountLockout.*`
//! and `Storage.ConnectionString`.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_smtp_port")]
    pub smtp: u16,
    #[serde(default = "default_imap_port")]
    pub imap: u16,
    #[serde(default = "default_pop3_port")]
    pub pop3: u16,
}

fn default_smtp_port() -> u16 {
    587
}
fn default_imap_port() -> u16 {
    143
}
fn default_pop3_port() -> u16 {
    110
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(default = "default_jwt_issuer")]
    pub issuer: String,
    #[serde(default = "default_jwt_audience")]
    pub audience: String,
}

fn default_jwt_issuer() -> String {
    "mailcore".into()
}
fn default_jwt_audience() -> String {
    "mailcore-clients".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountLockoutConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_lockout_duration_minutes")]
    pub lockout_duration_minutes: i64,
    #[serde(default = "default_reset_window_minutes")]
    pub reset_window_minutes: i64,
}

fn default_true() -> bool {
    true
}
fn default_max_failed_attempts() -> u32 {
    5
}
fn default_lockout_duration_minutes() -> i64 {
    15
}
fn default_reset_window_minutes() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub connection_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    pub ports: PortsConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub account_lockout: AccountLockoutConfig,
    pub storage: StorageConfig,
}

fn default_bind_host() -> String {
    "0.0.0.0".into()
}

impl Default for AccountLockoutConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_duration_minutes: default_lockout_duration_minutes(),
            reset_window_minutes: default_reset_window_minutes(),
        }
    }
}

impl AppConfig {
    /// Loads `path` (if present), then applies `MAILCORE_`-prefixed
    /// environment overrides (e.g. `MAILCORE_PORTS__SMTP=2525`).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("ports.smtp", default_smtp_port() as i64)?
            .set_default("ports.imap", default_imap_port() as i64)?
            .set_default("ports.pop3", default_pop3_port() as i64)?
            .set_default("jwt.issuer", default_jwt_issuer())?
            .set_default("jwt.audience", default_jwt_audience())?
            .set_default("account_lockout.enabled", true)?
            .set_default("account_lockout.max_failed_attempts", default_max_failed_attempts() as i64)?
            .set_default("account_lockout.lockout_duration_minutes", default_lockout_duration_minutes())?
            .set_default("account_lockout.reset_window_minutes", default_reset_window_minutes())?
            .set_default("bind_host", default_bind_host())?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("MAILCORE").separator("__"));
        let raw = builder.build()?;
        Ok(raw.try_deserialize()?)
    }
}
