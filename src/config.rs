use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::error::BookError;
use crate::store::{ManagedConfig, Store};

pub const MASK: &str = "********";

pub const ENV_ZLIB_EMAIL: &str = "ZLIB_EMAIL";
pub const ENV_ZLIB_PASSWORD: &str = "ZLIB_PASSWORD";
pub const ENV_ANNAS_KEY: &str = "ANNAS_SECRET_KEY";
pub const ENV_ANNAS_BINARY: &str = "ANNAS_BINARY";
pub const ENV_ANNAS_DOWNLOAD_PATH: &str = "ANNAS_DOWNLOAD_PATH";
pub const ENV_ANNAS_BASE_URL: &str = "ANNAS_BASE_URL";
pub const ENV_DOWNLOAD_DIR: &str = "BOOK_DOWNLOAD_DIR";

/// Credentials after the overlay file has been applied over the managed store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub email: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub binary_path: Option<String>,
    pub annas_download_path: Option<String>,
    pub mirror_url: Option<String>,
    pub default_download_dir: Option<String>,
}

impl Credentials {
    pub fn has_zlib_login(&self) -> bool {
        self.email.is_some() && self.password.is_some()
    }
}

/// Field-wise update applied by `config set`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub email: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub binary_path: Option<String>,
    pub annas_download_path: Option<String>,
    pub mirror_url: Option<String>,
    pub default_download_dir: Option<String>,
}

impl CredentialUpdate {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.password.is_none()
            && self.api_key.is_none()
            && self.binary_path.is_none()
            && self.annas_download_path.is_none()
            && self.mirror_url.is_none()
            && self.default_download_dir.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RedactedZlib {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub session_cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remix_userkey: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedactedAnnas {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedactedConfig {
    pub config_path: String,
    pub overlay_present: bool,
    pub zlib: RedactedZlib,
    pub annas: RedactedAnnas,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_download_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSetResult {
    pub status: &'static str,
    pub changed: bool,
    pub updated: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigResetResult {
    pub status: &'static str,
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    store: Store,
}

impl CredentialStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn resolve(&self) -> Result<Credentials, BookError> {
        let managed = self.store.load_managed()?;
        let overlay = self.store.load_overlay()?;
        Ok(merge(&managed, &overlay))
    }

    pub fn show(&self) -> Result<RedactedConfig, BookError> {
        let managed = self.store.load_managed()?;
        let overlay = self.store.load_overlay()?;
        let credentials = merge(&managed, &overlay);
        let session_cached =
            managed.zlib.remix_userid.is_some() && managed.zlib.remix_userkey.is_some();

        Ok(RedactedConfig {
            config_path: self.store.config_path().to_string(),
            overlay_present: self.store.overlay_path().as_std_path().exists(),
            zlib: RedactedZlib {
                email: credentials.email,
                password: credentials.password.map(|_| MASK.to_string()),
                session_cached,
                remix_userkey: managed.zlib.remix_userkey.as_deref().map(token_prefix),
            },
            annas: RedactedAnnas {
                secret_key: credentials.api_key.map(|_| MASK.to_string()),
                binary_path: credentials.binary_path,
                download_path: credentials.annas_download_path,
                base_url: credentials.mirror_url,
            },
            default_download_dir: credentials.default_download_dir,
        })
    }

    /// Merges `update` into the managed store; the overlay file is never written.
    pub fn set(&self, update: CredentialUpdate) -> Result<ConfigSetResult, BookError> {
        if update.is_empty() {
            return Err(BookError::Invalid(
                "config set needs at least one field".to_string(),
            ));
        }

        let before = self.store.load_managed()?;
        let mut after = before.clone();
        let mut updated = Vec::new();

        let login_changed = assign(&mut after.zlib.email, update.email, "zlib-email", &mut updated)
            | assign(
                &mut after.zlib.password,
                update.password,
                "zlib-password",
                &mut updated,
            );
        if login_changed {
            after.zlib.remix_userid = None;
            after.zlib.remix_userkey = None;
            after.zlib.remix_issued_at = None;
        }
        assign(&mut after.annas.secret_key, update.api_key, "annas-key", &mut updated);
        assign(
            &mut after.annas.binary_path,
            update.binary_path,
            "annas-binary",
            &mut updated,
        );
        assign(
            &mut after.annas.download_path,
            update.annas_download_path,
            "annas-download-path",
            &mut updated,
        );
        assign(
            &mut after.annas.base_url,
            update.mirror_url,
            "annas-mirror",
            &mut updated,
        );
        assign(
            &mut after.default_download_dir,
            update.default_download_dir,
            "download-dir",
            &mut updated,
        );

        let changed = after != before;
        if changed || !self.store.managed_exists() {
            self.store.save_managed(&after)?;
        }
        info!(fields = ?updated, changed, "config updated");

        Ok(ConfigSetResult {
            status: "ok",
            changed,
            updated,
        })
    }

    pub fn reset(&self) -> Result<ConfigResetResult, BookError> {
        let removed = self.store.remove_managed()?;
        info!(removed, "config reset");
        Ok(ConfigResetResult {
            status: "ok",
            removed,
        })
    }
}

fn merge(managed: &ManagedConfig, overlay: &BTreeMap<String, String>) -> Credentials {
    let pick = |key: &str, fallback: &Option<String>| {
        overlay
            .get(key)
            .cloned()
            .or_else(|| fallback.clone().filter(|value| !value.is_empty()))
    };
    Credentials {
        email: pick(ENV_ZLIB_EMAIL, &managed.zlib.email),
        password: pick(ENV_ZLIB_PASSWORD, &managed.zlib.password),
        api_key: pick(ENV_ANNAS_KEY, &managed.annas.secret_key),
        binary_path: pick(ENV_ANNAS_BINARY, &managed.annas.binary_path),
        annas_download_path: pick(ENV_ANNAS_DOWNLOAD_PATH, &managed.annas.download_path),
        mirror_url: pick(ENV_ANNAS_BASE_URL, &managed.annas.base_url),
        default_download_dir: pick(ENV_DOWNLOAD_DIR, &managed.default_download_dir),
    }
}

fn assign(
    slot: &mut Option<String>,
    value: Option<String>,
    name: &'static str,
    updated: &mut Vec<&'static str>,
) -> bool {
    let Some(value) = value else {
        return false;
    };
    updated.push(name);
    let value = value.trim().to_string();
    if slot.as_deref() == Some(value.as_str()) {
        return false;
    }
    *slot = Some(value);
    true
}

fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_wins_per_field() {
        let mut managed = ManagedConfig::default();
        managed.zlib.email = Some("managed@example.com".to_string());
        managed.zlib.password = Some("managed-pw".to_string());
        let overlay = BTreeMap::from([(ENV_ZLIB_EMAIL.to_string(), "env@example.com".to_string())]);

        let credentials = merge(&managed, &overlay);
        assert_eq!(credentials.email.as_deref(), Some("env@example.com"));
        assert_eq!(credentials.password.as_deref(), Some("managed-pw"));
        assert_eq!(credentials.api_key, None);
    }

    #[test]
    fn token_prefix_truncates() {
        assert_eq!(token_prefix("abcdef0123456789"), "abcdef01...");
    }
}
