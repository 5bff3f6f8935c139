use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::BookError;

const CONFIG_FILE: &str = "config.json";
const OVERLAY_FILE: &str = ".env";

/// Location of the per-user managed store and overlay file.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, BookError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".claude").join("book-tools"))
                    .ok()
            })
            .ok_or_else(|| {
                BookError::Filesystem("unable to resolve config directory".to_string())
            })?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn config_path(&self) -> Utf8PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn overlay_path(&self) -> Utf8PathBuf {
        self.root.join(OVERLAY_FILE)
    }

    pub fn managed_exists(&self) -> bool {
        self.config_path().as_std_path().exists()
    }

    pub fn load_managed(&self) -> Result<ManagedConfig, BookError> {
        let path = self.config_path();
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ManagedConfig::default());
            }
            Err(err) => return Err(BookError::Filesystem(format!("read {path}: {err}"))),
        };
        if content.trim().is_empty() {
            return Ok(ManagedConfig::default());
        }
        serde_json::from_str(&content).map_err(|err| BookError::ConfigParse(err.to_string()))
    }

    /// Replaces the managed store by writing a sibling temp file and renaming it
    /// over the old one, so readers see either the old or the new content.
    pub fn save_managed(&self, config: &ManagedConfig) -> Result<(), BookError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| BookError::Filesystem(err.to_string()))?;
        let content = serde_json::to_vec_pretty(config)
            .map_err(|err| BookError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".config")
            .suffix(".tmp")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| BookError::Filesystem(err.to_string()))?;
        write_all_synced(&mut temp, &content)
            .map_err(|err| BookError::Filesystem(err.to_string()))?;
        temp.persist(self.config_path().as_std_path())
            .map_err(|err| BookError::Filesystem(err.error.to_string()))?;
        debug!(path = %self.config_path(), "managed config written");
        Ok(())
    }

    /// Read-modify-write of the managed store. Concurrent invocations race and
    /// the last writer wins.
    pub fn update_managed<F>(&self, mutate: F) -> Result<ManagedConfig, BookError>
    where
        F: FnOnce(&mut ManagedConfig),
    {
        let mut config = self.load_managed()?;
        mutate(&mut config);
        self.save_managed(&config)?;
        Ok(config)
    }

    pub fn remove_managed(&self) -> Result<bool, BookError> {
        match fs::remove_file(self.config_path().as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(BookError::Filesystem(err.to_string())),
        }
    }

    /// Reads the `KEY=value` overlay. A missing file yields an empty map.
    pub fn load_overlay(&self) -> Result<BTreeMap<String, String>, BookError> {
        let path = self.overlay_path();
        if !path.as_std_path().exists() {
            return Ok(BTreeMap::new());
        }
        let entries = dotenvy::from_path_iter(path.as_std_path())
            .map_err(|err| BookError::ConfigParse(format!("{path}: {err}")))?;
        let mut overlay = BTreeMap::new();
        for entry in entries {
            match entry {
                Ok((key, value)) => {
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        overlay.insert(key, value);
                    }
                }
                Err(err) => warn!(path = %path, "skipping malformed overlay line: {err}"),
            }
        }
        Ok(overlay)
    }
}

fn write_all_synced(temp: &mut NamedTempFile, content: &[u8]) -> io::Result<()> {
    let file = temp.as_file_mut();
    file.write_all(content)?;
    file.write_all(b"\n")?;
    file.sync_all()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagedConfig {
    #[serde(default, skip_serializing_if = "ZlibSection::is_empty")]
    pub zlib: ZlibSection,
    #[serde(default, skip_serializing_if = "AnnasSection::is_empty")]
    pub annas: AnnasSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_download_dir: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZlibSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remix_userid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remix_userkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remix_issued_at: Option<String>,
}

impl ZlibSection {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnasSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl AnnasSection {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
