use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::error::BookError;
use crate::store::Store;

/// Z-Library remix credential pair obtained from a password login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub remix_user_id: String,
    pub remix_userkey: String,
    pub issued_at: Option<String>,
}

impl SessionToken {
    pub fn new(remix_user_id: impl Into<String>, remix_userkey: impl Into<String>) -> Self {
        Self {
            remix_user_id: remix_user_id.into(),
            remix_userkey: remix_userkey.into(),
            issued_at: None,
        }
    }
}

/// Token fields stored next to the credentials in the managed config.
#[derive(Debug, Clone)]
pub struct SessionCache {
    store: Store,
}

impl SessionCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn get(&self) -> Result<Option<SessionToken>, BookError> {
        let config = self.store.load_managed()?;
        let zlib = config.zlib;
        match (zlib.remix_userid, zlib.remix_userkey) {
            (Some(user_id), Some(userkey)) if !user_id.is_empty() && !userkey.is_empty() => {
                Ok(Some(SessionToken {
                    remix_user_id: user_id,
                    remix_userkey: userkey,
                    issued_at: zlib.remix_issued_at,
                }))
            }
            _ => Ok(None),
        }
    }

    pub fn put(&self, token: &SessionToken) -> Result<SessionToken, BookError> {
        let issued_at = token
            .issued_at
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        self.store.update_managed(|config| {
            config.zlib.remix_userid = Some(token.remix_user_id.clone());
            config.zlib.remix_userkey = Some(token.remix_userkey.clone());
            config.zlib.remix_issued_at = Some(issued_at.clone());
        })?;
        debug!(user_id = %token.remix_user_id, "session token cached");
        Ok(SessionToken {
            issued_at: Some(issued_at),
            ..token.clone()
        })
    }

    pub fn clear(&self) -> Result<(), BookError> {
        if !self.store.managed_exists() {
            return Ok(());
        }
        self.store.update_managed(|config| {
            config.zlib.remix_userid = None;
            config.zlib.remix_userkey = None;
            config.zlib.remix_issued_at = None;
        })?;
        debug!("session token cleared");
        Ok(())
    }
}
