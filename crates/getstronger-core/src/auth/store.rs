use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use cookie_store::CookieStore;
use reqwest_cookie_store::CookieStoreMutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Credential;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Cookie jar file name in cache directory. Holds the refresh token cookie.
const COOKIES_FILE: &str = "cookies.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    pub subject_id: String,
    pub saved_at: DateTime<Utc>,
}

/// On-disk copy of the last credential and the cookie jar, so a restart
/// keeps the user logged in and can still refresh.
///
/// A restored credential is not trusted: the first call it fails on goes
/// through the normal refresh path.
pub struct SessionStore {
    cache_dir: PathBuf,
}

impl SessionStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Load the saved credential, if any
    pub fn load(&self) -> Result<Option<Credential>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let stored: StoredSession =
            serde_json::from_str(&contents).context("Failed to parse session file")?;

        match Credential::from_access_token(stored.access_token) {
            Ok(credential) => {
                debug!(saved_at = %stored.saved_at, "restored session");
                Ok(Some(credential))
            }
            Err(e) => {
                warn!(error = %e, "discarding saved session with unreadable token");
                Ok(None)
            }
        }
    }

    /// Save the credential to disk
    pub fn save(&self, credential: &Credential) -> Result<()> {
        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create cache directory")?;
        }
        let stored = StoredSession {
            access_token: credential.token().to_string(),
            subject_id: credential.subject_id().to_string(),
            saved_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&stored)?;
        std::fs::write(path, contents).context("Failed to write session file")?;
        Ok(())
    }

    /// Load the saved cookie jar, or an empty one if none was saved
    pub fn load_cookies(&self) -> Result<CookieStore> {
        let path = self.cookies_path();
        if !path.exists() {
            return Ok(CookieStore::default());
        }

        let file = File::open(&path).context("Failed to open cookie file")?;
        let jar = cookie_store::serde::json::load(BufReader::new(file))
            .map_err(|e| anyhow!("Failed to parse cookie file: {}", e))?;
        debug!(cookies = jar.iter_unexpired().count(), "restored cookies");
        Ok(jar)
    }

    /// Save the persistent, unexpired cookies in `jar`
    pub fn save_cookies(&self, jar: &CookieStoreMutex) -> Result<()> {
        let path = self.cookies_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create cache directory")?;
        }
        let jar = jar.lock().map_err(|_| anyhow!("Cookie jar lock poisoned"))?;
        let mut writer =
            BufWriter::new(File::create(&path).context("Failed to create cookie file")?);
        cookie_store::serde::json::save(&jar, &mut writer)
            .map_err(|e| anyhow!("Failed to write cookie file: {}", e))?;
        writer.flush().context("Failed to write cookie file")?;
        Ok(())
    }

    /// Remove the saved session and cookies
    pub fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        let path = self.cookies_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove cookie file")?;
        }
        Ok(())
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }

    fn cookies_path(&self) -> PathBuf {
        self.cache_dir.join(COOKIES_FILE)
    }
}
