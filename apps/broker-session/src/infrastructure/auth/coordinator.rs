//! Cross-process token coordination.
//!
//! Several bot processes share one OAuth credential set, and the broker's
//! refresh tokens are single-use: if two processes refresh with the same
//! token, one of them ends up holding a dead token set. The coordinator
//! serialises refreshes with an advisory file lock and makes every process
//! re-read the shared cache file once it holds the lock, so only the first
//! process through actually calls the token endpoint.
//!
//! # Files
//!
//! - `<cache_path>`: JSON [`TokenSet`], replaced atomically (temp file + rename)
//! - `<cache_path>.lock`: empty, used only for `flock`-style locking
//!
//! The lock gives mutual exclusion only; waiters are not ordered.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use super::error::TokenError;
use crate::domain::TokenSet;
use crate::infrastructure::config::CoordinatorSettings;
use crate::infrastructure::metrics::{self, RefreshOutcome};

#[derive(Debug, Clone)]
struct Memo {
    tokens: Option<TokenSet>,
    read_at: Instant,
}

/// Shared token cache with single-flight refresh.
#[derive(Debug)]
pub struct TokenCoordinator {
    settings: CoordinatorSettings,
    memo: Mutex<Option<Memo>>,
}

/// Exclusive hold on the lock file. Released on drop.
#[derive(Debug)]
struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release token lock");
        }
    }
}

impl TokenCoordinator {
    /// Create a coordinator for the configured cache file.
    #[must_use]
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self {
            settings,
            memo: Mutex::new(None),
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// `now + buffer < tokens.expiry`.
    #[must_use]
    pub fn is_valid(tokens: &TokenSet, buffer: Duration) -> bool {
        tokens.is_valid(buffer)
    }

    /// Cached token set, re-reading the file at most once per `cache_ttl`.
    ///
    /// Absent or corrupt files yield `None`.
    #[must_use]
    pub fn get_cached_tokens(&self) -> Option<TokenSet> {
        let mut memo = self.memo.lock();
        if let Some(entry) = memo.as_ref()
            && entry.read_at.elapsed() < self.settings.cache_ttl
        {
            return entry.tokens.clone();
        }

        let tokens = self.read_cache_file();
        *memo = Some(Memo {
            tokens: tokens.clone(),
            read_at: Instant::now(),
        });
        tokens
    }

    /// Read the cache file, bypassing the in-process memo.
    #[must_use]
    pub fn read_cache_file(&self) -> Option<TokenSet> {
        let path = &self.settings.cache_path;
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read token cache");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Token cache is corrupt, ignoring");
                None
            }
        }
    }

    /// Drop the in-process memo so the next read hits the file.
    pub fn invalidate(&self) {
        *self.memo.lock() = None;
    }

    /// Refresh under the cross-process lock.
    ///
    /// Once the lock is held the cache file is re-read. A cached set issued
    /// for an app key other than `app_key` is treated as absent. If it holds
    /// a valid token set whose access token is not `superseded_access_token`
    /// (the one the caller already knows to be bad), that set is adopted and
    /// `refresh_fn` is never called. Otherwise `refresh_fn` receives the
    /// cached set (for its refresh token), the result is written atomically
    /// to the cache file, and `persist_fn` pushes it to durable storage.
    /// A `persist_fn` failure is logged and does not fail the refresh.
    pub async fn refresh_with_lock<R, RFut, P, PFut>(
        &self,
        app_key: &str,
        superseded_access_token: Option<&str>,
        refresh_fn: R,
        persist_fn: P,
    ) -> Result<TokenSet, TokenError>
    where
        R: FnOnce(Option<TokenSet>) -> RFut,
        RFut: Future<Output = Result<TokenSet, TokenError>>,
        P: FnOnce(TokenSet) -> PFut,
        PFut: Future<Output = Result<(), TokenError>>,
    {
        let _guard = self.acquire_lock().await?;

        let cached = self.read_cache_file().filter(|t| {
            let ours = t.app_key == app_key;
            if !ours {
                tracing::warn!("Token cache holds tokens for another app key, ignoring");
            }
            ours
        });
        if let Some(tokens) = cached.as_ref()
            && tokens.is_valid(self.settings.validity_buffer)
            && superseded_access_token != Some(tokens.access_token.as_str())
        {
            tracing::info!(
                expires_in_secs = tokens.remaining().as_secs(),
                "Adopted tokens refreshed by another process"
            );
            metrics::record_token_refresh(RefreshOutcome::Adopted);
            self.remember(Some(tokens.clone()));
            return Ok(tokens.clone());
        }

        let tokens = match refresh_fn(cached).await {
            Ok(tokens) => tokens,
            Err(e) => {
                metrics::record_token_refresh(RefreshOutcome::Failed);
                tracing::warn!(error = %e, "Token refresh failed");
                return Err(e);
            }
        };

        if let Err(e) = self.write_cache_file(&tokens) {
            tracing::error!(
                path = %self.settings.cache_path.display(),
                error = %e,
                "Failed to write refreshed tokens to cache"
            );
        }
        self.remember(Some(tokens.clone()));
        metrics::record_token_refresh(RefreshOutcome::Performed);
        tracing::info!(expires_in_secs = tokens.remaining().as_secs(), "Tokens refreshed");

        if let Err(e) = persist_fn(tokens.clone()).await {
            tracing::warn!(error = %e, "Failed to persist refreshed tokens");
        }

        Ok(tokens)
    }

    /// Write-through after an interactive exchange so sibling processes see
    /// the new tokens on their next cache read.
    pub async fn update_cache(&self, tokens: &TokenSet) -> Result<(), TokenError> {
        let _guard = self.acquire_lock().await?;
        self.write_cache_file(tokens)?;
        self.remember(Some(tokens.clone()));
        Ok(())
    }

    fn remember(&self, tokens: Option<TokenSet>) {
        *self.memo.lock() = Some(Memo {
            tokens,
            read_at: Instant::now(),
        });
    }

    async fn acquire_lock(&self) -> Result<LockGuard, TokenError> {
        let path = self.settings.lock_path();
        if let Some(parent) = non_empty_parent(&path) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let started = Instant::now();
        loop {
            match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    tracing::debug!(
                        path = %path.display(),
                        waited_ms = started.elapsed().as_millis(),
                        "Token lock acquired"
                    );
                    return Ok(LockGuard { file, path });
                }
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= self.settings.lock_timeout {
                        tracing::warn!(
                            path = %path.display(),
                            waited_ms = waited.as_millis(),
                            "Timed out waiting for token lock"
                        );
                        return Err(TokenError::LockTimeout { waited });
                    }
                    tokio::time::sleep(self.settings.lock_poll_interval).await;
                }
                Err(e) => return Err(TokenError::Io(e)),
            }
        }
    }

    fn write_cache_file(&self, tokens: &TokenSet) -> Result<(), TokenError> {
        let path = &self.settings.cache_path;
        let dir = non_empty_parent(path).unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, tokens)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| TokenError::Io(e.error))?;
        Ok(())
    }
}

fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
