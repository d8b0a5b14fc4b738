//! File cache tier (L2).
//!
//! A TTL-bounded persistent tier under a single cache directory. Records use
//! a compact binary layout:
//!
//! ```text
//! [0..8)   i64 LE  expires_ticks   100 ns ticks since the Unix epoch, UTC
//! [8..12)  i32 LE  payload_len
//! [12..]   u8[]    payload
//! ```
//!
//! File names are the hex BLAKE2b-128 digest of the formatted key. All I/O
//! runs under the per-key sharded spinlock, and every I/O failure in
//! get/set/remove is logged and reported as a miss: the disk tier is an
//! opportunistic accelerator and must degrade instead of failing. A
//! background loop reclaims files whenever the volume's free-space ratio
//! drops below the configured threshold.

use crate::clock::Clock;
use crate::config::TEMP_DIR_SENTINEL;
use crate::disk_space::DiskSpace;
use crate::key::hashed_file_name;
use crate::shard_lock::ShardedSlotLock;
use crate::traits::Serializer;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

const HEADER_LEN: usize = 12;
const RECLAIM_INTERVAL: Duration = Duration::from_secs(10);
const DIRECTORY_SPIN: Duration = Duration::from_millis(1);
const CLEAR_RETRY_DELAY: Duration = Duration::from_secs(1);
const CLEAR_RETRIES: u32 = 10;

/// Characters rejected in a configured cache directory.
const INVALID_PATH_CHARS: &[char] = &['<', '>', '"', '|', '?', '*', '\0'];

/// A record read from the disk tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCacheItem<T> {
    /// Absolute expiry carried in the record header.
    pub expires: SystemTime,
    pub value: T,
    /// Payload length in bytes.
    pub size: u32,
}

/// Input to [`FileCache::set`]: already-serialized bytes are written as-is so
/// write-through never serializes twice.
pub enum FilePayload<'a, T: Serialize + ?Sized> {
    Raw(&'a [u8]),
    Value(&'a T),
}

/// Self-limiting persistent cache tier.
pub struct FileCache {
    dir: PathBuf,
    locks: ShardedSlotLock,
    clock: Arc<dyn Clock>,
    disk: Arc<dyn DiskSpace>,
    free_space_threshold_pct: u8,
    /// Sticky flag held while `clear` rebuilds the directory; all other
    /// operations spin on it.
    directory_locked: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl FileCache {
    /// Create the tier rooted at `<base>/<app_name>/FileCache`.
    ///
    /// `base` may be the literal `%temp%` sentinel (case-insensitive) for the
    /// system temp directory. Paths containing invalid characters are
    /// rejected.
    pub fn new(
        base: &str,
        app_name: &str,
        free_space_threshold_pct: u8,
        clock: Arc<dyn Clock>,
        disk: Arc<dyn DiskSpace>,
    ) -> Result<Arc<Self>> {
        for candidate in [base, app_name] {
            if candidate.contains(INVALID_PATH_CHARS) {
                bail!("invalid characters in cache path segment '{candidate}'");
            }
        }

        let root = if base.eq_ignore_ascii_case(TEMP_DIR_SENTINEL) {
            std::env::temp_dir()
        } else {
            PathBuf::from(base)
        };
        let dir = root.join(app_name).join("FileCache");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache directory '{}'", dir.display()))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            dir,
            locks: ShardedSlotLock::default(),
            clock,
            disk,
            free_space_threshold_pct,
            directory_locked: AtomicBool::new(false),
            shutdown_tx,
        }))
    }

    /// Root directory of this tier.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    async fn wait_directory_unlocked(&self) {
        while self.directory_locked.load(Ordering::Acquire) {
            self.clock.sleep(DIRECTORY_SPIN).await;
        }
    }

    /// Read raw payload bytes for `key`, skipping deserialization.
    pub async fn get_bytes(&self, key: &str) -> Option<FileCacheItem<Bytes>> {
        self.wait_directory_unlocked().await;
        let file_name = hashed_file_name(key);
        let _guard = self.locks.lock(&file_name).await;
        let path = self.path_for(&file_name);

        match self.read_record(&path).await {
            Ok(item) => item,
            Err(err) => {
                // Corruption is never propagated; purge and report a miss.
                warn!(key, path = %path.display(), error = %err, "unreadable cache file, deleting");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    /// Read and deserialize `key`. Decode failures purge the file and report
    /// a miss, like any other corruption.
    pub async fn get_value<T, C>(&self, key: &str, codec: &C) -> Option<FileCacheItem<T>>
    where
        T: DeserializeOwned,
        C: Serializer,
    {
        let item = self.get_bytes(key).await?;
        match codec.deserialize::<T>(&item.value) {
            Ok(value) => Some(FileCacheItem {
                expires: item.expires,
                value,
                size: item.size,
            }),
            Err(err) => {
                warn!(key, error = %err, "undecodable cache file, deleting");
                self.remove(key).await;
                None
            }
        }
    }

    async fn read_record(&self, path: &Path) -> Result<Option<FileCacheItem<Bytes>>> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header).await.context("short header")?;
        let (expires, payload_len) = decode_header(&header)?;

        if self.clock.now() >= expires {
            drop(file);
            let _ = tokio::fs::remove_file(path).await;
            return Ok(None);
        }

        let mut payload = vec![0u8; payload_len];
        file.read_exact(&mut payload)
            .await
            .context("truncated payload")?;

        Ok(Some(FileCacheItem {
            expires,
            size: payload_len as u32,
            value: Bytes::from(payload),
        }))
    }

    /// Write `key` with a TTL. Raw payloads are written as-is; values are
    /// serialized with `codec` first. I/O and serialization failures are
    /// logged and swallowed.
    pub async fn set<T, C>(&self, key: &str, payload: FilePayload<'_, T>, ttl: Duration, codec: &C)
    where
        T: Serialize + ?Sized,
        C: Serializer,
    {
        let owned;
        let bytes: &[u8] = match payload {
            FilePayload::Raw(bytes) => bytes,
            FilePayload::Value(value) => match codec.serialize(value) {
                Ok(encoded) => {
                    owned = encoded;
                    &owned
                }
                Err(err) => {
                    error!(key, error = %err, "failed to serialize value for file cache");
                    return;
                }
            },
        };

        self.wait_directory_unlocked().await;
        let file_name = hashed_file_name(key);
        let _guard = self.locks.lock(&file_name).await;
        let path = self.path_for(&file_name);
        let expires = self.clock.now() + ttl;

        if let Err(err) = self.write_record(&path, expires, bytes).await {
            error!(key, path = %path.display(), error = %err, "file cache write failed");
        }
    }

    async fn write_record(&self, path: &Path, expires: SystemTime, payload: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(&encode_header(expires, payload.len())?).await?;
        file.write_all(payload).await?;
        file.flush().await?;
        Ok(())
    }

    /// Delete `key` if present. Failures are logged and swallowed.
    pub async fn remove(&self, key: &str) {
        self.wait_directory_unlocked().await;
        let file_name = hashed_file_name(key);
        let _guard = self.locks.lock(&file_name).await;
        let path = self.path_for(&file_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => error!(key, path = %path.display(), error = %err, "file cache remove failed"),
        }
    }

    /// Remove and recreate the whole directory.
    ///
    /// Sets the sticky directory lock first; concurrent operations spin on it
    /// instead of racing the teardown. The rebuild is retried for transient
    /// failures (editors, scanners holding handles) and the lock is released
    /// whether or not the retries were exhausted.
    pub async fn clear(&self) {
        self.directory_locked.store(true, Ordering::Release);

        for attempt in 1..=CLEAR_RETRIES {
            match std::fs::remove_dir_all(&self.dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(attempt, error = %err, "failed to remove cache directory");
                    self.clock.sleep(CLEAR_RETRY_DELAY).await;
                    continue;
                }
            }
            match std::fs::create_dir_all(&self.dir) {
                Ok(()) => {
                    debug!(dir = %self.dir.display(), "file cache cleared");
                    break;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "failed to recreate cache directory");
                    self.clock.sleep(CLEAR_RETRY_DELAY).await;
                }
            }
        }

        self.directory_locked.store(false, Ordering::Release);
    }

    /// Start the background free-space reclaim loop. Stopped by
    /// [`FileCache::shutdown`].
    pub fn start_reclaim(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    () = cache.clock.sleep(RECLAIM_INTERVAL) => {}
                }
                cache.reclaim_pass().await;
            }
        })
    }

    /// Stop the reclaim loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn free_ratio(free: u64, total: u64) -> f64 {
        if total == 0 {
            1.0
        } else {
            free as f64 / total as f64
        }
    }

    /// Delete files until the volume's free ratio is back over the
    /// threshold. Runs until a full pass deletes nothing.
    pub(crate) async fn reclaim_pass(&self) {
        let threshold = f64::from(self.free_space_threshold_pct) / 100.0;

        loop {
            let Ok((free, total)) = self.disk.free_and_total(&self.dir) else {
                return;
            };
            if Self::free_ratio(free, total) >= threshold {
                return;
            }

            let mut reclaimed = free;
            let mut deleted_any = false;
            let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
                return;
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy().into_owned();

                {
                    let _guard = self.locks.lock(&file_name).await;
                    let size = self.disk.file_size(&path).unwrap_or(0);
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {
                            reclaimed += size;
                            deleted_any = true;
                            debug!(path = %path.display(), size, "reclaimed cache file");
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "reclaim delete failed");
                        }
                    }
                }

                if Self::free_ratio(reclaimed, total) >= threshold {
                    return;
                }
                self.clock.sleep(Duration::from_millis(1)).await;
            }

            if !deleted_any {
                return;
            }
        }
    }
}

fn ticks_since_epoch(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_nanos() / 100) as i64,
        Err(_) => 0,
    }
}

fn time_from_ticks(ticks: i64) -> SystemTime {
    if ticks <= 0 {
        return SystemTime::UNIX_EPOCH;
    }
    SystemTime::UNIX_EPOCH + Duration::from_nanos(ticks as u64 * 100)
}

fn encode_header(expires: SystemTime, payload_len: usize) -> Result<[u8; HEADER_LEN]> {
    let len = i32::try_from(payload_len).context("payload too large for record header")?;
    let mut header = [0u8; HEADER_LEN];
    header[0..8].copy_from_slice(&ticks_since_epoch(expires).to_le_bytes());
    header[8..12].copy_from_slice(&len.to_le_bytes());
    Ok(header)
}

fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(SystemTime, usize)> {
    let ticks = i64::from_le_bytes(header[0..8].try_into()?);
    let payload_len = i32::from_le_bytes(header[8..12].try_into()?);
    if payload_len < 0 {
        bail!("negative payload length {payload_len}");
    }
    Ok((time_from_ticks(ticks), payload_len as usize))
}
