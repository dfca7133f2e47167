//! Audio cache: content-addressed store of post-processed sentence audio.
//!
//! Entries never expire. Growth is bounded by an LRU over entry count and
//! total sample bytes; evicted entries are also removed from disk. With a
//! cache directory configured, each entry is persisted as `{key}.pcm` and
//! reloaded on the next start.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use cohost_core::audio::AudioBuffer;
use cohost_core::text_prep::normalize_for_cache;
use cohost_core::types::{AudioFormat, CacheConfig, VoiceParams};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::Result;

const FILE_EXT: &str = "pcm";

/// Hex SHA-256 of normalized text, voice parameters and output format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioKey(String);

impl AudioKey {
    pub fn derive(text: &str, params: &VoiceParams, format: AudioFormat) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_for_cache(text).as_bytes());
        hasher.update([0x1f]);
        hasher.update(params.voice.as_bytes());
        hasher.update([0x1f]);
        hasher.update(params.language.as_bytes());
        hasher.update([0x1f]);
        hasher.update(params.speed.to_bits().to_le_bytes());
        hasher.update(format.sample_rate.to_le_bytes());
        hasher.update(format.channels.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_file_stem(stem: &str) -> Option<Self> {
        (stem.len() == 64 && stem.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Self(stem.to_ascii_lowercase()))
    }
}

impl fmt::Display for AudioKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12])
    }
}

/// On-disk entry layout.
#[derive(bincode::Encode, bincode::Decode)]
struct StoredAudio {
    sample_rate: u32,
    channels: u16,
    created_at_ms: i64,
    samples: Vec<f32>,
}

/// Snapshot of cache occupancy and hit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioCacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

struct Inner {
    lru: LruCache<AudioKey, Arc<AudioBuffer>>,
    bytes: u64,
}

pub struct AudioCache {
    inner: Mutex<Inner>,
    dir: Option<PathBuf>,
    max_entries: usize,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AudioCache {
    /// Memory-only cache.
    pub fn in_memory(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                bytes: 0,
            }),
            dir: None,
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open the cache described by `config`, loading persisted entries
    /// oldest first so the most recent survive the size bound.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let mut cache = Self::in_memory(config.audio_max_entries, config.audio_max_bytes);
        let Some(dir) = &config.audio_dir else {
            return Ok(cache);
        };
        fs::create_dir_all(dir)?;
        cache.dir = Some(dir.clone());

        let mut loaded = load_dir(dir)?;
        loaded.sort_by_key(|(_, stored)| stored.created_at_ms);
        let count = loaded.len();
        for (key, stored) in loaded {
            let buffer = AudioBuffer {
                samples: stored.samples,
                sample_rate: stored.sample_rate,
                channels: stored.channels,
            };
            let inner = cache.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
            let evicted = insert(inner, key, Arc::new(buffer), cache.max_entries, cache.max_bytes);
            remove_files(dir, &evicted);
        }
        let stats = cache.stats();
        info!(
            dir = %dir.display(),
            found = count,
            kept = stats.entries,
            bytes = stats.bytes,
            "audio cache loaded"
        );
        Ok(cache)
    }

    pub fn get(&self, key: &AudioKey) -> Option<Arc<AudioBuffer>> {
        let hit = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lru
            .get(key)
            .cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Store `buffer` under `key` and return the cached copy. An existing
    /// entry wins; the key is never rewritten. A buffer larger than the
    /// whole byte budget is returned without being cached.
    ///
    /// The file write and any eviction happen under the cache lock, so a
    /// concurrent eviction can never delete a file that was just written.
    pub fn put(&self, key: AudioKey, buffer: AudioBuffer) -> Arc<AudioBuffer> {
        if buffer.byte_len() > self.max_bytes {
            debug!(key = %key, bytes = buffer.byte_len(), "audio too large to cache");
            return Arc::new(buffer);
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inner.lru.get(&key) {
            return existing.clone();
        }

        let buffer = Arc::new(buffer);
        if let Some(dir) = &self.dir {
            if let Err(e) = write_entry(dir, &key, &buffer) {
                warn!(key = %key, "failed to persist audio: {e}");
            }
        }
        let evicted = insert(&mut inner, key, buffer.clone(), self.max_entries, self.max_bytes);
        if let Some(dir) = &self.dir {
            remove_files(dir, &evicted);
        }
        buffer
    }

    pub fn contains(&self, key: &AudioKey) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lru
            .contains(key)
    }

    pub fn stats(&self) -> AudioCacheStats {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        AudioCacheStats {
            entries: inner.lru.len(),
            bytes: inner.bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop every entry, in memory and on disk.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<AudioKey> = inner.lru.iter().map(|(k, _)| k.clone()).collect();
        inner.lru.clear();
        inner.bytes = 0;
        if let Some(dir) = &self.dir {
            remove_files(dir, &keys);
        }
    }
}

/// Insert and evict past the bounds. Returns the evicted keys.
fn insert(
    inner: &mut Inner,
    key: AudioKey,
    buffer: Arc<AudioBuffer>,
    max_entries: usize,
    max_bytes: u64,
) -> Vec<AudioKey> {
    if inner.lru.contains(&key) {
        return Vec::new();
    }
    inner.bytes += buffer.byte_len();
    inner.lru.put(key, buffer);

    let mut evicted = Vec::new();
    while inner.lru.len() > max_entries || inner.bytes > max_bytes {
        let Some((old_key, old)) = inner.lru.pop_lru() else {
            break;
        };
        inner.bytes -= old.byte_len();
        evicted.push(old_key);
    }
    if !evicted.is_empty() {
        debug!(count = evicted.len(), bytes = inner.bytes, "audio cache evicted");
    }
    evicted
}

fn remove_files(dir: &Path, keys: &[AudioKey]) {
    for key in keys {
        remove_file_logged(&entry_path(dir, key));
    }
}

fn remove_file_logged(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "failed to remove cached audio: {e}");
        }
    }
}

fn entry_path(dir: &Path, key: &AudioKey) -> PathBuf {
    dir.join(format!("{}.{FILE_EXT}", key.0))
}

fn write_entry(dir: &Path, key: &AudioKey, buffer: &AudioBuffer) -> Result<()> {
    let stored = StoredAudio {
        sample_rate: buffer.sample_rate,
        channels: buffer.channels,
        created_at_ms: Utc::now().timestamp_millis(),
        samples: buffer.samples.clone(),
    };
    let bytes = bincode::encode_to_vec(&stored, bincode::config::standard())
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let path = entry_path(dir, key);
    let tmp = path.with_extension(format!("{FILE_EXT}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Read every entry in `dir`. Unreadable entries are deleted.
fn load_dir(dir: &Path) -> Result<Vec<(AudioKey, StoredAudio)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
            continue;
        }
        let Some(key) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(AudioKey::from_file_stem)
        else {
            continue;
        };
        match read_entry(&path) {
            Ok(stored) => out.push((key, stored)),
            Err(reason) => {
                warn!(path = %path.display(), "dropping unreadable cached audio: {reason}");
                remove_file_logged(&path);
            }
        }
    }
    Ok(out)
}

fn read_entry(path: &Path) -> std::result::Result<StoredAudio, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let (stored, _): (StoredAudio, usize) =
        bincode::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
    if stored.channels == 0 || stored.sample_rate == 0 {
        return Err("zero channels or sample rate".into());
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 24_000,
        channels: 1,
    };

    fn params() -> VoiceParams {
        VoiceParams {
            voice: "af_heart".into(),
            language: "en".into(),
            speed: 1.0,
        }
    }

    fn buffer(len: usize, value: f32) -> AudioBuffer {
        AudioBuffer::new(vec![value; len], FORMAT)
    }

    fn key(text: &str) -> AudioKey {
        AudioKey::derive(text, &params(), FORMAT)
    }

    fn disk_config(dir: &Path, max_entries: usize, max_bytes: u64) -> CacheConfig {
        CacheConfig {
            audio_dir: Some(dir.to_path_buf()),
            audio_max_entries: max_entries,
            audio_max_bytes: max_bytes,
            ..Default::default()
        }
    }

    fn pcm_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some(FILE_EXT)
            })
            .count()
    }

    #[test]
    fn key_normalizes_whitespace_only() {
        assert_eq!(key("Hello  world."), key(" Hello world. "));
        assert_ne!(key("Hello world."), key("hello world."));
    }

    #[test]
    fn key_covers_voice_and_format() {
        let base = key("Hi.");
        let mut other = params();
        other.voice = "am_adam".into();
        assert_ne!(base, AudioKey::derive("Hi.", &other, FORMAT));

        let mut other = params();
        other.language = "fr".into();
        assert_ne!(base, AudioKey::derive("Hi.", &other, FORMAT));

        let mut other = params();
        other.speed = 1.25;
        assert_ne!(base, AudioKey::derive("Hi.", &other, FORMAT));

        let stereo = AudioFormat {
            sample_rate: 24_000,
            channels: 2,
        };
        assert_ne!(base, AudioKey::derive("Hi.", &params(), stereo));
    }

    #[test]
    fn get_and_put() {
        let cache = AudioCache::in_memory(10, 1 << 20);
        assert!(cache.get(&key("a")).is_none());
        cache.put(key("a"), buffer(10, 0.5));
        assert_eq!(cache.get(&key("a")).unwrap().samples.len(), 10);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 40);
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn existing_entry_not_overwritten() {
        let cache = AudioCache::in_memory(10, 1 << 20);
        cache.put(key("a"), buffer(4, 0.1));
        let kept = cache.put(key("a"), buffer(8, 0.9));
        assert_eq!(kept.samples, vec![0.1; 4]);
        assert_eq!(cache.stats().bytes, 16);
    }

    #[test]
    fn evicts_least_recently_used_by_count() {
        let cache = AudioCache::in_memory(2, 1 << 20);
        cache.put(key("a"), buffer(1, 0.0));
        cache.put(key("b"), buffer(1, 0.0));
        cache.get(&key("a"));
        cache.put(key("c"), buffer(1, 0.0));
        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
    }

    #[test]
    fn evicts_by_bytes() {
        let cache = AudioCache::in_memory(100, 100);
        cache.put(key("a"), buffer(10, 0.0)); // 40 bytes
        cache.put(key("b"), buffer(10, 0.0));
        cache.put(key("c"), buffer(10, 0.0));
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert!(stats.bytes <= 100);
        assert!(!cache.contains(&key("a")));
    }

    #[test]
    fn oversized_buffer_not_cached() {
        let cache = AudioCache::in_memory(10, 16);
        let out = cache.put(key("a"), buffer(10, 0.0));
        assert_eq!(out.samples.len(), 10);
        assert!(!cache.contains(&key("a")));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = AudioCache::open(&disk_config(dir.path(), 10, 1 << 20)).unwrap();
            cache.put(key("Hello."), buffer(5, 0.25));
        }
        assert_eq!(pcm_files(dir.path()), 1);

        let cache = AudioCache::open(&disk_config(dir.path(), 10, 1 << 20)).unwrap();
        let restored = cache.get(&key("Hello.")).unwrap();
        assert_eq!(restored.samples, vec![0.25; 5]);
        assert_eq!(restored.format(), FORMAT);
    }

    #[test]
    fn eviction_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(&disk_config(dir.path(), 2, 1 << 20)).unwrap();
        cache.put(key("a"), buffer(1, 0.0));
        cache.put(key("b"), buffer(1, 0.0));
        cache.put(key("c"), buffer(1, 0.0));
        assert_eq!(pcm_files(dir.path()), 2);
        assert!(!entry_path(dir.path(), &key("a")).exists());
    }

    #[test]
    fn concurrent_puts_keep_disk_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(AudioCache::open(&disk_config(dir.path(), 3, 1 << 20)).unwrap());
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.put(key(&format!("k{}", (t + i) % 5)), buffer(8, 0.1));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let inner = cache.inner.lock().unwrap();
        for (k, _) in inner.lru.iter() {
            assert!(entry_path(dir.path(), k).exists(), "missing file for {k}");
        }
        assert_eq!(pcm_files(dir.path()), inner.lru.len());
    }

    #[test]
    fn reopen_enforces_smaller_bound() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = AudioCache::open(&disk_config(dir.path(), 10, 1 << 20)).unwrap();
            for name in ["a", "b", "c"] {
                cache.put(key(name), buffer(1, 0.0));
            }
        }
        let cache = AudioCache::open(&disk_config(dir.path(), 1, 1 << 20)).unwrap();
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(pcm_files(dir.path()), 1);
    }

    #[test]
    fn corrupt_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let bad = entry_path(dir.path(), &key("x"));
        fs::write(&bad, b"not bincode at all").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let cache = AudioCache::open(&disk_config(dir.path(), 10, 1 << 20)).unwrap();
        assert_eq!(cache.stats().entries, 0);
        assert!(!bad.exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn clear_removes_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(&disk_config(dir.path(), 10, 1 << 20)).unwrap();
        cache.put(key("a"), buffer(1, 0.0));
        cache.put(key("b"), buffer(1, 0.0));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(pcm_files(dir.path()), 0);
    }
}
