use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const UNLIMITED_CHUNK: usize = 64 * 1024;
const MIN_CHUNK: usize = 4 * 1024;
const MAX_CHUNK: usize = 256 * 1024;

/// Token bucket shared by every transfer going in one direction.
///
/// The limit is read at each tick, so it can change while transfers run.
/// A limit of zero disables throttling.
#[derive(Debug)]
pub struct Bandwidth {
    limit: AtomicU64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    refilled_at: Instant,
}

impl Bandwidth {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            limit: AtomicU64::new(bytes_per_sec),
            bucket: Mutex::new(Bucket {
                available: bytes_per_sec as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, bytes_per_sec: u64) {
        self.limit.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// How much to read or write in the next tick.
    pub fn chunk_size(&self) -> usize {
        match self.limit() {
            0 => UNLIMITED_CHUNK,
            limit => ((limit / 10) as usize).clamp(MIN_CHUNK, MAX_CHUNK),
        }
    }

    /// Takes `bytes` from the bucket, sleeping off any deficit.
    pub async fn acquire(&self, bytes: u64) {
        if let Some(wait) = self.reserve(bytes) {
            tokio::time::sleep(wait).await;
        }
    }

    fn reserve(&self, bytes: u64) -> Option<Duration> {
        let limit = self.limit();
        if limit == 0 {
            return None;
        }
        let Ok(mut bucket) = self.bucket.lock() else {
            return None;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        // One second worth of burst at most.
        bucket.available = (bucket.available + elapsed * limit as f64).min(limit as f64);
        bucket.refilled_at = now;
        bucket.available -= bytes as f64;
        if bucket.available >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-bucket.available / limit as f64))
        }
    }
}

impl Default for Bandwidth {
    fn default() -> Self {
        Self::new(0)
    }
}
