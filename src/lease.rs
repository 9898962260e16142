//! File-backed run lease.
//!
//! One lease file per queue. Whoever holds the file holds the lease; the
//! file body is the acquisition time in epoch milliseconds. A lease older
//! than the TTL is considered abandoned by a crashed holder and is taken
//! over. Two runs can both pass the staleness check in a narrow window;
//! every durable mutation afterwards is gated behind artifact validation,
//! which tolerates being re-run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::telemetry::metrics;

/// Acquires and inspects the lease file.
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    ttl: Duration,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lease. `Ok(None)` means another run holds an
    /// unexpired lease. A lease exactly `ttl` old is expired.
    pub fn acquire(&self) -> Result<Option<LeaseGuard>> {
        self.acquire_at(Utc::now())
    }

    /// `acquire` with an explicit clock.
    pub fn acquire_at(&self, now: DateTime<Utc>) -> Result<Option<LeaseGuard>> {
        let mut result = "acquired";

        if let Some(held) = self.read_lease()? {
            match held {
                Some(since) if !self.is_stale(since, now) => {
                    info!(path = %self.path.display(), since = %since, "lease held by another run");
                    metrics::lease_acquisitions().add(1, &[KeyValue::new("result", "held")]);
                    return Ok(None);
                }
                Some(since) => {
                    warn!(path = %self.path.display(), since = %since, "stale lease found, taking over");
                }
                None => {
                    warn!(path = %self.path.display(), "unreadable lease file, taking over");
                }
            }
            result = "taken_over";
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, now.timestamp_millis().to_string())?;
        metrics::lease_acquisitions().add(1, &[KeyValue::new("result", result)]);
        debug!(path = %self.path.display(), "lease acquired");

        Ok(Some(LeaseGuard {
            path: self.path.clone(),
            acquired_at: now,
            released: false,
        }))
    }

    /// When the current lease was taken, if one exists and is readable.
    pub fn held_since(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_lease()?.flatten())
    }

    fn is_stale(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(since);
        // A timestamp from the future is treated as fresh.
        age.to_std().map(|age| age >= self.ttl).unwrap_or(false)
    }

    /// `None` if there is no lease file, `Some(None)` if it exists but is
    /// not a valid timestamp.
    fn read_lease(&self) -> Result<Option<Option<DateTime<Utc>>>> {
        match std::fs::read_to_string(&self.path) {
            Ok(body) => Ok(Some(
                body.trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A held lease. Released on drop, so every exit path gives it back,
/// including early returns and panics.
#[derive(Debug)]
pub struct LeaseGuard {
    path: PathBuf,
    acquired_at: DateTime<Utc>,
    released: bool,
}

impl LeaseGuard {
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Remove the lease file now.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lease released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to release lease: {e}"),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.remove();
    }
}
