//! Emergency stop: an out-of-band signal that cancels in-progress work.
//!
//! Engaged either in-process or by the presence of a flag file, so an
//! operator can halt every running episode with `tether estop` from
//! another shell. Episodes check it before each tool invocation.
//!
//! Looking at the flag file is a blocking filesystem call made from async
//! code on every invocation, so its result is reused for a short poll
//! interval. Engaging or releasing through this switch takes effect at
//! once; a flag file dropped by another process is seen within one
//! interval.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default reuse window for a flag-file check.
pub const DEFAULT_FLAG_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct KillSwitch {
    engaged: AtomicBool,
    reason: Mutex<Option<String>>,
    flag_file: Option<PathBuf>,
    poll_interval: Duration,
    last_flag_check: Mutex<Option<(Instant, bool)>>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self {
            engaged: AtomicBool::new(false),
            reason: Mutex::new(None),
            flag_file: None,
            poll_interval: DEFAULT_FLAG_POLL_INTERVAL,
            last_flag_check: Mutex::new(None),
        }
    }
}

impl KillSwitch {
    /// In-memory switch only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch that is also engaged whenever `path` exists.
    pub fn with_flag_file(path: impl Into<PathBuf>) -> Self {
        Self {
            flag_file: Some(path.into()),
            ..Self::default()
        }
    }

    /// How long a flag-file check is reused. Zero checks every time.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn flag_file(&self) -> Option<&Path> {
        self.flag_file.as_deref()
    }

    /// Engage the switch, writing the flag file if one is configured.
    pub fn engage(&self, reason: impl Into<String>) -> std::io::Result<()> {
        let reason = reason.into();
        if let Some(path) = &self.flag_file {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(path, format!("{}\n{}", Utc::now().to_rfc3339(), reason))?;
        }
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        self.engaged.store(true, Ordering::SeqCst);
        self.forget_flag_check();
        tracing::warn!(%reason, "Kill switch engaged");
        Ok(())
    }

    /// Release the switch and remove the flag file. Returns whether it was engaged.
    pub fn release(&self) -> std::io::Result<bool> {
        let mut was_engaged = self.engaged.swap(false, Ordering::SeqCst);
        if let Some(path) = &self.flag_file {
            if path.exists() {
                std::fs::remove_file(path)?;
                was_engaged = true;
            }
        }
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.forget_flag_check();
        if was_engaged {
            tracing::info!("Kill switch released");
        }
        Ok(was_engaged)
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst) || self.flag_present()
    }

    fn flag_present(&self) -> bool {
        let Some(path) = &self.flag_file else {
            return false;
        };
        let mut last = self
            .last_flag_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some((at, present)) = *last {
            if now.duration_since(at) < self.poll_interval {
                return present;
            }
        }
        let present = path.exists();
        *last = Some((now, present));
        present
    }

    fn forget_flag_check(&self) {
        *self
            .last_flag_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Why the switch is engaged, if it is.
    pub fn reason(&self) -> Option<String> {
        if let Some(r) = self
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Some(r);
        }
        let path = self.flag_file.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        let reason = content.lines().nth(1).unwrap_or("").trim();
        Some(if reason.is_empty() {
            "emergency stop".to_string()
        } else {
            reason.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_engage_and_release() {
        let ks = KillSwitch::new();
        assert!(!ks.is_engaged());
        ks.engage("operator").unwrap();
        assert!(ks.is_engaged());
        assert_eq!(ks.reason().as_deref(), Some("operator"));
        assert!(ks.release().unwrap());
        assert!(!ks.is_engaged());
        assert!(!ks.release().unwrap());
    }

    #[test]
    fn flag_file_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".estop");
        let ks = KillSwitch::with_flag_file(&path);

        ks.engage("maintenance").unwrap();
        assert!(path.exists());

        ks.release().unwrap();
        assert!(!path.exists());
        assert!(!ks.is_engaged());
    }

    #[test]
    fn external_flag_file_engages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".estop");
        let ks = KillSwitch::with_flag_file(&path).with_poll_interval(Duration::ZERO);
        assert!(!ks.is_engaged());

        // Another process drops the file.
        std::fs::write(&path, "2026-01-01T00:00:00Z\nincident 42").unwrap();
        assert!(ks.is_engaged());
        assert_eq!(ks.reason().as_deref(), Some("incident 42"));
    }

    #[test]
    fn flag_check_reused_within_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".estop");
        let ks = KillSwitch::with_flag_file(&path).with_poll_interval(Duration::from_secs(3600));
        assert!(!ks.is_engaged());

        std::fs::write(&path, "2026-01-01T00:00:00Z\nincident 42").unwrap();
        // still the cached answer
        assert!(!ks.is_engaged());

        // local engage and release bypass the cache
        ks.engage("operator").unwrap();
        assert!(ks.is_engaged());
        ks.release().unwrap();
        assert!(!path.exists());
        assert!(!ks.is_engaged());
    }

    #[test]
    fn stale_check_is_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".estop");
        let ks = KillSwitch::with_flag_file(&path).with_poll_interval(Duration::from_millis(20));
        assert!(!ks.is_engaged());

        std::fs::write(&path, "2026-01-01T00:00:00Z\nincident 42").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(ks.is_engaged());
    }
}
