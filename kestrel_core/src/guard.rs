use crate::input::Input;
use log::{info, warn};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const DEFAULT_THROUGHPUT_WINDOW: usize = 100;
pub const DEFAULT_SLOW_THRESHOLD: f64 = 0.5;

/// Verdict from a [`ResourceGuard`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuardStatus {
    pub critical: bool,
    pub message: String,
}

impl GuardStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            critical: false,
            message: message.into(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            critical: true,
            message: message.into(),
        }
    }
}

/// Monitors a resource the run depends on. A critical status stops the run.
pub trait ResourceGuard {
    fn name(&self) -> &str;
    fn check(&mut self) -> GuardStatus;
}

/// Rejects candidates before execution. Returns the rejection reason, if any.
pub trait OutlierFilter<I: Input> {
    fn check(&mut self, candidate: &I) -> Option<String>;
}

impl<I: Input, F> OutlierFilter<I> for F
where
    F: FnMut(&I) -> Option<String>,
{
    fn check(&mut self, candidate: &I) -> Option<String> {
        self(candidate)
    }
}

/// Goes critical once the files under a directory exceed a byte budget.
///
/// Useful for bounding the artifacts an executor leaves behind (crash dumps, logs).
#[derive(Debug, Clone)]
pub struct DirectorySizeGuard {
    name: String,
    dir: PathBuf,
    max_bytes: u64,
}

impl DirectorySizeGuard {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        let dir = dir.into();
        Self {
            name: format!("dir-size:{}", dir.display()),
            dir,
            max_bytes,
        }
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

impl ResourceGuard for DirectorySizeGuard {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&mut self) -> GuardStatus {
        if !self.dir.exists() {
            return GuardStatus::ok("directory does not exist yet");
        }
        match dir_size(&self.dir) {
            Ok(used) if used > self.max_bytes => GuardStatus::critical(format!(
                "{} uses {} bytes, limit is {}",
                self.dir.display(),
                used,
                self.max_bytes
            )),
            Ok(used) => GuardStatus::ok(format!("{used}/{} bytes", self.max_bytes)),
            Err(e) => GuardStatus::ok(format!("could not measure {}: {e}", self.dir.display())),
        }
    }
}

/// Tracks iteration throughput over a sliding window and warns when it drops.
///
/// Slow throughput is never critical; each check below `slow_threshold` it/s bumps
/// `slow_warnings` and logs a warning.
#[derive(Debug, Clone)]
pub struct ThroughputGuard {
    window: VecDeque<Instant>,
    window_size: usize,
    slow_threshold: f64,
    started: Option<Instant>,
    total_iterations: u64,
    slow_warnings: u64,
}

impl Default for ThroughputGuard {
    fn default() -> Self {
        Self::new(DEFAULT_THROUGHPUT_WINDOW, DEFAULT_SLOW_THRESHOLD)
    }
}

impl ThroughputGuard {
    pub fn new(window_size: usize, slow_threshold: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size.max(2)),
            window_size: window_size.max(2),
            slow_threshold,
            started: None,
            total_iterations: 0,
            slow_warnings: 0,
        }
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    fn start_at(&mut self, now: Instant) {
        self.started = Some(now);
        self.window.clear();
        self.window.push_back(now);
    }

    /// Records one completed iteration.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
        self.total_iterations += 1;
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(now);
    }

    /// Iterations per second across the window. `None` until two timestamps exist.
    pub fn window_rate(&self) -> Option<f64> {
        let (first, last) = (self.window.front()?, self.window.back()?);
        if self.window.len() < 2 {
            return None;
        }
        let elapsed = last.duration_since(*first).as_secs_f64();
        Some(if elapsed > 0.0 {
            (self.window.len() - 1) as f64 / elapsed
        } else {
            f64::INFINITY
        })
    }

    pub fn average_rate(&self) -> f64 {
        self.average_rate_at(Instant::now())
    }

    fn average_rate_at(&self, now: Instant) -> f64 {
        match self.started {
            Some(started) if self.total_iterations > 0 => {
                let elapsed = now.duration_since(started).as_secs_f64();
                if elapsed > 0.0 {
                    self.total_iterations as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Time left for `remaining` iterations at the average rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.average_rate();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn total_iterations(&self) -> u64 {
        self.total_iterations
    }

    pub fn slow_warnings(&self) -> u64 {
        self.slow_warnings
    }

    pub fn status_line(&self) -> String {
        let window = self.window_rate().unwrap_or(0.0);
        format!("{:.2} it/s (avg {:.2})", window, self.average_rate())
    }
}

impl ResourceGuard for ThroughputGuard {
    fn name(&self) -> &str {
        "throughput"
    }

    fn check(&mut self) -> GuardStatus {
        match self.window_rate() {
            Some(rate) if rate < self.slow_threshold => {
                self.slow_warnings += 1;
                warn!(
                    "slow iteration rate: {:.2} it/s (threshold {:.2})",
                    rate, self.slow_threshold
                );
                GuardStatus::ok(format!(
                    "slow: {rate:.2} it/s below {:.2}",
                    self.slow_threshold
                ))
            }
            Some(rate) => GuardStatus::ok(format!("{rate:.2} it/s")),
            None => GuardStatus::ok("not enough iterations to measure"),
        }
    }
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
pub fn available_bytes(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string and `stat` is a plain C struct
    // that statvfs fully initializes on success.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space query is only implemented on unix",
    ))
}

type FreeSpaceProbe = Box<dyn FnMut(&Path) -> io::Result<u64> + Send>;

/// Goes critical when free disk space under a directory drops below a floor.
///
/// With cleanup patterns set, low space first triggers removal of matching files and
/// directories under the watched directory; the guard is only critical if space is still
/// short afterwards. A pattern is either an exact file name or `*suffix`.
pub struct FreeSpaceGuard {
    name: String,
    dir: PathBuf,
    min_free_bytes: u64,
    cleanup_patterns: Vec<String>,
    probe: FreeSpaceProbe,
    warnings: u64,
    cleanups: u64,
}

impl FreeSpaceGuard {
    pub fn new(dir: impl Into<PathBuf>, min_free_bytes: u64) -> Self {
        let dir = dir.into();
        Self {
            name: format!("free-space:{}", dir.display()),
            dir,
            min_free_bytes,
            cleanup_patterns: Vec::new(),
            probe: Box::new(available_bytes),
            warnings: 0,
            cleanups: 0,
        }
    }

    pub fn with_cleanup<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.cleanup_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the free-space query.
    pub fn with_probe(mut self, probe: impl FnMut(&Path) -> io::Result<u64> + Send + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn warnings(&self) -> u64 {
        self.warnings
    }

    pub fn cleanups(&self) -> u64 {
        self.cleanups
    }

    fn matches(&self, file_name: &str) -> bool {
        self.cleanup_patterns.iter().any(|pattern| match pattern.strip_prefix('*') {
            Some(suffix) => file_name.ends_with(suffix),
            None => file_name == pattern,
        })
    }

    fn remove_matching(&self, dir: &Path) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.matches(&name) {
                let result = if is_dir {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("could not remove {}: {e}", path.display()),
                }
            } else if is_dir {
                removed += self.remove_matching(&path);
            }
        }
        removed
    }

    /// Removes every cleanup match under the watched directory.
    pub fn cleanup(&mut self) -> usize {
        let removed = self.remove_matching(&self.dir);
        if removed > 0 {
            self.cleanups += 1;
        }
        removed
    }
}

impl ResourceGuard for FreeSpaceGuard {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&mut self) -> GuardStatus {
        let free = match (self.probe)(&self.dir) {
            Ok(free) => free,
            Err(e) => return GuardStatus::ok(format!("could not query free space: {e}")),
        };
        if free >= self.min_free_bytes {
            return GuardStatus::ok(format!("{free} bytes free"));
        }

        self.warnings += 1;
        warn!(
            "only {} bytes free under {} (floor {})",
            free,
            self.dir.display(),
            self.min_free_bytes
        );
        if self.cleanup_patterns.is_empty() {
            return GuardStatus::critical(format!(
                "{free} bytes free, below {}",
                self.min_free_bytes
            ));
        }

        let removed = self.cleanup();
        let free = match (self.probe)(&self.dir) {
            Ok(free) => free,
            Err(e) => return GuardStatus::critical(format!("free space unknown after cleanup: {e}")),
        };
        if free < self.min_free_bytes {
            GuardStatus::critical(format!(
                "still {free} bytes free after removing {removed} entries, below {}",
                self.min_free_bytes
            ))
        } else {
            info!("cleanup removed {removed} entries, {free} bytes free");
            GuardStatus::ok(format!("cleaned {removed} entries, {free} bytes free"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[test]
    fn directory_guard_turns_critical_over_budget() {
        let dir = tempdir().unwrap();
        let mut guard = DirectorySizeGuard::new(dir.path(), 10);
        assert!(!guard.check().critical);

        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("dump.bin"), [0u8; 16]).unwrap();
        let status = guard.check();
        assert!(status.critical);
        assert!(status.message.contains("16"));
    }

    #[test]
    fn missing_directory_is_not_critical() {
        let dir = tempdir().unwrap();
        let mut guard = DirectorySizeGuard::new(dir.path().join("absent"), 0);
        assert!(!guard.check().critical);
        assert!(guard.name().starts_with("dir-size:"));
    }

    #[test]
    fn closures_act_as_outlier_filters() {
        let mut filter = |candidate: &Vec<u8>| {
            (candidate.len() > 3).then(|| format!("too long: {}", candidate.len()))
        };
        assert_eq!(OutlierFilter::check(&mut filter, &vec![1, 2]), None);
        assert_eq!(
            OutlierFilter::check(&mut filter, &vec![0; 5]),
            Some("too long: 5".to_string())
        );
    }

    #[test]
    fn throughput_window_flags_slow_iterations() {
        let mut guard = ThroughputGuard::new(3, 0.5);
        assert!(guard.window_rate().is_none());
        assert!(!guard.check().critical);
        assert_eq!(guard.slow_warnings(), 0);

        let t0 = Instant::now();
        guard.start_at(t0);
        guard.tick_at(t0 + Duration::from_secs(10));
        guard.tick_at(t0 + Duration::from_secs(20));
        let rate = guard.window_rate().unwrap();
        assert!((rate - 0.1).abs() < 1e-9, "rate was {rate}");
        let status = guard.check();
        assert!(!status.critical);
        assert!(status.message.starts_with("slow"));
        assert_eq!(guard.slow_warnings(), 1);

        // The window only keeps the most recent timestamps.
        guard.tick_at(t0 + Duration::from_millis(20_100));
        guard.tick_at(t0 + Duration::from_millis(20_200));
        assert!(guard.window_rate().unwrap() > 0.5);
        assert!(!guard.check().message.starts_with("slow"));
        assert_eq!(guard.slow_warnings(), 1);
        assert_eq!(guard.total_iterations(), 4);
        assert!((guard.average_rate_at(t0 + Duration::from_secs(40)) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn free_space_guard_is_critical_without_cleanup() {
        let dir = tempdir().unwrap();
        let mut guard = FreeSpaceGuard::new(dir.path(), 100).with_probe(|_: &Path| Ok(50));
        let status = guard.check();
        assert!(status.critical);
        assert_eq!(guard.warnings(), 1);

        let mut roomy = FreeSpaceGuard::new(dir.path(), 100).with_probe(|_: &Path| Ok(500));
        assert!(!roomy.check().critical);
        assert_eq!(roomy.warnings(), 0);
    }

    #[test]
    fn free_space_guard_recovers_after_cleanup() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("run")).unwrap();
        fs::write(dir.path().join("run").join("scratch.tmp"), b"x").unwrap();
        fs::create_dir(dir.path().join("run").join("cache")).unwrap();
        fs::write(dir.path().join("run").join("cache").join("blob"), b"y").unwrap();
        fs::write(dir.path().join("report.txt"), b"keep").unwrap();

        // Space is short until the first cleanup has run.
        let queries = Arc::new(Mutex::new(0u32));
        let seen = Arc::clone(&queries);
        let mut guard = FreeSpaceGuard::new(dir.path(), 100)
            .with_cleanup(["*.tmp", "cache"])
            .with_probe(move |_: &Path| {
                let mut n = seen.lock().unwrap();
                *n += 1;
                Ok(if *n == 1 { 10 } else { 1000 })
            });
        let status = guard.check();
        assert!(!status.critical, "{}", status.message);
        assert_eq!(guard.cleanups(), 1);
        assert!(!dir.path().join("run").join("scratch.tmp").exists());
        assert!(!dir.path().join("run").join("cache").exists());
        assert!(dir.path().join("report.txt").exists());
    }

    #[test]
    fn free_space_guard_stays_critical_when_cleanup_is_not_enough() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.tmp"), b"x").unwrap();
        let mut guard = FreeSpaceGuard::new(dir.path(), 100)
            .with_cleanup(["*.tmp"])
            .with_probe(|_: &Path| Ok(10));
        let status = guard.check();
        assert!(status.critical);
        assert!(status.message.contains("after removing 1"));
    }

    #[cfg(unix)]
    #[test]
    fn available_bytes_reads_the_real_filesystem() {
        let dir = tempdir().unwrap();
        assert!(available_bytes(dir.path()).is_ok());
        assert!(available_bytes(&dir.path().join("missing")).is_err());
    }
}
