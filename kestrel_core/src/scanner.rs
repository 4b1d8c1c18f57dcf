use log::{debug, warn};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Surfaces failure artifacts that appeared since the previous scan.
pub trait BugScanner {
    fn scan(&mut self) -> Result<Vec<String>, anyhow::Error>;
}

/// Reads every new file under a directory tree, once.
///
/// Executors that persist crash reports to disk pair with this scanner: each file's
/// contents are returned as one raw diagnostic the first time the file is seen.
#[derive(Debug, Clone)]
pub struct DirectoryBugScanner {
    root: PathBuf,
    extension: Option<String>,
    seen: BTreeSet<PathBuf>,
}

impl DirectoryBugScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: None,
            seen: BTreeSet::new(),
        }
    }

    /// Only report files with this extension (without the dot).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    fn collect_files(&self, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_files(&path, out)?;
            } else if self.matches(&path) {
                out.push(path);
            }
        }
        Ok(())
    }

    fn matches(&self, path: &Path) -> bool {
        match &self.extension {
            Some(ext) => path.extension().is_some_and(|e| e == ext.as_str()),
            None => true,
        }
    }
}

impl BugScanner for DirectoryBugScanner {
    fn scan(&mut self) -> Result<Vec<String>, anyhow::Error> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        self.collect_files(&self.root, &mut files)
            .map_err(|e| anyhow::anyhow!("Failed to scan {:?}: {}", self.root, e))?;
        files.sort();

        let mut reports = Vec::new();
        for path in files {
            if self.seen.contains(&path) {
                continue;
            }
            match fs::read(&path) {
                Ok(bytes) => {
                    reports.push(String::from_utf8_lossy(&bytes).into_owned());
                    self.seen.insert(path);
                }
                Err(e) => warn!("could not read bug artifact {path:?}: {e}"),
            }
        }
        if !reports.is_empty() {
            debug!("bug scan of {:?} found {} new artifacts", self.root, reports.len());
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn each_artifact_is_reported_once() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.log"), "ValueError: bad shape").unwrap();
        let mut scanner = DirectoryBugScanner::new(dir.path());

        assert_eq!(scanner.scan().unwrap(), vec!["ValueError: bad shape".to_string()]);
        assert!(scanner.scan().unwrap().is_empty());

        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.log"), "Segmentation fault").unwrap();
        assert_eq!(scanner.scan().unwrap(), vec!["Segmentation fault".to_string()]);
        assert_eq!(scanner.seen_count(), 2);
    }

    #[test]
    fn extension_filter_skips_other_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), "kept").unwrap();
        fs::write(dir.path().join("skip.bin"), "skipped").unwrap();
        let mut scanner = DirectoryBugScanner::new(dir.path()).with_extension("txt");
        assert_eq!(scanner.scan().unwrap(), vec!["kept".to_string()]);
    }

    #[test]
    fn missing_root_yields_nothing() {
        let dir = tempdir().unwrap();
        let mut scanner = DirectoryBugScanner::new(dir.path().join("not-yet"));
        assert!(scanner.scan().unwrap().is_empty());
    }
}
