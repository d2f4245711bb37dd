//! Trace file discovery and classification.
//!
//! [`resolve`] lists the files matching a provider's pattern. [`FileWindow`]
//! splits them into the single active file and the inactive files still
//! waiting to be processed. [`MarkerStore`] records inactive files that have
//! been read to completion.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use glob::Pattern;
use tracing::debug;

/// One candidate trace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub created: SystemTime,
    pub last_write: SystemTime,
}

/// List files in `dir` whose names match `pattern`, oldest creation first.
///
/// A missing directory yields an empty list: it is the normal state right
/// after a provider's log directory is created or rotated away. Nothing is
/// ever deleted or renamed here.
pub fn resolve(dir: &Path, pattern: &Pattern) -> Result<Vec<FileDescriptor>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "trace directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("listing {}", dir.display()));
        }
    };

    let mut files = Vec::with_capacity(16);

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let file_name = entry.file_name();
        let name = match file_name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if !pattern.matches(name) {
            continue;
        }

        // The file may vanish between listing and stat.
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };

        let last_write = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let created = meta.created().unwrap_or(last_write);

        files.push(FileDescriptor {
            name: name.to_string(),
            path: entry.path(),
            created,
            last_write,
        });
    }

    files.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));

    Ok(files)
}

/// The files one provider works on in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileWindow {
    /// Immutable files still to be read, oldest creation first.
    pub inactive: Vec<FileDescriptor>,
    /// The newest file, still being appended to.
    pub active: Option<FileDescriptor>,
}

impl FileWindow {
    /// Classify resolved files.
    ///
    /// The newest file is always active and is never dropped for age, since
    /// its write time only advances once the file reaches full size. Older
    /// files are dropped when last written before `retention_cutoff` or when
    /// they already carry a marker.
    pub fn classify(
        mut files: Vec<FileDescriptor>,
        markers: &MarkerStore,
        retention_cutoff: SystemTime,
    ) -> Self {
        let active = files.pop();

        let inactive = files
            .into_iter()
            .filter(|f| {
                if f.last_write < retention_cutoff {
                    debug!(file = %f.name, "skipping file older than retention");
                    return false;
                }
                if markers.is_marked(&f.name) {
                    debug!(file = %f.name, "skipping already processed file");
                    return false;
                }
                true
            })
            .collect();

        Self { inactive, active }
    }

    pub fn is_empty(&self) -> bool {
        self.inactive.is_empty() && self.active.is_none()
    }
}

/// Zero-length sentinel files marking fully processed inactive trace files.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default marker location: an `archived` directory next to `trace_dir`.
    pub fn sibling_of(trace_dir: &Path) -> Self {
        let parent = trace_dir.parent().unwrap_or(trace_dir);
        Self::new(parent.join("archived"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Marker path for a trace file name.
    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Whether `file_name` was read to completion in an earlier pass.
    pub fn is_marked(&self, file_name: &str) -> bool {
        self.path_for(file_name).exists()
    }

    /// Record that `file_name` will never be read again.
    pub fn mark(&self, file_name: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::File::create(self.path_for(file_name))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn descriptor(name: &str, created_secs: u64, written_secs: u64) -> FileDescriptor {
        FileDescriptor {
            name: name.to_string(),
            path: PathBuf::from("/traces").join(name),
            created: SystemTime::UNIX_EPOCH + Duration::from_secs(created_secs),
            last_write: SystemTime::UNIX_EPOCH + Duration::from_secs(written_secs),
        }
    }

    #[test]
    fn test_resolve_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = resolve(&dir.path().join("absent"), &Pattern::new("*.trc").unwrap()).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_resolve_filters_by_pattern_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fabric_1.trc"), b"").unwrap();
        fs::write(dir.path().join("fabric_2.trc"), b"").unwrap();
        fs::write(dir.path().join("lease_1.trc"), b"").unwrap();
        fs::create_dir(dir.path().join("fabric_dir.trc")).unwrap();

        let files = resolve(dir.path(), &Pattern::new("fabric_*.trc").unwrap()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["fabric_1.trc", "fabric_2.trc"]);
    }

    #[test]
    fn test_classify_newest_is_active() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerStore::new(dir.path());
        let files = vec![
            descriptor("a", 100, 200),
            descriptor("b", 300, 400),
            descriptor("c", 500, 600),
        ];

        let window = FileWindow::classify(files, &markers, SystemTime::UNIX_EPOCH);
        assert_eq!(window.active.as_ref().unwrap().name, "c");
        let inactive: Vec<&str> = window.inactive.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(inactive, vec!["a", "b"]);
    }

    #[test]
    fn test_classify_drops_old_inactive_but_never_active() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerStore::new(dir.path());
        let files = vec![
            descriptor("old", 100, 150),
            descriptor("recent", 300, 900),
            descriptor("active", 500, 160),
        ];
        let cutoff = SystemTime::UNIX_EPOCH + Duration::from_secs(500);

        let window = FileWindow::classify(files, &markers, cutoff);
        assert_eq!(window.active.as_ref().unwrap().name, "active");
        assert_eq!(window.inactive.len(), 1);
        assert_eq!(window.inactive[0].name, "recent");
    }

    #[test]
    fn test_classify_drops_marked_files() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerStore::new(dir.path().join("archived"));
        markers.mark("a").unwrap();

        let files = vec![descriptor("a", 1, 1), descriptor("b", 2, 2), descriptor("c", 3, 3)];
        let window = FileWindow::classify(files, &markers, SystemTime::UNIX_EPOCH);
        assert_eq!(window.inactive.len(), 1);
        assert_eq!(window.inactive[0].name, "b");
    }

    #[test]
    fn test_classify_empty() {
        let dir = tempfile::tempdir().unwrap();
        let window = FileWindow::classify(Vec::new(), &MarkerStore::new(dir.path()), SystemTime::now());
        assert!(window.is_empty());
    }

    #[test]
    fn test_marker_sibling_directory() {
        let markers = MarkerStore::sibling_of(Path::new("/var/log/traces"));
        assert_eq!(markers.dir(), Path::new("/var/log/archived"));
        assert_eq!(
            markers.path_for("fabric_1.trc"),
            PathBuf::from("/var/log/archived/fabric_1.trc")
        );
    }

    #[test]
    fn test_mark_creates_zero_length_file() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerStore::new(dir.path().join("archived"));
        assert!(!markers.is_marked("x.trc"));
        markers.mark("x.trc").unwrap();
        assert!(markers.is_marked("x.trc"));
        assert_eq!(fs::metadata(markers.path_for("x.trc")).unwrap().len(), 0);
    }
}
