//! Managed-region editor for the system resolver file.
//!
//! Monday owns exactly one marker-delimited block in `/etc/hosts`; everything
//! outside the markers is never touched. Every mutation rewrites the file
//! atomically (temp file + rename).

use parking_lot::Mutex;
use std::io;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BEGIN_MARKER: &str = "# -- monday begin --";
const END_MARKER: &str = "# -- monday end --";

#[derive(Debug, Error)]
pub enum HostfileError {
    #[error(
        "Permission denied writing {0}. Hostname rewrites edit the system resolver file; re-run monday with elevated privileges (sudo)."
    )]
    PermissionDenied(PathBuf),

    #[error("Failed to read {0}: {1}")]
    Read(PathBuf, io::Error),

    #[error("Failed to write {0}: {1}")]
    Write(PathBuf, io::Error),
}

pub type Result<T> = std::result::Result<T, HostfileError>;

/// Editor for `IP hostname` entries inside the managed region.
#[derive(Debug)]
pub struct Hostfile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Hostfile {
    /// Open the system resolver file, verify it is writable, and drop any
    /// managed region left behind by an aborted run.
    pub fn open() -> Result<Self> {
        Self::open_path(default_path())
    }

    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        let hostfile = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };

        // Probe writability up front so the failure surfaces before any
        // forward is established.
        match std::fs::OpenOptions::new()
            .append(true)
            .open(&hostfile.path)
        {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(HostfileError::PermissionDenied(hostfile.path));
            }
            Err(e) => return Err(HostfileError::Read(hostfile.path, e)),
        }

        let content = hostfile.read()?;
        let (document, stale) = Document::parse(&content);
        if stale {
            tracing::warn!(path = %hostfile.path.display(), "Removing stale managed region");
            hostfile.write(&document.render(&[]))?;
        }

        Ok(hostfile)
    }

    /// Add `ip hostname` to the managed region, creating the region if
    /// absent. Idempotent on the `(ip, hostname)` pair.
    pub fn add_host(&self, ip: &str, hostname: &str) -> Result<()> {
        let _guard = self.lock.lock();

        let content = self.read()?;
        let (document, _) = Document::parse(&content);

        let entry = format!("{ip} {hostname}");
        let mut entries = document.entries.clone();
        if entries.iter().any(|e| e == &entry) {
            return Ok(());
        }
        entries.push(entry);

        self.write(&document.render(&entries))
    }

    /// Remove every entry for `hostname`; the region disappears entirely
    /// once its last entry is gone.
    pub fn remove_host(&self, hostname: &str) -> Result<()> {
        let _guard = self.lock.lock();

        let content = self.read()?;
        let (document, _) = Document::parse(&content);

        let entries: Vec<String> = document
            .entries
            .iter()
            .filter(|e| e.split_whitespace().nth(1) != Some(hostname))
            .cloned()
            .collect();

        if entries.len() == document.entries.len() {
            return Ok(());
        }

        self.write(&document.render(&entries))
    }

    /// Final cleanup: remove the managed region altogether.
    pub fn end(&self) -> Result<()> {
        let _guard = self.lock.lock();

        let content = self.read()?;
        let (document, _) = Document::parse(&content);
        if document.entries.is_empty() && !content.contains(BEGIN_MARKER) {
            return Ok(());
        }

        self.write(&document.render(&[]))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .map_err(|e| HostfileError::Read(self.path.clone(), e))
    }

    fn write(&self, content: &str) -> Result<()> {
        let map_err = |e: io::Error| match e.kind() {
            io::ErrorKind::PermissionDenied => HostfileError::PermissionDenied(self.path.clone()),
            _ => HostfileError::Write(self.path.clone(), e),
        };

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(map_err)?;
        tmp.write_all(content.as_bytes()).map_err(map_err)?;
        tmp.persist(&self.path).map_err(|e| map_err(e.error))?;
        Ok(())
    }
}

fn default_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

/// A hosts file split around the managed region.
struct Document {
    before: String,
    entries: Vec<String>,
    after: String,
}

impl Document {
    /// Split `content` around the marker pair. The second element reports
    /// whether a region (even an empty one) was present.
    fn parse(content: &str) -> (Self, bool) {
        let mut before = String::new();
        let mut entries = Vec::new();
        let mut after = String::new();
        let mut section = 0;

        for line in content.lines() {
            match section {
                0 if line.trim() == BEGIN_MARKER => section = 1,
                0 => {
                    before.push_str(line);
                    before.push('\n');
                }
                1 if line.trim() == END_MARKER => section = 2,
                1 => entries.push(line.to_string()),
                _ => {
                    after.push_str(line);
                    after.push('\n');
                }
            }
        }

        let found = section > 0;
        (
            Self {
                before,
                entries,
                after,
            },
            found,
        )
    }

    /// Render the document with `entries` as the managed region. An empty
    /// entry list renders no region at all.
    fn render(&self, entries: &[String]) -> String {
        let mut out = self.before.clone();

        if !entries.is_empty() {
            out.push_str(BEGIN_MARKER);
            out.push('\n');
            for entry in entries {
                out.push_str(entry);
                out.push('\n');
            }
            out.push_str(END_MARKER);
            out.push('\n');
        }

        out.push_str(&self.after);
        out
    }
}
