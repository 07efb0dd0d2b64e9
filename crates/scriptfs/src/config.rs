//! Virtual file definitions
//!
//! The config file is a YAML sequence of records:
//!
//! ```yaml
//! - filename: now
//!   out_script: date
//! - filename: status
//!   out_script: git status --short
//!   workdir: repo
//!   env:
//!     GIT_PAGER: cat
//!   cache:
//!     method: stat
//!     path: repo/.git
//!     recurse: true
//! ```
//!
//! `filename` and `out_script` are required; unknown fields are ignored.
//! Records are folded into a `VirtualFileTable` where the last record for a
//! filename wins.
//!
//! Every directory of the base tree may carry its own config file, which
//! defines virtual files inside that directory. Tables are loaded the first
//! time a directory is looked at and re-read whenever their file changes.
//! The mountpoint's config file only contributes to the root table, and only
//! as read before mounting.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::CONFIG_FILE_NAME;

/// One virtual file definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigEntry {
    /// Name of the virtual file, a single path component
    pub filename: String,
    /// Shell command line whose stdout becomes the file content
    #[serde(rename = "out_script")]
    pub script: String,
    /// Working directory for the command, relative to the config file's directory
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Extra environment variables for the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Optional output reuse policy
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    /// Directory holding the defining config file, relative to the base
    #[serde(skip)]
    pub dir: PathBuf,
}

impl ConfigEntry {
    /// Entry with only the required fields set
    pub fn new(filename: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            script: script.into(),
            workdir: None,
            env: BTreeMap::new(),
            cache: None,
            dir: PathBuf::new(),
        }
    }

    /// Path of the virtual file relative to the mount root, e.g. `sub/now`
    pub fn key(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

/// When a virtual file's last output may be served again without re-running.
/// `path` is relative to the directory of the defining config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum CachePolicy {
    /// Reuse output while the modification time of `path` is unchanged
    Stat {
        path: PathBuf,
        #[serde(default)]
        recurse: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid filename {filename:?} in {path}: must be a single path component")]
    InvalidFilename { path: PathBuf, filename: String },
}

/// Immutable mapping from virtual filename to its definition
#[derive(Debug, Clone, Default)]
pub struct VirtualFileTable {
    entries: HashMap<String, Arc<ConfigEntry>>,
}

impl VirtualFileTable {
    /// Fold entries into a table, later entries overriding earlier ones
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = ConfigEntry>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.filename.clone(), Arc::new(entry)))
            .collect();
        Self { entries }
    }

    pub fn get(&self, filename: &str) -> Option<&Arc<ConfigEntry>> {
        self.entries.get(filename)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.entries.contains_key(filename)
    }

    /// Virtual filenames in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse one config file, tagging entries with `dir`. `Ok(None)` when the
/// file does not exist.
fn read_entries(path: &Path, dir: &Path) -> Result<Option<Vec<ConfigEntry>>, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut entries = parse_entries(path, &raw)?;
    for entry in &mut entries {
        entry.dir = dir.to_path_buf();
    }
    Ok(Some(entries))
}

fn parse_entries(path: &Path, raw: &str) -> Result<Vec<ConfigEntry>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let entries: Option<Vec<ConfigEntry>> =
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let entries = entries.unwrap_or_default();

    for entry in &entries {
        if !is_single_component(&entry.filename) {
            return Err(ConfigError::InvalidFilename {
                path: path.to_path_buf(),
                filename: entry.filename.clone(),
            });
        }
    }

    Ok(entries)
}

fn is_single_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// Relative form of a mounted directory path, `None` if it could escape
fn relative_dir(dir: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in dir.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => relative.push(part),
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

/// Modification stamp used to notice edits of a config file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// The table of one directory and the stamp of the file it came from
#[derive(Debug)]
struct DirTable {
    config_path: PathBuf,
    dir: PathBuf,
    current: RwLock<Arc<VirtualFileTable>>,
    fingerprint: Mutex<Option<Fingerprint>>,
}

impl DirTable {
    /// Not loaded yet; the first `refresh` reads the file if it exists
    fn pending(basedir: &Path, dir: PathBuf) -> Self {
        Self {
            config_path: basedir.join(&dir).join(CONFIG_FILE_NAME),
            dir,
            current: RwLock::new(Arc::new(VirtualFileTable::default())),
            fingerprint: Mutex::new(None),
        }
    }

    /// Re-read the file if its fingerprint moved. `extra` entries are
    /// applied first, so the file wins on duplicate names.
    fn refresh(&self, extra: &[ConfigEntry]) -> Result<bool, ConfigError> {
        let mut fingerprint = self.fingerprint.lock();
        let latest = Fingerprint::of(&self.config_path);
        if latest == *fingerprint {
            return Ok(false);
        }
        *fingerprint = latest;

        let entries = read_entries(&self.config_path, &self.dir)?.unwrap_or_default();
        let table = VirtualFileTable::from_entries(extra.iter().cloned().chain(entries));
        tracing::info!(
            "Loaded {} virtual file(s) from {}",
            table.len(),
            self.config_path.display()
        );
        *self.current.write() = Arc::new(table);
        Ok(true)
    }

    fn table(&self) -> Arc<VirtualFileTable> {
        self.current.read().clone()
    }
}

/// Per-directory `VirtualFileTable`s, replaced wholesale on reload
#[derive(Debug)]
pub struct ConfigStore {
    basedir: PathBuf,
    /// Entries from the mountpoint's file, read once before mounting
    mount_entries: Vec<ConfigEntry>,
    root: Arc<DirTable>,
    dirs: RwLock<HashMap<PathBuf, Arc<DirTable>>>,
}

impl ConfigStore {
    /// Load the root tables of `basedir` and `mountpoint`.
    ///
    /// The mountpoint's file is applied first so the base directory's file
    /// wins on duplicate filenames. A missing file contributes nothing; a
    /// malformed one is fatal here.
    pub fn load(basedir: &Path, mountpoint: &Path) -> Result<Self, ConfigError> {
        let root_dir = PathBuf::new();
        let mount_entries = read_entries(&mountpoint.join(CONFIG_FILE_NAME), &root_dir)?
            .unwrap_or_default();

        let root = DirTable::pending(basedir, root_dir);
        // A missing base file never moves the fingerprint, so seed the table
        *root.current.write() = Arc::new(VirtualFileTable::from_entries(
            mount_entries.iter().cloned(),
        ));
        root.refresh(&mount_entries)?;

        Ok(Self {
            basedir: basedir.to_path_buf(),
            mount_entries,
            root: Arc::new(root),
            dirs: RwLock::new(HashMap::new()),
        })
    }

    /// Snapshot of the root table
    pub fn table(&self) -> Arc<VirtualFileTable> {
        self.root.table()
    }

    /// Path of the base directory's root config file
    pub fn config_path(&self) -> &Path {
        &self.root.config_path
    }

    /// Re-read the root config if it changed since the last load.
    ///
    /// Returns `Ok(true)` when a new table was swapped in. On error the
    /// previous table stays current and the same file is not parsed again
    /// until it changes.
    pub fn refresh(&self) -> Result<bool, ConfigError> {
        self.root.refresh(&self.mount_entries)
    }

    /// Current table of the mounted directory `dir`, loading or refreshing
    /// it first. Broken files keep the previous table and are logged.
    pub fn table_for(&self, dir: &Path) -> Arc<VirtualFileTable> {
        let Some(dir) = relative_dir(dir) else {
            return Arc::new(VirtualFileTable::default());
        };
        let (table, extra) = if dir.as_os_str().is_empty() {
            (self.root.clone(), &self.mount_entries[..])
        } else {
            match self.dir_table(dir) {
                Some(table) => (table, &[][..]),
                None => return Arc::new(VirtualFileTable::default()),
            }
        };
        if let Err(e) = table.refresh(extra) {
            tracing::warn!("Keeping previous config: {}", e);
        }
        table.table()
    }

    /// Tracked table of `dir`; directories are only tracked once a config
    /// file has been seen in them
    fn dir_table(&self, dir: PathBuf) -> Option<Arc<DirTable>> {
        if let Some(table) = self.dirs.read().get(&dir) {
            return Some(table.clone());
        }
        let pending = DirTable::pending(&self.basedir, dir.clone());
        if !pending.config_path.exists() {
            return None;
        }
        let table = self
            .dirs
            .write()
            .entry(dir)
            .or_insert_with(|| Arc::new(pending))
            .clone();
        Some(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &Path, body: &str) {
        std::fs::write(dir.join(CONFIG_FILE_NAME), body).unwrap();
    }

    #[test]
    fn test_missing_config_is_empty() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();

        let table = ConfigStore::load(base.path(), mount.path()).unwrap().table();
        assert!(table.is_empty());
    }

    #[test]
    fn test_parse_entries() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(
            base.path(),
            "- filename: now\n  out_script: date\n- filename: who\n  out_script: whoami\n  color: blue\n",
        );

        let table = ConfigStore::load(base.path(), mount.path()).unwrap().table();
        assert_eq!(table.names(), vec!["now", "who"]);
        assert_eq!(table.get("now").unwrap().script, "date");
        assert_eq!(table.get("who").unwrap().script, "whoami");
    }

    #[test]
    fn test_optional_fields() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(
            base.path(),
            "- filename: status\n  out_script: git status\n  workdir: repo\n  env:\n    GIT_PAGER: cat\n  cache:\n    method: stat\n    path: repo/.git\n    recurse: true\n",
        );

        let table = ConfigStore::load(base.path(), mount.path()).unwrap().table();
        let entry = table.get("status").unwrap();
        assert_eq!(entry.workdir.as_deref(), Some(Path::new("repo")));
        assert_eq!(entry.env.get("GIT_PAGER").map(String::as_str), Some("cat"));
        assert_eq!(
            entry.cache,
            Some(CachePolicy::Stat {
                path: PathBuf::from("repo/.git"),
                recurse: true
            })
        );
    }

    #[test]
    fn test_duplicate_filename_last_wins() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(
            base.path(),
            "- filename: x\n  out_script: echo first\n- filename: x\n  out_script: echo second\n",
        );

        let table = ConfigStore::load(base.path(), mount.path()).unwrap().table();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("x").unwrap().script, "echo second");
    }

    #[test]
    fn test_merge_base_overrides_mountpoint() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(
            mount.path(),
            "- filename: shared\n  out_script: echo mount\n- filename: only_mount\n  out_script: echo m\n",
        );
        write_config(base.path(), "- filename: shared\n  out_script: echo base\n");

        let table = ConfigStore::load(base.path(), mount.path()).unwrap().table();
        assert_eq!(table.names(), vec!["only_mount", "shared"]);
        assert_eq!(table.get("shared").unwrap().script, "echo base");
    }

    #[test]
    fn test_empty_and_null_documents() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(base.path(), "");
        write_config(mount.path(), "~\n");

        assert!(ConfigStore::load(base.path(), mount.path())
            .unwrap()
            .table()
            .is_empty());
    }

    #[test]
    fn test_malformed_config_is_error() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(base.path(), "- filename: [unclosed\n");

        let err = ConfigStore::load(base.path(), mount.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_required_field_is_error() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(base.path(), "- filename: now\n");

        let err = ConfigStore::load(base.path(), mount.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_invalid_filename_is_error() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(base.path(), "- filename: a/b\n  out_script: date\n");

        let err = ConfigStore::load(base.path(), mount.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFilename { .. }));
    }

    #[test]
    fn test_refresh_swaps_table() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(base.path(), "- filename: a\n  out_script: echo a\n");

        let store = ConfigStore::load(base.path(), mount.path()).unwrap();
        let before = store.table();
        assert!(before.contains("a"));
        assert!(!store.refresh().unwrap());

        write_config(
            base.path(),
            "- filename: a\n  out_script: echo a\n- filename: bb\n  out_script: echo b\n",
        );
        assert!(store.refresh().unwrap());

        // Old snapshot is untouched
        assert_eq!(before.len(), 1);
        assert_eq!(store.table().names(), vec!["a", "bb"]);
    }

    #[test]
    fn test_subdirectory_tables_load_lazily() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(mount.path(), "- filename: top\n  out_script: echo top\n");
        std::fs::create_dir_all(base.path().join("sub/deeper")).unwrap();

        let store = ConfigStore::load(base.path(), mount.path()).unwrap();
        assert!(store.table_for(Path::new("/sub")).is_empty());

        write_config(&base.path().join("sub"), "- filename: now\n  out_script: date\n");
        let table = store.table_for(Path::new("/sub"));
        assert_eq!(table.names(), vec!["now"]);
        assert_eq!(table.get("now").unwrap().dir, PathBuf::from("sub"));
        assert_eq!(table.get("now").unwrap().key(), PathBuf::from("sub/now"));

        assert!(store.table_for(Path::new("/missing/dir")).is_empty());
        assert_eq!(store.dirs.read().len(), 1);

        // Mountpoint entries belong to the root only
        assert!(store.table_for(Path::new("/")).contains("top"));
        assert!(store.table_for(Path::new("/sub/deeper")).is_empty());
        assert!(store.table_for(Path::new("/sub/../sub")).is_empty());
    }

    #[test]
    fn test_broken_subdirectory_config_keeps_previous_table() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let sub = base.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        write_config(&sub, "- filename: a\n  out_script: echo a\n");

        let store = ConfigStore::load(base.path(), mount.path()).unwrap();
        assert!(store.table_for(Path::new("/sub")).contains("a"));

        write_config(&sub, "- filename: [broken\n");
        assert!(store.table_for(Path::new("/sub")).contains("a"));

        std::fs::remove_file(sub.join(CONFIG_FILE_NAME)).unwrap();
        assert!(store.table_for(Path::new("/sub")).is_empty());
    }

    #[test]
    fn test_refresh_failure_keeps_previous_table() {
        let base = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        write_config(base.path(), "- filename: a\n  out_script: echo a\n");

        let store = ConfigStore::load(base.path(), mount.path()).unwrap();
        write_config(base.path(), "- filename: [broken\n  out_script: nope\n");

        assert!(store.refresh().is_err());
        assert!(store.table().contains("a"));
        // Unchanged broken file is not reported twice
        assert!(!store.refresh().unwrap());
    }
}
