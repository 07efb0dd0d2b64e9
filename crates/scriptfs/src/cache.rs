//! Per-file generation slots for virtual file content
//!
//! Every virtual file gets a lazily created slot in a lock registry, keyed
//! by its path below the mount root. A slot serializes script runs for its
//! file: while one caller is generating, later callers wait on the slot and
//! receive the same result instead of spawning a second process. Different
//! files never block each other beyond the short registry lookup.
//!
//! By default nothing is reused across calls: each call that finds the slot
//! idle runs the script again. Entries with a `stat` cache policy keep their
//! last output in a size-bounded store and reuse it while the watched path's
//! modification time is unchanged and the definition that produced them is
//! the one being asked for.
//!
//! A call that would wait on a generation it is itself part of (same thread,
//! or a process descended from the running script) fails with
//! `FsError::RecursiveGeneration` instead of deadlocking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, SystemTime};

use moka::sync::Cache;
use parking_lot::{Condvar, Mutex};

use crate::config::{CachePolicy, ConfigEntry};
use crate::error::FsError;
use crate::script::{ScriptError, ScriptRunner};

/// How often a waiter re-checks whether it is the generating script itself
const REENTRY_POLL: Duration = Duration::from_millis(50);

/// Generation state of one virtual filename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No output has been produced yet, or the last run failed
    Idle,
    /// A script run is in flight
    Generating,
    /// The last run succeeded; the next call still runs the script again
    Ready,
}

/// Who is asking for content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    /// Pid of the requesting process, when the request came through the driver
    pub pid: Option<u32>,
}

impl Caller {
    /// An in-process caller identified only by its thread
    pub fn local() -> Self {
        Self { pid: None }
    }

    pub fn process(pid: u32) -> Self {
        Self { pid: Some(pid) }
    }
}

/// Configuration for the content cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound for retained `stat`-policy outputs, in megabytes
    pub max_size_mb: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size_mb: 64 }
    }
}

/// The in-flight generation of a slot
#[derive(Debug)]
struct Owner {
    thread: ThreadId,
    child_pid: Option<u32>,
}

impl Owner {
    fn is_reentry(&self, caller: &Caller) -> bool {
        if self.thread == thread::current().id() {
            return true;
        }
        match (caller.pid, self.child_pid) {
            (Some(pid), Some(child)) => descends_from(pid, child),
            _ => false,
        }
    }
}

type Outcome = Result<Arc<Vec<u8>>, ScriptError>;

/// Content and state for one virtual filename, guarded by its slot mutex
#[derive(Debug)]
struct CacheEntry {
    state: CacheState,
    generated_at: Option<SystemTime>,
    /// Bumped each time a generation completes
    generation: u64,
    owner: Option<Owner>,
    /// Result of the last completed generation, handed to its waiters
    outcome: Option<Outcome>,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            state: CacheState::Idle,
            generated_at: None,
            generation: 0,
            owner: None,
            outcome: None,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    entry: Mutex<CacheEntry>,
    done: Condvar,
}

/// Output kept under a `stat` policy, with the definition that produced it
#[derive(Debug, Clone)]
struct Retained {
    entry: Arc<ConfigEntry>,
    content: Arc<Vec<u8>>,
    stamp: SystemTime,
}

/// Lock registry and content store for virtual files
pub struct ContentCache {
    runner: ScriptRunner,
    base_dir: PathBuf,
    slots: Mutex<HashMap<PathBuf, Arc<Slot>>>,
    retained: Cache<PathBuf, Retained>,
    config: CacheConfig,
}

impl ContentCache {
    pub fn new(runner: ScriptRunner, base_dir: impl Into<PathBuf>, config: CacheConfig) -> Self {
        let max_bytes = (config.max_size_mb as u64) * 1024 * 1024;
        Self {
            runner,
            base_dir: base_dir.into(),
            slots: Mutex::new(HashMap::new()),
            retained: Cache::builder()
                .max_capacity(max_bytes)
                .weigher(|_key: &PathBuf, value: &Retained| {
                    u32::try_from(value.content.len()).unwrap_or(u32::MAX)
                })
                .build(),
            config,
        }
    }

    pub fn runner(&self) -> &ScriptRunner {
        &self.runner
    }

    /// Produce the content of `entry`, running its script at most once per
    /// overlapping group of callers.
    pub fn get_or_generate(
        &self,
        entry: &ConfigEntry,
        caller: &Caller,
    ) -> Result<Arc<Vec<u8>>, FsError> {
        let key = entry.key();
        let name = key.display().to_string();
        let slot = self.slot(&key);
        let mut state = slot.entry.lock();

        if state.state == CacheState::Generating {
            let waiting_on = state.generation;
            loop {
                if state
                    .owner
                    .as_ref()
                    .is_some_and(|owner| owner.is_reentry(caller))
                {
                    return Err(FsError::RecursiveGeneration(name));
                }
                slot.done.wait_for(&mut state, REENTRY_POLL);
                if state.generation != waiting_on {
                    break;
                }
            }
            tracing::debug!("Reusing in-flight output for {}", name);
            return match &state.outcome {
                Some(outcome) => outcome.clone().map_err(FsError::from),
                None => Err(FsError::NotFound(name)),
            };
        }

        let stamp = entry
            .cache
            .as_ref()
            .and_then(|policy| self.stamp(&entry.dir, policy));
        if let Some(stamp) = stamp {
            if let Some(kept) = self.retained.get(&key) {
                if kept.stamp == stamp && *kept.entry == *entry {
                    tracing::debug!("Serving retained output for {}", name);
                    return Ok(kept.content);
                }
            }
        }

        state.state = CacheState::Generating;
        state.owner = Some(Owner {
            thread: thread::current().id(),
            child_pid: None,
        });
        drop(state);

        let result = self.runner.run_with(entry, |pid| {
            if let Some(owner) = slot.entry.lock().owner.as_mut() {
                owner.child_pid = Some(pid);
            }
        });
        let outcome: Outcome = result.map(|output| Arc::new(output.stdout));

        let mut state = slot.entry.lock();
        state.owner = None;
        state.generation += 1;
        match &outcome {
            Ok(content) => {
                state.state = CacheState::Ready;
                state.generated_at = Some(SystemTime::now());
                if let Some(stamp) = stamp {
                    self.retained.insert(
                        key.clone(),
                        Retained {
                            entry: Arc::new(entry.clone()),
                            content: content.clone(),
                            stamp,
                        },
                    );
                }
            }
            Err(e) => {
                tracing::warn!("Generating {} failed: {}", name, e);
                state.state = CacheState::Idle;
                self.retained.invalidate(&key);
            }
        }
        state.outcome = Some(outcome.clone());
        slot.done.notify_all();
        drop(state);

        outcome.map_err(FsError::from)
    }

    /// Current state of a file's slot, `None` if it was never accessed.
    /// `key` is the path below the mount root, see `ConfigEntry::key`.
    pub fn state(&self, key: impl AsRef<Path>) -> Option<CacheState> {
        let slot = self.slots.lock().get(key.as_ref()).cloned()?;
        let state = slot.entry.lock().state;
        Some(state)
    }

    /// When the last successful generation of `key` finished
    pub fn generated_at(&self, key: impl AsRef<Path>) -> Option<SystemTime> {
        let slot = self.slots.lock().get(key.as_ref()).cloned()?;
        let at = slot.entry.lock().generated_at;
        at
    }

    /// Drop a retained output so the next read runs the script
    pub fn invalidate(&self, key: impl AsRef<Path>) {
        self.retained.invalidate(key.as_ref());
    }

    pub fn stats(&self) -> CacheStats {
        self.retained.run_pending_tasks();
        CacheStats {
            slot_count: self.slots.lock().len(),
            retained_count: self.retained.entry_count(),
            retained_bytes: self.retained.weighted_size(),
            max_size_mb: self.config.max_size_mb,
        }
    }

    fn slot(&self, key: &Path) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(key.to_path_buf())
            .or_default()
            .clone()
    }

    /// `path` is relative to the directory of the defining config file
    fn stamp(&self, dir: &Path, policy: &CachePolicy) -> Option<SystemTime> {
        match policy {
            CachePolicy::Stat { path, recurse } => {
                let watched = self.base_dir.join(dir).join(path);
                if *recurse {
                    newest_dir_mtime(&watched)
                } else {
                    std::fs::metadata(&watched).and_then(|m| m.modified()).ok()
                }
            }
        }
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("config", &self.config)
            .field("base_dir", &self.base_dir)
            .field("slot_count", &self.slots.lock().len())
            .field("retained_count", &self.retained.entry_count())
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub slot_count: usize,
    pub retained_count: u64,
    pub retained_bytes: u64,
    pub max_size_mb: u32,
}

/// Newest modification time among `root` and every directory below it
fn newest_dir_mtime(root: &Path) -> Option<SystemTime> {
    let mut newest = std::fs::metadata(root).and_then(|m| m.modified()).ok()?;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                newest = newest.max(modified);
            }
            pending.push(entry.path());
        }
    }
    Some(newest)
}

/// Whether `pid` is `ancestor` or one of its descendants
#[cfg(target_os = "linux")]
fn descends_from(pid: u32, ancestor: u32) -> bool {
    let mut current = pid;
    // Bounded walk; pid 1 and 0 end the chain
    for _ in 0..64 {
        if current == ancestor {
            return true;
        }
        if current <= 1 {
            return false;
        }
        match parent_pid(current) {
            Some(parent) => current = parent,
            None => return false,
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
fn descends_from(pid: u32, ancestor: u32) -> bool {
    pid == ancestor
}

#[cfg(target_os = "linux")]
fn parent_pid(pid: u32) -> Option<u32> {
    let pid = i32::try_from(pid).ok()?;
    let stat = procfs::process::Process::new(pid)
        .and_then(|process| process.stat())
        .ok()?;
    u32::try_from(stat.ppid).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::RunnerConfig;
    use std::sync::Barrier;
    use std::time::Instant;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> Arc<ContentCache> {
        let runner = ScriptRunner::new(RunnerConfig::new(dir.path())).unwrap();
        Arc::new(ContentCache::new(runner, dir.path(), CacheConfig::default()))
    }

    fn counter_entry(name: &str, sleep: &str) -> ConfigEntry {
        ConfigEntry::new(
            name,
            format!(
                "n=$(cat count 2>/dev/null || echo 0); n=$((n+1)); echo $n > count; sleep {}; printf $n",
                sleep
            ),
        )
    }

    #[test]
    fn test_every_call_runs_script() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let entry = counter_entry("counter", "0");

        let first = cache.get_or_generate(&entry, &Caller::local()).unwrap();
        let second = cache.get_or_generate(&entry, &Caller::local()).unwrap();

        assert_eq!(first.as_slice(), b"1");
        assert_eq!(second.as_slice(), b"2");
        assert_eq!(cache.state("counter"), Some(CacheState::Ready));
        assert!(cache.generated_at("counter").is_some());
    }

    #[test]
    fn test_unknown_filename_has_no_state() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cache(&dir).state("never"), None);
    }

    #[test]
    fn test_concurrent_callers_share_one_run() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let entry = counter_entry("shared", "1");
        let callers = 6;
        let barrier = Arc::new(Barrier::new(callers));

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let cache = cache.clone();
                let entry = entry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_generate(&entry, &Caller::local()).unwrap()
                })
            })
            .collect();
        let outputs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let runs: u32 = std::fs::read_to_string(dir.path().join("count"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(runs < callers as u32, "expected collapsed runs, got {runs}");
        for output in &outputs {
            let value: u32 = std::str::from_utf8(output).unwrap().parse().unwrap();
            assert!(value >= 1 && value <= runs);
        }
    }

    #[test]
    fn test_different_filenames_do_not_block() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let slow = ConfigEntry::new("slow", "sleep 2; printf slow");
        let fast = ConfigEntry::new("fast", "printf fast");

        let background = {
            let cache = cache.clone();
            thread::spawn(move || cache.get_or_generate(&slow, &Caller::local()).unwrap())
        };
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let output = cache.get_or_generate(&fast, &Caller::local()).unwrap();
        assert_eq!(output.as_slice(), b"fast");
        assert!(started.elapsed() < Duration::from_millis(1500));

        assert_eq!(background.join().unwrap().as_slice(), b"slow");
    }

    #[test]
    fn test_failure_is_not_retained() {
        let dir = TempDir::new().unwrap();
        let runner = {
            let mut config = RunnerConfig::new(dir.path());
            config.timeout = Some(Duration::from_millis(300));
            ScriptRunner::new(config).unwrap()
        };
        let cache = ContentCache::new(runner, dir.path(), CacheConfig::default());

        // Slow on the first call only
        let entry = ConfigEntry::new(
            "flaky",
            "if [ -e seen ]; then printf ok; else touch seen; sleep 5; fi",
        );

        let err = cache.get_or_generate(&entry, &Caller::local()).unwrap_err();
        assert!(matches!(err, FsError::Script(ScriptError::TimedOut { .. })));
        assert_eq!(cache.state("flaky"), Some(CacheState::Idle));

        let output = cache.get_or_generate(&entry, &Caller::local()).unwrap();
        assert_eq!(output.as_slice(), b"ok");
    }

    #[test]
    fn test_stat_policy_reuses_until_mtime_changes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("watched")).unwrap();
        let cache = cache(&dir);

        let mut entry = counter_entry("stat", "0");
        entry.cache = Some(CachePolicy::Stat {
            path: PathBuf::from("watched"),
            recurse: false,
        });

        let first = cache.get_or_generate(&entry, &Caller::local()).unwrap();
        let second = cache.get_or_generate(&entry, &Caller::local()).unwrap();
        assert_eq!(first.as_slice(), b"1");
        assert_eq!(second.as_slice(), b"1");

        // Coarse filesystem timestamps need a visible gap
        thread::sleep(Duration::from_millis(1100));
        std::fs::write(dir.path().join("watched/new"), "x").unwrap();

        let third = cache.get_or_generate(&entry, &Caller::local()).unwrap();
        assert_eq!(third.as_slice(), b"2");
        assert_eq!(cache.stats().retained_count, 1);
    }

    #[test]
    fn test_stat_policy_recurse_sees_nested_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("tree/a/b")).unwrap();
        let cache = cache(&dir);

        let mut entry = counter_entry("tree", "0");
        entry.cache = Some(CachePolicy::Stat {
            path: PathBuf::from("tree"),
            recurse: true,
        });

        assert_eq!(cache.get_or_generate(&entry, &Caller::local()).unwrap().as_slice(), b"1");
        assert_eq!(cache.get_or_generate(&entry, &Caller::local()).unwrap().as_slice(), b"1");

        thread::sleep(Duration::from_millis(1100));
        std::fs::write(dir.path().join("tree/a/b/leaf"), "x").unwrap();

        assert_eq!(cache.get_or_generate(&entry, &Caller::local()).unwrap().as_slice(), b"2");
    }

    #[test]
    fn test_stat_policy_missing_path_runs_every_time() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        let mut entry = counter_entry("gone", "0");
        entry.cache = Some(CachePolicy::Stat {
            path: PathBuf::from("does-not-exist"),
            recurse: false,
        });

        assert_eq!(cache.get_or_generate(&entry, &Caller::local()).unwrap().as_slice(), b"1");
        assert_eq!(cache.get_or_generate(&entry, &Caller::local()).unwrap().as_slice(), b"2");
    }

    #[test]
    fn test_invalidate_drops_retained_output() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("watched")).unwrap();
        let cache = cache(&dir);

        let mut entry = counter_entry("inv", "0");
        entry.cache = Some(CachePolicy::Stat {
            path: PathBuf::from("watched"),
            recurse: false,
        });

        assert_eq!(cache.get_or_generate(&entry, &Caller::local()).unwrap().as_slice(), b"1");
        cache.invalidate("inv");
        assert_eq!(cache.get_or_generate(&entry, &Caller::local()).unwrap().as_slice(), b"2");
    }

    #[test]
    fn test_edited_definition_is_not_served_stale_output() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("watched")).unwrap();
        let cache = cache(&dir);

        let policy = Some(CachePolicy::Stat {
            path: PathBuf::from("watched"),
            recurse: false,
        });
        let mut old = ConfigEntry::new("out", "printf old");
        old.cache = policy.clone();
        let mut new = ConfigEntry::new("out", "printf new");
        new.cache = policy;

        assert_eq!(cache.get_or_generate(&old, &Caller::local()).unwrap().as_slice(), b"old");
        assert_eq!(cache.get_or_generate(&new, &Caller::local()).unwrap().as_slice(), b"new");
        assert_eq!(cache.get_or_generate(&new, &Caller::local()).unwrap().as_slice(), b"new");
    }

    #[test]
    fn test_nested_entries_have_separate_slots() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/watched")).unwrap();
        let cache = cache(&dir);

        let top = ConfigEntry::new("out", "printf top");
        let mut nested = ConfigEntry::new("out", "printf nested");
        nested.dir = PathBuf::from("sub");
        // Relative to sub/, not to the base directory
        nested.cache = Some(CachePolicy::Stat {
            path: PathBuf::from("watched"),
            recurse: false,
        });

        assert_eq!(cache.get_or_generate(&top, &Caller::local()).unwrap().as_slice(), b"top");
        assert_eq!(cache.get_or_generate(&nested, &Caller::local()).unwrap().as_slice(), b"nested");
        assert_eq!(cache.state("out"), Some(CacheState::Ready));
        assert_eq!(cache.state("sub/out"), Some(CacheState::Ready));
        assert_eq!(cache.stats().retained_count, 1);
    }

    #[test]
    fn test_same_thread_reentry_fails_fast() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let entry = ConfigEntry::new("loop", "printf x");

        // Mark the slot as generating from this thread
        let slot = cache.slot(Path::new("loop"));
        {
            let mut state = slot.entry.lock();
            state.state = CacheState::Generating;
            state.owner = Some(Owner {
                thread: thread::current().id(),
                child_pid: None,
            });
        }

        let err = cache.get_or_generate(&entry, &Caller::local()).unwrap_err();
        assert!(matches!(err, FsError::RecursiveGeneration(name) if name == "loop"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descendant_process_reentry_fails_fast() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let entry = ConfigEntry::new("loop", "printf x");

        // Pretend this process is the running script's child
        let slot = cache.slot(Path::new("loop"));
        {
            let mut state = slot.entry.lock();
            state.state = CacheState::Generating;
            state.owner = Some(Owner {
                thread: thread::spawn(|| thread::current().id()).join().unwrap(),
                child_pid: Some(std::process::id()),
            });
        }

        let caller = Caller::process(std::process::id());
        let err = cache.get_or_generate(&entry, &caller).unwrap_err();
        assert!(matches!(err, FsError::RecursiveGeneration(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descends_from() {
        let me = std::process::id();
        assert!(descends_from(me, me));
        let parent = parent_pid(me).unwrap();
        assert!(descends_from(me, parent));
        assert!(!descends_from(parent, me));
    }
}
