//! Mirror a directory through FUSE and serve script output as virtual files.
//!
//! Most entries of the mounted filesystem are transparent mirrors of a base
//! directory. Names listed in a directory's `.config.yml` (or, for the root,
//! in the mountpoint's, captured at startup) are *virtual*: reading them runs
//! the configured shell command and returns its standard output.
//!
//! # Architecture
//!
//! - `ConfigStore`: loads virtual file definitions into one immutable
//!   `VirtualFileTable` per directory, swapped atomically on reload
//! - `ScriptRunner`: runs one configured command through `/bin/sh -c`
//! - `ContentCache`: per-file lock registry collapsing concurrent
//!   generations onto a single script run
//! - `PassthroughBridge`: forwards everything else to the base directory
//! - `FilesystemDispatcher`: routes each operation to one of the above
//! - `fuse` (feature `fuse`): binds the dispatcher to `fuser`

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod passthrough;
pub mod script;

pub use cache::{CacheConfig, CacheState, CacheStats, Caller, ContentCache};
pub use config::{CachePolicy, ConfigEntry, ConfigError, ConfigStore, VirtualFileTable};
pub use dispatcher::{Attr, DirEntry, DispatcherConfig, FilesystemDispatcher, OpenFile, SetAttr};
pub use error::FsError;
pub use passthrough::{EntryKind, PassthroughBridge, PassthroughError};
pub use script::{RunnerConfig, ScriptError, ScriptOutput, ScriptRunner};

/// Name of the configuration file looked up in each directory and the mount root.
pub const CONFIG_FILE_NAME: &str = ".config.yml";
