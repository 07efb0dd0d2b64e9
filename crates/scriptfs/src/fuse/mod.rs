//! FUSE binding for the dispatcher
//!
//! This module provides a FUSE filesystem that serves a
//! `FilesystemDispatcher`:
//! - `InodeTable` maps kernel inodes to mounted paths
//! - `HandleTable` tracks open files across the session and open workers
//! - `ScriptFs` implements `fuser::Filesystem`
//! - `mount`/`spawn` attach it to a mountpoint

mod handles;
mod inode_table;
mod mount;
mod script_fs;

pub use handles::HandleTable;
pub use inode_table::InodeTable;
pub use mount::{mount, spawn, MountConfig, MountHandle};
pub use script_fs::ScriptFs;
