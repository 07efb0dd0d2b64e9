use std::path::Path;
use std::sync::Arc;

use fuser::MountOption;

use super::script_fs::ScriptFs;
use crate::dispatcher::FilesystemDispatcher;

/// Options passed to the kernel at mount time
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Let other users access the mount (needs `user_allow_other`)
    pub allow_other: bool,
    pub fs_name: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            allow_other: false,
            fs_name: "scriptfs".to_string(),
        }
    }
}

impl MountConfig {
    fn options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fs_name.clone()),
            MountOption::DefaultPermissions,
        ];
        // fuser only honours AutoUnmount together with AllowOther/AllowRoot
        if self.allow_other {
            options.push(MountOption::AllowOther);
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

/// Mount in the foreground, returning once the filesystem is unmounted
pub fn mount(
    dispatcher: Arc<FilesystemDispatcher>,
    mountpoint: &Path,
    config: &MountConfig,
) -> std::io::Result<()> {
    tracing::info!("Mounting scriptfs at {}", mountpoint.display());
    fuser::mount2(ScriptFs::new(dispatcher), mountpoint, &config.options())
}

/// Mount on a background thread
pub fn spawn(
    dispatcher: Arc<FilesystemDispatcher>,
    mountpoint: &Path,
    config: &MountConfig,
) -> std::io::Result<MountHandle> {
    tracing::info!("Mounting scriptfs at {} (background)", mountpoint.display());
    let session = fuser::spawn_mount2(ScriptFs::new(dispatcher), mountpoint, &config.options())?;
    Ok(MountHandle { inner: session })
}

/// Keeps a background mount alive.
///
/// Dropping the handle unmounts without waiting; `join` unmounts and waits
/// for the session loop to stop.
pub struct MountHandle {
    inner: fuser::BackgroundSession,
}

impl MountHandle {
    pub fn join(self) {
        let Self { inner } = self;
        inner.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_stay_private() {
        let options = MountConfig::default().options();
        assert!(options.contains(&MountOption::DefaultPermissions));
        assert!(!options.contains(&MountOption::AllowOther));
        assert!(!options.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn test_allow_other_enables_auto_unmount() {
        let config = MountConfig {
            allow_other: true,
            ..Default::default()
        };
        let options = config.options();
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::AutoUnmount));
        assert!(options.contains(&MountOption::FSName("scriptfs".to_string())));
    }
}
