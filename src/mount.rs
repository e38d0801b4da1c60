//! Mount management and lifecycle

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{error, info};

use crate::backend::clock::{ClockBackend, CLOCK_INODE};
use crate::backend::loopback::LoopbackBackend;
use crate::backend::Backend;
use crate::config::{BackendConfig, MountConfig};
use crate::error::{FsError, Result};
use crate::fuse::{AdapterOptions, FuseAdapter};
use crate::publisher::{ClockPublisher, ContentBuffer, PublisherHandle, ShutdownSignal};

const FS_NAME: &str = "vfs-adapter";

/// Backend built for one mount, plus what the clock publisher needs
struct PreparedBackend {
    backend: Arc<dyn Backend>,
    reserved_inodes: Vec<(PathBuf, u64)>,
    clock: Option<(Arc<ContentBuffer>, Duration)>,
}

fn prepare_backend(config: &BackendConfig) -> PreparedBackend {
    match config {
        BackendConfig::Clock(clock) => {
            let backend = ClockBackend::new(clock.file_name.clone());
            let reserved_inodes = vec![(backend.file_path(), CLOCK_INODE)];
            let content = backend.content();
            PreparedBackend {
                backend: Arc::new(backend),
                reserved_inodes,
                clock: Some((content, clock.refresh_interval)),
            }
        }
        BackendConfig::Loopback(lb) => PreparedBackend {
            backend: Arc::new(LoopbackBackend::new(lb.root.clone(), lb.options())),
            reserved_inodes: Vec::new(),
            clock: None,
        },
    }
}

/// Represents an active mount
pub struct ActiveMount {
    /// Mount path
    pub path: PathBuf,
    /// Session handle (for unmounting)
    session: Option<fuser::BackgroundSession>,
    /// Refresh task for clock mounts
    publisher: Option<PublisherHandle>,
}

impl ActiveMount {
    /// Unmount the filesystem, then wait for its publisher to exit
    pub async fn unmount(mut self) {
        if let Some(session) = self.session.take() {
            info!("Unmounting {:?}", self.path);
            // Joins the session thread, which owns the adapter's runtime
            if let Err(e) = tokio::task::spawn_blocking(move || drop(session)).await {
                error!("Failed to unmount {:?}: {}", self.path, e);
            }
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.stop().await;
        }
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        if let Some(publisher) = &self.publisher {
            publisher.shutdown_signal().trigger();
        }
        if let Some(session) = self.session.take() {
            info!("Unmounting {:?}", self.path);
            drop(session);
        }
    }
}

/// Mount manager - handles lifecycle of all mounts
pub struct MountManager {
    /// Active mounts
    mounts: Mutex<Vec<ActiveMount>>,
    /// Runtime the clock publishers run on
    handle: Handle,
}

impl MountManager {
    pub fn new(handle: Handle) -> Self {
        Self {
            mounts: Mutex::new(Vec::new()),
            handle,
        }
    }

    /// Build the configured backend and mount it
    ///
    /// If `read_only` is set, the mount is read-only at the kernel level
    /// regardless of what the backend would allow.
    pub fn mount(&self, config: &MountConfig) -> Result<()> {
        let path = &config.path;
        info!("Mounting at {:?}", path);

        if !path.exists() {
            return Err(FsError::NotFound(format!(
                "Mount point does not exist: {:?}",
                path
            )));
        }

        if !path.is_dir() {
            return Err(FsError::NotADirectory(format!(
                "Mount point is not a directory: {:?}",
                path
            )));
        }

        let prepared = prepare_backend(&config.backend);
        let shutdown = ShutdownSignal::new();

        let adapter = FuseAdapter::new(
            prepared.backend,
            AdapterOptions {
                entry_timeout: config.entry_timeout,
                attr_timeout: config.attr_timeout,
                reserved_inodes: prepared.reserved_inodes,
                ..AdapterOptions::default()
            },
        )?
        .with_shutdown(shutdown.clone());

        let mut options = vec![
            MountOption::FSName(FS_NAME.to_string()),
            MountOption::AutoUnmount,
            MountOption::DefaultPermissions,
        ];

        if config.read_only {
            info!("Mounting {:?} as read-only", path);
            options.push(MountOption::RO);
        }

        if config.allow_other {
            options.push(MountOption::AllowOther);
        }

        let session = fuser::spawn_mount2(adapter, path, &options)?;

        let publisher = prepared.clock.map(|(content, interval)| {
            ClockPublisher::new(content, session.notifier(), CLOCK_INODE, interval)
                .with_shutdown(shutdown)
                .spawn(&self.handle)
        });

        self.mounts.lock().push(ActiveMount {
            path: path.clone(),
            session: Some(session),
            publisher,
        });

        info!("Successfully mounted at {:?}", path);
        Ok(())
    }

    /// Unmount a specific path
    pub async fn unmount(&self, path: &Path) -> Result<()> {
        let mount = {
            let mut mounts = self.mounts.lock();
            mounts
                .iter()
                .position(|m| m.path == path)
                .map(|pos| mounts.remove(pos))
        };
        match mount {
            Some(mount) => {
                mount.unmount().await;
                Ok(())
            }
            None => Err(FsError::NotFound(format!("No mount at {:?}", path))),
        }
    }

    /// Unmount all filesystems and join their publishers
    pub async fn unmount_all(&self) {
        info!("Unmounting all filesystems");
        let mounts: Vec<ActiveMount> = self.mounts.lock().drain(..).collect();
        for mount in mounts {
            mount.unmount().await;
        }
    }

    /// Get list of active mount paths
    pub fn list_mounts(&self) -> Vec<PathBuf> {
        self.mounts.lock().iter().map(|m| m.path.clone()).collect()
    }

    /// Number of active mounts
    pub fn count(&self) -> usize {
        self.mounts.lock().len()
    }
}
