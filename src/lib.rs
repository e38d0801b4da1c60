//! vfs-adapter: FUSE filesystems backed by a live clock file or a host directory
//!
//! # Architecture
//!
//! - **Backends**: stores implementing the path-based `Backend` trait. The
//!   clock backend serves one read-only file holding the current time; the
//!   loopback backend mirrors a host directory.
//! - **Handles and directory cursors**: per-open state lives in a
//!   generation-checked `HandleTable`; directory listings resume from opaque
//!   `DirCursor` tokens so paginated reads never skip or repeat entries.
//! - **Extended attributes**: `XattrVirtualizer` hides the reserved security
//!   attribute behind an alias name.
//! - **Publisher**: a background task refreshes the clock file and tells the
//!   kernel to drop its cached copy.
//! - **FUSE Adapter**: translates kernel requests to backend calls and keeps
//!   the inode table.
//! - **Mount Manager**: handles lifecycle of multiple simultaneous mounts.
//!
//! # Example
//!
//! ```no_run
//! use vfs_adapter::config::Config;
//! use vfs_adapter::mount::MountManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("config.yaml".as_ref())?;
//! config.validate()?;
//!
//! let manager = MountManager::new(tokio::runtime::Handle::current());
//! for mount in &config.mounts {
//!     manager.mount(mount)?;
//! }
//!
//! // ... later
//! manager.unmount_all().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod dirent;
pub mod error;
pub mod fuse;
pub mod handle;
pub mod mount;
pub mod publisher;
pub mod xattr;

pub use error::{FsError, Result};
