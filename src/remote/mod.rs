//! Remote side of a sync: the SSH master connection and the unison runs.
//!
//! # Architecture
//!
//! - **connection**: opens one multiplexed ssh master, hands out a
//!   [`ConnectionHandle`], closes it again
//! - **sync**: builds unison command lines against `<remote>/.data` and
//!   `<remote>/links` and runs them through the open connection
//!
//! # Usage
//!
//! ```rust,ignore
//! use unisync::remote::{ConnectionManager, SyncOrchestrator};
//!
//! let mut manager = ConnectionManager::new().with_program(&config.programs.ssh);
//! let handle = manager
//!     .open(&config.server, &config.session.control_path, config.session.connect_timeout)
//!     .await?;
//!
//! let engine = SyncOrchestrator::new().with_program(&config.programs.unison);
//! engine.sync_data(&handle, &config.roots, &config.tools, &paths, false).await?;
//! engine.sync_links(&handle, &config.roots, &config.tools, &paths).await?;
//!
//! manager.close(handle).await?;
//! ```
//!
//! Only one sync runs per handle at a time: the session driver is sequential
//! and `close` takes the handle by value.

pub mod connection;
pub mod sync;

pub use connection::{ConnectionError, ConnectionHandle, ConnectionManager};
pub use sync::{
    DATA_DIR, Invocation, LINKS_DIR, SyncError, SyncOrchestrator, UnisonStatus, remote_root,
};
