//! remote-transfer - backend-agnostic remote file transfer
//!
//! Protocol adapters implement [`backend::Backend`] and advertise what they
//! can do as [`backend::Capabilities`]. A [`session::RemoteSession`] wraps
//! one backend; [`transfer::TransferOrchestrator`] runs resumable batch
//! uploads and downloads over it.

pub mod backend;
pub mod config;
pub mod error;
pub mod local;
pub mod session;
pub mod transfer;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use backend::{Backend, Capabilities, Capability, MemoryBackend};
pub use config::{ConfigStorage, TransferConfig};
pub use error::TransferError;
pub use local::{DiskFileSystem, LocalFileSystem};
pub use session::RemoteSession;
pub use transfer::{
    BatchResult, CopyParam, ProgressEvent, TransferControl, TransferFlags, TransferHandle,
    TransferOrchestrator, TransferRequest,
};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing when the host already installed a global subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
