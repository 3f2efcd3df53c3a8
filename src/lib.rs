//! Firmware update orchestrator for TI K3 boards over USB DFU
//!
//! A run optionally fetches an OS image (through a single-slot cache),
//! decompresses it, pushes the three-stage boot chain to the board one
//! stage at a time, and finally streams the image to the raw storage alt
//! setting. Progress is reported as [Event]s on a channel.
//!
//! ```no_run
//! use gemflash::{
//!     FlasherConfig, ImageCache, ImageRequest, ReqwestSource, Sequencer,
//!     UsbTransport,
//! };
//!
//! let config = FlasherConfig::new("/path/to/bootloader");
//! let cache = ImageCache::open(&config.paths.cache_dir)?;
//! let sequencer = Sequencer::new(
//!     config.clone(),
//!     ImageRequest::new("j7", "minimal", "debian", ""),
//!     UsbTransport::new(config.discovery.clone()),
//!     ReqwestSource::new()?,
//!     cache,
//! );
//! let handle = sequencer.spawn()?;
//! for event in handle.events() {
//!     println!("{event:?}");
//! }
//! handle.join();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquire;
pub mod cache;
pub mod config;
pub mod decompress;
pub mod error;
pub mod progress;
pub mod request;
pub mod sequencer;
pub mod transfer;

// Re-exports
pub use acquire::{HttpSource, ReqwestSource, TemporaryArtifacts};
pub use cache::{CacheEntry, Fingerprint, ImageCache};
pub use config::{Discovery, FlasherConfig, Paths, Timing};
pub use error::{AcquireError, DecompressError, FlashError};
pub use progress::{CancelToken, Event};
pub use request::{ImageRequest, ResolvedImage};
pub use sequencer::{FlashState, RunHandle, RunOutcome, Sequencer, StageDescriptor};
pub use transfer::{
    MatchCriteria, TransferError, TransferPrimitive, Transport, UsbTransport,
};
