#![forbid(unsafe_code)]
//! Persistent, bounded cache of container images for a local daemon.
//!
//! When a container is created from an image the daemon pulls it; imgstash
//! observes the pull event, saves the image to disk, and after a reboot or
//! daemon restart proactively reloads recently used images so subsequent
//! pulls become no-ops. Eviction is bounded by a fixed image count,
//! ordered by recency of use.
//!
//! # Architecture
//!
//! - [`daemon`] — capability surface over the container daemon's HTTP API
//!   (readiness, inspect, tar export/import, pull-event subscription);
//! - [`meta_index`] — the `meta.json` index mapping image names to
//!   `{image id, updated at}`;
//! - [`blob_store`] — the tar-demultiplexing store: per-image metadata
//!   directories plus shared, zstd-compressed layer directories, with
//!   garbage collection of unreferenced layers;
//! - [`storage`] — the pairing facade keeping index and blobs consistent;
//! - [`mover`] — daemon ↔ store transfer with the skip-if-up-to-date rule;
//! - [`recency`] + [`controller`] — the bounded LRU policy and the event
//!   loop driving admissions and evictions.
//!
//! # On-disk layout
//!
//! ```text
//! <cache-dir>/
//!     meta.json                      index of cached images
//!     meta/<slug(image-name)>/       non-layer files of the image tar
//!         manifest.json
//!     layers/<layer-id>/             shared between images
//!         layer.tar                  zstd-compressed payload
//!         layer.taroriginalSize      uncompressed byte length
//! ```

pub mod blob_store;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod meta_index;
pub mod mover;
pub mod recency;
pub mod scratch;
pub mod storage;

pub use config::DaemonConfig;
pub use controller::{run, Controller};
pub use daemon::{ContainerDaemon, DockerDaemon, PullEvent};
pub use error::{CacheError, Result};
pub use meta_index::{MetaEntry, MetaIndex};
pub use mover::Mover;
pub use recency::{CacheItem, RecencyHooks, RecencyIndex};
pub use scratch::ScratchFile;
pub use storage::Storage;
