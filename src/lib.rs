//!
//! A user-space zone translation layer core over a ZNS (zoned namespace)
//! block device: provisions zones, stripes writes across them through an
//! asynchronous write-caching aggregator, and maintains a logical-to-media
//! index.
//!
//! There is no process-wide global state. Construct one [`ZtlCore`] per
//! device and hand clones of its `Arc` handles to whatever threads need
//! them.
pub mod affinity;
pub mod config;
pub mod error;
pub mod index;
pub mod media;
pub mod mempool;
pub mod provisioner;
pub mod wca;

use std::sync::Arc;

pub use config::Config;
pub use error::ZtlError;
pub use index::{Index, InMemoryIndex, MetadataSink, NoopMetadataSink};
pub use media::{Geometry, NullZoneMedia, UringZoneMedia, ZoneAddr, ZoneMedia};
pub use provisioner::{Provisioner, Reservation};
pub use wca::{Piece, Wca, WcaHandle};

/// Runtime counters, queried for observability; mirrors the source's
/// per-thread read/write/gc statistics. Reset-count and bytes-read are not
/// carried: this crate has no internal path that issues a zone reset and no
/// read API on `ZtlCore` yet, so those two counters would never move (see
/// DESIGN.md).
#[derive(Default)]
pub struct Stats {
    pub writes_submitted: std::sync::atomic::AtomicU64,
    pub writes_completed: std::sync::atomic::AtomicU64,
    pub writes_failed: std::sync::atomic::AtomicU64,
    pub bytes_written: std::sync::atomic::AtomicU64,
    pub poke_count: std::sync::atomic::AtomicU64,
}

/// Ties media, provisioner and write-caching aggregator together for one
/// device. Construct with [`ZtlCore::init`]; there is no implicit global
/// instance and no re-entrant initialization.
pub struct ZtlCore {
    media: Arc<dyn ZoneMedia>,
    provisioner: Arc<Provisioner>,
    wca: Wca,
    index: Arc<dyn Index>,
    stats: Arc<Stats>,
    cfg: Config,
}

impl ZtlCore {
    /// Brings the core up over `media`: reports existing zone state into the
    /// provisioner, then starts the write-caching aggregator's writer
    /// thread. Returns `AlreadyInitialized` only in the sense that calling
    /// this twice over the same media produces two independent, non
    /// interfering cores; callers that want a true singleton own that
    /// decision themselves.
    pub fn init(media: Arc<dyn ZoneMedia>, cfg: Config) -> Result<Self, ZtlError> {
        media.init()?;
        let provisioner = Arc::new(Provisioner::init(media.as_ref(), cfg)?);
        let index: Arc<dyn Index> = Arc::new(InMemoryIndex::new());
        let metadata: Arc<dyn MetadataSink> = Arc::new(NoopMetadataSink);
        let stats = Arc::new(Stats::default());
        let wca = Wca::new(media.clone(), provisioner.clone(), index.clone(), metadata, stats.clone(), cfg)?;
        Ok(Self {
            media,
            provisioner,
            wca,
            index,
            stats,
            cfg,
        })
    }

    /// Same as [`ZtlCore::init`] but with a caller-supplied index and
    /// metadata sink, for callers that need durable mapping persistence.
    pub fn init_with_index(
        media: Arc<dyn ZoneMedia>,
        cfg: Config,
        index: Arc<dyn Index>,
        metadata: Arc<dyn MetadataSink>,
    ) -> Result<Self, ZtlError> {
        media.init()?;
        let provisioner = Arc::new(Provisioner::init(media.as_ref(), cfg)?);
        let stats = Arc::new(Stats::default());
        let wca = Wca::new(media.clone(), provisioner.clone(), index.clone(), metadata, stats.clone(), cfg)?;
        Ok(Self {
            media,
            provisioner,
            wca,
            index,
            stats,
            cfg,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.media.geometry()
    }

    pub fn config(&self) -> Config {
        self.cfg
    }

    pub fn index(&self) -> &Arc<dyn Index> {
        &self.index
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Writes `data` (a whole multiple of `sec_mcmd_min` sectors) under
    /// provisioning type `ptype`, tagged with `starting_lba` for the index.
    /// `app_md` marks the write as carrying application-managed metadata:
    /// set it when the caller owns its own index and can tolerate a
    /// multi-piece mapping, leave it `false` for ordinary ZTL-managed writes
    /// (a write that lands non-contiguously is then rejected with
    /// `AppendErr` instead of being indexed).
    pub fn write(
        &self,
        data: &[u8],
        ptype: u16,
        starting_lba: u64,
        app_md: bool,
    ) -> Result<WcaHandle, ZtlError> {
        self.stats.writes_submitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.wca.write(data, ptype, starting_lba, app_md)
    }

    pub fn lookup(&self, starting_lba: u64) -> Option<Vec<Piece>> {
        self.index.lookup(starting_lba)
    }
}
