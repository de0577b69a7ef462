//!
//! media contains the primary abstraction around the zoned block device: a
//! uniform asynchronous command submission / completion pipeline exposing
//! read, write, zone-append and zone management.
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;

use crate::error::ZtlError;

mod null;
mod uring;

pub use null::NullZoneMedia;
pub use uring::UringZoneMedia;

/// Device geometry, reported once at registration time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Geometry {
    /// Number of PU groups.
    pub ngrps: u32,
    /// Zones per group.
    pub zones_per_group: u32,
    /// Sectors per zone.
    pub nsect: u64,
    /// Bytes per sector.
    pub nbytes: u32,
    /// Out-of-band bytes per sector, if any.
    pub nbytes_oob: u32,
}

impl Geometry {
    pub fn total_zones(&self) -> u64 {
        self.ngrps as u64 * self.zones_per_group as u64
    }
}

/// A packed `(group, zone, sector)` address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneAddr {
    pub grp: u32,
    pub zone: u32,
    pub sect: u64,
}

impl ZoneAddr {
    /// Flat zone index within the device (group-major).
    pub fn flat_zone(&self, geo: &Geometry) -> u64 {
        geo.zones_per_group as u64 * self.grp as u64 + self.zone as u64
    }

    /// Absolute starting sector of this zone, used by zone-append and zone
    /// management commands which address zones rather than flat sectors.
    pub fn zone_base_sector(&self, geo: &Geometry) -> u64 {
        self.flat_zone(geo) * geo.nsect
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOpcode {
    Read,
    Write,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMgmtOp {
    Open,
    Close,
    Finish,
    Reset,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    Empty,
    EOpen,
    Closed,
    Full,
}

/// A DMA-style buffer. Real hardware needs page-aligned, pinned memory; since
/// the `NullZoneMedia` backend never does real DMA, alignment is honored but
/// pinning is not. `UringZoneMedia` uses the same allocation registered with
/// the kernel as an `io_uring` fixed buffer.
pub struct DmaBuf {
    ptr: *mut u8,
    len: usize,
    layout: std::alloc::Layout,
}

unsafe impl Send for DmaBuf {}

impl DmaBuf {
    pub fn alloc(size: usize, align: usize) -> Result<Self, ZtlError> {
        let layout = std::alloc::Layout::from_size_align(size.max(1), align)
            .map_err(|_| ZtlError::AsynchErr {
                reason: "invalid DMA buffer layout".into(),
            })?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(ZtlError::AsynchErr {
                reason: "DMA allocation failed".into(),
            });
        }
        Ok(Self { ptr, len: size, layout })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A raw, disjoint-slice view into this buffer starting at `offset` for
    /// `len` bytes. Callers must ensure slices handed out this way never
    /// overlap; the write-caching aggregator upholds this by construction
    /// (each mcmd addresses a disjoint byte range of the user buffer).
    pub fn slice(&self, offset: usize, len: usize) -> BufSlice {
        assert!(offset + len <= self.len);
        BufSlice {
            ptr: unsafe { self.ptr.add(offset) },
            len,
        }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

/// A raw, non-owning view into a [`DmaBuf`] (or any externally pinned
/// buffer). Used as the media command's `prp` field: the mcmd does not own
/// the memory, the owning [`crate::wca::Ucmd`] does, and outlives every
/// mcmd built against it.
#[derive(Clone, Copy)]
pub struct BufSlice {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for BufSlice {}

impl BufSlice {
    /// Builds a slice from a raw pointer and length. The caller is
    /// responsible for the pointer remaining valid for the mcmd's lifetime.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub type McmdCallback = Box<dyn FnOnce(&Mcmd) + Send>;

/// One device-level operation. Acquired from the command mempool at
/// submission, released back to it by the completion callback.
pub struct Mcmd {
    pub opcode: IoOpcode,
    pub addr: ZoneAddr,
    pub nsec: u32,
    pub prp: BufSlice,
    pub synch: bool,
    pub sequence: usize,
    pub sequence_zn: usize,
    /// Media sector the write/append landed at, filled in on completion.
    pub paddr: u64,
    /// 0 on success, nonzero device status otherwise.
    pub status: i32,
    pub submitted: bool,
    pub callback: Option<McmdCallback>,
}

impl Mcmd {
    pub fn new_template() -> Self {
        Self {
            opcode: IoOpcode::Read,
            addr: ZoneAddr::default(),
            nsec: 0,
            prp: BufSlice { ptr: std::ptr::null_mut(), len: 0 },
            synch: false,
            sequence: 0,
            sequence_zn: 0,
            paddr: 0,
            status: 0,
            submitted: false,
            callback: None,
        }
    }
}

impl fmt::Debug for Mcmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mcmd")
            .field("opcode", &self.opcode)
            .field("addr", &self.addr)
            .field("nsec", &self.nsec)
            .field("sequence", &self.sequence)
            .field("sequence_zn", &self.sequence_zn)
            .field("paddr", &self.paddr)
            .field("status", &self.status)
            .finish()
    }
}

/// One zone management operation (open/close/finish/reset/report).
#[derive(Debug)]
pub struct ZnMcmd {
    pub opcode: ZoneMgmtOp,
    pub addr: ZoneAddr,
    pub nzones: u32,
    pub status: i32,
    pub report: Option<ZoneReport>,
}

impl ZnMcmd {
    pub fn new(opcode: ZoneMgmtOp, addr: ZoneAddr) -> Self {
        Self { opcode, addr, nzones: 1, status: 0, report: None }
    }
}

#[derive(Debug, Clone)]
pub struct ZoneDescr {
    pub zslba: u64,
    pub state: ZoneState,
    pub wp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ZoneReport {
    pub zones: Vec<ZoneDescr>,
}

/// Per-thread handle binding a device submission queue, a completion thread
/// and a lock guarding submission. Created via [`ZoneMedia::asynch_init`],
/// destroyed via [`ZoneMedia::asynch_term`] once the completion thread has
/// stopped.
pub struct AsyncContext {
    pub(crate) id: u64,
    pub(crate) depth: u32,
    pub(crate) fifo: Arc<Mutex<VecDeque<Mcmd>>>,
    pub(crate) comp_active: Arc<AtomicBool>,
    pub(crate) submit_lock: Arc<Mutex<()>>,
    pub(crate) backend: Arc<dyn AsyncBackendQueue>,
    comp_thread: Option<JoinHandle<()>>,
}

static NEXT_CTX_ID: AtomicU64 = AtomicU64::new(1);

impl AsyncContext {
    fn new(depth: u32, backend: Arc<dyn AsyncBackendQueue>, affinity: Option<usize>) -> Self {
        let fifo = Arc::new(Mutex::new(VecDeque::new()));
        let comp_active = Arc::new(AtomicBool::new(false));
        let id = NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed);

        let thread_fifo = fifo.clone();
        let thread_active = comp_active.clone();
        thread_active.store(true, Ordering::SeqCst);
        let comp_thread = std::thread::Builder::new()
            .name(format!("ztl-comp-{id}"))
            .spawn(move || {
                if let Some(core) = affinity {
                    let _ = crate::affinity::pin_current_thread(core);
                }
                completion_loop(thread_fifo, thread_active);
            })
            .expect("failed to spawn completion thread");

        Self {
            id,
            depth,
            fifo,
            comp_active,
            submit_lock: Arc::new(Mutex::new(())),
            backend,
            comp_thread: Some(comp_thread),
        }
    }

    fn terminate(mut self) {
        self.comp_active.store(false, Ordering::SeqCst);
        if let Some(th) = self.comp_thread.take() {
            let _ = th.join();
        }
    }

    /// Pushes a completed mcmd onto this context's completion FIFO. Called
    /// by a backend's `poke` implementation once it has harvested a device
    /// completion and stamped status/paddr onto the mcmd.
    pub fn push_completion(&self, cmd: Mcmd) {
        self.fifo.lock().push_back(cmd);
    }
}

fn completion_loop(fifo: Arc<Mutex<VecDeque<Mcmd>>>, active: Arc<AtomicBool>) {
    while active.load(Ordering::SeqCst) {
        let next = fifo.lock().pop_front();
        match next {
            Some(mut cmd) => {
                if let Some(cb) = cmd.callback.take() {
                    cb(&cmd);
                }
            }
            None => std::thread::sleep(Duration::from_micros(1)),
        }
    }
}

/// Backend-specific per-context submission/completion plumbing. A real
/// device backend stores its own submission queue handle here; the fake
/// backend stores an in-memory pending list.
pub trait AsyncBackendQueue: Send + Sync {
    /// Enqueues `cmd` for asynchronous execution; does not block for
    /// completion.
    fn submit(&self, cmd: Mcmd) -> Result<(), ZtlError>;

    /// Drives device-side completion processing, moving up to `limit`
    /// completions (0 = all available) onto `ctx`'s FIFO. Returns the count
    /// reaped.
    fn poke(&self, ctx: &AsyncContext, limit: u32) -> Result<u32, ZtlError>;

    /// Number of commands submitted but not yet completed.
    fn outstanding(&self) -> u32;
}

/// Contract every concrete zoned media backend implements.
pub trait ZoneMedia: Send + Sync {
    fn geometry(&self) -> Geometry;

    fn init(&self) -> Result<(), ZtlError> {
        Ok(())
    }

    fn exit(&self) -> Result<(), ZtlError> {
        Ok(())
    }

    /// Submits one I/O command. For a synchronous command the call blocks
    /// until the device responds and the status/paddr fields are filled in
    /// before returning; the command's callback, if any, is invoked inline.
    /// For an asynchronous command the call returns immediately after
    /// enqueueing; completion arrives later through `poke`.
    fn submit_io(&self, ctx: &AsyncContext, cmd: Mcmd) -> Result<(), ZtlError>;

    /// Dispatches zone management (open/close/finish/reset/report). Always
    /// synchronous.
    fn submit_zone_mgmt(&self, cmd: &mut ZnMcmd) -> Result<(), ZtlError>;

    fn dma_alloc(&self, size: usize) -> Result<DmaBuf, ZtlError> {
        DmaBuf::alloc(size, self.geometry().nbytes.max(1) as usize)
    }

    fn dma_free(&self, _buf: DmaBuf) {}

    /// Creates an async submission queue of the given depth, spawns its
    /// completion thread, and blocks until the thread signals it is running.
    fn asynch_init(&self, depth: u32) -> Result<AsyncContext, ZtlError>;

    /// Joins the completion thread and tears down the backend's queue.
    fn asynch_term(&self, ctx: AsyncContext) -> Result<(), ZtlError> {
        let backend_outstanding = ctx.backend.outstanding();
        if backend_outstanding != 0 {
            tracing::warn!(backend_outstanding, "terminating context with outstanding I/O");
        }
        ctx.terminate();
        Ok(())
    }

    fn poke(&self, ctx: &AsyncContext, limit: u32) -> Result<u32, ZtlError> {
        ctx.backend.poke(ctx, limit)
    }

    fn outstanding(&self, ctx: &AsyncContext) -> Result<u32, ZtlError> {
        Ok(ctx.backend.outstanding())
    }

    fn wait(&self, ctx: &AsyncContext) -> Result<u32, ZtlError> {
        Ok(ctx.backend.outstanding())
    }
}

pub(crate) fn make_async_context(
    depth: u32,
    backend: Arc<dyn AsyncBackendQueue>,
    affinity: Option<usize>,
) -> AsyncContext {
    AsyncContext::new(depth, backend, affinity)
}
