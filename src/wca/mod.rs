//!
//! The write-caching aggregator: takes one user write, fragments it into
//! media-command-sized chunks striped across zones the provisioner reserved,
//! submits them asynchronously, and once every child has completed, merges
//! their device-assigned offsets back into a handful of contiguous pieces
//! for the index.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::error::ZtlError;
use crate::index::{Index, MetadataSink};
use crate::media::{AsyncContext, BufSlice, DmaBuf, IoOpcode, Mcmd, ZoneAddr, ZoneMedia};
use crate::mempool::{MemoryPool, PoolKey};
use crate::provisioner::{Provisioner, Reservation};
use crate::Stats;

/// One contiguous run of sectors within a single zone, as it actually landed
/// on media. A ucmd whose writes spanned zones without a gap collapses to
/// one piece per zone; any offset break produces another piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub addr: ZoneAddr,
    pub nsec: u64,
}

struct ChildResult {
    sequence: usize,
    addr: ZoneAddr,
    nsec: u64,
    paddr: u64,
    status: i32,
}

/// Reconstructs contiguous pieces from child mcmd completions. Children are
/// walked in submission order; a piece extends as long as the next child
/// lands in the same zone immediately after the previous one's end, and
/// breaks otherwise.
fn reorg_ucmd_offsets(mut children: Vec<ChildResult>) -> Vec<Piece> {
    children.sort_by_key(|c| c.sequence);
    let mut pieces: Vec<Piece> = Vec::new();
    for c in children {
        match pieces.last_mut() {
            Some(p)
                if p.addr.grp == c.addr.grp
                    && p.addr.zone == c.addr.zone
                    && p.addr.sect + p.nsec == c.paddr =>
            {
                p.nsec += c.nsec;
            }
            _ => pieces.push(Piece {
                addr: ZoneAddr { grp: c.addr.grp, zone: c.addr.zone, sect: c.paddr },
                nsec: c.nsec,
            }),
        }
    }
    pieces
}

struct UcmdInner {
    id: u64,
    ptype: u16,
    starting_lba: u64,
    /// Application-managed metadata: when set, the index is allowed to carry
    /// a multi-piece mapping for this ucmd; when clear (the common,
    /// ZTL-managed case) a write that lands as more than one piece is
    /// rejected with `AppendErr` instead of being indexed (§3 invariant, §7
    /// `APPEND_ERR`, Non-goals).
    app_md: bool,
    buf: Mutex<Option<DmaBuf>>,
    children: Mutex<Vec<ChildResult>>,
    mcmds_total: AtomicU32,
    mcmds_done: AtomicU32,
    failed: AtomicBool,
    finished: Mutex<bool>,
    cv: Condvar,
    result: Mutex<Option<Result<(), ZtlError>>>,
}

/// A handle to a write in flight. Drop it or call [`WcaHandle::wait`] to
/// block for completion.
pub struct WcaHandle(Arc<UcmdInner>);

impl WcaHandle {
    pub fn wait(&self) -> Result<(), ZtlError> {
        let mut finished = self.0.finished.lock();
        while !*finished {
            self.0.cv.wait(&mut finished);
        }
        self.0.result.lock().clone().unwrap_or(Ok(()))
    }
}

static NEXT_UCMD_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

pub struct Wca {
    media: Arc<dyn ZoneMedia>,
    provisioner: Arc<Provisioner>,
    index: Arc<dyn Index>,
    metadata: Arc<dyn MetadataSink>,
    cfg: Config,
    ctx: Arc<AsyncContext>,
    mcmd_pool: Arc<MemoryPool<()>>,
    tx: Sender<(Arc<UcmdInner>, DmaBuf)>,
    shutdown: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
}

impl Wca {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media: Arc<dyn ZoneMedia>,
        provisioner: Arc<Provisioner>,
        index: Arc<dyn Index>,
        metadata: Arc<dyn MetadataSink>,
        stats: Arc<Stats>,
        cfg: Config,
    ) -> Result<Self, ZtlError> {
        let ctx = Arc::new(media.asynch_init(cfg.io_max_mcmd)?);
        let mcmd_pool = Arc::new(MemoryPool::create(
            PoolKey::Mcmd { sub_id: 0 },
            cfg.io_max_mcmd as usize,
            || (),
        ));
        let (tx, rx) = channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let writer = {
            let media = media.clone();
            let provisioner = provisioner.clone();
            let index = index.clone();
            let metadata = metadata.clone();
            let stats = stats.clone();
            let ctx = ctx.clone();
            let mcmd_pool = mcmd_pool.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("ztl-wca-write".into())
                .spawn(move || {
                    if cfg.write_affinity {
                        let _ = crate::affinity::pin_current_thread(cfg.write_core);
                    }
                    write_thread(media, provisioner, index, metadata, stats, cfg, ctx, mcmd_pool, rx, shutdown);
                })
                .expect("failed to spawn write thread")
        };

        Ok(Self {
            media,
            provisioner,
            index,
            metadata,
            cfg,
            ctx,
            mcmd_pool,
            tx,
            shutdown,
            writer: Some(writer),
        })
    }

    /// Queues `data` for write under provisioning type `ptype`, tagged with
    /// `starting_lba` for the index. `app_md` marks the write as carrying
    /// application-managed metadata, which allows its index entry to span
    /// more than one piece; pass `false` for ordinary ZTL-managed writes.
    /// Returns a handle the caller waits on.
    pub fn write(
        &self,
        data: &[u8],
        ptype: u16,
        starting_lba: u64,
        app_md: bool,
    ) -> Result<WcaHandle, ZtlError> {
        let geo = self.media.geometry();
        let align = self.cfg.sec_mcmd_min as u64 * geo.nbytes as u64;
        if data.len() as u64 % align != 0 {
            return Err(ZtlError::WcaSErr { id: 0 });
        }

        let mut buf = DmaBuf::alloc(data.len(), geo.nbytes.max(1) as usize)?;
        buf.as_mut_slice().copy_from_slice(data);

        let inner = Arc::new(UcmdInner {
            id: NEXT_UCMD_ID.fetch_add(1, Ordering::Relaxed),
            ptype,
            starting_lba,
            app_md,
            buf: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            mcmds_total: AtomicU32::new(0),
            mcmds_done: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            finished: Mutex::new(false),
            cv: Condvar::new(),
            result: Mutex::new(None),
        });

        self.tx
            .send((inner.clone(), buf))
            .map_err(|_| ZtlError::WcaSErr { id: inner.id })?;
        Ok(WcaHandle(inner))
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(th) = self.writer.take() {
            let _ = th.join();
        }
    }
}

fn finish_ucmd(ucmd: &Arc<UcmdInner>, result: Result<(), ZtlError>) {
    *ucmd.result.lock() = Some(result);
    let mut finished = ucmd.finished.lock();
    *finished = true;
    ucmd.cv.notify_all();
}

#[allow(clippy::too_many_arguments)]
fn write_thread(
    media: Arc<dyn ZoneMedia>,
    provisioner: Arc<Provisioner>,
    index: Arc<dyn Index>,
    metadata: Arc<dyn MetadataSink>,
    stats: Arc<Stats>,
    cfg: Config,
    ctx: Arc<AsyncContext>,
    mcmd_pool: Arc<MemoryPool<()>>,
    rx: Receiver<(Arc<UcmdInner>, DmaBuf)>,
    shutdown: Arc<AtomicBool>,
) {
    let mut pending: VecDeque<(Arc<UcmdInner>, DmaBuf)> = VecDeque::new();
    loop {
        match rx.recv_timeout(Duration::from_micros(1)) {
            Ok(item) => pending.push_back(item),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if pending.is_empty() {
                    break;
                }
            }
        }

        if let Some((ucmd, buf)) = pending.pop_front() {
            if let Err(e) = process_ucmd(
                &media,
                &provisioner,
                &index,
                &metadata,
                &stats,
                &cfg,
                &ctx,
                &mcmd_pool,
                &ucmd,
                buf,
            ) {
                finish_ucmd(&ucmd, Err(e));
            }
        }

        let _ = media.poke(ctx.as_ref(), 0);
        stats.poke_count.fetch_add(1, Ordering::Relaxed);

        if shutdown.load(Ordering::SeqCst) && pending.is_empty() {
            match rx.try_recv() {
                Ok(item) => pending.push_back(item),
                Err(_) => break,
            }
        }
    }
}

/// One yet-to-be-submitted media command: the chunk of the user buffer it
/// carries, the zone it targets, and its global submission ordinal.
struct PlanItem {
    seq: usize,
    addr: ZoneAddr,
    off: u64,
    nsec: u64,
}

/// State shared by every child mcmd's completion callback for one ucmd.
/// Carries the per-zone submission queues and in-flight flags that implement
/// §4.4 step 5: with zone-append disabled, a zone may have at most one
/// outstanding write at a time, so the next queued chunk for a zone is only
/// submitted once the previous one completes (Testable Property 5).
struct Shared {
    media: Arc<dyn ZoneMedia>,
    ctx: Arc<AsyncContext>,
    mcmd_pool: Arc<MemoryPool<()>>,
    provisioner: Arc<Provisioner>,
    index: Arc<dyn Index>,
    metadata: Arc<dyn MetadataSink>,
    stats: Arc<Stats>,
    ucmd: Arc<UcmdInner>,
    geo: crate::media::Geometry,
    append: bool,
    pro_stripe: usize,
    reservations: Vec<Reservation>,
    queues: Mutex<Vec<VecDeque<PlanItem>>>,
    minflight: Vec<AtomicBool>,
}

impl Shared {
    fn submit(self: &Arc<Self>, zi: usize, item: PlanItem) -> Result<(), ZtlError> {
        let opcode = if self.append { IoOpcode::Append } else { IoOpcode::Write };
        let slice = {
            let guard = self.ucmd.buf.lock();
            let b = guard.as_ref().unwrap();
            unsafe {
                BufSlice::from_raw(
                    b.as_slice().as_ptr().add(item.off as usize) as *mut u8,
                    (item.nsec * self.geo.nbytes as u64) as usize,
                )
            }
        };

        let mut cmd = Mcmd::new_template();
        cmd.opcode = opcode;
        cmd.addr = item.addr;
        cmd.nsec = item.nsec as u32;
        cmd.prp = slice;
        cmd.synch = false;
        cmd.sequence = item.seq;
        // Zone ordinal this mcmd belongs to (§3), used above to gate
        // at-most-one-outstanding-write-per-zone when append is disabled.
        cmd.sequence_zn = zi;

        self.minflight[zi].store(true, Ordering::SeqCst);

        let shared = self.clone();
        let seq = item.seq;
        cmd.callback = Some(Box::new(move |completed: &Mcmd| {
            shared.on_complete(zi, completed);
        }));

        self.media.submit_io(self.ctx.as_ref(), cmd)?;
        if (seq + 1) % self.pro_stripe == 0 {
            let _ = self.media.poke(self.ctx.as_ref(), 0);
            self.stats.poke_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Submits the next queued chunk for zone `zi`, if any, now that the
    /// previous one (if this isn't the first) has completed and cleared the
    /// zone's in-flight flag.
    fn drain(self: &Arc<Self>, zi: usize) {
        let item = { self.queues.lock()[zi].pop_front() };
        let item = match item {
            Some(item) => item,
            None => return,
        };
        if self.mcmd_pool.get().is_none() {
            self.provisioner.free(&self.reservations);
            finish_ucmd(&self.ucmd, Err(ZtlError::WcaS2Err { id: self.ucmd.id }));
            return;
        }
        if self.submit(zi, item).is_err() {
            self.provisioner.free(&self.reservations);
            finish_ucmd(&self.ucmd, Err(ZtlError::WcaS2Err { id: self.ucmd.id }));
        }
    }

    /// Submits the first chunk of every zone. With append enabled every
    /// chunk of a zone is submitted eagerly (several outstanding writes per
    /// zone are fine, the device assigns disjoint offsets); with append
    /// disabled only the head of each zone's queue goes out, the rest
    /// trickling in from completions via [`Shared::drain`].
    fn kickoff(self: &Arc<Self>) -> Result<(), ZtlError> {
        let nzones = self.reservations.len();
        for zi in 0..nzones {
            if self.append {
                loop {
                    let item = { self.queues.lock()[zi].pop_front() };
                    let item = match item {
                        Some(item) => item,
                        None => break,
                    };
                    if self.mcmd_pool.get().is_none() {
                        return Err(ZtlError::WcaS2Err { id: self.ucmd.id });
                    }
                    self.submit(zi, item)?;
                }
            } else {
                let item = { self.queues.lock()[zi].pop_front() };
                if let Some(item) = item {
                    if self.mcmd_pool.get().is_none() {
                        return Err(ZtlError::WcaS2Err { id: self.ucmd.id });
                    }
                    self.submit(zi, item)?;
                }
            }
        }
        Ok(())
    }

    fn on_complete(self: Arc<Self>, zi: usize, completed: &Mcmd) {
        self.mcmd_pool.put(());

        let effective_addr = if self.append {
            ZoneAddr { grp: completed.addr.grp, zone: completed.addr.zone, sect: completed.paddr }
        } else {
            completed.addr
        };

        self.ucmd.children.lock().push(ChildResult {
            sequence: completed.sequence,
            addr: effective_addr,
            nsec: completed.nsec as u64,
            paddr: effective_addr.sect,
            status: completed.status,
        });

        if completed.status != 0 {
            self.ucmd.failed.store(true, Ordering::SeqCst);
        } else {
            self.stats
                .bytes_written
                .fetch_add(completed.nsec as u64 * self.geo.nbytes as u64, Ordering::Relaxed);
        }

        if !self.append {
            self.minflight[zi].store(false, Ordering::SeqCst);
        }

        let done = self.ucmd.mcmds_done.fetch_add(1, Ordering::SeqCst) + 1;
        if done == self.ucmd.mcmds_total.load(Ordering::SeqCst) {
            self.finalize();
        } else if !self.append {
            self.drain(zi);
        }
    }

    /// Last child has completed: reorganize offsets, enforce the
    /// single-contiguous-range invariant for ZTL-managed ucmds, upsert the
    /// index, release provisioning, and wake the waiter (§4.4 Completion
    /// aggregation).
    fn finalize(self: &Arc<Self>) {
        let children = std::mem::take(&mut *self.ucmd.children.lock());
        let result = if self.ucmd.failed.load(Ordering::SeqCst) {
            Err(ZtlError::WcaS2Err { id: self.ucmd.id })
        } else {
            let pieces = reorg_ucmd_offsets(children);
            if !self.ucmd.app_md && pieces.len() != 1 {
                Err(ZtlError::AppendErr { id: self.ucmd.id })
            } else {
                self.index
                    .upsert(self.ucmd.starting_lba, &pieces)
                    .and_then(|_| self.metadata.flush(&pieces))
            }
        };

        match &result {
            Ok(()) => self.stats.writes_completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.writes_failed.fetch_add(1, Ordering::Relaxed),
        };

        self.provisioner.free(&self.reservations);
        *self.ucmd.buf.lock() = None;
        finish_ucmd(&self.ucmd, result);
    }
}

#[allow(clippy::too_many_arguments)]
fn process_ucmd(
    media: &Arc<dyn ZoneMedia>,
    provisioner: &Arc<Provisioner>,
    index: &Arc<dyn Index>,
    metadata: &Arc<dyn MetadataSink>,
    stats: &Arc<Stats>,
    cfg: &Config,
    ctx: &Arc<AsyncContext>,
    mcmd_pool: &Arc<MemoryPool<()>>,
    ucmd: &Arc<UcmdInner>,
    buf: DmaBuf,
) -> Result<(), ZtlError> {
    let geo = media.geometry();
    let total_sectors = buf.len() as u64 / geo.nbytes as u64;

    // Append (or an explicit multi hint, which this crate exposes only via
    // `write_append`) allows striping across up to `pro_stripe` zones;
    // otherwise the provisioner hands back exactly one (§4.3 Selection).
    let reservations = provisioner
        .reserve(ucmd.ptype, total_sectors, cfg.write_append)
        .map_err(|_| ZtlError::WcaSErr { id: ucmd.id })?;

    let mut queues: Vec<VecDeque<PlanItem>> = (0..reservations.len()).map(|_| VecDeque::new()).collect();
    let mut byte_off = 0u64;
    let mut seq = 0usize;
    for (zi, r) in reservations.iter().enumerate() {
        let mut within = 0u64;
        let mut left = r.nsec;
        while left > 0 {
            let take = left.min(cfg.sec_mcmd as u64);
            let addr = ZoneAddr { grp: r.addr.grp, zone: r.addr.zone, sect: r.start_sect + within };
            queues[zi].push_back(PlanItem { seq, addr, off: byte_off, nsec: take });
            seq += 1;
            byte_off += take * geo.nbytes as u64;
            within += take;
            left -= take;
        }
    }

    if seq as u32 > cfg.io_max_mcmd {
        provisioner.free(&reservations);
        return Err(ZtlError::WcaSErr { id: ucmd.id });
    }

    ucmd.mcmds_total.store(seq as u32, Ordering::SeqCst);
    *ucmd.buf.lock() = Some(buf);

    let minflight = (0..reservations.len()).map(|_| AtomicBool::new(false)).collect();
    let shared = Arc::new(Shared {
        media: media.clone(),
        ctx: ctx.clone(),
        mcmd_pool: mcmd_pool.clone(),
        provisioner: provisioner.clone(),
        index: index.clone(),
        metadata: metadata.clone(),
        stats: stats.clone(),
        ucmd: ucmd.clone(),
        geo,
        append: cfg.write_append,
        pro_stripe: cfg.pro_stripe.max(1) as usize,
        reservations,
        queues: Mutex::new(queues),
        minflight,
    });

    if let Err(e) = shared.kickoff() {
        provisioner.free(&shared.reservations);
        return Err(e);
    }

    Ok(())
}
