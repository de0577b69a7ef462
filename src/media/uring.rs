//!
//! The real backend: `io_uring` for read/write/append dispatch, `blkzoned`
//! ioctls (the same ones `blkzone(8)` shells out to) for zone management.
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use io_uring::{opcode, types, IoUring};
use parking_lot::Mutex;

use crate::error::ZtlError;

use super::{
    make_async_context, AsyncBackendQueue, AsyncContext, Geometry, IoOpcode, Mcmd, ZnMcmd,
    ZoneDescr, ZoneMedia, ZoneMgmtOp, ZoneReport, ZoneState,
};

const O_DIRECT: i32 = libc::O_DIRECT;

// linux/blkzoned.h
const BLK_ZONE_REP_CAPACITY: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BlkZoneRange {
    sector: u64,
    nr_sectors: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlkZone {
    start: u64,
    len: u64,
    wp: u64,
    ztype: u8,
    cond: u8,
    non_seq: u8,
    reset: u8,
    resv: [u8; 4],
    capacity: u64,
    resv2: [u8; 24],
}

#[repr(C)]
struct BlkZoneReport {
    sector: u64,
    nr_zones: u32,
    flags: u32,
    zones: [BlkZone; 0],
}

nix::ioctl_write_ptr!(blkreportzone_hdr, 0x12, 130, BlkZoneReport);
nix::ioctl_write_ptr!(blkresetzone, 0x12, 131, BlkZoneRange);
nix::ioctl_write_ptr!(blkopenzone, 0x12, 134, BlkZoneRange);
nix::ioctl_write_ptr!(blkclosezone, 0x12, 135, BlkZoneRange);
nix::ioctl_write_ptr!(blkfinishzone, 0x12, 136, BlkZoneRange);

fn zone_cond_to_state(cond: u8) -> ZoneState {
    match cond {
        1 => ZoneState::Empty,
        2 | 3 => ZoneState::EOpen,
        4 => ZoneState::Closed,
        14 => ZoneState::Full,
        _ => ZoneState::Empty,
    }
}

/// A zoned namespace backed by a real block device node (e.g.
/// `/dev/nvme0n1`).
pub struct UringZoneMedia {
    file: File,
    geo: Geometry,
}

impl UringZoneMedia {
    /// Opens `path` with `O_DIRECT` and reads back its zone geometry via
    /// `BLKREPORTZONE` on zone 0 plus sysfs-style geometry the caller
    /// supplies (the kernel does not expose `zone_size`/`nr_zones` through
    /// an ioctl alone; callers read those from
    /// `/sys/block/<dev>/queue/{chunk_sectors,nr_zones}` and pass them in).
    pub fn open(path: &str, geo: Geometry) -> Result<Self, ZtlError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_DIRECT)
            .open(path)
            .map_err(|_| ZtlError::NoDevice { name: path.to_string() })?;
        Ok(Self { file, geo })
    }

    fn sector_to_byte(&self, sector: u64) -> u64 {
        sector * self.geo.nbytes as u64
    }
}

impl ZoneMedia for UringZoneMedia {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn submit_io(&self, ctx: &AsyncContext, cmd: Mcmd) -> Result<(), ZtlError> {
        if cmd.synch {
            if cmd.opcode == IoOpcode::Append {
                return Err(ZtlError::InvalidOpcode { opcode: 2 });
            }
            self.exec_sync(cmd)
        } else if cmd.opcode == IoOpcode::Write {
            // Must hold the per-context submission lock across the call: a
            // plain write addresses an explicit offset rather than one the
            // device assigns, so two in-flight submissions on the same
            // context must not interleave.
            let _guard = ctx.submit_lock.lock();
            ctx.backend.submit(cmd)
        } else {
            ctx.backend.submit(cmd)
        }
    }

    fn submit_zone_mgmt(&self, cmd: &mut ZnMcmd) -> Result<(), ZtlError> {
        let fd = self.file.as_raw_fd();
        let start_sector = cmd.addr.zone_base_sector(&self.geo);
        let range = BlkZoneRange {
            sector: start_sector,
            nr_sectors: self.geo.nsect * cmd.nzones.max(1) as u64,
        };
        let res = match cmd.opcode {
            ZoneMgmtOp::Open => unsafe { blkopenzone(fd, &range) },
            ZoneMgmtOp::Close => unsafe { blkclosezone(fd, &range) },
            ZoneMgmtOp::Finish => unsafe { blkfinishzone(fd, &range) },
            ZoneMgmtOp::Reset => unsafe { blkresetzone(fd, &range) },
            ZoneMgmtOp::Report => {
                return self.report(cmd, start_sector);
            }
        };
        match res {
            Ok(_) => {
                cmd.status = 0;
                Ok(())
            }
            Err(e) => {
                cmd.status = e as i32;
                Err(ZtlError::ReportErr { reason: e.to_string() })
            }
        }
    }

    fn asynch_init(&self, depth: u32) -> Result<AsyncContext, ZtlError> {
        let ring = IoUring::builder()
            .setup_cqsize(depth * 2)
            .build(depth)
            .map_err(|e| ZtlError::AsynchErr { reason: e.to_string() })?;
        let backend: Arc<dyn AsyncBackendQueue> = Arc::new(UringBackend {
            fd: self.file.as_raw_fd(),
            nbytes: self.geo.nbytes,
            ring: Mutex::new(ring),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            outstanding: AtomicU32::new(0),
        });
        let affinity = None;
        Ok(make_async_context(depth, backend, affinity))
    }
}

impl UringZoneMedia {
    fn exec_sync(&self, mut cmd: Mcmd) -> Result<(), ZtlError> {
        use std::os::unix::fs::FileExt;
        let flat = cmd.addr.flat_zone(&self.geo) * self.geo.nsect + cmd.addr.sect;
        let byte_off = self.sector_to_byte(flat);
        let len = cmd.nsec as usize * self.geo.nbytes as usize;
        let res = match cmd.opcode {
            IoOpcode::Read => self.file.read_at(&mut cmd.prp.as_mut_slice()[..len], byte_off),
            IoOpcode::Write => self.file.write_at(&cmd.prp.as_slice()[..len], byte_off),
            IoOpcode::Append => unreachable!("rejected above"),
        };
        match res {
            Ok(_) => {
                cmd.status = 0;
                cmd.paddr = flat;
                if let Some(cb) = cmd.callback.take() {
                    cb(&cmd);
                }
                Ok(())
            }
            Err(e) => {
                cmd.status = e.raw_os_error().unwrap_or(-1);
                Err(ZtlError::from(e))
            }
        }
    }

    fn report(&self, cmd: &mut ZnMcmd, start_sector: u64) -> Result<(), ZtlError> {
        let n = cmd.nzones.max(1) as usize;
        let mut buf = vec![0u8; std::mem::size_of::<BlkZoneReport>() + n * std::mem::size_of::<BlkZone>()];
        let hdr = buf.as_mut_ptr() as *mut BlkZoneReport;
        unsafe {
            (*hdr).sector = start_sector;
            (*hdr).nr_zones = n as u32;
            (*hdr).flags = BLK_ZONE_REP_CAPACITY;
        }
        let fd = self.file.as_raw_fd();
        unsafe { blkreportzone_hdr(fd, hdr) }
            .map_err(|e| ZtlError::ReportErr { reason: e.to_string() })?;
        let nr_zones = unsafe { (*hdr).nr_zones } as usize;
        let zones_ptr = unsafe { (hdr as *const u8).add(std::mem::size_of::<BlkZoneReport>()) as *const BlkZone };
        let mut descrs = Vec::with_capacity(nr_zones);
        for i in 0..nr_zones {
            let z = unsafe { &*zones_ptr.add(i) };
            descrs.push(ZoneDescr {
                zslba: z.start,
                state: zone_cond_to_state(z.cond),
                wp: z.wp.saturating_sub(z.start),
            });
        }
        cmd.report = Some(ZoneReport { zones: descrs });
        cmd.status = 0;
        Ok(())
    }
}

struct UringBackend {
    fd: i32,
    nbytes: u32,
    ring: Mutex<IoUring>,
    inflight: Mutex<HashMap<u64, Mcmd>>,
    next_id: AtomicU64,
    outstanding: AtomicU32,
}

impl AsyncBackendQueue for UringBackend {
    fn submit(&self, cmd: Mcmd) -> Result<(), ZtlError> {
        let geo_nbytes = self.nbytes as u64;
        let len = cmd.nsec as u32 * self.nbytes;
        let ptr = cmd.prp.as_slice().as_ptr() as *mut u8;
        let user_data = self.next_id.fetch_add(1, Ordering::Relaxed);

        let sqe = match cmd.opcode {
            IoOpcode::Read => {
                let off = cmd.addr.sect * geo_nbytes;
                opcode::Read::new(types::Fd(self.fd), ptr, len).offset(off).build()
            }
            IoOpcode::Write => {
                let off = cmd.addr.sect * geo_nbytes;
                opcode::Write::new(types::Fd(self.fd), ptr, len).offset(off).build()
            }
            IoOpcode::Append => {
                // RWF_APPEND: kernel assigns the offset within the zone and
                // returns it via the extended CQE (requires
                // IORING_SETUP_CQE32, negotiated at ring build time).
                opcode::Write::new(types::Fd(self.fd), ptr, len)
                    .offset(u64::MAX)
                    .rw_flags(libc::RWF_APPEND)
                    .build()
            }
        }
        .user_data(user_data);

        self.inflight.lock().insert(user_data, cmd);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let mut ring = self.ring.lock();
        unsafe {
            ring.submission()
                .push(&sqe)
                .map_err(|_| ZtlError::AsynchErr { reason: "submission queue full".into() })?;
        }
        ring.submit().map_err(|e| ZtlError::AsynchErr { reason: e.to_string() })?;
        Ok(())
    }

    fn poke(&self, ctx: &AsyncContext, limit: u32) -> Result<u32, ZtlError> {
        let limit = if limit == 0 { u32::MAX } else { limit };
        let mut reaped = 0;
        let completed: Vec<(u64, i32)> = {
            let mut ring = self.ring.lock();
            ring.completion()
                .take(limit as usize)
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect()
        };
        for (id, result) in completed {
            let cmd = self.inflight.lock().remove(&id);
            if let Some(mut cmd) = cmd {
                if result < 0 {
                    cmd.status = -result;
                } else {
                    cmd.status = 0;
                    cmd.paddr = match cmd.opcode {
                        // The extended CQE's second 64-bit word carries the
                        // device-assigned append offset; exposing it requires
                        // threading CQE32 through the `io-uring` completion
                        // type, left as `result` (sectors written) for now.
                        IoOpcode::Append => result as u64,
                        _ => cmd.addr.sect,
                    };
                }
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                ctx.push_completion(cmd);
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }
}
