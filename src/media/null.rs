//!
//! An in-memory fake of a zoned device, used by the test suite in place of a
//! real `/dev/nvmeXnY` zoned namespace. Mirrors the CUnit harness's use of a
//! null-backed target in the source tests, minus the NVMf plumbing.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ZtlError;

use super::{
    make_async_context, AsyncBackendQueue, AsyncContext, Geometry, IoOpcode, Mcmd, ZnMcmd,
    ZoneDescr, ZoneMedia, ZoneMgmtOp, ZoneReport, ZoneState,
};

struct ZoneEntry {
    state: ZoneState,
    /// Sectors written so far, relative to the zone start.
    wp: u64,
}

struct Inner {
    geo: Geometry,
    data: Mutex<Vec<u8>>,
    zones: Mutex<Vec<ZoneEntry>>,
    #[cfg(feature = "fault_injection")]
    fail_next: std::sync::atomic::AtomicBool,
}

impl Inner {
    fn sector_offset(&self, flat_sector: u64) -> usize {
        flat_sector as usize * self.geo.nbytes as usize
    }

    fn zone_index(&self, flat_zone: u64) -> usize {
        flat_zone as usize
    }
}

/// A zoned device that lives entirely in process memory.
pub struct NullZoneMedia {
    inner: Arc<Inner>,
}

impl NullZoneMedia {
    pub fn new(ngrps: u32, zones_per_group: u32, nsect: u64, nbytes: u32) -> Self {
        let geo = Geometry { ngrps, zones_per_group, nsect, nbytes, nbytes_oob: 0 };
        let total_zones = geo.total_zones() as usize;
        let capacity = total_zones * nsect as usize * nbytes as usize;
        let zones = (0..total_zones)
            .map(|_| ZoneEntry { state: ZoneState::Empty, wp: 0 })
            .collect();
        Self {
            inner: Arc::new(Inner {
                geo,
                data: Mutex::new(vec![0u8; capacity]),
                zones: Mutex::new(zones),
                #[cfg(feature = "fault_injection")]
                fail_next: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Forces the next I/O command completed by this device to report a
    /// failure, without touching the backing store. Used to exercise the
    /// write-caching aggregator's mid-submit unwind path.
    #[cfg(feature = "fault_injection")]
    pub fn inject_next_failure(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }

    fn exec_io(&self, cmd: &mut Mcmd) {
        #[cfg(feature = "fault_injection")]
        if self.inner.fail_next.swap(false, Ordering::SeqCst) {
            cmd.status = libc::EIO;
            return;
        }
        let geo = self.inner.geo;
        match cmd.opcode {
            IoOpcode::Read => {
                let flat = cmd.addr.flat_zone(&geo) * geo.nsect + cmd.addr.sect;
                let off = self.inner.sector_offset(flat);
                let len = cmd.nsec as usize * geo.nbytes as usize;
                let data = self.inner.data.lock();
                cmd.prp.as_mut_slice()[..len].copy_from_slice(&data[off..off + len]);
                cmd.status = 0;
                cmd.paddr = flat;
            }
            IoOpcode::Write => {
                let flat = cmd.addr.flat_zone(&geo) * geo.nsect + cmd.addr.sect;
                let off = self.inner.sector_offset(flat);
                let len = cmd.nsec as usize * geo.nbytes as usize;
                let mut data = self.inner.data.lock();
                data[off..off + len].copy_from_slice(&cmd.prp.as_slice()[..len]);
                self.advance_wp(&cmd.addr, cmd.nsec as u64);
                cmd.status = 0;
                cmd.paddr = flat;
            }
            IoOpcode::Append => {
                let zidx = self.inner.zone_index(cmd.addr.flat_zone(&geo));
                let wp = {
                    let zones = self.inner.zones.lock();
                    zones[zidx].wp
                };
                let flat = cmd.addr.flat_zone(&geo) * geo.nsect + wp;
                let off = self.inner.sector_offset(flat);
                let len = cmd.nsec as usize * geo.nbytes as usize;
                let mut data = self.inner.data.lock();
                data[off..off + len].copy_from_slice(&cmd.prp.as_slice()[..len]);
                drop(data);
                self.advance_wp(&cmd.addr, cmd.nsec as u64);
                cmd.status = 0;
                // Device-assigned append offset, relative to zone start.
                cmd.paddr = wp;
            }
        }
    }

    fn advance_wp(&self, addr: &super::ZoneAddr, nsec: u64) {
        let geo = self.inner.geo;
        let zidx = self.inner.zone_index(addr.flat_zone(&geo));
        let mut zones = self.inner.zones.lock();
        let z = &mut zones[zidx];
        z.wp += nsec;
        if z.state == ZoneState::Empty {
            z.state = ZoneState::EOpen;
        }
        if z.wp >= geo.nsect {
            z.state = ZoneState::Full;
        }
    }
}

impl ZoneMedia for NullZoneMedia {
    fn geometry(&self) -> Geometry {
        self.inner.geo
    }

    fn submit_io(&self, ctx: &AsyncContext, mut cmd: Mcmd) -> Result<(), ZtlError> {
        if cmd.synch {
            if cmd.opcode == IoOpcode::Append {
                return Err(ZtlError::InvalidOpcode { opcode: 2 });
            }
            self.exec_io(&mut cmd);
            if let Some(cb) = cmd.callback.take() {
                cb(&cmd);
            }
            Ok(())
        } else if cmd.opcode == IoOpcode::Write {
            // Plain writes address an explicit, caller-assigned offset
            // rather than letting the device pick one, so the submission
            // must be serialized per context to keep that bookkeeping race
            // free.
            let _guard = ctx.submit_lock.lock();
            ctx.backend.submit(cmd)
        } else {
            ctx.backend.submit(cmd)
        }
    }

    fn submit_zone_mgmt(&self, cmd: &mut ZnMcmd) -> Result<(), ZtlError> {
        let geo = self.inner.geo;
        let start = self.inner.zone_index(cmd.addr.flat_zone(&geo));
        let mut zones = self.inner.zones.lock();
        match cmd.opcode {
            ZoneMgmtOp::Open => {
                for z in &mut zones[start..start + cmd.nzones.max(1) as usize] {
                    z.state = ZoneState::EOpen;
                }
            }
            ZoneMgmtOp::Close => {
                for z in &mut zones[start..start + cmd.nzones.max(1) as usize] {
                    z.state = ZoneState::Closed;
                }
            }
            ZoneMgmtOp::Finish => {
                for z in &mut zones[start..start + cmd.nzones.max(1) as usize] {
                    z.state = ZoneState::Full;
                    z.wp = geo.nsect;
                }
            }
            ZoneMgmtOp::Reset => {
                for z in &mut zones[start..start + cmd.nzones.max(1) as usize] {
                    z.state = ZoneState::Empty;
                    z.wp = 0;
                }
            }
            ZoneMgmtOp::Report => {
                let n = cmd.nzones.max(1) as usize;
                let descrs = zones[start..start + n]
                    .iter()
                    .enumerate()
                    .map(|(i, z)| ZoneDescr {
                        zslba: (start + i) as u64 * geo.nsect,
                        state: z.state,
                        wp: z.wp,
                    })
                    .collect();
                cmd.report = Some(ZoneReport { zones: descrs });
            }
        }
        cmd.status = 0;
        Ok(())
    }

    fn asynch_init(&self, depth: u32) -> Result<AsyncContext, ZtlError> {
        let backend: Arc<dyn AsyncBackendQueue> = Arc::new(NullBackend {
            device: self.inner.clone(),
            pending: Mutex::new(VecDeque::new()),
            outstanding: AtomicU32::new(0),
        });
        Ok(make_async_context(depth, backend, None))
    }
}

struct NullBackend {
    device: Arc<Inner>,
    pending: Mutex<VecDeque<Mcmd>>,
    outstanding: AtomicU32,
}

impl AsyncBackendQueue for NullBackend {
    fn submit(&self, cmd: Mcmd) -> Result<(), ZtlError> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back(cmd);
        Ok(())
    }

    fn poke(&self, ctx: &AsyncContext, limit: u32) -> Result<u32, ZtlError> {
        let limit = if limit == 0 { u32::MAX } else { limit };
        let mut reaped = 0;
        while reaped < limit {
            let mut cmd = match self.pending.lock().pop_front() {
                Some(c) => c,
                None => break,
            };
            let media = NullZoneMedia { inner: self.device.clone() };
            media.exec_io(&mut cmd);
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            ctx.push_completion(cmd);
            reaped += 1;
        }
        Ok(reaped)
    }

    fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{BufSlice, DmaBuf, ZoneAddr};

    fn media() -> NullZoneMedia {
        NullZoneMedia::new(1, 4, 64, 512)
    }

    #[test]
    fn report_reflects_reset_open_close_finish_cycle() {
        let m = media();
        let addr = ZoneAddr { grp: 0, zone: 2, sect: 0 };

        let mut open = ZnMcmd::new(ZoneMgmtOp::Open, addr);
        m.submit_zone_mgmt(&mut open).unwrap();

        let mut close = ZnMcmd::new(ZoneMgmtOp::Close, addr);
        m.submit_zone_mgmt(&mut close).unwrap();

        let mut finish = ZnMcmd::new(ZoneMgmtOp::Finish, addr);
        m.submit_zone_mgmt(&mut finish).unwrap();

        let mut reset = ZnMcmd::new(ZoneMgmtOp::Reset, addr);
        m.submit_zone_mgmt(&mut reset).unwrap();

        let mut report = ZnMcmd::new(ZoneMgmtOp::Report, addr);
        m.submit_zone_mgmt(&mut report).unwrap();
        let descr = &report.report.unwrap().zones[0];
        assert_eq!(descr.state, ZoneState::Empty);
        assert_eq!(descr.wp, 0);
    }

    #[test]
    fn async_append_completes_via_poke_and_assigns_offset() {
        let m = media();
        let ctx = m.asynch_init(16).unwrap();
        let mut buf = DmaBuf::alloc(16 * 512, 512).unwrap();
        buf.as_mut_slice().iter_mut().for_each(|b| *b = 0xAB);
        let slice = unsafe { BufSlice::from_raw(buf.as_mut_slice().as_mut_ptr(), buf.len()) };

        let mut cmd = Mcmd::new_template();
        cmd.opcode = IoOpcode::Append;
        cmd.addr = ZoneAddr { grp: 0, zone: 0, sect: 0 };
        cmd.nsec = 16;
        cmd.prp = slice;
        cmd.synch = false;

        m.submit_io(&ctx, cmd).unwrap();
        let mut reaped = 0;
        while reaped == 0 {
            reaped = m.poke(&ctx, 0).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        m.asynch_term(ctx).unwrap();
    }
}
