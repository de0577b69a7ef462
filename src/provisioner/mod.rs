//!
//! Assigns zones to incoming writes. Zones are grouped by provisioning type
//! (e.g. data vs. metadata lanes); each type round-robins across groups the
//! way the source's `cur_grp[type]` cursor does, then reserves up to
//! `pro_stripe` zones within the chosen group for the write to stripe across.
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::ZtlError;
use crate::media::{Geometry, ZnMcmd, ZoneAddr, ZoneMedia, ZoneMgmtOp, ZoneState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalZoneState {
    Free,
    Open,
    Full,
}

struct ZoneMeta {
    addr: ZoneAddr,
    state: LocalZoneState,
    /// Sectors already handed out to callers but not necessarily written
    /// back yet; bounds how much more this zone can be reserved for.
    reserved: u64,
}

struct Group {
    id: u32,
    zones: Mutex<Vec<ZoneMeta>>,
}

/// One reserved zone slice: `nsec` sectors starting at `start_sect` within
/// the zone named by `addr`. A zone-append backend ignores `start_sect` and
/// lets the device assign the real offset; a plain-write backend must
/// address exactly this range.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub addr: ZoneAddr,
    pub start_sect: u64,
    pub nsec: u64,
}

pub struct Provisioner {
    geo: Geometry,
    cfg: Config,
    groups: Vec<Group>,
    cur_grp: Vec<Mutex<usize>>,
}

impl Provisioner {
    /// Builds the provisioner's view of the device: one group per PU group,
    /// zone state seeded from an initial `REPORT` so zones already full or
    /// closed from a prior run are not handed out as free.
    pub fn init(media: &dyn ZoneMedia, cfg: Config) -> Result<Self, ZtlError> {
        let geo = media.geometry();
        let mut groups = Vec::with_capacity(geo.ngrps as usize);
        for grp in 0..geo.ngrps {
            let mut zones = Vec::with_capacity(geo.zones_per_group as usize);
            for zone in 0..geo.zones_per_group {
                let addr = ZoneAddr { grp, zone, sect: 0 };
                let mut report = ZnMcmd::new(ZoneMgmtOp::Report, addr);
                media.submit_zone_mgmt(&mut report)?;
                let state = report
                    .report
                    .and_then(|r| r.zones.into_iter().next())
                    .map(|d| match d.state {
                        ZoneState::Full => LocalZoneState::Full,
                        ZoneState::EOpen | ZoneState::Closed => LocalZoneState::Open,
                        ZoneState::Empty => LocalZoneState::Free,
                    })
                    .unwrap_or(LocalZoneState::Free);
                zones.push(ZoneMeta { addr, state, reserved: 0 });
            }
            groups.push(Group { id: grp, zones: Mutex::new(zones) });
        }
        let cur_grp = (0..cfg.pro_types).map(|_| Mutex::new(0usize)).collect();
        Ok(Self { geo, cfg, groups, cur_grp })
    }

    /// Reserves zones able to absorb `nsec` sectors total for provisioning
    /// type `ptype`, round-robining the starting group the same way the
    /// source advances `cur_grp[type]` on every call. `multi` mirrors the
    /// source's append-or-multi selection rule: when it is `false` exactly
    /// one zone is handed out (a plain-write backend may only ever have one
    /// reservation open per user command), otherwise up to `cfg.pro_stripe`
    /// zones may be combined.
    pub fn reserve(&self, ptype: u16, nsec: u64, multi: bool) -> Result<Vec<Reservation>, ZtlError> {
        if self.groups.is_empty() {
            return Err(ZtlError::ProvisionFail { nsec: nsec as u32, ptype });
        }
        let cursor = &self.cur_grp[ptype as usize % self.cur_grp.len()];
        let ngroups = self.groups.len();
        let start = {
            let mut c = cursor.lock();
            let g = *c;
            *c = (*c + 1) % ngroups;
            g
        };

        let max_pieces = if multi { self.cfg.pro_stripe.max(1) as usize } else { 1 };
        let mut remaining = nsec;
        let mut out = Vec::new();

        'groups: for i in 0..ngroups {
            let grp = &self.groups[(start + i) % ngroups];
            let mut zones = grp.zones.lock();
            for z in zones.iter_mut() {
                if remaining == 0 || out.len() >= max_pieces {
                    break 'groups;
                }
                if z.state == LocalZoneState::Full {
                    continue;
                }
                let free_in_zone = self.geo.nsect.saturating_sub(z.reserved);
                if free_in_zone == 0 {
                    z.state = LocalZoneState::Full;
                    continue;
                }
                let take = remaining.min(free_in_zone);
                let start_sect = z.reserved;
                z.reserved += take;
                z.state = LocalZoneState::Open;
                out.push(Reservation { addr: z.addr, start_sect, nsec: take });
                remaining -= take;
            }
        }

        if remaining > 0 {
            self.rollback(&out);
            return Err(ZtlError::ProvisionFail { nsec: nsec as u32, ptype });
        }
        Ok(out)
    }

    /// Undoes a partial reservation made by a `reserve` call that ultimately
    /// failed to find enough capacity, so the unused sectors it provisionally
    /// claimed go back to the free pool instead of leaking.
    fn rollback(&self, out: &[Reservation]) {
        for r in out {
            if let Some(grp) = self.groups.get(r.addr.grp as usize) {
                let mut zones = grp.zones.lock();
                if let Some(z) = zones.iter_mut().find(|z| z.addr.zone == r.addr.zone) {
                    z.reserved = z.reserved.saturating_sub(r.nsec);
                    if z.reserved == 0 && z.state == LocalZoneState::Open {
                        z.state = LocalZoneState::Free;
                    }
                }
            }
        }
    }

    /// Releases a ucmd's reservations (§4.3 Contract `free(pro_addr)`). A
    /// reserved zone is not handed to any other user command until this is
    /// called; any zone whose reserved span has reached zone capacity
    /// transitions to full so it drops out of future `reserve` calls.
    pub fn free(&self, reservations: &[Reservation]) {
        for r in reservations {
            if let Some(grp) = self.groups.get(r.addr.grp as usize) {
                let mut zones = grp.zones.lock();
                if let Some(z) = zones.iter_mut().find(|z| z.addr.zone == r.addr.zone) {
                    if z.reserved >= self.geo.nsect {
                        z.state = LocalZoneState::Full;
                    }
                }
            }
        }
    }

    /// Returns a zone to the free pool without counting anything against it,
    /// e.g. a caller that opened a zone via zone management but never wrote
    /// through the provisioner. Mirrors the `put_zone` vtable entry of §6.
    pub fn put_zone(&self, grp: u32, zone: u32) {
        if let Some(g) = self.groups.get(grp as usize) {
            let mut zones = g.zones.lock();
            if let Some(z) = zones.iter_mut().find(|z| z.addr.zone == zone) {
                z.state = LocalZoneState::Free;
                z.reserved = 0;
            }
        }
    }

    /// Forces a zone to full ahead of natural capacity, mirroring the
    /// `finish_zn` vtable entry of §6 (a caller finishing a zone explicitly,
    /// e.g. to stop striping into it, rather than writing it to capacity).
    pub fn finish_zone(&self, grp: u32, zone: u32, _ptype: u16) {
        if let Some(g) = self.groups.get(grp as usize) {
            let mut zones = g.zones.lock();
            if let Some(z) = zones.iter_mut().find(|z| z.addr.zone == zone) {
                z.state = LocalZoneState::Full;
                z.reserved = self.geo.nsect;
            }
        }
    }

    /// Garbage collection is intentionally unimplemented: the source's
    /// `ztl_pro_check_gc` is an empty stub and reclamation policy is left to
    /// a higher layer this crate does not define.
    pub fn check_gc(&self) {}
}
