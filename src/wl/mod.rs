//! Wear-leveling: handing out PEBs, taking them back, and keeping erase counts even
//!
//! Every usable PEB is tracked by a [registry] entry carrying its erase counter (EC). Free PEBs are
//! handed out by [UbiDevice::allocate_peb] and spend some time in the protection queue before
//! they become eligible for wear-leveling; released PEBs are erased in the background. Whenever
//! the least-worn used PEB falls `wl_threshold` erases behind the free pool, the [mover] copies
//! its contents to a more worn free PEB, so that the cold data stops pinning a fresh block.
//!
//! All of this state lives behind one short-lived mutex ([WlState]); anything slow (I/O, waiting
//! for jobs) happens with it released.

mod erase;
mod mover;
mod picker;
mod registry;

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

pub use picker::{AnchorPicker, PebPicker, PlainPicker};
pub use registry::{Owner, WlEntry};

use crate::conso::ConsoState;
use crate::eba::Eba;
use crate::nand::ReadStatus;
use crate::ubi::{AttachInfo, FlashIo, Geometry};
use crate::work::{WorkKind, WorkQueue, Worker};
use crate::{Error, Pnum, Result, WlConfig};
use registry::Registry;

/// How the device's PEBs are budgeted
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Capacity {
    pub good_peb_count: u32,
    pub bad_peb_count: u32,

    /// PEBs the upper layer may fill with data
    pub avail_pebs: u32,

    /// PEBs held back: the bad block reserve plus the wear-leveling and consolidation reserves
    pub rsvd_pebs: u32,

    /// PEBs set aside to replace blocks that go bad
    pub beb_rsvd_pebs: u32,

    /// Consolidation starts once no more than this many PEBs are free
    pub conso_threshold: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockStats {
    pub pnum: Pnum,
    pub ec: u64,
    pub read_count: u64,
}

/// The verdict of [UbiDevice::bitflip_check]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BitflipStatus {
    /// No bit-flips; nothing was done
    Clean,

    /// The PEB will be scrubbed (or, if free, erased)
    ScrubScheduled,

    /// The PEB is already being dealt with
    Busy,

    /// The PEB is not tracked by wear-leveling
    NotFound,
}

/// Everything guarded by the wear-leveling lock
#[derive(Debug)]
pub(crate) struct WlState {
    pub(crate) reg: Registry,

    /// The move target was released while the move was in progress
    pub(crate) move_to_put: bool,

    /// A wear-leveling job is queued or running
    pub(crate) wl_scheduled: bool,

    pub(crate) max_ec: u64,
    pub(crate) cap: Capacity,
}

/// An attached device: the wear-leveling state, the consolidation state, and the work queue
/// that drives both
pub struct UbiDevice {
    pub(crate) config: WlConfig,
    pub(crate) geometry: Geometry,
    pub(crate) io: Arc<dyn FlashIo>,
    pub(crate) eba: Arc<dyn Eba>,

    pub(crate) wl: Mutex<WlState>,

    /// Held for the whole duration of a move
    pub(crate) move_mutex: Mutex<()>,

    pub(crate) work: WorkQueue,
    pub(crate) conso: ConsoState,

    picker: Box<dyn PebPicker>,
    ro: AtomicBool,
    sqnum: AtomicU64,
}

/// Owning handle of an attached device
///
/// Dereferences to [UbiDevice]. Dropping it (or calling [Ubi::close]) stops the background
/// worker; jobs still queued are cancelled.
pub struct Ubi {
    dev: Arc<UbiDevice>,
    thread: Option<JoinHandle<()>>,
}

impl Deref for Ubi {
    type Target = UbiDevice;

    fn deref(&self) -> &UbiDevice {
        &self.dev
    }
}

impl Drop for Ubi {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Ubi {
    /// Bring up wear-leveling on a scanned device
    pub fn attach(
        io: Arc<dyn FlashIo>,
        eba: Arc<dyn Eba>,
        config: WlConfig,
        ai: &AttachInfo,
    ) -> Result<Ubi> {
        config.validate()?;

        let geometry = io.geometry();
        let n = config.lebs_per_cpeb;
        if n > geometry.max_slots() {
            return Err(Error::Invalid(format!(
                "{n} LEBs per PEB, but only {} VID headers fit",
                geometry.max_slots()
            )));
        }
        if geometry.leb_size(n) == 0 {
            return Err(Error::Invalid(format!("PEBs too small to hold {n} LEBs")));
        }

        let mut reg = Registry::new(geometry.peb_count, config.prot_queue_len);
        for &(pnum, ec) in &ai.free {
            reg.insert(pnum, ec, Owner::Free)?;
        }
        for used in &ai.used {
            let owner = if used.scrub { Owner::Scrub } else { Owner::Used };
            reg.insert(used.pnum, used.ec, owner)?;
        }
        for &(pnum, ec) in &ai.erase {
            reg.insert(pnum, ec, Owner::Erasing)?;
        }

        let cap = Self::budget(&config, ai)?;
        info!(
            good = cap.good_peb_count,
            bad = cap.bad_peb_count,
            avail = cap.avail_pebs,
            reserved = cap.rsvd_pebs,
            "attaching"
        );

        let mut descriptors = ai.consolidated.clone();
        for (&pnum, lebs) in descriptors.iter_mut() {
            if lebs.len() > n {
                return Err(Error::Invalid(format!(
                    "PEB {pnum} holds {} LEBs, configured for {n}",
                    lebs.len()
                )));
            }
            lebs.resize(n, None);
        }

        let picker: Box<dyn PebPicker> = if config.anchor_reservation {
            Box::new(AnchorPicker::new(config.anchor_max_start))
        } else {
            Box::new(PlainPicker)
        };

        let dev = Arc::new(UbiDevice {
            geometry,
            io,
            eba,
            wl: Mutex::new(WlState {
                reg,
                move_to_put: false,
                wl_scheduled: false,
                max_ec: ai.max_ec,
                cap,
            }),
            move_mutex: Mutex::new(()),
            work: WorkQueue::new(config.max_work_failures),
            conso: ConsoState::new(descriptors),
            picker,
            ro: AtomicBool::new(false),
            sqnum: AtomicU64::new(ai.max_sqnum + 1),
            config,
        });

        // Closed LEBs: every LEB alone in its PEB, and the survivors of partly invalidated
        // consolidated PEBs
        if n > 1 {
            for (&leb, location) in &ai.lebs {
                match dev.descriptor(location.pnum) {
                    None => dev.add_full_leb(leb),
                    Some(lebs) if lebs.iter().flatten().count() < n => dev.add_full_leb(leb),
                    Some(_) => {}
                }
            }
        }

        let thread = if dev.config.background {
            let worker = dev.clone();
            let thread = std::thread::Builder::new()
                .name("ubi_bgt".into())
                .spawn(move || worker.work.run(&*worker))
                .map_err(|err| Error::Invalid(format!("cannot start worker: {err}")))?;
            Some(thread)
        } else {
            None
        };
        let ubi = Ubi { dev, thread };

        for &(pnum, _) in &ai.erase {
            ubi.schedule_erase(pnum, false);
        }
        ubi.ensure_wear_leveling();
        if ubi.consolidation_needed() {
            ubi.schedule_consolidation();
        }

        if ubi.config.self_checks {
            ubi.self_check()?;
        }

        Ok(ubi)
    }

    /// Work out the PEB budget of a freshly scanned device
    fn budget(config: &WlConfig, ai: &AttachInfo) -> Result<Capacity> {
        let good_peb_count = ai.peb_count - ai.bad_peb_count;
        let beb_rsvd_pebs = config
            .beb_reserve_for(ai.peb_count)
            .saturating_sub(ai.bad_peb_count);
        let conso_rsvd = if config.lebs_per_cpeb > 1 {
            config.conso_reserved_pebs
        } else {
            0
        };
        let rsvd_pebs = beb_rsvd_pebs + config.wl_reserved_pebs + conso_rsvd;

        if good_peb_count < rsvd_pebs {
            error!(good_peb_count, rsvd_pebs, "not enough good PEBs");
            return Err(Error::NoSpace);
        }
        if config.bad_allowed && beb_rsvd_pebs == 0 {
            warn!(bad = ai.bad_peb_count, "no PEBs left for bad block handling");
        }

        let avail_pebs = good_peb_count - rsvd_pebs;
        Ok(Capacity {
            good_peb_count,
            bad_peb_count: ai.bad_peb_count,
            avail_pebs,
            rsvd_pebs,
            beb_rsvd_pebs,
            conso_threshold: std::cmp::max(
                (avail_pebs + rsvd_pebs) / 3,
                config.lebs_per_cpeb as u32,
            ),
        })
    }

    /// Stop the worker and detach
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.dev.work.shutdown(&*self.dev, Error::Interrupted);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("background worker panicked");
            }
        }
    }
}

impl UbiDevice {
    pub fn config(&self) -> &WlConfig {
        &self.config
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Size of one LEB, given how many share a PEB
    pub fn leb_size(&self) -> usize {
        self.geometry.leb_size(self.config.lebs_per_cpeb)
    }

    pub fn is_read_only(&self) -> bool {
        self.ro.load(Ordering::Acquire)
    }

    /// Stop all writes to the device; there is no way back
    pub fn set_read_only(&self) {
        if !self.ro.swap(true, Ordering::AcqRel) {
            warn!("switching to read-only mode");
        }
    }

    pub(crate) fn inline(&self) -> bool {
        !self.config.background
    }

    /// A sequence number greater than any other one written so far
    pub fn next_sqnum(&self) -> u64 {
        self.sqnum.fetch_add(1, Ordering::SeqCst)
    }

    /// Tell the PEB picker that a checkpoint is on flash, releasing any PEBs it held back
    pub fn mark_checkpoint_written(&self) {
        self.picker.checkpoint_written();
    }

    pub fn free_count(&self) -> u32 {
        self.wl.lock().reg.free_count
    }

    pub fn capacity(&self) -> Capacity {
        self.wl.lock().cap
    }

    /// The highest erase counter on the device
    pub fn max_ec(&self) -> u64 {
        self.wl.lock().max_ec
    }

    /// Which container holds a PEB; `None` if it is not tracked
    pub fn owner(&self, pnum: Pnum) -> Option<Owner> {
        self.wl.lock().reg.owner(pnum)
    }

    pub(crate) fn wl_pending(&self) -> bool {
        self.wl.lock().wl_scheduled
    }

    /// Hand out a free PEB
    ///
    /// At least `min_free` PEBs must remain free afterwards. When none is available and
    /// `producing` is false, queued jobs are waited for (they may free PEBs) until one is, or
    /// nothing is left to wait for. Producers, i.e. the engine's own jobs, fail immediately.
    ///
    /// Consolidation is asked for again only while it keeps making progress: once a round has run
    /// without writing anything, its candidates are held elsewhere and waiting will not help.
    pub fn allocate_peb(&self, producing: bool, min_free: u32) -> Result<Pnum> {
        let mut conso_seen: Option<u64> = None;
        loop {
            if self.is_read_only() {
                return Err(Error::ReadOnly);
            }

            {
                let mut wl = self.wl.lock();
                if wl.reg.free_count > min_free {
                    let (ec, pnum) = self
                        .picker
                        .find_mean(&wl.reg.free, self.config.free_max_diff())
                        .ok_or(Error::NoSpace)?;
                    wl.reg.protect(pnum);
                    drop(wl);

                    debug!(pnum, ec, "PEB allocated");
                    if self.config.self_checks {
                        let offset = self.geometry.vid_hdr_offset;
                        self.io
                            .check_all_erased(pnum, offset, self.geometry.peb_size - offset)
                            .inspect_err(|err| error!(pnum, %err, "allocated PEB is not erased"))?;
                    }
                    return Ok(pnum);
                }
            }

            if producing {
                return Err(Error::NoSpace);
            }

            if self.consolidation_needed() {
                let (rounds, progress) = self.conso_rounds();
                let stalled = conso_seen.is_some_and(|seen| rounds > seen && !progress);
                if !stalled {
                    conso_seen = Some(rounds);
                    self.schedule_consolidation();
                }
            }
            if self.work.join_one(self, self.inline()).is_none() {
                warn!(min_free, "no free PEBs and nothing left to wait for");
                return Err(Error::NoSpace);
            }
        }
    }

    /// Give a PEB back, to be erased
    ///
    /// A PEB erroneous from earlier read errors is always tortured.
    pub fn release_peb(&self, pnum: Pnum, torture: bool) -> Result<()> {
        if self.is_consolidated(pnum) {
            error!(pnum, "PEB still holds consolidated LEBs");
            return Err(Error::StillReferenced(pnum));
        }

        let mut waited = false;
        loop {
            let mut wl = self.wl.lock();
            let owner = wl.reg.owner(pnum);
            match owner {
                Some(Owner::MoveFrom) => {
                    // Wait for the move to settle one way or another, then look again
                    debug!(pnum, "PEB is being moved, waiting");
                    drop(wl);
                    drop(self.move_mutex.lock());
                    waited = true;
                }
                Some(Owner::MoveTo) => {
                    debug!(pnum, "PEB is the move target, deferring release");
                    wl.move_to_put = true;
                    return Ok(());
                }
                Some(owner @ (Owner::Used | Owner::Scrub | Owner::Protected(_) | Owner::Erroneous)) => {
                    let torture = torture || owner == Owner::Erroneous;
                    wl.reg.move_to(pnum, Owner::Erasing);
                    drop(wl);
                    debug!(pnum, torture, "PEB released");
                    self.schedule_erase(pnum, torture);
                    return Ok(());
                }
                Some(Owner::Free | Owner::Erasing) | None if waited => {
                    debug!(pnum, "PEB recycled by the mover meanwhile");
                    return Ok(());
                }
                Some(Owner::Free | Owner::Erasing) | None => {
                    drop(wl);
                    error!(pnum, ?owner, "release of a PEB that is not in use");
                    self.set_read_only();
                    return Err(Error::NotFound(pnum));
                }
            }
        }
    }

    /// Have a PEB's contents moved elsewhere, because it showed bit-flips
    pub fn request_scrub(&self, pnum: Pnum) -> Result<()> {
        loop {
            let mut wl = self.wl.lock();
            match wl.reg.owner(pnum) {
                Some(Owner::Scrub | Owner::Erroneous | Owner::MoveFrom) => return Ok(()),
                Some(Owner::MoveTo) => {
                    // Freshly written by the mover; once it settles it is an ordinary used PEB
                    drop(wl);
                    std::thread::yield_now();
                }
                Some(Owner::Used | Owner::Protected(_)) => {
                    debug!(pnum, "schedule scrubbing");
                    wl.reg.move_to(pnum, Owner::Scrub);
                    break;
                }
                Some(Owner::Free | Owner::Erasing) | None => {
                    warn!(pnum, "scrub requested for a PEB that is not in use");
                    return Err(Error::NotFound(pnum));
                }
            }
        }

        self.ensure_wear_leveling();
        Ok(())
    }

    /// Look for bit-flips in a PEB, and scrub it if there are any
    ///
    /// With `force`, the PEB is treated as bit-flipping without reading it. The worker is kept
    /// from running meanwhile.
    pub fn bitflip_check(&self, pnum: Pnum, force: bool) -> Result<BitflipStatus> {
        if pnum >= self.geometry.peb_count {
            return Err(Error::OutOfRange(pnum));
        }

        let _suspended = self.work.suspend();

        match self.owner(pnum) {
            None => return Ok(BitflipStatus::NotFound),
            Some(Owner::Used | Owner::Protected(_) | Owner::Free) => {}
            Some(_) => return Ok(BitflipStatus::Busy),
        }

        if !force {
            match self.io.read_payload(pnum, 0, self.geometry.peb_size) {
                Ok((_, ReadStatus::Bitflips)) => {}
                Ok((_, ReadStatus::Clean)) => return Ok(BitflipStatus::Clean),
                Err(err) => {
                    debug!(pnum, %err, "bit-flip check read failed");
                    return Ok(BitflipStatus::Clean);
                }
            }
        }

        let mut wl = self.wl.lock();
        match wl.reg.owner(pnum) {
            Some(Owner::Used | Owner::Protected(_)) => {
                wl.reg.move_to(pnum, Owner::Scrub);
                drop(wl);
                info!(pnum, "bit-flips found, scrubbing");
                self.ensure_wear_leveling();
                Ok(BitflipStatus::ScrubScheduled)
            }
            Some(Owner::Free) => {
                wl.reg.move_to(pnum, Owner::Erasing);
                drop(wl);
                info!(pnum, "bit-flips found in free PEB, erasing");
                self.schedule_erase(pnum, !force);
                Ok(BitflipStatus::ScrubScheduled)
            }
            None => Ok(BitflipStatus::NotFound),
            Some(_) => Ok(BitflipStatus::Busy),
        }
    }

    /// Erase and read counters of one PEB, or of every tracked PEB
    pub fn report_block_stats(&self, pnum: Option<Pnum>) -> Result<Vec<BlockStats>> {
        let wl = self.wl.lock();
        let stats = |e: &WlEntry| BlockStats {
            pnum: e.pnum,
            ec: e.ec,
            read_count: e.read_count,
        };

        match pnum {
            Some(pnum) if pnum >= self.geometry.peb_count => Err(Error::OutOfRange(pnum)),
            Some(pnum) => {
                let entry = wl.reg.get(pnum).ok_or(Error::NotFound(pnum))?;
                Ok(vec![stats(entry)])
            }
            None => Ok(wl.reg.iter().map(stats).collect()),
        }
    }

    pub fn update_read_count(&self, pnum: Pnum) -> Result<()> {
        let mut wl = self.wl.lock();
        let entry = wl.reg.get_mut(pnum).ok_or(Error::NotFound(pnum))?;
        entry.read_count += 1;
        Ok(())
    }

    /// Wait for every job queued so far
    pub fn flush(&self) -> Result<()> {
        self.work.flush(self, self.inline())
    }

    /// Run queued jobs on this thread until the queue is empty
    pub fn run_pending(&self) {
        while self.work.do_work(self).is_some() {}
    }

    /// Queue a wear-leveling job if one is needed and none is queued
    pub(crate) fn ensure_wear_leveling(&self) {
        {
            let mut wl = self.wl.lock();
            if wl.wl_scheduled {
                return;
            }

            if wl.reg.scrub.is_empty() {
                let (Some(&(min_ec, _)), Some((ec, _))) =
                    (wl.reg.used.first(), self.get_peb_for_wl(&wl.reg))
                else {
                    return;
                };
                if ec.saturating_sub(min_ec) < self.config.wl_threshold {
                    return;
                }
                debug!(min_ec, ec, "schedule wear-leveling");
            } else {
                debug!("schedule scrubbing");
            }

            wl.wl_scheduled = true;
        }

        self.work.schedule(self, WorkKind::WearLevel);
    }

    /// The free PEB a move would copy to; it stays in the free pool
    pub(crate) fn get_peb_for_wl(&self, reg: &Registry) -> Option<(u64, Pnum)> {
        if reg.free_count <= self.conso_reserve() {
            return None;
        }
        self.picker
            .find_wl_entry(&reg.free, self.config.free_max_diff())
    }

    /// Check the registry, the budget and the consolidation descriptors for consistency
    pub fn self_check(&self) -> Result<()> {
        let fail = |what: String| Err(Error::Invalid(format!("self-check failed: {what}")));

        let tracked = {
            let wl = self.wl.lock();
            wl.reg.check()?;

            let tracked: Vec<Pnum> = wl.reg.iter().map(|e| e.pnum).collect();
            let good = wl.cap.good_peb_count as usize;
            if !self.is_read_only() && tracked.len() != good {
                return fail(format!("{} PEBs tracked, {good} good", tracked.len()));
            }
            tracked
        };

        for pnum in tracked {
            if let Some(lebs) = self.descriptor(pnum) {
                if lebs.len() != self.config.lebs_per_cpeb {
                    return fail(format!("PEB {pnum} has {} slots", lebs.len()));
                }
            }
        }

        Ok(())
    }
}

impl Worker for UbiDevice {
    fn execute(&self, kind: &WorkKind, cancel: bool) -> Result<()> {
        match *kind {
            WorkKind::Erase { pnum, torture } => self.erase_worker(pnum, torture, cancel),
            WorkKind::WearLevel => self.wl_worker(cancel),
            WorkKind::Consolidate => self.conso_worker(cancel),
        }
    }

    fn is_read_only(&self) -> bool {
        UbiDevice::is_read_only(self)
    }

    fn set_read_only(&self) {
        UbiDevice::set_read_only(self)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::eba::{LebId, MemEba};
    use crate::nand::{NandLayout, SimFault, SimNand};
    use crate::ubi::NandIo;
    use proptest::prelude::*;

    /// A simulated device with one formatted PEB per given erase counter
    pub(crate) fn sim_io(ecs: &[u64]) -> Arc<NandIo<SimNand>> {
        let layout = NandLayout {
            blocks: ecs.len() as u32,
            pages_per_block: 16,
            bytes_per_page: 256,
        };
        let io = NandIo::new(SimNand::new(layout));
        for (pnum, &ec) in ecs.iter().enumerate() {
            io.write_ec(pnum as Pnum, ec).unwrap();
        }
        Arc::new(io)
    }

    /// Scan and attach, with jobs run inline and self-checks on
    pub(crate) fn attach_sim(
        io: &Arc<NandIo<SimNand>>,
        config: WlConfig,
    ) -> anyhow::Result<(Ubi, Arc<MemEba>)> {
        let ai = AttachInfo::from_ebt(&io.scan()?);
        let eba = Arc::new(MemEba::from_attach(&ai));
        let config = config.background(false).self_checks(true);
        let ubi = Ubi::attach(io.clone(), eba.clone(), config, &ai)?;
        Ok((ubi, eba))
    }

    #[test]
    fn test_attach_budget() -> anyhow::Result<()> {
        let io = sim_io(&[3, 3, 3, 9, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3]);
        io.erase_block(5, false)?;
        let (ubi, _eba) = attach_sim(&io, WlConfig::default())?;

        assert_eq!(
            ubi.capacity(),
            Capacity {
                good_peb_count: 16,
                bad_peb_count: 0,
                avail_pebs: 14,
                rsvd_pebs: 2,
                beb_rsvd_pebs: 1,
                conso_threshold: 5,
            }
        );
        assert_eq!(ubi.max_ec(), 9);

        // The blank PEB waits for its erase, then joins the pool with the mean EC
        assert_eq!(ubi.owner(5), Some(Owner::Erasing));
        assert_eq!(ubi.free_count(), 15);
        ubi.run_pending();
        assert_eq!(ubi.owner(5), Some(Owner::Free));
        assert_eq!(ubi.report_block_stats(Some(5))?[0].ec, 3 + 1);

        Ok(())
    }

    #[test]
    fn test_attach_rejects_bad_config() {
        let io = sim_io(&[0; 4]);
        assert!(attach_sim(&io, WlConfig::default().lebs_per_cpeb(5)).is_err());
        assert!(attach_sim(&io, WlConfig::default().prot_queue_len(0)).is_err());

        // Two PEBs cannot cover the reserves
        let io = sim_io(&[0; 2]);
        assert!(attach_sim(&io, WlConfig::default().lebs_per_cpeb(2)).is_err());
    }

    #[test]
    fn test_allocate_until_empty() -> anyhow::Result<()> {
        let io = sim_io(&[0; 4]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default())?;

        assert_eq!(ubi.free_count(), 4);
        assert!(matches!(ubi.allocate_peb(false, 4), Err(Error::NoSpace)));
        let mut taken: Vec<Pnum> = (0..4)
            .map(|_| ubi.allocate_peb(false, 0))
            .collect::<Result<_>>()?;
        assert!(matches!(ubi.allocate_peb(false, 0), Err(Error::NoSpace)));
        assert!(matches!(ubi.allocate_peb(true, 0), Err(Error::NoSpace)));

        // A pending erase is waited for
        let pnum = taken.pop().unwrap();
        ubi.release_peb(pnum, false)?;
        assert_eq!(ubi.allocate_peb(false, 0)?, pnum);
        ubi.self_check()?;

        taken.sort();
        taken.dedup();
        assert_eq!(taken.len(), 3);

        Ok(())
    }

    #[test]
    fn test_allocate_picks_median() -> anyhow::Result<()> {
        let io = sim_io(&[5, 1, 9, 3, 7]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default())?;
        assert_eq!(ubi.allocate_peb(false, 0)?, 0);

        let io = sim_io(&[10, 11, 13, 50, 90]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default().wl_threshold(4))?;
        assert_eq!(ubi.allocate_peb(false, 0)?, 2);

        Ok(())
    }

    #[test]
    fn test_allocate_checks_erased() -> anyhow::Result<()> {
        let io = sim_io(&[0; 1]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default().wl_reserved_pebs(0))?;

        io.write_payload(0, io.geometry().leb_start, b"stale")?;
        assert!(matches!(
            ubi.allocate_peb(false, 0),
            Err(Error::NotErased(0))
        ));

        Ok(())
    }

    #[test]
    fn test_recycled_peb_is_erased() -> anyhow::Result<()> {
        let io = sim_io(&[0; 1]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default().wl_reserved_pebs(0))?;
        let geometry = io.geometry();
        let past_ec = geometry.peb_size - geometry.vid_hdr_offset;

        let pnum = ubi.allocate_peb(false, 0)?;
        let vid = crate::ubi::Vid {
            vol_id: 1,
            sqnum: ubi.next_sqnum(),
            ..Default::default()
        };
        io.write_peb(pnum, &[Some(vid)], &vec![0x3C; geometry.page_size * 2])?;
        assert!(io.check_all_erased(pnum, geometry.vid_hdr_offset, past_ec).is_err());

        ubi.release_peb(pnum, false)?;
        ubi.run_pending();
        assert_eq!(ubi.owner(pnum), Some(Owner::Free));

        // Handed out again with only the new EC header left on it
        assert_eq!(ubi.allocate_peb(false, 0)?, pnum);
        io.check_all_erased(pnum, geometry.vid_hdr_offset, past_ec)?;
        assert_eq!(io.read_ec(pnum)?.map(|ec| ec.ec), Some(1));

        Ok(())
    }

    #[test]
    fn test_release_errors() -> anyhow::Result<()> {
        let io = sim_io(&[0; 4]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default().lebs_per_cpeb(2))?;

        let pnum = ubi.allocate_peb(false, 0)?;
        ubi.conso
            .descriptors
            .lock()
            .insert(pnum, vec![Some(LebId::new(0, 0)), None]);
        assert!(matches!(
            ubi.release_peb(pnum, false),
            Err(Error::StillReferenced(_))
        ));
        assert!(!ubi.is_read_only());

        // Releasing a free PEB is a bug in the caller
        let free = (0..4).find(|&p| ubi.owner(p) == Some(Owner::Free)).unwrap();
        assert!(matches!(ubi.release_peb(free, false), Err(Error::NotFound(_))));
        assert!(ubi.is_read_only());

        Ok(())
    }

    #[test]
    fn test_bitflip_check() -> anyhow::Result<()> {
        let io = sim_io(&[4; 8]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default())?;

        assert!(matches!(ubi.bitflip_check(8, false), Err(Error::OutOfRange(8))));

        let used = ubi.allocate_peb(false, 0)?;
        assert_eq!(ubi.bitflip_check(used, false)?, BitflipStatus::Clean);

        io.nand().inject(used, SimFault::Bitflips);
        assert_eq!(ubi.bitflip_check(used, false)?, BitflipStatus::ScrubScheduled);
        assert_eq!(ubi.owner(used), Some(Owner::Scrub));
        assert_eq!(ubi.bitflip_check(used, false)?, BitflipStatus::Busy);

        // A free PEB is simply erased
        let free = (0..8).find(|&p| ubi.owner(p) == Some(Owner::Free)).unwrap();
        assert_eq!(ubi.bitflip_check(free, true)?, BitflipStatus::ScrubScheduled);
        assert_eq!(ubi.owner(free), Some(Owner::Erasing));
        ubi.run_pending();
        assert_eq!(ubi.owner(free), Some(Owner::Free));
        assert_eq!(ubi.report_block_stats(Some(free))?[0].ec, 5);

        Ok(())
    }

    #[test]
    fn test_block_stats() -> anyhow::Result<()> {
        let io = sim_io(&[1, 2, 3]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default())?;

        ubi.update_read_count(1)?;
        ubi.update_read_count(1)?;
        assert!(ubi.update_read_count(7).is_err());

        let stats = ubi.report_block_stats(None)?;
        assert_eq!(stats.len(), 3);
        assert_eq!(
            stats[1],
            BlockStats {
                pnum: 1,
                ec: 2,
                read_count: 2
            }
        );
        assert!(matches!(
            ubi.report_block_stats(Some(3)),
            Err(Error::OutOfRange(3))
        ));

        Ok(())
    }

    #[test]
    fn test_anchor_reservation() -> anyhow::Result<()> {
        let io = sim_io(&[0; 3]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default().anchor_reservation(2))?;

        // PEB 1 is the median, but may hold an anchor
        assert_eq!(ubi.allocate_peb(false, 0)?, 2);
        ubi.mark_checkpoint_written();
        assert_eq!(ubi.allocate_peb(false, 0)?, 1);

        Ok(())
    }

    #[test]
    fn test_close_cancels_erases() -> anyhow::Result<()> {
        let io = sim_io(&[0; 4]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default())?;

        let pnum = ubi.allocate_peb(false, 0)?;
        ubi.release_peb(pnum, false)?;
        assert_eq!(ubi.work.pending(), 1);
        ubi.close();

        assert_eq!(io.nand().erase_count(pnum), 0);

        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_entries_conserved(ops in proptest::collection::vec((0u8..4, 0usize..16), 1..64)) {
            let io = sim_io(&[0; 16]);
            let config = WlConfig::default().wl_threshold(2).prot_queue_len(2);
            let (ubi, _eba) = attach_sim(&io, config).unwrap();
            let mut held: Vec<Pnum> = vec![];

            for (op, idx) in ops {
                match op {
                    0 => {
                        if let Ok(pnum) = ubi.allocate_peb(false, 0) {
                            prop_assert!(!held.contains(&pnum));
                            held.push(pnum);
                        }
                    }
                    1 if !held.is_empty() => {
                        let pnum = held.remove(idx % held.len());
                        prop_assert!(ubi.release_peb(pnum, false).is_ok());
                    }
                    2 if !held.is_empty() => {
                        prop_assert!(ubi.request_scrub(held[idx % held.len()]).is_ok());
                    }
                    _ => ubi.run_pending(),
                }
                prop_assert!(ubi.self_check().is_ok());
                prop_assert!(!ubi.is_read_only());
            }

            ubi.run_pending();
            let stats = ubi.report_block_stats(None).unwrap();
            prop_assert_eq!(stats.len(), 16);
            prop_assert_eq!(ubi.free_count() as usize, 16 - held.len());
        }
    }
}
