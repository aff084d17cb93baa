//! Consolidation: packing several "full" LEBs, each alone in its own PEB, into one PEB
//!
//! A consolidated PEB has one VID header per slot and a descriptor (kept here) saying which LEB
//! lives in which slot. When a LEB of a consolidated PEB is invalidated, its slot is cleared;
//! once every slot is clear the PEB can be erased.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use retry::{delay::NoDelay, retry, OperationResult};
use tracing::{debug, error, info, warn};

use crate::eba::{LebId, LebLocation, TryLock};
use crate::ubi::{Vid, VidRead};
use crate::wl::UbiDevice;
use crate::work::WorkKind;
use crate::{Error, Pnum, Result};

/// Slot contents of a consolidated PEB; `None` marks an invalidated slot
pub type Descriptor = Vec<Option<LebId>>;

#[derive(Debug, Default)]
struct FullList {
    lebs: VecDeque<LebId>,

    /// A consolidation job is queued
    scheduled: bool,

    /// Consolidation jobs run so far, and whether the last one wrote a PEB
    rounds: u64,
    progress: bool,
}

/// Bookkeeping for consolidation
///
/// Lock order: `descriptors` before `full`.
#[derive(Debug, Default)]
pub(crate) struct ConsoState {
    full: Mutex<FullList>,
    pub(crate) descriptors: Mutex<BTreeMap<Pnum, Descriptor>>,
}

impl ConsoState {
    pub(crate) fn new(descriptors: BTreeMap<Pnum, Descriptor>) -> Self {
        Self {
            full: Default::default(),
            descriptors: Mutex::new(descriptors),
        }
    }
}

/// A LEB picked for consolidation, write-locked, and where it lived at the time
#[derive(Debug, Copy, Clone)]
struct Candidate {
    leb: LebId,
    from: LebLocation,
}

impl UbiDevice {
    /// Record that a LEB will not be written to anymore, making it a consolidation candidate
    pub fn add_full_leb(&self, leb: LebId) {
        if self.config.lebs_per_cpeb < 2 {
            return;
        }
        let mut full = self.conso.full.lock();
        if !full.lebs.contains(&leb) {
            full.lebs.push_back(leb);
        }
    }

    pub fn remove_full_leb(&self, leb: LebId) {
        self.conso.full.lock().lebs.retain(|&l| l != leb);
    }

    pub fn full_count(&self) -> usize {
        self.conso.full.lock().lebs.len()
    }

    pub fn is_consolidated(&self, pnum: Pnum) -> bool {
        self.conso.descriptors.lock().contains_key(&pnum)
    }

    /// The slot contents of a consolidated PEB
    pub fn descriptor(&self, pnum: Pnum) -> Option<Descriptor> {
        self.conso.descriptors.lock().get(&pnum).cloned()
    }

    pub(crate) fn move_descriptor(&self, from: Pnum, to: Pnum) {
        let mut descriptors = self.conso.descriptors.lock();
        if let Some(lebs) = descriptors.remove(&from) {
            descriptors.insert(to, lebs);
        }
    }

    /// Forget that `leb` lives in `pnum`
    ///
    /// Returns `true` once nothing lives in `pnum` anymore, i.e. it may be released. When a fully
    /// populated consolidated PEB loses its first LEB, the others become candidates again.
    pub fn invalidate_leb(&self, pnum: Pnum, leb: LebId) -> bool {
        let mut descriptors = self.conso.descriptors.lock();
        let released = self.invalidate_locked(&mut descriptors, pnum, leb);
        self.conso.full.lock().lebs.retain(|&l| l != leb);
        released
    }

    fn invalidate_locked(
        &self,
        descriptors: &mut BTreeMap<Pnum, Descriptor>,
        pnum: Pnum,
        leb: LebId,
    ) -> bool {
        let Some(lebs) = descriptors.get_mut(&pnum) else {
            return true;
        };

        let mut pos = None;
        for (slot, entry) in lebs.iter_mut().enumerate() {
            if *entry == Some(leb) {
                *entry = None;
                pos = Some(slot);
            }
        }
        let remaining: Vec<LebId> = lebs.iter().flatten().copied().collect();

        if pos.is_none() {
            warn!(%leb, pnum, "LEB not found in consolidated PEB");
        }

        if remaining.is_empty() {
            debug!(pnum, "consolidated PEB fully invalidated");
            descriptors.remove(&pnum);
            return true;
        }

        if pos.is_some() && remaining.len() == self.config.lebs_per_cpeb - 1 {
            let mut full = self.conso.full.lock();
            for leb in remaining {
                if !full.lebs.contains(&leb) {
                    full.lebs.push_back(leb);
                }
            }
        }

        false
    }

    /// Free PEBs the EBA layer should leave alone for consolidation
    pub(crate) fn conso_reserve(&self) -> u32 {
        if self.config.lebs_per_cpeb > 1 {
            self.config.conso_reserved_pebs
        } else {
            0
        }
    }

    pub fn consolidation_needed(&self) -> bool {
        let n = self.config.lebs_per_cpeb;
        if n < 2 || self.full_count() < n {
            return false;
        }

        let wl = self.wl.lock();
        let free = wl.reg.free_count;
        if free < self.config.conso_reserved_pebs {
            return false;
        }
        self.config.force_consolidation
            || free.saturating_sub(wl.cap.beb_rsvd_pebs) <= wl.cap.conso_threshold
    }

    /// Queue a consolidation job, unless one is queued already
    pub(crate) fn schedule_consolidation(&self) {
        {
            let mut full = self.conso.full.lock();
            if full.scheduled {
                return;
            }
            full.scheduled = true;
        }
        debug!("schedule consolidation");
        self.work.schedule(self, WorkKind::Consolidate);
    }

    /// How many consolidation jobs have run, and whether the last one made progress
    pub(crate) fn conso_rounds(&self) -> (u64, bool) {
        let full = self.conso.full.lock();
        (full.rounds, full.progress)
    }

    /// Run one round of consolidation and wait for it
    pub fn consolidate_sync(&self) -> Result<()> {
        self.work
            .schedule_sync(self, WorkKind::Consolidate, self.inline())
    }

    /// Body of a consolidation job
    pub(crate) fn conso_worker(&self, cancel: bool) -> Result<()> {
        if cancel {
            self.conso.full.lock().scheduled = false;
            return Ok(());
        }

        let result = self.consolidate_lebs();
        {
            let mut full = self.conso.full.lock();
            full.scheduled = false;
            full.rounds += 1;
            full.progress = matches!(result, Ok(true));
        }

        let progress = result?;
        if progress && self.consolidation_needed() {
            self.schedule_consolidation();
        }
        Ok(())
    }

    /// Consolidate one batch of LEBs; returns whether a consolidated PEB was written
    fn consolidate_lebs(&self) -> Result<bool> {
        if !self.consolidation_needed() {
            return Ok(false);
        }

        let Some(candidates) = self.find_consolidable_lebs() else {
            debug!("not enough consolidation candidates");
            return Ok(false);
        };

        let written = self.write_consolidated(&candidates);
        if let Err(err) = &written {
            warn!(%err, "consolidation failed");
            let mut full = self.conso.full.lock();
            for c in &candidates {
                full.lebs.push_back(c.leb);
            }
        }

        let released = written.and_then(|target| self.commit_consolidated(target, &candidates));
        for c in &candidates {
            self.eba.leb_write_unlock(c.leb);
        }

        for pnum in released? {
            self.release_peb(pnum, false)?;
        }
        Ok(true)
    }

    /// Take `lebs_per_cpeb` LEBs off the full list and write-lock them
    ///
    /// Busy LEBs go to the back of the list and are retried, at most once around the list;
    /// LEBs that were unmapped meanwhile are dropped. Returns `None`, with nothing locked, if not
    /// enough candidates could be had.
    fn find_consolidable_lebs(&self) -> Option<Vec<Candidate>> {
        let n = self.config.lebs_per_cpeb;
        let mut found: Vec<Candidate> = Vec::with_capacity(n);

        let budget = self.full_count();
        let mut tries = NoDelay.take(budget);

        while found.len() < n {
            let picked = retry(&mut tries, || {
                let mut full = self.conso.full.lock();
                let Some(&leb) = full.lebs.front() else {
                    return OperationResult::Err(Error::TryAgain);
                };
                match self.eba.leb_write_trylock(leb) {
                    TryLock::Acquired => {
                        full.lebs.pop_front();
                        match self.eba.leb_location(leb) {
                            Some(from) => OperationResult::Ok(Candidate { leb, from }),
                            None => {
                                self.eba.leb_write_unlock(leb);
                                OperationResult::Retry(Error::TryAgain)
                            }
                        }
                    }
                    TryLock::Busy => {
                        full.lebs.rotate_left(1);
                        OperationResult::Retry(Error::Busy)
                    }
                    TryLock::Unmapped => {
                        full.lebs.pop_front();
                        OperationResult::Retry(Error::TryAgain)
                    }
                }
            })
            .map_err(|e| e.error);

            match picked {
                Ok(candidate) => found.push(candidate),
                Err(err) => {
                    debug!(%err, found = found.len(), "giving up on candidates");
                    let mut full = self.conso.full.lock();
                    for c in found.iter().rev() {
                        self.eba.leb_write_unlock(c.leb);
                        full.lebs.push_front(c.leb);
                    }
                    return None;
                }
            }
        }

        Some(found)
    }

    /// Write the candidates into a fresh PEB, returning it
    ///
    /// On failure the target is released and nothing refers to it.
    fn write_consolidated(&self, candidates: &[Candidate]) -> Result<Pnum> {
        let target = self.allocate_peb(true, 0)?;
        debug!(target, count = candidates.len(), "consolidating LEBs");

        let written = self
            .gather(candidates, self.leb_size())
            .and_then(|(hdrs, payload)| self.io.write_peb(target, &hdrs, &payload));
        if let Err(err) = written {
            self.release_peb(target, err.is_hard_io())?;
            return Err(err);
        }
        Ok(target)
    }

    /// Point the candidates at their slots in `target`
    ///
    /// Returns the old PEBs that no longer hold anything and must be released. A refused remap
    /// leaves the flash and the LEB table out of step: the device goes read-only and nothing is
    /// handed back to the full list.
    fn commit_consolidated(&self, target: Pnum, candidates: &[Candidate]) -> Result<Vec<Pnum>> {
        let lebs: Descriptor = candidates.iter().map(|c| Some(c.leb)).collect();
        self.conso.descriptors.lock().insert(target, lebs);

        let mut released = vec![];
        for (slot, c) in candidates.iter().enumerate() {
            if let Err(err) = self.eba.remap_leb(c.leb, LebLocation::new(target, slot)) {
                error!(%err, leb = %c.leb, target, "remap after consolidation failed");
                self.set_read_only();
                return Err(err);
            }
            if self.invalidate_leb(c.from.pnum, c.leb) && !released.contains(&c.from.pnum) {
                released.push(c.from.pnum);
            }
        }

        info!(target, lebs = candidates.len(), "consolidated PEB written");
        Ok(released)
    }

    /// Read every candidate's payload and build the new headers
    fn gather(&self, candidates: &[Candidate], leb_size: usize) -> Result<(Vec<Option<Vid>>, Vec<u8>)> {
        let mut hdrs = Vec::with_capacity(candidates.len());
        let mut payload = vec![0xFF; leb_size * candidates.len()];

        for (c, chunk) in candidates.iter().zip(payload.chunks_exact_mut(leb_size)) {
            let LebLocation { pnum, slot } = c.from;

            let vid = match self.io.read_vid_hdrs(pnum)? {
                VidRead::Headers { slots, .. } => slots.get(slot).copied().flatten(),
                VidRead::Empty { .. } => None,
            };
            let Some(vid) = vid else {
                return Err(Error::CorruptHeader(pnum));
            };

            let offset = self.geometry.slot_offset(slot, self.config.lebs_per_cpeb);
            let (data, _) = self.io.read_payload(pnum, offset, leb_size)?;
            chunk.copy_from_slice(&data);

            hdrs.push(Some(self.copy_header(&vid, chunk)));
        }

        Ok((hdrs, payload))
    }
}
