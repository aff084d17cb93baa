//! The logical eraseblock (LEB) table the engine talks back to
//!
//! The engine never owns the LEB to PEB mapping; it only needs to lock LEBs against writers while
//! it copies them, and to point them at their new location afterwards. [Eba] is that interface.
//! [MemEba] implements it with an in-memory table, and adds a minimal write/read/unmap path on
//! top of a [UbiDevice] so the whole stack can be driven end to end.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::nand::ReadStatus;
use crate::ubi::{AttachInfo, Vid, VolType};
use crate::wl::UbiDevice;
use crate::{Error, Pnum, Result};

/// A logical eraseblock: `vol_id:lnum`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LebId {
    pub vol_id: u32,
    pub lnum: u32,
}

impl LebId {
    pub const fn new(vol_id: u32, lnum: u32) -> Self {
        Self { vol_id, lnum }
    }
}

impl fmt::Display for LebId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vol_id, self.lnum)
    }
}

/// Where a LEB lives: a PEB, and the slot within it (always 0 unless consolidated)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LebLocation {
    pub pnum: Pnum,
    pub slot: usize,
}

impl LebLocation {
    pub const fn new(pnum: Pnum, slot: usize) -> Self {
        Self { pnum, slot }
    }
}

/// The result of [Eba::leb_write_trylock]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TryLock {
    Acquired,

    /// Somebody else holds the LEB
    Busy,

    /// The LEB is not mapped (anymore); nothing was locked
    Unmapped,
}

/// What the engine needs from the LEB layer
pub trait Eba: Send + Sync {
    /// Take the write lock of a LEB without blocking
    fn leb_write_trylock(&self, leb: LebId) -> TryLock;

    fn leb_write_unlock(&self, leb: LebId);

    fn leb_location(&self, leb: LebId) -> Option<LebLocation>;

    /// Point a LEB at its new location; the caller holds its write lock
    fn remap_leb(&self, leb: LebId, location: LebLocation) -> Result<()>;
}

#[derive(Debug, Default)]
struct LebState {
    location: Option<LebLocation>,
    locked: bool,
}

/// An in-memory [Eba]
#[derive(Debug, Default)]
pub struct MemEba {
    table: Mutex<BTreeMap<LebId, LebState>>,
    cv: Condvar,
}

/// Holds a LEB's write lock; see [MemEba::lock_leb]
struct LebGuard<'a> {
    eba: &'a MemEba,
    leb: LebId,
}

impl Drop for LebGuard<'_> {
    fn drop(&mut self) {
        self.eba.leb_write_unlock(self.leb);
    }
}

impl MemEba {
    pub fn new() -> Self {
        Default::default()
    }

    /// Build the table from the LEBs found while scanning
    pub fn from_attach(ai: &AttachInfo) -> Self {
        let table = ai
            .lebs
            .iter()
            .map(|(&leb, &location)| {
                let state = LebState {
                    location: Some(location),
                    locked: false,
                };
                (leb, state)
            })
            .collect();

        Self {
            table: Mutex::new(table),
            cv: Condvar::new(),
        }
    }

    /// Every mapped LEB, in order
    pub fn mapped(&self) -> Vec<(LebId, LebLocation)> {
        self.table
            .lock()
            .iter()
            .filter_map(|(&leb, state)| Some((leb, state.location?)))
            .collect()
    }

    /// Take the write lock of a LEB, waiting for the current holder if needed
    fn lock_leb(&self, leb: LebId) -> LebGuard<'_> {
        let mut table = self.table.lock();
        loop {
            let state = table.entry(leb).or_default();
            if !state.locked {
                state.locked = true;
                break;
            }
            self.cv.wait(&mut table);
        }
        LebGuard { eba: self, leb }
    }

    fn set_location(&self, leb: LebId, location: Option<LebLocation>) -> Option<LebLocation> {
        let mut table = self.table.lock();
        let state = table.entry(leb).or_default();
        std::mem::replace(&mut state.location, location)
    }

    /// Write a whole LEB out of place: a fresh PEB is allocated, and the old one released
    pub fn write_leb(&self, ubi: &UbiDevice, leb: LebId, data: &[u8]) -> Result<()> {
        if data.len() > ubi.leb_size() {
            return Err(Error::Invalid(format!(
                "{} bytes do not fit in LEB {leb}",
                data.len()
            )));
        }

        let _guard = self.lock_leb(leb);

        let pnum = ubi.allocate_peb(false, ubi.conso_reserve())?;
        let vid = Vid {
            vol_type: VolType::Dynamic,
            vol_id: leb.vol_id,
            lnum: leb.lnum,
            sqnum: ubi.next_sqnum(),
            ..Default::default()
        };
        if let Err(err) = ubi.io.write_peb(pnum, &[Some(vid)], data) {
            warn!(%leb, pnum, %err, "write failed");
            ubi.release_peb(pnum, err.is_hard_io())?;
            return Err(err);
        }

        let old = self.set_location(leb, Some(LebLocation::new(pnum, 0)));
        debug!(%leb, pnum, "LEB written");

        if let Some(old) = old {
            if ubi.invalidate_leb(old.pnum, leb) {
                ubi.release_peb(old.pnum, false)?;
            }
        }

        ubi.add_full_leb(leb);
        if ubi.consolidation_needed() {
            ubi.schedule_consolidation();
        }

        Ok(())
    }

    /// Read a whole LEB; `None` if it is not mapped
    ///
    /// A read that needed bit-flip correction gets the PEB scrubbed.
    pub fn read_leb(&self, ubi: &UbiDevice, leb: LebId) -> Result<Option<Bytes>> {
        let guard = self.lock_leb(leb);

        let Some(LebLocation { pnum, slot }) = self.leb_location(leb) else {
            return Ok(None);
        };
        let offset = ubi.geometry().slot_offset(slot, ubi.config().lebs_per_cpeb);
        let (data, status) = ubi.io.read_payload(pnum, offset, ubi.leb_size())?;
        ubi.update_read_count(pnum)?;
        drop(guard);

        if status == ReadStatus::Bitflips {
            debug!(%leb, pnum, "bit-flips corrected while reading");
            ubi.request_scrub(pnum)?;
        }

        Ok(Some(data))
    }

    /// Drop a LEB's mapping, releasing its PEB once nothing else lives there
    pub fn unmap_leb(&self, ubi: &UbiDevice, leb: LebId) -> Result<()> {
        let _guard = self.lock_leb(leb);

        let Some(old) = self.set_location(leb, None) else {
            return Ok(());
        };
        debug!(%leb, pnum = old.pnum, "LEB unmapped");

        if ubi.invalidate_leb(old.pnum, leb) {
            ubi.release_peb(old.pnum, false)?;
        }
        Ok(())
    }
}

impl Eba for MemEba {
    fn leb_write_trylock(&self, leb: LebId) -> TryLock {
        let mut table = self.table.lock();
        match table.get_mut(&leb) {
            Some(state) if state.locked => TryLock::Busy,
            Some(state) if state.location.is_some() => {
                state.locked = true;
                TryLock::Acquired
            }
            _ => TryLock::Unmapped,
        }
    }

    fn leb_write_unlock(&self, leb: LebId) {
        if let Some(state) = self.table.lock().get_mut(&leb) {
            state.locked = false;
        }
        self.cv.notify_all();
    }

    fn leb_location(&self, leb: LebId) -> Option<LebLocation> {
        self.table.lock().get(&leb)?.location
    }

    fn remap_leb(&self, leb: LebId, location: LebLocation) -> Result<()> {
        let mut table = self.table.lock();
        let state = table
            .get_mut(&leb)
            .filter(|state| state.location.is_some())
            .ok_or_else(|| Error::Invalid(format!("remap of unmapped LEB {leb}")))?;
        state.location = Some(location);
        Ok(())
    }
}
