//! The wear-leveling mover: copies the LEB(s) of a worn-out (or bit-flipping) PEB to a fresh one
//!
//! The source is the least-worn used PEB, or any PEB waiting to be scrubbed; the target is a free
//! PEB picked by [super::picker::PebPicker::find_wl_entry]. The whole migration runs under the
//! move mutex, which is how [UbiDevice::release_peb] finds out a PEB is being moved.

use tracing::{debug, error, info, warn};

use super::registry::Owner;
use super::UbiDevice;
use crate::eba::{LebId, LebLocation, TryLock};
use crate::nand::ReadStatus;
use crate::ubi::{data_crc, Vid, VidRead, VolType};
use crate::{Error, Pnum, Result};

/// How a copy attempt ended, short of a fatal error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum MoveOutcome {
    Moved,

    /// A LEB was locked, unmapped or remapped under us; nothing was written
    CancelRace,

    TargetWr,
    TargetRd,
    TargetBitflips,

    /// The source could not be read
    SourceRd,
}

/// What to do with the source PEB after a failed move
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Disposal {
    Protect,
    Scrub,
    Keep,
    Erroneous,
}

impl UbiDevice {
    /// Body of a wear-leveling job
    pub(crate) fn wl_worker(&self, cancel: bool) -> Result<()> {
        if cancel {
            self.wl.lock().wl_scheduled = false;
            return Ok(());
        }

        let _moving = self.move_mutex.lock();

        let (from, to, scrubbing) = {
            let mut wl = self.wl.lock();
            let picked = if let Some(&(_, from)) = wl.reg.scrub.first() {
                self.get_peb_for_wl(&wl.reg)
                    .map(|(_, to)| (from, to, true))
            } else {
                match (wl.reg.used.first(), self.get_peb_for_wl(&wl.reg)) {
                    (Some(&(min_ec, from)), Some((ec, to)))
                        if ec.saturating_sub(min_ec) >= self.config.wl_threshold =>
                    {
                        Some((from, to, false))
                    }
                    _ => None,
                }
            };

            let Some(picked) = picked else {
                debug!("cancel wear-leveling, nothing to do");
                wl.wl_scheduled = false;
                return Ok(());
            };

            wl.reg.move_to(picked.0, Owner::MoveFrom);
            wl.reg.move_to(picked.1, Owner::MoveTo);
            wl.move_to_put = false;
            picked
        };

        if scrubbing {
            debug!(from, to, "scrub PEB");
        } else {
            debug!(from, to, "wear-level PEB");
        }

        // The source's headers decide what is there to move
        let slots = match self.io.read_vid_hdrs(from) {
            Ok(VidRead::Headers { slots, .. }) => slots,
            Ok(VidRead::Empty { bitflips }) => {
                // Handed out, but not written yet: give the writer more time
                let disposal = if bitflips {
                    Disposal::Scrub
                } else {
                    Disposal::Protect
                };
                return self.not_moved(from, to, disposal, None);
            }
            Err(err) => {
                error!(from, %err, "cannot read VID headers of source");
                return self.move_failed(from, to, err);
            }
        };

        match self.copy_peb(from, to, &slots) {
            Ok(MoveOutcome::Moved) => self.moved(from, to, scrubbing),
            Ok(MoveOutcome::CancelRace) => self.not_moved(from, to, Disposal::Protect, None),
            Ok(
                outcome @ (MoveOutcome::TargetWr
                | MoveOutcome::TargetRd
                | MoveOutcome::TargetBitflips),
            ) => {
                warn!(from, to, ?outcome, "target PEB failed, torturing it");
                let disposal = if scrubbing {
                    Disposal::Scrub
                } else {
                    Disposal::Keep
                };
                self.not_moved(from, to, disposal, Some(true))
            }
            Ok(MoveOutcome::SourceRd) => {
                let (count, max) = (
                    self.wl.lock().reg.erroneous.len() as u32,
                    self.config.max_erroneous_for(self.geometry.peb_count),
                );
                if count >= max {
                    error!(count, max, "too many erroneous PEBs");
                    return self.move_failed(from, to, Error::TooManyErroneous);
                }
                warn!(from, "source PEB unreadable, marking it erroneous");
                self.not_moved(from, to, Disposal::Erroneous, None)
            }
            Err(err) => {
                error!(from, to, %err, "error while moving PEB");
                self.move_failed(from, to, err)
            }
        }
    }

    /// Commit a successful move: recycle the source, and the target too if it was put meanwhile
    fn moved(&self, from: Pnum, to: Pnum, scrubbing: bool) -> Result<()> {
        if scrubbing {
            info!(from, to, "scrubbed PEB");
        }

        let put = {
            let mut wl = self.wl.lock();
            let put = wl.move_to_put;
            if !put {
                wl.reg.move_to(to, Owner::Used);
            } else {
                wl.reg.move_to(to, Owner::Erasing);
            }
            wl.reg.move_to(from, Owner::Erasing);
            wl.move_to_put = false;
            wl.wl_scheduled = false;
            put
        };

        if let Err(err) = self.erase_worker(from, false, false) {
            if put {
                self.wl.lock().reg.remove(to);
            }
            self.set_read_only();
            return Err(err);
        }

        if put {
            debug!(to, "target was put meanwhile, erasing it");
            if let Err(err) = self.erase_worker(to, false, false) {
                self.set_read_only();
                return Err(err);
            }
        }

        Ok(())
    }

    /// The move did not happen; put the source back where `disposal` says
    ///
    /// `erase_target` is `None` when the target was never written and can go straight back to
    /// the free pool, otherwise it says whether to torture the target while erasing it.
    fn not_moved(
        &self,
        from: Pnum,
        to: Pnum,
        disposal: Disposal,
        erase_target: Option<bool>,
    ) -> Result<()> {
        {
            let mut wl = self.wl.lock();
            match disposal {
                Disposal::Protect => wl.reg.protect(from),
                Disposal::Scrub => wl.reg.move_to(from, Owner::Scrub),
                Disposal::Keep => wl.reg.move_to(from, Owner::Used),
                Disposal::Erroneous => wl.reg.move_to(from, Owner::Erroneous),
            }
            let target = match erase_target {
                None => Owner::Free,
                Some(_) => Owner::Erasing,
            };
            wl.reg.move_to(to, target);
            wl.move_to_put = false;
            wl.wl_scheduled = false;
        }

        match erase_target {
            None => {
                // A scrub that found nothing to copy waits for the next erase to come around
                if disposal != Disposal::Scrub {
                    self.ensure_wear_leveling();
                }
                Ok(())
            }
            Some(torture) => self.erase_worker(to, torture, false).inspect_err(|_| {
                self.set_read_only();
            }),
        }
    }

    /// Abandon both PEBs and stop writing to the device
    fn move_failed(&self, from: Pnum, to: Pnum, err: Error) -> Result<()> {
        {
            let mut wl = self.wl.lock();
            wl.reg.remove(from);
            wl.reg.remove(to);
            wl.move_to_put = false;
            wl.wl_scheduled = false;
        }
        self.set_read_only();
        Err(err)
    }

    /// Copy every live LEB of `from` to `to`, and remap them
    fn copy_peb(&self, from: Pnum, to: Pnum, slots: &[Option<Vid>]) -> Result<MoveOutcome> {
        let lebs = match self.descriptor(from) {
            Some(lebs) => lebs,
            None => {
                let Some(vid) = slots.first().copied().flatten() else {
                    return Ok(MoveOutcome::CancelRace);
                };
                vec![Some(LebId::new(vid.vol_id, vid.lnum))]
            }
        };

        let mut locked = Vec::with_capacity(lebs.len());
        for &leb in lebs.iter().flatten() {
            match self.eba.leb_write_trylock(leb) {
                TryLock::Acquired => locked.push(leb),
                TryLock::Busy | TryLock::Unmapped => {
                    debug!(%leb, from, "LEB busy, cancelling move");
                    for &leb in &locked {
                        self.eba.leb_write_unlock(leb);
                    }
                    return Ok(MoveOutcome::CancelRace);
                }
            }
        }

        let result = self.copy_locked(from, to, &lebs, slots);

        for &leb in &locked {
            self.eba.leb_write_unlock(leb);
        }
        result
    }

    fn copy_locked(
        &self,
        from: Pnum,
        to: Pnum,
        lebs: &[Option<LebId>],
        slots: &[Option<Vid>],
    ) -> Result<MoveOutcome> {
        let n = lebs.len();
        let leb_size = self.leb_size();
        let leb_start = self.geometry.leb_start;

        for (slot, leb) in lebs.iter().enumerate() {
            let Some(leb) = *leb else { continue };
            if self.eba.leb_location(leb) != Some(LebLocation::new(from, slot)) {
                debug!(%leb, from, "LEB remapped meanwhile, cancelling move");
                return Ok(MoveOutcome::CancelRace);
            }
        }

        let (data, _) = match self.io.read_payload(from, leb_start, leb_size * n) {
            Ok(read) => read,
            Err(err) if err.is_hard_io() => {
                warn!(from, %err, "cannot read source PEB");
                return Ok(MoveOutcome::SourceRd);
            }
            Err(err) => return Err(err),
        };

        let mut hdrs = Vec::with_capacity(n);
        let mut written = 0;
        for (slot, leb) in lebs.iter().enumerate() {
            let hdr = match (leb, slots.get(slot).copied().flatten()) {
                (Some(_), Some(vid)) => {
                    let chunk = &data[slot * leb_size..(slot + 1) * leb_size];
                    let hdr = self.copy_header(&vid, chunk);
                    written = slot * leb_size + hdr.data_size as usize;
                    Some(hdr)
                }
                (Some(leb), None) => {
                    error!(%leb, from, "live LEB without a VID header");
                    return Err(Error::CorruptHeader(from));
                }
                (None, _) => None,
            };
            hdrs.push(hdr);
        }

        // Dynamic LEBs are copied up to their last written page only
        let payload = &data[..written.next_multiple_of(self.geometry.page_size).min(data.len())];

        match self.io.write_peb(to, &hdrs, payload) {
            Ok(()) => {}
            Err(err) if err.is_hard_io() => {
                warn!(to, %err, "cannot write target PEB");
                return Ok(MoveOutcome::TargetWr);
            }
            Err(err) => return Err(err),
        }

        // Read everything back before the mapping changes
        match self.io.read_vid_hdrs(to) {
            Ok(VidRead::Headers { bitflips: true, .. }) => return Ok(MoveOutcome::TargetBitflips),
            Ok(VidRead::Headers { slots, .. }) if trimmed(&hdrs) == slots.as_slice() => {}
            Ok(_) => return Ok(MoveOutcome::TargetWr),
            Err(err) if err.is_hard_io() => return Ok(MoveOutcome::TargetRd),
            Err(err) => return Err(err),
        }
        if !payload.is_empty() {
            match self.io.read_payload(to, leb_start, payload.len()) {
                Ok((_, ReadStatus::Bitflips)) => return Ok(MoveOutcome::TargetBitflips),
                Ok((readback, _)) if readback == payload => {}
                Ok(_) => return Ok(MoveOutcome::TargetWr),
                Err(err) if err.is_hard_io() => return Ok(MoveOutcome::TargetRd),
                Err(err) => return Err(err),
            }
        }

        for (slot, leb) in lebs.iter().enumerate() {
            if let Some(leb) = *leb {
                self.eba.remap_leb(leb, LebLocation::new(to, slot))?;
            }
        }
        if n > 1 {
            self.move_descriptor(from, to);
        }

        Ok(MoveOutcome::Moved)
    }

    /// Build the VID header for a copy of `vid`'s LEB, whose payload is `data`
    pub(crate) fn copy_header(&self, vid: &Vid, data: &[u8]) -> Vid {
        let data_size = match vid.vol_type {
            VolType::Static => (vid.data_size as usize).min(data.len()),
            VolType::Dynamic => {
                let used = data.len() - data.iter().rev().take_while(|&&b| b == 0xFF).count();
                used.next_multiple_of(self.geometry.page_size).min(data.len())
            }
        };
        let data = &data[..data_size];

        Vid {
            copy_flag: true,
            data_size: data_size as u32,
            data_crc: data_crc(data),
            sqnum: self.next_sqnum(),
            ..*vid
        }
    }
}

/// The headers as they read back from flash: trailing empty slots are not stored
fn trimmed(hdrs: &[Option<Vid>]) -> &[Option<Vid>] {
    let len = hdrs.iter().rposition(Option::is_some).map_or(0, |i| i + 1);
    &hdrs[..len]
}

#[cfg(test)]
mod test {
    use super::super::test::{attach_sim, sim_io};
    use super::*;
    use crate::eba::Eba;
    use crate::nand::SimFault;
    use crate::ubi::FlashIo;
    use crate::WlConfig;

    const LEB: LebId = LebId { vol_id: 0, lnum: 7 };

    #[test]
    fn test_wear_level_move() -> anyhow::Result<()> {
        let io = sim_io(&[10; 8]);
        let (ubi, eba) = attach_sim(&io, WlConfig::default().wl_threshold(4).prot_queue_len(1))?;

        eba.write_leb(&ubi, LEB, b"precious")?;
        let from = eba.leb_location(LEB).unwrap().pnum;

        // Cycle spare PEBs until the free pool is well ahead of the used PEB
        while !ubi.wl_pending() {
            let spare = ubi.allocate_peb(false, 0)?;
            ubi.release_peb(spare, false)?;
            ubi.work.do_work(&*ubi);
        }
        ubi.run_pending();

        let to = eba.leb_location(LEB).unwrap().pnum;
        assert_ne!(from, to);
        assert_eq!(ubi.owner(from), Some(Owner::Free));
        assert_eq!(ubi.owner(to), Some(Owner::Used));
        assert_eq!(&eba.read_leb(&ubi, LEB)?.unwrap()[..8], b"precious");

        let VidRead::Headers { slots, .. } = io.read_vid_hdrs(to)? else {
            panic!("target has no VID header");
        };
        let vid = slots[0].unwrap();
        assert!(vid.copy_flag);
        assert_eq!(vid.data_size as usize, io.geometry().page_size);
        ubi.self_check()?;

        Ok(())
    }

    #[test]
    fn test_scrub() -> anyhow::Result<()> {
        let io = sim_io(&[10; 8]);
        let (ubi, eba) = attach_sim(&io, WlConfig::default())?;

        eba.write_leb(&ubi, LEB, b"bitflip")?;
        let from = eba.leb_location(LEB).unwrap().pnum;
        ubi.request_scrub(from)?;
        ubi.run_pending();

        let to = eba.leb_location(LEB).unwrap().pnum;
        assert_ne!(from, to);
        assert_eq!(ubi.owner(from), Some(Owner::Free));
        assert_eq!(&eba.read_leb(&ubi, LEB)?.unwrap()[..7], b"bitflip");
        ubi.self_check()?;

        Ok(())
    }

    #[test]
    fn test_empty_source_protected() -> anyhow::Result<()> {
        let io = sim_io(&[10; 8]);
        let (ubi, _eba) = attach_sim(&io, WlConfig::default())?;

        let pnum = ubi.allocate_peb(false, 0)?;
        ubi.request_scrub(pnum)?;
        ubi.run_pending();

        assert!(matches!(ubi.owner(pnum), Some(Owner::Protected(_))));
        assert_eq!(ubi.free_count(), 7);
        ubi.self_check()?;

        Ok(())
    }

    #[test]
    fn test_locked_leb_cancels_move() -> anyhow::Result<()> {
        let io = sim_io(&[10; 8]);
        let (ubi, eba) = attach_sim(&io, WlConfig::default())?;

        eba.write_leb(&ubi, LEB, b"busy")?;
        let from = eba.leb_location(LEB).unwrap().pnum;
        assert_eq!(eba.leb_write_trylock(LEB), TryLock::Acquired);
        ubi.request_scrub(from)?;
        ubi.work.do_work(&*ubi);
        eba.leb_write_unlock(LEB);

        assert_eq!(eba.leb_location(LEB).unwrap().pnum, from);
        assert!(matches!(ubi.owner(from), Some(Owner::Protected(_))));
        ubi.self_check()?;

        Ok(())
    }

    #[test]
    fn test_target_failure_tortures_target() -> anyhow::Result<()> {
        let io = sim_io(&[10; 8]);
        let (ubi, eba) = attach_sim(&io, WlConfig::default())?;

        eba.write_leb(&ubi, LEB, b"data")?;
        let from = eba.leb_location(LEB).unwrap().pnum;
        for pnum in (0..8).filter(|&pnum| pnum != from) {
            io.nand().inject(pnum, SimFault::ProgramError);
        }

        ubi.request_scrub(from)?;
        ubi.work.do_work(&*ubi);

        // The source waits for another attempt; the target failed torture and went bad
        assert_eq!(eba.leb_location(LEB).unwrap().pnum, from);
        assert_eq!(ubi.owner(from), Some(Owner::Scrub));
        assert_eq!(ubi.capacity().bad_peb_count, 1);
        assert!(!ubi.is_read_only());

        Ok(())
    }

    #[test]
    fn test_source_read_error_erroneous() -> anyhow::Result<()> {
        let io = sim_io(&[10; 8]);
        let (ubi, eba) = attach_sim(&io, WlConfig::default())?;

        eba.write_leb(&ubi, LEB, b"unlucky")?;
        let from = eba.leb_location(LEB).unwrap().pnum;
        ubi.request_scrub(from)?;
        io.nand().inject(from, SimFault::PageReadError(2));
        ubi.work.do_work(&*ubi);

        assert_eq!(ubi.owner(from), Some(Owner::Erroneous));
        assert_eq!(eba.leb_location(LEB).unwrap().pnum, from);
        assert_eq!(ubi.free_count(), 7);
        assert!(!ubi.is_read_only());

        // Releasing an erroneous PEB always tortures it
        eba.unmap_leb(&ubi, LEB)?;
        ubi.run_pending();
        assert_eq!(ubi.owner(from), Some(Owner::Free));
        assert_eq!(ubi.report_block_stats(Some(from))?[0].ec, 14);

        Ok(())
    }

    #[test]
    fn test_source_read_error_at_ceiling() -> anyhow::Result<()> {
        let io = sim_io(&[10; 8]);
        let (ubi, eba) = attach_sim(&io, WlConfig::default().max_erroneous(0))?;

        eba.write_leb(&ubi, LEB, b"unlucky")?;
        let from = eba.leb_location(LEB).unwrap().pnum;
        ubi.request_scrub(from)?;
        io.nand().inject(from, SimFault::PageReadError(2));
        assert!(matches!(
            ubi.work.do_work(&*ubi),
            Some(Err(Error::TooManyErroneous))
        ));

        assert!(ubi.is_read_only());
        assert_eq!(ubi.owner(from), None);
        assert_eq!(ubi.work.pending(), 0);

        Ok(())
    }
}
