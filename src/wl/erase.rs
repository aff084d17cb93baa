//! Erasing PEBs, and what to do when erasing fails

use tracing::{debug, error, info, warn};

use super::registry::Owner;
use super::UbiDevice;
use crate::work::WorkKind;
use crate::{Error, Pnum, Result};

impl UbiDevice {
    /// Queue an erase of a PEB whose entry has already been detached ([Owner::Erasing])
    pub(crate) fn schedule_erase(&self, pnum: Pnum, torture: bool) {
        debug!(pnum, torture, "schedule erasure");
        self.work.schedule(self, WorkKind::Erase { pnum, torture });
    }

    /// Erase a PEB and write back its incremented erase counter
    fn sync_erase(&self, pnum: Pnum, torture: bool) -> Result<()> {
        let old_ec = self
            .wl
            .lock()
            .reg
            .get(pnum)
            .map(|e| e.ec)
            .ok_or(Error::NotFound(pnum))?;

        let cycles = self.io.erase_block(pnum, torture)?;
        let ec = old_ec + u64::from(cycles);
        if ec > self.config.max_erase_counter {
            error!(pnum, ec, "erase counter overflow");
            return Err(Error::EcOverflow { pnum, ec });
        }

        debug!(pnum, ec, "erased");
        self.io.write_ec(pnum, ec)?;

        let mut wl = self.wl.lock();
        if let Some(entry) = wl.reg.get_mut(pnum) {
            entry.ec = ec;
            entry.read_count = 0;
        }
        wl.max_ec = wl.max_ec.max(ec);
        Ok(())
    }

    /// Body of an erase job; also run directly by the mover to recycle PEBs it is done with
    pub(crate) fn erase_worker(&self, pnum: Pnum, torture: bool, cancel: bool) -> Result<()> {
        if cancel {
            debug!(pnum, "cancel erasure");
            self.wl.lock().reg.remove(pnum);
            return Ok(());
        }

        let err = match self.sync_erase(pnum, torture) {
            Ok(()) => {
                {
                    let mut wl = self.wl.lock();
                    wl.reg.move_to(pnum, Owner::Free);
                    wl.reg.serve_prot_queue();
                }
                self.ensure_wear_leveling();
                return Ok(());
            }
            Err(err) => err,
        };

        warn!(pnum, %err, "failed to erase PEB");

        if err.is_transient() {
            // Try again later; the entry stays with the new job
            self.schedule_erase(pnum, torture);
            return Err(err);
        }

        self.wl.lock().reg.remove(pnum);
        if !err.is_hard_io() {
            self.set_read_only();
            return Err(err);
        }

        self.retire_bad_peb(pnum, err)
    }

    /// Mark a PEB that failed hard as bad, and pay for it out of the reserve
    fn retire_bad_peb(&self, pnum: Pnum, err: Error) -> Result<()> {
        if !self.config.bad_allowed {
            error!(pnum, "bad PEB, but bad blocks are not allowed");
            self.set_read_only();
            return Err(err);
        }

        let mut consumed = false;
        {
            let mut wl = self.wl.lock();
            if wl.cap.beb_rsvd_pebs == 0 {
                if wl.cap.avail_pebs == 0 {
                    drop(wl);
                    error!(pnum, "no reserved or available PEBs left");
                    self.set_read_only();
                    return Err(Error::NoReserve);
                }
                wl.cap.avail_pebs -= 1;
                consumed = true;
            }
        }

        info!(pnum, "marking PEB bad");
        if let Err(err) = self.io.mark_block_bad(pnum) {
            if consumed {
                self.wl.lock().cap.avail_pebs += 1;
            }
            self.set_read_only();
            return Err(err);
        }

        let mut wl = self.wl.lock();
        let cap = &mut wl.cap;
        if cap.beb_rsvd_pebs > 0 {
            if consumed {
                // The reserve grew since we checked it
                cap.avail_pebs += 1;
            }
            cap.beb_rsvd_pebs -= 1;
            cap.rsvd_pebs -= 1;
        }
        cap.bad_peb_count += 1;
        cap.good_peb_count -= 1;

        if cap.beb_rsvd_pebs == 0 {
            warn!(bad = cap.bad_peb_count, "last PEB reserved for bad block handling used");
        } else {
            info!(left = cap.beb_rsvd_pebs, "PEBs left in the bad block reserve");
        }

        Ok(())
    }
}
