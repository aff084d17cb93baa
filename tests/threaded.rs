//! Scenarios that need the background worker running on its own thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use ubi_wl::eba::{Eba, LebId, MemEba};
use ubi_wl::nand::{NandLayout, ReadStatus, SimNand};
use ubi_wl::ubi::{AttachInfo, FlashIo, Geometry, NandIo, Vid, VidRead};
use ubi_wl::wl::Owner;
use ubi_wl::{Pnum, Result, Ubi, WlConfig};

/// [FlashIo] that can hold the next VID header write until the test lets it through
struct GatedIo {
    inner: Arc<NandIo<SimNand>>,
    armed: AtomicBool,
    gate: Mutex<(bool, bool)>,
    cv: Condvar,
}

impl GatedIo {
    fn new(inner: Arc<NandIo<SimNand>>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            gate: Mutex::new((false, false)),
            cv: Condvar::new(),
        }
    }

    fn arm(&self) {
        *self.gate.lock() = (false, false);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a write is held at the gate
    fn wait_entered(&self) {
        let mut gate = self.gate.lock();
        while !gate.0 {
            self.cv.wait(&mut gate);
        }
    }

    fn open(&self) {
        self.gate.lock().1 = true;
        self.cv.notify_all();
    }
}

impl FlashIo for GatedIo {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn read_ec(&self, pnum: Pnum) -> Result<Option<ubi_wl::ubi::Ec>> {
        self.inner.read_ec(pnum)
    }

    fn write_ec(&self, pnum: Pnum, ec: u64) -> Result<()> {
        self.inner.write_ec(pnum, ec)
    }

    fn read_vid_hdrs(&self, pnum: Pnum) -> Result<VidRead> {
        self.inner.read_vid_hdrs(pnum)
    }

    fn write_vid_hdrs(&self, pnum: Pnum, hdrs: &[Option<Vid>]) -> Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let mut gate = self.gate.lock();
            gate.0 = true;
            self.cv.notify_all();
            while !gate.1 {
                self.cv.wait(&mut gate);
            }
        }
        self.inner.write_vid_hdrs(pnum, hdrs)
    }

    fn read_payload(&self, pnum: Pnum, offset: usize, len: usize) -> Result<(Bytes, ReadStatus)> {
        self.inner.read_payload(pnum, offset, len)
    }

    fn write_payload(&self, pnum: Pnum, offset: usize, data: &[u8]) -> Result<()> {
        self.inner.write_payload(pnum, offset, data)
    }

    fn erase_block(&self, pnum: Pnum, torture: bool) -> Result<u32> {
        self.inner.erase_block(pnum, torture)
    }

    fn mark_block_bad(&self, pnum: Pnum) -> Result<()> {
        self.inner.mark_block_bad(pnum)
    }
}

const PEBS: u32 = 8;

fn formatted(blocks: u32) -> anyhow::Result<Arc<NandIo<SimNand>>> {
    let io = NandIo::new(SimNand::new(NandLayout {
        blocks,
        pages_per_block: 16,
        bytes_per_page: 256,
    }));
    for pnum in 0..blocks {
        io.write_ec(pnum, 1)?;
    }
    Ok(Arc::new(io))
}

fn attach(
    io: Arc<dyn FlashIo>,
    nand: &NandIo<SimNand>,
    config: WlConfig,
) -> anyhow::Result<(Ubi, Arc<MemEba>)> {
    let ai = AttachInfo::from_ebt(&nand.scan()?);
    let eba = Arc::new(MemEba::from_attach(&ai));
    let ubi = Ubi::attach(io, eba.clone(), config.self_checks(true), &ai)?;
    Ok((ubi, eba))
}

fn find_owned(ubi: &Ubi, owner: Owner) -> Option<Pnum> {
    (0..PEBS).find(|&pnum| ubi.owner(pnum) == Some(owner))
}

#[test]
fn test_release_target_during_move() -> anyhow::Result<()> {
    let nand = formatted(PEBS)?;
    let gate = Arc::new(GatedIo::new(nand.clone()));
    let (ubi, eba) = attach(gate.clone(), &nand, WlConfig::default())?;
    let leb = LebId::new(0, 0);

    eba.write_leb(&ubi, leb, b"moving")?;
    let from = eba.leb_location(leb).unwrap().pnum;

    gate.arm();
    ubi.request_scrub(from)?;
    gate.wait_entered();

    assert_eq!(ubi.owner(from), Some(Owner::MoveFrom));
    let to = find_owned(&ubi, Owner::MoveTo).unwrap();

    // The target is only put once the move is over
    ubi.release_peb(to, false)?;
    assert_eq!(ubi.owner(to), Some(Owner::MoveTo));

    gate.open();
    ubi.flush()?;

    assert_eq!(ubi.owner(from), Some(Owner::Free));
    assert_eq!(ubi.owner(to), Some(Owner::Free));
    assert_eq!(ubi.free_count(), PEBS);
    assert!(!ubi.is_read_only());
    ubi.self_check()?;

    Ok(())
}

#[test]
fn test_release_source_waits_for_move() -> anyhow::Result<()> {
    let nand = formatted(PEBS)?;
    let gate = Arc::new(GatedIo::new(nand.clone()));
    let (ubi, eba) = attach(gate.clone(), &nand, WlConfig::default())?;
    let leb = LebId::new(0, 0);

    eba.write_leb(&ubi, leb, b"moving")?;
    let from = eba.leb_location(leb).unwrap().pnum;

    gate.arm();
    ubi.request_scrub(from)?;
    gate.wait_entered();

    thread::scope(|s| -> anyhow::Result<()> {
        let releaser = s.spawn(|| ubi.release_peb(from, false));

        thread::sleep(Duration::from_millis(50));
        assert!(!releaser.is_finished());

        gate.open();
        releaser.join().unwrap()?;
        Ok(())
    })?;
    ubi.flush()?;

    let to = eba.leb_location(leb).unwrap().pnum;
    assert_ne!(to, from);
    assert_eq!(ubi.owner(to), Some(Owner::Used));
    assert_eq!(ubi.owner(from), Some(Owner::Free));
    assert_eq!(&eba.read_leb(&ubi, leb)?.unwrap()[..6], b"moving");
    ubi.self_check()?;

    Ok(())
}

#[test]
fn test_concurrent_writers() -> anyhow::Result<()> {
    let nand = formatted(16)?;
    let config = WlConfig::default().wl_threshold(2).prot_queue_len(2);
    let (ubi, eba) = attach(nand.clone(), &nand, config)?;

    let cold: Vec<LebId> = (0..4).map(|lnum| LebId::new(1, lnum)).collect();
    for &leb in &cold {
        eba.write_leb(&ubi, leb, format!("cold {leb}").as_bytes())?;
    }

    thread::scope(|s| {
        let writers: Vec<_> = (0..2)
            .map(|vol_id| {
                let (ubi, eba) = (&ubi, &eba);
                s.spawn(move || -> ubi_wl::Result<()> {
                    for round in 0..50 {
                        for lnum in 0..2 {
                            let leb = LebId::new(10 + vol_id, lnum);
                            eba.write_leb(ubi, leb, format!("{leb} {round}").as_bytes())?;
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap()?;
        }
        Ok::<_, ubi_wl::Error>(())
    })?;
    ubi.flush()?;

    for &leb in &cold {
        let expected = format!("cold {leb}");
        let data = eba.read_leb(&ubi, leb)?.unwrap();
        assert_eq!(&data[..expected.len()], expected.as_bytes());
    }
    for vol_id in 10..12 {
        for lnum in 0..2 {
            let leb = LebId::new(vol_id, lnum);
            let expected = format!("{leb} 49");
            let data = eba.read_leb(&ubi, leb)?.unwrap();
            assert_eq!(&data[..expected.len()], expected.as_bytes());
        }
    }

    assert!(!ubi.is_read_only());
    ubi.self_check()?;

    // Rewrites spread across the device instead of cycling a couple of PEBs
    let stats = ubi.report_block_stats(None)?;
    let worn = stats.iter().filter(|s| s.ec > 1).count();
    assert!(worn >= 8, "only {worn} PEBs took erases");

    Ok(())
}

#[test]
fn test_background_consolidation() -> anyhow::Result<()> {
    let nand = formatted(12)?;
    let config = WlConfig::default()
        .lebs_per_cpeb(2)
        .force_consolidation(true);
    let (ubi, eba) = attach(nand.clone(), &nand, config)?;

    let lebs: Vec<LebId> = (0..4).map(|lnum| LebId::new(0, lnum)).collect();
    for &leb in &lebs {
        eba.write_leb(&ubi, leb, leb.to_string().as_bytes())?;
    }
    ubi.flush()?;
    ubi.consolidate_sync()?;
    ubi.flush()?;

    assert_eq!(ubi.full_count(), 0);
    for &leb in &lebs {
        let location = eba.leb_location(leb).unwrap();
        assert!(ubi.is_consolidated(location.pnum), "{leb} not consolidated");

        let expected = leb.to_string();
        let data = eba.read_leb(&ubi, leb)?.unwrap();
        assert_eq!(&data[..expected.len()], expected.as_bytes());
    }
    ubi.self_check()?;

    // Dropping one LEB reopens its partner for consolidation
    eba.unmap_leb(&ubi, lebs[0])?;
    assert_eq!(ubi.full_count(), 1);

    Ok(())
}
