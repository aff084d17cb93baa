//! This module contains code to scan NAND blocks and determine their contents (per UBI), and to
//! turn the scan results into the information needed to attach the wear-leveling engine.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::headers::*;
use crate::eba::{LebId, LebLocation};
use crate::nand::{Nand, NandBlock, PageUtil, ReadStatus};
use crate::Pnum;

/// These are the states that a given block may be detected in
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum BlockContent {
    /// The block is bad, and cannot be accessed
    Bad,

    /// The block is fully erased, perhaps because UBI has never used it
    Erased,

    /// The block is erased, but has a UBI EC header that should be preserved
    EcErased(Ec),

    /// The block is in use, with a UBI EC header that should be preserved
    ///
    /// `vids` holds one entry per slot; it is empty if data was found without any VID header.
    EcData {
        ec: Ec,
        vids: Vec<Option<Vid>>,
        bitflips: bool,
    },

    /// The block is in some other (invalid, per UBI) state, and needs to be erased
    Garbage,
}

impl BlockContent {
    /// How many pages do we read at a time? A higher number helps in high-latency situations.
    const PAGE_CHUNKS: u32 = 4;

    /// Read a NAND block and characterize its content
    fn scan_block<B: NandBlock>(block: &B) -> anyhow::Result<Self> {
        let page_size = block.page_size();
        let mut buf = vec![0; page_size * 2];

        let status = match block.read(0, &mut buf) {
            Ok(status) => status,
            Err(err) if err.is_media_error() => return Ok(Self::Garbage),
            Err(err) => return Err(err.into()),
        };
        let (ec_page, vid_page) = buf.split_at(page_size);

        let Some(ec) = Ec::decode(ec_page) else {
            if ec_page.is_erased() && vid_page.is_erased() && Self::rest_erased(block)? {
                return Ok(Self::Erased);
            }
            return Ok(Self::Garbage);
        };

        if vid_page.is_erased() {
            // An EC header with nothing after it is a free block; with data after it, the write
            // was interrupted before the VID header landed.
            return Ok(if Self::rest_erased(block)? {
                Self::EcErased(ec)
            } else {
                Self::EcData {
                    ec,
                    vids: vec![],
                    bitflips: false,
                }
            });
        }

        // Corrupt slots count as empty; their LEBs are found elsewhere or are lost
        let VidPage { slots: vids, corrupt } = VidPage::decode(vid_page);
        if !corrupt.is_empty() {
            debug!(?corrupt, "ignoring corrupt VID headers");
        }

        Ok(Self::EcData {
            ec,
            vids,
            bitflips: status == ReadStatus::Bitflips,
        })
    }

    /// Are all pages after the VID header page erased?
    fn rest_erased<B: NandBlock>(block: &B) -> anyhow::Result<bool> {
        let mut buf = vec![0; block.page_size() * Self::PAGE_CHUNKS as usize];

        for start_page in (2..block.page_count()).step_by(Self::PAGE_CHUNKS as usize) {
            // Clip the buffer down to the size of the page(s) read on this iteration
            let end_page = std::cmp::min(block.page_count(), start_page + Self::PAGE_CHUNKS);
            let buf = &mut buf[..block.page_size() * (end_page - start_page) as usize];

            match block.read(start_page, buf) {
                Ok(_) => {}
                Err(err) if err.is_media_error() => return Ok(false),
                Err(err) => return Err(err.into()),
            }

            if !buf.is_erased() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// The EC header of this block, if it has one
    pub fn ec(&self) -> Option<&Ec> {
        match self {
            Self::EcErased(ec) | Self::EcData { ec, .. } => Some(ec),
            _ => None,
        }
    }
}

/// The (E)rase(b)lock (t)able. A map of the state of the NAND flash as determined by
/// [scan_blocks].
pub type Ebt = Box<[BlockContent]>;

/// Read all blocks of the NAND (only as much as necessary to determine content), return the [Ebt]
pub fn scan_blocks<N: Nand>(nand: &mut N) -> anyhow::Result<Ebt> {
    let block_count = nand.get_layout().blocks;
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(block_count));

    // Grr, try_collect() isn't stable yet, so:
    let mut ebt = Vec::with_capacity(block_count as usize);
    for n in 0..block_count {
        let content = match nand.block(n)? {
            None => BlockContent::Bad,
            Some(block) => BlockContent::scan_block(&block)?,
        };
        rpt.inc();
        ebt.push(content);
    }

    rpt.close();

    Ok(ebt.into())
}

/// A PEB holding live data at attach time
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UsedPeb {
    pub pnum: Pnum,
    pub ec: u64,

    /// Bit-flips were seen while scanning; the PEB should be scrubbed
    pub scrub: bool,
}

/// Everything the engine and the EBA table are built from
#[derive(Debug, Clone, Default)]
pub struct AttachInfo {
    pub peb_count: u32,
    pub bad_peb_count: u32,

    /// Erased PEBs with a valid EC header: `(pnum, ec)`
    pub free: Vec<(Pnum, u64)>,

    pub used: Vec<UsedPeb>,

    /// PEBs that must be erased before use: `(pnum, ec)`; the EC is the mean if unknown
    pub erase: Vec<(Pnum, u64)>,

    /// Where every LEB lives, after resolving duplicates by sequence number
    pub lebs: BTreeMap<LebId, LebLocation>,

    /// Slot contents of every PEB holding more than one LEB header
    pub consolidated: BTreeMap<Pnum, Vec<Option<LebId>>>,

    pub mean_ec: u64,
    pub max_ec: u64,
    pub max_sqnum: u64,
}

impl AttachInfo {
    /// Classify every block of a scanned device
    pub fn from_ebt(ebt: &Ebt) -> Self {
        let mut ai = AttachInfo {
            peb_count: ebt.len() as u32,
            ..Default::default()
        };

        // Mean EC of every block that has one, rounded; blocks without an EC start from here
        let (ec_sum, ec_count) = ebt
            .iter()
            .filter_map(BlockContent::ec)
            .fold((0u64, 0u64), |(sum, count), ec| (sum + ec.ec, count + 1));
        ai.mean_ec = (ec_sum + ec_count / 2).checked_div(ec_count).unwrap_or(0);
        ai.max_ec = ebt
            .iter()
            .filter_map(BlockContent::ec)
            .map(|ec| ec.ec)
            .max()
            .unwrap_or(0);

        // First pass: find the newest copy of every LEB
        let mut newest: BTreeMap<LebId, (u64, LebLocation)> = BTreeMap::new();
        for (pnum, content) in ebt.iter().enumerate() {
            let BlockContent::EcData { vids, .. } = content else {
                continue;
            };
            for (slot, vid) in vids.iter().enumerate() {
                let Some(vid) = vid else { continue };
                ai.max_sqnum = ai.max_sqnum.max(vid.sqnum);

                let leb = LebId::new(vid.vol_id, vid.lnum);
                let location = LebLocation::new(pnum as Pnum, slot);
                match newest.get(&leb) {
                    Some(&(sqnum, _)) if sqnum >= vid.sqnum => {
                        debug!(%leb, pnum, "older copy of LEB ignored");
                    }
                    _ => {
                        newest.insert(leb, (vid.sqnum, location));
                    }
                }
            }
        }
        ai.lebs = newest
            .into_iter()
            .map(|(leb, (_, location))| (leb, location))
            .collect();

        // Second pass: sort blocks into the lists
        for (pnum, content) in ebt.iter().enumerate() {
            let pnum = pnum as Pnum;
            match content {
                BlockContent::Bad => ai.bad_peb_count += 1,
                BlockContent::Erased | BlockContent::Garbage => ai.erase.push((pnum, ai.mean_ec)),
                BlockContent::EcErased(ec) => ai.free.push((pnum, ec.ec)),
                BlockContent::EcData { ec, vids, bitflips } => {
                    let live: Vec<Option<LebId>> = vids
                        .iter()
                        .enumerate()
                        .map(|(slot, vid)| {
                            let vid = vid.as_ref()?;
                            let leb = LebId::new(vid.vol_id, vid.lnum);
                            (ai.lebs.get(&leb) == Some(&LebLocation::new(pnum, slot)))
                                .then_some(leb)
                        })
                        .collect();

                    if live.iter().all(Option::is_none) {
                        ai.erase.push((pnum, ec.ec));
                        continue;
                    }

                    if vids.len() > 1 {
                        ai.consolidated.insert(pnum, live);
                    }
                    ai.used.push(UsedPeb {
                        pnum,
                        ec: ec.ec,
                        scrub: *bitflips,
                    });
                }
            }
        }

        if ai.bad_peb_count > 0 {
            warn!(bad = ai.bad_peb_count, "bad PEBs found while scanning");
        }
        info!(
            free = ai.free.len(),
            used = ai.used.len(),
            erase = ai.erase.len(),
            lebs = ai.lebs.len(),
            mean_ec = ai.mean_ec,
            "scan complete"
        );

        ai
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 16,
        bytes_per_page: 256,
    };

    fn vid(lnum: u32, sqnum: u64) -> Vid {
        Vid {
            vol_id: 2,
            lnum,
            sqnum,
            ..Default::default()
        }
    }

    #[test]
    fn test_scan() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);

        // Confirm that, on a fresh NAND, every block scans as "erased"
        let blocks = scan_blocks(&mut nand)?;
        assert_eq!(blocks.len(), nand.get_layout().blocks as usize);
        assert!(blocks.iter().all(|x| *x == BlockContent::Erased));

        // Now modify several blocks for various states:
        use BlockContent::*;
        let ec = Ec::default().ec(5);
        let desired_content = [
            Bad,
            Erased,
            EcErased(ec),
            EcData {
                ec,
                vids: vec![],
                bitflips: false,
            },
            Garbage,
            EcData {
                ec,
                vids: vec![Some(vid(0, 1))],
                bitflips: false,
            },
            EcData {
                ec,
                vids: vec![Some(vid(1, 2)), None, Some(vid(2, 3))],
                bitflips: false,
            },
        ];

        let mut buf = vec![0; nand.get_layout().bytes_per_page];
        for (i, content) in desired_content.iter().enumerate() {
            let mut block = nand.block(i as u32)?.unwrap();
            match content {
                Bad => block.mark_bad()?,
                Erased => block.erase()?,
                EcErased(ec) => {
                    ec.encode(&mut buf)?;
                    block.program(0, &buf)?;
                }
                EcData { ec, vids, .. } => {
                    buf.fill(0);
                    ec.encode(&mut buf)?;
                    block.program(0, &buf)?;
                    if !vids.is_empty() {
                        VidPage::encode(vids, &mut buf)?;
                        block.program(1, &buf)?;
                    }
                    buf.fill(0xAA);
                    block.program(i as u32, &buf)?;
                }
                Garbage => {
                    buf.fill(0xAA);
                    block.program(i as u32, &buf)?;
                }
            }
        }

        // Now scan it again
        let blocks = scan_blocks(&mut nand)?;
        assert_eq!(blocks[..desired_content.len()], desired_content);

        Ok(())
    }

    #[test]
    fn test_attach_info() {
        use BlockContent::*;
        let ec = |n| Ec::default().ec(n);

        let ebt: Ebt = vec![
            Bad,
            Erased,
            EcErased(ec(10)),
            // LEB 0, old copy
            EcData {
                ec: ec(20),
                vids: vec![Some(vid(0, 1))],
                bitflips: false,
            },
            // LEB 0, new copy
            EcData {
                ec: ec(30),
                vids: vec![Some(vid(0, 7))],
                bitflips: true,
            },
            // Consolidated: LEB 1 live, LEB 2 superseded below
            EcData {
                ec: ec(40),
                vids: vec![Some(vid(1, 3)), Some(vid(2, 4))],
                bitflips: false,
            },
            EcData {
                ec: ec(20),
                vids: vec![Some(vid(2, 9))],
                bitflips: false,
            },
            Garbage,
        ]
        .into();

        let ai = AttachInfo::from_ebt(&ebt);
        assert_eq!(ai.peb_count, 8);
        assert_eq!(ai.bad_peb_count, 1);
        assert_eq!(ai.mean_ec, 24);
        assert_eq!(ai.max_ec, 40);
        assert_eq!(ai.max_sqnum, 9);
        assert_eq!(ai.free, vec![(2, 10)]);
        assert_eq!(ai.erase, vec![(1, 24), (3, 20), (7, 24)]);

        let used: Vec<_> = ai.used.iter().map(|u| (u.pnum, u.scrub)).collect();
        assert_eq!(used, vec![(4, true), (5, false), (6, false)]);

        assert_eq!(ai.lebs[&LebId::new(2, 0)], LebLocation::new(4, 0));
        assert_eq!(ai.lebs[&LebId::new(2, 1)], LebLocation::new(5, 0));
        assert_eq!(ai.lebs[&LebId::new(2, 2)], LebLocation::new(6, 0));
        assert_eq!(ai.consolidated[&5], vec![Some(LebId::new(2, 1)), None]);
    }
}
