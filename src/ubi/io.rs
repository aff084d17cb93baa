//! The lower I/O layer: places EC headers, VID headers and LEB payload inside a PEB.
//!
//! Every PEB uses the same layout:
//!
//! ```text
//! +---------+--------------------------+--------+--------+-----+
//! | page 0  | page 1                   | slot 0 | slot 1 | ... |
//! | EC hdr  | VID hdr 0, VID hdr 1,... | (LEB)  | (LEB)  |     |
//! +---------+--------------------------+--------+--------+-----+
//! ```
//!
//! A PEB holding a single LEB only has one VID header and uses slot 0. A consolidated PEB has one
//! VID header per slot, in slot order; an erased header marks an empty slot.

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::headers::{Ec, Vid, VidPage, VID_HDR_SIZE};
use super::scan::{scan_blocks, Ebt};
use crate::nand::{Nand, NandBlock, NandError, NandLayout, PageUtil, ReadStatus};
use crate::{Error, Pnum, Result};

/// Bit patterns written and verified while torturing a PEB
const TORTURE_PATTERNS: [u8; 3] = [0xA5, 0x5A, 0x00];

/// Where things live inside a PEB
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    /// Number of PEBs on the device, bad ones included
    pub peb_count: u32,

    /// Bytes per PEB
    pub peb_size: usize,

    /// Bytes per page; the minimum unit of I/O
    pub page_size: usize,

    /// Offset of the first VID header
    pub vid_hdr_offset: usize,

    /// Offset of slot 0
    pub leb_start: usize,
}

impl Geometry {
    pub fn from_layout(layout: NandLayout) -> Self {
        Self {
            peb_count: layout.blocks,
            peb_size: layout.block_size(),
            page_size: layout.bytes_per_page,
            vid_hdr_offset: layout.bytes_per_page,
            leb_start: layout.bytes_per_page * 2,
        }
    }

    /// How many VID headers fit in the VID header page
    pub fn max_slots(&self) -> usize {
        self.page_size / VID_HDR_SIZE
    }

    /// Size of one LEB when `lebs_per_cpeb` of them share a PEB, rounded down to whole pages
    pub fn leb_size(&self, lebs_per_cpeb: usize) -> usize {
        let per_slot = (self.peb_size - self.leb_start) / lebs_per_cpeb.max(1);
        per_slot - per_slot % self.page_size
    }

    /// Offset of the given slot
    pub fn slot_offset(&self, slot: usize, lebs_per_cpeb: usize) -> usize {
        self.leb_start + slot * self.leb_size(lebs_per_cpeb)
    }
}

/// The result of reading the VID header area of a PEB
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum VidRead {
    /// At least one VID header is present; `slots[i]` describes slot `i`
    Headers {
        slots: Vec<Option<Vid>>,
        bitflips: bool,
    },

    /// The VID header area is erased: the PEB was handed out but never written
    Empty { bitflips: bool },
}

/// Everything the engine needs from the flash
pub trait FlashIo: Send + Sync {
    fn geometry(&self) -> Geometry;

    /// Read the EC header; `None` if the page is erased
    fn read_ec(&self, pnum: Pnum) -> Result<Option<Ec>>;

    /// Write the EC header of a freshly erased PEB
    fn write_ec(&self, pnum: Pnum, ec: u64) -> Result<()>;

    fn read_vid_hdrs(&self, pnum: Pnum) -> Result<VidRead>;

    /// Write VID headers, one per slot; `None` leaves a slot's header erased
    fn write_vid_hdrs(&self, pnum: Pnum, hdrs: &[Option<Vid>]) -> Result<()>;

    /// Read `len` bytes at `offset` (from the start of the PEB)
    fn read_payload(&self, pnum: Pnum, offset: usize, len: usize) -> Result<(Bytes, ReadStatus)>;

    /// Write bytes at a page-aligned `offset` (from the start of the PEB)
    fn write_payload(&self, pnum: Pnum, offset: usize, data: &[u8]) -> Result<()>;

    /// Write the VID headers and the payload of every slot in one go
    fn write_peb(&self, pnum: Pnum, hdrs: &[Option<Vid>], payload: &[u8]) -> Result<()> {
        self.write_vid_hdrs(pnum, hdrs)?;
        if !payload.is_empty() {
            self.write_payload(pnum, self.geometry().leb_start, payload)?;
        }
        Ok(())
    }

    /// Erase a PEB, optionally torture-testing it first; returns how many erase cycles were spent
    fn erase_block(&self, pnum: Pnum, torture: bool) -> Result<u32>;

    fn mark_block_bad(&self, pnum: Pnum) -> Result<()>;

    /// Fail with [Error::NotErased] unless the range reads back as all-0xFF
    fn check_all_erased(&self, pnum: Pnum, offset: usize, len: usize) -> Result<()> {
        let (data, _) = self.read_payload(pnum, offset, len)?;
        if data.is_erased() {
            Ok(())
        } else {
            Err(Error::NotErased(pnum))
        }
    }
}

/// [FlashIo] over any [Nand]
#[derive(Debug)]
pub struct NandIo<N> {
    nand: Mutex<N>,
    geometry: Geometry,
    image_seq: u32,
}

impl<N: Nand> NandIo<N> {
    pub fn new(nand: N) -> Self {
        let geometry = Geometry::from_layout(nand.get_layout());
        Self {
            nand: Mutex::new(nand),
            geometry,
            image_seq: 0,
        }
    }

    /// Set the image sequence number stamped into every EC header
    pub fn image_seq(mut self, image_seq: u32) -> Self {
        self.image_seq = image_seq;
        self
    }

    /// Direct access to the NAND, e.g. to inject faults into a [crate::nand::SimNand]
    pub fn nand(&self) -> MutexGuard<'_, N> {
        self.nand.lock()
    }

    pub fn into_inner(self) -> N {
        self.nand.into_inner()
    }

    /// Scan every block of the NAND
    pub fn scan(&self) -> anyhow::Result<Ebt> {
        scan_blocks(&mut *self.nand.lock())
    }

    fn block(nand: &mut N, pnum: Pnum) -> Result<N::Block<'_>> {
        Ok(nand.block(pnum)?.ok_or(NandError::BadBlock(pnum))?)
    }

    /// Compute the page range covering `offset..offset + len`
    fn page_span(&self, offset: usize, len: usize) -> Result<(u32, usize)> {
        let page_size = self.geometry.page_size;
        if offset + len > self.geometry.peb_size {
            return Err(Error::Invalid(format!(
                "range {offset}+{len} beyond PEB size {}",
                self.geometry.peb_size
            )));
        }
        let first = offset / page_size;
        let last = (offset + len).div_ceil(page_size);
        Ok((first as u32, (last - first) * page_size))
    }
}

impl<N: Nand + Send> FlashIo for NandIo<N> {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read_ec(&self, pnum: Pnum) -> Result<Option<Ec>> {
        let mut nand = self.nand.lock();
        let block = Self::block(&mut nand, pnum)?;

        let mut page = vec![0; self.geometry.page_size];
        block.read(0, &mut page)?;
        if page.is_erased() {
            return Ok(None);
        }
        Ec::decode(&page)
            .map(Some)
            .ok_or(Error::CorruptHeader(pnum))
    }

    fn write_ec(&self, pnum: Pnum, ec: u64) -> Result<()> {
        let hdr = Ec {
            ec,
            vid_hdr_offset: self.geometry.vid_hdr_offset as u32,
            data_offset: self.geometry.leb_start as u32,
            image_seq: self.image_seq,
        };
        let mut page = vec![0; self.geometry.page_size];
        hdr.encode(&mut page)
            .map_err(|err| Error::Invalid(err.to_string()))?;

        let mut nand = self.nand.lock();
        let mut block = Self::block(&mut nand, pnum)?;
        block.program(0, &page)?;
        Ok(())
    }

    fn read_vid_hdrs(&self, pnum: Pnum) -> Result<VidRead> {
        let mut nand = self.nand.lock();
        let block = Self::block(&mut nand, pnum)?;

        let mut page = vec![0; self.geometry.page_size];
        let bitflips = block.read(1, &mut page)? == ReadStatus::Bitflips;
        if page.is_erased() {
            return Ok(VidRead::Empty { bitflips });
        }

        let decoded = VidPage::decode(&page);
        if let Some(&slot) = decoded.corrupt.first() {
            warn!(pnum, slot, "corrupt VID header");
            return Err(Error::CorruptHeader(pnum));
        }
        Ok(VidRead::Headers {
            slots: decoded.slots,
            bitflips,
        })
    }

    fn write_vid_hdrs(&self, pnum: Pnum, hdrs: &[Option<Vid>]) -> Result<()> {
        let mut page = vec![0xFF; self.geometry.page_size];
        VidPage::encode(hdrs, &mut page).map_err(|err| Error::Invalid(err.to_string()))?;

        let mut nand = self.nand.lock();
        let mut block = Self::block(&mut nand, pnum)?;
        block.program(1, &page)?;
        Ok(())
    }

    fn read_payload(&self, pnum: Pnum, offset: usize, len: usize) -> Result<(Bytes, ReadStatus)> {
        let (first_page, span) = self.page_span(offset, len)?;

        let mut buf = BytesMut::zeroed(span);
        let status = {
            let mut nand = self.nand.lock();
            let block = Self::block(&mut nand, pnum)?;
            block.read(first_page, &mut buf)?
        };

        buf.advance(offset - first_page as usize * self.geometry.page_size);
        buf.truncate(len);
        Ok((buf.freeze(), status))
    }

    fn write_payload(&self, pnum: Pnum, offset: usize, data: &[u8]) -> Result<()> {
        if offset % self.geometry.page_size != 0 || offset < self.geometry.leb_start {
            return Err(Error::Invalid(format!(
                "payload offset {offset} not a data page"
            )));
        }
        let (first_page, span) = self.page_span(offset, data.len())?;

        let mut buf = BytesMut::with_capacity(span);
        buf.extend_from_slice(data);
        buf.resize(span, 0xFF);

        let mut nand = self.nand.lock();
        let mut block = Self::block(&mut nand, pnum)?;
        block.program(first_page, &buf)?;
        Ok(())
    }

    fn erase_block(&self, pnum: Pnum, torture: bool) -> Result<u32> {
        let mut nand = self.nand.lock();
        let mut block = Self::block(&mut nand, pnum)?;

        block.erase()?;
        let mut cycles = 1;

        if torture {
            debug!(pnum, "torture-testing PEB");
            let mut readback = vec![0; self.geometry.peb_size];
            for pattern in TORTURE_PATTERNS {
                let content = vec![pattern; self.geometry.peb_size];
                block.program(0, &content)?;
                let status = block.read(0, &mut readback)?;
                if status == ReadStatus::Bitflips || readback != content {
                    warn!(pnum, pattern, "torture test failed");
                    return Err(NandError::TortureFailed(pnum).into());
                }
                block.erase()?;
                cycles += 1;
            }
        }

        Ok(cycles)
    }

    fn mark_block_bad(&self, pnum: Pnum) -> Result<()> {
        let mut nand = self.nand.lock();
        if let Some(block) = nand.block(pnum)? {
            block.mark_bad()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{SimFault, SimNand};
    use crate::ubi::VolType;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 16,
        bytes_per_page: 256,
    };

    fn vid(lnum: u32) -> Vid {
        Vid {
            vol_type: VolType::Dynamic,
            vol_id: 1,
            lnum,
            sqnum: u64::from(lnum) + 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_geometry() {
        let geometry = Geometry::from_layout(TEST_LAYOUT);
        assert_eq!(geometry.leb_start, 512);
        assert_eq!(geometry.leb_size(1), 14 * 256);
        assert_eq!(geometry.leb_size(2), 7 * 256);
        assert_eq!(geometry.leb_size(3), 4 * 256);
        assert_eq!(geometry.slot_offset(1, 2), 512 + 7 * 256);
        assert_eq!(geometry.max_slots(), 4);
    }

    #[test]
    fn test_headers_and_payload() -> anyhow::Result<()> {
        let io = NandIo::new(SimNand::new(TEST_LAYOUT));
        let geometry = io.geometry();

        assert_eq!(io.read_ec(0)?, None);
        io.write_ec(0, 42)?;
        assert_eq!(io.read_ec(0)?.map(|ec| ec.ec), Some(42));
        assert_eq!(io.read_vid_hdrs(0)?, VidRead::Empty { bitflips: false });
        io.check_all_erased(0, geometry.vid_hdr_offset, geometry.peb_size - 256)?;

        let payload = vec![0x11u8; geometry.leb_size(2) * 2];
        io.write_peb(0, &[Some(vid(3)), None, Some(vid(4))], &payload)?;

        let VidRead::Headers { slots, bitflips } = io.read_vid_hdrs(0)? else {
            panic!("expected headers");
        };
        assert!(!bitflips);
        assert_eq!(slots, vec![Some(vid(3)), None, Some(vid(4))]);

        let (data, status) = io.read_payload(0, geometry.slot_offset(1, 2) + 3, 5)?;
        assert_eq!(status, ReadStatus::Clean);
        assert_eq!(&data[..], &[0x11; 5]);

        assert!(matches!(
            io.check_all_erased(0, geometry.vid_hdr_offset, 256),
            Err(Error::NotErased(0))
        ));

        Ok(())
    }

    #[test]
    fn test_erase_and_torture() -> anyhow::Result<()> {
        let io = NandIo::new(SimNand::new(TEST_LAYOUT));

        io.write_ec(1, 7)?;
        assert_eq!(io.erase_block(1, false)?, 1);
        assert_eq!(io.read_ec(1)?, None);

        assert_eq!(io.erase_block(1, true)?, 4);
        assert_eq!(io.nand().erase_count(1), 5);

        io.nand().inject(2, SimFault::ProgramError);
        let err = io.erase_block(2, true).unwrap_err();
        assert!(err.is_hard_io());

        io.nand().inject(3, SimFault::EraseError);
        assert!(io.erase_block(3, false).unwrap_err().is_hard_io());

        io.mark_block_bad(3)?;
        assert!(io.nand().is_bad(3));
        assert!(matches!(
            io.read_ec(3),
            Err(Error::Nand(NandError::BadBlock(3)))
        ));

        Ok(())
    }

    #[test]
    fn test_corrupt_vid_header() -> anyhow::Result<()> {
        let io = NandIo::new(SimNand::new(TEST_LAYOUT));
        io.write_ec(4, 0)?;
        io.write_payload(4, 512, &[0u8; 16])?;
        assert_eq!(io.read_vid_hdrs(4)?, VidRead::Empty { bitflips: false });

        let io = NandIo::new(SimNand::new(TEST_LAYOUT));
        io.write_ec(4, 0)?;
        {
            let mut nand = io.nand();
            let mut block = nand.block(4)?.unwrap();
            block.program(1, &[0x42u8; 256])?;
        }
        assert!(matches!(io.read_vid_hdrs(4), Err(Error::CorruptHeader(4))));

        Ok(())
    }
}
