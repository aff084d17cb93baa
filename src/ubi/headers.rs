//! EC and VID header codecs, on top of the raw layouts from `income`.
//!
//! A PEB carries one EC header in its first page and a page of VID headers, one per slot, in its
//! second page ([VidPage]). Every header is sealed with a CRC-32 over everything but the CRC field.

use anyhow::{bail, Context};
use crc::{Crc, CRC_32_JAMCRC};
use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

use crate::nand::PageUtil;

const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// On-flash size of an EC header
pub const EC_HDR_SIZE: usize = 64;

/// On-flash size of a VID header; a consolidated PEB stores one per LEB, back to back
pub const VID_HDR_SIZE: usize = 64;

/// Checksum of a LEB payload, as recorded in `Vid::data_crc`
pub fn data_crc(data: &[u8]) -> u32 {
    UBI_CRC.checksum(data)
}

fn magic(bytes: &[u8]) -> [u8; 4] {
    let mut magic = [0; 4];
    magic.copy_from_slice(&bytes[..4]);
    magic
}

/// Framing shared by the raw `income` headers: version check and CRC sealing
trait RawHeader: Sized + for<'a> DekuContainerRead<'a> + DekuContainerWrite {
    fn version(&self) -> u8;
    fn crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);

    /// CRC of the header bytes, minus the trailing CRC field
    fn compute_crc(&self) -> anyhow::Result<u32> {
        let bytes = self.to_bytes()?;
        let covered = bytes.len() - std::mem::size_of::<u32>();
        Ok(UBI_CRC.checksum(&bytes[..covered]))
    }

    /// Decode a header, rejecting a bad magic, version, or CRC
    fn parse(buf: &[u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;
        if header.version() != UBI_VERSION {
            return None;
        }
        (header.compute_crc().ok()? == header.crc()).then_some(header)
    }

    /// Fix up the CRC and encode into the start of `out`
    fn seal_into(mut self, out: &mut [u8]) -> anyhow::Result<()> {
        let crc = self.compute_crc()?;
        self.set_crc(crc);
        let bytes = self.to_bytes()?;
        out.get_mut(..bytes.len())
            .context("buffer too small for header")?
            .copy_from_slice(&bytes);
        Ok(())
    }
}

impl RawHeader for EcHdr {
    fn version(&self) -> u8 {
        self.version
    }
    fn crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

impl RawHeader for VidHdr {
    fn version(&self) -> u8 {
        self.version
    }
    fn crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// The fields of an EC header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let hdr = EcHdr::parse(bytes)?;
        Some(Self {
            ec: hdr.ec,
            vid_hdr_offset: hdr.vid_hdr_offset,
            data_offset: hdr.data_offset,
            image_seq: hdr.image_seq,
        })
    }

    pub fn encode(self, out: &mut [u8]) -> anyhow::Result<()> {
        EcHdr {
            magic: magic(UBI_EC_HDR_MAGIC),
            version: UBI_VERSION,
            ec: self.ec,
            vid_hdr_offset: self.vid_hdr_offset,
            data_offset: self.data_offset,
            image_seq: self.image_seq,
            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
        }
        .seal_into(out)
    }
}

/// UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// Written in any order; only the bytes actually written are moved
    #[default]
    Dynamic,

    /// Written once; `data_size` and `data_crc` cover the whole payload
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// The fields of a VID header, i.e. the identity of the LEB held in one slot
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    pub vol_type: VolType,

    /// Set when the LEB was copied here by the engine rather than written by its owner
    pub copy_flag: bool,

    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,

    /// Bytes of payload covered by `data_crc`; 0 for a dynamic LEB written in place
    pub data_size: u32,

    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,

    /// Global write sequence number; the higher one wins when two PEBs claim the same LEB
    pub sqnum: u64,
}

impl Vid {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let hdr = VidHdr::parse(bytes)?;
        Some(Self {
            vol_type: hdr.vol_type.try_into().ok()?,
            copy_flag: hdr.copy_flag != 0,
            compat: hdr.compat,
            vol_id: hdr.vol_id,
            lnum: hdr.lnum,
            data_size: hdr.data_size,
            used_ebs: hdr.used_ebs,
            data_pad: hdr.data_pad,
            data_crc: hdr.data_crc,
            sqnum: hdr.sqnum,
        })
    }

    pub fn encode(self, out: &mut [u8]) -> anyhow::Result<()> {
        VidHdr {
            magic: magic(UBI_VID_HDR_MAGIC),
            version: UBI_VERSION,
            vol_type: self.vol_type.into(),
            copy_flag: self.copy_flag.into(),
            compat: self.compat,
            vol_id: self.vol_id,
            lnum: self.lnum,
            data_size: self.data_size,
            used_ebs: self.used_ebs,
            data_pad: self.data_pad,
            data_crc: self.data_crc,
            sqnum: self.sqnum,
            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        }
        .seal_into(out)
    }
}

/// The decoded VID header page of a PEB
///
/// `slots[i]` describes slot `i`; an erased header leaves its slot empty. Trailing empty slots are
/// dropped, so a single-LEB PEB decodes to exactly one slot.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct VidPage {
    pub slots: Vec<Option<Vid>>,

    /// Slots whose header is neither erased nor valid
    pub corrupt: Vec<usize>,
}

impl VidPage {
    pub fn decode(page: &[u8]) -> Self {
        let mut decoded = Self::default();
        for (slot, chunk) in page.chunks_exact(VID_HDR_SIZE).enumerate() {
            if chunk.is_erased() {
                decoded.slots.push(None);
                continue;
            }
            let vid = Vid::decode(chunk);
            if vid.is_none() {
                decoded.corrupt.push(slot);
            }
            decoded.slots.push(vid);
        }

        while decoded.slots.last().is_some_and(Option::is_none) {
            decoded.slots.pop();
        }
        decoded
    }

    /// Encode one header per slot into an erased page; `None` leaves that slot's header erased
    pub fn encode(hdrs: &[Option<Vid>], page: &mut [u8]) -> anyhow::Result<()> {
        let max = page.len() / VID_HDR_SIZE;
        if hdrs.len() > max {
            bail!("{} VID headers do not fit in a page of {max}", hdrs.len());
        }

        page.fill(0xFF);
        for (hdr, chunk) in hdrs.iter().zip(page.chunks_exact_mut(VID_HDR_SIZE)) {
            if let Some(hdr) = hdr {
                hdr.encode(chunk)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn vid(lnum: u32, sqnum: u64) -> Vid {
        Vid {
            vol_id: 3,
            lnum,
            sqnum,
            ..Default::default()
        }
    }

    #[test]
    fn test_header_sizes() -> anyhow::Result<()> {
        let mut buf = vec![0u8; 256];
        Ec::default().ec(77).encode(&mut buf)?;
        assert_eq!(Ec::decode(&buf).map(|ec| ec.ec), Some(77));
        assert!(buf[EC_HDR_SIZE..].iter().all(|&b| b == 0));

        buf.fill(0);
        let static_vid = Vid {
            vol_type: VolType::Static,
            copy_flag: true,
            data_size: 100,
            used_ebs: 4,
            ..vid(9, 1234)
        };
        static_vid.encode(&mut buf)?;
        assert_eq!(Vid::decode(&buf), Some(static_vid));
        assert!(buf[VID_HDR_SIZE..].iter().all(|&b| b == 0));

        assert!(Ec::default().encode(&mut [0u8; 16]).is_err());
        Ok(())
    }

    #[test]
    fn test_corrupt_header_rejected() -> anyhow::Result<()> {
        let mut buf = vec![0u8; VID_HDR_SIZE];
        vid(0, 5).encode(&mut buf)?;
        buf[12] ^= 0x01;
        assert_eq!(Vid::decode(&buf), None);

        assert_eq!(Ec::decode(&[0xFF; EC_HDR_SIZE]), None);
        Ok(())
    }

    #[test]
    fn test_vid_page() -> anyhow::Result<()> {
        let mut page = vec![0u8; 256];
        VidPage::encode(&[Some(vid(0, 1)), None, Some(vid(2, 3))], &mut page)?;
        assert!(page[3 * VID_HDR_SIZE..].is_erased());

        let decoded = VidPage::decode(&page);
        assert_eq!(decoded.slots, vec![Some(vid(0, 1)), None, Some(vid(2, 3))]);
        assert!(decoded.corrupt.is_empty());

        // A damaged slot is reported, the others still decode
        page[VID_HDR_SIZE * 2 + 20] ^= 0x10;
        let decoded = VidPage::decode(&page);
        assert_eq!(decoded.slots, vec![Some(vid(0, 1))]);
        assert_eq!(decoded.corrupt, vec![2]);

        assert_eq!(VidPage::decode(&[0xFF; 256]), VidPage::default());
        assert!(VidPage::encode(&[None; 5], &mut page).is_err());
        Ok(())
    }
}
