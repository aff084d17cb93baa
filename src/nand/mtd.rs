//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{Nand, NandBlock, NandError, NandLayout, ReadStatus};

use anyhow::bail;
use nix::errno::Errno;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Snapshot the driver's cumulative ECC counters
    fn ecc_stats(&self) -> Result<ioctl::mtd_ecc_stats, NandError> {
        let stats = unsafe {
            let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
            ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr()).map_err(errno_to_nand)?;
            stats.assume_init()
        };
        Ok(stats)
    }
}

/// Translate a failed ioctl into the closest NAND error
fn errno_to_nand(errno: Errno) -> NandError {
    match errno {
        Errno::EBUSY | Errno::EAGAIN | Errno::EINTR => NandError::Busy,
        other => std::io::Error::from(other).into(),
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> Result<Option<MtdBlock<'_>>, NandError> {
        if index >= self.layout.blocks {
            return Err(NandError::OutOfRange(index));
        }

        let block_base: u64 = self.layout.block_size() as u64 * index as u64;
        let bad = unsafe {
            ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base).map_err(errno_to_nand)?
        };
        if bad == 0 {
            Ok(Some(MtdBlock { nand: self, index }))
        } else {
            Ok(None)
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    /// Compute the number of bytes in this block
    fn size(&self) -> u64 {
        self.nand.layout.block_size() as u64
    }

    /// Compute the offset of the first byte of this block
    fn base(&self) -> u64 {
        self.size() * self.index as u64
    }

    /// Ensure that the byte count and starting page range is valid, and compute the /dev/mtdX
    /// offset for the page
    fn offset_for(&self, start_page: u32, bytes: usize) -> Result<u64, NandError> {
        if bytes % self.page_size() != 0 {
            return Err(NandError::Misuse("buffer not multiple of page size".into()));
        }

        let end_page = start_page + (bytes / self.page_size()) as u32;
        if end_page > self.page_count() {
            return Err(NandError::Misuse(format!(
                "block {0}, page range {start_page}..{end_page} out of bounds",
                self.index
            )));
        }

        Ok(self.base() + self.page_size() as u64 * start_page as u64)
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }
    fn read(&self, start_page: u32, content: &mut [u8]) -> Result<ReadStatus, NandError> {
        let offset = self.offset_for(start_page, content.len())?;

        // mtdchar hides ECC results from read(), so compare the counters around it.
        let before = self.nand.ecc_stats()?;
        self.nand.file.read_exact_at(content, offset)?;
        let after = self.nand.ecc_stats()?;

        if after.failed != before.failed {
            Err(NandError::Uncorrectable {
                block: self.index,
                page: start_page,
            })
        } else if after.corrected != before.corrected {
            Ok(ReadStatus::Bitflips)
        } else {
            Ok(ReadStatus::Clean)
        }
    }
    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<(), NandError> {
        let offset = self.offset_for(start_page, content.len())?;
        self.nand
            .file
            .write_all_at(content, offset)
            .map_err(|err| match err.raw_os_error() {
                Some(code) if code == Errno::EIO as i32 => NandError::ProgramFailed {
                    block: self.index,
                    page: start_page,
                },
                _ => err.into(),
            })
    }
    fn erase(&mut self) -> Result<(), NandError> {
        let erase_info = ioctl::erase_info_user {
            start: self.base() as u32,
            length: self.size() as u32,
        };
        unsafe { ioctl::memerase(self.nand.file.as_raw_fd(), &erase_info) }.map_err(
            |errno| match errno {
                Errno::EIO => NandError::EraseFailed(self.index),
                other => errno_to_nand(other),
            },
        )?;
        Ok(())
    }
    fn mark_bad(self) -> Result<(), NandError> {
        let block_base: u64 = self.base();
        unsafe {
            ioctl::memsetbadblock(self.nand.file.as_raw_fd(), &block_base).map_err(errno_to_nand)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<NandLayout> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);
}
