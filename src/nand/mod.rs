//! Abstractions and code to access NAND flash

use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// Errors reported by a NAND device
#[derive(Error, Debug, Clone)]
pub enum NandError {
    #[error("block {0} out of range")]
    OutOfRange(u32),

    #[error("block {0} is marked bad")]
    BadBlock(u32),

    #[error("uncorrectable ECC error reading block {block}, page {page}")]
    Uncorrectable { block: u32, page: u32 },

    #[error("program failed on block {block}, page {page}")]
    ProgramFailed { block: u32, page: u32 },

    #[error("erase failed on block {0}")]
    EraseFailed(u32),

    #[error("torture test failed on block {0}")]
    TortureFailed(u32),

    #[error("device busy")]
    Busy,

    #[error("invalid access: {0}")]
    Misuse(String),

    #[error(transparent)]
    Os(Arc<std::io::Error>),
}

impl From<std::io::Error> for NandError {
    fn from(value: std::io::Error) -> Self {
        Self::Os(Arc::new(value))
    }
}

impl NandError {
    /// Does this error mean the hardware itself failed (as opposed to a transient condition or a
    /// programming mistake)?
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Self::Uncorrectable { .. }
                | Self::ProgramFailed { .. }
                | Self::EraseFailed(_)
                | Self::TortureFailed(_)
        )
    }
}

/// What a successful read found out about the data integrity
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum ReadStatus {
    /// The data was read without any correction
    #[default]
    Clean,

    /// ECC had to correct bit-flips; the data is intact, but the block should be refreshed
    Bitflips,
}

impl ReadStatus {
    /// Combine the status of two reads of the same block
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Clean, Self::Clean) => Self::Clean,
            _ => Self::Bitflips,
        }
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// How many bytes in one eraseblock
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> Result<Option<Self::Block<'_>>, NandError>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> Result<ReadStatus, NandError>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<(), NandError>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> Result<(), NandError>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a (properly in-order) program()
    /// results in error and we have already tried erase() and reprogramming it.
    fn mark_bad(self) -> Result<(), NandError>;
}

/// Faults that can be injected into a [SimNand] block
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SimFault {
    /// Reads succeed but report corrected bit-flips, until the next erase
    Bitflips,

    /// Reads fail with an uncorrectable ECC error, until the next erase
    ReadError,

    /// Like `ReadError`, but only for the given page
    PageReadError(u32),

    /// Every program operation fails
    ProgramError,

    /// Every erase operation fails; the block has gone bad
    EraseError,

    /// The next N erase operations report the device as busy
    Busy(u32),
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// The position of this block on the device
    index: u32,

    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// How many times this block has really been erased
    erase_count: u64,

    /// Injected faults currently active on this block
    faults: Vec<SimFault>,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = (0..layout.blocks)
            .map(|index| SimBlock::new(layout, index))
            .collect();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in self.blocks.iter_mut() {
            block.marked_bad = false;
            block.data.clear();
            read.read_exact(&mut buf)?;
            (&mut *block).program(0, &buf)?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND block out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(0xBD),
                Some(block) => {
                    block.read(0, &mut buf)?;
                }
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Arm a fault on the given block
    pub fn inject(&mut self, block: u32, fault: SimFault) {
        if let Some(block) = self.blocks.get_mut(block as usize) {
            block.faults.push(fault);
        }
    }

    /// Disarm every fault on the given block
    pub fn clear_faults(&mut self, block: u32) {
        if let Some(block) = self.blocks.get_mut(block as usize) {
            block.faults.clear();
        }
    }

    /// How many times the block has actually been erased since the SimNand was created
    pub fn erase_count(&self, block: u32) -> u64 {
        self.blocks
            .get(block as usize)
            .map_or(0, |block| block.erase_count)
    }

    /// Is the block marked bad?
    pub fn is_bad(&self, block: u32) -> bool {
        self.blocks
            .get(block as usize)
            .is_some_and(|block| block.marked_bad)
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout, index: u32) -> Self {
        Self {
            index,
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            erase_count: 0,
            faults: Default::default(),
        }
    }

    fn has_fault(&self, fault: SimFault) -> bool {
        self.faults.contains(&fault)
    }

    fn check_page(&self, index: u32, len: usize) -> Result<usize, NandError> {
        if len != self.page_size {
            return Err(NandError::Misuse("content not page-sized".into()));
        }
        if index >= self.page_count {
            return Err(NandError::Misuse(format!(
                "page {index} out of bounds on block {}",
                self.index
            )));
        }
        Ok(index as usize * self.page_size)
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> Result<(), NandError> {
        let begin = self.check_page(index, content.len())?;

        if begin < self.data.len() {
            return Err(NandError::Misuse(format!(
                "write in already-written area of block {}, page {index}",
                self.index
            )));
        }

        if self.has_fault(SimFault::ProgramError) {
            // A failed program leaves the page in an undefined state; model it as half-written.
            self.data.resize(begin, 0xFF);
            self.data.extend(content.iter().map(|&b| b & 0xF0));
            return Err(NandError::ProgramFailed {
                block: self.index,
                page: index,
            });
        }

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> Result<ReadStatus, NandError> {
        let begin = self.check_page(index, content.len())?;
        let end = begin + self.page_size;

        if self.has_fault(SimFault::ReadError) || self.has_fault(SimFault::PageReadError(index)) {
            return Err(NandError::Uncorrectable {
                block: self.index,
                page: index,
            });
        }

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        if self.has_fault(SimFault::Bitflips) {
            Ok(ReadStatus::Bitflips)
        } else {
            Ok(ReadStatus::Clean)
        }
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> Result<Option<Self::Block<'_>>, NandError> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(NandError::OutOfRange(index))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> Result<ReadStatus, NandError> {
        let mut status = ReadStatus::Clean;
        for (page, chunk) in (start_page..).zip(content.chunks_mut(self.page_size())) {
            status = status.merge(self.read_page(page, chunk)?);
        }
        Ok(status)
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<(), NandError> {
        for (page, chunk) in (start_page..).zip(content.chunks(self.page_size())) {
            self.write_page(page, chunk)?;
        }
        Ok(())
    }

    fn erase(&mut self) -> Result<(), NandError> {
        if let Some(pos) = self
            .faults
            .iter()
            .position(|f| matches!(f, SimFault::Busy(_)))
        {
            if let SimFault::Busy(n) = &mut self.faults[pos] {
                *n -= 1;
                if *n == 0 {
                    self.faults.remove(pos);
                }
            }
            return Err(NandError::Busy);
        }

        if self.has_fault(SimFault::EraseError) {
            return Err(NandError::EraseFailed(self.index));
        }

        self.data.clear();
        self.erase_count += 1;
        self.faults
            .retain(|f| {
                !matches!(
                    f,
                    SimFault::Bitflips | SimFault::ReadError | SimFault::PageReadError(_)
                )
            });

        Ok(())
    }

    fn mark_bad(self) -> Result<(), NandError> {
        self.data.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
    assert!(nand.is_bad(0));
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.get_layout().block_size()];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut page = vec![0u8; TEST_LAYOUT.bytes_per_page];

    nand.inject(1, SimFault::Bitflips);
    let mut block = nand.block(1).unwrap().unwrap();
    assert_eq!(block.read(0, &mut page).unwrap(), ReadStatus::Bitflips);
    block.erase().unwrap();
    assert_eq!(block.read(0, &mut page).unwrap(), ReadStatus::Clean);

    nand.inject(2, SimFault::Busy(2));
    let mut block = nand.block(2).unwrap().unwrap();
    assert!(matches!(block.erase(), Err(NandError::Busy)));
    assert!(matches!(block.erase(), Err(NandError::Busy)));
    block.erase().unwrap();
    assert_eq!(nand.erase_count(2), 1);

    nand.inject(3, SimFault::EraseError);
    let err = nand.block(3).unwrap().unwrap().erase().unwrap_err();
    assert!(err.is_media_error());

    nand.inject(4, SimFault::ReadError);
    let block = nand.block(4).unwrap().unwrap();
    assert!(matches!(
        block.read(0, &mut page),
        Err(NandError::Uncorrectable { block: 4, page: 0 })
    ));
}
