//! This module implements the on-flash side of UBI: the erase counter ("EC") and volume ID
//! ("VID") headers, where they and the LEB payload live inside a PEB, and scanning a device to
//! find out what every PEB holds.
//!
//! UBI populates the first page of every block with an EC header, and if the block is in use, one
//! VID header per LEB in the second page. A block holding several LEBs ("consolidated") has one VID
//! header per slot; see [io] for the exact layout.

mod headers;
pub mod io;
pub mod scan;

pub use headers::{data_crc, Ec, Vid, VidPage, VolType, EC_HDR_SIZE, VID_HDR_SIZE};
pub use io::{FlashIo, Geometry, NandIo, VidRead};
pub use scan::{scan_blocks, AttachInfo, BlockContent, Ebt, UsedPeb};
