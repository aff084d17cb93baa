//! A UBI-style wear-leveling and block consolidation engine for raw NAND flash
//!
//! The layers, from the bottom up:
//!
//! - [nand]: raw NAND access (simulated, or a Linux MTD device)
//! - [ubi]: EC/VID headers, their placement within a PEB, and scanning
//! - [wl]: the erase counter bookkeeping, the allocator, and the wear-leveling mover
//! - [conso]: packing several LEBs into one PEB
//! - [eba]: the LEB table interface, with an in-memory implementation
//!
//! Background jobs (erases, moves and consolidation) are serialized by [work::WorkQueue].

pub mod config;
pub mod conso;
pub mod eba;
mod error;
pub mod nand;
pub mod ubi;
pub mod wl;
pub mod work;

pub use config::WlConfig;
pub use error::{Error, Result};
pub use wl::{BitflipStatus, BlockStats, Capacity, Ubi, UbiDevice};

/// A physical eraseblock number
pub type Pnum = u32;
