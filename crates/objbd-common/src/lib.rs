//! Shared foundation for objbd
//!
//! Error and result types, configuration, and the sector/page units that
//! every other crate in the workspace speaks.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackendKind, Config};
pub use error::{Error, Result};
pub use types::{
    div_round_up, page_offset, round_up, sector_offset, PageIdx, Sector, OBJBD_MAGIC,
    OBJBD_VERSION, PAGE_SECTORS, PAGE_SIZE, SECTOR_SIZE,
};
