//! objbd: a virtual block device logged to an object store
//!
//! The volume presents an ordinary random-access block interface; behind it,
//! data lives as a log of immutable numbered objects at a backend object
//! store, with a local device acting as write journal and read cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │      Volume      │  writev / readv / flush / aio
//! └──┬─────────┬─────┘
//!    │ writes  │ reads
//! ┌──▼─────────▼─────┐     ┌────────────────┐
//! │   Write cache    │────▶│  Translation   │
//! │  (journal ring)  │     │ (batches, map) │
//! └──┬───────────────┘     └──┬─────────▲───┘
//!    │ misses                 │ objects │ map
//! ┌──▼───────────────┐     ┌──▼─────────┴───┐
//! │    Read cache    │────▶│    Backend     │
//! │  (64 KiB lines)  │     │ (object store) │
//! └──────────────────┘     └────────────────┘
//! ```
//!
//! A write is acknowledged once its journal record is durable on the local
//! device; the payload then flows into a translation batch and eventually
//! into a numbered backend object. A read is served from the journal where
//! it overlaps un-propagated writes, and from the read cache (or a backend
//! fetch) for the rest.

pub mod backend;
pub mod layout;
pub mod nvme;
pub mod objects;
pub mod read_cache;
pub mod translate;
pub mod volume;
pub mod write_cache;

mod wire;

pub use backend::{FileBackend, MemBackend, ObjectBackend};
pub use nvme::NvmeDevice;
pub use read_cache::ReadCache;
pub use translate::{ObjMap, Translate};
pub use volume::Volume;
pub use write_cache::{JournalMiss, WriteCache};
