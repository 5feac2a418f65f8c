//! Record domain model: the one piece of the collector the core treats as an
//! external collaborator (see SPEC_FULL.md §3, §4.2).
//!
//! Everything the collector's core needs from a record is captured by the
//! [`Record`] trait: an id for logging, the original raw bytes, and
//! structural XML/JSON serializers. [`JobUsageRecord`] is the one concrete
//! record type this crate ships.

mod record;

pub use record::{JobUsageRecord, Record, RecordParseError, RecordSerializeError};
