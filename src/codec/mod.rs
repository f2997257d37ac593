//! Record codec.
//!
//! - [`record`]: schema-driven fixed-header records with a free tail
//! - [`frame`]: the transport-internal record kinds built on top of it

pub mod frame;
pub mod record;

pub use frame::{
    clear_prefix, core_kind, split_fragments, ClusterBuilder, ClusterEntries, CoreKind,
    CoreRecord,
};
pub use record::{FieldSpec, Record, RecordBuilder, RecordSchema};
