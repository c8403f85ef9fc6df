//! Output coordination: section buckets and addresses, linker-materialized
//! symbols, dynamic-table bookkeeping, the fixup walk, and image writers.

pub mod dynamic;
pub mod fixup;
pub mod layout;
pub mod synth;
pub mod writer;
