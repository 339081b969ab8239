#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

mod cache;
mod cli;
pub mod constants;
mod error;
mod export;
pub mod heapdump;
pub mod index;
mod listener;
pub mod provider;
mod sanity;
mod thread_report;

pub use crate::cache::{ImageCache, SharedCache, SharedImage};
pub use crate::cli::{Args, Commands, ExportArgs, RootsChoice};
pub use crate::error::{is_cancelled, Cancelled};
pub use crate::export::export;
pub use crate::heapdump::{HeapDump, ProtoImage};
pub use crate::index::{
    CollectingSink, IndexBuilder, IndexPolicy, IndexSink, PreliminaryIndex, PurgeStats,
};
pub use crate::listener::{LogListener, ProgressListener, Severity};
pub use crate::sanity::{purge_mapping, sanity_trace};
