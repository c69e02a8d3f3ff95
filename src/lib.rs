//! `large-sort` is a memory-bounded external merge sort for delimited record streams.
//!
//! External sorting handles data sets that don't fit into main memory. Sorting is achieved in two passes. During
//! the first pass the input is split into bounded batches which are sorted in memory and written to temporary
//! "run" files, during the second pass the runs are merged together into a single sorted output. For more
//! information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `large-sort` supports the following features:
//!
//! * **Record format agnostic:**
//!   records are parsed, serialized and compared by a caller supplied [`RecordCodec`], the library only deals
//!   with delimited text.
//! * **Memory limit support:**
//!   besides the fixed records-per-run limit, process memory is sampled at an adaptive cadence and a run is
//!   flushed early when the memory growth exceeds the configured limit.
//! * **Streaming merge:**
//!   runs are merged lazily record by record, output is written in batches by a background writer with at most
//!   one batch in flight.
//! * **Temporary data cleanup:**
//!   every sort call works in its own temporary directory registered in a [`CleanupRegistry`] which a host can
//!   tear down from its shutdown hook.
//! * **Stable:**
//!   records comparing equal keep their input order.
//!
//! # Example
//!
//! ```no_run
//! use std::convert::Infallible;
//! use std::fs;
//! use std::io;
//!
//! use env_logger;
//! use log;
//!
//! use large_sort::{ExternalSorterBuilder, FnCodec};
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();
//!
//!     let codec = FnCodec::new(
//!         |line: &str| line.trim().parse::<u64>(),
//!         |number: &u64| Ok::<_, Infallible>(number.to_string()),
//!         |a: &u64, b: &u64| a.cmp(b),
//!     );
//!     let sorter = ExternalSorterBuilder::new(codec)
//!         .with_max_records_per_run(1_000_000)
//!         .build()
//!         .unwrap();
//!
//!     let input = fs::File::open("input.txt").unwrap();
//!     let output = io::BufWriter::new(fs::File::create("output.txt").unwrap());
//!     sorter.sort(input, output).unwrap();
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod merge;
pub mod monitor;
pub mod options;
pub mod output;
pub mod run;
pub mod sort;
pub mod tokenizer;
pub mod workspace;

pub use codec::{FnCodec, FromStrCodec, LineCodec, RecordCodec};
pub use merge::{insertion_index, KWayMerger, MergeSource};
pub use monitor::{MemoryMonitor, MemoryProbe, ProcessMemoryProbe};
pub use options::SortOptions;
pub use output::OutputPipeline;
pub use sort::{CodecSortError, ExternalSorter, ExternalSorterBuilder, SortError, SortedRecords};
pub use tokenizer::{ChunkTokenizer, Delimiter, RecordReader};
pub use workspace::{CleanupRegistry, TempWorkspace};
