//! Sorter options loadable from host configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::output::DEFAULT_OUTPUT_BUFFER_SIZE;
use crate::tokenizer::DEFAULT_READ_CHUNK_SIZE;

/// Default number of records per run.
pub const DEFAULT_MAX_RECORDS_PER_RUN: usize = 100_000;
/// Default memory growth allowed during the split stage.
pub const DEFAULT_MEMORY_LIMIT: u64 = bytesize::GIB;
/// Default record delimiter.
pub const DEFAULT_DELIMITER: &str = "\n";

/// Sorter options. Every field falls back to its default when missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortOptions {
    /// Temporary directory root. The OS temporary directory is used if not set.
    pub tmp_dir: Option<PathBuf>,
    /// Maximum number of records in a single run.
    pub max_records_per_run: usize,
    /// Process memory growth (bytes) after which a run is flushed early.
    pub memory_limit: u64,
    /// Output batch size (bytes).
    pub output_buffer_size: u64,
    /// Read chunk size (bytes) used for the input and the runs.
    pub rw_buf_size: usize,
    /// Literal input record delimiter.
    pub input_delimiter: String,
    /// Input record delimiter pattern (regular expression), used instead of `input_delimiter` when set.
    pub input_delimiter_pattern: Option<String>,
    /// Output record delimiter.
    pub output_delimiter: String,
}

impl Default for SortOptions {
    fn default() -> Self {
        SortOptions {
            tmp_dir: None,
            max_records_per_run: DEFAULT_MAX_RECORDS_PER_RUN,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            rw_buf_size: DEFAULT_READ_CHUNK_SIZE,
            input_delimiter: DEFAULT_DELIMITER.to_string(),
            input_delimiter_pattern: None,
            output_delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::SortOptions;

    #[test]
    fn test_defaults() {
        let options = SortOptions::default();
        assert_eq!(options.max_records_per_run, 100_000);
        assert_eq!(options.memory_limit, 1 << 30);
        assert_eq!(options.output_buffer_size, 7_500_000);
        assert_eq!(options.input_delimiter, "\n");
        assert_eq!(options.input_delimiter_pattern, None);
    }

    #[test]
    fn test_partial_config() {
        let options: SortOptions =
            serde_json::from_str(r#"{"tmp_dir": "/var/tmp", "max_records_per_run": 3, "input_delimiter_pattern": "\\r?\\n", "output_delimiter": "\r\n"}"#)
                .unwrap();

        assert_eq!(options.tmp_dir, Some(PathBuf::from("/var/tmp")));
        assert_eq!(options.max_records_per_run, 3);
        assert_eq!(options.input_delimiter_pattern.as_deref(), Some(r"\r?\n"));
        assert_eq!(options.output_delimiter, "\r\n");
        assert_eq!(options.memory_limit, SortOptions::default().memory_limit);
    }
}
