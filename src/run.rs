//! Sorted runs.
//!
//! The split stage accumulates parsed records in a [`RunBuffer`], sorts every full batch and persists it as a run
//! file inside the sort workspace. Each serialized record is followed by the delimiter, so a run always ends with one.

use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use crate::buffer::RunBuffer;
use crate::codec::RecordCodec;
use crate::merge::MergeSource;
use crate::monitor::MemoryProbe;
use crate::sort::{serialize_record, CodecSortError, SortError};
use crate::tokenizer::Delimiter;
use crate::workspace::TempWorkspace;

/// Sorted run persisted on the file system.
#[derive(Debug, Clone)]
pub struct Run {
    path: PathBuf,
    records: usize,
}

impl Run {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the run.
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Opens the run for merging. The run file is deleted once the merge exhausts it.
    pub fn open(&self, delimiter: &str, chunk_size: usize) -> io::Result<MergeSource<fs::File>> {
        let file = fs::File::open(&self.path)?;
        return Ok(MergeSource::run(
            file,
            Delimiter::from(delimiter),
            chunk_size,
            self.path.clone(),
        ));
    }
}

/// Result of the split stage.
pub enum SplitOutcome<T> {
    /// The whole input fit into a single batch, sorted in memory. No run was written.
    InMemory(Vec<T>),
    /// Runs written to the workspace, in creation order.
    Runs(Vec<Run>),
}

/// Split stage run writer.
pub struct RunWriter<'a, C: RecordCodec, P: MemoryProbe> {
    codec: &'a C,
    workspace: &'a TempWorkspace,
    delimiter: &'a str,
    rw_buf_size: Option<usize>,
    buffer: RunBuffer<C::Record, P>,
    runs: Vec<Run>,
    records_total: usize,
}

impl<'a, C: RecordCodec, P: MemoryProbe> RunWriter<'a, C, P> {
    /// Creates a run writer.
    ///
    /// # Arguments
    /// * `codec` - Codec used to sort and serialize records
    /// * `workspace` - Workspace the runs are created in
    /// * `delimiter` - Delimiter following every serialized record
    /// * `rw_buf_size` - Run file write buffer size
    /// * `buffer` - Batch buffer deciding when a run is flushed
    pub fn new(
        codec: &'a C,
        workspace: &'a TempWorkspace,
        delimiter: &'a str,
        rw_buf_size: Option<usize>,
        buffer: RunBuffer<C::Record, P>,
    ) -> Self {
        RunWriter {
            codec,
            workspace,
            delimiter,
            rw_buf_size,
            buffer,
            runs: Vec::new(),
            records_total: 0,
        }
    }

    /// Adds a record, flushing the current batch to a new run once it is full.
    pub fn push(&mut self, record: C::Record) -> Result<(), CodecSortError<C>> {
        self.buffer.push(record);
        if self.buffer.is_full() {
            self.flush()?;
        }

        return Ok(());
    }

    /// Flushes the remaining records.
    /// If no run has been written yet the remaining batch is sorted and returned in memory instead.
    pub fn finish(mut self) -> Result<SplitOutcome<C::Record>, CodecSortError<C>> {
        if self.runs.is_empty() {
            let mut items = self.buffer.take();
            log::debug!("input fits into a single batch ({} records), sorting in memory", items.len());
            items.sort_by(|a, b| self.codec.compare(a, b));
            return Ok(SplitOutcome::InMemory(items));
        }

        if !self.buffer.is_empty() {
            self.flush()?;
        }
        log::debug!(
            "external sort preparation done ({} records in {} runs)",
            self.records_total,
            self.runs.len()
        );

        return Ok(SplitOutcome::Runs(self.runs));
    }

    fn flush(&mut self) -> Result<(), CodecSortError<C>> {
        let mut items = self.buffer.take();
        let codec = self.codec;

        log::debug!("sorting run data ({} records) ...", items.len());
        items.sort_by(|a, b| codec.compare(a, b));

        self.records_total += items.len();
        let path = self.workspace.run_path(self.records_total);
        log::debug!("saving run data to {}", path.display());

        self.dump(&path, &items)?;
        let run = Run {
            path,
            records: items.len(),
        };
        drop(items);

        self.buffer.rebaseline();
        self.runs.push(run);

        return Ok(());
    }

    fn dump(&self, path: &Path, items: &[C::Record]) -> Result<(), CodecSortError<C>> {
        let run_file = fs::File::create(path).map_err(SortError::IO)?;
        let mut run_writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, run_file),
            None => io::BufWriter::new(run_file),
        };

        for item in items {
            let line = serialize_record(self.codec, item, self.delimiter)?;
            run_writer.write_all(line.as_bytes()).map_err(SortError::IO)?;
            run_writer.write_all(self.delimiter.as_bytes()).map_err(SortError::IO)?;
        }
        run_writer.flush().map_err(SortError::IO)?;

        return Ok(());
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::sync::Arc;

    use rstest::*;

    use super::{RunWriter, SplitOutcome};
    use crate::buffer::RunBuffer;
    use crate::codec::{FnCodec, FromStrCodec, LineCodec};
    use crate::monitor::test::ScriptedProbe;
    use crate::monitor::MemoryMonitor;
    use crate::sort::SortError;
    use crate::workspace::{CleanupRegistry, TempWorkspace};

    #[fixture]
    fn workspace() -> TempWorkspace {
        TempWorkspace::create(None, Arc::new(CleanupRegistry::new())).unwrap()
    }

    fn buffer<T>(limit: usize) -> RunBuffer<T, ScriptedProbe> {
        RunBuffer::new(limit, MemoryMonitor::new(ScriptedProbe::new(0), u64::MAX, limit))
    }

    #[rstest]
    fn test_runs_are_sorted_and_delimited(workspace: TempWorkspace) {
        let codec: FromStrCodec<i64> = FromStrCodec::new();
        let mut writer = RunWriter::new(&codec, &workspace, "\n", None, buffer(2));
        for item in [5, 3, 10, 1] {
            writer.push(item).unwrap();
        }

        let runs = match writer.finish().unwrap() {
            SplitOutcome::Runs(runs) => runs,
            SplitOutcome::InMemory(_) => panic!("expected runs"),
        };
        assert_eq!(runs.len(), 2);
        assert_eq!(fs::read_to_string(runs[0].path()).unwrap(), "3\n5\n");
        assert_eq!(fs::read_to_string(runs[1].path()).unwrap(), "1\n10\n");
        assert_eq!(runs[0].path().file_name().unwrap(), "large-sort_0000000002.txt");
        assert_eq!(runs[1].path().file_name().unwrap(), "large-sort_0000000004.txt");
    }

    #[rstest]
    fn test_remainder_is_flushed(workspace: TempWorkspace) {
        let codec: FromStrCodec<i64> = FromStrCodec::new();
        let mut writer = RunWriter::new(&codec, &workspace, ";", Some(16), buffer(3));
        for item in (0..10).rev() {
            writer.push(item).unwrap();
        }

        let runs = match writer.finish().unwrap() {
            SplitOutcome::Runs(runs) => runs,
            SplitOutcome::InMemory(_) => panic!("expected runs"),
        };
        assert_eq!(runs.iter().map(|run| run.len()).collect::<Vec<_>>(), vec![3, 3, 3, 1]);
        assert_eq!(fs::read_to_string(runs[3].path()).unwrap(), "0;");
    }

    #[rstest]
    fn test_single_batch_stays_in_memory(workspace: TempWorkspace) {
        let codec: FromStrCodec<i64> = FromStrCodec::new();
        let mut writer = RunWriter::new(&codec, &workspace, "\n", None, buffer(10));
        for item in [2, 9, 4] {
            writer.push(item).unwrap();
        }

        match writer.finish().unwrap() {
            SplitOutcome::InMemory(items) => assert_eq!(items, vec![2, 4, 9]),
            SplitOutcome::Runs(_) => panic!("expected in-memory batch"),
        }
        assert_eq!(fs::read_dir(workspace.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_serialization_error_is_fatal(workspace: TempWorkspace) {
        let codec = FnCodec::new(
            |s: &str| s.parse::<i64>(),
            |n: &i64| {
                if *n < 0 {
                    Err(std::fmt::Error)
                } else {
                    Ok(n.to_string())
                }
            },
            |a: &i64, b: &i64| a.cmp(b),
        );
        let mut writer = RunWriter::new(&codec, &workspace, "\n", None, buffer(2));
        writer.push(1).unwrap();

        let result = writer.push(-1);
        assert!(matches!(result, Err(SortError::SerializationError(_))));
    }

    #[rstest]
    fn test_embedded_delimiter_is_fatal(workspace: TempWorkspace) {
        let mut writer = RunWriter::new(&LineCodec, &workspace, "\n", None, buffer(1));

        let result = writer.push("two\nlines".to_string());
        assert!(matches!(result, Err(SortError::EmbeddedDelimiter(record)) if record == "two\nlines"));
    }
}
