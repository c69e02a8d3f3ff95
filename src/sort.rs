//! External sorter.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::vec;

use bytesize::ByteSize;
use regex::Regex;

use crate::buffer::RunBuffer;
use crate::codec::RecordCodec;
use crate::merge::{KWayMerger, MergeSource};
use crate::monitor::{MemoryMonitor, MemoryProbe, ProcessMemoryProbe};
use crate::options::{SortOptions, DEFAULT_DELIMITER, DEFAULT_MAX_RECORDS_PER_RUN, DEFAULT_MEMORY_LIMIT};
use crate::output::{OutputPipeline, DEFAULT_OUTPUT_BUFFER_SIZE};
use crate::run::{RunWriter, SplitOutcome};
use crate::tokenizer::{Delimiter, RecordReader, DEFAULT_READ_CHUNK_SIZE};
use crate::workspace::{CleanupRegistry, TempWorkspace};

/// Sorting error.
#[derive(Debug)]
pub enum SortError<S: Error, D: Error> {
    /// Invalid sorter configuration.
    Config(String),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Common I/O error.
    IO(io::Error),
    /// Input data stream error.
    InputError(io::Error),
    /// Data serialization error.
    SerializationError(S),
    /// Serialized record containing the output delimiter.
    EmbeddedDelimiter(String),
    /// Run data deserialization error.
    DeserializationError(D),
}

/// Sorting error of a codec.
pub type CodecSortError<C> = SortError<<C as RecordCodec>::SerializeError, <C as RecordCodec>::ParseError>;

impl<S, D> Error for SortError<S, D>
where
    S: Error + 'static,
    D: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::Config(_) => None,
            SortError::TempDir(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::InputError(err) => Some(err),
            SortError::SerializationError(err) => Some(err),
            SortError::EmbeddedDelimiter(_) => None,
            SortError::DeserializationError(err) => Some(err),
        }
    }
}

impl<S: Error, D: Error> Display for SortError<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Config(msg) => write!(f, "invalid sorter configuration: {}", msg),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::InputError(err) => write!(f, "input data stream error: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::EmbeddedDelimiter(record) => {
                write!(f, "serialized record contains the output delimiter: {:?}", record)
            }
            SortError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
        }
    }
}

type ProbeFactory = Arc<dyn Fn() -> Box<dyn MemoryProbe> + Send + Sync>;

fn process_probe_factory() -> ProbeFactory {
    Arc::new(|| Box::new(ProcessMemoryProbe::new()) as Box<dyn MemoryProbe>)
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
pub struct ExternalSorterBuilder<C: RecordCodec> {
    /// Record codec.
    codec: C,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Maximum number of records in a run.
    max_records_per_run: usize,
    /// Memory growth allowed during the split stage.
    memory_limit: u64,
    /// Input records delimiter.
    input_delimiter: Delimiter,
    /// Output (and run) records delimiter.
    output_delimiter: String,
    /// Output batch size.
    output_buffer_size: u64,
    /// Input and run read chunk size, run write buffer size.
    rw_buf_size: usize,
    /// Creates a memory probe for every sort call.
    memory_probe: ProbeFactory,
    /// Registry the workspaces are registered in.
    cleanup_registry: Option<Arc<CleanupRegistry>>,
    /// Invalid option reported by `build`.
    options_error: Option<String>,
}

impl<C: RecordCodec> ExternalSorterBuilder<C> {
    /// Creates an instance of a builder with default parameters.
    pub fn new(codec: C) -> Self {
        ExternalSorterBuilder {
            codec,
            tmp_dir: None,
            max_records_per_run: DEFAULT_MAX_RECORDS_PER_RUN,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            input_delimiter: Delimiter::from(DEFAULT_DELIMITER),
            output_delimiter: DEFAULT_DELIMITER.to_string(),
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            rw_buf_size: DEFAULT_READ_CHUNK_SIZE,
            memory_probe: process_probe_factory(),
            cleanup_registry: None,
            options_error: None,
        }
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<C>, CodecSortError<C>> {
        if let Some(msg) = &self.options_error {
            return Err(SortError::Config(msg.clone()));
        }
        if self.max_records_per_run == 0 {
            return Err(SortError::Config("max records per run must be positive".to_string()));
        }
        if self.input_delimiter.matches_empty() {
            return Err(SortError::Config("input delimiter must not match empty text".to_string()));
        }
        if self.output_delimiter.is_empty() {
            return Err(SortError::Config("output delimiter must not be empty".to_string()));
        }
        if self.rw_buf_size == 0 {
            return Err(SortError::Config("read/write buffer size must be positive".to_string()));
        }

        log::info!(
            "initializing sorter (records per run: {}, memory limit: {}, output buffer: {})",
            self.max_records_per_run,
            ByteSize(self.memory_limit),
            ByteSize(self.output_buffer_size)
        );

        return Ok(ExternalSorter {
            codec: self.codec,
            tmp_dir: self.tmp_dir.map(PathBuf::from),
            max_records_per_run: self.max_records_per_run,
            memory_limit: self.memory_limit,
            input_delimiter: self.input_delimiter,
            output_delimiter: self.output_delimiter,
            output_buffer_size: usize::try_from(self.output_buffer_size).unwrap_or(usize::MAX),
            rw_buf_size: self.rw_buf_size,
            memory_probe: self.memory_probe,
            cleanup_registry: self.cleanup_registry.unwrap_or_else(CleanupRegistry::process),
        });
    }

    /// Applies options loaded from configuration.
    pub fn with_options(mut self, options: SortOptions) -> ExternalSorterBuilder<C> {
        self.tmp_dir = options.tmp_dir.map(PathBuf::into_boxed_path);
        self.max_records_per_run = options.max_records_per_run;
        self.memory_limit = options.memory_limit;
        self.output_buffer_size = options.output_buffer_size;
        self.rw_buf_size = options.rw_buf_size;
        self.input_delimiter = match options.input_delimiter_pattern {
            Some(pattern) => match Regex::new(&pattern) {
                Ok(pattern) => Delimiter::from(pattern),
                Err(err) => {
                    self.options_error = Some(format!("invalid input delimiter pattern: {}", err));
                    Delimiter::from(options.input_delimiter)
                }
            },
            None => Delimiter::from(options.input_delimiter),
        };
        self.output_delimiter = options.output_delimiter;
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets maximum number of records in a single run.
    pub fn with_max_records_per_run(mut self, max_records: usize) -> ExternalSorterBuilder<C> {
        self.max_records_per_run = max_records;
        return self;
    }

    /// Sets memory growth (bytes) after which a run is flushed before reaching the records limit.
    pub fn with_memory_limit(mut self, limit: u64) -> ExternalSorterBuilder<C> {
        self.memory_limit = limit;
        return self;
    }

    /// Sets input records delimiter.
    pub fn with_input_delimiter(mut self, delimiter: impl Into<Delimiter>) -> ExternalSorterBuilder<C> {
        self.input_delimiter = delimiter.into();
        return self;
    }

    /// Sets output records delimiter. Runs use the same delimiter.
    pub fn with_output_delimiter(mut self, delimiter: impl Into<String>) -> ExternalSorterBuilder<C> {
        self.output_delimiter = delimiter.into();
        return self;
    }

    /// Sets output batch size.
    pub fn with_output_buffer_size(mut self, size: u64) -> ExternalSorterBuilder<C> {
        self.output_buffer_size = size;
        return self;
    }

    /// Sets read chunk size and run write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<C> {
        self.rw_buf_size = buf_size;
        return self;
    }

    /// Sets memory probe factory. A new probe is created for every sort call.
    pub fn with_memory_probe<P, F>(mut self, factory: F) -> ExternalSorterBuilder<C>
    where
        P: MemoryProbe + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.memory_probe = Arc::new(move || Box::new(factory()) as Box<dyn MemoryProbe>);
        return self;
    }

    /// Sets cleanup registry. [`CleanupRegistry::process`] is used by default.
    pub fn with_cleanup_registry(mut self, registry: Arc<CleanupRegistry>) -> ExternalSorterBuilder<C> {
        self.cleanup_registry = Some(registry);
        return self;
    }
}

impl<C: RecordCodec + Default> Default for ExternalSorterBuilder<C> {
    fn default() -> Self {
        ExternalSorterBuilder::new(C::default())
    }
}

/// External sorter.
pub struct ExternalSorter<C: RecordCodec> {
    /// Record codec.
    codec: C,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<PathBuf>,
    max_records_per_run: usize,
    memory_limit: u64,
    input_delimiter: Delimiter,
    output_delimiter: String,
    output_buffer_size: usize,
    rw_buf_size: usize,
    memory_probe: ProbeFactory,
    cleanup_registry: Arc<CleanupRegistry>,
}

impl<C: RecordCodec> ExternalSorter<C> {
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Sorts data from the input.
    /// Returns an iterator that can be used to get sorted records. Temporary data is kept until the iterator is
    /// dropped.
    ///
    /// Input records that fail to parse are logged and skipped; blank records are ignored.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    pub fn sort_iter<R: Read>(&self, input: R) -> Result<SortedRecords<'_, C>, CodecSortError<C>> {
        let workspace = self.create_workspace()?;

        let (inner, runs) = match self.split(input, &workspace)? {
            SplitOutcome::InMemory(items) => (Sorted::InMemory(items.into_iter()), 0),
            SplitOutcome::Runs(runs) => {
                let mut sources = Vec::with_capacity(runs.len());
                for run in &runs {
                    sources.push(run.open(&self.output_delimiter, self.rw_buf_size).map_err(SortError::IO)?);
                }
                (Sorted::Merged(KWayMerger::new(&self.codec, sources)), runs.len())
            }
        };

        return Ok(SortedRecords { inner, runs, workspace });
    }

    /// Sorts data from the input stream into the output stream.
    /// Returns the output stream once all the data is written and flushed.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    /// * `output` - Output stream sorted data to be written to
    pub fn sort<R, W>(&self, input: R, output: W) -> Result<W, CodecSortError<C>>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        let mut sorted = self.sort_iter(input)?;
        let output = self.write_records(sorted.by_ref(), output)?;
        sorted.close();

        return Ok(output);
    }

    /// Sorts the input file into the output file.
    /// Sorted data is written to a temporary file first which is then moved to the output path, so the output file
    /// never holds partial data.
    pub fn sort_file(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<(), CodecSortError<C>> {
        let input = fs::File::open(input.as_ref()).map_err(SortError::InputError)?;

        let mut sorted = self.sort_iter(input)?;
        let staged = tempfile::NamedTempFile::new_in(sorted.workspace_path()).map_err(SortError::TempDir)?;
        let sink = staged.reopen().map_err(SortError::IO)?;

        self.write_records(sorted.by_ref(), sink)?;
        persist(staged, output.as_ref())?;
        sorted.close();

        return Ok(());
    }

    /// Merges already sorted input streams into the output stream.
    /// Equal records are emitted in input order.
    ///
    /// # Arguments
    /// * `inputs` - Sorted input streams
    /// * `output` - Output stream merged data to be written to
    pub fn merge<I, R, W>(&self, inputs: I, output: W) -> Result<W, CodecSortError<C>>
    where
        I: IntoIterator<Item = R>,
        R: Read,
        W: Write + Send + 'static,
    {
        let sources = inputs.into_iter().map(|input| {
            MergeSource::stream_with_chunk_size(input, self.input_delimiter.clone(), self.rw_buf_size)
        });
        let merger = KWayMerger::new(&self.codec, sources);

        return self.write_records(merger, output);
    }

    /// Merges already sorted files into the output file.
    /// Every input file is opened upfront and closed as soon as it is exhausted.
    pub fn merge_files<P>(&self, inputs: &[P], output: impl AsRef<Path>) -> Result<(), CodecSortError<C>>
    where
        P: AsRef<Path>,
    {
        let mut files = Vec::with_capacity(inputs.len());
        for input in inputs {
            files.push(fs::File::open(input.as_ref()).map_err(SortError::InputError)?);
        }

        let workspace = self.create_workspace()?;
        let staged = tempfile::NamedTempFile::new_in(workspace.path()).map_err(SortError::TempDir)?;
        let sink = staged.reopen().map_err(SortError::IO)?;

        self.merge(files, sink)?;
        persist(staged, output.as_ref())?;
        workspace.close();

        return Ok(());
    }

    fn create_workspace(&self) -> Result<TempWorkspace, CodecSortError<C>> {
        TempWorkspace::create(self.tmp_dir.as_deref(), self.cleanup_registry.clone()).map_err(SortError::TempDir)
    }

    fn split<R: Read>(
        &self,
        input: R,
        workspace: &TempWorkspace,
    ) -> Result<SplitOutcome<C::Record>, CodecSortError<C>> {
        let monitor = MemoryMonitor::new((self.memory_probe)(), self.memory_limit, self.max_records_per_run);
        let buffer = RunBuffer::new(self.max_records_per_run, monitor);
        let mut run_writer = RunWriter::new(
            &self.codec,
            workspace,
            &self.output_delimiter,
            Some(self.rw_buf_size),
            buffer,
        );

        let mut dropped = 0;
        let records = RecordReader::with_chunk_size(input, self.input_delimiter.clone(), self.rw_buf_size);
        for record in records {
            let record = record.map_err(SortError::InputError)?;
            if record.trim().is_empty() {
                continue;
            }

            match self.codec.parse(&record) {
                Ok(record) => run_writer.push(record)?,
                Err(err) => {
                    log::warn!("malformed record dropped: {}", err);
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            log::warn!("{} malformed record(s) dropped", dropped);
        }

        return run_writer.finish();
    }

    fn write_records<I, W>(&self, records: I, output: W) -> Result<W, CodecSortError<C>>
    where
        I: Iterator<Item = Result<C::Record, CodecSortError<C>>>,
        W: Write + Send + 'static,
    {
        let mut pipeline = OutputPipeline::new(output, self.output_delimiter.as_str(), self.output_buffer_size);

        let mut written = 0;
        for record in records {
            let record = record?;
            let line = serialize_record(&self.codec, &record, &self.output_delimiter)?;
            pipeline.push(&line).map_err(SortError::IO)?;
            written += 1;
        }

        let output = pipeline.finish().map_err(SortError::IO)?;
        log::debug!("{} records written", written);

        return Ok(output);
    }
}

/// Serializes a record for a delimited sink. A record containing the delimiter would be read back as several
/// records, so it is rejected.
pub(crate) fn serialize_record<C: RecordCodec>(
    codec: &C,
    record: &C::Record,
    delimiter: &str,
) -> Result<String, CodecSortError<C>> {
    let line = codec.serialize(record).map_err(SortError::SerializationError)?;
    if line.contains(delimiter) {
        return Err(SortError::EmbeddedDelimiter(line));
    }

    return Ok(line);
}

/// Moves a staged output file into place. Falls back to copying if the file can't be renamed (e.g. the target is on
/// another file system).
fn persist<S: Error, D: Error>(staged: tempfile::NamedTempFile, output: &Path) -> Result<(), SortError<S, D>> {
    if let Err(err) = staged.persist(output) {
        log::debug!("{} not renamed into place ({}), copying", output.display(), err.error);
        fs::copy(err.file.path(), output).map_err(SortError::IO)?;
    }

    return Ok(());
}

enum Sorted<'a, C: RecordCodec> {
    InMemory(vec::IntoIter<C::Record>),
    Merged(KWayMerger<'a, C, fs::File>),
}

/// Sorted records iterator.
/// Owns the temporary workspace of the sort call; the workspace is deleted when the iterator is dropped.
pub struct SortedRecords<'a, C: RecordCodec> {
    inner: Sorted<'a, C>,
    runs: usize,
    workspace: TempWorkspace,
}

impl<'a, C: RecordCodec> SortedRecords<'a, C> {
    /// Number of runs the input was split into. Zero if the input was sorted in memory.
    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }

    /// Releases the remaining runs and deletes the workspace.
    pub fn close(self) {
        let SortedRecords { inner, workspace, .. } = self;
        drop(inner);
        workspace.close();
    }
}

impl<'a, C: RecordCodec> Iterator for SortedRecords<'a, C> {
    type Item = Result<C::Record, CodecSortError<C>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Sorted::InMemory(items) => items.next().map(Ok),
            Sorted::Merged(merger) => merger.next(),
        }
    }
}

impl<'a, C: RecordCodec> Debug for SortedRecords<'a, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedRecords")
            .field("runs", &self.runs)
            .field("workspace", &self.workspace.path())
            .finish()
    }
}
