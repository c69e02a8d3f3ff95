//! Sorted position k-way merger.

use std::cmp::Ordering;
use std::fs;
use std::io::Read;
use std::path::PathBuf;

use crate::codec::RecordCodec;
use crate::sort::{CodecSortError, SortError};
use crate::tokenizer::{Delimiter, RecordReader, DEFAULT_READ_CHUNK_SIZE};

/// Returns the position at which `target` has to be inserted into `sorted` (ordered descending by `compare`) to keep
/// it ordered. All elements before the returned index compare greater or equal to the target, all elements from it
/// on compare less.
pub fn insertion_index<T, F>(sorted: &[T], target: &T, compare: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    sorted.partition_point(|entry| compare(entry, target) != Ordering::Less)
}

/// A sorted record stream taking part in a merge.
pub struct MergeSource<R: Read> {
    records: RecordReader<R>,
    /// Run file to delete once the source is exhausted.
    run_path: Option<PathBuf>,
}

impl<R: Read> MergeSource<R> {
    /// Creates a source reading a caller provided stream.
    pub fn stream(reader: R, delimiter: Delimiter) -> Self {
        Self::stream_with_chunk_size(reader, delimiter, DEFAULT_READ_CHUNK_SIZE)
    }

    pub fn stream_with_chunk_size(reader: R, delimiter: Delimiter, chunk_size: usize) -> Self {
        MergeSource {
            records: RecordReader::with_chunk_size(reader, delimiter, chunk_size),
            run_path: None,
        }
    }

    /// Creates a source reading a run file owned by the merge.
    pub(crate) fn run(reader: R, delimiter: Delimiter, chunk_size: usize, path: PathBuf) -> Self {
        MergeSource {
            records: RecordReader::with_chunk_size(reader, delimiter, chunk_size),
            run_path: Some(path),
        }
    }

    /// Reads the next non-blank record.
    fn next_record<C>(&mut self, codec: &C) -> Result<Option<C::Record>, CodecSortError<C>>
    where
        C: RecordCodec,
    {
        for line in self.records.by_ref() {
            let line = match line {
                Ok(line) => line,
                Err(err) if self.run_path.is_some() => return Err(SortError::IO(err)),
                Err(err) => return Err(SortError::InputError(err)),
            };
            if line.trim().is_empty() {
                continue;
            }
            return codec.parse(&line).map(Some).map_err(SortError::DeserializationError);
        }

        return Ok(None);
    }

    /// Closes the underlying stream and removes the run file, if any.
    fn close(self) {
        let MergeSource { records, run_path } = self;
        drop(records);

        if let Some(path) = run_path {
            match fs::remove_file(&path) {
                Ok(()) => log::trace!("run {} merged and removed", path.display()),
                Err(err) => log::debug!("run {} not removed: {}", path.display(), err),
            }
        }
    }
}

/// Merge position over one source, always one decoded record ahead.
struct Cursor<T, R: Read> {
    record: T,
    /// Source position among the merge inputs. Breaks ties between equal records.
    ordinal: usize,
    source: MergeSource<R>,
    unsorted_reported: bool,
}

/// Sorted position k-way merger.
///
/// Cursors are kept in a vector ordered descending by their current record, so the smallest one is always the last
/// element. After a record is emitted its cursor advances and is put back at the position found by
/// [`insertion_index`]. Equal records are emitted in source order which makes the merge stable.
///
/// A record that can't be decoded terminates the merge with [`SortError::DeserializationError`].
pub struct KWayMerger<'a, C: RecordCodec, R: Read> {
    codec: &'a C,
    pending: Vec<MergeSource<R>>,
    cursors: Vec<Cursor<C::Record, R>>,
    initiated: bool,
    failed: bool,
}

impl<'a, C: RecordCodec, R: Read> KWayMerger<'a, C, R> {
    /// Creates a merger over the sources. Sources should be sorted in ascending order otherwise the result
    /// is not sorted either.
    ///
    /// # Arguments
    /// * `codec` - Codec used to decode and compare records
    /// * `sources` - Sources to be merged in a single sorted one
    pub fn new<I>(codec: &'a C, sources: I) -> Self
    where
        I: IntoIterator<Item = MergeSource<R>>,
    {
        let pending = Vec::from_iter(sources);
        let cursors = Vec::with_capacity(pending.len());

        return KWayMerger {
            codec,
            pending,
            cursors,
            initiated: false,
            failed: false,
        };
    }

    /// Number of sources not exhausted yet.
    pub fn active_sources(&self) -> usize {
        self.pending.len() + self.cursors.len()
    }

    fn init(&mut self) -> Result<(), CodecSortError<C>> {
        let sources = std::mem::take(&mut self.pending);
        log::debug!("merging {} sorted sources", sources.len());

        for (ordinal, mut source) in sources.into_iter().enumerate() {
            match source.next_record(self.codec)? {
                Some(record) => self.insert(Cursor {
                    record,
                    ordinal,
                    source,
                    unsorted_reported: false,
                }),
                None => source.close(),
            }
        }

        return Ok(());
    }

    fn insert(&mut self, cursor: Cursor<C::Record, R>) {
        let codec = self.codec;
        let idx = insertion_index(&self.cursors, &cursor, |a, b| {
            codec
                .compare(&a.record, &b.record)
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        self.cursors.insert(idx, cursor);
    }

    fn fail(&mut self) {
        self.failed = true;
        self.pending.clear();
        self.cursors.clear();
    }
}

impl<'a, C: RecordCodec, R: Read> Iterator for KWayMerger<'a, C, R> {
    type Item = Result<C::Record, CodecSortError<C>>;

    /// Returns the next record from the sources in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.initiated {
            self.initiated = true;
            if let Err(err) = self.init() {
                self.fail();
                return Some(Err(err));
            }
        }

        let mut cursor = self.cursors.pop()?;
        match cursor.source.next_record(self.codec) {
            Ok(Some(record)) => {
                let emitted = std::mem::replace(&mut cursor.record, record);
                if !cursor.unsorted_reported && self.codec.compare(&cursor.record, &emitted) == Ordering::Less {
                    log::warn!("merge source #{} is not sorted, output order is undefined", cursor.ordinal);
                    cursor.unsorted_reported = true;
                }
                self.insert(cursor);
                Some(Ok(emitted))
            }
            Ok(None) => {
                let Cursor { record, source, .. } = cursor;
                source.close();
                Some(Ok(record))
            }
            Err(err) => {
                self.fail();
                Some(Err(err))
            }
        }
    }
}
