//! Output buffer pipeline.
//!
//! Serialized records are accumulated in memory and written to the sink in batches by a background writer. While
//! a batch is being written the next one keeps accumulating; before a batch is handed over the previous write is
//! awaited, so at most one write is ever in flight and batches reach the sink in order.

use std::io::{self, Write};
use std::mem;
use std::thread;

/// Default batch size threshold.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: u64 = 7 * bytesize::MB + 500 * bytesize::KB;

/// Batching writer with a single in-flight write slot.
pub struct OutputPipeline<W: Write + Send + 'static> {
    /// Sink, absent while a write is in flight.
    sink: Option<W>,
    in_flight: Option<thread::JoinHandle<io::Result<W>>>,
    delimiter: String,
    threshold: usize,
    batch: Vec<u8>,
    flushes: usize,
}

impl<W: Write + Send + 'static> OutputPipeline<W> {
    /// Creates a pipeline.
    ///
    /// # Arguments
    /// * `sink` - Output sink
    /// * `delimiter` - Delimiter written after every record
    /// * `threshold` - Batch size (bytes) above which the batch is handed to the writer
    pub fn new(sink: W, delimiter: impl Into<String>, threshold: usize) -> Self {
        OutputPipeline {
            sink: Some(sink),
            in_flight: None,
            delimiter: delimiter.into(),
            threshold,
            batch: Vec::new(),
            flushes: 0,
        }
    }

    /// Appends a serialized record.
    pub fn push(&mut self, record: &str) -> io::Result<()> {
        self.batch.extend_from_slice(record.as_bytes());
        self.batch.extend_from_slice(self.delimiter.as_bytes());

        if self.batch.len() > self.threshold {
            self.flush_batch()?;
        }

        return Ok(());
    }

    /// Number of batches handed to the writer so far.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Waits for the in-flight write, writes the remaining batch and flushes the sink.
    /// Returns the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.await_in_flight()?;

        let mut sink = self.take_sink()?;
        let batch = mem::take(&mut self.batch);
        if !batch.is_empty() {
            self.flushes += 1;
            sink.write_all(&batch)?;
        }
        sink.flush()?;

        log::debug!("output written in {} batch(es)", self.flushes);

        return Ok(sink);
    }

    fn flush_batch(&mut self) -> io::Result<()> {
        self.await_in_flight()?;

        let mut sink = self.take_sink()?;
        let batch = mem::take(&mut self.batch);
        self.flushes += 1;
        log::trace!("writing output batch #{} ({} bytes)", self.flushes, batch.len());

        let handle = thread::Builder::new()
            .name("large-sort-writer".to_string())
            .spawn(move || -> io::Result<W> {
                sink.write_all(&batch)?;
                Ok(sink)
            })?;
        self.in_flight = Some(handle);

        return Ok(());
    }

    fn await_in_flight(&mut self) -> io::Result<()> {
        if let Some(handle) = self.in_flight.take() {
            let sink = handle
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "output writer thread panicked"))??;
            self.sink = Some(sink);
        }

        return Ok(());
    }

    fn take_sink(&mut self) -> io::Result<W> {
        self.sink
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "output sink lost by a failed write"))
    }
}

impl<W: Write + Send + 'static> Drop for OutputPipeline<W> {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            let _ = handle.join();
        }
    }
}
