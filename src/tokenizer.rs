//! Chunk tokenizer.
//!
//! Turns a stream of arbitrarily sized byte chunks into delimiter separated records. A record may straddle any
//! number of chunk boundaries; the unterminated tail of each chunk is carried over and prepended to the next one.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};

use regex::Regex;

/// Default read chunk size.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Record delimiter.
#[derive(Clone)]
pub enum Delimiter {
    /// Literal separator string.
    Literal(String),
    /// Regular expression separator.
    Pattern(Regex),
}

impl Delimiter {
    /// Finds the first non-overlapping match starting at or after `from`. Returns its byte range.
    fn find_at(&self, text: &str, from: usize) -> Option<(usize, usize)> {
        match self {
            Delimiter::Literal(literal) => text[from..]
                .find(literal.as_str())
                .map(|start| (from + start, from + start + literal.len())),
            Delimiter::Pattern(pattern) => pattern.find_at(text, from).map(|found| (found.start(), found.end())),
        }
    }

    /// Whether the delimiter matches empty text. Such a delimiter can't separate records.
    pub(crate) fn matches_empty(&self) -> bool {
        match self {
            Delimiter::Literal(literal) => literal.is_empty(),
            Delimiter::Pattern(pattern) => pattern.is_match(""),
        }
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter::Literal("\n".to_string())
    }
}

impl fmt::Debug for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delimiter::Literal(literal) => write!(f, "Literal({:?})", literal),
            Delimiter::Pattern(pattern) => write!(f, "Pattern({:?})", pattern.as_str()),
        }
    }
}

impl From<&str> for Delimiter {
    fn from(literal: &str) -> Self {
        Delimiter::Literal(literal.to_string())
    }
}

impl From<String> for Delimiter {
    fn from(literal: String) -> Self {
        Delimiter::Literal(literal)
    }
}

impl From<char> for Delimiter {
    fn from(literal: char) -> Self {
        Delimiter::Literal(literal.to_string())
    }
}

impl From<Regex> for Delimiter {
    fn from(pattern: Regex) -> Self {
        Delimiter::Pattern(pattern)
    }
}

/// Incremental text tokenizer.
///
/// Only the text appended since the last search is scanned for a literal delimiter. A pattern match may start
/// anywhere in the unterminated fragment, so the fragment is searched again once it has doubled in size; records
/// separated by a pattern may therefore be handed out a few chunks late.
pub struct ChunkTokenizer {
    delimiter: Delimiter,
    /// Unterminated tail of the stream.
    fragment: String,
    /// Offset in the fragment the next search starts at.
    search_from: usize,
    /// Fragment length at which the next search is run.
    search_at: usize,
    /// Complete records not yet handed out.
    ready: VecDeque<String>,
    #[cfg(test)]
    scanned: usize,
}

impl ChunkTokenizer {
    pub fn new(delimiter: Delimiter) -> Self {
        ChunkTokenizer {
            delimiter,
            fragment: String::new(),
            search_from: 0,
            search_at: 0,
            ready: VecDeque::new(),
            #[cfg(test)]
            scanned: 0,
        }
    }

    /// Feeds the next chunk of text.
    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }

        self.fragment.push_str(chunk);
        if self.fragment.len() >= self.search_at {
            self.search();
        }
    }

    /// Takes the next complete record.
    pub fn pop(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Ends the stream. The records still pending become available through [`pop`](Self::pop), the carried
    /// fragment is the final record unless it is blank.
    pub fn finish(&mut self) {
        self.search();

        let fragment = std::mem::take(&mut self.fragment);
        self.search_from = 0;
        self.search_at = 0;
        if !fragment.trim().is_empty() {
            self.ready.push_back(fragment);
        }
    }

    fn search(&mut self) {
        #[cfg(test)]
        {
            self.scanned += self.fragment.len() - self.search_from;
        }

        let mut record_start = 0;
        let mut from = self.search_from;
        while let Some((start, end)) = self.delimiter.find_at(&self.fragment, from) {
            if start == end {
                // empty matches never separate records
                match self.fragment[start..].chars().next() {
                    Some(next) => {
                        from = start + next.len_utf8();
                        continue;
                    }
                    None => break,
                }
            }

            self.ready.push_back(self.fragment[record_start..start].to_string());
            record_start = end;
            from = end;
        }
        self.fragment.drain(..record_start);

        match &self.delimiter {
            Delimiter::Literal(literal) => {
                let mut from = self.fragment.len().saturating_sub(literal.len().saturating_sub(1));
                while !self.fragment.is_char_boundary(from) {
                    from -= 1;
                }
                self.search_from = from;
                self.search_at = 0;
            }
            Delimiter::Pattern(_) => {
                self.search_from = 0;
                self.search_at = self.fragment.len().saturating_mul(2);
            }
        }
    }
}

/// Reads delimited records from a byte stream.
///
/// Bytes are decoded as UTF-8; a multi-byte sequence split between two reads is completed by the next read.
/// Invalid UTF-8 is reported as an [`io::ErrorKind::InvalidData`] error.
pub struct RecordReader<R: Read> {
    reader: R,
    tokenizer: ChunkTokenizer,
    chunk: Vec<u8>,
    /// Bytes read but not yet decoded (an incomplete UTF-8 sequence).
    undecoded: Vec<u8>,
    finished: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R, delimiter: Delimiter) -> Self {
        Self::with_chunk_size(reader, delimiter, DEFAULT_READ_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, delimiter: Delimiter, chunk_size: usize) -> Self {
        RecordReader {
            reader,
            tokenizer: ChunkTokenizer::new(delimiter),
            chunk: vec![0; chunk_size.max(1)],
            undecoded: Vec::new(),
            finished: false,
        }
    }

    /// Reads one chunk and feeds it to the tokenizer. Returns `false` on end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        let read = loop {
            match self.reader.read(&mut self.chunk) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };

        if read == 0 {
            if !self.undecoded.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "stream ended inside a UTF-8 sequence",
                ));
            }
            return Ok(false);
        }

        self.undecoded.extend_from_slice(&self.chunk[..read]);
        let valid = match std::str::from_utf8(&self.undecoded) {
            Ok(text) => {
                self.tokenizer.push(text);
                self.undecoded.len()
            }
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                if let Ok(text) = std::str::from_utf8(&self.undecoded[..valid]) {
                    self.tokenizer.push(text);
                }
                valid
            }
            Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        };
        self.undecoded.drain(..valid);

        return Ok(true);
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.tokenizer.pop() {
                return Some(Ok(record));
            }
            if self.finished {
                return None;
            }

            match self.fill() {
                Ok(true) => continue,
                Ok(false) => {
                    self.finished = true;
                    self.tokenizer.finish();
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::io::{self, Read};

    use rand::Rng;
    use regex::Regex;
    use rstest::*;

    use super::{ChunkTokenizer, Delimiter, RecordReader};

    /// Reader returning the data in pieces of the given sizes, cycling through them.
    pub(crate) struct FragmentedReader {
        data: Vec<u8>,
        pos: usize,
        sizes: Vec<usize>,
        turn: usize,
    }

    impl FragmentedReader {
        pub(crate) fn new(data: impl Into<Vec<u8>>, sizes: Vec<usize>) -> Self {
            FragmentedReader {
                data: data.into(),
                pos: 0,
                sizes,
                turn: 0,
            }
        }
    }

    impl Read for FragmentedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let size = self.sizes[self.turn % self.sizes.len()].min(buf.len());
            self.turn += 1;
            let end = (self.pos + size).min(self.data.len());
            let read = end - self.pos;
            buf[..read].copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            Ok(read)
        }
    }

    fn collect(reader: impl Read, delimiter: Delimiter) -> Vec<String> {
        RecordReader::new(reader, delimiter).collect::<io::Result<_>>().unwrap()
    }

    #[rstest]
    #[case(vec!["a\nb", "c\n"], vec!["a", "bc"])]
    #[case(vec!["a\n", "", "b"], vec!["a", "b"])]
    #[case(vec!["a\n\nb\n"], vec!["a", "", "b"])]
    #[case(vec!["\n"], vec![""])]
    #[case(vec!["", ""], vec![])]
    #[case(vec!["tail  "], vec!["tail  "])]
    #[case(vec!["x\n", "  "], vec!["x"])]
    fn test_tokenizer(#[case] chunks: Vec<&str>, #[case] expected: Vec<&str>) {
        let mut tokenizer = ChunkTokenizer::new(Delimiter::default());
        let mut actual = Vec::new();
        for chunk in chunks {
            tokenizer.push(chunk);
            while let Some(record) = tokenizer.pop() {
                actual.push(record);
            }
        }
        tokenizer.finish();
        actual.extend(std::iter::from_fn(|| tokenizer.pop()));

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_empty_chunk_emits_nothing() {
        let mut tokenizer = ChunkTokenizer::new(Delimiter::default());
        tokenizer.push("partial");
        tokenizer.push("");
        assert_eq!(tokenizer.pop(), None);
        tokenizer.finish();
        assert_eq!(tokenizer.pop(), Some("partial".to_string()));
        assert_eq!(tokenizer.pop(), None);
    }

    #[rstest]
    #[case(Delimiter::from("\n"))]
    #[case(Delimiter::from("\r\n"))]
    #[case(Delimiter::from(Regex::new(r"\r?\n").unwrap()))]
    fn test_long_record_scanned_in_linear_time(#[case] delimiter: Delimiter) {
        let separator = match &delimiter {
            Delimiter::Literal(literal) => literal.clone(),
            Delimiter::Pattern(_) => "\r\n".to_string(),
        };
        let long = "x".repeat(1 << 20);
        let text = format!("{}{}next{}", long, separator, separator);

        let mut tokenizer = ChunkTokenizer::new(delimiter);
        let mut records = Vec::new();
        for chunk in text.as_bytes().chunks(1000) {
            tokenizer.push(std::str::from_utf8(chunk).unwrap());
            records.extend(std::iter::from_fn(|| tokenizer.pop()));
        }
        tokenizer.finish();
        records.extend(std::iter::from_fn(|| tokenizer.pop()));

        assert_eq!(records, vec![long, "next".to_string()]);
        assert!(tokenizer.scanned <= 4 * text.len(), "{} bytes scanned", tokenizer.scanned);
    }

    #[rstest]
    #[case(Regex::new(r"\b").unwrap(), vec!["one two"])]
    #[case(Regex::new(r"\s").unwrap(), vec!["one", "two"])]
    fn test_empty_pattern_matches_ignored(#[case] pattern: Regex, #[case] expected: Vec<&str>) {
        let reader = FragmentedReader::new("one two", vec![3]);
        assert_eq!(collect(reader, Delimiter::from(pattern)), expected);
    }

    #[rstest]
    #[case(Delimiter::from(""), true)]
    #[case(Delimiter::from(Regex::new("x*").unwrap()), true)]
    #[case(Delimiter::from(Regex::new(r"\n?").unwrap()), true)]
    #[case(Delimiter::from(Regex::new(r"\n+").unwrap()), false)]
    #[case(Delimiter::from(";"), false)]
    fn test_matches_empty(#[case] delimiter: Delimiter, #[case] expected: bool) {
        assert_eq!(delimiter.matches_empty(), expected);
    }

    #[test]
    fn test_pattern_delimiter_across_boundary() {
        let delimiter = Delimiter::from(Regex::new(r"\r?\n").unwrap());
        let reader = FragmentedReader::new("one\r\ntwo\r\nthree", vec![4]);
        assert_eq!(collect(reader, delimiter), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_multi_char_literal_delimiter() {
        let reader = FragmentedReader::new("a||b||c||", vec![1]);
        assert_eq!(collect(reader, Delimiter::from("||")), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_utf8_split_between_reads() {
        let text = "ключ\nзначение\n日本語\n";
        let reader = FragmentedReader::new(text, vec![1, 2, 3]);
        assert_eq!(collect(reader, Delimiter::default()), vec!["ключ", "значение", "日本語"]);
    }

    #[test]
    fn test_invalid_utf8() {
        let reader = FragmentedReader::new(vec![b'a', b'\n', 0xff, b'\n'], vec![8]);
        let result: io::Result<Vec<String>> = RecordReader::new(reader, Delimiter::default()).collect();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_utf8() {
        let reader = FragmentedReader::new(vec![b'a', b'\n', 0xd0], vec![8]);
        let result: io::Result<Vec<String>> = RecordReader::new(reader, Delimiter::default()).collect();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let mut rng = rand::thread_rng();
        let records: Vec<String> = (0..500).map(|i| format!("record-{}-{}", i, "x".repeat(i % 17))).collect();
        let text = records.join("\n") + "\n";

        for _ in 0..20 {
            let sizes: Vec<usize> = (0..10).map(|_| rng.gen_range(1..64)).collect();
            let reader = FragmentedReader::new(text.clone(), sizes);
            assert_eq!(collect(reader, Delimiter::default()), records);
        }
    }
}
