//! Record codecs.
//!
//! A codec bundles the three capabilities the sorter needs from the caller: turning a delimited text fragment into
//! a record, turning a record back into text and comparing two records. The sorter never looks inside a record.

use std::cmp::Ordering;
use std::convert::Infallible;
use std::error::Error;
use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;

/// Record codec interface.
pub trait RecordCodec {
    /// Decoded record type. May carry a precomputed sort key.
    type Record;
    /// Error returned when a text fragment can't be decoded.
    type ParseError: Error;
    /// Error returned when a record can't be encoded.
    type SerializeError: Error;

    /// Decodes a single record from its textual form (delimiter excluded).
    fn parse(&self, text: &str) -> Result<Self::Record, Self::ParseError>;

    /// Encodes a record. The result must not contain the output delimiter.
    fn serialize(&self, record: &Self::Record) -> Result<String, Self::SerializeError>;

    /// Compares two records.
    fn compare(&self, a: &Self::Record, b: &Self::Record) -> Ordering;
}

/// Codec built from three caller supplied functions.
pub struct FnCodec<T, PE, SE, P, S, F> {
    parse_fn: P,
    serialize_fn: S,
    compare_fn: F,

    types: PhantomData<fn() -> (T, PE, SE)>,
}

impl<T, PE, SE, P, S, F> FnCodec<T, PE, SE, P, S, F>
where
    PE: Error,
    SE: Error,
    P: Fn(&str) -> Result<T, PE>,
    S: Fn(&T) -> Result<String, SE>,
    F: Fn(&T, &T) -> Ordering,
{
    /// Creates a codec from parse, serialize and compare functions.
    pub fn new(parse_fn: P, serialize_fn: S, compare_fn: F) -> Self {
        FnCodec {
            parse_fn,
            serialize_fn,
            compare_fn,
            types: PhantomData,
        }
    }
}

impl<T, PE, SE, P, S, F> RecordCodec for FnCodec<T, PE, SE, P, S, F>
where
    PE: Error,
    SE: Error,
    P: Fn(&str) -> Result<T, PE>,
    S: Fn(&T) -> Result<String, SE>,
    F: Fn(&T, &T) -> Ordering,
{
    type Record = T;
    type ParseError = PE;
    type SerializeError = SE;

    fn parse(&self, text: &str) -> Result<T, PE> {
        (self.parse_fn)(text)
    }

    fn serialize(&self, record: &T) -> Result<String, SE> {
        (self.serialize_fn)(record)
    }

    fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.compare_fn)(a, b)
    }
}

/// Identity codec: records are the lines themselves, ordered lexicographically.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl RecordCodec for LineCodec {
    type Record = String;
    type ParseError = Infallible;
    type SerializeError = Infallible;

    fn parse(&self, text: &str) -> Result<String, Infallible> {
        Ok(text.to_string())
    }

    fn serialize(&self, record: &String) -> Result<String, Infallible> {
        Ok(record.clone())
    }

    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }
}

/// Codec for primitive types parsed with [`FromStr`], rendered with [`Display`] and ordered by [`Ord`].
/// Surrounding whitespace is trimmed before parsing.
pub struct FromStrCodec<T> {
    item_type: PhantomData<fn() -> T>,
}

impl<T> FromStrCodec<T> {
    pub fn new() -> Self {
        FromStrCodec { item_type: PhantomData }
    }
}

impl<T> Default for FromStrCodec<T> {
    fn default() -> Self {
        FromStrCodec::new()
    }
}

impl<T> RecordCodec for FromStrCodec<T>
where
    T: FromStr + Display + Ord,
    T::Err: Error,
{
    type Record = T;
    type ParseError = T::Err;
    type SerializeError = Infallible;

    fn parse(&self, text: &str) -> Result<T, T::Err> {
        text.trim().parse()
    }

    fn serialize(&self, record: &T) -> Result<String, Infallible> {
        Ok(record.to_string())
    }

    fn compare(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;
    use std::convert::Infallible;
    use std::num::ParseIntError;

    use rstest::*;

    use super::{FnCodec, FromStrCodec, LineCodec, RecordCodec};

    #[test]
    fn test_fn_codec() {
        let codec = FnCodec::new(
            |s: &str| s.parse::<u32>(),
            |n: &u32| Ok::<_, Infallible>(format!("{:04}", n)),
            |a: &u32, b: &u32| b.cmp(a),
        );

        let record = codec.parse("42").unwrap();
        assert_eq!(record, 42);
        assert_eq!(codec.serialize(&record).unwrap(), "0042");
        assert_eq!(codec.compare(&1, &2), Ordering::Greater);
        assert!(codec.parse("x").is_err());
    }

    #[rstest]
    #[case(" 10 ", Ok(10))]
    #[case("-3", Ok(-3))]
    #[case("abc", Err(()))]
    #[case("", Err(()))]
    fn test_from_str_codec(#[case] input: &str, #[case] expected: Result<i64, ()>) {
        let codec: FromStrCodec<i64> = FromStrCodec::new();
        let actual: Result<i64, ParseIntError> = codec.parse(input);
        assert_eq!(actual.map_err(|_| ()), expected);
    }

    #[test]
    fn test_line_codec_keeps_text_verbatim() {
        let codec = LineCodec;
        let record = codec.parse("  padded\t").unwrap();
        assert_eq!(codec.serialize(&record).unwrap(), "  padded\t");
        assert_eq!(codec.compare(&"b".to_string(), &"a".to_string()), Ordering::Greater);
    }
}
