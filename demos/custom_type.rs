use std::cmp::Ordering;
use std::convert::Infallible;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path;

use env_logger;
use log;

use large_sort::{ExternalSorterBuilder, RecordCodec};

#[derive(Debug)]
enum CsvParseError {
    RowError(String),
    ColumnError(String),
}

impl Display for CsvParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CsvParseError::ColumnError(err) => write!(f, "column format error: {}", err),
            CsvParseError::RowError(err) => write!(f, "row format error: {}", err),
        }
    }
}

impl Error for CsvParseError {}

struct Person {
    name: String,
    surname: String,
    age: u8,
    /// Lowercased surname and name, computed once at parse time.
    sort_key: String,
}

struct PersonCodec;

impl RecordCodec for PersonCodec {
    type Record = Person;
    type ParseError = CsvParseError;
    type SerializeError = Infallible;

    fn parse(&self, s: &str) -> Result<Person, CsvParseError> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(CsvParseError::RowError("wrong columns number".to_string()));
        }

        return Ok(Person {
            name: parts[0].to_string(),
            surname: parts[1].to_string(),
            age: parts[2]
                .trim()
                .parse()
                .map_err(|err| CsvParseError::ColumnError(format!("age field format error: {}", err)))?,
            sort_key: format!("{} {}", parts[1].to_lowercase(), parts[0].to_lowercase()),
        });
    }

    fn serialize(&self, person: &Person) -> Result<String, Infallible> {
        Ok(format!("{},{},{}", person.name, person.surname, person.age))
    }

    fn compare(&self, a: &Person, b: &Person) -> Ordering {
        a.sort_key.cmp(&b.sort_key).then(a.age.cmp(&b.age))
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let sorter = ExternalSorterBuilder::new(PersonCodec)
        .with_tmp_dir(path::Path::new("./"))
        .with_max_records_per_run(1_000_000)
        .build()
        .unwrap();

    sorter.sort_file("input.csv", "output.csv").unwrap();
}
