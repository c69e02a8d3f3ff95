use std::env;

use env_logger;
use log;

use large_sort::{ExternalSorterBuilder, FromStrCodec};

/// Merges already sorted files of integers: `merge_files <output> <input>...`
fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Info).init();

    let mut args = env::args().skip(1);
    let output = args.next().expect("output path is required");
    let inputs: Vec<String> = args.collect();

    let sorter = ExternalSorterBuilder::new(FromStrCodec::<i64>::new()).build().unwrap();

    if let Err(err) = sorter.merge_files(&inputs, &output) {
        log::error!("merge failed: {}", err);
        std::process::exit(1);
    }
}
