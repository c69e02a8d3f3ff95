use std::fs;
use std::io;

use bytesize::MB;
use env_logger;
use log;

use large_sort::{ExternalSorterBuilder, LineCodec};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input_reader = fs::File::open("input.txt").unwrap();
    let output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());

    let sorter = ExternalSorterBuilder::new(LineCodec)
        .with_tmp_dir(std::path::Path::new("./"))
        .with_memory_limit(50 * MB)
        .build()
        .unwrap();

    sorter.sort(input_reader, output_writer).unwrap();
}
