use std::fs::File;
use std::io::{self, BufReader, Read};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use inkwell::context::Context;

use kaleido::driver::{self, Driver};

mod cli;

fn main() -> Result<(), ()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mode = match args.mode {
        cli::Mode::Jit => driver::Mode::Jit,
        cli::Mode::Compile => driver::Mode::Object,
    };

    match &args.input_file {
        Some(path) => {
            let file = File::open(path).map_err(|err| {
                eprintln!("Error: cannot open {}: {err}", path.display());
            })?;
            run(BufReader::new(file), mode)
        }
        None => run(io::stdin().lock(), mode),
    }
}

fn run<R: Read>(source: R, mode: driver::Mode) -> Result<(), ()> {
    let context = Context::create();
    let mut driver = Driver::new(&context, source, mode).map_err(|err| {
        eprintln!("Error: {err}");
    })?;
    driver.run().map_err(|err| {
        eprintln!("Error: {err}");
    })
}
