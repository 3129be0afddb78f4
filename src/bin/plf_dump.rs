use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use plf::{PlfParser, Result};

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::exit;

fn main() {
    let matches = Command::new("plf_dump")
        .about("Extracts PLC block reference addresses from TIA Portal .plf containers")
        .arg(
            Arg::new("INPUT")
                .help("Path to the .plf project container")
                .required(true),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file [default: export.txt next to the input]"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase verbosity (-v info, -vv debug, -vvv trace)"),
        )
        .get_matches();

    let level = match matches.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let input = PathBuf::from(matches.get_one::<String>("INPUT").expect("required"));
    let output = matches
        .get_one::<String>("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            input
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("export.txt")
        });

    if let Err(e) = run(&input, &output) {
        eprintln!("{e}");
        exit(1);
    }
}

fn run(input: &Path, output: &Path) -> Result<()> {
    let parser = PlfParser::from_path(input)?;
    let file = File::create(output)?;
    let mut writer = BufWriter::new(file);
    parser.write_export(&mut writer)?;
    Ok(())
}
