use crate::CLAP_STYLING;
use clap::arg;

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("stackprint")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("stackprint")
        .styles(CLAP_STYLING)
        .about("Crawl web origins and fingerprint the technologies behind every page")
        .arg(arg!(-q --"quiet" "Suppress banner, progress and non-essential output").required(false))
        .arg(
            arg!([URLS])
                .help("Seed URLs to crawl")
                .num_args(1..)
                .required(false),
        )
        .arg(
            arg!(-H --"hosts-file" <PATH>)
                .required(false)
                .help("Path to a newline-delimited file of seed URLs")
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .arg(
            arg!(--"recurse" [BOOL])
                .required(false)
                .help("Follow discovered external links (use --recurse=false to fetch seeds only)")
                .value_parser(clap::value_parser!(bool))
                .require_equals(true)
                .default_value("true")
                .default_missing_value("true"),
        )
        .arg(
            arg!(-t --"max-heads" <NUM_WORKERS>)
                .required(false)
                .help("Maximum number of concurrent fetches in the worker pool")
                .value_parser(clap::value_parser!(usize))
                .default_value("1000"),
        )
        .arg(
            arg!(-d --"depth" <DEPTH>)
                .required(false)
                .help("Number of discovered link rounds to follow")
                .value_parser(clap::value_parser!(usize))
                .default_value("10"),
        )
        .arg(
            arg!(-s --"signatures" <PATH>)
                .required(false)
                .help("Path to the technology signature database")
                .default_value("technologies.json"),
        )
        .arg(
            arg!(-o --"output" <PATH>)
                .required(false)
                .help("Where to write the results (overwritten on every run)")
                .value_parser(clap::value_parser!(std::path::PathBuf))
                .default_value("fingerprints.json"),
        )
        .arg(
            arg!(-f --"format" <FORMAT>)
                .required(false)
                .help("Output file format: json, text")
                .value_parser(["json", "text"])
                .default_value("json"),
        )
        .arg(
            arg!(--"timeout" <SECONDS>)
                .required(false)
                .help("Request timeout in seconds")
                .value_parser(clap::value_parser!(u64))
                .default_value("5"),
        )
}
