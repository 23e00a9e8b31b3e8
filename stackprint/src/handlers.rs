use clap::ArgMatches;
use colored::Colorize;
use stackprint_core::crawl::{CrawlOptions, execute_crawl, generate_crawl_report};
use stackprint_core::report::{ReportFormat, save_fingerprints, save_report};
use stackprint_scanner::{SignatureError, SignatureStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Log to stderr; `RUST_LOG` overrides the default level.
pub fn init_tracing(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Collect seed URLs from the positional arguments and an optional hosts file
pub fn load_urls_from_source(
    urls: &[String],
    hosts_file: Option<&PathBuf>,
) -> Result<Vec<String>, String> {
    let mut seeds: Vec<String> = urls.iter().filter_map(|u| parse_url_line(u.trim())).collect();

    if let Some(hosts_file_path) = hosts_file {
        seeds.extend(load_urls_from_file(hosts_file_path)?);
    }

    if seeds.is_empty() {
        return Err("Input urls as args or provide --hosts-file".to_string());
    }

    Ok(seeds)
}

/// Load and parse URLs from a file
pub fn load_urls_from_file(path: &PathBuf) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read hosts file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| parse_url_line(line.trim()))
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as a URL, trying to add http:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    if let Ok(url) = Url::parse(line)
        && url.has_host()
    {
        return Some(line.to_string());
    }

    let with_scheme = format!("http://{}", line);
    if Url::parse(&with_scheme).is_ok() {
        return Some(with_scheme);
    }

    warn!("Skipping invalid URL '{}'", line);
    None
}

/// Expand `~` in the signature path and load the store
pub fn load_signatures(path: &str) -> Result<SignatureStore, SignatureError> {
    let expanded = shellexpand::tilde(path);
    SignatureStore::from_path(Path::new(expanded.as_ref()))
}

fn write_output(
    result: &stackprint_scanner::CrawlResult,
    format: ReportFormat,
    output: &Path,
) -> Result<(), stackprint_core::report::ReportError> {
    match format {
        ReportFormat::Json => save_fingerprints(&result.fingerprints, output),
        ReportFormat::Text => {
            colored::control::set_override(false);
            let report = generate_crawl_report(result);
            colored::control::unset_override();
            save_report(&report, output)
        }
    }
}

pub async fn handle_crawl(matches: &ArgMatches) {
    let quiet = matches.get_flag("quiet");
    let positional: Vec<String> = matches
        .get_many::<String>("URLS")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let hosts_file = matches.get_one::<PathBuf>("hosts-file");
    let recurse = matches.get_one::<bool>("recurse").copied().unwrap_or(true);
    let workers = *matches.get_one::<usize>("max-heads").unwrap_or(&1000);
    let max_depth = *matches.get_one::<usize>("depth").unwrap_or(&10);
    let timeout_secs = *matches.get_one::<u64>("timeout").unwrap_or(&5);
    let signatures_path = matches
        .get_one::<String>("signatures")
        .map(String::as_str)
        .unwrap_or("technologies.json");
    let output = matches
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(stackprint_core::report::DEFAULT_OUTPUT_PATH));
    let format = matches
        .get_one::<String>("format")
        .and_then(|f| f.parse::<ReportFormat>().ok())
        .unwrap_or(ReportFormat::Json);

    let urls = match load_urls_from_source(&positional, hosts_file) {
        Ok(urls) => urls,
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    };

    let signatures = match load_signatures(signatures_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    };

    if !quiet {
        eprintln!("{} Fingerprinting {} seed(s)", "→".blue(), urls.len());
        eprintln!("Workers: {}", workers);
        eprintln!("Max depth: {}", max_depth);
        eprintln!("Recurse: {}", recurse);
        eprintln!("Signatures: {}\n", signatures.len());
    }

    let options = CrawlOptions {
        urls,
        workers,
        max_depth,
        recurse,
        timeout_secs,
        show_progress_bars: !quiet,
    };

    let progress_callback = Arc::new(move |msg: String| {
        if !quiet {
            eprintln!("{}", msg);
        }
    });

    let result = match execute_crawl(options, signatures, Some(progress_callback)).await {
        Ok(result) => result,
        Err(e) => {
            error!("Crawl failed: {}", e);
            eprintln!("{} Crawl failed: {}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    };

    if !quiet {
        print!("{}", generate_crawl_report(&result));
    }

    match write_output(&result, format, &output) {
        Ok(()) => {
            if !quiet {
                eprintln!(
                    "{} Saved results to {}",
                    "✓".green().bold(),
                    output.display().to_string().bright_white()
                );
            }
        }
        // the crawl itself is complete; only persistence failed
        Err(e) => error!("Could not save results to {}: {}", output.display(), e),
    }
}
