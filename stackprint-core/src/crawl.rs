use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use stackprint_scanner::crawler::{DEFAULT_MAX_DEPTH, DEFAULT_WORKERS};
use stackprint_scanner::fetcher::DEFAULT_TIMEOUT_SECS;
use stackprint_scanner::{CrawlResult, Crawler, Fingerprint, ScanError, SignatureStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

/// Options for configuring a crawl operation
pub struct CrawlOptions {
    pub urls: Vec<String>,
    pub workers: usize,
    pub max_depth: usize,
    pub recurse: bool,
    pub timeout_secs: u64,
    pub show_progress_bars: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            workers: DEFAULT_WORKERS,
            max_depth: DEFAULT_MAX_DEPTH,
            recurse: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            show_progress_bars: false,
        }
    }
}

/// Callback for reporting crawl progress
pub type CrawlProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Host portion of a URL, or the URL itself when it does not parse
pub fn extract_url_host(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|host| match u.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        })
        .unwrap_or_else(|| url.to_string())
}

/// Execute a crawl with the given options
pub async fn execute_crawl(
    options: CrawlOptions,
    signatures: Arc<SignatureStore>,
    progress_callback: Option<CrawlProgressCallback>,
) -> Result<CrawlResult, ScanError> {
    let CrawlOptions {
        urls,
        workers,
        max_depth,
        recurse,
        timeout_secs,
        show_progress_bars,
    } = options;

    let progress_bar = if show_progress_bars {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message("Starting crawl...");
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(Arc::new(pb))
    } else {
        None
    };

    let processed_count = Arc::new(AtomicUsize::new(0));

    let worker_callback: stackprint_scanner::ProgressCallback = {
        let pb = progress_bar.clone();
        let count = processed_count.clone();
        Arc::new(move |_worker_id: usize, url: String| {
            let processed = count.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(ref pb) = pb {
                pb.set_message(format!("Fingerprinting... {} URLs dispatched ({})", processed, url));
            }
        })
    };

    if let Some(ref callback) = progress_callback {
        callback(format!(
            "Crawling {} seed(s) with {} workers, depth {}, recurse {}",
            urls.len(),
            workers,
            max_depth,
            recurse
        ));
    }

    let crawler = Crawler::with_timeout(signatures, timeout_secs)?
        .with_max_depth(max_depth)
        .with_recurse(recurse)
        .with_progress_callback(worker_callback);

    let result = crawler.crawl(&urls, workers).await;

    if let Some(ref pb) = progress_bar {
        let total = processed_count.load(Ordering::Relaxed);
        pb.finish_with_message(format!("Crawl complete! {} URLs processed", total));
    }

    let result = result?;
    if let Some(ref callback) = progress_callback
        && result.depth_exhausted
    {
        callback("Maximum depth reached, remaining links were not followed".to_string());
    }

    Ok(result)
}

/// Number of pages each technology was seen on, most common first
pub fn technology_frequencies(fingerprints: &[Fingerprint]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for fingerprint in fingerprints {
        for name in fingerprint.technologies.keys() {
            *counts.entry(name.as_str()).or_default() += 1;
        }
    }

    let mut frequencies: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    frequencies.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    frequencies
}

/// Generate a crawl report from results
pub fn generate_crawl_report(result: &CrawlResult) -> String {
    let fingerprints = &result.fingerprints;
    let frequencies = technology_frequencies(fingerprints);

    let mut report = String::new();
    report.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");
    report.push_str("# Summary:\n");
    report.push_str(&format!("  Pages fingerprinted: {}\n", fingerprints.len()));
    report.push_str(&format!("  URLs dispatched: {}\n", result.dispatched));
    report.push_str(&format!("  Failed fetches: {}\n", result.failed));
    report.push_str(&format!("  Distinct technologies: {}\n", frequencies.len()));
    if result.depth_exhausted {
        report.push_str("  Maximum depth reached\n");
    }

    report.push_str("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");

    if !frequencies.is_empty() {
        report.push_str("## Technologies\n");
        for (name, count) in &frequencies {
            let pages = if *count == 1 { "page" } else { "pages" };
            report.push_str(&format!("  {} ({} {})\n", name.bright_white().bold(), count, pages));
        }
        report.push('\n');
    }

    // Group results by host
    let mut by_host: BTreeMap<String, Vec<&Fingerprint>> = BTreeMap::new();
    for fingerprint in fingerprints {
        by_host
            .entry(extract_url_host(&fingerprint.url))
            .or_default()
            .push(fingerprint);
    }

    for (host, host_fingerprints) in &by_host {
        report.push_str(&format!("## {}\n", host));

        for fingerprint in host_fingerprints {
            report.push_str(&format!(
                "  {} {}\n",
                fingerprint.url,
                format!("({} external links)", fingerprint.external_links.len()).dimmed()
            ));

            if fingerprint.technologies.is_empty() {
                report.push_str(&format!("    {}\n", "no technologies detected".dimmed()));
            }

            for technology in fingerprint.technologies.values() {
                let categories: Vec<&str> = technology
                    .categories
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect();
                let evidence: Vec<String> =
                    technology.detected_by.iter().map(|e| e.to_string()).collect();

                let mut line = format!("    {}", technology.name.green());
                if !categories.is_empty() {
                    line.push_str(&format!(" [{}]", categories.join(", ")));
                }
                line.push_str(&format!(" {}", evidence.join(", ").dimmed()));
                report.push_str(&line);
                report.push('\n');
            }
        }
        report.push('\n');
    }

    report
}
