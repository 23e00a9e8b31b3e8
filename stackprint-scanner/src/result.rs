use crate::fingerprint::Fingerprint;
use serde::Serialize;

/// Everything a finished crawl produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlResult {
    pub fingerprints: Vec<Fingerprint>,
    /// URLs handed to the worker pool, seeds included.
    pub dispatched: usize,
    pub failed: usize,
    pub depth_exhausted: bool,
}

impl CrawlResult {
    pub fn succeeded(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn into_fingerprints(self) -> Vec<Fingerprint> {
        self.fingerprints
    }
}
