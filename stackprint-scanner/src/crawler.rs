use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::fingerprint::{Fingerprint, build_fingerprint};
use crate::result::CrawlResult;
use crate::signature::SignatureStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

pub type ProgressCallback = Arc<dyn Fn(usize, String) + Send + Sync>;

pub const DEFAULT_WORKERS: usize = 1000;
pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FetchCounts {
    dispatched: usize,
    finished: usize,
    failed: usize,
}

/// Dispatched/finished counters shared between the orchestrator and workers.
#[derive(Clone)]
struct FetchTracker {
    counts: Arc<watch::Sender<FetchCounts>>,
}

impl FetchTracker {
    fn new() -> Self {
        let (counts, _) = watch::channel(FetchCounts::default());
        Self {
            counts: Arc::new(counts),
        }
    }

    fn dispatched(&self) {
        self.counts.send_modify(|c| c.dispatched += 1);
    }

    /// Undo a dispatch whose URL never reached a worker.
    fn withdrawn(&self) {
        self.counts.send_modify(|c| c.dispatched -= 1);
    }

    fn finished(&self, ok: bool) {
        self.counts.send_modify(|c| {
            c.finished += 1;
            if !ok {
                c.failed += 1;
            }
        });
    }

    fn snapshot(&self) -> FetchCounts {
        *self.counts.borrow()
    }

    /// Resolves once every dispatched fetch has reported in.
    async fn wait_idle(&self) {
        let mut rx = self.counts.subscribe();
        let _ = rx.wait_for(|c| c.dispatched == c.finished).await;
    }
}

/// Pending URLs. The orchestrator owns the only sender; closing it is what
/// tells the workers to stop once the queue is empty.
struct Frontier {
    sender: Option<mpsc::UnboundedSender<String>>,
    tracker: FetchTracker,
}

impl Frontier {
    fn push(&self, url: String) {
        if let Some(sender) = &self.sender {
            self.tracker.dispatched();
            if let Err(mpsc::error::SendError(url)) = sender.send(url) {
                // no fetch happened, so this is neither finished nor failed
                warn!("Frontier receiver dropped, {} was not dispatched", url);
                self.tracker.withdrawn();
            }
        }
    }

    fn close(&mut self) {
        if self.sender.take().is_some() {
            debug!("Frontier closed");
        }
    }
}

pub struct Crawler {
    fetcher: Fetcher,
    signatures: Arc<SignatureStore>,
    visited: Arc<Mutex<HashSet<String>>>,
    results: Arc<Mutex<Vec<Fingerprint>>>,
    max_depth: usize,
    recurse: bool,
    progress_callback: Option<ProgressCallback>,
}

impl Crawler {
    pub fn new(signatures: Arc<SignatureStore>) -> Result<Self> {
        Ok(Self::with_fetcher(signatures, Fetcher::new()?))
    }

    pub fn with_timeout(signatures: Arc<SignatureStore>, timeout_secs: u64) -> Result<Self> {
        Ok(Self::with_fetcher(
            signatures,
            Fetcher::with_timeout(timeout_secs)?,
        ))
    }

    pub fn with_fetcher(signatures: Arc<SignatureStore>, fetcher: Fetcher) -> Self {
        Self {
            fetcher,
            signatures,
            visited: Arc::new(Mutex::new(HashSet::new())),
            results: Arc::new(Mutex::new(Vec::new())),
            max_depth: DEFAULT_MAX_DEPTH,
            recurse: true,
            progress_callback: None,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_recurse(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Fetch and fingerprint every seed, then every newly discovered origin,
    /// until the depth budget or the frontier runs out.
    ///
    /// Each link list published by a worker is one round and consumes one
    /// unit of depth. Seeds are free.
    pub async fn crawl(&self, seeds: &[String], workers: usize) -> Result<CrawlResult> {
        let workers = workers.max(1);
        info!(
            "Starting crawl of {} seed(s) with {} workers (depth {}, recurse {})",
            seeds.len(),
            workers,
            self.max_depth,
            self.recurse
        );

        self.visited.lock().await.clear();
        self.results.lock().await.clear();

        let tracker = FetchTracker::new();
        let (frontier_tx, frontier_rx) = mpsc::unbounded_channel::<String>();
        let frontier_rx = Arc::new(Mutex::new(frontier_rx));
        let (rounds_tx, mut rounds_rx) = mpsc::unbounded_channel::<Vec<String>>();
        let mut frontier = Frontier {
            sender: Some(frontier_tx),
            tracker: tracker.clone(),
        };

        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let fetcher = self.fetcher.clone();
            let signatures = self.signatures.clone();
            let results = self.results.clone();
            let frontier_rx = frontier_rx.clone();
            let tracker = tracker.clone();
            let progress_cb = self.progress_callback.clone();
            let rounds_tx = self.recurse.then(|| rounds_tx.clone());

            let handle = tokio::spawn(async move {
                debug!("Worker {} started", worker_id);

                loop {
                    let next = { frontier_rx.lock().await.recv().await };
                    let Some(url) = next else {
                        break;
                    };

                    if let Some(ref callback) = progress_cb {
                        callback(worker_id, url.clone());
                    }

                    let ok = match Self::fingerprint_url(&fetcher, &signatures, &url).await {
                        Some(fingerprint) => {
                            let links = fingerprint.external_links.clone();
                            results.lock().await.push(fingerprint);

                            if let Some(ref rounds) = rounds_tx
                                && !links.is_empty()
                            {
                                // ignored once the orchestrator stops listening
                                let _ = rounds.send(links);
                            }
                            true
                        }
                        None => false,
                    };

                    tracker.finished(ok);
                }

                debug!("Worker {} finished", worker_id);
            });

            worker_handles.push(handle);
        }
        // Only workers publish rounds; with recursion off nobody does and the
        // round stream is closed from the start.
        drop(rounds_tx);

        {
            let mut visited = self.visited.lock().await;
            for seed in seeds {
                if visited.insert(seed.clone()) {
                    frontier.push(seed.clone());
                }
            }
        }

        if !self.recurse {
            info!("Recursion disabled, fetching seeds only");
        }

        let mut remaining_depth = self.max_depth;
        let mut depth_exhausted = false;

        loop {
            let round = tokio::select! {
                biased;
                round = rounds_rx.recv() => round,
                // A worker publishes its round before reporting in, so once
                // everything has reported in, any remaining round is queued.
                _ = tracker.wait_idle() => rounds_rx.try_recv().ok(),
            };
            let Some(round) = round else {
                break;
            };

            if remaining_depth == 0 {
                let counts = tracker.snapshot();
                info!("Reached max depth");
                info!(
                    "Waiting for {} fingerprints to finish generating",
                    counts.dispatched - counts.finished
                );
                depth_exhausted = true;
                break;
            }

            let queued = self.enqueue_round(round, &frontier).await;
            remaining_depth -= 1;
            debug!(
                "Queued {} new origin(s), {} round(s) of depth left",
                queued, remaining_depth
            );
        }

        tracker.wait_idle().await;
        frontier.close();
        drop(rounds_rx);

        for result in futures::future::join_all(worker_handles).await {
            result?;
        }

        let counts = tracker.snapshot();
        let fingerprints = self.results.lock().await.clone();
        info!(
            "Crawl complete. Fingerprinted {} of {} URLs ({} failed)",
            fingerprints.len(),
            counts.dispatched,
            counts.failed
        );

        Ok(CrawlResult {
            fingerprints,
            dispatched: counts.dispatched,
            failed: counts.failed,
            depth_exhausted,
        })
    }

    async fn enqueue_round(&self, round: Vec<String>, frontier: &Frontier) -> usize {
        let mut visited = self.visited.lock().await;
        let mut queued = 0;
        for link in round {
            if visited.insert(link.clone()) {
                frontier.push(link);
                queued += 1;
            }
        }
        queued
    }

    async fn fingerprint_url(
        fetcher: &Fetcher,
        signatures: &Arc<SignatureStore>,
        url: &str,
    ) -> Option<Fingerprint> {
        let page = match fetcher.fetch(url).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Error fetching {}: {}", url, e);
                return None;
            }
        };

        // Matching thousands of patterns is CPU bound; keep it off the I/O threads.
        let signatures = signatures.clone();
        match tokio::task::spawn_blocking(move || build_fingerprint(&page, &signatures)).await {
            Ok(fingerprint) => Some(fingerprint),
            Err(e) => {
                warn!("Error generating fingerprint for {}: {}", url, e);
                None
            }
        }
    }

    pub async fn get_results(&self) -> Vec<Fingerprint> {
        self.results.lock().await.clone()
    }

    pub async fn get_visited_count(&self) -> usize {
        self.visited.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use wiremock::{
        matchers::method,
        Mock, MockServer, ResponseTemplate,
    };

    const SIGNATURES: &str = r#"{
        "categories": { "22": { "name": "Web servers", "priority": 8 } },
        "technologies": {
            "Nginx": { "cats": [22], "headers": { "Server": "nginx" } },
            "jQuery": { "scripts": ["jquery[.-]"] }
        }
    }"#;

    /// Discovered links are bare `http://host` origins, so every mock server
    /// gets its own host name pinned to its local address.
    fn crawler(origins: &[(&str, &MockServer)]) -> Crawler {
        let store = SignatureStore::from_json_str(SIGNATURES).unwrap();
        let pins: Vec<(String, SocketAddr)> = origins
            .iter()
            .map(|(host, server)| (host.to_string(), *server.address()))
            .collect();

        let fetcher = Fetcher::build(2, move |mut builder| {
            for (host, addr) in &pins {
                builder = builder.resolve(host, *addr);
            }
            builder
        })
        .unwrap();

        Crawler::with_fetcher(Arc::new(store), fetcher)
    }

    fn origin(host: &str) -> String {
        format!("http://{}", host)
    }

    fn linking_to(hosts: &[&str]) -> String {
        let mut html = String::from("<html><body>");
        for host in hosts {
            html.push_str(&format!(r#"<a href="https://{}/page">link</a>"#, host));
        }
        html.push_str("</body></html>");
        html
    }

    async fn serve(server: &MockServer, body: String, expected_hits: u64) {
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(body),
            )
            .expect(expected_hits)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_follows_links_and_fetches_each_origin_once() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;

        serve(&a, linking_to(&["b.test", "b.test"]), 1).await;
        // B links back to A, which is already visited.
        serve(&b, linking_to(&["a.test"]), 1).await;

        let crawler = crawler(&[("a.test", &a), ("b.test", &b)]);
        let result = crawler.crawl(&[origin("a.test")], 4).await.unwrap();

        assert_eq!(result.fingerprints.len(), 2);
        assert_eq!(result.dispatched, 2);
        assert_eq!(result.failed, 0);
        assert!(!result.depth_exhausted);
        assert_eq!(crawler.get_visited_count().await, 2);
    }

    #[tokio::test]
    async fn test_depth_zero_only_fetches_seed() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;

        serve(&a, linking_to(&["b.test"]), 1).await;
        serve(&b, String::new(), 0).await;

        let result = crawler(&[("a.test", &a), ("b.test", &b)])
            .with_max_depth(0)
            .crawl(&[origin("a.test")], 2)
            .await
            .unwrap();

        assert_eq!(result.fingerprints.len(), 1);
        assert_eq!(result.fingerprints[0].url, origin("a.test"));
        assert_eq!(result.fingerprints[0].external_links, vec![origin("b.test")]);
        assert!(result.depth_exhausted);
    }

    #[tokio::test]
    async fn test_depth_budget_counts_rounds() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;
        let c = MockServer::start().await;
        let d = MockServer::start().await;

        serve(&a, linking_to(&["b.test"]), 1).await;
        serve(&b, linking_to(&["c.test"]), 1).await;
        serve(&c, linking_to(&["d.test"]), 1).await;
        serve(&d, String::new(), 0).await;

        let result = crawler(&[("a.test", &a), ("b.test", &b), ("c.test", &c), ("d.test", &d)])
            .with_max_depth(2)
            .crawl(&[origin("a.test")], 3)
            .await
            .unwrap();

        assert_eq!(result.fingerprints.len(), 3);
        assert!(result.depth_exhausted);
    }

    #[tokio::test]
    async fn test_recursion_disabled_fetches_seeds_only() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;
        let c = MockServer::start().await;

        serve(&a, linking_to(&["c.test"]), 1).await;
        serve(&b, linking_to(&["c.test"]), 1).await;
        serve(&c, String::new(), 0).await;

        let crawler = crawler(&[("a.test", &a), ("b.test", &b), ("c.test", &c)]).with_recurse(false);
        let result = crawler
            .crawl(&[origin("a.test"), origin("b.test")], 4)
            .await
            .unwrap();

        assert_eq!(result.fingerprints.len(), 2);
        assert_eq!(result.dispatched, 2);
        assert_eq!(crawler.get_visited_count().await, 2);
    }

    #[tokio::test]
    async fn test_shared_link_is_fetched_once() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;
        let c = MockServer::start().await;

        serve(&a, linking_to(&["c.test"]), 1).await;
        serve(&b, linking_to(&["c.test"]), 1).await;
        serve(&c, linking_to(&["a.test", "b.test"]), 1).await;

        let result = crawler(&[("a.test", &a), ("b.test", &b), ("c.test", &c)])
            .crawl(&[origin("a.test"), origin("b.test"), origin("a.test")], 8)
            .await
            .unwrap();

        assert_eq!(result.fingerprints.len(), 3);
        assert_eq!(result.dispatched, 3);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_counted_and_excluded() {
        let a = MockServer::start().await;
        let broken = MockServer::start().await;
        let c = MockServer::start().await;

        serve(&a, linking_to(&["broken.test", "c.test"]), 1).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&broken)
            .await;
        serve(&c, String::new(), 1).await;

        let result = crawler(&[("a.test", &a), ("broken.test", &broken), ("c.test", &c)])
            .crawl(&[origin("a.test")], 4)
            .await
            .unwrap();

        assert_eq!(result.dispatched, 3);
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded(), 2);
        assert!(
            result
                .fingerprints
                .iter()
                .all(|f| f.url != origin("broken.test"))
        );
    }

    #[tokio::test]
    async fn test_terminates_when_frontier_is_exhausted() {
        let a = MockServer::start().await;
        serve(&a, "<html>no links here</html>".to_string(), 1).await;

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            crawler(&[("a.test", &a)]).crawl(&[origin("a.test")], 16),
        )
        .await
        .expect("crawl should finish once the frontier is empty")
        .unwrap();

        assert_eq!(result.fingerprints.len(), 1);
        assert!(!result.depth_exhausted);
    }

    #[tokio::test]
    async fn test_invalid_seed_counts_as_failed() {
        let result = crawler(&[])
            .crawl(&["not a url".to_string()], 1)
            .await
            .unwrap();

        assert!(result.fingerprints.is_empty());
        assert_eq!(result.dispatched, 1);
        assert_eq!(result.failed, 1);
    }

    #[tokio::test]
    async fn test_undelivered_url_is_not_counted() {
        let tracker = FetchTracker::new();
        let (sender, receiver) = mpsc::unbounded_channel::<String>();
        drop(receiver);
        let frontier = Frontier {
            sender: Some(sender),
            tracker: tracker.clone(),
        };

        frontier.push(origin("a.test"));

        assert_eq!(tracker.snapshot(), FetchCounts::default());
        tokio::time::timeout(Duration::from_secs(1), tracker.wait_idle())
            .await
            .expect("nothing is outstanding");
    }

    #[tokio::test]
    async fn test_no_seeds() {
        let result = crawler(&[]).crawl(&[], 4).await.unwrap();
        assert!(result.fingerprints.is_empty());
        assert_eq!(result.dispatched, 0);
    }

    #[tokio::test]
    async fn test_technologies_are_detected_while_crawling() {
        let a = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("server", "nginx/1.25.3")
                    .set_body_string(r#"<script src="/static/jquery-3.7.1.min.js"></script>"#),
            )
            .mount(&a)
            .await;

        let result = crawler(&[("a.test", &a)])
            .crawl(&[origin("a.test")], 1)
            .await
            .unwrap();
        let fingerprint = &result.fingerprints[0];

        assert!(fingerprint.has_technology("Nginx"));
        assert!(fingerprint.has_technology("jQuery"));
        assert_eq!(
            fingerprint.technologies["Nginx"].categories[0].name,
            "Web servers"
        );
    }

    #[tokio::test]
    async fn test_progress_callback_sees_every_dispatched_url() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;
        serve(&a, linking_to(&["b.test"]), 1).await;
        serve(&b, String::new(), 1).await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let crawler = crawler(&[("a.test", &a), ("b.test", &b)]).with_progress_callback(Arc::new(
            move |_worker_id, url| {
                seen_clone.lock().unwrap().push(url);
            },
        ));

        crawler.crawl(&[origin("a.test")], 2).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![origin("a.test"), origin("b.test")]);
    }
}
