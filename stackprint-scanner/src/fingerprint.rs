//! Technology fingerprinting of a fetched page.
//!
//! Every signature in the store is tested against the page body, response
//! headers, cookies and TLS certificate issuers. Detections for the same
//! technology are merged into a single [`Technology`] whose evidence set is
//! the union of every method that fired. Implications are then applied in a
//! single pass over the directly detected technologies.

use crate::fetcher::FetchedPage;
use crate::signature::{Category, Signature, SignatureStore};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::debug;
use url::Url;

static HREF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="(.*?)""#).expect("href pattern is valid"));

/// How a technology was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Evidence {
    Html,
    Headers,
    Cookies,
    Certificate,
    Script,
    Implied,
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Evidence::Html => "by html",
            Evidence::Headers => "by headers",
            Evidence::Cookies => "by cookies",
            Evidence::Certificate => "by ssl certificates",
            Evidence::Script => "by scripts",
            Evidence::Implied => "by implication",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Technology {
    pub name: String,
    pub detected_by: BTreeSet<Evidence>,
    pub categories: Vec<Category>,
    #[serde(skip)]
    pub signature: Arc<Signature>,
}

/// Technology detection result for one page.
#[derive(Debug, Clone, Serialize)]
pub struct Fingerprint {
    pub url: String,
    pub external_links: Vec<String>,
    pub technologies: BTreeMap<String, Technology>,
    pub date_created: DateTime<Utc>,
}

impl Fingerprint {
    pub fn new(url: String, external_links: Vec<String>) -> Self {
        Self {
            url,
            external_links,
            technologies: BTreeMap::new(),
            date_created: Utc::now(),
        }
    }

    /// Record a detection. A repeat detection of the same technology merges
    /// its evidence into the existing entry.
    pub fn record_technology(
        &mut self,
        signature: &Arc<Signature>,
        evidence: Evidence,
        categories: Vec<Category>,
    ) {
        self.technologies
            .entry(signature.name.clone())
            .or_insert_with(|| Technology {
                name: signature.name.clone(),
                detected_by: BTreeSet::new(),
                categories,
                signature: Arc::clone(signature),
            })
            .detected_by
            .insert(evidence);
    }

    /// One hop only: the implies lists of technologies added here are not
    /// expanded further. A name missing from the store is still recorded,
    /// without categories.
    pub fn apply_implications(&mut self, store: &SignatureStore) {
        let implied: Vec<Arc<Signature>> = self
            .technologies
            .values()
            .flat_map(|tech| tech.signature.implies.iter())
            .map(|name| match store.get(name) {
                Some(signature) => Arc::clone(signature),
                None => {
                    debug!("{}: implied technology {} has no signature", self.url, name);
                    Arc::new(Signature::placeholder(name))
                }
            })
            .collect();

        for signature in implied {
            let categories = store.categories_for(&signature);
            self.record_technology(&signature, Evidence::Implied, categories);
        }
    }

    pub fn has_technology(&self, name: &str) -> bool {
        self.technologies.contains_key(name)
    }
}

/// Scan a fetched page against every signature in the store.
pub fn build_fingerprint(page: &FetchedPage, store: &SignatureStore) -> Fingerprint {
    let mut fingerprint = Fingerprint::new(page.url.clone(), extract_links(&page.body));

    for signature in store.iter() {
        let fired = detect(signature, page);
        if fired.is_empty() {
            continue;
        }
        let categories = store.categories_for(signature);
        for evidence in fired {
            fingerprint.record_technology(signature, evidence, categories.clone());
        }
    }

    fingerprint.apply_implications(store);

    debug!(
        "{}: {} technologies, {} external links",
        fingerprint.url,
        fingerprint.technologies.len(),
        fingerprint.external_links.len()
    );
    fingerprint
}

fn detect(signature: &Signature, page: &FetchedPage) -> Vec<Evidence> {
    let mut fired = Vec::new();

    if signature.html.iter().any(|p| p.is_match(&page.body)) {
        fired.push(Evidence::Html);
    }

    if signature
        .headers
        .iter()
        .any(|rule| rule.matches(page.header_pairs()))
    {
        fired.push(Evidence::Headers);
    }

    if signature
        .cookies
        .iter()
        .any(|rule| rule.matches(page.cookie_pairs()))
    {
        fired.push(Evidence::Cookies);
    }

    if let Some(issuer) = &signature.cert_issuer
        && page
            .certificates
            .iter()
            .any(|cert| cert.issuer.iter().any(|component| component == issuer))
    {
        fired.push(Evidence::Certificate);
    }

    // Script tags are not parsed; the patterns run against the raw body.
    if signature.scripts.iter().any(|p| p.is_match(&page.body)) {
        fired.push(Evidence::Script);
    }

    fired
}

/// Unique `http://host` origins of every absolute href in the body, in
/// first-seen order. Scheme, port and path are discarded.
pub fn extract_links(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for captures in HREF_PATTERN.captures_iter(body) {
        let Some(origin) = normalize_origin(&captures[1]) else {
            continue;
        };
        if seen.insert(origin.clone()) {
            links.push(origin);
        }
    }

    links
}

fn normalize_origin(href: &str) -> Option<String> {
    let url = Url::parse(href).ok()?;
    let host = url.host_str().filter(|host| !host.is_empty())?;
    Some(format!("http://{}", host))
}
