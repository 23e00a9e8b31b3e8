//! Technology signature database.
//!
//! Signatures are read once from a Wappalyzer-style `technologies.json`
//! document, their patterns compiled, and the resulting [`SignatureStore`]
//! shared read-only by every worker for the lifetime of a crawl.

use crate::error::SignatureError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Technology category metadata, looked up by numeric ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i64,
}

/// A name pattern with an optional value pattern. A rule without a value
/// pattern fires on the presence of a matching name alone.
#[derive(Debug, Clone)]
pub struct PairRule {
    pub name: Regex,
    pub value: Option<Regex>,
}

impl PairRule {
    pub fn matches<'a, I>(&self, pairs: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        pairs.into_iter().any(|(name, value)| {
            self.name.is_match(name)
                && self
                    .value
                    .as_ref()
                    .is_none_or(|pattern| pattern.is_match(value))
        })
    }
}

/// Compiled detection rules for one technology.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub categories: Vec<u32>,
    pub description: String,
    pub headers: Vec<PairRule>,
    pub html: Vec<Regex>,
    pub scripts: Vec<Regex>,
    pub cookies: Vec<PairRule>,
    pub cert_issuer: Option<String>,
    pub implies: Vec<String>,
    pub icon: String,
    pub website: String,
}

#[derive(Debug, Default, Deserialize)]
struct SignatureFile {
    #[serde(default)]
    categories: HashMap<String, Category>,
    #[serde(default)]
    technologies: HashMap<String, RawTechnology>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTechnology {
    #[serde(default)]
    cats: Vec<u32>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    html: OneOrMany,
    #[serde(default)]
    icon: String,
    #[serde(default)]
    implies: OneOrMany,
    #[serde(default)]
    scripts: OneOrMany,
    #[serde(default)]
    cookies: HashMap<String, String>,
    #[serde(default)]
    website: String,
    #[serde(default)]
    cert_issuer: String,
}

/// Wappalyzer data uses a bare string wherever a single-element list would do.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// Drop Wappalyzer's `\;version:\1` / `\;confidence:50` tags from a pattern.
fn strip_tags(raw: &str) -> &str {
    raw.split("\\;").next().unwrap_or_default()
}

fn compile(tech: &str, raw: &str, case_insensitive: bool) -> Option<Regex> {
    let pattern = strip_tags(raw);
    match RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
    {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!("Dropping pattern {:?} for {}: {}", raw, tech, e);
            None
        }
    }
}

fn compile_all(tech: &str, raw: Vec<String>) -> Vec<Regex> {
    raw.iter()
        .filter_map(|pattern| compile(tech, pattern, false))
        .collect()
}

/// Header names are compared case-insensitively since HTTP header names are.
fn compile_pairs(
    tech: &str,
    raw: HashMap<String, String>,
    case_insensitive_names: bool,
) -> Vec<PairRule> {
    raw.iter()
        .filter_map(|(name, value)| {
            let name = compile(tech, name, case_insensitive_names)?;
            let value = if strip_tags(value).is_empty() {
                None
            } else {
                Some(compile(tech, value, false)?)
            };
            Some(PairRule { name, value })
        })
        .collect()
}

impl Signature {
    /// A signature with no rules, standing in for an implied technology
    /// that the store does not describe.
    pub fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            categories: Vec::new(),
            description: String::new(),
            headers: Vec::new(),
            html: Vec::new(),
            scripts: Vec::new(),
            cookies: Vec::new(),
            cert_issuer: None,
            implies: Vec::new(),
            icon: String::new(),
            website: String::new(),
        }
    }

    fn from_raw(name: String, raw: RawTechnology) -> Self {
        let implies = raw
            .implies
            .into_vec()
            .iter()
            .map(|implied| strip_tags(implied).trim().to_string())
            .filter(|implied| !implied.is_empty())
            .collect();

        Self {
            categories: raw.cats,
            description: raw.description,
            headers: compile_pairs(&name, raw.headers, true),
            html: compile_all(&name, raw.html.into_vec()),
            scripts: compile_all(&name, raw.scripts.into_vec()),
            cookies: compile_pairs(&name, raw.cookies, false),
            cert_issuer: Some(raw.cert_issuer).filter(|issuer| !issuer.is_empty()),
            implies,
            icon: raw.icon,
            website: raw.website,
            name,
        }
    }
}

/// Read-only table of technology signatures and categories.
#[derive(Debug, Default)]
pub struct SignatureStore {
    signatures: HashMap<String, Arc<Signature>>,
    categories: HashMap<u32, Category>,
}

impl SignatureStore {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SignatureError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SignatureError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let store = Self::from_json_str(&content)?;
        info!(
            "Loaded {} signatures and {} categories from {}",
            store.len(),
            store.categories.len(),
            path.display()
        );
        Ok(store)
    }

    pub fn from_json_str(json: &str) -> Result<Self, SignatureError> {
        let file: SignatureFile = serde_json::from_str(json)?;

        let mut categories = HashMap::with_capacity(file.categories.len());
        for (id, category) in file.categories {
            match id.parse::<u32>() {
                Ok(id) => {
                    categories.insert(id, category);
                }
                Err(_) => debug!("Skipping category with non-numeric id {:?}", id),
            }
        }

        let signatures = file
            .technologies
            .into_iter()
            .map(|(name, raw)| (name.clone(), Arc::new(Signature::from_raw(name, raw))))
            .collect();

        Ok(Self {
            signatures,
            categories,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Signature>> {
        self.signatures.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Signature>> {
        self.signatures.values()
    }

    pub fn category(&self, id: u32) -> Option<&Category> {
        self.categories.get(&id)
    }

    /// Resolve a signature's category IDs, skipping IDs with no entry.
    pub fn categories_for(&self, signature: &Signature) -> Vec<Category> {
        signature
            .categories
            .iter()
            .filter_map(|id| self.category(*id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
