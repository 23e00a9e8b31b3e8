pub mod crawler;
pub mod error;
pub mod fetcher;
pub mod fingerprint;
pub mod result;
pub mod signature;

pub use crawler::{Crawler, ProgressCallback};
pub use error::{ScanError, SignatureError};
pub use fetcher::{FetchedPage, Fetcher, PeerCertificate};
pub use fingerprint::{Evidence, Fingerprint, Technology, build_fingerprint, extract_links};
pub use result::CrawlResult;
pub use signature::{Category, Signature, SignatureStore};
