// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{
    handle_crawl, init_tracing, load_signatures, load_urls_from_file, load_urls_from_source,
    parse_url_line,
};

// Re-export crawl functionality from stackprint-core
pub use stackprint_core::crawl::{
    CrawlOptions, CrawlProgressCallback, execute_crawl, extract_url_host, generate_crawl_report,
};
