//! The ingestion pipeline: everything between a feed URL and a stored post.
//!
//! A tick walks each registered feed through the same stages:
//!
//! - `fetcher` - conditional HTTP retrieval with bounded retry
//! - `parser` - RSS/Atom/JSON Feed decoding via `feed-rs`
//! - `fingerprint` - stable entry identity for deduplication
//! - `extract` - full-text extraction with summary fallback
//! - `sanitize` - HTML allowlist filtering
//!
//! The `coordinator` fans feeds out over a bounded worker pool and records
//! one job per tick; the `scheduler` drives it on an interval. `opml` handles
//! subscription import/export at the edges.

mod coordinator;
mod extract;
mod fetcher;
mod fingerprint;
mod opml;
mod parser;
mod sanitize;
mod scheduler;

pub use coordinator::{Coordinator, TickSummary};
pub use extract::{ContentExtractor, ExtractedContent};
pub use fetcher::{CacheValidators, FeedFetch, FetchError, Fetcher};
pub use fingerprint::fingerprint;
pub use opml::{export_opml, export_to_file, parse as parse_opml, OpmlError};
pub use parser::{parse_feed, EntryOutcome, FeedFormat, ParseError, ParsedEntry, ParsedFeed};
pub use sanitize::{
    extract_text, sanitize, SanitizeLevel, SanitizePolicy, DEFAULT_ALLOWED_TAGS,
};
pub use scheduler::{Scheduler, SchedulerHandle};
