//! Feed polling: fetching, decoding and ingesting RSS feeds.
//!
//! - [`parser`] - streaming RSS decoder built on `quick-xml`
//! - [`dates`] - lenient `<pubDate>` parsing across common layouts
//! - [`fetcher`] - bounded HTTP retrieval of feed documents
//! - [`worker`] - validate, claim, fetch and store one feed
//! - [`scheduler`] - fixed-interval batches of workers with cancellation
//!
//! # Example
//!
//! ```ignore
//! use feedsniff::feed::{Backoff, FeedFetcher, Scheduler, ScrapeOptions};
//!
//! let scheduler = Scheduler::new(store, fetcher, options, 10, Duration::from_secs(60));
//! scheduler.run(shutdown_token).await;
//! ```

pub mod dates;
pub mod fetcher;
pub mod parser;
pub mod scheduler;
pub mod worker;

pub use dates::{parse_pub_date, DateParseError};
pub use fetcher::{FeedFetcher, FetchError};
pub use parser::{parse_feed, FeedDocument, FeedItem, ParseError};
pub use scheduler::Scheduler;
pub use worker::{scrape_feed, Backoff, ScrapeError, ScrapeOptions, ScrapeResult, ScrapeSummary};
