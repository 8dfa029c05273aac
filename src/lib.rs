//! Background RSS poller.
//!
//! A [`feed::Scheduler`] periodically takes the stalest registered feeds
//! from a [`storage::FeedStore`], fetches and decodes them concurrently, and
//! stores items it has not seen before as posts.

pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
