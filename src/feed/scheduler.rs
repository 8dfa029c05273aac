use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::fetcher::FeedFetcher;
use super::worker::{scrape_feed, ScrapeOptions, ScrapeResult};
use crate::storage::FeedStore;

/// Fixed-interval poller over a [`FeedStore`].
///
/// Each tick takes up to `concurrency` of the stalest eligible feeds and
/// scrapes them concurrently, waiting for the whole batch before the next
/// tick.
pub struct Scheduler {
    store: Arc<dyn FeedStore>,
    fetcher: FeedFetcher,
    options: ScrapeOptions,
    concurrency: usize,
    interval: Duration,
}

impl Scheduler {
    /// `concurrency` is raised to 1 and `interval` to 1ms if given as zero.
    pub fn new(
        store: Arc<dyn FeedStore>,
        fetcher: FeedFetcher,
        options: ScrapeOptions,
        concurrency: usize,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            fetcher,
            options,
            concurrency: concurrency.max(1),
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The first tick fires immediately. Ticks that would have fired while a
    /// batch was still running are skipped rather than replayed. Cancellation
    /// is observed between ticks, so an in-flight batch always completes.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            concurrency = self.concurrency,
            interval_ms = self.interval.as_millis() as u64,
            "Collecting feeds"
        );

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Feed collection stopped");
                    break;
                }
                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Run one batch and return the per-feed outcomes in completion order.
    ///
    /// A failed batch query is logged and yields an empty result.
    pub async fn tick(&self) -> Vec<ScrapeResult> {
        let feeds = match self.store.list_feeds_to_fetch(self.concurrency).await {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::warn!(error = %e, "Couldn't get next feeds to fetch");
                return Vec::new();
            }
        };

        tracing::info!(count = feeds.len(), "Found feeds to fetch");

        let store = self.store.as_ref();
        stream::iter(feeds)
            .map(|feed| async move { scrape_feed(store, &self.fetcher, &self.options, &feed).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}
