use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::browser::{reencode_screenshot, HeadlessBrowser};
use crate::config::IntervalsConfig;
use crate::error::AppResult;
use crate::store::Store;

const IDLE_SLEEP: Duration = Duration::from_secs(10);

/// A single long-lived worker (core spec §4.2): picks the next due query,
/// invokes the browser, compares results against stored ads, inserts
/// novelties, and updates per-query scheduling metadata. Never parallel.
pub struct CrawlScheduler {
    store: Arc<Store>,
    browser: Arc<dyn HeadlessBrowser>,
    intervals: IntervalsConfig,
}

impl CrawlScheduler {
    pub fn new(store: Arc<Store>, browser: Arc<dyn HeadlessBrowser>, intervals: IntervalsConfig) -> Self {
        Self {
            store,
            browser,
            intervals,
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        if let Err(e) = self
            .store
            .cleanup_ads(
                self.intervals.max_ad_history,
                self.intervals.ad_text_expiration_secs,
            )
            .await
        {
            tracing::warn!("startup ad cleanup failed: {:?}", e);
        }

        loop {
            if shutdown.try_recv().is_ok() {
                tracing::info!("crawl scheduler shutting down");
                return;
            }

            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            tracing::info!("crawl scheduler shutting down");
                            return;
                        }
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("crawl scheduler pass failed: {:?}", e);
                }
            }
        }
    }

    /// Runs one pass. Returns `Ok(false)` when there was no due query
    /// (caller idle-sleeps), `Ok(true)` otherwise.
    async fn run_once(&self) -> AppResult<bool> {
        let Some(ad_query) = self
            .store
            .ad_query_next(self.intervals.refresh_interval_secs)
            .await?
        else {
            return Ok(false);
        };

        let filters: Vec<String> = serde_json::from_str(&ad_query.filters)
            .unwrap_or_default();
        let filters: Vec<String> = filters.iter().map(|f| f.to_ascii_lowercase()).collect();

        let results = match self.browser.query(&ad_query.query).await {
            Ok(results) => results,
            Err(e) => {
                self.store
                    .ad_query_finished_pull(ad_query.ad_query_id, Some(e.to_string()))
                    .await?;
                return Ok(true);
            }
        };

        // Keep a result only if the filter list is empty or any filter
        // substring is contained in the lowercased result text (core spec
        // §4.2 step 4, ASCII case folding on both sides).
        let kept: Vec<_> = results
            .into_iter()
            .filter(|r| {
                filters.is_empty()
                    || filters
                        .iter()
                        .any(|f| r.text.to_ascii_lowercase().contains(f.as_str()))
            })
            .collect();

        let kept_ids: Vec<String> = kept.iter().map(|r| r.id.clone()).collect();
        let novelty: HashSet<String> = self
            .store
            .unseen_ad_ids(ad_query.ad_query_id, &kept_ids)
            .await?
            .into_iter()
            .collect();

        let novel_ids: Vec<String> = kept
            .iter()
            .filter(|r| novelty.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();

        let screenshots: HashMap<String, Vec<u8>> = match self.browser.screenshot_ids(&novel_ids).await
        {
            Ok(shots) => shots.into_iter().collect(),
            Err(e) => {
                self.store
                    .ad_query_finished_pull(ad_query.ad_query_id, Some(e.to_string()))
                    .await?;
                return Ok(true);
            }
        };

        // Reverse of the browser's returned order, so the oldest novel ad
        // is inserted (and therefore notified) first (core spec §4.2 step 7).
        for result in kept.iter().filter(|r| novelty.contains(&r.id)).rev() {
            let screenshot = screenshots.get(&result.id).cloned().unwrap_or_default();
            let screenshot = reencode_screenshot(&screenshot);

            if let Err(e) = self
                .store
                .insert_ad(
                    ad_query.ad_query_id,
                    &result.id,
                    &result.account_name,
                    &result.account_url,
                    result.start_date,
                    &result.text,
                    &screenshot,
                    self.intervals.ad_text_expiration_secs,
                    self.intervals.min_notify_interval_secs,
                )
                .await
            {
                tracing::warn!("insert_ad failed for ad {}: {:?}", result.id, e);
            }
        }

        self.store
            .ad_query_finished_pull(ad_query.ad_query_id, None)
            .await?;
        self.store
            .cleanup_ads(
                self.intervals.max_ad_history,
                self.intervals.ad_text_expiration_secs,
            )
            .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::SearchResult;
    use crate::store::models::AdQueryRequest;

    struct FakeBrowser {
        results: Vec<SearchResult>,
    }

    #[async_trait::async_trait]
    impl HeadlessBrowser for FakeBrowser {
        async fn query(&self, _text: &str) -> AppResult<Vec<SearchResult>> {
            Ok(self.results.clone())
        }

        async fn screenshot_ids(&self, _ids: &[String]) -> AppResult<Vec<(String, Vec<u8>)>> {
            Ok(Vec::new())
        }
    }

    fn result(id: &str, text: &str, start_date: i64) -> SearchResult {
        SearchResult {
            id: id.into(),
            account_name: "Acme".into(),
            account_url: "https://acme.example".into(),
            start_date,
            text: text.into(),
        }
    }

    fn test_intervals() -> IntervalsConfig {
        IntervalsConfig {
            refresh_interval_secs: 0,
            ad_text_expiration_secs: 3600,
            min_notify_interval_secs: 0,
            max_ad_history: 50,
            session_expiration_secs: 3600,
            max_message_retries: 3,
            message_retry_interval_secs: 30,
        }
    }

    async fn inserted_ids_in_order(store: &Store, ad_query_id: i64) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT id FROM ad_content WHERE ad_query_id = ? ORDER BY rowid ASC",
        )
        .bind(ad_query_id)
        .fetch_all(store.pool_for_test())
        .await
        .unwrap()
    }

    /// Filters are ASCII-lowercase substring matches against the result
    /// text; an empty filter list keeps everything.
    #[tokio::test]
    async fn filters_keep_only_matching_results_case_insensitively() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let ad_query_id = store
            .insert_ad_query(
                &AdQueryRequest {
                    nickname: "sale-watch".into(),
                    query: "sale-watch".into(),
                    filters: vec!["SALE".into()],
                    subscribed: false,
                },
                None,
            )
            .await
            .unwrap()
            .unwrap();

        let browser = Arc::new(FakeBrowser {
            results: vec![
                result("1", "big SALE today", 100),
                result("2", "no discount here", 200),
            ],
        });

        let scheduler = CrawlScheduler::new(store.clone(), browser, test_intervals());
        assert!(scheduler.run_once().await.unwrap());

        let ids = inserted_ids_in_order(&store, ad_query_id).await;
        assert_eq!(ids, vec!["1".to_string()]);
    }

    /// Novel results are inserted oldest-first, i.e. reverse of whatever
    /// order the browser returned them in.
    #[tokio::test]
    async fn novel_results_are_inserted_in_reverse_order() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let ad_query_id = store
            .insert_ad_query(
                &AdQueryRequest {
                    nickname: "sale-watch".into(),
                    query: "sale-watch".into(),
                    filters: vec![],
                    subscribed: false,
                },
                None,
            )
            .await
            .unwrap()
            .unwrap();

        let browser = Arc::new(FakeBrowser {
            results: vec![
                result("newest", "ad text", 300),
                result("middle", "ad text", 200),
                result("oldest", "ad text", 100),
            ],
        });

        let scheduler = CrawlScheduler::new(store.clone(), browser, test_intervals());
        assert!(scheduler.run_once().await.unwrap());

        let ids = inserted_ids_in_order(&store, ad_query_id).await;
        assert_eq!(ids, vec!["oldest", "middle", "newest"]);
    }

    #[tokio::test]
    async fn idle_when_no_query_is_due() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let scheduler = CrawlScheduler::new(
            store,
            Arc::new(FakeBrowser { results: vec![] }),
            test_intervals(),
        );
        assert!(!scheduler.run_once().await.unwrap());
    }
}
