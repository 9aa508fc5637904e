use std::collections::HashSet;

use futures::FutureExt;
use sha2::{Digest, Sha256};

use super::models::{AdContentRow, NotificationAd, NotificationPayload};
use super::{now, truncate_notification_text, Store};
use crate::error::{AppError, AppResult};

impl Store {
    /// Set difference `ids \ {stored external ids for this query}`.
    pub async fn unseen_ad_ids(&self, ad_query_id: i64, ids: &[String]) -> AppResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();

        self.with_tx(move |tx| {
            let ids = ids.clone();
            async move {
                let placeholders = std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "SELECT id FROM ad_content WHERE ad_query_id = ? AND id IN ({placeholders})"
                );

                let mut query = sqlx::query_scalar::<_, String>(&sql).bind(ad_query_id);
                for id in &ids {
                    query = query.bind(id);
                }

                let stored: HashSet<String> = query.fetch_all(&mut *tx).await?.into_iter().collect();
                Ok(ids.into_iter().filter(|id| !stored.contains(id)).collect())
            }
            .boxed()
        })
        .await
    }

    /// Upserts an AdContent row, refreshes the AdContentText ledger, and
    /// fans out a PushQueueItem per subscribed, push-capable client when the
    /// text is novel and the query is not in its notify cooldown. Returns
    /// `false` if the query no longer exists (no rows written in that case).
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_ad(
        &self,
        ad_query_id: i64,
        id: &str,
        account_name: &str,
        account_url: &str,
        start_date: i64,
        text: &str,
        screenshot: &[u8],
        text_expiration: i64,
        min_notify_interval: i64,
    ) -> AppResult<bool> {
        let id = id.to_string();
        let account_name = account_name.to_string();
        let account_url = account_url.to_string();
        let text = text.to_string();
        let screenshot = screenshot.to_vec();

        self.with_tx(move |tx| {
            let id = id.clone();
            let account_name = account_name.clone();
            let account_url = account_url.clone();
            let text = text.clone();
            let screenshot = screenshot.clone();
            async move {
                let ts = now();

                let query_row: Option<(Option<i64>, String)> = sqlx::query_as(
                    "SELECT last_notify, nickname FROM ad_queries WHERE ad_query_id = ?",
                )
                .bind(ad_query_id)
                .fetch_optional(&mut *tx)
                .await?;
                let Some((last_notify, nickname)) = query_row else {
                    return Ok(false);
                };

                let text_hash = hex::encode(Sha256::digest(text.to_ascii_lowercase().as_bytes()));

                sqlx::query(
                    "INSERT INTO ad_content \
                     (ad_query_id, id, account_name, account_url, start_date, last_seen, \
                      text_hash, text, screenshot) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT (ad_query_id, id) DO UPDATE SET \
                         account_name = excluded.account_name, \
                         account_url = excluded.account_url, \
                         start_date = excluded.start_date, \
                         last_seen = excluded.last_seen, \
                         text_hash = excluded.text_hash, \
                         text = excluded.text, \
                         screenshot = excluded.screenshot",
                )
                .bind(ad_query_id)
                .bind(&id)
                .bind(&account_name)
                .bind(&account_url)
                .bind(start_date)
                .bind(ts)
                .bind(&text_hash)
                .bind(&text)
                .bind(&screenshot)
                .execute(&mut *tx)
                .await?;

                let existing_text_last_seen: Option<i64> = sqlx::query_scalar(
                    "SELECT last_seen FROM ad_content_text WHERE ad_query_id = ? AND text_hash = ?",
                )
                .bind(ad_query_id)
                .bind(&text_hash)
                .fetch_optional(&mut *tx)
                .await?;

                let text_is_fresh = existing_text_last_seen
                    .map(|last_seen| ts - last_seen < text_expiration)
                    .unwrap_or(false);

                sqlx::query(
                    "INSERT INTO ad_content_text (ad_query_id, text_hash, text, last_seen) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT (ad_query_id, text_hash) DO UPDATE SET last_seen = excluded.last_seen",
                )
                .bind(ad_query_id)
                .bind(&text_hash)
                .bind(&text)
                .bind(ts)
                .execute(&mut *tx)
                .await?;

                let notify_due = last_notify
                    .map(|ln| ts - ln >= min_notify_interval)
                    .unwrap_or(true);

                if !text_is_fresh && notify_due {
                    let payload = NotificationPayload {
                        ad_query_id,
                        nickname,
                        ad: NotificationAd {
                            id: id.clone(),
                            account_name: account_name.clone(),
                            account_url: account_url.clone(),
                            text: truncate_notification_text(&text),
                        },
                    };
                    let message =
                        serde_json::to_string(&payload).map_err(|e| AppError::Internal(e.into()))?;

                    let client_ids: Vec<i64> = sqlx::query_scalar(
                        "SELECT cs.client_id FROM client_subscriptions cs \
                         JOIN clients c ON c.client_id = cs.client_id \
                         WHERE cs.ad_query_id = ? AND c.push_sub IS NOT NULL",
                    )
                    .bind(ad_query_id)
                    .fetch_all(&mut *tx)
                    .await?;

                    for client_id in client_ids {
                        sqlx::query(
                            "INSERT INTO push_queue (client_id, message, retry_time, retries) \
                             VALUES (?, ?, ?, 0)",
                        )
                        .bind(client_id)
                        .bind(&message)
                        .bind(ts)
                        .execute(&mut *tx)
                        .await?;
                    }

                    sqlx::query("UPDATE ad_queries SET last_notify = ? WHERE ad_query_id = ?")
                        .bind(ts)
                        .bind(ad_query_id)
                        .execute(&mut *tx)
                        .await?;
                }

                Ok(true)
            }
            .boxed()
        })
        .await
    }

    /// Trims each query's AdContent to `max_ads` rows (victims: oldest
    /// `last_seen`, tiebreak oldest `start_date`), then drops AdContentText
    /// rows older than `text_expiration` with no surviving AdContent.
    pub async fn cleanup_ads(&self, max_ads: i64, text_expiration: i64) -> AppResult<()> {
        self.with_tx(move |tx| async move {
            sqlx::query(
                "DELETE FROM ad_content \
                 WHERE (ad_query_id, id) IN ( \
                     SELECT ad_query_id, id FROM ( \
                         SELECT ad_query_id, id, \
                                ROW_NUMBER() OVER ( \
                                    PARTITION BY ad_query_id \
                                    ORDER BY last_seen DESC, start_date DESC \
                                ) AS rn \
                         FROM ad_content \
                     ) WHERE rn > ? \
                 )",
            )
            .bind(max_ads)
            .execute(&mut *tx)
            .await?;

            let cutoff = now() - text_expiration;
            sqlx::query(
                "DELETE FROM ad_content_text \
                 WHERE last_seen < ? \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM ad_content \
                       WHERE ad_content.ad_query_id = ad_content_text.ad_query_id \
                         AND ad_content.text_hash = ad_content_text.text_hash \
                   )",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

            Ok(())
        }
        .boxed())
        .await
    }

    /// Ordered `(last_seen DESC, start_date DESC)`. Signals `DataArgument`
    /// if the query does not exist.
    pub async fn list_ad_content(&self, ad_query_id: i64) -> AppResult<Vec<AdContentRow>> {
        self.with_tx(move |tx| async move {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT ad_query_id FROM ad_queries WHERE ad_query_id = ?")
                    .bind(ad_query_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_none() {
                return Err(AppError::DataArgument(format!(
                    "unknown ad query {ad_query_id}"
                )));
            }

            let rows = sqlx::query_as::<_, AdContentRow>(
                "SELECT id, account_name, account_url, start_date, last_seen, text, screenshot \
                 FROM ad_content WHERE ad_query_id = ? \
                 ORDER BY last_seen DESC, start_date DESC",
            )
            .bind(ad_query_id)
            .fetch_all(&mut *tx)
            .await?;

            Ok(rows)
        }
        .boxed())
        .await
    }
}
