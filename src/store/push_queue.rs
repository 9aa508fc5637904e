use futures::FutureExt;

use super::models::PushQueueLease;
use super::{now, Store};
use crate::error::AppResult;

impl Store {
    /// Leases the due item with the smallest `retry_time`, bumping
    /// `retry_time += retry_timeout` and incrementing `retries`. The
    /// returned record includes the client's current `push_sub` and
    /// `vapid_priv` so the dispatcher never needs a second round trip.
    pub async fn push_queue_next(&self, retry_timeout: i64) -> AppResult<Option<PushQueueLease>> {
        self.with_tx(move |tx| async move {
            let ts = now();

            let leased: Option<(i64, i64, String, i64)> = sqlx::query_as(
                "UPDATE push_queue \
                 SET retry_time = ? + ?, retries = retries + 1 \
                 WHERE id = ( \
                     SELECT id FROM push_queue WHERE retry_time <= ? \
                     ORDER BY retry_time ASC LIMIT 1 \
                 ) \
                 RETURNING id, client_id, message, retries",
            )
            .bind(ts)
            .bind(retry_timeout)
            .bind(ts)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((id, client_id, message, retries)) = leased else {
                return Ok(None);
            };

            let (push_sub, vapid_priv): (Option<String>, Vec<u8>) = sqlx::query_as(
                "SELECT push_sub, vapid_priv FROM clients WHERE client_id = ?",
            )
            .bind(client_id)
            .fetch_one(&mut *tx)
            .await?;

            Ok(Some(PushQueueLease {
                id,
                client_id,
                message,
                retries,
                push_sub,
                vapid_priv,
            }))
        }
        .boxed())
        .await
    }

    /// Deletes the leased item. If `unsub_client`, clears the client's
    /// `push_sub`; otherwise touches its `last_seen`.
    pub async fn push_queue_finish(&self, id: i64, unsub_client: bool) -> AppResult<()> {
        self.with_tx(move |tx| async move {
            let client_id: Option<i64> =
                sqlx::query_scalar("SELECT client_id FROM push_queue WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;

            sqlx::query("DELETE FROM push_queue WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            if let Some(client_id) = client_id {
                if unsub_client {
                    sqlx::query("UPDATE clients SET push_sub = NULL WHERE client_id = ?")
                        .bind(client_id)
                        .execute(&mut *tx)
                        .await?;
                } else {
                    sqlx::query("UPDATE clients SET last_seen = ? WHERE client_id = ?")
                        .bind(now())
                        .bind(client_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }

            Ok(())
        }
        .boxed())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::AdQueryRequest;

    async fn queued_item(store: &Store) -> (i64, i64) {
        store.create_session(b"pub", b"priv", "client-a").await.unwrap();
        store
            .update_client_push_sub(
                "client-a",
                Some(r#"{"endpoint":"https://push.example/ep","keys":{"auth":"a","p256dh":"p"}}"#.into()),
            )
            .await
            .unwrap();

        let ad_query_id = store
            .insert_ad_query(
                &AdQueryRequest {
                    nickname: "sale-watch".into(),
                    query: "sale-watch".into(),
                    filters: vec![],
                    subscribed: true,
                },
                Some("client-a"),
            )
            .await
            .unwrap()
            .unwrap();

        store
            .insert_ad(ad_query_id, "1", "Acme", "https://acme.example", now(), "SALE", b"", 3600, 0)
            .await
            .unwrap();

        let item: i64 = sqlx::query_scalar("SELECT id FROM push_queue LIMIT 1")
            .fetch_one(store.pool_for_test())
            .await
            .unwrap();
        let client_id: i64 = sqlx::query_scalar("SELECT client_id FROM push_queue WHERE id = ?")
            .bind(item)
            .fetch_one(store.pool_for_test())
            .await
            .unwrap();
        (item, client_id)
    }

    /// Testable property 6: `push_queue_next` followed by
    /// `push_queue_finish(id, unsub=false)` clears exactly the leased row
    /// and touches the client's `last_seen`.
    #[tokio::test]
    async fn finish_without_unsub_clears_row_and_touches_last_seen() {
        let store = Store::connect_in_memory().await.unwrap();
        let (_item, client_id) = queued_item(&store).await;

        sqlx::query("UPDATE clients SET last_seen = 0 WHERE client_id = ?")
            .bind(client_id)
            .execute(store.pool_for_test())
            .await
            .unwrap();

        let leased = store.push_queue_next(30).await.unwrap().unwrap();
        assert_eq!(leased.retries, 1);
        assert!(leased.push_sub.is_some());

        store.push_queue_finish(leased.id, false).await.unwrap();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM push_queue")
            .fetch_one(store.pool_for_test())
            .await
            .unwrap();
        assert_eq!(remaining, 0);

        let last_seen: i64 = sqlx::query_scalar("SELECT last_seen FROM clients WHERE client_id = ?")
            .bind(client_id)
            .fetch_one(store.pool_for_test())
            .await
            .unwrap();
        assert!(last_seen > 0);

        let push_sub: Option<String> =
            sqlx::query_scalar("SELECT push_sub FROM clients WHERE client_id = ?")
                .bind(client_id)
                .fetch_one(store.pool_for_test())
                .await
                .unwrap();
        assert!(push_sub.is_some());
    }

    #[tokio::test]
    async fn finish_with_unsub_clears_client_push_sub() {
        let store = Store::connect_in_memory().await.unwrap();
        let (_item, client_id) = queued_item(&store).await;

        let leased = store.push_queue_next(30).await.unwrap().unwrap();
        store.push_queue_finish(leased.id, true).await.unwrap();

        let push_sub: Option<String> =
            sqlx::query_scalar("SELECT push_sub FROM clients WHERE client_id = ?")
                .bind(client_id)
                .fetch_one(store.pool_for_test())
                .await
                .unwrap();
        assert!(push_sub.is_none());
    }

    #[tokio::test]
    async fn push_queue_next_returns_none_when_nothing_due() {
        let store = Store::connect_in_memory().await.unwrap();
        assert!(store.push_queue_next(30).await.unwrap().is_none());
    }
}
