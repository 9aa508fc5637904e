use futures::FutureExt;

use super::models::{AdQuery, AdQueryRequest, AdQueryRow, AdQueryStatus};
use super::{hash_session_id, now, Store};
use crate::error::{AppError, AppResult};

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn nickname_conflict(e: sqlx::Error) -> AppError {
    if is_unique_violation(&e) {
        AppError::DataArgument("name is already in use".to_string())
    } else {
        AppError::Database(e)
    }
}

impl Store {
    /// Lists ad queries, optionally filtered to one id, with `subscribed`
    /// resolved against the client matching `session_id` (if any).
    pub async fn ad_queries(
        &self,
        session_id: Option<&str>,
        ad_query_id: Option<i64>,
    ) -> AppResult<Vec<AdQuery>> {
        let hash = session_id.map(hash_session_id);

        self.with_tx(move |tx| {
            let hash = hash.clone();
            async move {
                let client_id: Option<i64> = if let Some(h) = hash.as_deref() {
                    sqlx::query_scalar("SELECT client_id FROM clients WHERE session_hash = ?")
                        .bind(h)
                        .fetch_optional(&mut *tx)
                        .await?
                } else {
                    None
                };

                let rows: Vec<AdQueryRow> = if let Some(id) = ad_query_id {
                    sqlx::query_as(
                        "SELECT ad_query_id, nickname, query, filters, next_pull, last_pull, \
                         last_error, last_notify FROM ad_queries WHERE ad_query_id = ?",
                    )
                    .bind(id)
                    .fetch_all(&mut *tx)
                    .await?
                } else {
                    sqlx::query_as(
                        "SELECT ad_query_id, nickname, query, filters, next_pull, last_pull, \
                         last_error, last_notify FROM ad_queries",
                    )
                    .fetch_all(&mut *tx)
                    .await?
                };

                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let subscribed = match client_id {
                        Some(client_id) => {
                            sqlx::query_scalar::<_, i64>(
                                "SELECT client_id FROM client_subscriptions \
                                 WHERE ad_query_id = ? AND client_id = ?",
                            )
                            .bind(row.ad_query_id)
                            .bind(client_id)
                            .fetch_optional(&mut *tx)
                            .await?
                            .is_some()
                        }
                        None => false,
                    };
                    out.push(row.into_api(subscribed));
                }

                Ok(out)
            }
            .boxed()
        })
        .await
    }

    /// Returns the new id, or `None` if `sub_session_id` was given but no
    /// matching client exists (no rows are written in that case).
    pub async fn insert_ad_query(
        &self,
        req: &AdQueryRequest,
        sub_session_id: Option<&str>,
    ) -> AppResult<Option<i64>> {
        let req = req.clone();
        let sub_hash = sub_session_id.map(hash_session_id);

        self.with_tx(move |tx| {
            let req = req.clone();
            let sub_hash = sub_hash.clone();
            async move {
                let client_id = match sub_hash.as_deref() {
                    Some(hash) => {
                        let found: Option<i64> = sqlx::query_scalar(
                            "SELECT client_id FROM clients WHERE session_hash = ?",
                        )
                        .bind(hash)
                        .fetch_optional(&mut *tx)
                        .await?;
                        match found {
                            Some(id) => Some(id),
                            None => return Ok(None),
                        }
                    }
                    None => None,
                };

                let filters = serde_json::to_string(&req.filters).unwrap_or_else(|_| "[]".into());
                let ts = now();

                let ad_query_id: i64 = sqlx::query_scalar(
                    "INSERT INTO ad_queries (nickname, query, filters, next_pull) \
                     VALUES (?, ?, ?, ?) RETURNING ad_query_id",
                )
                .bind(&req.nickname)
                .bind(&req.query)
                .bind(&filters)
                .bind(ts)
                .fetch_one(&mut *tx)
                .await
                .map_err(nickname_conflict)?;

                if let Some(client_id) = client_id {
                    sqlx::query(
                        "INSERT INTO client_subscriptions (ad_query_id, client_id) VALUES (?, ?)",
                    )
                    .bind(ad_query_id)
                    .bind(client_id)
                    .execute(&mut *tx)
                    .await?;
                }

                Ok(Some(ad_query_id))
            }
            .boxed()
        })
        .await
    }

    /// Updates nickname/query/filters, resets `next_pull`/`last_notify`, then
    /// upserts or removes the caller's subscription to match `req.subscribed`.
    pub async fn update_ad_query(
        &self,
        ad_query_id: i64,
        req: &AdQueryRequest,
        session_id: &str,
    ) -> AppResult<(AdQuery, bool)> {
        let req = req.clone();
        let hash = hash_session_id(session_id);

        self.with_tx(move |tx| {
            let req = req.clone();
            let hash = hash.clone();
            async move {
                let filters = serde_json::to_string(&req.filters).unwrap_or_else(|_| "[]".into());
                let ts = now();

                let row: AdQueryRow = sqlx::query_as(
                    "UPDATE ad_queries \
                     SET nickname = ?, query = ?, filters = ?, next_pull = ?, last_notify = NULL \
                     WHERE ad_query_id = ? \
                     RETURNING ad_query_id, nickname, query, filters, next_pull, last_pull, \
                     last_error, last_notify",
                )
                .bind(&req.nickname)
                .bind(&req.query)
                .bind(&filters)
                .bind(ts)
                .bind(ad_query_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(nickname_conflict)?
                .ok_or_else(|| AppError::NotFound(format!("ad query {ad_query_id} not found")))?;

                let client_id: Option<i64> =
                    sqlx::query_scalar("SELECT client_id FROM clients WHERE session_hash = ?")
                        .bind(&hash)
                        .fetch_optional(&mut *tx)
                        .await?;

                let subscribed = match client_id {
                    Some(client_id) => {
                        if req.subscribed {
                            sqlx::query(
                                "INSERT INTO client_subscriptions (ad_query_id, client_id) \
                                 VALUES (?, ?) ON CONFLICT DO NOTHING",
                            )
                            .bind(ad_query_id)
                            .bind(client_id)
                            .execute(&mut *tx)
                            .await?;
                        } else {
                            sqlx::query(
                                "DELETE FROM client_subscriptions \
                                 WHERE ad_query_id = ? AND client_id = ?",
                            )
                            .bind(ad_query_id)
                            .bind(client_id)
                            .execute(&mut *tx)
                            .await?;
                        }
                        req.subscribed
                    }
                    None => false,
                };

                Ok((row.into_api(subscribed), subscribed))
            }
            .boxed()
        })
        .await
    }

    /// Leases the query with the smallest `next_pull < now`, bumping
    /// `next_pull += refresh_interval` for the selected row.
    pub async fn ad_query_next(&self, refresh_interval: i64) -> AppResult<Option<AdQueryRow>> {
        self.with_tx(move |tx| async move {
            let ts = now();
            let row = sqlx::query_as::<_, AdQueryRow>(
                "UPDATE ad_queries \
                 SET next_pull = ? + ? \
                 WHERE ad_query_id = ( \
                     SELECT ad_query_id FROM ad_queries WHERE next_pull < ? \
                     ORDER BY next_pull ASC LIMIT 1 \
                 ) \
                 RETURNING ad_query_id, nickname, query, filters, next_pull, last_pull, \
                 last_error, last_notify",
            )
            .bind(ts)
            .bind(refresh_interval)
            .bind(ts)
            .fetch_optional(&mut *tx)
            .await?;
            Ok(row)
        }
        .boxed())
        .await
    }

    pub async fn ad_query_finished_pull(
        &self,
        ad_query_id: i64,
        error: Option<String>,
    ) -> AppResult<()> {
        self.with_tx(move |tx| {
            let error = error.clone();
            async move {
                sqlx::query(
                    "UPDATE ad_queries SET last_pull = ?, last_error = ? WHERE ad_query_id = ?",
                )
                .bind(now())
                .bind(error)
                .bind(ad_query_id)
                .execute(&mut *tx)
                .await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    pub async fn ad_query_status(
        &self,
        session_id: &str,
        ad_query_id: i64,
    ) -> AppResult<AdQueryStatus> {
        let hash = hash_session_id(session_id);

        self.with_tx(move |tx| {
            let hash = hash.clone();
            async move {
                let row: AdQueryRow = sqlx::query_as(
                    "SELECT ad_query_id, nickname, query, filters, next_pull, last_pull, \
                     last_error, last_notify FROM ad_queries WHERE ad_query_id = ?",
                )
                .bind(ad_query_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("ad query {ad_query_id} not found")))?;

                let client_id: Option<i64> =
                    sqlx::query_scalar("SELECT client_id FROM clients WHERE session_hash = ?")
                        .bind(&hash)
                        .fetch_optional(&mut *tx)
                        .await?;

                let subscribed = match client_id {
                    Some(client_id) => sqlx::query_scalar::<_, i64>(
                        "SELECT client_id FROM client_subscriptions \
                         WHERE ad_query_id = ? AND client_id = ?",
                    )
                    .bind(ad_query_id)
                    .bind(client_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .is_some(),
                    None => false,
                };

                Ok(row.into_status(subscribed))
            }
            .boxed()
        })
        .await
    }

    /// Returns `false` if either identifier is unknown; otherwise upserts or
    /// removes the subscription edge.
    pub async fn toggle_ad_query_subscription(
        &self,
        ad_query_id: i64,
        session_id: &str,
        subscribed: bool,
    ) -> AppResult<bool> {
        let hash = hash_session_id(session_id);

        self.with_tx(move |tx| {
            let hash = hash.clone();
            async move {
                let client_id: Option<i64> =
                    sqlx::query_scalar("SELECT client_id FROM clients WHERE session_hash = ?")
                        .bind(&hash)
                        .fetch_optional(&mut *tx)
                        .await?;
                let Some(client_id) = client_id else {
                    return Ok(false);
                };

                let query_exists: Option<i64> = sqlx::query_scalar(
                    "SELECT ad_query_id FROM ad_queries WHERE ad_query_id = ?",
                )
                .bind(ad_query_id)
                .fetch_optional(&mut *tx)
                .await?;
                if query_exists.is_none() {
                    return Ok(false);
                }

                if subscribed {
                    sqlx::query(
                        "INSERT INTO client_subscriptions (ad_query_id, client_id) \
                         VALUES (?, ?) ON CONFLICT DO NOTHING",
                    )
                    .bind(ad_query_id)
                    .bind(client_id)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    sqlx::query(
                        "DELETE FROM client_subscriptions WHERE ad_query_id = ? AND client_id = ?",
                    )
                    .bind(ad_query_id)
                    .bind(client_id)
                    .execute(&mut *tx)
                    .await?;
                }

                Ok(true)
            }
            .boxed()
        })
        .await
    }

    /// Deletes the query, cascading subscriptions, content, and the text
    /// ledger via foreign-key `ON DELETE CASCADE`.
    pub async fn delete_ad_query(&self, id: i64) -> AppResult<bool> {
        self.with_tx(move |tx| async move {
            let result = sqlx::query("DELETE FROM ad_queries WHERE ad_query_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            Ok(result.rows_affected() > 0)
        }
        .boxed())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(nickname: &str) -> AdQueryRequest {
        AdQueryRequest {
            nickname: nickname.to_string(),
            query: nickname.to_string(),
            filters: vec![],
            subscribed: false,
        }
    }

    /// Testable property 5: `insert_ad_query(q, sub_session_id=s)` with
    /// unknown `s` leaves the database unchanged and returns `None`.
    #[tokio::test]
    async fn insert_with_unknown_session_writes_nothing() {
        let store = Store::connect_in_memory().await.unwrap();
        let result = store
            .insert_ad_query(&req("sale-watch"), Some("no-such-session"))
            .await
            .unwrap();
        assert!(result.is_none());

        let rows = store.ad_queries(None, None).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn insert_without_subscription_succeeds() {
        let store = Store::connect_in_memory().await.unwrap();
        let id = store.insert_ad_query(&req("sale-watch"), None).await.unwrap();
        assert!(id.is_some());

        let rows = store.ad_queries(None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].nickname, "sale-watch");
        assert!(!rows[0].subscribed);
    }

    /// Testable property 7: unique-nickname violations raise `DataArgument`
    /// and leave the database unchanged.
    #[tokio::test]
    async fn duplicate_nickname_on_insert_is_rejected() {
        let store = Store::connect_in_memory().await.unwrap();
        store.insert_ad_query(&req("sale-watch"), None).await.unwrap();

        let err = store
            .insert_ad_query(&req("sale-watch"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DataArgument(_)));

        let rows = store.ad_queries(None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_nickname_on_update_is_rejected() {
        let store = Store::connect_in_memory().await.unwrap();
        store.insert_ad_query(&req("first"), None).await.unwrap();
        let second_id = store
            .insert_ad_query(&req("second"), None)
            .await
            .unwrap()
            .unwrap();

        let session_id = "irrelevant-session";
        let err = store
            .update_ad_query(second_id, &req("first"), session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DataArgument(_)));
    }

    #[tokio::test]
    async fn update_resets_scheduling_and_toggles_subscription() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .create_session(b"pub", b"priv", "session-a")
            .await
            .unwrap();

        let id = store
            .insert_ad_query(&req("sale-watch"), Some("session-a"))
            .await
            .unwrap()
            .unwrap();

        // Age `next_pull` and set `last_notify` so the update's reset is
        // observable.
        sqlx::query("UPDATE ad_queries SET next_pull = 0, last_notify = 123 WHERE ad_query_id = ?")
            .bind(id)
            .execute(store.pool_for_test())
            .await
            .unwrap();

        let mut updated_req = req("sale-watch-v2");
        updated_req.subscribed = false;
        let (data, subscribed) = store
            .update_ad_query(id, &updated_req, "session-a")
            .await
            .unwrap();

        assert_eq!(data.nickname, "sale-watch-v2");
        assert!(!subscribed);

        let row: AdQueryRow = sqlx::query_as(
            "SELECT ad_query_id, nickname, query, filters, next_pull, last_pull, \
             last_error, last_notify FROM ad_queries WHERE ad_query_id = ?",
        )
        .bind(id)
        .fetch_one(store.pool_for_test())
        .await
        .unwrap();
        assert!(row.next_pull >= now());
        assert!(row.last_notify.is_none());
    }

    #[tokio::test]
    async fn ad_query_next_leases_the_soonest_due_row() {
        let store = Store::connect_in_memory().await.unwrap();
        let a = store.insert_ad_query(&req("a"), None).await.unwrap().unwrap();
        let b = store.insert_ad_query(&req("b"), None).await.unwrap().unwrap();

        sqlx::query("UPDATE ad_queries SET next_pull = 0 WHERE ad_query_id = ?")
            .bind(a)
            .execute(store.pool_for_test())
            .await
            .unwrap();
        sqlx::query("UPDATE ad_queries SET next_pull = 1 WHERE ad_query_id = ?")
            .bind(b)
            .execute(store.pool_for_test())
            .await
            .unwrap();

        let leased = store.ad_query_next(900).await.unwrap().unwrap();
        assert_eq!(leased.ad_query_id, a);
        assert!(leased.next_pull >= now());

        // The lease bumped `a` past `now`, so the next call picks `b`.
        let leased_next = store.ad_query_next(900).await.unwrap().unwrap();
        assert_eq!(leased_next.ad_query_id, b);
    }

    /// Testable property 4 / scenario S6: deleting an ad query cascades
    /// subscriptions, content, and queued pushes, but leaves clients intact.
    #[tokio::test]
    async fn delete_cascades_subscriptions_content_and_pushes() {
        let store = Store::connect_in_memory().await.unwrap();
        store.create_session(b"pub1", b"priv1", "client-1").await.unwrap();
        store.create_session(b"pub2", b"priv2", "client-2").await.unwrap();
        store
            .update_client_push_sub(
                "client-1",
                Some(r#"{"endpoint":"https://p/1","keys":{"auth":"a","p256dh":"p"}}"#.into()),
            )
            .await
            .unwrap();
        store
            .update_client_push_sub(
                "client-2",
                Some(r#"{"endpoint":"https://p/2","keys":{"auth":"a","p256dh":"p"}}"#.into()),
            )
            .await
            .unwrap();

        let id = store
            .insert_ad_query(&req("sale-watch"), Some("client-1"))
            .await
            .unwrap()
            .unwrap();
        store
            .toggle_ad_query_subscription(id, "client-2", true)
            .await
            .unwrap();

        for i in 0..10 {
            store
                .insert_ad(
                    id,
                    &format!("ext-{i}"),
                    "acct",
                    "https://acct.example",
                    now(),
                    &format!("unique ad text number {i}"),
                    b"",
                    3600,
                    0,
                )
                .await
                .unwrap();
        }

        assert!(store.delete_ad_query(id).await.unwrap());

        let subs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM client_subscriptions WHERE ad_query_id = ?",
        )
        .bind(id)
        .fetch_one(store.pool_for_test())
        .await
        .unwrap();
        assert_eq!(subs, 0);

        let content: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ad_content WHERE ad_query_id = ?")
                .bind(id)
                .fetch_one(store.pool_for_test())
                .await
                .unwrap();
        assert_eq!(content, 0);

        let text: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ad_content_text WHERE ad_query_id = ?")
                .bind(id)
                .fetch_one(store.pool_for_test())
                .await
                .unwrap();
        assert_eq!(text, 0);

        assert!(store.session_exists("client-1").await.unwrap());
        assert!(store.session_exists("client-2").await.unwrap());
    }
}
