use futures::FutureExt;

use super::{hash_session_id, now, Store};
use crate::error::AppResult;

impl Store {
    /// Writes the Client row with `last_seen = now` (core spec §4.1).
    pub async fn create_session(
        &self,
        vapid_pub: &[u8],
        vapid_priv: &[u8],
        session_id: &str,
    ) -> AppResult<()> {
        let hash = hash_session_id(session_id);
        let vapid_pub = vapid_pub.to_vec();
        let vapid_priv = vapid_priv.to_vec();

        self.with_tx(move |tx| {
            let hash = hash.clone();
            let vapid_pub = vapid_pub.clone();
            let vapid_priv = vapid_priv.clone();
            async move {
                sqlx::query(
                    "INSERT INTO clients (vapid_pub, vapid_priv, session_hash, push_sub, last_seen) \
                     VALUES (?, ?, ?, NULL, ?)",
                )
                .bind(vapid_pub)
                .bind(vapid_priv)
                .bind(hash)
                .bind(now())
                .execute(&mut *tx)
                .await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    pub async fn session_exists(&self, session_id: &str) -> AppResult<bool> {
        let hash = hash_session_id(session_id);

        self.with_tx(move |tx| {
            let hash = hash.clone();
            async move {
                let found: Option<i64> =
                    sqlx::query_scalar("SELECT client_id FROM clients WHERE session_hash = ?")
                        .bind(hash)
                        .fetch_optional(&mut *tx)
                        .await?;
                Ok(found.is_some())
            }
            .boxed()
        })
        .await
    }

    /// Deletes clients whose `last_seen` predates `now - expiration_secs`,
    /// cascading subscriptions and queued pushes (core spec §3 lifecycles).
    pub async fn cleanup_sessions(&self, expiration_secs: i64) -> AppResult<()> {
        self.with_tx(move |tx| async move {
            let cutoff = now() - expiration_secs;
            sqlx::query("DELETE FROM clients WHERE last_seen < ?")
                .bind(cutoff)
                .execute(&mut *tx)
                .await?;
            Ok(())
        }
        .boxed())
        .await
    }

    /// Returns whether a client with this session existed. A JSON-literal
    /// `null` must already be normalized to `None` by the caller (core spec
    /// §9: `push_sub` JSON null vs database null) — this method never
    /// inspects the string form.
    pub async fn update_client_push_sub(
        &self,
        session_id: &str,
        push_sub: Option<String>,
    ) -> AppResult<bool> {
        let hash = hash_session_id(session_id);

        self.with_tx(move |tx| {
            let hash = hash.clone();
            let push_sub = push_sub.clone();
            async move {
                let client_id: Option<i64> =
                    sqlx::query_scalar("SELECT client_id FROM clients WHERE session_hash = ?")
                        .bind(&hash)
                        .fetch_optional(&mut *tx)
                        .await?;

                let Some(client_id) = client_id else {
                    return Ok(false);
                };

                sqlx::query("UPDATE clients SET push_sub = ?, last_seen = ? WHERE client_id = ?")
                    .bind(&push_sub)
                    .bind(now())
                    .bind(client_id)
                    .execute(&mut *tx)
                    .await?;

                if push_sub.is_none() {
                    sqlx::query("DELETE FROM push_queue WHERE client_id = ?")
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::AdQueryRequest;

    async fn new_session(store: &Store) -> String {
        let session_id = format!("session-{}", rand_suffix());
        store
            .create_session(b"pub-key", b"priv-key-pem", &session_id)
            .await
            .unwrap();
        session_id
    }

    fn rand_suffix() -> String {
        use sha2::{Digest, Sha256};
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        hex::encode(&Sha256::digest(nanos.to_le_bytes())[..8])
    }

    #[tokio::test]
    async fn create_and_check_session() {
        let store = Store::connect_in_memory().await.unwrap();
        let session_id = new_session(&store).await;
        assert!(store.session_exists(&session_id).await.unwrap());
        assert!(!store.session_exists("unknown-session").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_sessions_prunes_only_stale_clients() {
        let store = Store::connect_in_memory().await.unwrap();
        let fresh = new_session(&store).await;

        // Backdate a second client's `last_seen` directly; `create_session`
        // always stamps `now`, so there is no public way to age a row.
        let stale = new_session(&store).await;
        let stale_hash = hash_session_id(&stale);
        sqlx::query("UPDATE clients SET last_seen = ? WHERE session_hash = ?")
            .bind(now() - 1_000_000)
            .bind(&stale_hash)
            .execute(store.pool_for_test())
            .await
            .unwrap();

        store.cleanup_sessions(3600).await.unwrap();

        assert!(store.session_exists(&fresh).await.unwrap());
        assert!(!store.session_exists(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn update_push_sub_reports_found_iff_client_exists() {
        let store = Store::connect_in_memory().await.unwrap();
        let session_id = new_session(&store).await;

        let sub = r#"{"endpoint":"https://push.example/ep","keys":{"auth":"a","p256dh":"p"}}"#;
        assert!(store
            .update_client_push_sub(&session_id, Some(sub.to_string()))
            .await
            .unwrap());
        assert!(!store
            .update_client_push_sub("no-such-session", Some(sub.to_string()))
            .await
            .unwrap());
    }

    /// Testable property 8: after `update_client_push_sub(s, null)`, all
    /// `PushQueueItem`s for that client are gone.
    #[tokio::test]
    async fn clearing_push_sub_drops_queued_pushes() {
        let store = Store::connect_in_memory().await.unwrap();
        let session_id = new_session(&store).await;
        let sub = r#"{"endpoint":"https://push.example/ep","keys":{"auth":"a","p256dh":"p"}}"#;
        store
            .update_client_push_sub(&session_id, Some(sub.to_string()))
            .await
            .unwrap();

        let req = AdQueryRequest {
            nickname: "deals".into(),
            query: "deals".into(),
            filters: vec![],
            subscribed: true,
        };
        let ad_query_id = store
            .insert_ad_query(&req, Some(&session_id))
            .await
            .unwrap()
            .unwrap();

        store
            .insert_ad(
                ad_query_id,
                "ext-1",
                "acct",
                "https://acct.example",
                now(),
                "hello world",
                b"",
                3600,
                0,
            )
            .await
            .unwrap();

        let hash = hash_session_id(&session_id);
        let client_id: i64 =
            sqlx::query_scalar("SELECT client_id FROM clients WHERE session_hash = ?")
                .bind(&hash)
                .fetch_one(store.pool_for_test())
                .await
                .unwrap();
        let queued: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM push_queue WHERE client_id = ?")
                .bind(client_id)
                .fetch_one(store.pool_for_test())
                .await
                .unwrap();
        assert_eq!(queued, 1);

        store
            .update_client_push_sub(&session_id, None)
            .await
            .unwrap();

        let queued: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM push_queue WHERE client_id = ?")
                .bind(client_id)
                .fetch_one(store.pool_for_test())
                .await
                .unwrap();
        assert_eq!(queued, 0);
    }
}
