use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A saved search plus its scheduling metadata (core spec §3).
#[derive(Debug, Clone, FromRow)]
pub struct AdQueryRow {
    pub ad_query_id: i64,
    pub nickname: String,
    pub query: String,
    pub filters: String,
    pub next_pull: i64,
    pub last_pull: Option<i64>,
    pub last_error: Option<String>,
    pub last_notify: Option<i64>,
}

/// Wire shape for `/api/get_ad_queries` and friends. `ad_query_id` is
/// serialized as a string (core spec §6 identifier wire forms).
#[derive(Debug, Clone, Serialize)]
pub struct AdQuery {
    #[serde(rename = "adQueryId")]
    pub ad_query_id: String,
    pub nickname: String,
    pub query: String,
    pub filters: Vec<String>,
    pub subscribed: bool,
}

/// Scheduler metadata attached to `/api/get_ad_query_status`.
#[derive(Debug, Clone, Serialize)]
pub struct AdQueryStatus {
    #[serde(flatten)]
    pub ad_query: AdQuery,
    #[serde(rename = "nextPull")]
    pub next_pull: i64,
    #[serde(rename = "lastPull")]
    pub last_pull: Option<i64>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastNotify")]
    pub last_notify: Option<i64>,
}

impl AdQueryRow {
    pub fn into_api(self, subscribed: bool) -> AdQuery {
        let filters: Vec<String> = serde_json::from_str(&self.filters).unwrap_or_default();
        AdQuery {
            ad_query_id: self.ad_query_id.to_string(),
            nickname: self.nickname,
            query: self.query,
            filters,
            subscribed,
        }
    }

    pub fn into_status(self, subscribed: bool) -> AdQueryStatus {
        let next_pull = self.next_pull;
        let last_pull = self.last_pull;
        let last_error = self.last_error.clone();
        let last_notify = self.last_notify;
        AdQueryStatus {
            ad_query: self.into_api(subscribed),
            next_pull,
            last_pull,
            last_error,
            last_notify,
        }
    }
}

/// Client record (core spec §3). `vapid_priv` never leaves the store except
/// as part of a leased [`PushQueueItem`] headed straight for the sender.
#[derive(Debug, Clone, FromRow)]
pub struct ClientRow {
    pub client_id: i64,
    pub vapid_pub: Vec<u8>,
    pub vapid_priv: Vec<u8>,
    pub session_hash: String,
    pub push_sub: Option<String>,
    pub last_seen: i64,
}

/// A leased push-queue entry, joined with the client's current `push_sub`
/// and `vapid_priv` (`push_queue_next`'s return shape per core spec §4.1).
#[derive(Debug, Clone, FromRow)]
pub struct PushQueueLease {
    pub id: i64,
    pub client_id: i64,
    pub message: String,
    pub retries: i64,
    pub push_sub: Option<String>,
    pub vapid_priv: Vec<u8>,
}

/// One row of `/api/list_ad_content`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AdContentRow {
    pub id: String,
    pub account_name: String,
    pub account_url: String,
    pub start_date: i64,
    pub last_seen: i64,
    pub text: String,
    /// The re-encoded JPEG captured at crawl time (core spec §4.2 step 7),
    /// base64-encoded for the JSON wire. Empty when no screenshot was
    /// available for this ad.
    #[serde(serialize_with = "serialize_base64")]
    pub screenshot: Vec<u8>,
}

fn serialize_base64<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// Validated shape of an incoming ad-query create/update request (core spec
/// §4.5). Field-level validation happens in the route handlers; this struct
/// is the product of that validation.
#[derive(Debug, Clone, Deserialize)]
pub struct AdQueryRequest {
    pub nickname: String,
    pub query: String,
    pub filters: Vec<String>,
    pub subscribed: bool,
}

/// A subscriber's push-sub payload, either absent (`None`, i.e. unsubscribed)
/// or a standard Web Push subscription object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushSubscriptionKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscriptionKeys {
    pub auth: String,
    pub p256dh: String,
}

/// The canonical notification payload delivered to a browser client (core
/// spec §6). Ad text is truncated to 128 chars before this struct is built.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    #[serde(rename = "adQueryId")]
    pub ad_query_id: i64,
    pub nickname: String,
    pub ad: NotificationAd,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationAd {
    pub id: String,
    #[serde(rename = "accountName")]
    pub account_name: String,
    #[serde(rename = "accountUrl")]
    pub account_url: String,
    pub text: String,
}
