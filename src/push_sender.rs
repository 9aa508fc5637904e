//! External collaborator (core spec §1): delivers an encrypted message to a
//! browser endpoint using a VAPID keypair.

use async_trait::async_trait;
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, SubscriptionKeys,
    VapidSignatureBuilder, WebPushClient, WebPushMessageBuilder,
};

use crate::error::{AppError, AppResult};
use crate::store::models::PushSubscription;

/// Delivers `message` to the endpoint described by `push_sub_json`, signing
/// with the client's own VAPID private key (PEM). Returns `Ok(())` only on
/// an underlying HTTP 201 (core spec §4.3 step 3).
#[async_trait]
pub trait WebPushSender: Send + Sync {
    async fn notify(&self, push_sub_json: &str, vapid_priv_pem: &[u8], message: &str) -> AppResult<()>;
}

pub struct HttpWebPushSender {
    client: IsahcWebPushClient,
    vapid_subject: String,
}

impl HttpWebPushSender {
    pub fn new(vapid_subject: String) -> AppResult<Self> {
        let client = IsahcWebPushClient::new().map_err(|e| {
            AppError::Internal(anyhow::anyhow!("failed to build web-push client: {e}"))
        })?;
        Ok(Self {
            client,
            vapid_subject,
        })
    }
}

#[async_trait]
impl WebPushSender for HttpWebPushSender {
    async fn notify(
        &self,
        push_sub_json: &str,
        vapid_priv_pem: &[u8],
        message: &str,
    ) -> AppResult<()> {
        let sub: PushSubscription = serde_json::from_str(push_sub_json)
            .map_err(|e| AppError::DataArgument(format!("invalid push subscription: {e}")))?;

        let info = SubscriptionInfo {
            endpoint: sub.endpoint,
            keys: SubscriptionKeys {
                p256dh: sub.keys.p256dh,
                auth: sub.keys.auth,
            },
        };

        let mut sig_builder = VapidSignatureBuilder::from_pem(vapid_priv_pem, &info)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid VAPID private key: {e}")))?;
        sig_builder.add_claim("sub", self.vapid_subject.as_str());
        let signature = sig_builder.build().map_err(|e| {
            AppError::Internal(anyhow::anyhow!("failed to build VAPID signature: {e}"))
        })?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, message.as_bytes());
        builder.set_vapid_signature(signature);

        let built = builder
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to build push message: {e}")))?;

        self.client
            .send(built)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("web-push delivery failed: {e}")))?;

        Ok(())
    }
}

/// Always-succeeds implementation used by tests.
pub struct StubSender;

#[async_trait]
impl WebPushSender for StubSender {
    async fn notify(&self, _push_sub_json: &str, _vapid_priv_pem: &[u8], _message: &str) -> AppResult<()> {
        Ok(())
    }
}
