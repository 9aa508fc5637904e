//! Per-client VAPID keypair and opaque session identifier generation (core
//! spec §4.4).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};
use crate::store::Store;

pub struct NewSession {
    pub session_id: String,
    pub vapid_pub_b64: String,
}

pub struct SessionIssuer<'a> {
    store: &'a Store,
    session_expiration_secs: i64,
}

impl<'a> SessionIssuer<'a> {
    pub fn new(store: &'a Store, session_expiration_secs: i64) -> Self {
        Self {
            store,
            session_expiration_secs,
        }
    }

    /// Generates a fresh P-256 keypair, derives `session_id =
    /// hex(SHA-256(vapid_pub || vapid_priv))`, prunes expired sessions, then
    /// writes the Client row.
    pub async fn issue(&self) -> AppResult<NewSession> {
        let signing_key = SigningKey::random(&mut OsRng);
        let vapid_pub = signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let vapid_priv_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("failed to encode VAPID private key: {e}"))
            })?
            .as_bytes()
            .to_vec();

        let mut hasher = Sha256::new();
        hasher.update(&vapid_pub);
        hasher.update(&vapid_priv_pem);
        let session_id = hex::encode(hasher.finalize());

        self.store
            .cleanup_sessions(self.session_expiration_secs)
            .await?;
        self.store
            .create_session(&vapid_pub, &vapid_priv_pem, &session_id)
            .await?;

        Ok(NewSession {
            session_id,
            vapid_pub_b64: URL_SAFE_NO_PAD.encode(&vapid_pub),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_writes_a_session_the_store_can_find() {
        let store = Store::connect_in_memory().await.unwrap();
        let issuer = SessionIssuer::new(&store, 3600);

        let issued = issuer.issue().await.unwrap();
        assert!(store.session_exists(&issued.session_id).await.unwrap());
        assert!(!issued.vapid_pub_b64.is_empty());
    }

    #[tokio::test]
    async fn two_issued_sessions_never_collide() {
        let store = Store::connect_in_memory().await.unwrap();
        let issuer = SessionIssuer::new(&store, 3600);

        let a = issuer.issue().await.unwrap();
        let b = issuer.issue().await.unwrap();
        assert_ne!(a.session_id, b.session_id);
    }
}
