//! Fallback link: signed HTTP requests plus inbox polling
//!
//! ```text
//!  open ──► POST /establish  (x-seamless-publickey: base64(JWK))
//!                │  { connectionId }
//!                ▼
//!  send ──► POST /message   { data, signature }              x-seamless-connection-id
//!  poll ──► POST /message   { "check-outbox", signature }   → [string, ...]
//! ```
//!
//! Each link owns an ephemeral ECDSA P-256 key. Only the public half ever
//! leaves the process. Every request after `/establish` is signed, the
//! inbox poll included, so a connection id alone cannot drain the inbox.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Connector, Link, LinkEvent};
use crate::config::SessionConfig;
use crate::error::{ClientError, ClientResult};
use crate::types::TransportKind;
use crate::util::lock;

const HEADER_PUBLIC_KEY: &str = "x-seamless-publickey";
const HEADER_PUBLIC_KEY_TYPE: &str = "x-seamless-publickey-type";
const HEADER_CONNECTION_ID: &str = "x-seamless-connection-id";
/// Message body that asks the server for queued outbound frames
const CHECK_OUTBOX: &str = "check-outbox";

#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    base_path: String,
    poll_interval: Duration,
    close_grace: Duration,
}

impl HttpConnector {
    pub fn new(config: &SessionConfig) -> ClientResult<Self> {
        Ok(Self {
            client: config.http_client()?,
            base_path: config.http_base_path.clone(),
            poll_interval: config.http_poll_interval,
            close_grace: config.http_close_grace,
        })
    }
}

impl Connector for HttpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn open(
        &self,
        base_url: &str,
    ) -> ClientResult<(Arc<dyn Link>, mpsc::UnboundedReceiver<LinkEvent>)> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|e| ClientError::Connection(format!("key generation failed: {}", e)))?;
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .map_err(|e| ClientError::Connection(format!("key rejected: {}", e)))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let link = Arc::new(HttpLink {
            client: self.client.clone(),
            endpoint: format!("{}{}", base_url, self.base_path),
            key_pair,
            rng,
            connection_id: Mutex::new(None),
            events: event_tx,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            poll_interval: self.poll_interval,
            close_grace: self.close_grace,
        });

        tokio::spawn(link.clone().run());

        Ok((link, event_rx))
    }
}

struct HttpLink {
    client: reqwest::Client,
    endpoint: String,
    key_pair: EcdsaKeyPair,
    rng: SystemRandom,
    connection_id: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    poll_interval: Duration,
    close_grace: Duration,
}

impl std::fmt::Debug for HttpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLink")
            .field("endpoint", &self.endpoint)
            .field("connection_id", &*lock(&self.connection_id))
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EstablishResponse {
    connection_id: String,
}

impl HttpLink {
    async fn run(self: Arc<Self>) {
        let connection_id = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = self.establish() => match result {
                Ok(id) => id,
                Err(e) => {
                    tracing::debug!(endpoint = %self.endpoint, "HTTP establish failed: {}", e);
                    let _ = self.events.send(LinkEvent::Error(e.to_string()));
                    return;
                }
            }
        };

        tracing::debug!(connection_id = %connection_id, "HTTP link established");
        *lock(&self.connection_id) = Some(connection_id);
        let _ = self.events.send(LinkEvent::Open);

        if self.poll_interval.is_zero() {
            self.shutdown.cancelled().await;
            return;
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await; // skip immediate tick

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.check_outbox().await {
                        Ok(messages) => {
                            for message in messages {
                                let _ = self.events.send(LinkEvent::Message(message));
                            }
                        }
                        Err(e) => {
                            if !self.closed.load(Ordering::Acquire) {
                                let _ = self.events.send(LinkEvent::Error(e.to_string()));
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn establish(&self) -> ClientResult<String> {
        let resp = self
            .client
            .post(format!("{}/establish", self.endpoint))
            .header(HEADER_PUBLIC_KEY, self.public_key_header()?)
            .header(HEADER_PUBLIC_KEY_TYPE, "ecdsa")
            .send()
            .await?
            .error_for_status()?;
        let body: EstablishResponse = resp.json().await?;
        Ok(body.connection_id)
    }

    async fn check_outbox(&self) -> ClientResult<Vec<String>> {
        let resp = self.post_message(CHECK_OUTBOX).await?;
        Ok(resp.json().await?)
    }

    /// Signed `POST /message` carrying `text`
    async fn post_message(&self, text: &str) -> ClientResult<reqwest::Response> {
        let connection_id = self.connection_id()?;
        let signature = self.sign(text)?;
        let resp = self
            .client
            .post(format!("{}/message", self.endpoint))
            .header(HEADER_CONNECTION_ID, connection_id)
            .json(&message_body(text, &signature))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp)
    }

    fn connection_id(&self) -> ClientResult<String> {
        lock(&self.connection_id)
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Base64 of the public key as a JWK restricted to verification
    fn public_key_header(&self) -> ClientResult<String> {
        let point = self.key_pair.public_key().as_ref();
        // Uncompressed SEC1 point: 0x04 || X || Y
        if point.len() != 65 || point[0] != 0x04 {
            return Err(ClientError::Connection(
                "unexpected public key encoding".to_string(),
            ));
        }
        let jwk = json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(&point[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&point[33..65]),
            "ext": true,
            "key_ops": ["verify"],
        });
        Ok(STANDARD.encode(jwk.to_string()))
    }

    /// Signature bytes rendered as `b0.b1.b2...`
    fn sign(&self, data: &str) -> ClientResult<String> {
        let signature = self
            .key_pair
            .sign(&self.rng, data.as_bytes())
            .map_err(|e| ClientError::Connection(format!("signing failed: {}", e)))?;
        Ok(signature
            .as_ref()
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join("."))
    }
}

fn message_body(text: &str, signature: &str) -> serde_json::Value {
    json!({ "data": text, "signature": signature })
}

#[async_trait]
impl Link for HttpLink {
    async fn send(&self, text: String) -> ClientResult<()> {
        self.post_message(&text).await?;
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.events.send(LinkEvent::Close {
            code,
            reason: reason.to_string(),
        });

        // Keep polling for a grace period so replies to requests already
        // sent can still be collected.
        let shutdown = self.shutdown.clone();
        let grace = self.close_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(grace) => shutdown.cancel(),
                    }
                });
            }
            Err(_) => shutdown.cancel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::{ECDSA_P256_SHA256_FIXED, UnparsedPublicKey};

    fn test_link() -> HttpLink {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();
        let (events, _) = mpsc::unbounded_channel();
        HttpLink {
            client: reqwest::Client::new(),
            endpoint: "http://localhost/_seam/http".into(),
            key_pair,
            rng,
            connection_id: Mutex::new(None),
            events,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            poll_interval: Duration::from_secs(2),
            close_grace: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_signature_verifies_against_public_key() {
        let link = test_link();
        let rendered = link.sign("hello").unwrap();
        let bytes: Vec<u8> = rendered.split('.').map(|b| b.parse().unwrap()).collect();
        assert_eq!(bytes.len(), 64);

        let public = UnparsedPublicKey::new(
            &ECDSA_P256_SHA256_FIXED,
            link.key_pair.public_key().as_ref().to_vec(),
        );
        assert!(public.verify(b"hello", &bytes).is_ok());
    }

    #[test]
    fn test_public_key_header_is_verify_only_jwk() {
        let link = test_link();
        let header = link.public_key_header().unwrap();
        let jwk: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(header).unwrap()).unwrap();
        assert_eq!(jwk["crv"], "P-256");
        assert_eq!(jwk["key_ops"], json!(["verify"]));
        assert!(jwk.get("d").is_none());
    }

    #[test]
    fn test_outbox_poll_body_is_signed() {
        let link = test_link();
        let signature = link.sign(CHECK_OUTBOX).unwrap();
        let body = message_body(CHECK_OUTBOX, &signature);
        assert_eq!(body["data"], "check-outbox");

        let bytes: Vec<u8> = body["signature"]
            .as_str()
            .unwrap()
            .split('.')
            .map(|b| b.parse().unwrap())
            .collect();
        let public = UnparsedPublicKey::new(
            &ECDSA_P256_SHA256_FIXED,
            link.key_pair.public_key().as_ref().to_vec(),
        );
        assert!(public.verify(CHECK_OUTBOX.as_bytes(), &bytes).is_ok());
    }

    #[tokio::test]
    async fn test_poll_before_establish_is_not_connected() {
        let link = test_link();
        assert!(matches!(
            link.check_outbox().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_send_before_establish_is_not_connected() {
        let link = test_link();
        assert!(matches!(
            link.connection_id(),
            Err(ClientError::NotConnected)
        ));
    }
}
