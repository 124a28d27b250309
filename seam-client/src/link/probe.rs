use async_trait::async_trait;

use crate::config::SessionConfig;
use crate::error::ClientResult;

/// Server reachability check used before reconnecting
#[async_trait]
pub trait Probe: Send + Sync + std::fmt::Debug {
    async fn is_reachable(&self, base_url: &str) -> bool;
}

/// `GET <base_url><status_path>` answering exactly `OK`
#[derive(Debug, Clone)]
pub struct HttpStatusProbe {
    client: reqwest::Client,
    status_path: String,
}

impl HttpStatusProbe {
    pub fn new(config: &SessionConfig) -> ClientResult<Self> {
        Ok(Self {
            client: config.http_client()?,
            status_path: config.status_path.clone(),
        })
    }
}

#[async_trait]
impl Probe for HttpStatusProbe {
    async fn is_reachable(&self, base_url: &str) -> bool {
        let url = format!("{}{}", base_url, self.status_path);
        match self.client.get(&url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => body == "OK",
                Err(e) => {
                    tracing::debug!(url = %url, "Status probe body unreadable: {}", e);
                    false
                }
            },
            Err(e) => {
                tracing::debug!(url = %url, "Status probe failed: {}", e);
                false
            }
        }
    }
}
