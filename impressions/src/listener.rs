use crate::errors::ListenerError;
use crate::protocol::ListenerPayload;
use crate::types::ImpressionsForDestination;
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// Optional local sink that receives every impression, before deduplication.
#[async_trait]
pub trait ImpressionListener: Send + Sync {
    async fn submit(&self, impressions: &ImpressionsForDestination) -> Result<(), ListenerError>;
}

pub struct HttpImpressionListener {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpImpressionListener {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, ListenerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpImpressionListener { client, endpoint })
    }
}

#[async_trait]
impl ImpressionListener for HttpImpressionListener {
    async fn submit(&self, impressions: &ImpressionsForDestination) -> Result<(), ListenerError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&ListenerPayload::new(impressions))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ListenerError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
