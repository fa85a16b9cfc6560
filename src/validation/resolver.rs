//! DNS-over-HTTPS resolvability check.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i64,
}

/// Asks a DoH JSON endpoint whether a name resolves.
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    /// Whether `name` resolves. Timeouts, transport failures, bad responses
    /// and non-zero DNS status all count as unresolvable.
    pub async fn is_resolvable(&self, name: &str) -> bool {
        match self.lookup(name).await {
            Ok(status) => status == 0,
            Err(e) => {
                if e.is_timeout() {
                    tracing::warn!("Validation: lookup for {} timed out", name);
                } else {
                    tracing::warn!("Validation: lookup for {} failed: {}", name, e);
                }
                false
            }
        }
    }

    async fn lookup(&self, name: &str) -> Result<i64, reqwest::Error> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("name", name)])
            .header(reqwest::header::ACCEPT, "application/dns-json")
            .send()
            .await?
            .error_for_status()?;

        let body: DohResponse = response.json().await?;
        Ok(body.status)
    }
}
