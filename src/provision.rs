//! Provisioner controller boundary: wait for the VM's director API, then
//! hand it an opaque deployment manifest.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CfdevError;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    /// Passed through untouched.
    pub manifest: Vec<u8>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Block until the controller inside the VM answers, or fail after `timeout`.
    async fn wait_until_ready(&self, address: &str, timeout: Duration) -> Result<(), CfdevError>;

    async fn deploy(&self, address: &str, deployment: &Deployment) -> Result<(), CfdevError>;
}

pub struct HttpProvisioner {
    client: reqwest::Client,
    port: u16,
    poll_interval: Duration,
}

impl HttpProvisioner {
    pub fn new(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
            poll_interval: POLL_INTERVAL,
        }
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("http://{address}:{}{path}", self.port)
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn wait_until_ready(&self, address: &str, timeout: Duration) -> Result<(), CfdevError> {
        let url = self.url(address, "/info");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.client.get(&url).timeout(self.poll_interval).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => tracing::debug!(status = %resp.status(), "controller not ready"),
                Err(e) => tracing::debug!(error = %e, "controller not reachable"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CfdevError::ProvisioningFailed {
                    message: format!(
                        "controller at {address} not ready after {}s",
                        timeout.as_secs()
                    ),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn deploy(&self, address: &str, deployment: &Deployment) -> Result<(), CfdevError> {
        tracing::info!(deployment = %deployment.name, address, "applying deployment");
        let resp = self
            .client
            .post(self.url(address, "/deployments"))
            .header(reqwest::header::CONTENT_TYPE, "text/yaml")
            .body(deployment.manifest.clone())
            .send()
            .await
            .map_err(|e| CfdevError::ProvisioningFailed {
                message: format!("sending deployment: {e}"),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CfdevError::ProvisioningFailed {
            message: format!("controller returned {status}: {}", body.trim()),
        })
    }
}
