//! EC2 (AWS) datasource
//!
//! Fetches metadata from the EC2 Instance Metadata Service (IMDS).
//! Supports both IMDSv1 and IMDSv2 (preferred for security).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Datasource, DatasourceContext, DatasourceData, DsMode};
use crate::{CloudInitError, state::CloudPaths};

/// EC2 metadata service base URL (link-local address)
pub const IMDS_BASE_URL: &str = "http://169.254.169.254";

/// IMDSv2 token TTL in seconds
const TOKEN_TTL_SECONDS: u32 = 21600;

const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";

/// EC2 datasource for AWS and compatible clouds
pub struct Ec2 {
    base_url: String,
    /// Set when `metadata_urls` was configured; skips the DMI platform check
    explicit_url: bool,
    timeout: Duration,
    paths: CloudPaths,
    data: DatasourceData,
}

impl Ec2 {
    pub fn new(ctx: &DatasourceContext) -> Self {
        let ds_cfg = ctx.ds_cfg("Ec2");
        let configured = ds_cfg
            .get("metadata_urls")
            .and_then(|v| v.as_sequence())
            .and_then(|urls| urls.first())
            .and_then(|u| u.as_str())
            .map(|u| u.trim_end_matches('/').to_string());
        let timeout = ds_cfg
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(5);

        Self {
            explicit_url: configured.is_some(),
            base_url: configured.unwrap_or_else(|| IMDS_BASE_URL.to_string()),
            timeout: Duration::from_secs(timeout),
            paths: ctx.paths.clone(),
            data: DatasourceData::default(),
        }
    }

    fn client(&self) -> Result<Client, CloudInitError> {
        Ok(Client::builder()
            .timeout(self.timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()?)
    }

    /// Get IMDSv2 token for authenticated requests
    async fn get_imdsv2_token(&self, client: &Client) -> Option<String> {
        let url = format!("{}/latest/api/token", self.base_url);
        let response = client
            .put(&url)
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS.to_string())
            .send()
            .await
            .ok()?;

        if response.status().is_success() {
            response.text().await.ok()
        } else {
            None
        }
    }

    /// GET a path below `/latest/`, returning None on 404
    async fn fetch(
        &self,
        client: &Client,
        token: Option<&str>,
        path: &str,
    ) -> Result<Option<String>, CloudInitError> {
        let url = format!("{}/latest/{}", self.base_url, path);
        let mut request = client.get(&url);
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request.send().await?;

        match response.status() {
            s if s.is_success() => Ok(Some(response.text().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(CloudInitError::url_fetch(url, format!("HTTP status {s}"))),
        }
    }

    /// Check if we're running on EC2 by looking for DMI data
    async fn check_dmi_data(&self) -> bool {
        let dmi_paths = [
            "/sys/class/dmi/id/product_name",
            "/sys/class/dmi/id/bios_vendor",
            "/sys/class/dmi/id/sys_vendor",
        ];

        for path in dmi_paths {
            if let Ok(content) = tokio::fs::read_to_string(self.paths.target(path)).await {
                let content = content.to_lowercase();
                if content.contains("amazon") || content.contains("ec2") {
                    return true;
                }
            }
        }

        self.paths.target("/sys/hypervisor/uuid").exists()
    }
}

#[async_trait]
impl Datasource for Ec2 {
    fn name(&self) -> &'static str {
        "Ec2"
    }

    async fn get_data(&mut self) -> Result<bool, CloudInitError> {
        if !self.explicit_url && !self.check_dmi_data().await {
            debug!("Not an EC2 platform");
            return Ok(false);
        }

        let client = self.client()?;
        let token = self.get_imdsv2_token(&client).await;
        if token.is_some() {
            debug!("Using IMDSv2");
        } else {
            debug!("Falling back to IMDSv1");
        }
        let token = token.as_deref();

        let instance_id = match self.fetch(&client, token, "meta-data/instance-id").await {
            Ok(Some(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Ok(_) => return Ok(false),
            Err(e) => {
                debug!("IMDS not reachable: {}", e);
                return Ok(false);
            }
        };

        let mut metadata = Map::new();
        metadata.insert("instance-id".into(), Value::String(instance_id));

        for (key, path) in [
            ("local-hostname", "meta-data/local-hostname"),
            ("availability-zone", "meta-data/placement/availability-zone"),
            ("instance-type", "meta-data/instance-type"),
            ("local-ipv4", "meta-data/local-ipv4"),
        ] {
            match self.fetch(&client, token, path).await {
                Ok(Some(v)) => {
                    metadata.insert(key.into(), Value::String(v.trim().to_string()));
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to fetch {}: {}", path, e),
            }
        }

        // Region is AZ minus the last character (e.g., us-east-1a -> us-east-1)
        if let Some(az) = metadata.get("availability-zone").and_then(|v| v.as_str())
            && az.len() > 1
        {
            let region = az[..az.len() - 1].to_string();
            metadata.insert("region".into(), Value::String(region));
        }

        if let Ok(Some(key)) = self
            .fetch(&client, token, "meta-data/public-keys/0/openssh-key")
            .await
        {
            metadata.insert(
                "public-keys".into(),
                Value::Array(vec![Value::String(key.trim().to_string())]),
            );
        }

        let userdata = match self.fetch(&client, token, "user-data").await {
            Ok(Some(ud)) if !ud.is_empty() => Some(ud.into_bytes()),
            Ok(_) => {
                debug!("No user-data available");
                None
            }
            Err(e) => {
                warn!("Failed to fetch user-data: {}", e);
                None
            }
        };

        self.data = DatasourceData {
            metadata: Value::Object(metadata),
            userdata_raw: userdata,
            vendordata_raw: None,
            network_config: None,
            config: None,
            dsmode: DsMode::Net,
            source: format!("metadata ({})", self.base_url),
            cloud_name: "aws".to_string(),
            platform: "ec2".to_string(),
        };
        Ok(true)
    }

    fn data(&self) -> &DatasourceData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut DatasourceData {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_not_ec2_without_dmi() {
        let temp = TempDir::new().unwrap();
        let ctx = DatasourceContext {
            sys_cfg: serde_yaml::Value::Null,
            distro: "ubuntu".into(),
            paths: CloudPaths::with_root(temp.path()),
        };
        let mut ds = Ec2::new(&ctx);
        assert_eq!(ds.base_url, IMDS_BASE_URL);
        assert!(!ds.get_data().await.unwrap());
    }

    #[test]
    fn test_metadata_urls_override() {
        let ctx = DatasourceContext {
            sys_cfg: serde_yaml::from_str(
                "datasource:\n  Ec2:\n    metadata_urls: ['http://127.0.0.1:9/']\n",
            )
            .unwrap(),
            distro: "ubuntu".into(),
            paths: CloudPaths::new(),
        };
        let ds = Ec2::new(&ctx);
        assert_eq!(ds.base_url, "http://127.0.0.1:9");
        assert!(ds.explicit_url);
    }
}
