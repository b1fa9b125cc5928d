//! Mock datasource for testing
//!
//! Provides a configurable datasource that can be registered with the
//! resolver in unit and integration tests.

use async_trait::async_trait;
use serde_json::Value;

use super::{Datasource, DatasourceData, DsMode};
use crate::CloudInitError;

/// Mock datasource for testing
///
/// # Example
/// ```
/// use cloud_init_engine::datasources::{Datasource, mock::MockDatasource};
///
/// let mock = MockDatasource::new()
///     .with_metadata(serde_json::json!({"instance-id": "test-123"}))
///     .with_userdata(b"#cloud-config\nhostname: mock\n".to_vec());
/// assert_eq!(mock.instance_id(), "test-123");
/// ```
#[derive(Debug, Clone)]
pub struct MockDatasource {
    name: &'static str,
    found: bool,
    error: Option<String>,
    instance_id_valid: bool,
    /// Data handed out once `get_data` succeeds
    seed: DatasourceData,
    data: DatasourceData,
}

impl MockDatasource {
    /// Create a mock that finds empty data in network mode
    pub fn new() -> Self {
        let seed = DatasourceData {
            metadata: Value::Object(Default::default()),
            source: "mock".to_string(),
            cloud_name: "mock".to_string(),
            platform: "mock".to_string(),
            ..Default::default()
        };
        Self {
            name: "Mock",
            found: true,
            error: None,
            instance_id_valid: false,
            data: seed.clone(),
            seed,
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set whether `get_data` reports the datasource as present
    pub fn with_found(mut self, found: bool) -> Self {
        self.found = found;
        self
    }

    /// Make `get_data` fail with this message
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Answer for `check_instance_id`
    pub fn with_instance_id_valid(mut self, valid: bool) -> Self {
        self.instance_id_valid = valid;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.seed.metadata = metadata;
        self.data = self.seed.clone();
        self
    }

    pub fn with_userdata(mut self, userdata: Vec<u8>) -> Self {
        self.seed.userdata_raw = Some(userdata);
        self.data = self.seed.clone();
        self
    }

    pub fn with_vendordata(mut self, vendordata: Vec<u8>) -> Self {
        self.seed.vendordata_raw = Some(vendordata);
        self.data = self.seed.clone();
        self
    }

    pub fn with_network_config(mut self, config: Value) -> Self {
        self.seed.network_config = Some(config);
        self.data = self.seed.clone();
        self
    }

    /// Datasource-provided config
    pub fn with_config(mut self, config: Value) -> Self {
        self.seed.config = Some(config);
        self.data = self.seed.clone();
        self
    }

    pub fn with_dsmode(mut self, dsmode: DsMode) -> Self {
        self.seed.dsmode = dsmode;
        self.data = self.seed.clone();
        self
    }
}

impl Default for MockDatasource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datasource for MockDatasource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get_data(&mut self) -> Result<bool, CloudInitError> {
        if let Some(error) = &self.error {
            return Err(CloudInitError::Datasource(error.clone()));
        }
        if self.found {
            self.data = self.seed.clone();
        }
        Ok(self.found)
    }

    fn data(&self) -> &DatasourceData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut DatasourceData {
        &mut self.data
    }

    async fn check_instance_id(&self, _cached: &DatasourceData) -> bool {
        self.instance_id_valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_datasource_default() {
        let mut mock = MockDatasource::new();

        assert_eq!(mock.name(), "Mock");
        assert!(mock.get_data().await.unwrap());
        assert!(mock.userdata_raw().is_none());
        assert_eq!(mock.dsmode(), DsMode::Net);
    }

    #[tokio::test]
    async fn test_mock_datasource_with_metadata() {
        let mut mock = MockDatasource::new()
            .with_name("TestDS")
            .with_metadata(json!({"instance-id": "i-test123", "local-hostname": "test-host"}));

        assert!(mock.get_data().await.unwrap());
        assert_eq!(mock.name(), "TestDS");
        assert_eq!(mock.instance_id(), "i-test123");
        assert_eq!(mock.get_hostname(false, true).unwrap().hostname, "test-host");
    }

    #[tokio::test]
    async fn test_mock_datasource_not_found() {
        let mut mock = MockDatasource::new().with_found(false);
        assert!(!mock.get_data().await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_datasource_error() {
        let mut mock = MockDatasource::new().with_error("Metadata fetch failed");

        let error = mock.get_data().await.unwrap_err();
        assert!(error.to_string().contains("Metadata fetch failed"));
    }

    #[tokio::test]
    async fn test_mock_config_obj_is_yaml() {
        let mock = MockDatasource::new().with_config(json!({"a": "b"}));
        let cfg = mock.config_obj().unwrap();
        assert_eq!(cfg["a"].as_str(), Some("b"));
    }
}
