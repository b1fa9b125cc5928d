//! Fallback datasource that always succeeds with empty data
//!
//! Lets network-mode init proceed on platforms nothing else recognises.
//! `datasource.None.metadata` / `userdata_raw` may supply content.

use async_trait::async_trait;
use serde_json::Value;

use super::{Datasource, DatasourceContext, DatasourceData, DsMode};
use crate::CloudInitError;

pub struct NoneDatasource {
    ds_cfg: serde_yaml::Value,
    data: DatasourceData,
}

impl NoneDatasource {
    pub fn new(ctx: &DatasourceContext) -> Self {
        Self {
            ds_cfg: ctx.ds_cfg("None"),
            data: DatasourceData::default(),
        }
    }
}

#[async_trait]
impl Datasource for NoneDatasource {
    fn name(&self) -> &'static str {
        "None"
    }

    async fn get_data(&mut self) -> Result<bool, CloudInitError> {
        let metadata = match self.ds_cfg.get("metadata") {
            Some(md) => serde_json::to_value(md)?,
            None => Value::Object(Default::default()),
        };
        let userdata_raw = self
            .ds_cfg
            .get("userdata_raw")
            .and_then(|v| v.as_str())
            .map(|s| s.as_bytes().to_vec());

        self.data = DatasourceData {
            metadata,
            userdata_raw,
            dsmode: DsMode::Net,
            cloud_name: "none".to_string(),
            platform: "none".to_string(),
            ..Default::default()
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
