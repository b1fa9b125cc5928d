//! Error types for cloud-init-engine

use thiserror::Error;

/// Main error type for cloud-init-engine operations
#[derive(Error, Debug)]
pub enum CloudInitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Datasource error: {0}")]
    Datasource(String),

    /// No candidate in `datasource_list` produced data
    #[error("Did not find any data source, searched classes: ({})", .searched.join(", "))]
    DatasourceNotFound { searched: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed fetching {url}: {reason}")]
    UrlFetch { url: String, reason: String },

    #[error("User-data error: {0}")]
    UserData(String),

    #[error("Part handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Module error in '{module}': {message}")]
    Module { module: String, message: String },

    #[error("Invalid module definition '{0}'")]
    InvalidModule(String),

    #[error("Command execution failed: {0}")]
    Command(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl CloudInitError {
    /// Create a module error
    pub fn module(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Module {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Create a part handler error
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    pub fn url_fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UrlFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// True for the expected "nothing found" outcome of datasource resolution
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DatasourceNotFound { .. })
    }
}
