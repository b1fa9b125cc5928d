//! Jinja2-compatible template rendering
//!
//! Renders `## template: jinja` user-data parts against instance data.

pub mod context;

pub use context::build_context;

use crate::{CloudInitError, util};
use minijinja::Environment;
use std::path::Path;
use tracing::debug;

const TEMPLATE_MARKERS: [&str; 2] = ["## template: jinja", "## template:jinja"];

/// Check if content is a Jinja template (has the template marker)
pub fn is_jinja_template(content: &str) -> bool {
    let trimmed = content.trim_start();
    TEMPLATE_MARKERS
        .iter()
        .any(|m| trimmed.to_lowercase().starts_with(m))
}

/// Strip the template marker line from content
pub fn strip_template_marker(content: &str) -> &str {
    let trimmed = content.trim_start();
    if !is_jinja_template(trimmed) {
        return content;
    }
    match trimmed.split_once('\n') {
        Some((_, rest)) => rest,
        None => "",
    }
}

/// Render a Jinja template against instance data
pub fn render_template(
    template: &str,
    instance_data: &serde_json::Value,
) -> Result<String, CloudInitError> {
    debug!("Rendering Jinja template");

    let template_content = strip_template_marker(template);

    let mut env = Environment::new();
    env.add_template("template", template_content)
        .map_err(|e| CloudInitError::InvalidData(format!("Template parse error: {}", e)))?;

    let tmpl = env
        .get_template("template")
        .map_err(|e| CloudInitError::InvalidData(format!("Template error: {}", e)))?;

    let ctx = minijinja::Value::from_serialize(build_context(instance_data));
    tmpl.render(ctx)
        .map_err(|e| CloudInitError::InvalidData(format!("Template render error: {}", e)))
}

/// Render a template using the instance data JSON at `instance_data_file`
pub async fn render_from_file(
    template: &str,
    instance_data_file: &Path,
) -> Result<String, CloudInitError> {
    let Some(raw) = util::read_optional(instance_data_file).await? else {
        return Err(CloudInitError::InvalidData(format!(
            "Cannot render jinja template vars. Instance data not yet present at {}",
            instance_data_file.display()
        )));
    };
    let data: serde_json::Value = serde_json::from_slice(&raw)?;
    render_template(template, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn instance_data() -> serde_json::Value {
        json!({
            "v1": {
                "instance_id": "i-1234567890abcdef0",
                "local_hostname": "ip-10-0-0-1",
                "region": "us-east-1",
            },
            "ds": {"meta_data": {"instance-id": "i-1234567890abcdef0"}},
        })
    }

    #[test]
    fn test_is_jinja_template() {
        assert!(is_jinja_template("## template: jinja\n#cloud-config"));
        assert!(is_jinja_template("## template:jinja\n#cloud-config"));
        assert!(is_jinja_template("  ## template: jinja\n"));
        assert!(!is_jinja_template("#cloud-config\nhostname: test"));
    }

    #[test]
    fn test_strip_template_marker() {
        assert_eq!(
            strip_template_marker("## template: jinja\n#cloud-config\nhostname: test"),
            "#cloud-config\nhostname: test"
        );
        assert_eq!(
            strip_template_marker("#cloud-config\nhostname: test"),
            "#cloud-config\nhostname: test"
        );
    }

    #[test]
    fn test_render_top_level_and_ds() {
        let template = "## template: jinja\n#cloud-config\nhostname: {{ local_hostname }}\nid: {{ ds.meta_data.instance_id }}";
        let rendered = render_template(template, &instance_data()).unwrap();
        assert!(rendered.contains("hostname: ip-10-0-0-1"));
        assert!(rendered.contains("id: i-1234567890abcdef0"));
        assert!(rendered.starts_with("#cloud-config"));
    }

    #[test]
    fn test_render_conditional() {
        let template = r#"## template: jinja
#cloud-config
{% if v1.region == "us-east-1" %}
timezone: America/New_York
{% else %}
timezone: UTC
{% endif %}"#;
        let rendered = render_template(template, &instance_data()).unwrap();
        assert!(rendered.contains("America/New_York"));
    }

    #[test]
    fn test_render_invalid_syntax() {
        let result = render_template("## template: jinja\nvalue: {{ invalid", &instance_data());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_render_from_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = render_from_file("## template: jinja\nx", &temp.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Instance data not yet present"));
    }
}
