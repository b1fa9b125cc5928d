//! Built-in configuration, the lowest layer under /etc/cloud/cloud.cfg

use serde_yaml::Value;

pub const BUILTIN_CONFIG: &str = r#"
datasource_list: [NoCloud, NoCloudNet, Ec2, None]
def_log_file: /var/log/cloud-init.log
system_info:
  distro: ubuntu
features:
  error_on_user_data_failure: true
vendor_data:
  enabled: true
  disabled_handlers: []
manual_cache_clean: false
unverified_modules: []
cloud_init_modules:
  - bootcmd
  - write_files
  - set_hostname
  - update_hostname
cloud_config_modules:
  - runcmd
  - timezone
cloud_final_modules:
  - write_files_deferred
  - scripts_vendor
  - scripts_per_once
  - scripts_per_boot
  - scripts_per_instance
  - scripts_user
  - final_message
"#;

/// The compiled-in defaults as a YAML tree
pub fn builtin_config() -> Value {
    serde_yaml::from_str(BUILTIN_CONFIG).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{get_bool, get_str, get_str_list};

    #[test]
    fn test_builtin_parses() {
        let cfg = builtin_config();
        assert!(cfg.is_mapping());
        assert_eq!(
            get_str_list(&cfg, "datasource_list"),
            vec!["NoCloud", "NoCloudNet", "Ec2", "None"]
        );
        assert_eq!(get_str(&cfg, "system_info.distro"), Some("ubuntu"));
        assert!(get_bool(&cfg, "features.error_on_user_data_failure", false));
        assert!(get_str_list(&cfg, "cloud_init_modules").contains(&"write_files".to_string()));
    }
}
