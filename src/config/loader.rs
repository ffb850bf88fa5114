use std::path::Path;

use tracing::warn;

use super::types::{AuthConfig, Config};
use crate::error::{Error, Result};

/// Load configuration from a YAML file
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file does not exist
/// - The file cannot be read
/// - The YAML content is invalid or cannot be parsed
/// - The configuration fails validation (e.g., empty hostname, missing key file)
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.display().to_string(),
        });
    }

    // Warn if the config file has overly permissive permissions (may contain
    // secrets)
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.mode() & 0o777;
            if mode & 0o037 != 0 {
                warn!(
                    config_path = %path.display(),
                    permissions = format!("{mode:04o}"),
                    "Config file may contain secrets and has permissive permissions. \
                     Consider: chmod 640 {}",
                    path.display()
                );
            }
        }
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Validate the configuration
fn validate_config(config: &Config) -> Result<()> {
    if config.target.hostname.is_empty() {
        return Err(Error::ConfigInvalid {
            field: "target.hostname".to_string(),
            reason: "Hostname cannot be empty".to_string(),
        });
    }

    if config.target.user.is_empty() {
        return Err(Error::ConfigInvalid {
            field: "target.user".to_string(),
            reason: "User cannot be empty".to_string(),
        });
    }

    if config.target.port == 0 {
        return Err(Error::IllegalPort { port: 0 });
    }

    // Validate key path exists and permissions (for key auth)
    if let AuthConfig::Key { path, .. } = &config.target.auth {
        let expanded = shellexpand::tilde(path);
        let key_path = Path::new(expanded.as_ref());
        if !key_path.exists() {
            return Err(Error::KeyNotFound { path: path.clone() });
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(metadata) = std::fs::metadata(key_path) {
                let mode = metadata.mode() & 0o777;
                if mode & 0o077 != 0 {
                    return Err(Error::ConfigInvalid {
                        field: "target.auth.path".to_string(),
                        reason: format!(
                            "Key file '{path}' has permissions {mode:04o}; expected 0600. \
                             Fix with: chmod 600 {path}"
                        ),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Get the default config path
#[must_use]
pub fn default_config_path() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".config")
        .join("sshmux")
        .join("config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_not_found() {
        let result = load_config(Path::new("/nonexistent/config.yaml"));
        assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("config.yaml"));
        assert!(path.to_string_lossy().contains("sshmux"));
    }

    #[test]
    fn test_valid_config_with_password_auth() {
        let file = write_config(
            r#"
target:
  hostname: "192.168.1.10"
  user: deploy
  auth:
    type: password
    password: "secret123"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.target.hostname, "192.168.1.10");
        assert_eq!(config.target.port, 22);
    }

    #[test]
    fn test_empty_hostname_rejected() {
        let file = write_config(
            r#"
target:
  hostname: ""
  user: deploy
  auth:
    type: password
    password: "secret"
"#,
        );
        let result = load_config(file.path());
        assert!(
            matches!(result, Err(Error::ConfigInvalid { field, reason })
            if field.contains("hostname") && reason.contains("empty"))
        );
    }

    #[test]
    fn test_empty_user_rejected() {
        let file = write_config(
            r#"
target:
  hostname: "192.168.1.10"
  user: ""
  auth:
    type: password
    password: "secret"
"#,
        );
        let result = load_config(file.path());
        assert!(
            matches!(result, Err(Error::ConfigInvalid { field, reason })
            if field.contains("user") && reason.contains("empty"))
        );
    }

    #[test]
    fn test_zero_port_rejected() {
        let file = write_config(
            r#"
target:
  hostname: "192.168.1.10"
  port: 0
  user: deploy
  auth:
    type: password
    password: "secret"
"#,
        );
        let result = load_config(file.path());
        assert!(matches!(result, Err(Error::IllegalPort { port: 0 })));
    }

    #[test]
    fn test_key_not_found() {
        let file = write_config(
            r#"
target:
  hostname: "192.168.1.10"
  user: deploy
  auth:
    type: key
    path: /nonexistent/path/to/key
"#,
        );
        let result = load_config(file.path());
        assert!(matches!(result, Err(Error::KeyNotFound { .. })));
    }

    #[test]
    fn test_invalid_yaml_syntax() {
        let file = write_config(
            r#"
target:
  hostname: "192.168.1.10"
  user: [invalid yaml here
"#,
        );
        let result = load_config(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_config_with_pool_and_scheduler_sections() {
        let file = write_config(
            r#"
target:
  hostname: "192.168.1.10"
  user: deploy
  auth:
    type: password
    password: "secret"
pool:
  max_connection: 2
  connection_retry: 3
  connection_retry_delay_ms: 500
scheduler:
  exec_retry_delay_ms: 250
limits:
  command_timeout_seconds: 60
  max_output_bytes: 1048576
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.pool.max_connection, 2);
        assert_eq!(config.pool.connection_retry, 3);
        assert_eq!(config.pool.connection_retry_delay_ms, 500);
        assert_eq!(config.scheduler.exec_retry_delay_ms, 250);
        assert_eq!(config.limits.command_timeout_seconds, 60);
        assert_eq!(config.limits.max_output_bytes, 1_048_576);
    }
}
