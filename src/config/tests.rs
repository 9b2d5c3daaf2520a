//! 配置模块测试

use super::*;
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_default_config_matches_documented_values() {
    let config = Config::default();

    assert_eq!(config.server.listen, "0.0.0.0:8080");
    assert_eq!(config.server.max_connections_per_ip, 50);
    assert_eq!(config.server.max_message_size, 1024 * 1024);
    assert_eq!(config.heartbeat.interval_secs, 30);
    assert_eq!(config.heartbeat.timeout_secs, 20);
    assert_eq!(config.heartbeat.max_missed_pings, 2);
    assert_eq!(config.rate_limit.min_ping_interval_secs, 10);
    assert_eq!(config.rate_limit.max_violations, 3);
    assert_eq!(config.client.server_url, "ws://localhost:8080/ws");
    assert_eq!(config.client.heartbeat.interval_secs, 5);
    assert_eq!(config.client.heartbeat.timeout_secs, 3);
    assert_eq!(config.logging.level, "info");

    config.validate().expect("默认配置应通过校验");
}

#[test]
fn test_parse_partial_yaml_keeps_defaults() {
    let yaml = r#"
server:
  listen: "127.0.0.1:9000"
  max_connections_per_ip: 5
rate_limit:
  max_violations: 7
"#;
    let config = parse_config(yaml).unwrap();

    assert_eq!(config.server.listen, "127.0.0.1:9000");
    assert_eq!(config.server.max_connections_per_ip, 5);
    assert_eq!(config.server.read_timeout_secs, 60);
    assert_eq!(config.rate_limit.max_violations, 7);
    assert_eq!(config.rate_limit.min_ping_interval_secs, 10);
    assert_eq!(config.heartbeat, HeartbeatSettings::default());
}

#[test]
fn test_parse_partial_heartbeat_section() {
    let config = parse_config("heartbeat:\n  interval_secs: 40\n").unwrap();

    assert_eq!(config.heartbeat.interval_secs, 40);
    assert_eq!(config.heartbeat.timeout_secs, 20);
    assert_eq!(config.heartbeat.max_missed_pings, 2);
    assert!(config.heartbeat.enable_metrics);
    assert_eq!(config.client.heartbeat, ClientConfig::default().heartbeat);
    config.validate().unwrap();
}

#[test]
fn test_parse_partial_client_heartbeat_uses_client_profile() {
    let yaml = r#"
client:
  heartbeat:
    max_missed_pings: 4
"#;
    let config = parse_config(yaml).unwrap();

    assert_eq!(config.client.heartbeat.interval_secs, 5);
    assert_eq!(config.client.heartbeat.timeout_secs, 3);
    assert_eq!(config.client.heartbeat.max_missed_pings, 4);
    assert_eq!(config.heartbeat, HeartbeatSettings::default());
}

#[test]
fn test_parse_null_heartbeat_section_is_default() {
    let config = parse_config("heartbeat:\nclient:\n  heartbeat:\n").unwrap();
    assert_eq!(config.heartbeat, HeartbeatSettings::default());
    assert_eq!(config.client.heartbeat, ClientConfig::default().heartbeat);
}

#[test]
fn test_parse_empty_yaml_is_default() {
    assert_eq!(parse_config("").unwrap(), Config::default());
    assert_eq!(parse_config("   \n").unwrap(), Config::default());
}

#[test]
fn test_parse_invalid_yaml() {
    let result = parse_config("server: [not, a, map");
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn test_validate_rejects_timeout_not_below_interval() {
    let mut config = Config::default();
    config.heartbeat.timeout_secs = config.heartbeat.interval_secs;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn test_validate_rejects_zero_threshold() {
    let mut config = Config::default();
    config.heartbeat.max_missed_pings = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.server.max_connections_per_ip = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_read_timeout_must_cover_heartbeat_cycle() {
    let mut config = Config::default();
    config.server.read_timeout_secs = 30;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("read_timeout_secs"));

    config.server.read_timeout_secs = 51;
    assert!(config.validate().is_ok());
}

#[test]
fn test_validate_heartbeat_interval_respects_rate_limit() {
    let mut config = Config::default();
    config.heartbeat.interval_secs = 5;
    config.heartbeat.timeout_secs = 2;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("min_ping_interval_secs"));

    config.rate_limit.min_ping_interval_secs = 5;
    assert!(config.validate().is_ok());
}

#[test]
fn test_lifecycle_settings_conversion() {
    let mut config = Config::default();
    config.server.write_timeout_secs = 3;
    config.rate_limit.min_ping_interval_secs = 2;

    let settings = config.lifecycle_settings();
    assert_eq!(settings.heartbeat.interval, Duration::from_secs(30));
    assert_eq!(settings.heartbeat.timeout, Duration::from_secs(20));
    assert_eq!(settings.read_timeout, Duration::from_secs(60));
    assert_eq!(settings.write_timeout, Duration::from_secs(3));
    assert_eq!(settings.max_connections_per_ip, 50);
    assert_eq!(settings.rate_limit.min_interval, Duration::from_secs(2));
    assert_eq!(settings.rate_limit.max_violations, 3);
}

#[test]
fn test_overrides_server_url_precedence() {
    let vars: HashMap<&str, &str> = [
        ("SERVER_URL", "ws://primary:1/ws"),
        ("WEBSOCKET_SERVER", "ws://fallback:2/ws"),
    ]
    .into_iter()
    .collect();

    let mut config = Config::default();
    config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));
    assert_eq!(config.client.server_url, "ws://primary:1/ws");
}

#[test]
fn test_overrides_fallback_and_blank_values() {
    let vars: HashMap<&str, &str> = [
        ("SERVER_URL", "  "),
        ("WEBSOCKET_SERVER", "ws://fallback:2/ws"),
        ("ECHOGUARD_LISTEN", "127.0.0.1:7000"),
    ]
    .into_iter()
    .collect();

    let mut config = Config::default();
    config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));
    assert_eq!(config.client.server_url, "ws://fallback:2/ws");
    assert_eq!(config.server.listen, "127.0.0.1:7000");
}

#[test]
fn test_overrides_absent_keeps_config() {
    let mut config = Config::default();
    config.apply_overrides_from(|_| None);
    assert_eq!(config, Config::default());
}

#[test]
fn test_save_and_load_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("config.yaml");

    let mut config = Config::default();
    config.server.listen = "127.0.0.1:18080".to_string();
    config.server.max_connections_per_ip = 8;
    config.logging.level = "debug".to_string();

    save_config(&path, &config).unwrap();
    assert!(path.exists());

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(parse_config(&content).unwrap(), config);

    let loaded = load_config(Some(&path)).unwrap();
    assert_eq!(loaded.server.max_connections_per_ip, 8);
    assert_eq!(loaded.logging.level, "debug");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("absent.yaml");

    let loaded = load_config(Some(&path)).unwrap();
    assert_eq!(loaded.server, ServerConfig::default());
    assert_eq!(loaded.rate_limit, RateLimitSettings::default());
}

#[test]
fn test_load_invalid_values_fails_validation() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.yaml");
    std::fs::write(
        &path,
        "heartbeat:\n  interval_secs: 5\n  timeout_secs: 9\n  max_missed_pings: 2\n",
    )
    .unwrap();

    let result = load_config(Some(&path));
    assert!(matches!(result, Err(ConfigError::ValidationError(_))));
}

#[test]
fn test_default_config_path_location() {
    let path = default_config_path();
    assert!(path.ends_with(".echoguard/config.yaml"));
    assert_eq!(collapse_tilde(&path), DEFAULT_CONFIG_PATH);
}
