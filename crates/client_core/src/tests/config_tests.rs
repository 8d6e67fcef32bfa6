use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn file_values_override_defaults() {
    let mut config = ChatClientConfig::default();
    apply_file_config(
        &mut config,
        r#"
api_base_url = "https://shop.example/api"
typing_idle_ms = 1500
reconnect_delays_ms = [0, 500]
poll_interval_ms = 3000
"#,
    )
    .expect("parse file config");

    assert_eq!(config.api_base_url, "https://shop.example/api");
    assert_eq!(config.typing_idle, Duration::from_millis(1500));
    assert_eq!(
        config.reconnect_delays,
        vec![Duration::ZERO, Duration::from_millis(500)]
    );
    assert_eq!(config.poll_interval, Some(Duration::from_secs(3)));
    assert_eq!(config.peer_typing_timeout, Duration::from_millis(2500));
}

#[test]
fn app_prefixed_env_wins_over_short_form() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("CHAT_HUB_URL", "ws://short/hub"),
        ("APP__HUB_URL", "wss://prefixed/hub"),
        ("APP__PAGE_SIZE", "0"),
        ("APP__RECONNECT_DELAYS_MS", "0, 250,1000"),
    ]);
    let mut config = ChatClientConfig::default();
    apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(config.hub_url, "wss://prefixed/hub");
    assert_eq!(config.page_size, 1);
    assert_eq!(
        config.reconnect_delays,
        vec![
            Duration::ZERO,
            Duration::from_millis(250),
            Duration::from_secs(1)
        ]
    );
}

#[test]
fn malformed_env_values_are_ignored() {
    let mut config = ChatClientConfig::default();
    apply_env_overrides(&mut config, |key| match key {
        "APP__TYPING_IDLE_MS" => Some("soon".to_string()),
        "APP__RECONNECT_DELAYS_MS" => Some("1,x".to_string()),
        "APP__POLL_INTERVAL_MS" => Some("0".to_string()),
        _ => None,
    });
    assert_eq!(config, ChatClientConfig::default());
}

#[test]
fn load_config_reads_toml_file_from_path() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = env::temp_dir().join(format!("chat_client_config_test_{suffix}"));
    fs::create_dir_all(&temp_root).expect("temp root");
    let path = temp_root.join("chat.toml");
    fs::write(&path, "page_size = 50\n").expect("write config");

    let config = load_config(Some(&path)).expect("load config");
    assert_eq!(config.page_size, 50);

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn load_config_rejects_invalid_toml() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = env::temp_dir().join(format!("chat_client_bad_config_{suffix}"));
    fs::create_dir_all(&temp_root).expect("temp root");
    let path = temp_root.join("chat.toml");
    fs::write(&path, "page_size = \"many\"\n").expect("write config");

    let err = load_config(Some(&path)).expect_err("must fail");
    assert!(err.to_string().contains("invalid config file"));

    fs::remove_dir_all(temp_root).expect("cleanup");
}
