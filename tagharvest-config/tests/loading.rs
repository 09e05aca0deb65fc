use std::collections::HashMap;
use std::fs;

use tagharvest_config::{ConfigLoader, ConfigSource, ENV_CONFIG_JSON, ENV_CONFIG_PATH};
use tagharvest_core::harvest::ReconnectPolicy;
use tempfile::TempDir;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key: &str| vars.get(key).cloned()
}

fn loader_in(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::new().with_base_dir(dir.path()).with_dotenv(false)
}

#[test]
fn falls_back_to_defaults() {
    let dir = TempDir::new().expect("tempdir");
    let load = loader_in(&dir).load_with(env(&[])).expect("load");
    assert_eq!(load.source, ConfigSource::Default);
    assert_eq!(load.config.schedule.max_batch_size, 20);
    assert_eq!(load.config.output.result_prefix, "TagValues_");
    assert!(load.warnings.is_empty());
}

#[test]
fn finds_candidate_toml_with_partial_keys() {
    let dir = TempDir::new().expect("tempdir");
    fs::create_dir_all(dir.path().join("config")).expect("config dir");
    fs::write(
        dir.path().join("config/tagharvest.toml"),
        r#"
endpoint_url = "opc.tcp://plant-gw:4840"

[schedule]
max_batch_size = 50
reconnect_policy = "end_run"

[stuck]
abandon_after_verifications = 4
"#,
    )
    .expect("write toml");

    let load = loader_in(&dir).load_with(env(&[])).expect("load");
    assert_eq!(
        load.source,
        ConfigSource::File(dir.path().join("config/tagharvest.toml"))
    );
    assert_eq!(load.config.endpoint_url, "opc.tcp://plant-gw:4840");
    assert_eq!(load.config.schedule.max_batch_size, 50);
    assert_eq!(load.config.schedule.reconnect_policy, ReconnectPolicy::EndRun);
    assert_eq!(load.config.schedule.batch_interval_ms, 60_000);
    assert_eq!(load.config.stuck.abandon_after_verifications, Some(4));
}

#[test]
fn env_path_wins_over_candidates() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("tagharvest.toml"), "endpoint_url = \"opc.tcp://ignored:1\"\n")
        .expect("write candidate");
    let explicit = dir.path().join("custom.json");
    fs::write(&explicit, r#"{ "endpoint_url": "opc.tcp://chosen:4840" }"#).expect("write json");

    let path = explicit.to_string_lossy().to_string();
    let load = loader_in(&dir)
        .load_with(env(&[(ENV_CONFIG_PATH, path.as_str())]))
        .expect("load");
    assert_eq!(load.source, ConfigSource::EnvPath(explicit));
    assert_eq!(load.config.endpoint_url, "opc.tcp://chosen:4840");
}

#[test]
fn inline_json_is_accepted() {
    let dir = TempDir::new().expect("tempdir");
    let load = loader_in(&dir)
        .load_with(env(&[(
            ENV_CONFIG_JSON,
            r#"{ "schedule": { "max_batch_size": 5, "publish_interval_ms": 250 } }"#,
        )]))
        .expect("load");
    assert_eq!(load.source, ConfigSource::EnvInline);
    assert_eq!(load.config.schedule.max_batch_size, 5);
    assert_eq!(load.config.schedule.publish_interval_ms, 250);
}

#[test]
fn unknown_extension_tries_toml_then_json() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("harvest.conf");
    fs::write(&path, r#"{ "endpoint_url": "opc.tcp://json-in-disguise:4840" }"#)
        .expect("write conf");

    let path_str = path.to_string_lossy().to_string();
    let load = loader_in(&dir)
        .load_with(env(&[(ENV_CONFIG_PATH, path_str.as_str())]))
        .expect("load");
    assert_eq!(load.config.endpoint_url, "opc.tcp://json-in-disguise:4840");
}

#[test]
fn unusable_values_are_errors() {
    let dir = TempDir::new().expect("tempdir");
    let err = loader_in(&dir)
        .load_with(env(&[(ENV_CONFIG_JSON, r#"{ "schedule": { "max_batch_size": 0 } }"#)]))
        .expect_err("zero batch size");
    assert!(format!("{err:#}").contains("max_batch_size"));
}

#[test]
fn suspicious_values_are_warnings() {
    let dir = TempDir::new().expect("tempdir");
    let load = loader_in(&dir)
        .load_with(env(&[(
            ENV_CONFIG_JSON,
            r#"{ "session": { "keep_alive_count": 50, "lifetime_count": 60 } }"#,
        )]))
        .expect("load");
    assert!(load.warnings.contains_key("session.lifetime_count"));
}

#[test]
fn malformed_file_reports_both_parsers() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("broken.cfg");
    fs::write(&path, "this is = = not config").expect("write");
    let path_str = path.to_string_lossy().to_string();

    let err = loader_in(&dir)
        .load_with(env(&[(ENV_CONFIG_PATH, path_str.as_str())]))
        .expect_err("malformed");
    let message = format!("{err:#}");
    assert!(message.contains("toml error"));
    assert!(message.contains("json error"));
}
