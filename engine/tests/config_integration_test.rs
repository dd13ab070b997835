//! Integration tests for configuration management
//!
//! These tests verify that a configuration file is loaded, validated and
//! turned into a wired runtime.

use atrium_engine::config::Config;
use atrium_engine::runtime::Runtime;
use atrium_engine::search::SearchType;
use sdk::errors::EngineError;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

fn full_config(dir: &Path) -> String {
    format!(
        r#"
[core]
log_level = "debug"
data_dir = "{0}/data"
app_root = "{0}/app"

[assistants]
cache_capacity = 16
default_connector = "gpt"
needsearch_agent = "custom.needsearch"

[connectors.gpt]
base_url = "https://llm.example.com/v1"
model = "gpt-4o"
api_key = "$ENV.ATRIUM_CONFIG_IT_KEY"
options = {{ temperature = 0.3 }}

[connectors.local]
base_url = "http://localhost:11434/v1"
model = "llama3.1:8b"

[search.web]
provider = "serpapi"
api_key = "serp-test-key"
max_results = 8

[sandbox]
enabled = false
timeout = "90s"
max_memory = "2g"

[storage]
sqlite = "{0}/data/atrium.db"
"#,
        dir.display()
    )
}

#[test]
fn test_load_full_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, full_config(dir.path())).unwrap();

    let config = Config::load_from_path(&path).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert!(config.core.data_dir.is_dir());
    assert!(config.core.app_root.is_dir());
    assert_eq!(config.assistants.cache_capacity, 16);
    assert_eq!(config.assistants.default_connector.as_deref(), Some("gpt"));
    assert_eq!(config.assistants.needsearch_agent, "custom.needsearch");
    assert_eq!(config.assistants.keyword_agent, "__system.keyword");

    let gpt = &config.connectors["gpt"];
    assert_eq!(gpt.kind, "openai");
    assert_eq!(gpt.model, "gpt-4o");
    assert_eq!(gpt.options.get("temperature"), Some(&json!(0.3)));
    assert_eq!(
        config.connectors["local"].base_url,
        "http://localhost:11434/v1"
    );

    let web = config.search.web.as_ref().unwrap();
    assert_eq!(web.max_results, Some(8));
    assert_eq!(config.sandbox.timeout, "90s");
    assert_eq!(config.sandbox.image, "atrium/sandbox-claude:latest");
    assert_eq!(
        config.storage.sqlite,
        Some(dir.path().join("data/atrium.db"))
    );
}

#[test]
fn test_minimal_config_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let text = format!(
        "[core]\ndata_dir = \"{0}/data\"\napp_root = \"{0}/app\"\n",
        dir.path().display()
    );

    let config = Config::from_toml_str(&text).unwrap();
    assert_eq!(config.core.log_level, "info");
    assert_eq!(config.assistants.cache_capacity, 200);
    assert!(config.connectors.is_empty());
    assert!(config.search.is_empty());
    assert!(!config.sandbox.enabled);
    assert!(config.storage.sqlite.is_none());
}

#[test]
fn test_invalid_configs_are_rejected() {
    let dir = TempDir::new().unwrap();
    let core = format!(
        "[core]\ndata_dir = \"{0}/data\"\napp_root = \"{0}/app\"\n",
        dir.path().display()
    );

    let cases = [
        "[core]\nlog_level = \"loud\"\n".to_string(),
        format!("{}[assistants]\ncache_capacity = 0\n", core),
        format!("{}[connectors.x]\nkind = \"grpc\"\nmodel = \"m\"\n", core),
        format!("{}[connectors.x]\nmodel = \"  \"\n", core),
        format!("{}[sandbox]\ntimeout = \"soon\"\n", core),
        "not toml at all = = =".to_string(),
    ];

    for text in cases {
        let result = Config::from_toml_str(&text);
        assert!(
            matches!(result, Err(EngineError::Config(_))),
            "accepted invalid config:\n{}",
            text
        );
    }
}

#[test]
fn test_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let result = Config::load_from_path(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[tokio::test]
async fn test_runtime_from_config() {
    let dir = TempDir::new().unwrap();
    std::env::set_var("ATRIUM_CONFIG_IT_KEY", "sk-from-env");
    let config = Config::from_toml_str(&full_config(dir.path())).unwrap();

    let rt = Runtime::from_config(&config);

    assert_eq!(rt.connectors().ids(), vec!["gpt".to_string(), "local".to_string()]);
    let gpt = rt.connectors().get("gpt").unwrap();
    assert_eq!(gpt.model(), "gpt-4o");
    assert_eq!(gpt.setting().get("key"), Some(&json!("sk-from-env")));
    assert!(rt.connectors().get("local").unwrap().setting().get("key").is_none());

    assert_eq!(rt.default_connector().as_deref(), Some("gpt"));
    assert_eq!(rt.needsearch_agent(), "custom.needsearch");
    assert_eq!(rt.cache().capacity(), 16);
    assert!(rt.searcher().handler(SearchType::Web).is_some());
    assert_eq!(rt.search_config().web.and_then(|w| w.max_results), Some(8));

    assert!(matches!(
        rt.sandbox().get_manager().await,
        Err(EngineError::NotConfigured(_))
    ));
}

#[test]
fn test_web_search_needs_a_key() {
    let dir = TempDir::new().unwrap();
    let text = format!(
        "[core]\ndata_dir = \"{0}/data\"\napp_root = \"{0}/app\"\n\n[search.web]\napi_key = \"$ENV.ATRIUM_CONFIG_IT_UNSET\"\n",
        dir.path().display()
    );
    let config = Config::from_toml_str(&text).unwrap();

    let rt = Runtime::from_config(&config);
    assert!(rt.searcher().handler(SearchType::Web).is_none());
}
