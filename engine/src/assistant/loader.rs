//! Assistant loading
//!
//! Assistants come from three places: package directories under
//! `<app_root>/assistants`, records in the assistant store, and in-memory
//! records. All three end in [`Runtime::initialize`], which binds the
//! connector and checks the hook script for `Init`.
//!
//! A package directory looks like:
//!
//! ```text
//! assistants/tests/basic/
//!   package.toml        descriptor (required)
//!   prompts.toml        [[prompts]] entries, `@assets/<file>` inlined
//!   tools.json          tool manifest
//!   src/index.wasm      hook script
//!   src/<name>.wasm     handler scripts, `agents.<id>.<name>`
//!   locales/<lang>.toml
//!   assets/
//!   skills/             mounted into sandboxes
//! ```

use super::normalize::definition_from_map;
use super::{Assistant, Prompt, VISION_CAPABLE_MODELS};
use crate::config::resolve_env_ref;
use crate::runtime::Runtime;
use crate::script::{HookScript, ScriptScope};
use crate::store::{AssistantFilter, AssistantRecord};
use regex::Regex;
use sdk::errors::EngineError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const PACKAGE_FILE: &str = "package.toml";
const PROMPTS_FILE: &str = "prompts.toml";
const TOOLS_FILE: &str = "tools.json";
const ASSISTANTS_PREFIX: &str = "/assistants/";

/// Hook function looked up at initialization
const INIT_FUNCTION: &str = "Init";

#[derive(Debug, Deserialize)]
struct PromptsFile {
    #[serde(default)]
    prompts: Vec<Prompt>,
}

/// A package read from disk, not yet initialized
struct Package {
    data: AssistantRecord,
    script: Option<Arc<dyn HookScript>>,
    scripts: BTreeMap<String, Arc<dyn HookScript>>,
}

static ASSET_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Matches `@assets/<file>` references in prompts
fn asset_pattern() -> &'static Regex {
    ASSET_PATTERN.get_or_init(|| {
        Regex::new(r"@assets/([^\s]+\.(?:md|yml|yaml|json|txt))").expect("Invalid asset pattern")
    })
}

/// Assistant id for a logical package path: `/assistants/a/b` -> `a.b`
pub fn id_from_path(path: &str) -> String {
    let relative = path
        .strip_prefix(ASSISTANTS_PREFIX)
        .unwrap_or(path)
        .trim_matches('/');
    relative.replace('/', ".")
}

fn mtime_nanos(path: &Path) -> Result<i64, EngineError> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(since_epoch_nanos(modified))
}

/// Nanoseconds since the Unix epoch, saturating at `i64::MAX`
fn since_epoch_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn toml_table(path: &Path) -> Result<Map<String, Value>, EngineError> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: toml::Value = toml::from_str(&raw)
        .map_err(|e| EngineError::Parse(format!("{}: {}", path.display(), e)))?;
    match serde_json::to_value(parsed)? {
        Value::Object(map) => Ok(map),
        _ => Err(EngineError::Parse(format!(
            "{}: expected a table",
            path.display()
        ))),
    }
}

impl Runtime {
    /// Directory holding the assistant packages
    pub fn assistants_root(&self) -> PathBuf {
        self.app_root().join("assistants")
    }

    /// Load the package at a logical path such as `/assistants/tests/basic`
    ///
    /// Fails with `NotFound` without a `package.toml` and with `Parse` when
    /// any file of the package is malformed.
    pub fn load_from_path(&self, path: &str) -> Result<Assistant, EngineError> {
        let package = self.read_package(path)?;
        self.load_map_with(&package.data, package.script, package.scripts)
    }

    /// Load an assistant from a record
    pub fn load_from_map(&self, data: &AssistantRecord) -> Result<Assistant, EngineError> {
        self.load_map_with(data, None, BTreeMap::new())
    }

    /// Load an assistant from a record with already compiled scripts
    ///
    /// A `source` string in the record is compiled and wins over
    /// `compiled`; otherwise `compiled` is used as is.
    pub fn load_map_with(
        &self,
        data: &AssistantRecord,
        compiled: Option<Arc<dyn HookScript>>,
        scripts: BTreeMap<String, Arc<dyn HookScript>>,
    ) -> Result<Assistant, EngineError> {
        let definition = definition_from_map(data)?;

        let script = match definition.source.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(source) => {
                let engine = self.script_engine();
                let file = format!(
                    "assistants/{}/src/index.{}",
                    definition.id,
                    engine.extension()
                );
                Some(engine.compile(&definition.id, &file, source.as_bytes())?)
            }
            None => compiled,
        };

        let mut assistant =
            Assistant::new(definition).with_handlers(Arc::clone(self.handlers()));
        assistant.script = script;
        assistant.scripts = scripts;
        self.initialize(&mut assistant)?;

        let owner = assistant.handler_owner();
        for (script_id, script) in &assistant.scripts {
            self.handlers()
                .register(assistant.id(), script_id, owner, Arc::clone(script));
        }

        debug!("Loaded assistant '{}'", assistant.id());
        Ok(assistant)
    }

    /// Bind the connector, detect vision support and check the hook script
    pub fn initialize(&self, assistant: &mut Assistant) -> Result<(), EngineError> {
        let connector_id = Some(assistant.definition.connector.clone())
            .filter(|c| !c.is_empty())
            .or_else(|| self.default_connector());

        match connector_id {
            Some(id) => {
                let connector = self.connectors().get(&id)?;
                assistant.definition.connector = id;
                assistant.connector = Some(connector);
            }
            None => debug!("Assistant '{}' has no connector", assistant.id()),
        }

        let model = assistant
            .definition
            .options
            .get("model")
            .and_then(Value::as_str)
            .map(|m| m.strip_prefix("moapi:").unwrap_or(m).to_string())
            .or_else(|| assistant.connector.as_ref().map(|c| c.model().to_string()))
            .unwrap_or_default();
        assistant.vision = VISION_CAPABLE_MODELS.contains(&model.as_str());

        if let Some(script) = &assistant.script {
            let ctx = script.new_context(&ScriptScope::default())?;
            assistant.init_hook = ctx.has(INIT_FUNCTION);
        }

        assistant.validate()
    }

    /// Load an assistant by id: cache first, then the store
    ///
    /// Records that point at a package path are loaded from the package.
    pub async fn load_from_store(&self, id: &str) -> Result<Arc<Assistant>, EngineError> {
        if let Some(assistant) = self.cache().get(id) {
            return Ok(assistant);
        }

        let store = self
            .store()
            .ok_or_else(|| EngineError::NotConfigured("no assistant store configured".to_string()))?;
        let record = store.get_assistant(id).await?;

        let path = record
            .get("path")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(String::from);

        let rt = self.clone();
        let assistant = tokio::task::spawn_blocking(move || match path {
            Some(path) => rt.load_from_path(&path),
            None => rt.load_from_map(&record),
        })
        .await
        .map_err(|e| EngineError::Execution(format!("assistant loader panicked: {}", e)))??;

        let assistant = Arc::new(assistant);
        self.cache().put(Arc::clone(&assistant));
        Ok(assistant)
    }

    /// Load every package under `assistants/` as a built-in assistant
    ///
    /// Packages that fail to load are logged and skipped. Built-ins are
    /// saved to the store and stale built-ins are removed from it.
    pub async fn load_built_in(&self) -> Result<Vec<String>, EngineError> {
        self.cache().clear();

        let rt = self.clone();
        let loaded = tokio::task::spawn_blocking(move || rt.load_package_tree())
            .await
            .map_err(|e| EngineError::Execution(format!("assistant loader panicked: {}", e)))??;

        let mut ids = Vec::with_capacity(loaded.len());
        let store = self.store();

        for (index, mut assistant) in loaded.into_iter().enumerate() {
            assistant.definition.readonly = true;
            assistant.definition.built_in = true;
            if assistant.definition.sort == 0 {
                assistant.definition.sort = index as i64 + 1;
            }

            if let Some(store) = &store {
                store.save_assistant(&assistant.to_map()).await?;
            }

            ids.push(assistant.id().to_string());
            self.cache().put(Arc::new(assistant));
        }

        if let Some(store) = &store {
            let removed = store
                .delete_assistants(&AssistantFilter {
                    built_in: Some(true),
                    exclude_ids: ids.clone(),
                    ..Default::default()
                })
                .await?;
            if removed > 0 {
                info!("Removed {} stale built-in assistant(s)", removed);
            }
        }

        info!("Loaded {} built-in assistant(s)", ids.len());
        Ok(ids)
    }

    fn load_package_tree(&self) -> Result<Vec<Assistant>, EngineError> {
        let root = self.assistants_root();
        if !root.is_dir() {
            warn!("Assistants directory {} does not exist", root.display());
            return Ok(Vec::new());
        }

        let mut packages = Vec::new();
        find_packages(&root, &mut packages)?;
        packages.sort();

        let mut loaded = Vec::with_capacity(packages.len());
        for dir in packages {
            let Ok(relative) = dir.strip_prefix(&root) else {
                continue;
            };
            let path = format!(
                "{}{}",
                ASSISTANTS_PREFIX,
                relative.to_string_lossy().replace('\\', "/")
            );
            match self.load_from_path(&path) {
                Ok(assistant) => loaded.push(assistant),
                Err(e) => warn!("Skipping assistant package {}: {}", path, e),
            }
        }
        Ok(loaded)
    }

    fn read_package(&self, path: &str) -> Result<Package, EngineError> {
        let dir = self.app_root().join(path.trim_start_matches('/'));
        let package_file = dir.join(PACKAGE_FILE);
        if !package_file.is_file() {
            return Err(EngineError::NotFound(format!(
                "{} not found in {}",
                PACKAGE_FILE, path
            )));
        }

        let mut data = toml_table(&package_file)?;

        if let Some(Value::String(connector)) = data.get("connector") {
            if connector.starts_with("$ENV.") {
                if let Some(resolved) = resolve_env_ref(connector).filter(|v| !v.is_empty()) {
                    data.insert("connector".to_string(), Value::String(resolved));
                }
            }
        }

        let id = id_from_path(path);
        data.insert("assistant_id".to_string(), Value::String(id.clone()));
        data.insert("path".to_string(), Value::String(path.to_string()));
        data.entry("type".to_string())
            .or_insert_with(|| Value::String("assistant".to_string()));

        let mut updated_at = 0i64;

        let prompts_file = dir.join(PROMPTS_FILE);
        if prompts_file.is_file() {
            let prompts = load_prompts(&prompts_file, &dir)?;
            data.insert("prompts".to_string(), serde_json::to_value(prompts)?);
            updated_at = updated_at.max(mtime_nanos(&prompts_file)?);
        }

        let engine = self.script_engine();
        let extension = engine.extension().to_string();
        let src = dir.join("src");
        let index_file = src.join(format!("index.{}", extension));
        let mut script = None;
        if index_file.is_file() {
            script = Some(engine.compile_file(&id, &index_file)?);
            updated_at = updated_at.max(mtime_nanos(&index_file)?);
        }

        let mut scripts = BTreeMap::new();
        if src.is_dir() {
            for entry in std::fs::read_dir(&src)? {
                let file = entry?.path();
                if file == index_file
                    || file.extension().and_then(|e| e.to_str()) != Some(extension.as_str())
                {
                    continue;
                }
                let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let compiled = engine.compile_file(&format!("{}.{}", id, stem), &file)?;
                scripts.insert(stem.to_string(), compiled);
            }
        }

        let tools_file = dir.join(TOOLS_FILE);
        if tools_file.is_file() {
            let raw = std::fs::read_to_string(&tools_file)?;
            let tools = if raw.trim().is_empty() {
                serde_json::json!({ "tools": [], "prompts": [] })
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    EngineError::Parse(format!("{}: {}", tools_file.display(), e))
                })?
            };
            data.insert("tools".to_string(), tools);
            updated_at = updated_at.max(mtime_nanos(&tools_file)?);
        }

        let locales = load_locales(&dir.join("locales"))?;
        if !locales.is_empty() {
            data.insert("locales".to_string(), Value::Object(locales));
        }

        if updated_at > 0 {
            data.insert("updated_at".to_string(), Value::from(updated_at));
        }

        Ok(Package {
            data,
            script,
            scripts,
        })
    }
}

fn find_packages(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), EngineError> {
    if dir.join(PACKAGE_FILE).is_file() {
        found.push(dir.to_path_buf());
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            find_packages(&path, found)?;
        }
    }
    Ok(())
}

/// Read `[[prompts]]`, inlining `@assets/<file>` references
fn load_prompts(file: &Path, root: &Path) -> Result<Vec<Prompt>, EngineError> {
    let raw = std::fs::read_to_string(file)?;
    let parsed: PromptsFile = toml::from_str(&raw)
        .map_err(|e| EngineError::Parse(format!("{}: {}", file.display(), e)))?;

    let pattern = asset_pattern();
    Ok(parsed
        .prompts
        .into_iter()
        .map(|mut prompt| {
            prompt.content = pattern
                .replace_all(&prompt.content, |caps: &regex::Captures| {
                    let asset = root.join("assets").join(&caps[1]);
                    std::fs::read_to_string(&asset).unwrap_or_else(|e| {
                        warn!("Prompt asset {} unreadable: {}", asset.display(), e);
                        String::new()
                    })
                })
                .into_owned();
            prompt
        })
        .collect())
}

fn load_locales(dir: &Path) -> Result<Map<String, Value>, EngineError> {
    let mut locales = Map::new();
    if !dir.is_dir() {
        return Ok(locales);
    }
    for entry in std::fs::read_dir(dir)? {
        let file = entry?.path();
        if file.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Some(lang) = file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        locales.insert(lang.to_lowercase(), Value::Object(toml_table(&file)?));
    }
    Ok(locales)
}
