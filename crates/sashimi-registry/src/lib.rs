//! Project and registry layer.
//!
//! The registry is the process-wide map of projects, each project a map of
//! datasets. Projects are discovered from a directory tree (one subdirectory
//! per project, `*.json` files as datasets, `_`-prefixed files as configs),
//! created over HTTP, or synthesized from master-config bootstrap
//! definitions. Sandbox projects evict stale datasets through a lazy,
//! request-driven cron tick.
//!
//! Locking: the registry's project map and each project's dataset map guard
//! membership only; record access is serialized by the per-dataset
//! `RwLock<Dataset>` handed to callers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use sashimi_engine::{
    model_from_config, validate_dataset_name, Config, ConfigChain, ConfigRole, Dataset,
    EngineError, EvalModel,
};

/// Cadence of the coalesced sandbox-eviction tick.
const CRON_PERIOD: Duration = Duration::from_secs(10);

const PROJECT_CONFIG_FILE: &str = "__project.yml";

/// Name of the synthetic project that receives master-config bootstrap
/// datasets. It lives in memory only and is never persisted.
const BOOTSTRAP_PROJECT: &str = "default";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no such project {0:?}")]
    ProjectNotFound(String),
    #[error("no such dataset {dataset:?} in project {project:?}")]
    DatasetNotFound { project: String, dataset: String },
    #[error("project {0:?} already exists")]
    ProjectExists(String),
    #[error("no projects directory configured")]
    NoProjectsRoot,
    #[error("failed to load dataset from {location:?}: {message}")]
    Load { location: String, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn load_error(location: impl Into<String>, message: impl std::fmt::Display) -> RegistryError {
    RegistryError::Load {
        location: location.into(),
        message: message.to_string(),
    }
}

/// Config values resolved over the master → project → dataset chain, owned
/// so no lock is held while they are used.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub tokens: Vec<String>,
    pub trusted_ips: Vec<String>,
    pub ip_header: Option<String>,
    pub limit: Option<usize>,
    pub sandbox: bool,
    pub sandbox_expire: u64,
}

pub type SharedDataset = Arc<RwLock<Dataset>>;

/// A namespace owning datasets, tokens and policy. Holds no back-pointer to
/// the registry; chain resolution receives the master node explicitly.
pub struct Project {
    name: String,
    path: Option<PathBuf>,
    config: RwLock<Config>,
    datasets: RwLock<HashMap<String, SharedDataset>>,
}

impl Project {
    fn new(name: impl Into<String>, path: Option<PathBuf>, config: Config) -> Self {
        Self {
            name: name.into(),
            path,
            config: RwLock::new(config),
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// Loads a project from its directory: `__project.yml` as config, every
    /// non-`_`-prefixed `*.json` file as a dataset with an optional
    /// `_<name>.yaml` config next to it.
    fn discover(path: &Path) -> Result<Self, RegistryError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| load_error(path.display().to_string(), "unreadable directory name"))?
            .to_string();
        let config = Config::load_or_default(ConfigRole::Project, &path.join(PROJECT_CONFIG_FILE))?;
        let project = Self::new(name, Some(path.to_path_buf()), config);

        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('_') {
                continue;
            }
            let Some(ds_name) = file_name.strip_suffix(".json") else {
                continue;
            };
            if let Err(err) = project.load_local_dataset(ds_name, &entry.path()) {
                warn!(project = %project.name, dataset = ds_name, error = %err, "skipping dataset");
            }
        }
        Ok(project)
    }

    fn load_local_dataset(&self, name: &str, data_path: &Path) -> Result<(), RegistryError> {
        let config = match self.dataset_config_path(name) {
            Some(config_path) => Config::load_or_default(ConfigRole::Dataset, &config_path)?,
            None => Config::new(ConfigRole::Dataset),
        };
        let format = config.get_str("format").map(str::to_owned);
        let mut dataset = Dataset::new(name, config)?;
        let records = load_file(data_path, format.as_deref())?;
        dataset.set_records(records, None, None);
        dataset.set_local_path(Some(data_path.to_path_buf()));
        info!(project = %self.name, dataset = name, records = dataset.len(), "dataset loaded");
        self.datasets
            .write()
            .insert(name.to_string(), Arc::new(RwLock::new(dataset)));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|p| p.join(PROJECT_CONFIG_FILE))
    }

    pub fn dataset_config_path(&self, name: &str) -> Option<PathBuf> {
        self.path.as_ref().map(|p| p.join(format!("_{name}.yaml")))
    }

    pub fn dataset_data_path(&self, name: &str) -> Option<PathBuf> {
        self.path.as_ref().map(|p| p.join(format!("{name}.json")))
    }

    pub fn get_dataset(&self, name: &str) -> Option<SharedDataset> {
        self.datasets.read().get(name).cloned()
    }

    pub fn dataset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.datasets.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn datasets_snapshot(&self) -> Vec<(String, SharedDataset)> {
        let mut entries: Vec<(String, SharedDataset)> = self
            .datasets
            .read()
            .iter()
            .map(|(name, ds)| (name.clone(), ds.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn insert_dataset(&self, name: &str, dataset: SharedDataset) {
        self.datasets.write().insert(name.to_string(), dataset);
    }

    fn remove_dataset(&self, name: &str) -> Option<SharedDataset> {
        self.datasets.write().remove(name)
    }

    /// Replaces the project config from an uploaded YAML document: the raw
    /// text is written back verbatim (comments survive) and the in-memory
    /// node swapped.
    pub fn write_config(&self, raw: &str) -> Result<(), RegistryError> {
        let config = Config::from_yaml_str(ConfigRole::Project, raw)?;
        if let Some(path) = self.config_path() {
            std::fs::write(path, raw)?;
        }
        *self.config.write() = config;
        Ok(())
    }

    /// Same as [`write_config`](Self::write_config) for a dataset node; the
    /// caller applies the returned config under the dataset's write lock.
    pub fn write_dataset_config(&self, name: &str, raw: &str) -> Result<Config, RegistryError> {
        let config = Config::from_yaml_str(ConfigRole::Dataset, raw)?;
        if let Some(path) = self.dataset_config_path(name) {
            std::fs::write(path, raw)?;
        }
        Ok(config)
    }

    /// Mints a fresh 50-character token, appends it to the project's own
    /// (non-inherited) config and persists the node. The token is returned
    /// exactly once.
    pub fn new_key(&self) -> Result<String, RegistryError> {
        let token = generate_token();
        match self.config_path() {
            Some(path) => {
                let mut own = Config::load_or_default(ConfigRole::Project, &path)?;
                own.push_list_item("tokens", Value::from(token.clone()));
                own.save(&path)?;
                *self.config.write() = own;
            }
            None => {
                self.config
                    .write()
                    .push_list_item("tokens", Value::from(token.clone()));
            }
        }
        Ok(token)
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(50)
        .map(char::from)
        .collect()
}

/// Process-wide project map plus the master config and the shared
/// expression model.
pub struct Registry {
    root: Option<PathBuf>,
    master: RwLock<Config>,
    model: EvalModel,
    projects: RwLock<HashMap<String, Arc<Project>>>,
    last_cron: Mutex<Instant>,
}

impl Registry {
    /// Builds the registry from the master config: compiles the expression
    /// model, scans the projects root (when configured) and loads bootstrap
    /// datasets into the in-memory `default` project.
    pub async fn open(master: Config) -> Result<Self, RegistryError> {
        let model = model_from_config(&master)?;
        let root = master.get_str("projects").map(PathBuf::from);

        let registry = Self {
            root: root.clone(),
            master: RwLock::new(master),
            model,
            projects: RwLock::new(HashMap::new()),
            last_cron: Mutex::new(Instant::now()),
        };

        if let Some(root) = &root {
            registry.scan_projects_root(root)?;
        }
        registry.load_bootstrap_datasets().await?;
        Ok(registry)
    }

    fn scan_projects_root(&self, root: &Path) -> Result<(), RegistryError> {
        info!(path = %root.display(), "loading projects");
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match Project::discover(&entry.path()) {
                Ok(project) => {
                    self.projects
                        .write()
                        .insert(project.name().to_string(), Arc::new(project));
                }
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "skipping project");
                }
            }
        }
        Ok(())
    }

    /// Master-config `datasets` definitions (including `SASHIMI_DATASET`
    /// seeds) land in the synthetic `default` project.
    async fn load_bootstrap_datasets(&self) -> Result<(), RegistryError> {
        let definitions = match self.master.read().get("datasets") {
            Some(Value::Object(map)) if !map.is_empty() => map.clone(),
            _ => return Ok(()),
        };

        let project = self.ensure_project(BOOTSTRAP_PROJECT);
        for (name, definition) in &definitions {
            let Some(definition) = definition.as_object() else {
                warn!(dataset = %name, "ignoring non-mapping dataset definition");
                continue;
            };
            match self.load_source(definition).await {
                Ok(records) => {
                    let mut dataset = Dataset::new(name, Config::new(ConfigRole::Dataset))?;
                    dataset.set_records(records, None, None);
                    if let Some(file) = definition.get("file").and_then(Value::as_str) {
                        dataset.set_local_path(Some(PathBuf::from(file)));
                    }
                    project.insert_dataset(name, Arc::new(RwLock::new(dataset)));
                }
                Err(err) => {
                    warn!(dataset = %name, error = %err, "failed to load bootstrap dataset");
                }
            }
        }
        Ok(())
    }

    fn ensure_project(&self, name: &str) -> Arc<Project> {
        let mut projects = self.projects.write();
        projects
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Project::new(name, None, Config::new(ConfigRole::Project)))
            })
            .clone()
    }

    async fn load_source(&self, definition: &Map<String, Value>) -> Result<Vec<Value>, RegistryError> {
        let keypath: Vec<String> = definition
            .get("keypath")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let format = definition.get("format").and_then(Value::as_str);
        if let Some(file) = definition.get("file").and_then(Value::as_str) {
            let value = load_file_value(Path::new(file), format)?;
            return records_from_value(value, &keypath).map_err(|e| load_error(file, e));
        }
        if let Some(url) = definition.get("url").and_then(Value::as_str) {
            let value = load_url(url).await?;
            return records_from_value(value, &keypath).map_err(|e| load_error(url, e));
        }
        Err(load_error(
            serde_json::to_string(definition).unwrap_or_default(),
            "definition needs a 'file' or 'url' key",
        ))
    }

    pub fn model(&self) -> &EvalModel {
        &self.model
    }

    pub fn project(&self, name: &str) -> Result<Arc<Project>, RegistryError> {
        self.projects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ProjectNotFound(name.to_string()))
    }

    pub fn dataset(
        &self,
        project_name: &str,
        ds_name: &str,
    ) -> Result<(Arc<Project>, SharedDataset), RegistryError> {
        let project = self.project(project_name)?;
        let dataset = project
            .get_dataset(ds_name)
            .ok_or_else(|| RegistryError::DatasetNotFound {
                project: project_name.to_string(),
                dataset: ds_name.to_string(),
            })?;
        Ok((project, dataset))
    }

    pub fn project_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projects.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves the config chain for a project, optionally extended with a
    /// dataset node the caller holds a lock on.
    pub fn effective(&self, project: &Project, dataset: Option<&Config>) -> EffectiveConfig {
        let master = self.master.read();
        let project_config = project.config.read();
        let mut nodes: Vec<&Config> = vec![&*master, &*project_config];
        if let Some(ds_config) = dataset {
            nodes.push(ds_config);
        }
        effective_from_chain(&nodes)
    }

    /// Registry-level resolution (master node only), used for project
    /// creation.
    pub fn effective_master(&self) -> EffectiveConfig {
        let master = self.master.read();
        effective_from_chain(&[&*master])
    }

    pub fn master_origins(&self) -> Vec<String> {
        self.master.read().get_string_list("origins")
    }

    /// Creates a project directory with an empty config and mints its first
    /// API key.
    pub fn create_project(&self, name: &str) -> Result<String, RegistryError> {
        validate_dataset_name(name).map_err(RegistryError::Engine)?;
        let root = self.root.as_ref().ok_or(RegistryError::NoProjectsRoot)?;
        if self.projects.read().contains_key(name) {
            return Err(RegistryError::ProjectExists(name.to_string()));
        }
        let dir = root.join(name);
        if dir.exists() {
            return Err(RegistryError::ProjectExists(name.to_string()));
        }
        std::fs::create_dir_all(&dir)?;

        let config = Config::new(ConfigRole::Project);
        config.save(&dir.join(PROJECT_CONFIG_FILE))?;

        let project = Arc::new(Project::new(name, Some(dir), config));
        let token = project.new_key()?;
        self.projects
            .write()
            .insert(name.to_string(), project);
        info!(project = name, "project created");
        Ok(token)
    }

    /// Creates or replaces a dataset in memory; non-sandbox uploads are
    /// also persisted as `<name>.json` next to the project config.
    pub async fn upsert_dataset(
        &self,
        project: &Arc<Project>,
        name: &str,
        records: Vec<Value>,
        ip: Option<String>,
        secret: Option<String>,
        persist: bool,
    ) -> Result<usize, RegistryError> {
        validate_dataset_name(name).map_err(RegistryError::Engine)?;

        let dataset = match project.get_dataset(name) {
            Some(existing) => {
                existing.write().set_records(records, ip, secret);
                existing
            }
            None => {
                let mut created = Dataset::new(name, Config::new(ConfigRole::Dataset))?;
                created.set_records(records, ip, secret);
                let shared = Arc::new(RwLock::new(created));
                project.insert_dataset(name, shared.clone());
                shared
            }
        };

        if persist {
            if let Some(path) = project.dataset_data_path(name) {
                let bytes = {
                    let guard = dataset.read();
                    serde_json::to_vec_pretty(guard.records())?
                };
                tokio::fs::write(&path, bytes).await?;
                dataset.write().set_local_path(Some(path));
            }
        }

        let size = dataset.read().len();
        Ok(size)
    }

    /// Removes a dataset and its on-disk files.
    pub fn remove_dataset(&self, project: &Arc<Project>, name: &str) -> Result<(), RegistryError> {
        let dataset =
            project
                .remove_dataset(name)
                .ok_or_else(|| RegistryError::DatasetNotFound {
                    project: project.name().to_string(),
                    dataset: name.to_string(),
                })?;

        if let Some(config_path) = project.dataset_config_path(name) {
            if config_path.exists() {
                std::fs::remove_file(config_path)?;
            }
        }
        let data_path = dataset
            .read()
            .local_path()
            .cloned()
            .or_else(|| project.dataset_data_path(name));
        if let Some(data_path) = data_path {
            if data_path.exists() {
                std::fs::remove_file(data_path)?;
            }
        }
        info!(project = %project.name(), dataset = name, "dataset removed");
        Ok(())
    }

    /// Best-effort coalesced tick: the first caller past the period runs
    /// the sandbox sweep, concurrent callers skip.
    pub fn cron(&self) {
        {
            let mut last = self.last_cron.lock();
            if last.elapsed() < CRON_PERIOD {
                return;
            }
            *last = Instant::now();
        }
        self.sweep_sandboxes();
    }

    /// Evicts every non-local dataset of every sandbox project whose
    /// `loaded + sandbox_expire` lies in the past.
    pub fn sweep_sandboxes(&self) {
        let projects: Vec<Arc<Project>> = self.projects.read().values().cloned().collect();
        let now = Utc::now();

        for project in projects {
            let effective = self.effective(&project, None);
            if !effective.sandbox {
                continue;
            }
            let expire = chrono::Duration::seconds(effective.sandbox_expire as i64);

            let expired: Vec<String> = project
                .datasets
                .read()
                .iter()
                .filter(|(_, ds)| {
                    let ds = ds.read();
                    !ds.is_local() && now > ds.loaded() + expire
                })
                .map(|(name, _)| name.clone())
                .collect();

            if expired.is_empty() {
                continue;
            }
            let mut datasets = project.datasets.write();
            for name in expired {
                info!(project = %project.name(), dataset = %name, "sandbox dataset expired");
                datasets.remove(&name);
            }
        }
    }
}

fn effective_from_chain(nodes: &[&Config]) -> EffectiveConfig {
    let chain = ConfigChain::new(nodes);
    EffectiveConfig {
        tokens: chain.tokens(),
        trusted_ips: chain.trusted_ips(),
        ip_header: chain.ip_header(),
        limit: chain.limit(),
        sandbox: chain.scalar_bool("sandbox").unwrap_or(false),
        sandbox_expire: chain.scalar_u64("sandbox_expire").unwrap_or(3600 * 24),
    }
}

/// Descends an optional keypath and expects a JSON array of records.
pub fn records_from_value(mut value: Value, keypath: &[String]) -> Result<Vec<Value>, String> {
    for key in keypath {
        value = match value {
            Value::Object(mut map) => map
                .remove(key)
                .ok_or_else(|| format!("keypath element {key:?} not found"))?,
            other => {
                return Err(format!(
                    "keypath element {key:?} cannot descend into a non-object ({})",
                    type_label(&other)
                ))
            }
        };
    }
    match value {
        Value::Array(records) => Ok(records),
        other => Err(format!(
            "dataset must be a JSON list of records, got {}",
            type_label(&other)
        )),
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn load_file_value(path: &Path, format: Option<&str>) -> Result<Value, RegistryError> {
    let format = match format {
        Some(explicit) => explicit.to_string(),
        None => {
            let lower = path.to_string_lossy().to_lowercase();
            if lower.ends_with(".yaml") || lower.ends_with(".yml") {
                "yaml".to_string()
            } else {
                "json".to_string()
            }
        }
    };
    let raw = std::fs::read_to_string(path)?;
    match format.as_str() {
        "json" => {
            serde_json::from_str(&raw).map_err(|e| load_error(path.display().to_string(), e))
        }
        "yaml" => {
            serde_yaml::from_str(&raw).map_err(|e| load_error(path.display().to_string(), e))
        }
        other => Err(load_error(
            path.display().to_string(),
            format!("unknown format {other:?}"),
        )),
    }
}

/// Loads a record list from a file, honoring an explicit `format` or
/// guessing from the extension.
pub fn load_file(path: &Path, format: Option<&str>) -> Result<Vec<Value>, RegistryError> {
    let value = load_file_value(path, format)?;
    records_from_value(value, &[]).map_err(|e| load_error(path.display().to_string(), e))
}

/// Fetches a JSON document from an HTTP source.
pub async fn load_url(url: &str) -> Result<Value, RegistryError> {
    info!(url, "loading dataset from URL");
    let response = reqwest::get(url).await.map_err(|e| load_error(url, e))?;
    let response = response
        .error_for_status()
        .map_err(|e| load_error(url, e))?;
    response.json().await.map_err(|e| load_error(url, e))
}
