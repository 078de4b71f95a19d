//! Run and distribution configuration
//!
//! [`RunConfiguration`] is what the master ships to every worker: where to
//! find the script and models, the script parameters, and every setting
//! that affects job enumeration. Its checksum lets a worker verify that it
//! decoded exactly what the master sent.
//!
//! [`DistributedConfig`] stays on the master: how many workers to expect,
//! how to dispatch, and how long to wait.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use verity_core::{ModelRepository, Script, ValueMap};
use verity_engine::hash::checksum32;
use verity_engine::{EngineConfig, ExecutionContext, ExecutionStrategy, DEFAULT_GLOBAL_SEED};
use verity_script::{parse_parameters, Loader};

/// Where a script or model comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// A RON file, relative paths resolved against the loader's base path
    File(PathBuf),
    /// RON text shipped inside the configuration
    Inline { name: String, content: String },
}

impl Source {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File(path.into())
    }

    pub fn inline(name: impl Into<String>, content: impl Into<String>) -> Self {
        Source::Inline {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// A model to load, with an optional metamodel file to check it against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    pub source: Source,
    #[serde(default)]
    pub metamodel: Option<PathBuf>,
}

impl ModelSource {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            metamodel: None,
        }
    }

    pub fn with_metamodel(mut self, path: impl Into<PathBuf>) -> Self {
        self.metamodel = Some(path.into());
        self
    }
}

/// Inputs of a loaded run
#[derive(Debug)]
pub struct LoadedRun {
    pub script: Script,
    pub repository: ModelRepository,
    pub parameters: ValueMap,
}

/// Parameters of a validation run, shared by the master and its workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Base for relative paths; a worker may substitute its own
    #[serde(default)]
    pub base_path: Option<PathBuf>,
    pub script: Source,
    pub models: Vec<ModelSource>,
    /// `name=value` script parameters
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Local pool size in each process (`0` = hardware)
    #[serde(default)]
    pub local_parallelism: usize,
    /// Number of workers the master expects
    #[serde(default)]
    pub distributed_parallelism: usize,
    /// Local evaluation strategy
    #[serde(default = "default_strategy")]
    pub strategy: ExecutionStrategy,
    /// Job shuffle seed; every process must use the same one
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    /// `0` dispatches atoms, `n > 0` dispatches `n` batches per worker
    #[serde(default)]
    pub batches_per_worker: usize,
}

fn default_strategy() -> ExecutionStrategy {
    ExecutionStrategy::ElementParallel
}

impl RunConfiguration {
    /// Configuration for a script and its models with default settings
    pub fn new(script: Source, models: Vec<ModelSource>) -> Self {
        Self {
            base_path: None,
            script,
            models,
            parameters: Vec::new(),
            local_parallelism: 0,
            distributed_parallelism: 0,
            strategy: default_strategy(),
            shuffle_seed: Some(DEFAULT_GLOBAL_SEED),
            batches_per_worker: 1,
        }
    }

    pub fn with_base_path(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base.into());
        self
    }

    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameters.push(parameter.into());
        self
    }

    pub fn with_local_parallelism(mut self, parallelism: usize) -> Self {
        self.local_parallelism = parallelism;
        self
    }

    pub fn with_distributed_parallelism(mut self, workers: usize) -> Self {
        self.distributed_parallelism = workers;
        self
    }

    pub fn with_batches_per_worker(mut self, batches: usize) -> Self {
        self.batches_per_worker = batches;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: Option<u64>) -> Self {
        self.shuffle_seed = seed;
        self
    }

    /// Whether work is dispatched as individual atoms
    pub fn is_atomic(&self) -> bool {
        self.batches_per_worker == 0
    }

    /// Encode for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Checksum of the encoded configuration
    pub fn checksum(&self) -> Result<u32> {
        Ok(checksum32(&self.encode()?))
    }

    /// Engine settings for local evaluation
    pub fn engine_config(&self) -> EngineConfig {
        let config = EngineConfig::parallel(self.local_parallelism).with_strategy(self.strategy);
        match self.shuffle_seed {
            Some(seed) => config.with_shuffle_seed(seed),
            None => config.without_shuffle(),
        }
    }

    /// Load the script, models and parameters
    ///
    /// `base_override` replaces the configured base path, so a worker can
    /// find the same files under its own root.
    pub fn load(&self, base_override: Option<&Path>) -> Result<LoadedRun> {
        let base = base_override
            .map(Path::to_path_buf)
            .or_else(|| self.base_path.clone());
        let mut loader = match base {
            Some(base) => Loader::new().with_base_path(base),
            None => Loader::new(),
        };

        let script = match &self.script {
            Source::File(path) => loader.load_script_file(path)?,
            Source::Inline { name, content } => loader.load_script_str(content, name.as_str())?,
        };
        for model in &self.models {
            match &model.source {
                Source::File(path) => loader.load_model_file(path, model.metamodel.as_deref())?,
                Source::Inline { name, content } => {
                    let metamodel = match &model.metamodel {
                        Some(path) => Some(loader.load_metamodel_file(path)?),
                        None => None,
                    };
                    loader.load_model_str(content, name, metamodel.as_ref())?
                }
            }
        }
        let parameters = parse_parameters(&self.parameters)?;

        Ok(LoadedRun {
            script,
            repository: loader.finish(),
            parameters,
        })
    }

    /// Load everything and build an execution context
    pub fn context(&self, base_override: Option<&Path>) -> Result<ExecutionContext> {
        let run = self.load(base_override)?;
        Ok(ExecutionContext::new(
            run.script,
            run.repository,
            run.parameters,
            self.engine_config(),
        )?)
    }
}

/// When the master sends work to confirmed workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispatchMode {
    /// Wait until every expected worker is ready, then dispatch to all
    #[default]
    Synchronous,
    /// Dispatch to each worker as soon as it is ready
    Asynchronous,
}

/// Master-side distribution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Workers the master waits for
    pub expected_workers: usize,
    pub dispatch: DispatchMode,
    /// Accept registrations beyond `expected_workers`
    pub accept_late_joiners: bool,
    /// Suffix for every well-known queue name
    pub session: Option<String>,
    /// How long to wait for expected workers to become ready
    pub registration_timeout: Duration,
    /// How long the results queue may stay silent before outstanding
    /// workers are given up on
    pub completion_timeout: Duration,
    /// Close the broker at teardown
    pub owns_broker: bool,
}

impl DistributedConfig {
    pub fn new(expected_workers: usize) -> Self {
        Self {
            expected_workers,
            ..Self::default()
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_late_joiners(mut self, accept: bool) -> Self {
        self.accept_late_joiners = accept;
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn owning_broker(mut self) -> Self {
        self.owns_broker = true;
        self
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            expected_workers: 0,
            dispatch: DispatchMode::Synchronous,
            accept_late_joiners: false,
            session: None,
            registration_timeout: Duration::from_secs(30),
            completion_timeout: Duration::from_secs(60),
            owns_broker: false,
        }
    }
}

/// Worker-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier sent with every message; must be unique per run
    pub worker_id: String,
    /// Local root for the run's relative paths
    pub base_path: Option<PathBuf>,
    /// Must match the master's session
    pub session: Option<String>,
    /// How long to wait for the configuration after registering
    pub config_timeout: Duration,
    /// How long to wait for the next job payload
    pub job_wait_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    pub fn with_base_path(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_config_timeout(mut self, timeout: Duration) -> Self {
        self.config_timeout = timeout;
        self
    }

    pub fn with_job_wait_timeout(mut self, timeout: Duration) -> Self {
        self.job_wait_timeout = timeout;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            base_path: None,
            session: None,
            config_timeout: Duration::from_secs(30),
            job_wait_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SCRIPT: &str = r#"(contexts: [(kind: Some("Person"), constraints: [
        (name: "NameNotEmpty", check: Ne(Property("name"), Literal(String("")))),
    ])])"#;

    const MODEL: &str = r#"(elements: [
        (id: 0, kind: "Person", properties: { "name": String("Ann") }),
        (id: 1, kind: "Person", properties: { "name": String("") }),
    ])"#;

    fn inline() -> RunConfiguration {
        RunConfiguration::new(
            Source::inline("script.ron", SCRIPT),
            vec![ModelSource::new(Source::inline("people", MODEL))],
        )
    }

    #[test]
    fn test_checksum_is_stable_and_sensitive() {
        let config = inline();
        assert_eq!(config.checksum().unwrap(), config.clone().checksum().unwrap());

        let changed = config.clone().with_parameter("limit=3");
        assert_ne!(config.checksum().unwrap(), changed.checksum().unwrap());
    }

    #[test]
    fn test_wire_roundtrip_keeps_checksum() {
        let config = inline().with_batches_per_worker(3).with_base_path("/data");
        let bytes = config.encode().unwrap();
        let decoded = RunConfiguration::decode(&bytes).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.checksum().unwrap(), checksum32(&bytes));
    }

    #[test]
    fn test_load_inline() {
        let run = inline().with_parameter("limit=3").load(None).unwrap();
        assert_eq!(run.repository.len(), 1);
        assert_eq!(run.script.constraint_count(), 1);
        assert_eq!(run.parameters.get("limit"), Some(&verity_core::Value::Int(3)));
    }

    #[test]
    fn test_malformed_parameter_is_a_configuration_error() {
        let err = inline().with_parameter("oops").load(None).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Script(verity_script::Error::MalformedParameter(_))
        ));
    }

    #[test]
    fn test_base_override() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("script.ron"), SCRIPT).unwrap();
        fs::write(dir.path().join("people.ron"), MODEL).unwrap();

        let config = RunConfiguration::new(
            Source::file("script.ron"),
            vec![ModelSource::new(Source::file("people.ron"))],
        )
        .with_base_path("/nowhere/on/this/machine");

        assert!(config.load(None).is_err());
        let ctx = config.context(Some(dir.path())).unwrap();
        assert_eq!(ctx.jobs().len(), 2);
    }

    #[test]
    fn test_engine_config() {
        let config = inline().with_local_parallelism(3).with_shuffle_seed(None);
        let engine = config.engine_config();
        assert_eq!(engine.parallelism(), 3);
        assert_eq!(engine.shuffle_seed(), None);
        assert_eq!(engine.strategy(), ExecutionStrategy::ElementParallel);
    }

    #[test]
    fn test_distributed_config_ron() {
        let config = DistributedConfig::new(3)
            .with_dispatch(DispatchMode::Asynchronous)
            .with_session("nightly");
        let text = ron::to_string(&config).unwrap();
        let back: DistributedConfig = ron::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
