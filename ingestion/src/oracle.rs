use async_trait::async_trait;
use mnemolite_core::config::OracleConfig;
use mnemolite_core::error::{ErrorKind, KindedError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("oracle backend crashed: {0}")]
    Crashed(String),
}

impl KindedError for OracleError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::OracleError
    }
}

/// Position-based type oracle (a language-server hover/definition surface).
/// `Err` means the backing process died; `Ok(None)` is an ordinary
/// "no answer here".
#[async_trait]
pub trait TypeOracle: Send + Sync {
    async fn hover(
        &self,
        file_path: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<String>, OracleError>;

    async fn definition(
        &self,
        file_path: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<(String, u32, u32)>, OracleError>;
}

/// Oracle answering from a preloaded map, keyed by `(file, line)`.
/// Used offline and in tests.
#[derive(Default)]
pub struct StaticOracle {
    hovers: HashMap<(String, u32), String>,
    definitions: HashMap<(String, u32), (String, u32, u32)>,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hover(mut self, file_path: &str, line: u32, type_string: &str) -> Self {
        self.hovers
            .insert((file_path.to_string(), line), type_string.to_string());
        self
    }

    pub fn with_definition(
        mut self,
        file_path: &str,
        line: u32,
        target: (String, u32, u32),
    ) -> Self {
        self.definitions.insert((file_path.to_string(), line), target);
        self
    }
}

#[async_trait]
impl TypeOracle for StaticOracle {
    async fn hover(
        &self,
        file_path: &str,
        line: u32,
        _character: u32,
    ) -> Result<Option<String>, OracleError> {
        Ok(self.hovers.get(&(file_path.to_string(), line)).cloned())
    }

    async fn definition(
        &self,
        file_path: &str,
        line: u32,
        _character: u32,
    ) -> Result<Option<(String, u32, u32)>, OracleError> {
        Ok(self.definitions.get(&(file_path.to_string(), line)).cloned())
    }
}

type OracleFactory = dyn Fn() -> Arc<dyn TypeOracle> + Send + Sync;

/// Resilient wrapper around the process-wide oracle.
///
/// Exactly one oracle instance lives behind this client, created lazily on
/// first use and replaced only after a crash. Spawning one per request
/// leaks subprocesses and exhausts the host within a handful of calls.
/// Every call is bounded by the configured timeout; on timeout, crash, or
/// disabled state the answer degrades to `None`.
pub struct OracleClient {
    enabled: bool,
    timeout: Duration,
    factory: Box<OracleFactory>,
    instance: Mutex<Option<Arc<dyn TypeOracle>>>,
    failures: AtomicU64,
    restarts: AtomicU64,
}

impl OracleClient {
    pub fn new(
        config: &OracleConfig,
        factory: impl Fn() -> Arc<dyn TypeOracle> + Send + Sync + 'static,
    ) -> Self {
        Self {
            enabled: config.enabled,
            timeout: Duration::from_secs(config.timeout_s),
            factory: Box::new(factory),
            instance: Mutex::new(None),
            failures: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    /// A client that always answers `None`; used when the oracle is off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(3),
            factory: Box::new(|| Arc::new(StaticOracle::new()) as Arc<dyn TypeOracle>),
            instance: Mutex::new(None),
            failures: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    async fn instance(&self) -> Arc<dyn TypeOracle> {
        let mut guard = self.instance.lock().await;
        match guard.as_ref() {
            Some(oracle) => oracle.clone(),
            None => {
                let oracle = (self.factory)();
                *guard = Some(oracle.clone());
                oracle
            }
        }
    }

    async fn drop_instance(&self) {
        let mut guard = self.instance.lock().await;
        if guard.take().is_some() {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub async fn hover(&self, file_path: &str, line: u32, character: u32) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let oracle = self.instance().await;
        match tokio::time::timeout(self.timeout, oracle.hover(file_path, line, character)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(err)) => {
                warn!(%file_path, line, error = %err, "oracle crashed; scheduling restart");
                self.failures.fetch_add(1, Ordering::SeqCst);
                self.drop_instance().await;
                None
            }
            Err(_) => {
                warn!(%file_path, line, "oracle hover timed out");
                self.failures.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    pub async fn definition(
        &self,
        file_path: &str,
        line: u32,
        character: u32,
    ) -> Option<(String, u32, u32)> {
        if !self.enabled {
            return None;
        }

        let oracle = self.instance().await;
        match tokio::time::timeout(self.timeout, oracle.definition(file_path, line, character))
            .await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(err)) => {
                warn!(%file_path, line, error = %err, "oracle crashed; scheduling restart");
                self.failures.fetch_add(1, Ordering::SeqCst);
                self.drop_instance().await;
                None
            }
            Err(_) => {
                warn!(%file_path, line, "oracle definition timed out");
                self.failures.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }
}

/// Parse a hover answer of the shape `(a: number, b: string) => number`
/// into `(param_types, return_type)`. Unparseable answers become a bare
/// return type.
pub fn parse_hover_signature(hover: &str) -> (Vec<(String, String)>, Option<String>) {
    let trimmed = hover.trim();

    let (params_part, return_part) = match trimmed.split_once("=>") {
        Some((params, ret)) => (Some(params), Some(ret)),
        None => match trimmed.rsplit_once("->") {
            Some((params, ret)) => (Some(params), Some(ret)),
            None => (None, Some(trimmed)),
        },
    };

    let return_type = return_part
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());

    let mut param_types = Vec::new();
    if let Some(params) = params_part {
        let inner = params
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .trim();
        if !inner.is_empty() {
            for pair in inner.split(',') {
                if let Some((name, ty)) = pair.split_once(':') {
                    let name = name.trim().trim_end_matches('?').to_string();
                    let ty = ty.trim().to_string();
                    if !name.is_empty() && !ty.is_empty() {
                        param_types.push((name, ty));
                    }
                }
            }
        }
    }

    (param_types, return_type)
}
