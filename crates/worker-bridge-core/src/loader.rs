//! Memoizing module loader.
//!
//! [`ModuleLoader`] owns the process-wide compiled module. The first call to
//! [`ModuleLoader::load`] acquires and compiles the module from its
//! [`ModuleSource`]; concurrent first calls wait for that single acquisition,
//! and later calls return the cached module. A failed acquisition is not
//! cached, so the next call tries again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use worker_bridge_common::{LoadError, ModuleConfig};

use crate::{CompiledModule, WasmEngine};

/// Where the guest module comes from.
#[async_trait]
pub trait ModuleSource: Send + Sync + std::fmt::Debug {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Acquire and compile the module.
    async fn acquire(&self, engine: &WasmEngine) -> Result<CompiledModule, LoadError>;
}

/// Bundled asset file: `.wasm` bytes, or `.wat` text.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Create a source reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ModuleSource for FileSource {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn acquire(&self, engine: &WasmEngine) -> Result<CompiledModule, LoadError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| LoadError::Io {
                path: self.path.display().to_string(),
                source,
            })?;

        if self.path.extension().is_some_and(|ext| ext == "wat") {
            let text = String::from_utf8(bytes)
                .map_err(|_| LoadError::invalid("WAT source is not valid UTF-8"))?;
            return CompiledModule::from_wat(engine.inner(), &text);
        }

        compile(engine, bytes).await
    }
}

/// Remote module fetched over HTTP.
#[derive(Debug, Clone)]
pub struct UrlSource {
    url: String,
    client: reqwest::Client,
}

impl UrlSource {
    /// Create a source fetching `url`, with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LoadError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoadError::fetch(url.clone(), e.to_string()))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl ModuleSource for UrlSource {
    fn describe(&self) -> String {
        format!("url:{}", self.url)
    }

    async fn acquire(&self, engine: &WasmEngine) -> Result<CompiledModule, LoadError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| LoadError::fetch(&self.url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::fetch(&self.url, format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| LoadError::fetch(&self.url, e.to_string()))?;

        debug!(url = %self.url, bytes_len = bytes.len(), "Module fetched");
        compile(engine, bytes.to_vec()).await
    }
}

/// Precompiled `.cwasm` artifact produced by [`CompiledModule::serialize`].
#[derive(Debug, Clone)]
pub struct PrecompiledFileSource {
    path: PathBuf,
}

impl PrecompiledFileSource {
    /// Create a source loading the artifact at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ModuleSource for PrecompiledFileSource {
    fn describe(&self) -> String {
        format!("precompiled:{}", self.path.display())
    }

    async fn acquire(&self, engine: &WasmEngine) -> Result<CompiledModule, LoadError> {
        if !self.path.exists() {
            return Err(LoadError::Io {
                path: self.path.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let engine = engine.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || CompiledModule::from_precompiled(engine.inner(), &path))
            .await
            .map_err(|e| LoadError::invalid(format!("Artifact load task failed: {e}")))?
    }
}

/// Module compiled elsewhere in the process and passed through as-is.
#[derive(Debug, Clone)]
pub struct PrecompiledSource {
    module: CompiledModule,
}

impl PrecompiledSource {
    /// Wrap an already compiled module.
    pub fn new(module: CompiledModule) -> Self {
        Self { module }
    }
}

#[async_trait]
impl ModuleSource for PrecompiledSource {
    fn describe(&self) -> String {
        format!("handle:{}", self.module.content_hash())
    }

    async fn acquire(&self, _engine: &WasmEngine) -> Result<CompiledModule, LoadError> {
        Ok(self.module.clone())
    }
}

/// Module bytes embedded in the host.
#[derive(Debug, Clone)]
pub struct BytesSource {
    bytes: Arc<[u8]>,
}

impl BytesSource {
    /// Create a source compiling `bytes`.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
impl ModuleSource for BytesSource {
    fn describe(&self) -> String {
        format!("bytes:{}", self.bytes.len())
    }

    async fn acquire(&self, engine: &WasmEngine) -> Result<CompiledModule, LoadError> {
        compile(engine, self.bytes.to_vec()).await
    }
}

/// Compile off the async runtime's worker threads.
async fn compile(engine: &WasmEngine, bytes: Vec<u8>) -> Result<CompiledModule, LoadError> {
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || CompiledModule::from_bytes(engine.inner(), &bytes))
        .await
        .map_err(|e| LoadError::invalid(format!("Compilation task failed: {e}")))?
}

/// Build the source named by a `[module]` config section.
///
/// # Errors
///
/// Returns an error if no source is configured or the remote client cannot be built.
pub fn source_from_config(
    config: &ModuleConfig,
    fetch_timeout: Duration,
) -> Result<Arc<dyn ModuleSource>, LoadError> {
    if let Some(path) = &config.path {
        return Ok(Arc::new(FileSource::new(path)));
    }
    if let Some(url) = &config.url {
        return Ok(Arc::new(UrlSource::new(url, fetch_timeout)?));
    }
    if let Some(path) = &config.precompiled {
        return Ok(Arc::new(PrecompiledFileSource::new(Path::new(path))));
    }
    Err(LoadError::Unsupported {
        reason: "no module source configured".to_string(),
    })
}

/// Process-wide module cache with single-flight acquisition.
pub struct ModuleLoader {
    engine: WasmEngine,
    source: Arc<dyn ModuleSource>,
    cell: OnceCell<CompiledModule>,
    acquisitions: AtomicUsize,
}

impl ModuleLoader {
    /// Create a loader for `source`. Nothing is acquired until the first [`load`](Self::load).
    pub fn new(engine: WasmEngine, source: Arc<dyn ModuleSource>) -> Self {
        Self {
            engine,
            source,
            cell: OnceCell::new(),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Return the cached module, acquiring it first if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] if the acquisition fails. The failure is not
    /// cached.
    #[instrument(skip(self), fields(source = %self.source.describe()))]
    pub async fn load(&self) -> Result<CompiledModule, LoadError> {
        if let Some(module) = self.cell.get() {
            return Ok(module.clone());
        }

        let module = self
            .cell
            .get_or_try_init(|| async {
                let attempt = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(attempt, "Acquiring module");

                match self.source.acquire(&self.engine).await {
                    Ok(module) => {
                        info!(content_hash = %module.content_hash(), attempt, "Module cached");
                        Ok(module)
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "Module acquisition failed");
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(module.clone())
    }

    /// Returns `true` once a module is cached.
    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// Number of acquisitions attempted so far, successful or not.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// The engine modules are compiled for.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("source", &self.source)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}
