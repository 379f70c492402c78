use crate::container::{Container, ContainerConfig, ContainerInfo};
use crate::id;
use crate::store::ContainerStore;
use crate::CoreError;
use corral_layers::{ImageRef, LayerSource};
use corral_runtime::{IsolationProvider, ResourceLimits, StdioMode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    pub default_limits: ResourceLimits,
    pub stop_grace: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            default_limits: ResourceLimits::default(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    pub image: Option<String>,
    pub limits: Option<ResourceLimits>,
    pub stdio: StdioMode,
}

impl RunRequest {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            image: None,
            limits: None,
            stdio: StdioMode::default(),
        }
    }
}

/// The daemon's `id → Container` map.
///
/// The map lock is only held to insert, remove or clone out an `Arc`;
/// lifecycle work always runs on the cloned handle so a slow `start` or
/// `kill` never blocks `list`.
pub struct Registry {
    containers: Mutex<HashMap<String, Arc<Container>>>,
    provider: Arc<dyn IsolationProvider>,
    store: ContainerStore,
    layer_source: Option<Arc<dyn LayerSource>>,
    options: RegistryOptions,
}

impl Registry {
    pub fn new(
        provider: Arc<dyn IsolationProvider>,
        store: ContainerStore,
        options: RegistryOptions,
    ) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            provider,
            store,
            layer_source: None,
            options,
        }
    }

    pub fn with_layer_source(mut self, source: Arc<dyn LayerSource>) -> Self {
        self.layer_source = Some(source);
        self
    }

    pub fn provider(&self) -> &Arc<dyn IsolationProvider> {
        &self.provider
    }

    pub fn store(&self) -> &ContainerStore {
        &self.store
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Create, optionally assemble an image into, and start a container.
    /// On failure the container is dropped from the map and from disk.
    pub fn run(&self, request: RunRequest) -> Result<Arc<Container>, CoreError> {
        let image = request
            .image
            .as_deref()
            .map(ImageRef::parse)
            .transpose()
            .map_err(|e| CoreError::Argument(e.to_string()))?;
        if image.is_some() && self.layer_source.is_none() {
            return Err(CoreError::Argument(
                "no image source configured".to_owned(),
            ));
        }

        let config = ContainerConfig {
            command: request.command,
            args: request.args,
            limits: request.limits.unwrap_or(self.options.default_limits),
            image: image.as_ref().map(ToString::to_string),
        };
        let container = Arc::new(Container::create(
            config,
            self.provider.clone(),
            self.store.clone(),
        )?);
        self.lock()
            .insert(container.id().to_owned(), container.clone());

        if let Err(e) = self.launch(&container, image.as_ref(), request.stdio) {
            warn!("failed to run container {}: {e}", container.id());
            self.discard(container.id());
            return Err(e);
        }
        Ok(container)
    }

    fn launch(
        &self,
        container: &Container,
        image: Option<&ImageRef>,
        stdio: StdioMode,
    ) -> Result<u32, CoreError> {
        if let (Some(image), Some(source)) = (image, &self.layer_source) {
            let fetched = source.fetch_layers(image)?;
            let report = container.prepare_filesystem(fetched.layers)?;
            debug!(
                "assembled {image} for {}: {} layers, {} files, {} whiteouts",
                container.id(),
                report.layers,
                report.files,
                report.whiteouts
            );
        }
        container.start(stdio)
    }

    fn discard(&self, id: &str) {
        self.lock().remove(id);
        if let Err(e) = self.store.remove(id) {
            warn!("failed to remove record of container {id}: {e}");
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<Container>, CoreError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_owned()))
    }

    /// Stop a container, keeping it listed as `Stopped`. Repeated stops
    /// succeed without side effects.
    pub fn stop(&self, id: &str) -> Result<ContainerInfo, CoreError> {
        let container = self.get(id)?;
        container.kill(self.options.stop_grace)?;
        Ok(container.inspect())
    }

    /// Forget a stopped or failed container and delete its rootfs.
    pub fn remove(&self, id: &str) -> Result<(), CoreError> {
        let container = self.get(id)?;
        container.destroy()?;
        self.lock().remove(id);
        info!("removed container {id}");
        Ok(())
    }

    pub fn inspect(&self, id: &str) -> Result<ContainerInfo, CoreError> {
        Ok(self.get(id)?.inspect())
    }

    /// Snapshot of every known container, sorted by id.
    pub fn list(&self) -> Vec<ContainerInfo> {
        let containers: Vec<Arc<Container>> = self.lock().values().cloned().collect();
        let mut infos: Vec<ContainerInfo> = containers.iter().map(|c| c.inspect()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Collect containers whose process exited on its own. Returns how many
    /// were reaped.
    pub fn reap_all(&self) -> usize {
        let containers: Vec<Arc<Container>> = self.lock().values().cloned().collect();
        containers.iter().filter(|c| c.reap()).count()
    }

    /// Load every record under the state directory into the map. Returns the
    /// number of containers still running.
    pub fn recover(&self) -> Result<usize, CoreError> {
        let mut running = 0;
        for record in self.store.list()? {
            id::observe(&record.id);
            let container = Container::recover(record, self.provider.clone(), self.store.clone());
            if container.pid().is_some() {
                running += 1;
            }
            debug!("recovered container {} as {}", container.id(), container.state());
            self.lock()
                .insert(container.id().to_owned(), Arc::new(container));
        }
        info!("recovered {} containers, {running} still running", self.len());
        Ok(running)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Container>>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
