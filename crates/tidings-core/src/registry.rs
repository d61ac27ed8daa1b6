//! Source registry: every source the engine knows about, keyed by id.
//!
//! Two registration mechanisms feed it. Declarative sources are JSON
//! descriptor files handled by [`ConfiguredSource`]; code-defined sources
//! register a builder closure through an explicit enumeration step such as
//! [`builtin_sources`]. Nothing is discovered by introspection.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{AppError, panic_message};
use crate::models::SourceDescriptor;
use crate::source::{ConfiguredSource, HackerNewsSource, NewsSource, SourceClient};
use crate::traits::Transport;

/// Builds a code-defined source from its descriptor and HTTP handle.
pub type SourceBuilder<T> =
    Arc<dyn Fn(SourceDescriptor, SourceClient<T>) -> Arc<dyn NewsSource> + Send + Sync>;

/// Code-defined sources shipped with the engine.
pub fn builtin_sources<T: Transport>() -> Vec<(SourceDescriptor, SourceBuilder<T>)> {
    let hacker_news: SourceBuilder<T> =
        Arc::new(|descriptor: SourceDescriptor, client: SourceClient<T>| {
            Arc::new(HackerNewsSource::new(descriptor, client)) as Arc<dyn NewsSource>
        });
    vec![(HackerNewsSource::<T>::default_descriptor(), hacker_news)]
}

struct Entry<T> {
    descriptor: SourceDescriptor,
    builder: Option<SourceBuilder<T>>,
    origin: String,
}

/// One file may hold a single descriptor or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    Many(Vec<SourceDescriptor>),
    One(Box<SourceDescriptor>),
}

/// Registered sources plus whatever went wrong registering them.
pub struct SourceRegistry<T> {
    entries: BTreeMap<String, Entry<T>>,
    /// Ids claimed more than once, with every origin that claimed them.
    duplicates: BTreeMap<String, Vec<String>>,
    /// Definition files that could not be read or parsed.
    file_errors: BTreeMap<String, Vec<String>>,
}

impl<T: Transport> SourceRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            duplicates: BTreeMap::new(),
            file_errors: BTreeMap::new(),
        }
    }

    /// Registry pre-filled with [`builtin_sources`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (descriptor, builder) in builtin_sources() {
            registry.register_code(descriptor, builder);
        }
        registry
    }

    /// Register a declarative source.
    pub fn register_descriptor(&mut self, descriptor: SourceDescriptor, origin: &str) {
        self.insert(descriptor, None, origin.to_string());
    }

    /// Register a code-defined source.
    pub fn register_code(&mut self, descriptor: SourceDescriptor, builder: SourceBuilder<T>) {
        self.insert(descriptor, Some(builder), "code".to_string());
    }

    fn insert(
        &mut self,
        descriptor: SourceDescriptor,
        builder: Option<SourceBuilder<T>>,
        origin: String,
    ) {
        let id = descriptor.id.clone();

        if let Some(origins) = self.duplicates.get_mut(&id) {
            origins.push(origin);
            return;
        }
        if let Some(previous) = self.entries.remove(&id) {
            tracing::warn!(
                source_id = %id,
                first = %previous.origin,
                second = %origin,
                "Duplicate source id, dropping both registrations"
            );
            self.duplicates.insert(id, vec![previous.origin, origin]);
            return;
        }

        self.entries.insert(
            id,
            Entry {
                descriptor,
                builder,
                origin,
            },
        );
    }

    /// Load every `*.json` file in `dir`, in name order.
    ///
    /// A bad file is recorded under its path and skipped; only an unreadable
    /// directory fails the whole load. Returns the number of descriptors
    /// registered.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, AppError> {
        let read = std::fs::read_dir(dir).map_err(|e| {
            AppError::ConfigError(format!(
                "Failed to read source directory {}: {e}",
                dir.display()
            ))
        })?;

        let mut files: Vec<PathBuf> = read
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut loaded = 0;
        for path in files {
            match self.load_file(&path) {
                Ok(n) => loaded += n,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping source file");
                    self.file_errors
                        .entry(path.display().to_string())
                        .or_default()
                        .push(e.to_string());
                }
            }
        }

        tracing::info!(dir = %dir.display(), loaded, "Loaded source definitions");
        Ok(loaded)
    }

    /// Load one definition file holding a descriptor or an array of them.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        let parsed: DescriptorFile = serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(format!("Invalid source definition {}: {e}", path.display()))
        })?;

        let descriptors = match parsed {
            DescriptorFile::Many(list) => list,
            DescriptorFile::One(one) => vec![*one],
        };
        let origin = path.display().to_string();
        let count = descriptors.len();
        for descriptor in descriptors {
            self.register_descriptor(descriptor, &origin);
        }
        Ok(count)
    }

    /// Ids of every usable, enabled source.
    pub fn discover_sources(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|e| e.descriptor.enabled)
            .map(|e| e.descriptor.id.clone())
            .collect()
    }

    pub fn descriptor(&self, id: &str) -> Option<&SourceDescriptor> {
        self.entries.get(id).map(|e| &e.descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.entries.values().map(|e| &e.descriptor)
    }

    pub fn is_code_defined(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|e| e.builder.is_some())
    }

    /// Problems found while registering: duplicate ids and bad files.
    pub fn registration_errors(&self) -> BTreeMap<String, Vec<String>> {
        let mut errors = self.file_errors.clone();
        for (id, origins) in &self.duplicates {
            errors.entry(id.clone()).or_default().push(duplicate_message(id, origins));
        }
        errors
    }

    /// Per-id descriptor problems, one entry per known id.
    ///
    /// Valid sources map to an empty list. Each id is checked on its own, so
    /// one broken definition never hides the others.
    pub fn validate_sources(&self) -> BTreeMap<String, Vec<String>> {
        let mut report: BTreeMap<String, Vec<String>> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.descriptor.validate()))
            .collect();
        for (id, origins) in &self.duplicates {
            report.entry(id.clone()).or_default().push(duplicate_message(id, origins));
        }
        report
    }

    fn entry(&self, id: &str) -> Result<&Entry<T>, AppError> {
        if let Some(origins) = self.duplicates.get(id) {
            return Err(AppError::ConfigError(duplicate_message(id, origins)));
        }
        self.entries
            .get(id)
            .ok_or_else(|| AppError::ConfigError(format!("Unknown source '{id}'")))
    }

    /// Descriptor for `id`, or the configuration error that makes it unusable.
    pub fn lookup(&self, id: &str) -> Result<&SourceDescriptor, AppError> {
        self.entry(id).map(|e| &e.descriptor)
    }

    /// Instantiate the source registered as `id`.
    pub fn build(
        &self,
        id: &str,
        client: SourceClient<T>,
    ) -> Result<Arc<dyn NewsSource>, AppError> {
        let entry = self.entry(id)?;
        let problems = entry.descriptor.validate();
        if !problems.is_empty() {
            return Err(AppError::ConfigError(format!(
                "Source '{id}' is misconfigured: {}",
                problems.join("; ")
            )));
        }

        let descriptor = entry.descriptor.clone();
        let Some(builder) = &entry.builder else {
            return Ok(Arc::new(ConfiguredSource::new(descriptor, client)));
        };
        // A panicking builder only costs its own id.
        let built = panic::catch_unwind(AssertUnwindSafe(|| builder(descriptor, client)));
        built.map_err(|payload| {
            let message = format!("panicked while building: {}", panic_message(&*payload));
            tracing::error!(source_id = %id, %message, "Source builder failed");
            AppError::SourceError {
                source_id: id.to_string(),
                message,
            }
        })
    }
}

impl<T: Transport> Default for SourceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn duplicate_message(id: &str, origins: &[String]) -> String {
    format!("source id '{id}' registered more than once ({})", origins.join(", "))
}
