//! Module Registry
//!
//! Maps module ids and relative paths to loaded definitions. Built
//! explicitly by the caller and handed to the engine as a
//! [`ModuleResolver`] for sub-module steps.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::EngineError;

use super::model::ModuleDefinition;
use super::parser::load_module;

/// Lookup hook used to resolve a sub-module reference to a YAML file.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<PathBuf>;
}

impl<F> ModuleResolver for F
where
    F: Fn(&str) -> Option<PathBuf> + Send + Sync,
{
    fn resolve(&self, reference: &str) -> Option<PathBuf> {
        self(reference)
    }
}

/// A registered module.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Path relative to the scanned root, without extension (e.g. `recon/subdomains`)
    pub key: String,
    pub path: PathBuf,
    pub definition: Arc<ModuleDefinition>,
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    ids: BTreeMap<String, String>,
}

fn is_module_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a module file and registers it under `key` and its id.
    pub fn register(&mut self, key: impl Into<String>, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let key = key.into();
        let path = path.as_ref().to_path_buf();
        let definition = Arc::new(load_module(&path)?);

        if let Some(previous) = self.ids.insert(definition.info.id.clone(), key.clone()) {
            if previous != key {
                warn!(
                    "Module id '{}' registered by both '{}' and '{}'; keeping '{}'",
                    definition.info.id, previous, key, key
                );
            }
        }

        debug!("Registered module '{}' ({})", key, definition.info.id);
        self.entries.insert(
            key.clone(),
            RegistryEntry {
                key,
                path,
                definition,
            },
        );
        Ok(())
    }

    /// Recursively registers every `.yml`/`.yaml` file below `root`.
    ///
    /// Files that fail to load are skipped with a warning. Returns the
    /// number of modules registered.
    pub fn scan(&mut self, root: impl AsRef<Path>) -> Result<usize, EngineError> {
        let root = root.as_ref();
        let mut files = Vec::new();
        collect_module_files(root, &mut files)?;
        files.sort();

        let mut count = 0;
        for file in files {
            let relative = file.strip_prefix(root).unwrap_or(&file).with_extension("");
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            match self.register(key, &file) {
                Ok(()) => count += 1,
                Err(e) => warn!("Skipping {}: {}", file.display(), e),
            }
        }

        info!("Registered {} module(s) from {}", count, root.display());
        Ok(count)
    }

    /// Looks up by registry key first, then by module id.
    pub fn get(&self, key_or_id: &str) -> Option<&RegistryEntry> {
        let key_or_id = key_or_id
            .trim()
            .trim_end_matches(".yml")
            .trim_end_matches(".yaml");
        self.entries.get(key_or_id).or_else(|| {
            self.ids
                .get(key_or_id)
                .and_then(|key| self.entries.get(key))
        })
    }

    pub fn list(&self) -> Vec<&RegistryEntry> {
        self.entries.values().collect()
    }

    /// Case-insensitive search over key, id, name, description and tag.
    pub fn search(&self, term: &str) -> Vec<&RegistryEntry> {
        let term = term.to_lowercase();
        self.entries
            .values()
            .filter(|entry| {
                let info = &entry.definition.info;
                [
                    entry.key.as_str(),
                    info.id.as_str(),
                    info.name.as_str(),
                    info.description.as_str(),
                    info.tag.as_str(),
                ]
                .iter()
                .any(|field| field.to_lowercase().contains(&term))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ModuleResolver for ModuleRegistry {
    fn resolve(&self, reference: &str) -> Option<PathBuf> {
        self.get(reference).map(|entry| entry.path.clone())
    }
}

fn collect_module_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), EngineError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_module_files(&path, files)?;
        } else if is_module_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_module(dir: &Path, relative: &str, id: &str, tag: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            path,
            format!(
                "type: module\ninfo: {{ id: {}, name: {} scan, tag: {} }}\nsteps:\n  - {{ name: s, tool: echo }}\n",
                id, id, tag
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_scan_and_lookup() {
        let temp_dir = tempdir().unwrap();
        write_module(temp_dir.path(), "recon/subdomains.yml", "subs", "passive");
        write_module(temp_dir.path(), "ports.yaml", "ports", "active");
        fs::write(temp_dir.path().join("broken.yml"), "type: nope").unwrap();
        fs::write(temp_dir.path().join("README.md"), "# modules").unwrap();

        let mut registry = ModuleRegistry::new();
        let count = registry.scan(temp_dir.path()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(registry.len(), 2);

        assert!(registry.get("recon/subdomains").is_some());
        assert!(registry.get("recon/subdomains.yml").is_some());
        assert_eq!(registry.get("subs").unwrap().key, "recon/subdomains");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_search() {
        let temp_dir = tempdir().unwrap();
        write_module(temp_dir.path(), "a.yml", "alpha", "passive");
        write_module(temp_dir.path(), "b.yml", "beta", "active");

        let mut registry = ModuleRegistry::new();
        registry.scan(temp_dir.path()).unwrap();

        let hits = registry.search("PASSIVE");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].definition.info.id, "alpha");
    }

    #[test]
    fn test_resolver_impls() {
        let temp_dir = tempdir().unwrap();
        write_module(temp_dir.path(), "a.yml", "alpha", "x");

        let mut registry = ModuleRegistry::new();
        registry.scan(temp_dir.path()).unwrap();
        assert_eq!(
            registry.resolve("alpha"),
            Some(temp_dir.path().join("a.yml"))
        );

        let fixed = |reference: &str| (reference == "x").then(|| PathBuf::from("/tmp/x.yml"));
        assert_eq!(fixed.resolve("x"), Some(PathBuf::from("/tmp/x.yml")));
        assert_eq!(fixed.resolve("y"), None);
    }
}
