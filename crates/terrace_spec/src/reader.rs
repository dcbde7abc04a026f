//! Configuration file reading.
//!
//! A project directory looks like:
//!
//! ```text
//! terrace.toml                     root/shared configuration
//! modules/<path>/module.yaml       module definitions
//! environments/<name>/env.yaml     environment definitions
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{SpecError, SpecResult};
use crate::models::{EnvironmentConfig, ModuleDefinition, RootConfig};

pub const ROOT_FILE: &str = "terrace.toml";
pub const MODULE_FILE: &str = "module.yaml";
pub const ENVIRONMENT_FILE: &str = "env.yaml";
pub const MODULES_DIR: &str = "modules";
pub const ENVIRONMENTS_DIR: &str = "environments";

/// Module definitions keyed by their path under `modules/`.
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, ModuleDefinition>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `path`, replacing any previous definition.
    pub fn register(&mut self, path: impl Into<String>, module: ModuleDefinition) {
        let path = path.into();
        debug!("Registering module: {}", path);
        self.modules.insert(path, module);
    }

    pub fn with(mut self, path: impl Into<String>, module: ModuleDefinition) -> Self {
        self.register(path, module);
        self
    }

    pub fn get(&self, path: &str) -> Option<&ModuleDefinition> {
        self.modules.get(path)
    }

    pub fn get_required(&self, path: &str) -> SpecResult<&ModuleDefinition> {
        self.get(path)
            .ok_or_else(|| SpecError::ModuleNotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    pub fn paths(&self) -> Vec<&str> {
        self.modules.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Reader for configuration files.
pub struct ConfigReader;

impl ConfigReader {
    /// Read `terrace.toml`; a missing file yields the default configuration.
    pub fn read_root(dir: &Path) -> SpecResult<RootConfig> {
        let path = dir.join(ROOT_FILE);
        if !path.exists() {
            debug!("No {} in {:?}, using defaults", ROOT_FILE, dir);
            return Ok(RootConfig::default());
        }
        debug!("Reading root configuration from {:?}", path);
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| SpecError::InvalidFormat {
            path,
            message: e.to_string(),
        })
    }

    /// Read one module definition file.
    pub fn read_module(path: &Path) -> SpecResult<ModuleDefinition> {
        debug!("Reading module from {:?}", path);
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| SpecError::InvalidFormat {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Read every `module.yaml` below `modules/`.
    pub fn read_modules(dir: &Path) -> SpecResult<ModuleCatalog> {
        let modules_dir = dir.join(MODULES_DIR);
        let mut catalog = ModuleCatalog::new();

        if !modules_dir.exists() {
            return Ok(catalog);
        }

        for entry in WalkDir::new(&modules_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() || path.file_name().map_or(true, |n| n != MODULE_FILE) {
                continue;
            }
            let Some(parent) = path.parent() else { continue };
            let Ok(relative) = parent.strip_prefix(&modules_dir) else {
                continue;
            };
            let module_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            catalog.register(module_path, Self::read_module(path)?);
        }

        Ok(catalog)
    }

    /// Read `environments/<name>/env.yaml`.
    pub fn read_environment(dir: &Path, name: &str) -> SpecResult<EnvironmentConfig> {
        let path = dir.join(ENVIRONMENTS_DIR).join(name).join(ENVIRONMENT_FILE);
        if !path.exists() {
            return Err(SpecError::EnvironmentNotFound(name.to_string()));
        }
        debug!("Reading environment from {:?}", path);
        let content = fs::read_to_string(&path)?;
        let env: EnvironmentConfig =
            serde_yaml::from_str(&content).map_err(|e| SpecError::InvalidFormat {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if env.name != name {
            return Err(SpecError::InvalidFormat {
                path,
                message: format!(
                    "environment name '{}' does not match directory '{}'",
                    env.name, name
                ),
            });
        }
        Ok(env)
    }

    /// Names of all environments with an `env.yaml`.
    pub fn list_environments(dir: &Path) -> SpecResult<Vec<String>> {
        let envs_dir = dir.join(ENVIRONMENTS_DIR);
        let mut names = Vec::new();
        if !envs_dir.exists() {
            return Ok(names);
        }
        for entry in fs::read_dir(&envs_dir)? {
            let entry = entry?;
            if entry.path().join(ENVIRONMENT_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// An opened configuration directory: root configuration plus module catalog.
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub root: RootConfig,
    pub catalog: ModuleCatalog,
}

impl Project {
    /// Open a project directory.
    pub fn open(dir: impl AsRef<Path>) -> SpecResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(SpecError::NotFound(dir));
        }
        let root = ConfigReader::read_root(&dir)?;
        let catalog = ConfigReader::read_modules(&dir)?;
        info!("Loaded {} module(s) from {:?}", catalog.len(), dir);
        Ok(Self { dir, root, catalog })
    }

    pub fn environment(&self, name: &str) -> SpecResult<EnvironmentConfig> {
        ConfigReader::read_environment(&self.dir, name)
    }

    pub fn environments(&self) -> SpecResult<Vec<String>> {
        ConfigReader::list_environments(&self.dir)
    }

    /// State directory resolved against the project directory.
    pub fn state_dir(&self) -> PathBuf {
        if self.root.backend.path.is_absolute() {
            self.root.backend.path.clone()
        } else {
            self.dir.join(&self.root.backend.path)
        }
    }

    /// Directory for persisted run logs.
    pub fn runs_dir(&self) -> PathBuf {
        self.dir.join(".terrace").join("runs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_root_uses_defaults() {
        let dir = tempdir().unwrap();
        let root = ConfigReader::read_root(dir.path()).unwrap();
        assert_eq!(root, RootConfig::default());
        assert_eq!(root.backend.prefix, "terrace");
    }

    #[test]
    fn test_nested_module_paths() {
        let dir = tempdir().unwrap();
        let module_dir = dir.path().join("modules").join("network").join("vpc");
        fs::create_dir_all(&module_dir).unwrap();
        fs::write(module_dir.join(MODULE_FILE), "name: vpc\nversion: \"1.2.0\"\n").unwrap();

        let catalog = ConfigReader::read_modules(dir.path()).unwrap();
        let module = catalog.get_required("network/vpc").unwrap();
        assert_eq!(module.version, "1.2.0");
        assert!(catalog.get_required("vpc").is_err());
    }

    #[test]
    fn test_environment_name_must_match_directory() {
        let dir = tempdir().unwrap();
        let env_dir = dir.path().join("environments").join("qa");
        fs::create_dir_all(&env_dir).unwrap();
        fs::write(env_dir.join(ENVIRONMENT_FILE), "name: prod\n").unwrap();

        let err = ConfigReader::read_environment(dir.path(), "qa").unwrap_err();
        assert!(matches!(err, SpecError::InvalidFormat { .. }));
        assert!(matches!(
            ConfigReader::read_environment(dir.path(), "dev"),
            Err(SpecError::EnvironmentNotFound(_))
        ));
    }
}
