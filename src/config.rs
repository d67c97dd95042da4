use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::cache::CacheItem;
use crate::error::CfdevError;
use crate::paths;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub vm: VmSettings,
    #[facet(default)]
    pub cache: CacheSettings,
    #[facet(default)]
    pub provision: ProvisionSettings,
    #[facet(default)]
    pub analytics: AnalyticsSettings,
    #[facet(default)]
    pub helper: HelperSettings,
    #[facet(default)]
    pub assets: Vec<AssetConfig>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmSettings {
    #[facet(default = 4)]
    pub cpus: u32,
    #[facet(default = 8192)]
    pub memory_mb: u64,
    /// Catalog asset the VM boots from.
    #[facet(default = "cfdev-efi.iso")]
    pub image: String,
    /// Address the provisioner reaches the running VM on.
    #[facet(default = "10.144.0.2")]
    pub address: String,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory_mb: 8192,
            image: "cfdev-efi.iso".into(),
            address: "10.144.0.2".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct CacheSettings {
    /// Total download attempts per asset, first try included.
    #[facet(default = 3)]
    pub retry_attempts: u32,
    /// Fixed wait between attempts.
    #[facet(default = 1000)]
    pub retry_wait_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_wait_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ProvisionSettings {
    #[facet(default = 25555)]
    pub port: u16,
    /// Deployment manifest handed to the provisioner as-is.
    #[facet(default)]
    pub deployment: Option<String>,
    #[facet(default = 600)]
    pub ready_timeout_s: u64,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            port: 25555,
            deployment: None,
            ready_timeout_s: 600,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct AnalyticsSettings {
    #[facet(default)]
    pub endpoint: Option<String>,
    #[facet(default)]
    pub custom_endpoint: Option<String>,
    /// Upper bound on recording one event from the command's point of view.
    #[facet(default = 500)]
    pub timeout_ms: u64,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            custom_endpoint: None,
            timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HelperSettings {
    /// Privileged network helper executable.
    #[facet(default = "cfdevd")]
    pub command: String,
    #[facet(default)]
    pub args: Vec<String>,
    #[facet(default = 30)]
    pub startup_timeout_s: u64,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            command: "cfdevd".into(),
            args: Vec::new(),
            startup_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct AssetConfig {
    pub name: String,
    pub url: String,
    pub sha256: String,
    #[facet(default)]
    pub size: Option<u64>,
}

// ── SystemConfig ──────────────────────────────────────────

/// Parsed config plus the home directory everything else hangs off.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub home: PathBuf,
    /// File the config came from; `None` when running on built-in defaults.
    pub config_path: Option<PathBuf>,
    pub config: Config,
}

impl SystemConfig {
    pub fn cache_dir(&self) -> PathBuf {
        paths::cache_dir(&self.home)
    }

    pub fn state_dir(&self) -> PathBuf {
        paths::state_dir(&self.home)
    }

    pub fn backend_dir(&self, backend: &str) -> PathBuf {
        paths::backend_dir(&self.home, backend)
    }

    /// The asset catalog as cache items, in declaration order.
    pub fn catalog(&self) -> Vec<CacheItem> {
        self.config
            .assets
            .iter()
            .map(|a| CacheItem {
                name: a.name.clone(),
                url: a.url.clone(),
                sha256: a.sha256.to_ascii_lowercase(),
                size: a.size,
            })
            .collect()
    }

    /// Cache location of the boot image. Errors if the catalog does not list it.
    pub fn image_path(&self) -> Result<PathBuf, CfdevError> {
        let name = &self.config.vm.image;
        if !self.config.assets.iter().any(|a| &a.name == name) {
            return Err(CfdevError::Validation {
                message: format!("VM image '{name}' is not listed in [[assets]]"),
            });
        }
        Ok(self.cache_dir().join(name))
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.config.cache.retry_wait_ms)
    }

    pub fn analytics_timeout(&self) -> Duration {
        Duration::from_millis(self.config.analytics.timeout_ms)
    }

    pub fn provision_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.config.provision.ready_timeout_s)
    }

    /// Read the deployment manifest, if one is configured. Relative paths
    /// resolve against the config file's directory.
    pub fn deployment_manifest(&self) -> Result<Option<Vec<u8>>, CfdevError> {
        let Some(ref raw) = self.config.provision.deployment else {
            return Ok(None);
        };
        let path = Path::new(raw);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let base = self
                .config_path
                .as_deref()
                .and_then(Path::parent)
                .unwrap_or(&self.home);
            base.join(path)
        };
        std::fs::read(&path)
            .map(Some)
            .map_err(|e| CfdevError::io(format!("reading deployment {}", path.display()), e))
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), CfdevError> {
    if config.vm.cpus < 1 {
        return Err(CfdevError::Validation {
            message: "cpus must be at least 1".into(),
        });
    }
    if config.vm.memory_mb < 1024 {
        return Err(CfdevError::Validation {
            message: "memory_mb must be at least 1024".into(),
        });
    }
    if config.cache.retry_attempts < 1 {
        return Err(CfdevError::Validation {
            message: "retry_attempts must be at least 1".into(),
        });
    }

    let mut seen = HashSet::new();
    for asset in &config.assets {
        validate_asset_name(&asset.name)?;
        if !seen.insert(asset.name.as_str()) {
            return Err(CfdevError::Validation {
                message: format!("duplicate asset '{}'", asset.name),
            });
        }
        if asset.sha256.len() != 64 || !asset.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CfdevError::Validation {
                message: format!("asset '{}' needs a 64-digit hex sha256", asset.name),
            });
        }
        if asset.url.is_empty() {
            return Err(CfdevError::Validation {
                message: format!("asset '{}' has no url", asset.name),
            });
        }
    }

    Ok(())
}

/// Asset names become file names in the cache directory.
pub fn validate_asset_name(name: &str) -> Result<(), CfdevError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.ends_with(".part")
        || name.contains(['/', '\\'])
        || name.chars().any(|c| c.is_control());
    if bad {
        return Err(CfdevError::Validation {
            message: format!("invalid asset name '{name}'"),
        });
    }
    Ok(())
}

// ── loading ───────────────────────────────────────────────

/// Load config for `home`. An explicit `path` must exist; otherwise
/// `<home>/cfdev.toml` is used when present, built-in defaults when not.
pub fn load_config(path: Option<&Path>, home: PathBuf) -> Result<SystemConfig, CfdevError> {
    let (config_path, contents) = match path {
        Some(p) => {
            let contents =
                std::fs::read_to_string(p).map_err(|source| CfdevError::ConfigLoad {
                    path: p.display().to_string(),
                    source,
                })?;
            (Some(p.to_path_buf()), Some(contents))
        }
        None => {
            let default = paths::config_file(&home);
            match std::fs::read_to_string(&default) {
                Ok(contents) => (Some(default), Some(contents)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, None),
                Err(source) => {
                    return Err(CfdevError::ConfigLoad {
                        path: default.display().to_string(),
                        source,
                    });
                }
            }
        }
    };

    let config = match (&config_path, contents) {
        (Some(p), Some(contents)) => parse_config(&contents, p)?,
        _ => Config::default(),
    };

    validate_config(&config)?;

    Ok(SystemConfig {
        home,
        config_path,
        config,
    })
}

fn parse_config(contents: &str, path: &Path) -> Result<Config, CfdevError> {
    facet_toml::from_str(contents).map_err(|e| CfdevError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
