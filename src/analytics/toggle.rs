//! Persisted analytics consent.
//!
//! Consent has three states per switch: never asked (`None`), declined and
//! accepted. The custom-endpoint opt-in is tracked separately from the
//! default analytics consent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::CfdevError;

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
struct ToggleFile {
    #[facet(default)]
    cf_analytics: Option<bool>,
    #[facet(default)]
    custom_analytics: Option<bool>,
    /// Merged into every recorded event.
    #[facet(default)]
    props: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AnalyticsToggle {
    path: PathBuf,
    state: ToggleFile,
}

impl AnalyticsToggle {
    /// Load the toggle at `path`. A missing or unreadable file means
    /// consent was never given.
    pub fn load(path: &Path) -> Result<Self, CfdevError> {
        let state = match std::fs::read_to_string(path) {
            Ok(contents) => facet_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt analytics toggle");
                ToggleFile::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ToggleFile::default(),
            Err(e) => {
                return Err(CfdevError::io(format!("reading {}", path.display()), e));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// Whether the user has answered the consent prompt.
    pub fn defined(&self) -> bool {
        self.state.cf_analytics.is_some()
    }

    pub fn enabled(&self) -> bool {
        self.state.cf_analytics == Some(true)
    }

    pub fn custom_analytics_defined(&self) -> bool {
        self.state.custom_analytics.is_some()
    }

    /// Events go to the custom endpoint instead of the default one.
    pub fn is_custom(&self) -> bool {
        self.state.custom_analytics == Some(true)
    }

    /// Record consent. Turning analytics off also turns off a previously
    /// enabled custom endpoint.
    pub fn set_cf_analytics_enabled(&mut self, enabled: bool) -> Result<(), CfdevError> {
        self.state.cf_analytics = Some(enabled);
        if !enabled && self.state.custom_analytics == Some(true) {
            self.state.custom_analytics = Some(false);
        }
        self.save()
    }

    pub fn set_custom_analytics_enabled(&mut self, enabled: bool) -> Result<(), CfdevError> {
        self.state.custom_analytics = Some(enabled);
        self.save()
    }

    pub fn props(&self) -> &BTreeMap<String, String> {
        &self.state.props
    }

    pub fn set_prop(&mut self, key: &str, value: &str) -> Result<(), CfdevError> {
        self.state.props.insert(key.to_string(), value.to_string());
        self.save()
    }

    fn save(&self) -> Result<(), CfdevError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CfdevError::io(format!("creating {}", parent.display()), e))?;
        }
        let json = facet_json::to_string(&self.state).map_err(|e| {
            CfdevError::io("encoding analytics toggle", std::io::Error::other(e.to_string()))
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| CfdevError::io(format!("writing {}", tmp.display()), e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| CfdevError::io(format!("replacing {}", self.path.display()), e))
    }
}
