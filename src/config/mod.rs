//! YAML configuration.
//!
//! Two layers: the install dir's `misc/rsp.yaml` loads first, then either
//! an explicit `-C <path>` file or an `rsp.yaml`/`rsp.yml` found in the
//! working directory overrides individual properties. The placeholder
//! `${rspdir}` expands to the install directory before parsing. Decoding
//! is strict: unknown keys are configuration errors.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RspError};
use crate::util;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Root for per-instance caches (artifact files, zdr sockets).
    pub cache_dir: PathBuf,
    /// Content root scanned by the caches.
    pub pub_dir: PathBuf,
    pub servers: Vec<ServerConfig>,
    pub zdr: ZdrConfig,
    pub servlet: ServletConfig,
    pub pages: PagesConfig,
    pub toolchain: ToolchainConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// `http` or `https`.
    #[serde(rename = "type")]
    pub kind: String,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub autocert: Option<AutocertConfig>,
    pub dir_list: DirListConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            kind: String::new(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            autocert: None,
            dir_list: DirListConfig::default(),
        }
    }
}

impl ServerConfig {
    /// The `host:port` this server listens on.
    pub fn addr(&self) -> String {
        let host = if self.address.is_empty() { "0.0.0.0" } else { &self.address };
        format!("{}:{}", host, self.port)
    }

    fn on_load(&mut self) -> Result<()> {
        if self.kind.is_empty() {
            self.kind = "http".to_string();
        } else {
            self.kind = self.kind.to_lowercase();
            if self.kind != "http" && self.kind != "https" {
                return Err(RspError::ConfigInvalid(format!(
                    "invalid type {:?} in server config",
                    self.kind
                )));
            }
        }

        if self.port == 0 {
            self.port = if self.kind == "https" { 443 } else { 80 };
        }

        if let Some(ac) = &self.autocert {
            if ac.hosts.is_empty() {
                return Err(RspError::ConfigInvalid(
                    "autocert.hosts is empty in server config".into(),
                ));
            }
            if !self.tls_cert_file.is_empty() || !self.tls_key_file.is_empty() {
                return Err(RspError::ConfigInvalid(
                    "both autocert and tls cert/key files in server config".into(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct AutocertConfig {
    /// Fully qualified hostnames to allow (required, no wildcards).
    pub hosts: Vec<String>,
    /// Contact email passed to the CA.
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DirListConfig {
    pub enabled: bool,
    /// Optional page source rendering the listing.
    pub template: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ZdrConfig {
    pub enabled: bool,
    /// Names the control-socket bucket shared by cooperating instances.
    pub group: String,
}

impl ZdrConfig {
    fn on_load(&self) -> Result<()> {
        if !self.group.is_empty() {
            let ok = self
                .group
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
            if !ok {
                return Err(RspError::ConfigInvalid(format!(
                    "invalid value for zdr.group {:?}",
                    self.group
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ServletConfig {
    pub enabled: bool,
    /// Build every servlet at startup instead of on first request.
    pub preload: bool,
    /// Rebuild servlets when their sources change.
    pub hot_reload: bool,
    /// Keep built artifact files across restarts.
    pub recycle: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PagesConfig {
    pub enabled: bool,
    /// Page source extension (default `.rsp`).
    pub file_ext: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ToolchainConfig {
    /// Additional library search roots for the servlet compiler.
    pub libpath: Vec<PathBuf>,
}

impl Config {
    fn on_load(&mut self) -> Result<()> {
        for sc in &mut self.servers {
            sc.on_load()?;
        }
        self.zdr.on_load()?;
        Ok(())
    }

    /// Parse one YAML document, expanding `${rspdir}`.
    fn parse_layer(raw: &str, rspdir: &Path) -> Result<serde_yaml::Value> {
        let expanded = raw.replace("${rspdir}", &rspdir.to_string_lossy());
        serde_yaml::from_str(&expanded)
            .map_err(|e| RspError::ConfigInvalid(e.to_string()))
    }

    /// Load the base configuration plus an optional user override.
    ///
    /// `explicit` is the `-C` flag; when absent, `rsp.yaml` / `rsp.yml`
    /// in the working directory is used if present. Returns the config
    /// and the path of the last file loaded.
    pub fn load(rspdir: &Path, explicit: Option<&Path>) -> Result<(Config, PathBuf)> {
        let base_path = rspdir.join("misc").join("rsp.yaml");
        let base_raw = std::fs::read_to_string(&base_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RspError::ConfigInvalid(format!(
                    "base config file not found: {}",
                    base_path.display()
                ))
            } else {
                e.into()
            }
        })?;

        let mut merged = Self::parse_layer(&base_raw, rspdir)?;
        let mut loaded_from = base_path;

        let user_path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => ["rsp.yaml", "rsp.yml"]
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists()),
        };

        if let Some(path) = user_path {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| RspError::ConfigInvalid(format!("{}: {e}", path.display())))?;
            let overlay = Self::parse_layer(&raw, rspdir)?;
            merge_yaml(&mut merged, overlay);
            loaded_from = path;
        }

        let mut config: Config = serde_yaml::from_value(merged)
            .map_err(|e| RspError::ConfigInvalid(e.to_string()))?;
        config.on_load()?;

        // canonicalize paths (lexically; symlinks are preserved)
        config.pub_dir = abspath(&config.pub_dir)?;
        config.cache_dir = abspath(&config.cache_dir)?;
        for p in &mut config.toolchain.libpath {
            *p = abspath(p)?;
        }

        Ok((config, loaded_from))
    }
}

/// Overlay `over` onto `base`: mappings merge recursively, everything
/// else replaces.
fn merge_yaml(base: &mut serde_yaml::Value, over: serde_yaml::Value) {
    use serde_yaml::Value;
    match (base, over) {
        (Value::Mapping(base_map), Value::Mapping(over_map)) => {
            for (k, v) in over_map {
                match base_map.get_mut(&k) {
                    Some(slot) => merge_yaml(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn abspath(p: &Path) -> Result<PathBuf> {
    if p.as_os_str().is_empty() {
        return Ok(PathBuf::new());
    }
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };
    Ok(util::clean_path(&abs))
}
