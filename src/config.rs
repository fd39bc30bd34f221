// Config Module - Service settings and command-line argument parsing
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::info;

use crate::types::StationRegistry;

// Global storage for custom config path
static CUSTOM_CONFIG_PATH: OnceLock<Option<String>> = OnceLock::new();

#[derive(Parser, Debug, Default)]
#[command(
    author,
    version,
    about = "I2C port extender plugin for the SIP irrigation controller",
    long_about = "Serves the port extender settings page and drives SIP stations through\n\
                  PCF857x / MCP230xx I2C port extender chips."
)]
pub struct Args {
    /// Config file path or name (e.g., --cfg /full/path or --cfg garden for ~/.config/sip-pex/garden.conf)
    #[arg(long)]
    pub cfg: Option<String>,

    /// HTTP listen address
    #[arg(long)]
    pub ip: Option<String>,

    /// HTTP listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding pex_config.json
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Number of SIP stations (names default to S01, S02, ...)
    #[arg(short, long)]
    pub stations: Option<usize>,

    /// Print the plugin manifest and exit
    #[arg(long)]
    pub manifest: bool,

    /// Install the plugin files listed in the manifest into this SIP directory and exit
    #[arg(long, value_name = "SIP_DIR")]
    pub install: Option<PathBuf>,

    /// Where to find the plugin files when installing
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub source: PathBuf,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,  // Stores the config file path (not serialized)

    pub httpd_ip: String,
    pub httpd_port: u16,
    pub httpd_auth_enabled: bool,
    pub httpd_auth_user: String,
    pub httpd_auth_pass: String,
    pub data_dir: PathBuf,
    pub static_dir: PathBuf,
    pub station_names: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            config_path: None,
            httpd_ip: "0.0.0.0".to_string(),
            httpd_port: 8085,
            httpd_auth_enabled: false,
            httpd_auth_user: "".to_string(),
            httpd_auth_pass: "".to_string(),
            data_dir: PathBuf::from("./data"),
            static_dir: PathBuf::from("./static"),
            station_names: StationRegistry::default().names().to_vec(),
        }
    }
}

impl ServiceConfig {
    pub fn merge_with_args(&mut self, args: &Args) -> bool {
        // Track if any args were actually provided
        let mut args_provided = false;

        if let Some(ref ip) = args.ip {
            self.httpd_ip = ip.clone();
            args_provided = true;
        }

        if let Some(port) = args.port {
            self.httpd_port = port;
            args_provided = true;
        }

        if let Some(ref data_dir) = args.data_dir {
            self.data_dir = data_dir.clone();
            args_provided = true;
        }

        // Keep existing names, pad or truncate to the requested count
        if let Some(stations) = args.stations {
            let mut names = self.station_names.clone();
            names.truncate(stations);
            for n in names.len()..stations {
                names.push(format!("S{:02}", n + 1));
            }
            self.station_names = names;
            args_provided = true;
        }

        args_provided
    }

    /// Set the global config path (called once at startup)
    pub fn set_config_path(cfg: Option<String>) {
        let _ = CUSTOM_CONFIG_PATH.set(cfg);
    }

    fn get_config_path_arg() -> Option<&'static str> {
        CUSTOM_CONFIG_PATH.get().and_then(|opt| opt.as_deref())
    }

    pub fn config_path(cfg_arg: Option<&str>) -> Result<PathBuf> {
        // Priority: explicit arg > global > default
        let cfg = cfg_arg.or_else(|| Self::get_config_path_arg());

        if let Some(cfg) = cfg {
            let path = PathBuf::from(cfg);
            if path.is_absolute() || cfg.contains('/') || cfg.contains('\\') {
                return Ok(path);
            }

            // Otherwise treat as config name in config directory
            let config_dir = Self::config_dir()?;
            let filename = if cfg.ends_with(".conf") {
                cfg.to_string()
            } else {
                format!("{}.conf", cfg)
            };
            Ok(config_dir.join(filename))
        } else {
            Ok(Self::config_dir()?.join("config.conf"))
        }
    }

    fn config_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let config_dir = PathBuf::from(home).join(".config").join("sip-pex");
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create {}", config_dir.display()))?;
        Ok(config_dir)
    }

    pub fn load_with_path(cfg_arg: Option<&str>) -> Result<Self> {
        let path = Self::config_path(cfg_arg)?;
        Self::load_from(path)
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut parsed: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        parsed.config_path = Some(path);
        parsed.sanitize();
        Ok(parsed)
    }

    /// Sanitize config values to handle common formatting issues
    pub fn sanitize(&mut self) {
        self.httpd_ip = self.httpd_ip.trim().to_string();
        if self.httpd_ip.is_empty() {
            self.httpd_ip = "0.0.0.0".to_string();
        }
        self.httpd_port = self.httpd_port.max(1);
        self.httpd_auth_user = self.httpd_auth_user.trim().to_string();
        self.station_names = self
            .station_names
            .iter()
            .map(|n| n.trim().to_string())
            .collect();
    }

    pub fn stations(&self) -> StationRegistry {
        StationRegistry::new(self.station_names.clone())
    }

    pub fn save(&self) -> Result<()> {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => Self::config_path(None)?,
        };

        let mut sanitized = self.clone();
        sanitized.sanitize();

        let names = toml::Value::try_from(&sanitized.station_names)?;

        // Build TOML with comments manually for better documentation
        let contents = format!(
            r#"# sip-pex Configuration File
# Changes to the HTTP settings apply on restart

# HTTP server listen address and port
httpd_ip = {}
httpd_port = {}

# HTTP basic authentication (applies to every page)
httpd_auth_enabled = {}
httpd_auth_user = {}
httpd_auth_pass = {}

# Directory holding pex_config.json (the plugin's persisted settings)
data_dir = {}

# Directory served under /static (help page)
static_dir = {}

# SIP station names, in station order
station_names = {}
"#,
            toml::Value::String(sanitized.httpd_ip.clone()),
            sanitized.httpd_port,
            sanitized.httpd_auth_enabled,
            toml::Value::String(sanitized.httpd_auth_user.clone()),
            toml::Value::String(sanitized.httpd_auth_pass.clone()),
            toml::Value::String(sanitized.data_dir.display().to_string()),
            toml::Value::String(sanitized.static_dir.display().to_string()),
            names,
        );

        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved service config to {}", path.display());
        Ok(())
    }
}
