//! # Configuration Parsing
//!
//! Parses the INI-style configuration file named by the `CCI_CONFIG`
//! environment variable into an ordered list of device profiles. Each
//! section describes one device:
//!
//! ```ini
//! [bulk]
//! transport = udp
//! ip = 192.168.1.10
//! priority = 80
//! default = 1
//! mtu = 9000
//! ```
//!
//! The core interprets only `transport`, `priority` and `default`; every
//! other key is carried verbatim to the transport that claims the device.
//! Absence of `CCI_CONFIG` (or an unreadable file) is reported as
//! [`Status::NotFound`]; malformed content is [`Status::Invalid`].

use crate::status::{Result, Status};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CCI_CONFIG";

/// Default priority for sections that do not set one.
pub const DEFAULT_PRIORITY: u8 = 50;

/// One parsed configuration section, before a transport has claimed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Section name; becomes the device name.
    pub name: String,
    /// Transport tag from the mandatory `transport` key.
    pub transport: String,
    /// Ordering priority, 0..=100, higher first.
    pub priority: u8,
    /// Whether this section carried `default = 1`.
    pub is_default: bool,
    /// All other keys, verbatim and in file order.
    pub params: Vec<(String, String)>,
}

impl DeviceProfile {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parsed configuration: device profiles in file order.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub profiles: Vec<DeviceProfile>,
}

impl Config {
    /// Load the file named by `CCI_CONFIG`.
    pub fn from_env() -> Result<Config> {
        match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Err(Status::NotFound),
        }
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(|err| {
            warn!(path = %path.display(), %err, "cannot read configuration file");
            Status::NotFound
        })?;
        Self::parse(&text)
    }

    /// Parse configuration text. Grammar: `[section]` lines open a device;
    /// `key = value` lines populate it; `#` and `;` start comments; blank
    /// lines are ignored.
    pub fn parse(text: &str) -> Result<Config> {
        let mut profiles: Vec<DeviceProfile> = Vec::new();
        let mut current: Option<ProfileBuilder> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(section) = line.strip_prefix('[') {
                let name = section.strip_suffix(']').ok_or_else(|| {
                    warn!(lineno = lineno + 1, "unterminated section header");
                    Status::Invalid
                })?;
                let name = name.trim();
                if name.is_empty() || profiles.iter().any(|p| p.name == name) {
                    warn!(lineno = lineno + 1, name, "bad or duplicate section name");
                    return Err(Status::Invalid);
                }
                if let Some(builder) = current.take() {
                    profiles.push(builder.finish()?);
                }
                current = Some(ProfileBuilder::new(name));
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                warn!(lineno = lineno + 1, "expected `key = value`");
                Status::Invalid
            })?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() {
                return Err(Status::Invalid);
            }
            let builder = current.as_mut().ok_or_else(|| {
                warn!(lineno = lineno + 1, "key before any [section]");
                Status::Invalid
            })?;
            builder.set(key, value)?;
        }

        if let Some(builder) = current.take() {
            profiles.push(builder.finish()?);
        }

        if profiles.iter().filter(|p| p.is_default).count() > 1 {
            warn!("more than one section marked default = 1");
            return Err(Status::Invalid);
        }

        debug!(devices = profiles.len(), "configuration parsed");
        Ok(Config { profiles })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(|c| c == '#' || c == ';') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

struct ProfileBuilder {
    name: String,
    transport: Option<String>,
    priority: u8,
    is_default: bool,
    params: Vec<(String, String)>,
}

impl ProfileBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: None,
            priority: DEFAULT_PRIORITY,
            is_default: false,
            params: Vec::new(),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "transport" => self.transport = Some(value.to_string()),
            "priority" => {
                let parsed: u8 = value.parse().map_err(|_| Status::Invalid)?;
                if parsed > 100 {
                    return Err(Status::Invalid);
                }
                self.priority = parsed;
            }
            "default" => match value {
                "1" => self.is_default = true,
                "0" => self.is_default = false,
                _ => return Err(Status::Invalid),
            },
            _ => self.params.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    fn finish(self) -> Result<DeviceProfile> {
        let transport = self.transport.ok_or_else(|| {
            warn!(section = %self.name, "section has no transport key");
            Status::Invalid
        })?;
        Ok(DeviceProfile {
            name: self.name,
            transport,
            priority: self.priority,
            is_default: self.is_default,
            params: self.params,
        })
    }
}
