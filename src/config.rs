use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::ingest::{ListenSpec, LogFlags, ProbeOptions, SocketBufferConfig};
use crate::sort::merge::MAX_MERGE_FILES;
use crate::sort::{SortOptions, DEFAULT_BUFFER_SIZE};

fn empty_path_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(opt.and_then(|path| {
        if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        }
    }))
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    /// A value that parsed but cannot be used.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Parse(err) => write!(f, "config parse error: {}", err),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collect: CollectConfig,
    #[serde(rename = "probe")]
    pub probes: Vec<ProbeConfig>,
    pub sort: SortConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&raw).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Flow file the collected records are written to.
    #[serde(deserialize_with = "empty_path_none")]
    pub output: Option<PathBuf>,
    /// Seconds between per-probe statistics lines; 0 disables them.
    pub stats_interval_secs: u64,
    /// Write a JSON statistics summary here on shutdown.
    #[serde(deserialize_with = "empty_path_none")]
    pub stats_json: Option<PathBuf>,
    pub socket_buffer_total: Option<usize>,
    pub socket_buffer_minimum: Option<usize>,
    /// Records queued between the probe consumers and the writer.
    pub channel_capacity: usize,
}

impl Default for CollectConfig {
    fn default() -> Self {
        CollectConfig {
            output: None,
            stats_interval_secs: 300,
            stats_json: None,
            socket_buffer_total: None,
            socket_buffer_minimum: None,
            channel_capacity: 65_536,
        }
    }
}

impl CollectConfig {
    /// Environment defaults, overridden by explicit settings.
    pub fn socket_buffers(&self) -> SocketBufferConfig {
        let mut cfg = SocketBufferConfig::from_env();
        if let Some(total) = self.socket_buffer_total {
            cfg.nominal_total = total;
        }
        if let Some(min) = self.socket_buffer_minimum {
            cfg.minimum = min;
        }
        cfg
    }
}

/// Where a probe's PDUs come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSource {
    Listen(ListenSpec),
    File(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub name: String,
    /// `host:port` or `:port` addresses to listen on.
    pub listen: Vec<String>,
    #[serde(deserialize_with = "empty_path_none")]
    pub unix_socket: Option<PathBuf>,
    /// Replay a file of raw PDUs instead of listening.
    #[serde(deserialize_with = "empty_path_none")]
    pub file: Option<PathBuf>,
    pub accept_from: Vec<String>,
    pub log_flags: Vec<String>,
    pub ring_capacity: usize,
    pub sensor_id: Option<u16>,
    pub flow_type: Option<u8>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            name: String::new(),
            listen: Vec::new(),
            unix_socket: None,
            file: None,
            accept_from: Vec::new(),
            log_flags: Vec::new(),
            ring_capacity: 4096,
            sensor_id: None,
            flow_type: None,
        }
    }
}

impl ProbeConfig {
    fn invalid(&self, msg: impl fmt::Display) -> ConfigError {
        ConfigError::Invalid(format!("probe '{}': {}", self.name, msg))
    }

    pub fn options(&self) -> Result<ProbeOptions, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("probe without a name".into()));
        }
        if self.ring_capacity == 0 {
            return Err(self.invalid("ring_capacity must be positive"));
        }
        let log_flags = LogFlags::parse(&self.log_flags).map_err(|e| self.invalid(e))?;
        let mut options = ProbeOptions::new(self.name.clone());
        options.log_flags = log_flags;
        options.ring_capacity = self.ring_capacity;
        options.sensor = self.sensor_id;
        options.flow_type = self.flow_type;
        Ok(options)
    }

    /// Exactly one of `listen`, `unix_socket` and `file` must be set.
    pub fn source(&self) -> Result<ProbeSource, ConfigError> {
        let set = [
            !self.listen.is_empty(),
            self.unix_socket.is_some(),
            self.file.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if set != 1 {
            return Err(self.invalid("set exactly one of listen, unix_socket or file"));
        }
        if let Some(path) = &self.file {
            return Ok(ProbeSource::File(path.clone()));
        }
        if !self.accept_from.is_empty() && self.listen.is_empty() {
            return Err(self.invalid("accept_from only applies to UDP listeners"));
        }
        if let Some(path) = &self.unix_socket {
            return Ok(ProbeSource::Listen(ListenSpec::unix(path.clone())));
        }
        ListenSpec::udp_all(&self.listen)
            .map(ProbeSource::Listen)
            .map_err(|e| self.invalid(e))
    }

    /// Resolve `accept_from`; `None` accepts any host.
    pub fn accept_hosts(&self) -> Result<Option<Vec<IpAddr>>, ConfigError> {
        if self.accept_from.is_empty() {
            return Ok(None);
        }
        let mut hosts = Vec::new();
        for host in &self.accept_from {
            if let Ok(ip) = host.parse::<IpAddr>() {
                hosts.push(ip);
                continue;
            }
            let addrs = (host.as_str(), 0)
                .to_socket_addrs()
                .map_err(|e| self.invalid(format_args!("cannot resolve '{}': {}", host, e)))?;
            hosts.extend(addrs.map(|a| a.ip()));
        }
        hosts.sort();
        hosts.dedup();
        Ok(Some(hosts))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    pub fields: Option<String>,
    pub reverse: bool,
    pub presorted: bool,
    /// Memory budget in bytes.
    pub buffer_size: usize,
    #[serde(deserialize_with = "empty_path_none")]
    pub temp_dir: Option<PathBuf>,
    pub max_merge_files: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            fields: None,
            reverse: false,
            presorted: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            temp_dir: None,
            max_merge_files: MAX_MERGE_FILES,
        }
    }
}

impl SortConfig {
    pub fn options(&self) -> SortOptions {
        SortOptions {
            buffer_size: self.buffer_size,
            temp_dir: self.temp_dir.clone(),
            max_merge_files: self.max_merge_files,
            presorted: self.presorted,
        }
    }
}

/// Parse a byte count with an optional `k`, `m`, `g` or `t` suffix
/// (powers of 1024).
pub fn parse_size(raw: &str) -> Result<usize, String> {
    let s = raw.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_lowercase() {
                'b' => 0,
                'k' => 10,
                'm' => 20,
                'g' => 30,
                't' => 40,
                _ => return Err(format!("unknown size suffix in '{}'", raw)),
            };
            (&s[..i], shift)
        }
        _ => (s, 0),
    };
    let value: usize = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", raw))?;
    value
        .checked_mul(1usize << shift)
        .ok_or_else(|| format!("size '{}' is too large", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[collect]
output = "/var/flows/out.flw"
stats_interval_secs = 60
stats_json = ""

[[probe]]
name = "edge"
listen = ["127.0.0.1:9995"]
accept_from = ["127.0.0.1"]
log_flags = ["missing", "bad"]
sensor_id = 4

[[probe]]
name = "replay"
file = "/tmp/pdus.bin"

[sort]
fields = "sIP,dIP"
buffer_size = 1048576
"#;

    #[test]
    fn load_sample() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.collect.output, Some(PathBuf::from("/var/flows/out.flw")));
        assert_eq!(cfg.collect.stats_json, None);
        assert_eq!(cfg.probes.len(), 2);

        let edge = &cfg.probes[0];
        let opts = edge.options().unwrap();
        assert!(opts.log_flags.contains(LogFlags::MISSING));
        assert!(!opts.log_flags.contains(LogFlags::TIMESTAMPS));
        assert_eq!(opts.sensor, Some(4));
        assert!(matches!(edge.source().unwrap(), ProbeSource::Listen(ListenSpec::Udp { .. })));
        assert_eq!(edge.accept_hosts().unwrap(), Some(vec!["127.0.0.1".parse().unwrap()]));

        assert_eq!(
            cfg.probes[1].source().unwrap(),
            ProbeSource::File(PathBuf::from("/tmp/pdus.bin"))
        );
        assert_eq!(cfg.sort.fields.as_deref(), Some("sIP,dIP"));
        assert_eq!(cfg.sort.options().buffer_size, 1 << 20);
        assert_eq!(cfg.sort.max_merge_files, MAX_MERGE_FILES);
    }

    #[test]
    fn probe_needs_one_source() {
        let probe = ProbeConfig {
            name: "p".into(),
            ..ProbeConfig::default()
        };
        assert!(probe.source().is_err());
        let probe = ProbeConfig {
            name: "p".into(),
            listen: vec![":9995".into()],
            file: Some("/tmp/x".into()),
            ..ProbeConfig::default()
        };
        assert!(probe.source().is_err());
    }

    #[test]
    fn bad_log_flag() {
        let probe = ProbeConfig {
            name: "p".into(),
            log_flags: vec!["chatty".into()],
            ..ProbeConfig::default()
        };
        assert!(matches!(probe.options(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("1920m").unwrap(), 1920 << 20);
        assert_eq!(parse_size("64K").unwrap(), 64 << 10);
        assert_eq!(parse_size("2g").unwrap(), 2 << 30);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("12x").is_err());
        assert!(parse_size("m").is_err());
    }
}
