//! Value objects for ZFS names, sizes and SSH endpoints.
//!
//! These are immutable, validated at construction, and round-trip through
//! their string forms.

use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static POOL_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-.]*$").unwrap());

static PATH_COMPONENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-. ]*$").unwrap());

static USERNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]*$").unwrap());

static DOMAIN_LABEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?$").unwrap());

static IPV6_CHARS_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F:]+$").unwrap());

/// A ZFS dataset name: pool plus ordered path components.
///
/// Rendered as `pool[/component]*` and reparsed losslessly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DatasetName {
    pool: String,
    path: Vec<String>,
}

impl DatasetName {
    pub fn new(pool: impl Into<String>, path: Vec<String>) -> Result<Self> {
        let pool = pool.into();
        if pool.is_empty() {
            return Err(Error::validation("dataset", "pool name cannot be empty"));
        }
        if !POOL_NAME_REGEX.is_match(&pool) {
            return Err(Error::validation(
                "dataset",
                format!("invalid pool name: {}", pool),
            ));
        }
        for part in &path {
            if !PATH_COMPONENT_REGEX.is_match(part) {
                return Err(Error::validation(
                    "dataset",
                    format!("invalid dataset path component: {}", part),
                ));
            }
        }
        Ok(Self { pool, path })
    }

    pub fn from_string(dataset_str: &str) -> Result<Self> {
        if dataset_str.is_empty() {
            return Err(Error::validation("dataset", "dataset name cannot be empty"));
        }
        let mut parts = dataset_str.split('/');
        let pool = parts.next().unwrap_or_default().to_string();
        let path: Vec<String> = parts.map(|p| p.to_string()).collect();
        Self::new(pool, path)
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn components(&self) -> &[String] {
        &self.path
    }

    pub fn is_pool_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn parent(&self) -> Option<DatasetName> {
        if self.is_pool_root() {
            return None;
        }
        Some(DatasetName {
            pool: self.pool.clone(),
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, name: &str) -> Result<DatasetName> {
        let mut path = self.path.clone();
        path.push(name.to_string());
        DatasetName::new(self.pool.clone(), path)
    }
}

impl std::fmt::Display for DatasetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.pool)
        } else {
            write!(f, "{}/{}", self.pool, self.path.join("/"))
        }
    }
}

impl std::str::FromStr for DatasetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_string(s)
    }
}

/// Nonnegative byte count with ZFS suffix parsing and formatting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SizeValue(u64);

const SIZE_UNITS: [(&str, u32); 9] = [
    ("B", 0),
    ("K", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
    ("Z", 7),
    ("Y", 8),
];

impl SizeValue {
    pub fn from_bytes(bytes: u64) -> Self {
        SizeValue(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Parse a ZFS size string such as `1.5G` or `500M`.
    ///
    /// `-`, `0` and `0B` all mean zero/unset.
    pub fn from_zfs_string(size_str: &str) -> Result<Self> {
        let s = size_str.trim().to_uppercase();
        if s == "-" || s == "0" || s == "0B" {
            return Ok(SizeValue(0));
        }

        let (number_part, unit_part) = match s.find(|c: char| c.is_ascii_alphabetic()) {
            Some(idx) => (&s[..idx], &s[idx..]),
            None => (s.as_str(), "B"),
        };
        let number_part = number_part.trim();
        let unit_part = unit_part.trim();

        if number_part.is_empty() || unit_part.len() > 1 {
            return Err(Error::Parse(format!("cannot parse size: {}", size_str)));
        }

        let value: f64 = number_part
            .parse()
            .map_err(|_| Error::Parse(format!("cannot parse size: {}", size_str)))?;
        if value < 0.0 {
            return Err(Error::Parse(format!("size cannot be negative: {}", size_str)));
        }

        let exponent = SIZE_UNITS
            .iter()
            .find(|(u, _)| *u == unit_part)
            .map(|(_, e)| *e)
            .ok_or_else(|| Error::Parse(format!("unknown size unit: {}", unit_part)))?;

        Ok(SizeValue((value * 1024f64.powi(exponent as i32)) as u64))
    }

    pub fn to_human_readable(&self) -> String {
        if self.0 == 0 {
            return "0B".to_string();
        }
        let mut size = self.0 as f64;
        let mut unit_index = 0;
        while size >= 1024.0 && unit_index < SIZE_UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }
        if (size - size.trunc()).abs() < f64::EPSILON {
            format!("{}{}", size as u64, SIZE_UNITS[unit_index].0)
        } else {
            format!("{:.1}{}", size, SIZE_UNITS[unit_index].0)
        }
    }

    pub fn saturating_add(&self, other: SizeValue) -> SizeValue {
        SizeValue(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: SizeValue) -> SizeValue {
        SizeValue(self.0.saturating_sub(other.0))
    }
}

impl std::fmt::Display for SizeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

/// An SSH endpoint: hostname, username and port.
///
/// `localhost` (and its loopback aliases) is distinguished: operations
/// against it run locally without SSH.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HostConnection {
    pub hostname: String,
    pub username: String,
    pub port: u16,
}

impl HostConnection {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, port: u16) -> Result<Self> {
        let hostname = hostname.into();
        let username = username.into();

        if hostname.is_empty() {
            return Err(Error::validation("hostname", "hostname cannot be empty"));
        }
        if hostname.len() > 253 {
            return Err(Error::validation(
                "hostname",
                "hostname cannot exceed 253 characters",
            ));
        }
        if !is_valid_hostname(&hostname) {
            return Err(Error::validation(
                "hostname",
                format!("invalid hostname format: {}", hostname),
            ));
        }

        if username.is_empty() {
            return Err(Error::validation("username", "username cannot be empty"));
        }
        if username.len() > 32 {
            return Err(Error::validation(
                "username",
                "username cannot exceed 32 characters",
            ));
        }
        if !USERNAME_REGEX.is_match(&username) {
            return Err(Error::validation(
                "username",
                format!("invalid username format: {}", username),
            ));
        }

        if port == 0 {
            return Err(Error::validation("port", "port must be between 1 and 65535"));
        }

        Ok(Self {
            hostname,
            username,
            port,
        })
    }

    pub fn localhost() -> Self {
        // Constructed values always satisfy validation.
        Self {
            hostname: "localhost".to_string(),
            username: "root".to_string(),
            port: 22,
        }
    }

    /// Parse `[username@]hostname[:port]`.
    pub fn from_string(connection_string: &str) -> Result<Self> {
        let (username, host_port) = match connection_string.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => ("root".to_string(), connection_string),
        };

        // IPv6 literals contain colons; only split a trailing :port when the
        // remainder parses as a number and the host is not a bare IPv6 form.
        let (hostname, port) = match host_port.rsplit_once(':') {
            Some((host, port_str)) if !host.contains(':') => {
                let port: u16 = port_str.parse().map_err(|_| {
                    Error::validation("port", format!("invalid port: {}", port_str))
                })?;
                (host.to_string(), port)
            }
            _ => (host_port.to_string(), 22),
        };

        Self::new(hostname, username, port)
    }

    pub fn to_connection_string(&self) -> String {
        if self.port == 22 {
            format!("{}@{}", self.username, self.hostname)
        } else {
            format!("{}@{}:{}", self.username, self.hostname, self.port)
        }
    }

    pub fn to_ssh_url(&self) -> String {
        format!("ssh://{}@{}:{}", self.username, self.hostname, self.port)
    }

    pub fn is_localhost(&self) -> bool {
        matches!(
            self.hostname.to_lowercase().as_str(),
            "localhost" | "127.0.0.1" | "::1"
        )
    }
}

impl std::fmt::Display for HostConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_connection_string())
    }
}

fn is_valid_hostname(hostname: &str) -> bool {
    is_valid_ipv4(hostname) || is_valid_ipv6(hostname) || is_valid_domain(hostname)
}

fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|part| {
        if part.is_empty() || (part.len() > 1 && part.starts_with('0')) {
            return false;
        }
        part.parse::<u16>().map(|n| n <= 255).unwrap_or(false)
    })
}

fn is_valid_ipv6(ip: &str) -> bool {
    if ip.matches(':').count() < 2 {
        return false;
    }
    if ip.matches("::").count() > 1 {
        return false;
    }
    IPV6_CHARS_REGEX.is_match(ip)
}

fn is_valid_domain(domain: &str) -> bool {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain
        .split('.')
        .all(|label| !label.is_empty() && label.len() <= 63 && DOMAIN_LABEL_REGEX.is_match(label))
}

/// SSH client settings applied by the command executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub key_file: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            key_file: None,
            timeout_secs: 30,
        }
    }
}

impl SshConfig {
    pub fn from_host(host: &HostConnection) -> Self {
        Self {
            user: host.username.clone(),
            port: host.port,
            key_file: None,
            timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_name_round_trip() {
        for name in ["tank", "tank/data", "tank/data/app-1", "rpool/var/lib.docker"] {
            let parsed = DatasetName::from_string(name).unwrap();
            assert_eq!(parsed.to_string(), name);
            assert_eq!(DatasetName::from_string(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn test_dataset_name_rejects_bad_input() {
        assert!(DatasetName::from_string("").is_err());
        assert!(DatasetName::from_string("/tank").is_err());
        assert!(DatasetName::from_string("tank//data").is_err());
        assert!(DatasetName::from_string("tank/da;ta").is_err());
        assert!(DatasetName::from_string("-tank").is_err());
    }

    #[test]
    fn test_dataset_name_hierarchy() {
        let name = DatasetName::from_string("tank/apps/web").unwrap();
        assert!(!name.is_pool_root());
        assert_eq!(name.parent().unwrap().to_string(), "tank/apps");
        assert_eq!(name.child("db").unwrap().to_string(), "tank/apps/web/db");

        let root = DatasetName::from_string("tank").unwrap();
        assert!(root.is_pool_root());
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_size_parse_table() {
        // Exact values the ZFS CLI is known to emit.
        let cases = [
            ("0", 0u64),
            ("-", 0),
            ("0B", 0),
            ("1K", 1024),
            ("1.5G", 1_610_612_736),
            ("1T", 1_099_511_627_776),
        ];
        for (input, expected) in cases {
            assert_eq!(
                SizeValue::from_zfs_string(input).unwrap().bytes(),
                expected,
                "parsing {}",
                input
            );
        }
    }

    #[test]
    fn test_size_round_trip_clean_multiples() {
        for bytes in [0u64, 1024, 1024 * 1024, 5 * 1024u64.pow(3), 3 * 1024u64.pow(4)] {
            let size = SizeValue::from_bytes(bytes);
            let reparsed = SizeValue::from_zfs_string(&size.to_human_readable()).unwrap();
            assert_eq!(reparsed.bytes(), bytes);
        }
    }

    #[test]
    fn test_size_rejects_garbage() {
        assert!(SizeValue::from_zfs_string("").is_err());
        assert!(SizeValue::from_zfs_string("abc").is_err());
        assert!(SizeValue::from_zfs_string("1Q").is_err());
        assert!(SizeValue::from_zfs_string("-5G").is_err());
    }

    #[test]
    fn test_host_connection_round_trip() {
        let host = HostConnection::new("host2.example.com", "deploy", 2222).unwrap();
        let reparsed = HostConnection::from_string(&host.to_connection_string()).unwrap();
        assert_eq!(reparsed, host);

        // Default port is omitted from the string form and restored on parse.
        let host = HostConnection::new("host2", "root", 22).unwrap();
        assert_eq!(host.to_connection_string(), "root@host2");
        let reparsed = HostConnection::from_string("root@host2").unwrap();
        assert_eq!(reparsed.port, 22);
        assert_eq!(reparsed, host);
    }

    #[test]
    fn test_host_connection_validation() {
        assert!(HostConnection::new("", "root", 22).is_err());
        assert!(HostConnection::new("host2", "Root", 22).is_err());
        assert!(HostConnection::new("host2", "1user", 22).is_err());
        assert!(HostConnection::new("host2", "root", 0).is_err());
        assert!(HostConnection::new("-bad.example.com", "root", 22).is_err());
        assert!(HostConnection::new("192.168.01.1", "root", 22).is_err());
        assert!(HostConnection::new("192.168.1.1", "root", 22).is_ok());
        assert!(HostConnection::new("fe80::1", "root", 22).is_ok());
    }

    #[test]
    fn test_localhost_detection() {
        assert!(HostConnection::localhost().is_localhost());
        assert!(HostConnection::new("127.0.0.1", "root", 22).unwrap().is_localhost());
        assert!(HostConnection::new("::1", "root", 22).unwrap().is_localhost());
        assert!(!HostConnection::new("host2", "root", 22).unwrap().is_localhost());
    }

    #[test]
    fn test_serde_round_trips() {
        let host = HostConnection::new("host2", "deploy", 2200).unwrap();
        let json = serde_json::to_string(&host).unwrap();
        let back: HostConnection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, host);

        let name = DatasetName::from_string("tank/apps/web").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        let back: DatasetName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);

        let size = SizeValue::from_bytes(1_610_612_736);
        let json = serde_json::to_string(&size).unwrap();
        let back: SizeValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, size);
    }

    #[test]
    fn test_connection_string_parsing() {
        let conn = HostConnection::from_string("backup@10.0.0.5:2200").unwrap();
        assert_eq!(conn.hostname, "10.0.0.5");
        assert_eq!(conn.username, "backup");
        assert_eq!(conn.port, 2200);

        let conn = HostConnection::from_string("host2").unwrap();
        assert_eq!(conn.username, "root");
        assert_eq!(conn.port, 22);

        assert!(HostConnection::from_string("host2:notaport").is_err());
    }
}
