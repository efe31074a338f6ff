//! Input validation and sanitization for everything that reaches a shell
//!
//! Pure functions over strings: each returns the canonical input or a
//! Validation error carrying the field name and reason. No I/O, no state.

use regex::Regex;
use std::sync::LazyLock;
use transdock_common::{Error, Result};

pub const MAX_DATASET_NAME_LENGTH: usize = 256;
pub const MAX_SNAPSHOT_SUFFIX_LENGTH: usize = 256;
pub const MAX_HOSTNAME_LENGTH: usize = 253;
pub const MAX_USERNAME_LENGTH: usize = 32;
pub const MAX_PATH_LENGTH: usize = 1024;

static DATASET_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-.]*(/[A-Za-z0-9][A-Za-z0-9_\-.]*)*$").unwrap()
});

static USERNAME_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]*$").unwrap());

static DOMAIN_LABEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?$").unwrap());

static IPV6_CHARS_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F:]+$").unwrap());

static SIZE_PROPERTY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[BKMGTPEZ]?$").unwrap());

/// Characters that terminate or rewrite a shell command
const DANGEROUS_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '\\', '<', '>', '\n', '\r',
];

/// Property names the API will pass to `zfs set`
const VALID_ZFS_PROPERTIES: &[&str] = &[
    "compression",
    "dedup",
    "encryption",
    "keyformat",
    "keylocation",
    "mountpoint",
    "quota",
    "reservation",
    "recordsize",
    "atime",
    "relatime",
    "checksum",
    "copies",
    "readonly",
    "canmount",
    "devices",
    "exec",
    "setuid",
    "nbmand",
    "overlay",
    "acltype",
    "aclinherit",
    "dnodesize",
    "logbias",
    "primarycache",
    "secondarycache",
    "sync",
    "redundant_metadata",
    "special_small_blocks",
];

const VALID_COMPRESSION_VALUES: &[&str] = &[
    "on", "off", "lzjb", "gzip", "gzip-1", "gzip-2", "gzip-3", "gzip-4", "gzip-5", "gzip-6",
    "gzip-7", "gzip-8", "gzip-9", "lz4", "zle", "zstd",
];

const VALID_ENCRYPTION_VALUES: &[&str] = &[
    "on",
    "off",
    "aes-128-ccm",
    "aes-192-ccm",
    "aes-256-ccm",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
];

fn contains_dangerous(input: &str) -> bool {
    input.chars().any(|c| DANGEROUS_CHARS.contains(&c)) || input.contains("../")
}

/// Validate a dataset name for format compliance and shell safety.
pub fn validate_dataset_name(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(Error::validation("dataset", "dataset name cannot be empty"));
    }
    if name.len() > MAX_DATASET_NAME_LENGTH {
        return Err(Error::validation(
            "dataset",
            format!("dataset name too long (max {} characters)", MAX_DATASET_NAME_LENGTH),
        ));
    }
    if contains_dangerous(name) {
        return Err(Error::validation(
            "dataset",
            format!("dataset name contains dangerous characters: {}", name),
        ));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::validation(
            "dataset",
            "dataset name cannot start or end with '/'",
        ));
    }
    if name.contains("//") {
        return Err(Error::validation(
            "dataset",
            "dataset name cannot contain consecutive slashes",
        ));
    }
    if !DATASET_NAME_REGEX.is_match(name) {
        return Err(Error::validation(
            "dataset",
            format!("invalid dataset name format: {}", name),
        ));
    }
    Ok(name)
}

/// Validate a full snapshot name (`dataset@suffix`).
pub fn validate_snapshot_name(name: &str) -> Result<&str> {
    let (dataset_part, snapshot_part) = name.rsplit_once('@').ok_or_else(|| {
        Error::validation("snapshot", "snapshot name must contain '@' separator")
    })?;

    validate_dataset_name(dataset_part)?;

    if snapshot_part.is_empty() {
        return Err(Error::validation("snapshot", "snapshot suffix cannot be empty"));
    }
    if snapshot_part.contains('@') {
        return Err(Error::validation(
            "snapshot",
            "snapshot name must contain exactly one '@'",
        ));
    }
    if snapshot_part.len() > MAX_SNAPSHOT_SUFFIX_LENGTH {
        return Err(Error::validation(
            "snapshot",
            format!(
                "snapshot suffix too long (max {} characters)",
                MAX_SNAPSHOT_SUFFIX_LENGTH
            ),
        ));
    }
    if contains_dangerous(snapshot_part) {
        return Err(Error::validation(
            "snapshot",
            format!("snapshot name contains dangerous characters: {}", name),
        ));
    }
    Ok(name)
}

/// Validate the suffix half of a snapshot name on its own.
pub fn validate_snapshot_suffix(suffix: &str) -> Result<&str> {
    if suffix.is_empty() {
        return Err(Error::validation("snapshot", "snapshot suffix cannot be empty"));
    }
    if suffix.len() > MAX_SNAPSHOT_SUFFIX_LENGTH {
        return Err(Error::validation(
            "snapshot",
            format!(
                "snapshot suffix too long (max {} characters)",
                MAX_SNAPSHOT_SUFFIX_LENGTH
            ),
        ));
    }
    if suffix.contains('@') || contains_dangerous(suffix) {
        return Err(Error::validation(
            "snapshot",
            format!("snapshot suffix contains dangerous characters: {}", suffix),
        ));
    }
    Ok(suffix)
}

/// Validate a hostname: IPv4, IPv6 or RFC-1123 domain.
pub fn validate_hostname(hostname: &str) -> Result<&str> {
    if hostname.is_empty() {
        return Err(Error::validation("hostname", "hostname cannot be empty"));
    }
    if hostname.len() > MAX_HOSTNAME_LENGTH {
        return Err(Error::validation(
            "hostname",
            format!("hostname too long (max {} characters)", MAX_HOSTNAME_LENGTH),
        ));
    }
    if is_valid_ipv4(hostname) || is_valid_ipv6(hostname) || is_valid_domain(hostname) {
        Ok(hostname)
    } else {
        Err(Error::validation(
            "hostname",
            format!("invalid hostname format: {}", hostname),
        ))
    }
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
    ip.matches(':').count() >= 2 && ip.matches("::").count() <= 1 && IPV6_CHARS_REGEX.is_match(ip)
}

fn is_valid_domain(domain: &str) -> bool {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if domain.is_empty() {
        return false;
    }
    domain
        .split('.')
        .all(|label| !label.is_empty() && label.len() <= 63 && DOMAIN_LABEL_REGEX.is_match(label))
}

/// Validate a Unix username.
pub fn validate_username(username: &str) -> Result<&str> {
    if username.is_empty() {
        return Err(Error::validation("username", "username cannot be empty"));
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err(Error::validation(
            "username",
            format!("username too long (max {} characters)", MAX_USERNAME_LENGTH),
        ));
    }
    if !USERNAME_REGEX.is_match(username) {
        return Err(Error::validation(
            "username",
            format!("invalid username format: {}", username),
        ));
    }
    Ok(username)
}

/// Validate a TCP port number.
pub fn validate_port(port: u32) -> Result<u16> {
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(Error::validation(
            "port",
            format!("port must be between 1 and 65535, got: {}", port),
        ))
    }
}

/// Validate an absolute filesystem path.
pub fn validate_path(path: &str) -> Result<&str> {
    if path.is_empty() {
        return Err(Error::validation("path", "path cannot be empty"));
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(Error::validation(
            "path",
            format!("path too long (max {} characters)", MAX_PATH_LENGTH),
        ));
    }
    if path.contains("..") {
        return Err(Error::validation("path", "path cannot contain '..'"));
    }
    if contains_dangerous(path) || path.contains('\0') {
        return Err(Error::validation(
            "path",
            format!("path contains dangerous characters: {}", path),
        ));
    }
    if !path.starts_with('/') {
        return Err(Error::validation("path", "path must be absolute (start with /)"));
    }
    Ok(path)
}

/// Validate a ZFS property name and value pair.
pub fn validate_zfs_property<'a>(name: &'a str, value: &'a str) -> Result<(&'a str, &'a str)> {
    if !VALID_ZFS_PROPERTIES.contains(&name) {
        return Err(Error::validation(
            "property",
            format!("invalid ZFS property: {}", name),
        ));
    }
    if contains_dangerous(value) {
        return Err(Error::validation(
            "property",
            format!("property value contains dangerous characters: {}", value),
        ));
    }

    match name {
        "compression" => {
            if !VALID_COMPRESSION_VALUES.contains(&value) {
                return Err(Error::validation(
                    "property",
                    format!("invalid compression value: {}", value),
                ));
            }
        }
        "encryption" => {
            if !VALID_ENCRYPTION_VALUES.contains(&value) {
                return Err(Error::validation(
                    "property",
                    format!("invalid encryption value: {}", value),
                ));
            }
        }
        "quota" | "reservation" => {
            let upper = value.to_uppercase();
            if !SIZE_PROPERTY_REGEX.is_match(&upper) && value != "none" && value != "0" {
                return Err(Error::validation(
                    "property",
                    format!("invalid size value: {}", value),
                ));
            }
        }
        _ => {}
    }

    Ok((name, value))
}

/// Escape a string for inclusion in a shell argument position.
///
/// Wraps in single quotes; embedded single quotes become `'"'"'`.
pub fn escape_shell_argument(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}
