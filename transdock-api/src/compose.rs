//! Compose stack client
//!
//! Inspects compose files (services, bind mounts, networks) and drives
//! `docker compose` on the local host or over SSH on a remote host. The
//! orchestrator depends only on the `ComposeClient` trait.

use crate::executor::CommandExecutor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};
use transdock_common::values::{HostConnection, SshConfig};
use transdock_common::{Error, Result};

/// One service entry of a compose stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeService {
    pub name: String,
    pub image: Option<String>,
    pub volumes: Vec<VolumeBinding>,
    pub depends_on: Vec<String>,
}

/// A volume entry attached to a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeBinding {
    /// Host path for bind mounts, volume name otherwise
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub is_bind: bool,
}

/// A parsed compose stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeStack {
    pub name: String,
    pub path: String,
    pub services: Vec<ComposeService>,
    pub volumes: Vec<String>,
    pub external_volumes: Vec<String>,
    pub networks: Vec<String>,
}

impl ComposeStack {
    /// Absolute host paths bound into containers, deduplicated.
    pub fn data_directories(&self) -> Vec<String> {
        let mut dirs = BTreeSet::new();
        for service in &self.services {
            for volume in &service.volumes {
                if volume.is_bind && volume.source.starts_with('/') {
                    dirs.insert(volume.source.clone());
                }
            }
        }
        dirs.into_iter().collect()
    }
}

/// Migration-relevant complexity of a stack
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StackComplexity {
    Simple,
    Complex,
}

/// Prerequisite check outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackValidation {
    pub valid: bool,
    pub complexity: StackComplexity,
    pub external_volumes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reported state of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: String,
}

/// A stack known to the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSummary {
    pub name: String,
    pub status: String,
    pub config_files: String,
}

/// Interface the orchestrator consumes.
#[async_trait]
pub trait ComposeClient: Send + Sync {
    async fn inspect(&self, compose_path: &str) -> Result<ComposeStack>;
    /// Raw compose file text plus the sibling `.env`, when present.
    async fn read_compose_content(&self, compose_path: &str) -> Result<(String, Option<String>)>;
    async fn validate_prerequisites(&self, compose_path: &str) -> Result<StackValidation>;
    async fn stop(&self, compose_path: &str, host: Option<&HostConnection>) -> Result<()>;
    async fn start(&self, compose_path: &str, host: Option<&HostConnection>) -> Result<()>;
    async fn down(
        &self,
        compose_path: &str,
        remove_volumes: bool,
        host: Option<&HostConnection>,
    ) -> Result<()>;
    async fn status(
        &self,
        compose_path: &str,
        host: Option<&HostConnection>,
    ) -> Result<Vec<ServiceStatus>>;
    async fn list_stacks(&self, host: Option<&HostConnection>) -> Result<Vec<StackSummary>>;

    async fn find_by_path(
        &self,
        compose_path: &str,
        host: Option<&HostConnection>,
    ) -> Result<Option<StackSummary>> {
        let stacks = self.list_stacks(host).await?;
        Ok(stacks
            .into_iter()
            .find(|s| s.config_files.split(',').any(|f| f.trim() == compose_path)))
    }

    async fn find_by_name(
        &self,
        name: &str,
        host: Option<&HostConnection>,
    ) -> Result<Option<StackSummary>> {
        let stacks = self.list_stacks(host).await?;
        Ok(stacks.into_iter().find(|s| s.name == name))
    }
}

/// Compose client backed by the `docker compose` CLI.
///
/// Remote operations go through the executor's SSH path so both halves of a
/// migration use the same host-key discipline.
pub struct DockerComposeClient {
    executor: Arc<dyn CommandExecutor>,
}

const COMPOSE_FILE_CANDIDATES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

impl DockerComposeClient {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Resolve a stack path (directory or file) to the compose file.
    pub fn resolve_compose_file(compose_path: &str) -> Result<PathBuf> {
        let path = Path::new(compose_path);
        if path.extension().map_or(false, |e| e == "yml" || e == "yaml") {
            return Ok(path.to_path_buf());
        }
        for candidate in COMPOSE_FILE_CANDIDATES {
            let candidate_path = path.join(candidate);
            if candidate_path.exists() {
                return Ok(candidate_path);
            }
        }
        Err(Error::NotFound(format!(
            "no compose file found under {}",
            compose_path
        )))
    }

    async fn run_compose(
        &self,
        compose_path: &str,
        args: &[&str],
        host: Option<&HostConnection>,
    ) -> Result<String> {
        match host.filter(|h| !h.is_localhost()) {
            Some(host) => {
                let mut command = vec!["docker", "compose", "-f", compose_path];
                command.extend_from_slice(args);
                let ssh_config = SshConfig::from_host(host);
                let result = self
                    .executor
                    .execute_remote(&host.hostname, &command, &ssh_config, false)
                    .await?;
                if !result.success {
                    return Err(Error::Remote {
                        host: host.hostname.clone(),
                        exit_code: Some(result.exit_code),
                        message: format!("docker compose {} failed: {}", args.join(" "), result.stderr),
                    });
                }
                Ok(result.stdout)
            }
            None => {
                let output = Command::new("docker")
                    .arg("compose")
                    .arg("-f")
                    .arg(compose_path)
                    .args(args)
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| Error::Operation(format!("failed to run docker compose: {}", e)))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(Error::Operation(format!(
                        "docker compose {} failed: {}",
                        args.join(" "),
                        stderr.trim()
                    )));
                }
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
        }
    }
}

#[async_trait]
impl ComposeClient for DockerComposeClient {
    async fn inspect(&self, compose_path: &str) -> Result<ComposeStack> {
        let file = Self::resolve_compose_file(compose_path)?;
        let content = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| Error::Operation(format!("cannot read {}: {}", file.display(), e)))?;

        let stack_dir = file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/"));
        parse_compose(&content, compose_path, &stack_dir)
    }

    async fn read_compose_content(&self, compose_path: &str) -> Result<(String, Option<String>)> {
        let file = Self::resolve_compose_file(compose_path)?;
        let content = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| Error::Operation(format!("cannot read {}: {}", file.display(), e)))?;

        let env_content = match file.parent().map(|p| p.join(".env")) {
            Some(path) if path.exists() => Some(
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| Error::Operation(format!("cannot read .env: {}", e)))?,
            ),
            _ => None,
        };
        Ok((content, env_content))
    }

    async fn validate_prerequisites(&self, compose_path: &str) -> Result<StackValidation> {
        let stack = match self.inspect(compose_path).await {
            Ok(stack) => stack,
            Err(e) => {
                return Ok(StackValidation {
                    valid: false,
                    complexity: StackComplexity::Simple,
                    external_volumes: false,
                    error: Some(e.to_string()),
                })
            }
        };

        if stack.services.is_empty() {
            return Ok(StackValidation {
                valid: false,
                complexity: StackComplexity::Simple,
                external_volumes: false,
                error: Some("compose file defines no services".to_string()),
            });
        }

        let complexity = if stack.services.len() > 3 || stack.networks.len() > 1 {
            StackComplexity::Complex
        } else {
            StackComplexity::Simple
        };

        Ok(StackValidation {
            valid: true,
            complexity,
            external_volumes: !stack.external_volumes.is_empty(),
            error: None,
        })
    }

    async fn stop(&self, compose_path: &str, host: Option<&HostConnection>) -> Result<()> {
        info!("Stopping compose stack: {}", compose_path);
        self.run_compose(compose_path, &["stop"], host).await?;
        Ok(())
    }

    async fn start(&self, compose_path: &str, host: Option<&HostConnection>) -> Result<()> {
        info!("Starting compose stack: {}", compose_path);
        self.run_compose(compose_path, &["up", "-d"], host).await?;
        Ok(())
    }

    async fn down(
        &self,
        compose_path: &str,
        remove_volumes: bool,
        host: Option<&HostConnection>,
    ) -> Result<()> {
        info!(
            "Bringing down compose stack: {} (remove_volumes={})",
            compose_path, remove_volumes
        );
        let mut args = vec!["down"];
        if remove_volumes {
            args.push("-v");
        }
        self.run_compose(compose_path, &args, host).await?;
        Ok(())
    }

    async fn status(
        &self,
        compose_path: &str,
        host: Option<&HostConnection>,
    ) -> Result<Vec<ServiceStatus>> {
        let output = self
            .run_compose(compose_path, &["ps", "-a", "--format", "json"], host)
            .await?;
        Ok(parse_ps_output(&output))
    }

    async fn list_stacks(&self, host: Option<&HostConnection>) -> Result<Vec<StackSummary>> {
        let output = match host.filter(|h| !h.is_localhost()) {
            Some(host) => {
                let ssh_config = SshConfig::from_host(host);
                let result = self
                    .executor
                    .execute_remote(
                        &host.hostname,
                        &["docker", "compose", "ls", "--format", "json"],
                        &ssh_config,
                        false,
                    )
                    .await?;
                if !result.success {
                    return Err(Error::Remote {
                        host: host.hostname.clone(),
                        exit_code: Some(result.exit_code),
                        message: format!("docker compose ls failed: {}", result.stderr),
                    });
                }
                result.stdout
            }
            None => {
                let output = Command::new("docker")
                    .args(["compose", "ls", "--format", "json"])
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| Error::Operation(format!("failed to run docker compose: {}", e)))?;
                if !output.status.success() {
                    return Err(Error::Operation(format!(
                        "docker compose ls failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                String::from_utf8_lossy(&output.stdout).to_string()
            }
        };

        parse_ls_output(&output)
    }
}

// Wire shapes of the compose YAML, kept permissive: unknown keys are
// ignored and service volumes accept both string and map forms.

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: std::collections::BTreeMap<String, ComposeServiceDef>,
    #[serde(default)]
    volumes: std::collections::BTreeMap<String, Option<NamedVolumeDef>>,
    #[serde(default)]
    networks: std::collections::BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct ComposeServiceDef {
    image: Option<String>,
    #[serde(default)]
    volumes: Vec<VolumeEntry>,
    #[serde(default)]
    depends_on: DependsOn,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VolumeEntry {
    Short(String),
    Long {
        #[serde(rename = "type")]
        kind: Option<String>,
        source: Option<String>,
        target: Option<String>,
        #[serde(default)]
        read_only: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum DependsOn {
    #[default]
    None,
    List(Vec<String>),
    Map(std::collections::BTreeMap<String, serde_yaml::Value>),
}

#[derive(Debug, Deserialize)]
struct NamedVolumeDef {
    #[serde(default)]
    external: bool,
}

fn parse_compose(content: &str, compose_path: &str, stack_dir: &Path) -> Result<ComposeStack> {
    let file: ComposeFile = serde_yaml::from_str(content)
        .map_err(|e| Error::Parse(format!("invalid compose file {}: {}", compose_path, e)))?;

    let named_volumes: Vec<String> = file.volumes.keys().cloned().collect();
    let external_volumes: Vec<String> = file
        .volumes
        .iter()
        .filter(|(_, def)| def.as_ref().map(|d| d.external).unwrap_or(false))
        .map(|(name, _)| name.clone())
        .collect();

    let mut services = Vec::new();
    for (name, def) in file.services {
        let mut volumes = Vec::new();
        for entry in &def.volumes {
            match parse_volume_entry(entry, stack_dir, &named_volumes) {
                Some(binding) => volumes.push(binding),
                None => warn!("Skipping unparseable volume entry in service {}", name),
            }
        }
        let depends_on = match &def.depends_on {
            DependsOn::None => Vec::new(),
            DependsOn::List(list) => list.clone(),
            DependsOn::Map(map) => map.keys().cloned().collect(),
        };
        services.push(ComposeService {
            name,
            image: def.image,
            volumes,
            depends_on,
        });
    }

    let stack_name = stack_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "stack".to_string());

    Ok(ComposeStack {
        name: stack_name,
        path: compose_path.to_string(),
        services,
        volumes: named_volumes,
        external_volumes,
        networks: file.networks.keys().cloned().collect(),
    })
}

fn parse_volume_entry(
    entry: &VolumeEntry,
    stack_dir: &Path,
    named_volumes: &[String],
) -> Option<VolumeBinding> {
    match entry {
        VolumeEntry::Short(spec) => {
            let parts: Vec<&str> = spec.split(':').collect();
            match parts.len() {
                // Anonymous volume, no host side.
                1 => Some(VolumeBinding {
                    source: String::new(),
                    target: parts[0].to_string(),
                    read_only: false,
                    is_bind: false,
                }),
                2 | 3 => {
                    let source = resolve_source(parts[0], stack_dir);
                    let is_bind = !named_volumes.contains(&parts[0].to_string())
                        && (source.starts_with('/') || parts[0].starts_with('.'));
                    Some(VolumeBinding {
                        source,
                        target: parts[1].to_string(),
                        read_only: parts.get(2).map_or(false, |m| m.contains("ro")),
                        is_bind,
                    })
                }
                _ => None,
            }
        }
        VolumeEntry::Long {
            kind,
            source,
            target,
            read_only,
        } => {
            let source_str = source.clone().unwrap_or_default();
            let is_bind = kind.as_deref() == Some("bind");
            Some(VolumeBinding {
                source: if is_bind {
                    resolve_source(&source_str, stack_dir)
                } else {
                    source_str
                },
                target: target.clone().unwrap_or_default(),
                read_only: *read_only,
                is_bind,
            })
        }
    }
}

fn resolve_source(source: &str, stack_dir: &Path) -> String {
    if let Some(rest) = source.strip_prefix("./") {
        return stack_dir.join(rest).to_string_lossy().to_string();
    }
    if source == "." {
        return stack_dir.to_string_lossy().to_string();
    }
    source.to_string()
}

/// `docker compose ps --format json` emits one JSON object per line.
fn parse_ps_output(output: &str) -> Vec<ServiceStatus> {
    #[derive(Deserialize)]
    struct PsEntry {
        #[serde(rename = "Service", default)]
        service: String,
        #[serde(rename = "Name", default)]
        name: String,
        #[serde(rename = "State", default)]
        state: String,
    }

    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<PsEntry>(line) {
            Ok(entry) => Some(ServiceStatus {
                name: if entry.service.is_empty() {
                    entry.name
                } else {
                    entry.service
                },
                state: entry.state,
            }),
            Err(e) => {
                warn!("Skipping unparseable compose ps line: {}", e);
                None
            }
        })
        .collect()
}

/// `docker compose ls --format json` emits a JSON array (newer releases) or
/// one object per line (older ones); accept both.
fn parse_ls_output(output: &str) -> Result<Vec<StackSummary>> {
    #[derive(Deserialize)]
    struct LsEntry {
        #[serde(rename = "Name", default)]
        name: String,
        #[serde(rename = "Status", default)]
        status: String,
        #[serde(rename = "ConfigFiles", default)]
        config_files: String,
    }

    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<LsEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| Error::Parse(format!("invalid compose ls output: {}", e)))?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    };

    Ok(entries
        .into_iter()
        .map(|e| StackSummary {
            name: e.name,
            status: e.status,
            config_files: e.config_files,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPOSE_FIXTURE: &str = r#"
services:
  web:
    image: nginx:1.27
    volumes:
      - /srv/app/static:/usr/share/nginx/html:ro
      - ./conf:/etc/nginx/conf.d
    depends_on:
      - db
  db:
    image: postgres:16
    volumes:
      - /srv/app/pgdata:/var/lib/postgresql/data
      - pgbackups:/backups
volumes:
  pgbackups:
  shared:
    external: true
networks:
  frontend:
"#;

    #[test]
    fn test_parse_compose() {
        let stack = parse_compose(COMPOSE_FIXTURE, "/apps/app", Path::new("/apps/app")).unwrap();
        assert_eq!(stack.name, "app");
        assert_eq!(stack.services.len(), 2);
        assert_eq!(stack.volumes.len(), 2);
        assert_eq!(stack.external_volumes, vec!["shared"]);
        assert_eq!(stack.networks, vec!["frontend"]);

        let web = stack.services.iter().find(|s| s.name == "web").unwrap();
        assert_eq!(web.depends_on, vec!["db"]);
        assert!(web.volumes[0].read_only);
    }

    #[test]
    fn test_data_directories() {
        let stack = parse_compose(COMPOSE_FIXTURE, "/apps/app", Path::new("/apps/app")).unwrap();
        let dirs = stack.data_directories();
        assert_eq!(
            dirs,
            vec![
                "/apps/app/conf".to_string(),
                "/srv/app/pgdata".to_string(),
                "/srv/app/static".to_string(),
            ]
        );
    }

    #[test]
    fn test_empty_stack_has_no_data_directories() {
        let stack = parse_compose("services: {}\n", "/apps/empty", Path::new("/apps/empty")).unwrap();
        assert!(stack.services.is_empty());
        assert!(stack.data_directories().is_empty());
    }

    #[test]
    fn test_named_volume_is_not_a_bind() {
        let yaml = "services:\n  db:\n    image: postgres\n    volumes:\n      - data:/var/lib/postgresql/data\nvolumes:\n  data:\n";
        let stack = parse_compose(yaml, "/apps/db", Path::new("/apps/db")).unwrap();
        assert!(stack.data_directories().is_empty());
    }

    #[test]
    fn test_parse_ps_output() {
        let output = r#"{"Service":"web","Name":"app-web-1","State":"running"}
{"Service":"db","Name":"app-db-1","State":"exited"}
not json
"#;
        let statuses = parse_ps_output(output);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].name, "web");
        assert_eq!(statuses[0].state, "running");
        assert_eq!(statuses[1].state, "exited");
    }

    #[test]
    fn test_parse_ls_output_array_and_lines() {
        let array = r#"[{"Name":"app","Status":"running(2)","ConfigFiles":"/apps/app/docker-compose.yml"}]"#;
        let stacks = parse_ls_output(array).unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].name, "app");

        let lines = "{\"Name\":\"one\",\"Status\":\"running(1)\",\"ConfigFiles\":\"/a.yml\"}\n{\"Name\":\"two\",\"Status\":\"exited\",\"ConfigFiles\":\"/b.yml\"}\n";
        let stacks = parse_ls_output(lines).unwrap();
        assert_eq!(stacks.len(), 2);

        assert!(parse_ls_output("").unwrap().is_empty());
    }

    #[test]
    fn test_long_volume_syntax() {
        let yaml = r#"
services:
  app:
    image: app:latest
    volumes:
      - type: bind
        source: /srv/app/data
        target: /data
      - type: volume
        source: cache
        target: /cache
"#;
        let stack = parse_compose(yaml, "/apps/app", Path::new("/apps/app")).unwrap();
        assert_eq!(stack.data_directories(), vec!["/srv/app/data".to_string()]);
    }
}
