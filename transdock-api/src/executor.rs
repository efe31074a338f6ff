//! Allow-listed subprocess execution
//!
//! Every external program TransDock runs goes through this module: local
//! `zfs`/`zpool` calls, rsync, and SSH-wrapped remote commands. Commands are
//! always executed as program + argument vector, never via a shell.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use transdock_common::values::SshConfig;
use transdock_common::{Error, Result};

/// Captured outcome of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandResult {
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

/// ZFS subcommands the executor will run.
const ALLOWED_ZFS_COMMANDS: &[&str] = &[
    "list",
    "get",
    "set",
    "create",
    "destroy",
    "snapshot",
    "clone",
    "send",
    "receive",
    "rollback",
    "promote",
    "rename",
    "mount",
    "unmount",
    "share",
    "unshare",
    "diff",
    "bookmark",
    "holds",
    "release",
    "userspace",
    "groupspace",
    "projectspace",
];

/// System programs the executor will run. `find` and `cat` are restricted
/// read-only helpers for kstat sampling.
const ALLOWED_SYSTEM_COMMANDS: &[&str] =
    &["zpool", "zfs", "ssh", "rsync", "pv", "mbuffer", "find", "cat"];

/// Soft cap on captured stream size.
const CAPTURE_CAP_BYTES: usize = 1024 * 1024;

/// Exit code reported for timed-out commands, matching coreutils `timeout`.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Interface the services depend on; a stub implementation drives the tests.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `zfs <subcmd> <args…>` locally.
    async fn execute_zfs(&self, subcmd: &str, args: &[&str]) -> Result<CommandResult>;

    /// Run an allow-listed system program locally.
    async fn execute_system(&self, cmd: &str, args: &[&str]) -> Result<CommandResult>;

    /// Run a command on a remote host over SSH with strict host key checking.
    ///
    /// Unknown hosts fail with a Remote error naming the known_hosts file
    /// unless `auto_accept_hostkey` is set, in which case the key is fetched
    /// via ssh-keyscan and appended.
    async fn execute_remote(
        &self,
        host: &str,
        command: &[&str],
        ssh_config: &SshConfig,
        auto_accept_hostkey: bool,
    ) -> Result<CommandResult>;

    /// Pipe a local producer's stdout into a command on the remote host
    /// (`zfs send | ssh … zfs receive`). When `host` is localhost the
    /// consumer runs locally without SSH.
    async fn pipe_to_remote(
        &self,
        host: &str,
        producer: &[&str],
        remote_cmd: &[&str],
        ssh_config: &SshConfig,
        auto_accept_hostkey: bool,
    ) -> Result<CommandResult>;

    /// Write content to a file on the host, creating the parent directory.
    /// Local for localhost, `cat > path` over SSH stdin otherwise.
    async fn write_file(
        &self,
        host: &str,
        path: &str,
        content: &str,
        ssh_config: &SshConfig,
        auto_accept_hostkey: bool,
    ) -> Result<()>;
}

/// Concrete executor backed by tokio subprocesses.
pub struct SystemCommandExecutor {
    timeout: Duration,
    known_hosts_file: PathBuf,
}

impl SystemCommandExecutor {
    pub fn new(timeout_secs: u64, known_hosts_file: PathBuf) -> Result<Self> {
        let executor = Self {
            timeout: Duration::from_secs(timeout_secs),
            known_hosts_file,
        };
        executor.ensure_ssh_directory()?;
        Ok(executor)
    }

    pub fn known_hosts_file(&self) -> &Path {
        &self.known_hosts_file
    }

    /// Ensure the SSH directory and known_hosts file exist with 0700/0600.
    fn ensure_ssh_directory(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(dir) = self.known_hosts_file.parent() {
            std::fs::create_dir_all(dir)?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }

        if !self.known_hosts_file.exists() {
            std::fs::write(&self.known_hosts_file, "")?;
            info!("Created known_hosts file: {}", self.known_hosts_file.display());
        }
        std::fs::set_permissions(
            &self.known_hosts_file,
            std::fs::Permissions::from_mode(0o600),
        )?;

        Ok(())
    }

    /// Check whether a host appears in the known_hosts file.
    fn is_host_known(&self, host: &str, port: u16) -> bool {
        let content = match std::fs::read_to_string(&self.known_hosts_file) {
            Ok(content) => content,
            Err(_) => return false,
        };

        let patterns = if port == 22 {
            vec![host.to_string()]
        } else {
            vec![
                host.to_string(),
                format!("[{}]:{}", host, port),
                format!("{}:{}", host, port),
            ]
        };

        content.lines().any(|line| {
            let hosts_field = line.split_whitespace().next().unwrap_or("");
            hosts_field
                .split(',')
                .any(|entry| patterns.iter().any(|p| entry == p))
        })
    }

    /// Fetch a host's public key via ssh-keyscan.
    async fn scan_host_key(&self, host: &str, port: u16) -> Result<String> {
        let port_str = port.to_string();
        let result = self
            .run(&["ssh-keyscan", "-p", &port_str, host], None)
            .await;

        if result.success && !result.stdout.trim().is_empty() {
            Ok(result.stdout.trim().to_string())
        } else {
            Err(Error::Remote {
                host: host.to_string(),
                exit_code: Some(result.exit_code),
                message: format!("failed to retrieve host key for {}:{}", host, port),
            })
        }
    }

    /// Append a host key to known_hosts. The full key block is written with
    /// a single write so concurrent appends cannot interleave.
    async fn add_host_key(&self, host: &str, port: u16) -> Result<()> {
        if self.is_host_known(host, port) {
            return Ok(());
        }

        let key = self.scan_host_key(host, port).await?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.known_hosts_file)?;
        file.write_all(format!("{}\n", key).as_bytes())?;

        info!("Added host key for {}:{} to known_hosts", host, port);
        Ok(())
    }

    /// Build the ssh argv wrapping a remote command.
    fn build_ssh_command(&self, host: &str, command: &[&str], ssh_config: &SshConfig) -> Vec<String> {
        let mut ssh_cmd: Vec<String> = vec![
            "ssh".into(),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            format!("UserKnownHostsFile={}", self.known_hosts_file.display()),
            "-o".into(),
            format!("ConnectTimeout={}", ssh_config.timeout_secs),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "PasswordAuthentication=no".into(),
            "-p".into(),
            ssh_config.port.to_string(),
            "-l".into(),
            ssh_config.user.clone(),
        ];

        if let Some(key_file) = &ssh_config.key_file {
            ssh_cmd.push("-i".into());
            ssh_cmd.push(key_file.clone());
        }

        ssh_cmd.push(host.to_string());
        ssh_cmd.extend(command.iter().map(|s| s.to_string()));
        ssh_cmd
    }

    /// Refuse or auto-accept an unknown host before spawning ssh.
    async fn check_host_key(
        &self,
        host: &str,
        ssh_config: &SshConfig,
        auto_accept_hostkey: bool,
    ) -> Result<()> {
        if self.is_host_known(host, ssh_config.port) {
            return Ok(());
        }

        warn!("Host {}:{} is not in known_hosts", host, ssh_config.port);

        if auto_accept_hostkey {
            self.add_host_key(host, ssh_config.port).await
        } else {
            Err(Error::Remote {
                host: host.to_string(),
                exit_code: None,
                message: format!(
                    "host {}:{} is not in known_hosts ({}); add the host key manually \
                     or retry with auto_accept_hostkey enabled",
                    host,
                    ssh_config.port,
                    self.known_hosts_file.display()
                ),
            })
        }
    }

    /// Spawn one process and capture its output, enforcing the timeout.
    async fn run(&self, command: &[&str], timeout: Option<Duration>) -> CommandResult {
        debug!("Executing command: {}", command.join(" "));

        let mut cmd = Command::new(command[0]);
        cmd.args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandResult::failure(1, format!("failed to spawn {}: {}", command[0], e))
            }
        };

        let timeout = timeout.unwrap_or(self.timeout);
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(1);
                let result = CommandResult {
                    exit_code,
                    stdout: cap_capture(&output.stdout),
                    stderr: cap_capture(&output.stderr),
                    success: output.status.success(),
                };
                if !result.success {
                    warn!(
                        "Command failed with exit code {}: {}",
                        result.exit_code, result.stderr
                    );
                }
                result
            }
            Ok(Err(e)) => CommandResult::failure(1, format!("command execution failed: {}", e)),
            // Dropping the future kills the child via kill_on_drop.
            Err(_) => CommandResult::failure(
                TIMEOUT_EXIT_CODE,
                format!("command timed out after {} seconds", timeout.as_secs()),
            ),
        }
    }

    /// Spawn producer | consumer with producer stdout fed into consumer
    /// stdin. No per-call timeout: transfers are bounded by the migration's
    /// global timeout, and dropping the future kills both children.
    async fn run_piped(&self, producer: &[&str], consumer: &[&str]) -> CommandResult {
        debug!(
            "Executing pipeline: {} | {}",
            producer.join(" "),
            consumer.join(" ")
        );

        let mut producer_child = match Command::new(producer[0])
            .args(&producer[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return CommandResult::failure(1, format!("failed to spawn {}: {}", producer[0], e))
            }
        };

        let producer_stdout = match producer_child.stdout.take() {
            Some(stdout) => stdout,
            None => return CommandResult::failure(1, "producer stdout unavailable".to_string()),
        };
        let stdin_for_consumer: Stdio = match producer_stdout.try_into() {
            Ok(stdio) => stdio,
            Err(e) => {
                return CommandResult::failure(1, format!("failed to connect pipeline: {}", e))
            }
        };

        let consumer_child = match Command::new(consumer[0])
            .args(&consumer[1..])
            .stdin(stdin_for_consumer)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return CommandResult::failure(1, format!("failed to spawn {}: {}", consumer[0], e))
            }
        };

        let (producer_status, consumer_output) =
            tokio::join!(producer_child.wait(), consumer_child.wait_with_output());

        let consumer_output = match consumer_output {
            Ok(output) => output,
            Err(e) => return CommandResult::failure(1, format!("pipeline wait failed: {}", e)),
        };

        let producer_failed = match producer_status {
            Ok(status) => !status.success(),
            Err(_) => true,
        };

        let exit_code = consumer_output.status.code().unwrap_or(1);
        let success = consumer_output.status.success() && !producer_failed;
        let mut stderr = cap_capture(&consumer_output.stderr);
        if producer_failed {
            stderr = format!("{} exited unsuccessfully; {}", producer[0], stderr);
        }

        CommandResult {
            exit_code: if success { 0 } else { exit_code.max(1) },
            stdout: cap_capture(&consumer_output.stdout),
            stderr,
            success,
        }
    }
}

fn cap_capture(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() > CAPTURE_CAP_BYTES {
        let mut truncated: String = text.chars().take(CAPTURE_CAP_BYTES).collect();
        truncated.push_str("\n[output truncated]");
        truncated
    } else {
        text.trim().to_string()
    }
}

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn execute_zfs(&self, subcmd: &str, args: &[&str]) -> Result<CommandResult> {
        if !ALLOWED_ZFS_COMMANDS.contains(&subcmd) {
            return Ok(CommandResult::failure(
                1,
                format!("ZFS command '{}' not allowed", subcmd),
            ));
        }

        let mut command = vec!["zfs", subcmd];
        command.extend_from_slice(args);
        Ok(self.run(&command, None).await)
    }

    async fn execute_system(&self, cmd: &str, args: &[&str]) -> Result<CommandResult> {
        if !ALLOWED_SYSTEM_COMMANDS.contains(&cmd) {
            return Ok(CommandResult::failure(
                1,
                format!("system command '{}' not allowed", cmd),
            ));
        }

        let mut command = vec![cmd];
        command.extend_from_slice(args);
        Ok(self.run(&command, None).await)
    }

    async fn execute_remote(
        &self,
        host: &str,
        command: &[&str],
        ssh_config: &SshConfig,
        auto_accept_hostkey: bool,
    ) -> Result<CommandResult> {
        self.check_host_key(host, ssh_config, auto_accept_hostkey)
            .await?;

        let ssh_cmd = self.build_ssh_command(host, command, ssh_config);
        let argv: Vec<&str> = ssh_cmd.iter().map(|s| s.as_str()).collect();
        let ssh_timeout = Duration::from_secs(ssh_config.timeout_secs.max(1));
        Ok(self.run(&argv, Some(ssh_timeout + self.timeout)).await)
    }

    async fn pipe_to_remote(
        &self,
        host: &str,
        producer: &[&str],
        remote_cmd: &[&str],
        ssh_config: &SshConfig,
        auto_accept_hostkey: bool,
    ) -> Result<CommandResult> {
        if producer.is_empty() || remote_cmd.is_empty() {
            return Err(Error::Operation("empty pipeline command".to_string()));
        }
        if !ALLOWED_SYSTEM_COMMANDS.contains(&producer[0]) {
            return Ok(CommandResult::failure(
                1,
                format!("system command '{}' not allowed", producer[0]),
            ));
        }
        if !ALLOWED_SYSTEM_COMMANDS.contains(&remote_cmd[0]) {
            return Ok(CommandResult::failure(
                1,
                format!("system command '{}' not allowed", remote_cmd[0]),
            ));
        }

        let is_local = matches!(host.to_lowercase().as_str(), "localhost" | "127.0.0.1" | "::1");
        if is_local {
            return Ok(self.run_piped(producer, remote_cmd).await);
        }

        self.check_host_key(host, ssh_config, auto_accept_hostkey)
            .await?;
        let ssh_cmd = self.build_ssh_command(host, remote_cmd, ssh_config);
        let consumer: Vec<&str> = ssh_cmd.iter().map(|s| s.as_str()).collect();
        Ok(self.run_piped(producer, &consumer).await)
    }

    async fn write_file(
        &self,
        host: &str,
        path: &str,
        content: &str,
        ssh_config: &SshConfig,
        auto_accept_hostkey: bool,
    ) -> Result<()> {
        crate::validation::validate_path(path)?;

        let is_local = matches!(host.to_lowercase().as_str(), "localhost" | "127.0.0.1" | "::1");
        if is_local {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, content).await?;
            return Ok(());
        }

        self.check_host_key(host, ssh_config, auto_accept_hostkey)
            .await?;

        if let Some(parent) = Path::new(path).parent() {
            let parent = parent.to_string_lossy();
            let mkdir = self
                .run_ssh(host, &["mkdir", "-p", &parent], ssh_config)
                .await;
            if !mkdir.success {
                return Err(Error::Remote {
                    host: host.to_string(),
                    exit_code: Some(mkdir.exit_code),
                    message: format!("failed to create {}: {}", parent, mkdir.stderr),
                });
            }
        }

        // The remote side runs through a shell, so the path is escaped.
        let redirect = format!("cat > {}", crate::validation::escape_shell_argument(path));
        let ssh_cmd = self.build_ssh_command(host, &[&redirect], ssh_config);

        let mut cmd = Command::new(&ssh_cmd[0]);
        cmd.args(&ssh_cmd[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            drop(stdin);
        }

        let output = tokio::time::timeout(
            Duration::from_secs(ssh_config.timeout_secs.max(1) + 30),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| Error::Timeout(format!("writing {} on {}", path, host)))??;

        if !output.status.success() {
            return Err(Error::Remote {
                host: host.to_string(),
                exit_code: output.status.code(),
                message: format!(
                    "failed to write {}: {}",
                    path,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl SystemCommandExecutor {
    /// Run an ssh-wrapped command without the public entry points' host-key
    /// re-checks (callers have already verified the host).
    async fn run_ssh(&self, host: &str, command: &[&str], ssh_config: &SshConfig) -> CommandResult {
        let ssh_cmd = self.build_ssh_command(host, command, ssh_config);
        let argv: Vec<&str> = ssh_cmd.iter().map(|s| s.as_str()).collect();
        let ssh_timeout = Duration::from_secs(ssh_config.timeout_secs.max(1));
        self.run(&argv, Some(ssh_timeout + self.timeout)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor_with_tempdir() -> (SystemCommandExecutor, TempDir) {
        let dir = TempDir::new().unwrap();
        let known_hosts = dir.path().join("ssh").join("known_hosts");
        let executor = SystemCommandExecutor::new(5, known_hosts).unwrap();
        (executor, dir)
    }

    #[tokio::test]
    async fn test_zfs_allow_list_rejects_without_spawn() {
        let (executor, _dir) = executor_with_tempdir();

        let result = executor.execute_zfs("version", &[]).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("not allowed"));

        let result = executor.execute_zfs("upgrade", &["-a"]).await.unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("not allowed"));
    }

    #[tokio::test]
    async fn test_system_allow_list() {
        let (executor, _dir) = executor_with_tempdir();

        let result = executor.execute_system("bash", &["-c", "true"]).await.unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("not allowed"));

        let result = executor.execute_system("rm", &["-rf", "/"]).await.unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("not allowed"));
    }

    #[tokio::test]
    async fn test_unknown_host_refused_without_auto_accept() {
        let (executor, _dir) = executor_with_tempdir();

        let err = executor
            .execute_remote(
                "new.example",
                &["zfs", "list"],
                &SshConfig::default(),
                false,
            )
            .await
            .unwrap_err();

        match err {
            Error::Remote { host, message, .. } => {
                assert_eq!(host, "new.example");
                assert!(message.contains("known_hosts"));
            }
            other => panic!("expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_known_host_forms() {
        let (executor, _dir) = executor_with_tempdir();

        std::fs::write(
            executor.known_hosts_file(),
            "host1.example ssh-ed25519 AAAA...\n[host2.example]:2222 ssh-ed25519 BBBB...\n",
        )
        .unwrap();

        assert!(executor.is_host_known("host1.example", 22));
        assert!(executor.is_host_known("host2.example", 2222));
        assert!(!executor.is_host_known("host2.example", 22));
        assert!(!executor.is_host_known("other.example", 22));
    }

    #[tokio::test]
    async fn test_known_hosts_file_created_with_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (executor, _dir) = executor_with_tempdir();

        let meta = std::fs::metadata(executor.known_hosts_file()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let dir_meta = std::fs::metadata(executor.known_hosts_file().parent().unwrap()).unwrap();
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_pipe_rejects_disallowed_commands() {
        let (executor, _dir) = executor_with_tempdir();

        let result = executor
            .pipe_to_remote(
                "localhost",
                &["tar", "c", "/data"],
                &["zfs", "receive", "tank/data"],
                &SshConfig::default(),
                false,
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("not allowed"));
    }

    #[test]
    fn test_ssh_command_shape() {
        let (executor, _dir) = executor_with_tempdir();
        let config = SshConfig {
            user: "deploy".to_string(),
            port: 2200,
            key_file: Some("/root/.ssh/id_ed25519".to_string()),
            timeout_secs: 10,
        };

        let cmd = executor.build_ssh_command("host2", &["zfs", "list"], &config);
        assert_eq!(cmd[0], "ssh");
        assert!(cmd.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(cmd.contains(&"BatchMode=yes".to_string()));
        assert!(cmd.contains(&"PasswordAuthentication=no".to_string()));
        assert!(cmd.iter().any(|a| a.starts_with("UserKnownHostsFile=")));
        assert!(cmd.contains(&"-i".to_string()));
        assert!(cmd.contains(&"2200".to_string()));
        assert!(cmd.contains(&"deploy".to_string()));
        // Remote command comes last, after the host.
        let host_pos = cmd.iter().position(|a| a == "host2").unwrap();
        assert_eq!(&cmd[host_pos + 1..], &["zfs", "list"]);
    }

    #[test]
    fn test_capture_cap() {
        let big = vec![b'x'; CAPTURE_CAP_BYTES + 10];
        let capped = cap_capture(&big);
        assert!(capped.ends_with("[output truncated]"));
    }
}
