//! External process execution and output staging shared by the tool adapters.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AdapterError;
use crate::job::Stage;

/// Bytes of stderr kept on failure.
const STDERR_TAIL_BYTES: usize = 4096;

/// Upper bound for `--help`/`-v` style probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Read buffer for checksums.
const CHECKSUM_BUFFER_SIZE: usize = 64 * 1024;

/// A command line for an external tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    /// Tool name used in errors and logs.
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, OsString)>,
}

impl ToolCommand {
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_os_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, e: std::io::Error) -> AdapterError {
        if e.kind() == std::io::ErrorKind::NotFound {
            AdapterError::ToolNotFound {
                tool: self.tool.clone(),
                path: self.program.clone(),
            }
        } else {
            AdapterError::Io(e)
        }
    }
}

/// Captured output of a finished tool.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `command` to completion, bounded by `deadline` and `cancel`.
///
/// The child is killed when the deadline passes or the token fires. A
/// non-zero exit becomes [`AdapterError::ExternalTool`].
pub async fn run_tool(
    command: &ToolCommand,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<ToolOutput, AdapterError> {
    let budget = deadline.saturating_duration_since(Instant::now());
    debug!(
        "Running {} {:?} (budget {} ms)",
        command.tool,
        command.args,
        budget.as_millis()
    );

    let child = command
        .command()
        .spawn()
        .map_err(|e| command.spawn_error(e))?;

    // Dropping the pending wait drops the child, and kill_on_drop reaps it.
    let output = tokio::select! {
        result = child.wait_with_output() => result?,
        _ = tokio::time::sleep_until(deadline) => {
            warn!("{} exceeded its deadline, killing", command.tool);
            return Err(AdapterError::Timeout {
                tool: command.tool.clone(),
                timeout_ms: budget.as_millis() as u64,
            });
        }
        _ = cancel.cancelled() => {
            debug!("{} cancelled, killing", command.tool);
            return Err(AdapterError::Cancelled);
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(AdapterError::ExternalTool {
            tool: command.tool.clone(),
            exit_code: output.status.code(),
            stderr: Some(tail(&stderr, STDERR_TAIL_BYTES).to_string()),
        });
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Starts the tool with probe arguments and accepts any of `accepted_codes`.
pub async fn probe_tool(
    command: &ToolCommand,
    accepted_codes: &[i32],
) -> Result<(), AdapterError> {
    let output = tokio::time::timeout(PROBE_TIMEOUT, command.command().output())
        .await
        .map_err(|_| AdapterError::Timeout {
            tool: command.tool.clone(),
            timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
        })?
        .map_err(|e| command.spawn_error(e))?;

    match output.status.code() {
        Some(code) if accepted_codes.contains(&code) => Ok(()),
        code => Err(AdapterError::ExternalTool {
            tool: command.tool.clone(),
            exit_code: code,
            stderr: Some(
                tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_BYTES).to_string(),
            ),
        }),
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Scratch directory that becomes a stage's published output on success.
///
/// Lives next to its final location so publishing is a single rename.
/// Dropped without [`StagingDir::publish`], it is removed.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    job_dir: PathBuf,
    published: bool,
}

impl StagingDir {
    pub async fn create(job_dir: &Path) -> Result<Self, AdapterError> {
        let path = job_dir.join(format!(".staging-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&path).await?;
        Ok(Self {
            path,
            job_dir: job_dir.to_path_buf(),
            published: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically moves the staged output to `<job_dir>/<stage>-<attempt>-<id>`.
    pub async fn publish(mut self, stage: Stage, attempt: u32) -> Result<PathBuf, AdapterError> {
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let destination = self
            .job_dir
            .join(format!("{}-{}-{}", stage, attempt, &short_id[..8]));
        fs::rename(&self.path, &destination).await?;
        self.published = true;
        Ok(destination)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.published {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove staging dir {:?}: {}", self.path, e);
                }
            }
        }
    }
}

/// SHA-256 of a file, lowercase hex.
pub async fn sha256_file(path: &Path) -> Result<String, AdapterError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::with_capacity(CHECKSUM_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; CHECKSUM_BUFFER_SIZE];
    let mut hasher = Sha256::new();

    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Paths relative to `dir` of every regular file below it, sorted.
pub async fn list_files(dir: &Path) -> Result<Vec<String>, AdapterError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                files.push(relative.display().to_string());
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_run_tool_captures_stdout() {
        let command = ToolCommand::new("sh", "sh").args(["-c", "echo Saving: /tmp/a.nii"]);
        let output = run_tool(&command, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.stdout.contains("Saving: /tmp/a.nii"));
    }

    #[tokio::test]
    async fn test_run_tool_passes_env() {
        let command = ToolCommand::new("sh", "sh")
            .args(["-c", "echo $TOTALSPINESEG_DATA"])
            .env("TOTALSPINESEG_DATA", "/models");
        let output = run_tool(&command, far_deadline(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "/models");
    }

    #[tokio::test]
    async fn test_run_tool_nonzero_exit() {
        let command = ToolCommand::new("sh", "sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = run_tool(&command, far_deadline(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        match err {
            AdapterError::ExternalTool { stderr, .. } => {
                assert_eq!(stderr.unwrap().trim(), "broken");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_tool_missing_binary() {
        let command = ToolCommand::new("dcm2niix", "/nonexistent/dcm2niix");
        let err = run_tool(&command, far_deadline(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_run_tool_deadline() {
        let command = ToolCommand::new("sleep", "sleep").arg("10");
        let started = std::time::Instant::now();
        let err = run_tool(
            &command,
            Instant::now() + Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_tool_cancel() {
        let command = ToolCommand::new("sleep", "sleep").arg("10");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = run_tool(&command, far_deadline(), &cancel).await.unwrap_err();
        assert!(matches!(err, AdapterError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_probe_tool_accepts_codes() {
        let command = ToolCommand::new("sh", "sh").args(["-c", "exit 1"]);
        assert!(probe_tool(&command, &[0, 1]).await.is_ok());
        assert!(probe_tool(&command, &[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_staging_publish() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingDir::create(dir.path()).await.unwrap();
        fs::write(staging.path().join("volume.nii"), b"data")
            .await
            .unwrap();

        let published = staging.publish(Stage::Preprocess, 1).await.unwrap();
        assert!(published.join("volume.nii").exists());
        let name = published.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("preprocess-1-"));
    }

    #[tokio::test]
    async fn test_staging_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let staging = StagingDir::create(dir.path()).await.unwrap();
            fs::write(staging.path().join("partial.nii"), b"half")
                .await
                .unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, b"hello").await.unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_list_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("step2_output"))
            .await
            .unwrap();
        fs::write(dir.path().join("step2_output/seg.nii.gz"), b"x")
            .await
            .unwrap();
        fs::write(dir.path().join("log.txt"), b"x").await.unwrap();

        let files = list_files(dir.path()).await.unwrap();
        assert_eq!(files, vec!["log.txt", "step2_output/seg.nii.gz"]);
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
