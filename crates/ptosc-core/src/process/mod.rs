//! External tool process management.
//!
//! The engine never shells out. [`ProcessSpawner`] is the OS capability it
//! consumes (spawn with an argument vector and environment, locate an
//! executable), and [`ProcessSupervisor`] drives it: resolving the binary,
//! streaming both pipes through the [`OutputParser`] and enforcing the
//! output ceiling.

pub mod args;
pub mod parser;
pub mod supervisor;

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub use args::{build_tool_args, Phase, ToolTarget};
pub use parser::{LineSplitter, OutputParser, Progress, Statistics};
pub use supervisor::{ProcessResult, ProcessSupervisor, ToolInvocation};

/// Environment variable the tool reads the password from.
pub const PASSWORD_ENV: &str = "MYSQL_PWD";

/// A process to start.
#[derive(Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
}

impl std::fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("SpawnRequest")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .finish()
    }
}

/// Handle on a running child.
#[async_trait]
pub trait ChildHandle: Send {
    /// Wait for exit. `None` means the process was terminated by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Terminate the process.
    async fn kill(&mut self) -> io::Result<()>;
}

/// A started process: its two output pipes and its handle.
pub struct SpawnedProcess {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub child: Box<dyn ChildHandle>,
}

/// The OS process capability.
pub trait ProcessSpawner: Send + Sync {
    /// Start a process with piped stdout and stderr and no stdin.
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess>;

    /// Find an executable by name or path.
    fn locate_executable(&self, name: &str) -> Option<PathBuf>;
}

/// Spawner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

struct TokioChild(tokio::process::Child);

#[async_trait]
impl ChildHandle for TokioChild {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.kill().await
    }
}

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        let mut child = tokio::process::Command::new(&request.program)
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stderr not captured"))?;

        Ok(SpawnedProcess {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            child: Box::new(TokioChild(child)),
        })
    }

    fn locate_executable(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }
        let candidate = Path::new(name);
        if candidate.components().count() > 1 || candidate.is_absolute() {
            return is_executable(candidate).then(|| candidate.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(name))
            .find(|p| is_executable(p))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
