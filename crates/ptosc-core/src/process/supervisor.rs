//! Supervises external tool runs.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use super::parser::{LineSplitter, OutputParser, Statistics};
use super::{ChildHandle, ProcessSpawner, SpawnRequest, PASSWORD_ENV};
use crate::cache::BinaryCache;
use crate::error::ExternalToolError;
use crate::options::{ProgressCallback, StatisticsCallback, DEFAULT_MAX_BUFFER};

/// Log target for lines echoed from the tool.
pub const TOOL_LOG_TARGET: &str = "ptosc::tool";

const READ_CHUNK: usize = 8 * 1024;

/// One run of the external tool.
#[derive(Clone)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Handed to the child through `MYSQL_PWD`, never on the command line.
    pub password: Option<String>,
    /// Ceiling on combined stdout and stderr bytes.
    pub max_buffer: usize,
    pub on_progress: Option<ProgressCallback>,
    pub on_statistics: Option<StatisticsCallback>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            password: None,
            max_buffer: DEFAULT_MAX_BUFFER,
            on_progress: None,
            on_statistics: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    pub fn with_callbacks(
        mut self,
        on_progress: Option<ProgressCallback>,
        on_statistics: Option<StatisticsCallback>,
    ) -> Self {
        self.on_progress = on_progress;
        self.on_statistics = on_statistics;
        self
    }

    /// The command line as it would be typed, for logs. Arguments containing
    /// whitespace are double-quoted.
    pub fn printable(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().map(|a| {
                if a.chars().any(char::is_whitespace) {
                    format!("\"{a}\"")
                } else {
                    a.clone()
                }
            }))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    /// Exit code; always `Some(0)` for a returned result.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub statistics: Statistics,
}

/// Per-pipe streaming state.
#[derive(Default)]
struct Stream {
    splitter: LineSplitter,
    captured: Vec<u8>,
    open: bool,
}

impl Stream {
    fn open() -> Self {
        Self {
            open: true,
            ..Default::default()
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.captured).into_owned()
    }
}

#[derive(Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

/// Resolves and runs pt-online-schema-change.
#[derive(Clone)]
pub struct ProcessSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    binaries: Arc<BinaryCache>,
}

impl ProcessSupervisor {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, binaries: Arc<BinaryCache>) -> Self {
        Self { spawner, binaries }
    }

    /// Resolve a logical binary name to a path.
    ///
    /// The lookup happens once per name; a failed lookup is remembered and
    /// fails every later call without searching again.
    pub fn resolve_binary(&self, name: &str) -> Result<PathBuf, ExternalToolError> {
        let resolved = self
            .binaries
            .get_or_try_insert_with(name.to_string(), || {
                let found = self.spawner.locate_executable(name);
                debug!(binary = name, found = ?found, "resolved tool binary");
                Ok::<_, Infallible>(found)
            })
            .unwrap_or_else(|never| match never {});

        resolved.ok_or_else(|| ExternalToolError::BinaryNotFound {
            name: name.to_string(),
        })
    }

    /// Run the tool to completion, streaming and parsing both pipes.
    pub async fn run(&self, invocation: &ToolInvocation) -> Result<ProcessResult, ExternalToolError> {
        let mut env = Vec::new();
        if let Some(password) = &invocation.password {
            env.push((PASSWORD_ENV.to_string(), password.clone()));
        }
        let request = SpawnRequest {
            program: invocation.program.clone(),
            args: invocation.args.clone(),
            env,
        };

        info!(command = %invocation.printable(), "running pt-online-schema-change");

        let mut process = self.spawner.spawn(&request).map_err(|source| {
            error!(path = %invocation.program.display(), error = %source, "failed to spawn tool");
            ExternalToolError::SpawnFailure {
                path: invocation.program.clone(),
                source,
            }
        })?;

        let mut parser = OutputParser::new(invocation.on_progress.clone(), invocation.on_statistics.clone());
        let mut out = Stream::open();
        let mut err = Stream::open();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut total = 0usize;

        while out.open || err.open {
            let (pipe, read) = tokio::select! {
                r = process.stdout.read(&mut out_buf), if out.open => (Pipe::Stdout, r),
                r = process.stderr.read(&mut err_buf), if err.open => (Pipe::Stderr, r),
            };
            let (stream, buf) = match pipe {
                Pipe::Stdout => (&mut out, &out_buf),
                Pipe::Stderr => (&mut err, &err_buf),
            };

            let n = match read {
                Ok(n) => n,
                Err(source) => {
                    kill_quietly(&mut process.child, &invocation.program).await;
                    return Err(ExternalToolError::Io {
                        path: invocation.program.clone(),
                        source,
                    });
                }
            };

            if n == 0 {
                stream.open = false;
                if let Some(line) = stream.splitter.finish() {
                    emit_line(pipe, &line, &mut parser);
                }
                continue;
            }

            total += n;
            stream.captured.extend_from_slice(&buf[..n]);
            if total > invocation.max_buffer {
                warn!(limit = invocation.max_buffer, "tool output exceeded maxBuffer, terminating");
                kill_quietly(&mut process.child, &invocation.program).await;
                return Err(ExternalToolError::BufferExceeded {
                    limit: invocation.max_buffer,
                    stdout: out.text(),
                    stderr: err.text(),
                });
            }
            for line in stream.splitter.push(&buf[..n]) {
                emit_line(pipe, &line, &mut parser);
            }
        }

        let status = process.child.wait().await.map_err(|source| ExternalToolError::Io {
            path: invocation.program.clone(),
            source,
        })?;

        if status != Some(0) {
            error!(code = ?status, "pt-online-schema-change failed");
            return Err(ExternalToolError::NonZeroExit {
                code: status,
                stdout: out.text(),
                stderr: err.text(),
            });
        }

        Ok(ProcessResult {
            status,
            stdout: out.text(),
            stderr: err.text(),
            statistics: parser.into_statistics(),
        })
    }
}

fn emit_line(pipe: Pipe, line: &str, parser: &mut OutputParser) {
    match pipe {
        Pipe::Stdout => info!(target: TOOL_LOG_TARGET, "{line}"),
        Pipe::Stderr => warn!(target: TOOL_LOG_TARGET, "{line}"),
    }
    parser.handle_line(line);
}

async fn kill_quietly(child: &mut Box<dyn ChildHandle>, program: &Path) {
    if let Err(e) = child.kill().await {
        warn!(path = %program.display(), error = %e, "failed to kill tool process");
    }
}
