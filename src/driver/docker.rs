//! # Docker CLI driver
//!
//! Implements [`ContainerDriver`] by invoking the runtime CLI (`docker` by
//! default; any CLI with the same verbs, such as `podman`, works).
//!
//! | Operation          | Invocation                                             |
//! |--------------------|--------------------------------------------------------|
//! | `check_available`  | `docker version --format {{.Server.Version}}`          |
//! | `build_image`      | `docker build --rm --progress=plain -t <tag> <ctx>`    |
//! | `container_exists` | `docker container inspect --format {{.Id}} <name>`     |
//! | `run_container`    | `docker run -d --name <name> ... <image> <cmd...>`     |
//! | `stop_container`   | `docker stop <name>`                                   |
//! | `remove_container` | `docker rm [-f] <name>`                                |
//!
//! Arguments are passed as an argv vector, never through a shell. Names and
//! image references are validated before they reach the command line.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{ContainerDriver, ContainerName, ContainerSpec, ImageBuild};
use crate::config::OrchestratorConfig;
use crate::constants::validate_image_ref;
use crate::error::{Error, Result};

/// Timeout for short inspection commands.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum bytes of stderr quoted in an error message.
const MAX_ERROR_OUTPUT: usize = 4096;

/// Container runtime driven through its CLI.
#[derive(Debug, Clone)]
pub struct DockerDriver {
    binary: String,
    build_timeout: Duration,
    run_timeout: Duration,
    stop_timeout: Duration,
}

impl DockerDriver {
    /// Creates a driver using the binary and deadlines from `config`.
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            binary: config.runtime_binary.clone(),
            build_timeout: config.build_timeout(),
            run_timeout: config.run_timeout(),
            stop_timeout: config.stop_timeout(),
        }
    }

    /// Builds the argv for `docker run` from a container spec.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.to_string(),
        ];
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for opt in &spec.security_opts {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }
        for cap in &spec.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Runs the CLI to completion and returns its output.
    async fn command(&self, args: &[String], deadline: Duration) -> Result<std::process::Output> {
        debug!("runtime command: {} {}", self.binary, args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        timeout(deadline, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or("")),
                duration: deadline,
            })?
            .map_err(|e| self.unavailable(e))
    }

    fn unavailable(&self, e: std::io::Error) -> Error {
        Error::RuntimeUnavailable {
            runtime: self.binary.clone(),
            reason: e.to_string(),
        }
    }

    /// Runs a build, collecting stdout and stderr lines as they arrive.
    async fn stream_build(&self, args: &[String], tag: &str) -> Result<ImageBuild> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.unavailable(e))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Error::RuntimeUnavailable {
                runtime: self.binary.clone(),
                reason: "build output pipes unavailable".to_string(),
            });
        };

        let mut log_lines = Vec::new();
        let collect = async {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let (mut out_done, mut err_done) = (false, false);
            while !(out_done && err_done) {
                tokio::select! {
                    line = out.next_line(), if !out_done => match line? {
                        Some(line) => push_line(&mut log_lines, line),
                        None => out_done = true,
                    },
                    line = err.next_line(), if !err_done => match line? {
                        Some(line) => push_line(&mut log_lines, line),
                        None => err_done = true,
                    },
                }
            }
            child.wait().await
        };

        let status = match timeout(self.build_timeout, collect).await {
            Ok(status) => status?,
            Err(_) => {
                return Err(Error::BuildFailed {
                    image: tag.to_string(),
                    reason: format!("build timed out after {:?}", self.build_timeout),
                    logs: log_lines,
                });
            }
        };

        if !status.success() {
            return Err(Error::BuildFailed {
                image: tag.to_string(),
                reason: format!("build exited with {}", status),
                logs: log_lines,
            });
        }
        Ok(ImageBuild { log_lines })
    }
}

fn push_line(lines: &mut Vec<String>, line: String) {
    let line = line.trim();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
}

fn stderr_text(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if text.len() > MAX_ERROR_OUTPUT {
        let mut cut = MAX_ERROR_OUTPUT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn check_available(&self) -> Result<()> {
        let args = ["version", "--format", "{{.Server.Version}}"].map(String::from);
        let output = self.command(&args, INSPECT_TIMEOUT).await?;
        if output.status.success() {
            let version = String::from_utf8_lossy(&output.stdout);
            info!("{} runtime available (server {})", self.binary, version.trim());
            Ok(())
        } else {
            Err(Error::RuntimeUnavailable {
                runtime: self.binary.clone(),
                reason: stderr_text(&output),
            })
        }
    }

    async fn build_image(&self, context: &Path, tag: &str) -> Result<ImageBuild> {
        validate_image_ref(tag).map_err(|reason| Error::BuildFailed {
            image: tag.to_string(),
            reason: reason.to_string(),
            logs: Vec::new(),
        })?;

        let args = vec![
            "build".to_string(),
            "--rm".to_string(),
            "--progress=plain".to_string(),
            "-t".to_string(),
            tag.to_string(),
            context.to_string_lossy().into_owned(),
        ];
        info!(image = tag, "building image");
        let build = self.stream_build(&args, tag).await?;
        info!(image = tag, lines = build.log_lines.len(), "image built");
        Ok(build)
    }

    async fn container_exists(&self, name: &ContainerName) -> Result<bool> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            name.to_string(),
        ];
        let output = self.command(&args, INSPECT_TIMEOUT).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = stderr_text(&output);
        if is_missing(&stderr) {
            Ok(false)
        } else {
            Err(Error::RuntimeUnavailable {
                runtime: self.binary.clone(),
                reason: stderr,
            })
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        validate_image_ref(&spec.image).map_err(|reason| Error::RunFailed {
            container: spec.name.to_string(),
            reason: reason.to_string(),
        })?;

        let output = self.command(&Self::run_args(spec), self.run_timeout).await?;
        if !output.status.success() {
            return Err(Error::RunFailed {
                container: spec.name.to_string(),
                reason: stderr_text(&output),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(container = %spec.name, id = %id, "container started");
        Ok(id)
    }

    async fn stop_container(&self, name: &ContainerName) -> Result<()> {
        let args = vec!["stop".to_string(), name.to_string()];
        let output = self.command(&args, self.stop_timeout).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_text(&output);
        if is_missing(&stderr) {
            Err(Error::ContainerNotFound(name.to_string()))
        } else {
            Err(Error::StopFailed {
                container: name.to_string(),
                reason: stderr,
            })
        }
    }

    async fn remove_container(&self, name: &ContainerName, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());

        let output = self.command(&args, self.stop_timeout).await?;
        if output.status.success() {
            debug!(container = %name, force, "container removed");
            return Ok(());
        }
        let stderr = stderr_text(&output);
        if is_missing(&stderr) {
            warn!(container = %name, "container vanished before removal");
            Err(Error::ContainerNotFound(name.to_string()))
        } else {
            Err(Error::StopFailed {
                container: name.to_string(),
                reason: stderr,
            })
        }
    }
}
