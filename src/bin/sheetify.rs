//! sheetify - tool packaging and lifecycle CLI
//!
//! Validates tool uploads, renders build contexts and drives a single tool
//! through build, run and stop against the local container runtime.
//!
//! ## Usage
//!
//! ```sh
//! sheetify validate <file>
//! sheetify context <file> <dir>
//! sheetify deploy <file> [--name <name>]
//! sheetify stop <tool-id>
//! ```
//!
//! ## Configuration
//!
//! `SHEETIFY_CONFIG` points at an optional JSON configuration file. The
//! variables listed in [`sheetify::config`] override individual fields.
//! `RUST_LOG` controls log verbosity (default `info`).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use sheetify::{
    DockerDriver, MemoryStore, Orchestrator, OrchestratorConfig, OrchestrationClient, OwnerId,
    QueueDispatcher, RunStatus, ToolId, ToolStatus, ContainerDriver,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// =============================================================================
// Constants
// =============================================================================

/// Owner recorded for tools created from the command line.
const LOCAL_OWNER: OwnerId = OwnerId(1);

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Validate { file: PathBuf },
    Context { file: PathBuf, dir: PathBuf },
    Deploy { file: PathBuf, name: Option<String> },
    Stop { tool_id: ToolId },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "validate" => {
            if args.len() < 3 {
                return Err("validate requires <file>".to_string());
            }
            Ok(Command::Validate {
                file: PathBuf::from(&args[2]),
            })
        }
        "context" => {
            if args.len() < 4 {
                return Err("context requires <file> <dir>".to_string());
            }
            Ok(Command::Context {
                file: PathBuf::from(&args[2]),
                dir: PathBuf::from(&args[3]),
            })
        }
        "deploy" => {
            if args.len() < 3 {
                return Err("deploy requires <file>".to_string());
            }
            let file = PathBuf::from(&args[2]);
            let mut name = None;
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--name" | "-n" => {
                        if i + 1 < args.len() {
                            name = Some(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--name requires a value".to_string());
                        }
                    }
                    _ => i += 1,
                }
            }
            Ok(Command::Deploy { file, name })
        }
        "stop" => {
            if args.len() < 3 {
                return Err("stop requires <tool-id>".to_string());
            }
            let tool_id = args[2]
                .parse()
                .map_err(|e| format!("invalid tool id '{}': {}", args[2], e))?;
            Ok(Command::Stop { tool_id })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn load_config() -> Result<OrchestratorConfig, String> {
    let path = std::env::var_os("SHEETIFY_CONFIG").map(PathBuf::from);
    OrchestratorConfig::load(path.as_deref()).map_err(|e| e.to_string())
}

fn read_upload(file: &Path) -> Result<(String, Vec<u8>), String> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("invalid file name: {}", file.display()))?
        .to_string();
    let data = std::fs::read(file).map_err(|e| format!("read {}: {}", file.display(), e))?;
    Ok((filename, data))
}

fn package(file: &Path, config: &OrchestratorConfig) -> Result<sheetify::PackagedSource, String> {
    let (filename, data) = read_upload(file)?;
    sheetify::packaging::validate_with_limit(&filename, &data, config.max_upload_bytes)
        .map_err(|e| e.to_string())
}

// =============================================================================
// Command Implementations
// =============================================================================

fn cmd_validate(file: PathBuf) -> Result<(), String> {
    let config = load_config()?;
    let packaged = package(&file, &config)?;
    println!("digest:   {}", packaged.digest());
    println!("manifest: {:?}", packaged.manifest_origin);
    for requirement in packaged.requirements() {
        println!("  {}", requirement);
    }
    Ok(())
}

fn cmd_context(file: PathBuf, dir: PathBuf) -> Result<(), String> {
    let config = load_config()?;
    let packaged = package(&file, &config)?;
    std::fs::create_dir_all(&dir).map_err(|e| format!("create {}: {}", dir.display(), e))?;
    sheetify::context::write_context(&dir, &config.base_image, &packaged.source, &packaged.manifest)
        .map_err(|e| e.to_string())?;
    eprintln!("Wrote build context to {}", dir.display());
    Ok(())
}

async fn cmd_deploy(file: PathBuf, name: Option<String>) -> Result<(), String> {
    let config = Arc::new(load_config()?);
    let driver = Arc::new(DockerDriver::new(&config));
    driver.check_available().await.map_err(|e| e.to_string())?;

    let (filename, data) = read_upload(&file)?;
    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.clone())
    });

    let (dispatcher, mut queue) = QueueDispatcher::new();
    let orchestrator = Orchestrator::new(
        Arc::clone(&config),
        Arc::new(MemoryStore::new()),
        driver,
        Arc::new(dispatcher),
    );
    let err = |e: sheetify::Error| e.to_string();

    let tool = orchestrator.create_tool(LOCAL_OWNER, &name, None).await.map_err(err)?;
    let version = orchestrator
        .upload_version(LOCAL_OWNER, tool.id, &filename, &data, None)
        .await
        .map_err(err)?;
    eprintln!("Uploaded {} as tool {} version {}", filename, tool.id, version.id);

    orchestrator
        .request_build(LOCAL_OWNER, tool.id, Some(version.id))
        .await
        .map_err(err)?;
    queue.run_pending(&orchestrator, config.max_job_attempts).await;

    let detail = orchestrator.tool_detail(LOCAL_OWNER, tool.id).await.map_err(err)?;
    if detail.tool.status != ToolStatus::Idle {
        if let Some(build) = detail.versions.iter().flat_map(|v| v.builds.iter()).last() {
            eprintln!("{}", build.logs);
        }
        return Err(format!("build failed (tool status {})", detail.tool.status));
    }
    eprintln!(
        "Built {}",
        detail.tool.current_image_ref.as_deref().unwrap_or_default()
    );

    orchestrator.request_run(LOCAL_OWNER, tool.id).await.map_err(err)?;
    queue.run_pending(&orchestrator, config.max_job_attempts).await;

    let detail = orchestrator.tool_detail(LOCAL_OWNER, tool.id).await.map_err(err)?;
    match detail.runs.last() {
        Some(run) if run.status == RunStatus::Running => {
            println!("{}", run.url.as_deref().unwrap_or_default());
            Ok(())
        }
        Some(run) => Err(format!("run failed: {}", run.logs)),
        None => Err("run was not recorded".to_string()),
    }
}

async fn cmd_stop(tool_id: ToolId) -> Result<(), String> {
    let config = Arc::new(load_config()?);
    let driver = Arc::new(DockerDriver::new(&config));
    let client = OrchestrationClient::new(driver, config);
    client.stop(tool_id).await.map_err(|e| e.to_string())?;
    eprintln!("Stopped tool {}", tool_id);
    Ok(())
}

fn cmd_version() {
    println!("sheetify version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"sheetify - package data-analysis scripts as routed web tools

USAGE:
    sheetify <command> [options]

COMMANDS:
    validate <file>              Check an upload and print its manifest
    context <file> <dir>         Write the image build context to <dir>
    deploy <file> [--name <n>]   Build and run an upload on the local runtime
    stop <tool-id>               Stop and remove a tool's container
    version                      Show version info
    help                         Show this help

UPLOADS:
    app.py, or a .zip / .tar / .tar.gz archive containing app.py and an
    optional requirements.txt

ENVIRONMENT:
    SHEETIFY_CONFIG        JSON configuration file
    SHEETIFY_RUNTIME       Container runtime CLI (default: docker)
    SHEETIFY_BASE_IMAGE    Base image for tool images
    TRAEFIK_NETWORK        Routing network (empty disables)
    TRAEFIK_ENTRYPOINT     Reverse-proxy entrypoint
    RUST_LOG               Log filter (default: info)

EXAMPLES:
    sheetify validate app.py
    sheetify deploy explorer.zip --name explorer
    sheetify stop 1
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match parse_args() {
        Ok(cmd) => {
            let result = match cmd {
                Command::Validate { file } => cmd_validate(file),
                Command::Context { file, dir } => cmd_context(file, dir),
                Command::Deploy { file, name } => cmd_deploy(file, name).await,
                Command::Stop { tool_id } => cmd_stop(tool_id).await,
                Command::Version => {
                    cmd_version();
                    Ok(())
                }
                Command::Help => {
                    cmd_help();
                    Ok(())
                }
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
