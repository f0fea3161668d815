use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cli::args::{ConfigAction, ConfigArgs, ExecArgs, InitArgs, OutputFormat};
use crate::config::loader::{get_config_path, to_toml, write_default_config};
use crate::config::CodeletConfig;
use crate::envelope::{Envelope, ExecutionResult};
use crate::error::{CodeletError, Result};
use crate::sandbox::{Capability, SandboxBackend, V8Backend};
use crate::server::{self, AppState};
use crate::validate::{validate, ExecutionRequest};

// ============================================================================
// Service
// ============================================================================

pub async fn serve(config: CodeletConfig) -> Result<()> {
    config.policy.check()?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        timeout_ms = config.policy.timeout_ms,
        max_code_length = config.policy.max_code_length,
        network = config.policy.grants(Capability::Network),
        "Starting code executor"
    );

    let listener = server::bind(&config.server.host, config.server.port).await?;
    let policy = Arc::new(config.policy);
    let backend: Arc<dyn SandboxBackend> = Arc::new(V8Backend::new(Arc::clone(&policy)));

    if !backend.health_check().await {
        warn!(backend = backend.name(), "Sandbox health check failed");
    }

    server::serve(listener, AppState::new(backend, policy)).await
}

// ============================================================================
// One-shot execution
// ============================================================================

pub async fn exec(args: ExecArgs, config: CodeletConfig, format: OutputFormat) -> Result<()> {
    let source = read_source(&args)?;
    info!(
        code_chars = source.chars().count(),
        remote = ?args.remote,
        "Executing snippet"
    );

    let envelope = match &args.remote {
        Some(base) => remote_execute(base, &source).await?,
        None => local_execute(&source, config).await,
    };

    output_envelope(&envelope, format);
    Ok(())
}

fn read_source(args: &ExecArgs) -> Result<String> {
    if let Some(path) = &args.file {
        return Ok(std::fs::read_to_string(path)?);
    }
    match args.code.as_deref() {
        Some("-") => {
            let mut source = String::new();
            std::io::stdin().read_to_string(&mut source)?;
            Ok(source)
        }
        Some(code) => Ok(code.to_string()),
        None => Err(CodeletError::Config("no snippet given".to_string())),
    }
}

async fn local_execute(source: &str, config: CodeletConfig) -> Envelope {
    let request = ExecutionRequest::from_code(source);
    let code = match validate(&request, &config.policy) {
        Ok(code) => code,
        Err(rejection) => return Envelope::rejected(rejection),
    };
    let backend = V8Backend::new(Arc::new(config.policy));
    Envelope::from_outcome(backend.execute(code).await)
}

/// Post the snippet to a running server and rebuild the envelope it answered
/// with.
async fn remote_execute(base: &str, source: &str) -> Result<Envelope> {
    let url = format!("{}/execute", base.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({ "code": source }))
        .send()
        .await?;

    let status = response.status().as_u16();
    let body: serde_json::Value = response.json().await?;
    let field = |name: &str| body[name].as_str().unwrap_or_default().to_string();

    match status {
        200 => Ok(Envelope::Executed(ExecutionResult::new(
            field("result"),
            field("error"),
        ))),
        400 => Ok(Envelope::Rejected {
            error: field("error"),
        }),
        500 => Ok(Envelope::SetupFailed {
            details: field("details"),
        }),
        other => Err(CodeletError::Other(anyhow::anyhow!(
            "unexpected status {} from {}",
            other,
            url
        ))),
    }
}

// ============================================================================
// Configuration Commands
// ============================================================================

pub async fn init(args: InitArgs, config_path: Option<&Path>) -> Result<()> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    write_default_config(&config_path)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Start the service on port 3002");
    println!("  codelet serve");
    println!();
    println!("  # Run a snippet locally");
    println!("  codelet exec \"console.log('hi')\"");
    println!();
    println!("  # Or against a running service");
    println!("  codelet exec --remote http://localhost:3002 \"42\"");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: CodeletConfig, config_path: Option<&Path>) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            println!("{}", to_toml(&config)?);
        }
        ConfigAction::Path => {
            let path = config_path
                .map(PathBuf::from)
                .unwrap_or_else(get_config_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn output_envelope(envelope: &Envelope, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            let failed = match envelope {
                Envelope::Executed(result) => {
                    if !result.result.is_empty() {
                        println!("{}", result.result);
                    }
                    if !result.error.is_empty() {
                        eprintln!("{}", result.error);
                    }
                    !result.is_success()
                }
                Envelope::Rejected { error } => {
                    eprintln!("{}", error);
                    true
                }
                Envelope::SetupFailed { details } => {
                    eprintln!("Failed to initialize sandbox: {}", details);
                    true
                }
            };
            if failed {
                std::process::exit(1);
            }
        }
        OutputFormat::Json => {
            println!("{}", envelope.body());
        }
    }
}
