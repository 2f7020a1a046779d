use anyhow::Result;
use clap::Parser;
use pyright_mcp::cli;
use pyright_mcp::dispatch::Dispatcher;
use pyright_mcp::mcp;
use pyright_mcp::model::AnalysisRequest;
use pyright_mcp::runner::CancelToken;
use serde_json::{Value, json};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PYRIGHT_MCP_LOG";

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("pyright_mcp={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<ExitCode> {
    let args = cli::Args::parse();
    init_tracing(args.verbose);

    match args.command {
        cli::Command::Serve { server } => {
            let config = server.into_config();
            tracing::info!(
                roots = ?config.allowed_roots,
                checker = ?config.checker.as_ref().map(|checker| checker.display()),
                "serving MCP on stdio"
            );
            mcp::serve(config)?;
            Ok(ExitCode::SUCCESS)
        }
        cli::Command::Check {
            targets,
            include,
            exclude,
            python_version,
            python_platform,
            fail_on_severity,
            server,
        } => {
            let mut request = AnalysisRequest::new(targets);
            if !include.is_empty() {
                request = request.with_option("include", json!(include));
            }
            if !exclude.is_empty() {
                request = request.with_option("exclude", json!(exclude));
            }
            if let Some(version) = python_version {
                request = request.with_option("python_version", json!(version));
            }
            if let Some(platform) = python_platform {
                request = request.with_option("python_platform", json!(platform));
            }
            if let Some(fail_on) = fail_on_severity {
                request = request.with_option("fail_on_severity", json!(fail_on));
            }
            let dispatcher = Dispatcher::new(server.into_config());
            match dispatcher.analyze(&request, &CancelToken::new()) {
                Ok(result) => {
                    print_json(&serde_json::to_value(&result)?)?;
                    Ok(if result.ok {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    })
                }
                Err(err) => {
                    print_json(&json!({ "error": err.to_json() }))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        cli::Command::Version { server } => {
            let dispatcher = Dispatcher::new(server.into_config());
            match dispatcher.version() {
                Ok(info) => {
                    print_json(&serde_json::to_value(&info)?)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    print_json(&json!({ "error": err.to_json() }))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        cli::Command::FindConfig { start_dir, server } => {
            let dispatcher = Dispatcher::new(server.into_config());
            match dispatcher.find_config(start_dir.as_deref()) {
                Ok(found) => {
                    print_json(&serde_json::to_value(&found)?)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    print_json(&json!({ "error": err.to_json() }))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}
