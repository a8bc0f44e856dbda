use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use sentry_agent::event::{LogEvent, LogsData, MessageType};
use sentry_agent::{logging, preflight, runtime, AgentArgs, Report, TermFilter};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

/// CloudSentry agent diagnoses error logs of a production service, and posts
/// them to a messaging webhook.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(flatten)]
    log: logging::LogArgs,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve invocations of the function runtime API.
    ///
    /// This is the default when the hosting platform starts the process.
    Serve(ServeArgs),
    /// Handle one subscription payload or log line locally, and print its report.
    Invoke(InvokeArgs),
    /// Validate deployment settings, and print the deployment they describe.
    Preflight(PreflightArgs),
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    /// Address (host:port) of the function runtime API.
    #[clap(long, env = "AWS_LAMBDA_RUNTIME_API")]
    runtime_api: String,
    #[clap(flatten)]
    agent: AgentArgs,
}

#[derive(Debug, clap::Args)]
struct InvokeArgs {
    /// Log line to handle as if the subscription filter had delivered it.
    /// Lines which the filter wouldn't match are ignored.
    #[clap(long, conflicts_with = "payload")]
    message: Option<String>,
    /// Path of a subscription payload to handle, or `-` to read it from stdin.
    #[clap(long, default_value = "-")]
    payload: PathBuf,
    /// Log group of a `--message`.
    #[clap(long, default_value = preflight::LOG_GROUP)]
    log_group: String,
    /// Log stream of a `--message`.
    #[clap(long, default_value = "local")]
    log_stream: String,
    #[clap(flatten)]
    agent: AgentArgs,
}

#[derive(Debug, clap::Args)]
struct PreflightArgs {
    /// Environment file whose values override the process environment.
    #[clap(long, default_value = ".env")]
    env_file: PathBuf,
}

fn main() -> Result<(), anyhow::Error> {
    // The hosting platform starts the process without arguments.
    let cli = if std::env::args_os().len() == 1
        && std::env::var_os("AWS_LAMBDA_RUNTIME_API").is_some()
    {
        Cli::parse_from(["cloudsentry-agent", "serve"])
    } else {
        Cli::parse()
    };
    logging::init_logging(&cli.log);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(cli.command));

    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}

async fn async_main(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve(args) => serve(args).await,
        Command::Invoke(args) => invoke(args).await,
        Command::Preflight(args) => run_preflight(args),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let ServeArgs { runtime_api, agent } = args;
    tracing::info!(?agent, "started!");

    let http_client = reqwest::Client::new();
    let api = runtime::RuntimeApi::new(&runtime_api, http_client.clone())?;

    let handler = match agent
        .into_config()
        .and_then(|config| sentry_agent::new_handler(&config, http_client))
    {
        Ok(handler) => handler,
        Err(error) => {
            tracing::error!(?error, "failed to initialize");
            api.init_error(&error)
                .await
                .context("reporting initialization error")?;
            return Err(error);
        }
    };

    runtime::serve(&api, &handler, shutdown_signal()).await
}

async fn invoke(args: InvokeArgs) -> anyhow::Result<()> {
    let InvokeArgs {
        message,
        payload,
        log_group,
        log_stream,
        agent,
    } = args;

    let config = agent.into_config()?;
    tracing::debug!(?config, "invoking locally");
    let handler = sentry_agent::new_handler(&config, reqwest::Client::new())?;
    let deadline = Utc::now() + chrono::Duration::from_std(preflight::FUNCTION_TIMEOUT)?;

    let report = if let Some(message) = message {
        let filter = TermFilter::all_terms(preflight::FILTER_TERMS.iter().copied());

        if filter.matches(&message) {
            let logs = LogsData {
                message_type: MessageType::DataMessage,
                owner: String::new(),
                log_group,
                log_stream,
                subscription_filters: vec![preflight::FILTER_NAME.to_string()],
                log_events: vec![LogEvent {
                    id: String::new(),
                    timestamp: Utc::now().timestamp_millis(),
                    message,
                }],
            };
            handler.handle(logs, Some(deadline)).await
        } else {
            tracing::info!(%filter, "log line doesn't match the subscription filter, ignoring it");
            Report::default()
        }
    } else {
        let bytes = read_payload(&payload).await?;
        handler.handle_payload(&bytes, Some(deadline)).await
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_preflight(args: PreflightArgs) -> anyhow::Result<()> {
    let env = preflight::Environment::load(&args.env_file, std::env::vars())?;
    let deployment = preflight::check(&env)?;

    println!("{}", serde_json::to_string_pretty(&deployment)?);
    Ok(())
}

async fn read_payload(path: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    if path.as_os_str() == "-" {
        tokio::io::stdin()
            .read_to_end(&mut bytes)
            .await
            .context("reading payload from stdin")?;
    } else {
        bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading payload from {path:?}"))?;
    }
    Ok(bytes)
}

async fn shutdown_signal() {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler");

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.expect("failed to install CTRL+C signal handler"),
        _ = terminate.recv() => {},
    }
}
