use std::io::IsTerminal;

#[derive(Debug, Clone, Copy, PartialEq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line, for ingestion by the log service.
    Json,
}

#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Default level of logs. `RUST_LOG` directives take precedence.
    #[clap(long = "log.level", env = "LOG_LEVEL", default_value = "info", global = true)]
    pub level: tracing::level_filters::LevelFilter,
    #[clap(
        long = "log.format",
        env = "LOG_FORMAT",
        value_enum,
        default_value = "text",
        global = true
    )]
    pub format: LogFormat,
}

/// Install a global subscriber which writes structured logs to stderr.
pub fn init_logging(args: &LogArgs) {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    let result = match args.format {
        LogFormat::Json => {
            let subscriber = builder
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Text => {
            let no_color = matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1");
            let subscriber = builder
                .with_ansi(!no_color && std::io::stderr().is_terminal())
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.expect("setting tracing default failed");
}
