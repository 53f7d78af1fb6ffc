use clap::Parser;
use marionette::cli;
use marionette::Config;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(cli::EXIT_MISCONFIGURED);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);

    // Keep the rolling-file guard alive for the process lifetime.
    let _file_guard = match config.logging.file {
        Some(ref file) => {
            let appender = tracing_appender::rolling::daily(&config.storage.log_dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.with(fmt::layer()).init();
            None
        }
    };

    let code = cli::run(cli, config).await;
    std::process::exit(code);
}
