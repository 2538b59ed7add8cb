use divvy::app::Application;
use divvy::cli::RootCommand;
use divvy::config::Config;
use divvy::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let opts: RootCommand = argh::from_env();

    if opts.version {
        opts.show_version();
        return;
    }

    let levels = std::env::var("DIVVY_LOG")
        .unwrap_or_else(|_| format!("divvy={},kubernetes={}", opts.log_level, opts.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(levels))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("divvy-worker")
        .enable_io()
        .enable_time()
        .build()
        .expect("build tokio runtime");

    let code = runtime.block_on(async move {
        info!(
            message = "starting",
            version = env!("CARGO_PKG_VERSION"),
            config = ?opts.config
        );

        let config = match Config::load(&opts.config) {
            Ok(config) => config,
            Err(err) => {
                error!(message = "loading configuration failed", %err);
                return exitcode::CONFIG;
            }
        };

        let signal_rx = signal::signal_channel();

        Application::new(config, opts.config).run(signal_rx).await
    });

    std::process::exit(code);
}
