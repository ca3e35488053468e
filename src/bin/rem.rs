use clap::Parser;

use rem_cli::commands::plugins::PluginArgs;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    // On-disk state is protected by staging-then-rename, so an interrupt
    // only needs to stop promptly with the conventional code.
    let _ = ctrlc::set_handler(|| {
        terminal::error!("interrupted");
        std::process::exit(130);
    });

    if let Err(err) = RemApp::parse().run().await {
        terminal::error!("{err:#}");
        std::process::exit(exit_code(&err));
    }
}

/// The rem CLI: manage a reverse-engineering host tool and its plugins.
#[derive(Parser, Debug)]
#[clap(name = "rem", version)]
enum RemApp {
    /// Manage the host tool's plugins.
    Plugin(PluginArgs),
}

impl RemApp {
    async fn run(self) -> anyhow::Result<()> {
        match self {
            Self::Plugin(args) => args.run().await,
        }
    }
}

/// Map the error taxonomy to exit codes; anything outside it is a user
/// error.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<rem_plugins::Error>())
        .map(rem_plugins::Error::exit_code)
        .unwrap_or(1)
}
