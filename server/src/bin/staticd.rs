use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use staticd_server::AppState;
use staticd_tree::{RuleSet, TreeManager};

/// Serves a directory of static content, rescanning it on filesystem
/// changes and transparently handling pre-compressed files.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Root of the directory tree to serve.
    #[arg(short = 'd', long, env = "STATICD_DIRECTORY")]
    directory: PathBuf,

    /// File served when a path resolves to a directory.
    #[arg(long, default_value = "index.html")]
    index_name: String,

    /// Cache budget in MiB. Compressed files up to a tenth of it are
    /// decompressed in memory for clients without gzip support.
    #[arg(long, default_value_t = 10)]
    cache_size: u64,

    #[clap(flatten)]
    listen_args: tokio_listener::ListenerAddressLFlag,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let manager = Arc::new(TreeManager::new(
        &cli.directory,
        RuleSet::defaults()?,
        cli.index_name,
    )?);
    tokio::spawn(manager.clone().watch_and_refresh());

    let decode_budget = (cli.cache_size * 1024 * 1024).div_ceil(10);
    let app = staticd_server::gen_router().with_state(AppState::new(manager, decode_budget));

    let listen_address = cli.listen_args.listen_address.unwrap_or_else(|| {
        "[::]:8080".parse().expect("invalid fallback listen address")
    });

    let listener = tokio_listener::Listener::bind(
        &listen_address,
        &Default::default(),
        &cli.listen_args.listener_options,
    )
    .await?;

    info!(
        listen_address = %listen_address,
        directory = %cli.directory.display(),
        "starting staticd"
    );

    tokio_listener::axum07::serve(
        listener,
        app.into_make_service_with_connect_info::<tokio_listener::SomeSocketAddrClonable>(),
    )
    .await?;

    Ok(())
}
