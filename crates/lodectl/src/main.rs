//! `lodectl` is the service CLI: serve the HTTP API, wait for
//! backends to come up, and push datasets to a remote instance.

mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use config::Config;

#[derive(Debug, Parser)]
#[clap(author, name = "lodectl", version)]
struct Cli {
    /// Path to the service configuration file.
    #[clap(short, long, default_value = "lode.yml", global = true)]
    config: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Command {
    /// Serve the HTTP API.
    Run,
    /// Wait until the internal store accepts connections.
    Wait {
        /// Give up after this long.
        #[clap(long, default_value = "30s")]
        timeout: String,
    },
    /// Push datasets to a remote service.
    Push(PushArgs),
}

#[derive(Debug, clap::Args)]
struct PushArgs {
    /// Remote server URL; defaults to the configured client's server.
    #[clap(short, long)]
    output: Option<String>,

    /// Credentials file, defaults to the configured one.
    #[clap(short = 'r', long)]
    credentials: Option<PathBuf>,

    /// Client id from the credentials file.
    #[clap(long)]
    client: String,

    /// Push only this dataset.
    #[clap(short, long)]
    dataset: Option<String>,

    /// Chunk size per POST, e.g. 1m, 512k.
    #[clap(long, default_value = "1m")]
    chunk_size: String,

    /// Stop pushing after this long, e.g. 90s, 1h.
    #[clap(long)]
    stop_time: Option<String>,

    /// Stop after offering this many rows.
    #[clap(long)]
    stop_row: Option<u64>,

    /// Push state database path.
    #[clap(long)]
    state: Option<PathBuf>,

    /// Where rows are read from.
    #[clap(long, value_enum, default_value = "external")]
    mode: PushMode,

    /// Abort after this many row errors.
    #[clap(long, default_value = "50")]
    max_errors: u64,

    #[clap(long)]
    no_progress_bar: bool,

    #[clap(long)]
    stop_on_error: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum PushMode {
    Internal,
    External,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Wait { timeout } => wait(config, &timeout).await,
        Command::Push(args) => run_push(config, args).await,
    }
}

async fn load_manifest(config: &Config) -> anyhow::Result<Arc<manifest::Manifest>> {
    let manifest = manifest::from_path(&config.manifest)
        .with_context(|| format!("loading manifest {}", config.manifest.display()))?;
    Ok(Arc::new(manifest))
}

async fn connect_sources(
    config: &Config,
) -> anyhow::Result<HashMap<String, backends::SqlSource>> {
    let mut sources = HashMap::new();
    for (name, dsn) in &config.backends {
        let source = backends::SqlSource::connect(name, dsn)
            .await
            .with_context(|| format!("connecting source {name:?}"))?;
        sources.insert(name.clone(), source);
    }
    Ok(sources)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let manifest = load_manifest(&config).await?;

    let mut store = backends::PostgresStore::connect(&config.internal_dsn)
        .await
        .context("connecting internal store")?;
    store.prepare(&manifest).await.context("preparing tables")?;

    let sources = connect_sources(&config).await?;
    let keymap = keymap::KeyMap::open(&config.keymap)
        .with_context(|| format!("opening keymap {}", config.keymap.display()))?;

    let scope_source: Arc<dyn api::ScopeSource> = match &config.scopes {
        Some(scopes) => Arc::new(api::StaticScopes(scopes.clone())),
        None => Arc::new(api::NoAuth),
    };

    let state = Arc::new(api::AppState {
        manifest,
        store: Arc::new(store),
        sources,
        keymap: Arc::new(keymap),
        scope_source,
        sink: api::SharedSink::new(config.accesslog.sink()?),
        accesslog_buffer: config.accesslog.buffer_size(),
    });
    api::serve(state, config.listen).await
}

async fn wait(config: Config, timeout: &str) -> anyhow::Result<()> {
    let timeout = humantime::parse_duration(timeout).context("parsing --timeout")?;
    let started = std::time::Instant::now();
    loop {
        match backends::PostgresStore::connect(&config.internal_dsn).await {
            Ok(_) => {
                tracing::info!("internal store is up");
                return Ok(());
            }
            Err(err) if started.elapsed() < timeout => {
                tracing::debug!(%err, "store not ready, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(err) => {
                return Err(anyhow::Error::from(err))
                    .context("internal store did not come up in time")
            }
        }
    }
}

async fn run_push(config: Config, args: PushArgs) -> anyhow::Result<()> {
    let manifest = load_manifest(&config).await?;
    let keymap = keymap::KeyMap::open(&config.keymap)
        .with_context(|| format!("opening keymap {}", config.keymap.display()))?;

    let credentials_path = args
        .credentials
        .or_else(|| config.credentials.clone())
        .context("no credentials file given (-r) or configured")?;
    let credentials = push::Credentials::load(&credentials_path)?;
    let mut client_credentials = credentials.client(&args.client)?.clone();
    if let Some(output) = &args.output {
        client_credentials.server = output.parse().context("parsing --output url")?;
    }
    let client = push::RemoteClient::connect(&args.client, &client_credentials).await?;

    let state_path = args
        .state
        .or_else(|| config.push_state.clone())
        .context("no push state path given (--state) or configured")?;
    let state = push::State::open(&state_path)?;

    let options = push::PushOptions {
        dataset: args.dataset,
        mode: match args.mode {
            PushMode::Internal => push::Mode::Internal,
            PushMode::External => push::Mode::External,
        },
        chunk_size: args
            .chunk_size
            .parse::<bytesize::ByteSize>()
            .map_err(|err| anyhow::anyhow!("parsing --chunk-size: {err}"))?
            .as_u64() as usize,
        stop_time: args
            .stop_time
            .as_deref()
            .map(humantime::parse_duration)
            .transpose()
            .context("parsing --stop-time")?,
        stop_row: args.stop_row,
        max_errors: args.max_errors,
        stop_on_error: args.stop_on_error,
        no_progress: args.no_progress_bar,
    };

    let stats = match options.mode {
        push::Mode::External => {
            let sources = connect_sources(&config).await?;
            push::push(
                &manifest,
                push::PushBackend::External(&sources),
                &keymap,
                &client,
                &state,
                &options,
            )
            .await?
        }
        push::Mode::Internal => {
            let mut store = backends::PostgresStore::connect(&config.internal_dsn)
                .await
                .context("connecting internal store")?;
            store.prepare(&manifest).await?;
            push::push(
                &manifest,
                push::PushBackend::Internal(&store),
                &keymap,
                &client,
                &state,
                &options,
            )
            .await?
        }
    };

    println!(
        "pushed {} rows ({} skipped, {} errors, {} deleted) in {} requests",
        stats.sent, stats.skipped, stats.errors, stats.deleted, stats.posts,
    );
    if stats.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cli_parses_push_options() {
        let cli = Cli::parse_from([
            "lodectl",
            "push",
            "--client",
            "pushclient",
            "--dataset",
            "datasets/gov/example",
            "--chunk-size",
            "512k",
            "--stop-row",
            "100",
            "--mode",
            "internal",
            "--no-progress-bar",
        ]);
        let Command::Push(args) = cli.command else {
            panic!("expected push");
        };
        assert_eq!(args.client, "pushclient");
        assert_eq!(args.stop_row, Some(100));
        assert!(args.no_progress_bar);
        assert!(matches!(args.mode, PushMode::Internal));
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["lodectl", "run"]);
        assert_eq!(cli.config, PathBuf::from("lode.yml"));
        assert!(matches!(cli.command, Command::Run));
    }
}
