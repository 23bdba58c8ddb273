use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgMatches, Command};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

use yt_ingest::extraction::DescriptionSource;
use yt_ingest::youtube::{extract_video_id, extractor_from_config, probe_identity, DataApiClient, PROBE_URL};
use yt_ingest::{AddressPool, ChannelPipeline, Config, ImportProgress, JsonFileStorage, LanguagePreference};

const PROBE_CONCURRENCY: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("yt-ingest")
        .version("0.1.0")
        .author("TigreRoll")
        .about("Import transcripts and chapters from YouTube channels through rotating proxies")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: yt-ingest.toml or config/yt-ingest.toml)")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("channel")
                .about("Import new items from a channel")
                .arg(Arg::new("source").help("Channel id, @handle or channel URL").required(true))
                .arg(
                    Arg::new("max")
                        .short('n')
                        .long("max")
                        .value_name("NUM")
                        .help("Number of new items to import")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("days")
                        .short('d')
                        .long("days")
                        .value_name("DAYS")
                        .help("Only consider items published within this many days")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    Arg::new("shorts")
                        .long("shorts")
                        .help("Include shorts")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("no-skip-existing")
                        .long("no-skip-existing")
                        .help("Re-import items that are already stored")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("lang")
                        .short('l')
                        .long("lang")
                        .value_name("LANG")
                        .help("Preferred transcript language"),
                )
                .arg(
                    Arg::new("batch-size")
                        .short('b')
                        .long("batch-size")
                        .value_name("NUM")
                        .help("Items per processing batch")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("video")
                .about("Extract transcript and chapters of a single item")
                .arg(Arg::new("item").help("Item id or watch URL").required(true))
                .arg(
                    Arg::new("lang")
                        .short('l')
                        .long("lang")
                        .value_name("LANG")
                        .help("Preferred transcript language"),
                ),
        )
        .subcommand(
            Command::new("proxy-status")
                .about("Show the proxy pool configuration")
                .arg(
                    Arg::new("probe")
                        .long("probe")
                        .help("Send one request through every identity and report which ones work")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("probe-url")
                        .long("probe-url")
                        .value_name("URL")
                        .help("URL requested by --probe")
                        .default_value(PROBE_URL),
                ),
        )
        .get_matches();

    // Initialize logging before anything logs. The configured level applies
    // once the config is loaded, unless RUST_LOG or --verbose decided it.
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let (initial, fixed_filter) = initial_filter(rust_log.as_deref(), matches.get_flag("verbose"));
    let (filter, filter_handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::load_from(Path::new(path)).with_context(|| format!("cannot load {}", path))?,
        None => Config::load()?,
    };

    if !fixed_filter {
        let configured = configured_filter(&config.logging.level)?;
        filter_handle
            .reload(configured)
            .context("cannot apply configured log level")?;
    }

    if let Err(e) = config.validate() {
        error!("❌ Invalid configuration: {}", e);
        return Err(e.into());
    }
    debug!("{}", config.summary());

    match matches.subcommand() {
        Some(("channel", sub)) => run_channel(config, sub).await,
        Some(("video", sub)) => run_video(config, sub).await,
        Some(("proxy-status", sub)) => run_proxy_status(config, sub).await,
        _ => Err(anyhow!("unknown command")),
    }
}

/// Filter installed at startup. The flag is set when `RUST_LOG` or
/// `--verbose` chose the level, so the config must not override it.
fn initial_filter(rust_log: Option<&str>, verbose: bool) -> (EnvFilter, bool) {
    if let Some(filter) = rust_log.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        return (filter, true);
    }
    if verbose {
        return (EnvFilter::new("yt_ingest=debug,info"), true);
    }
    (EnvFilter::new("yt_ingest=info,warn"), false)
}

fn configured_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(format!("yt_ingest={},warn", level)).with_context(|| format!("invalid log level {:?}", level))
}

/// Wait for the progress reporter; returns false when it panicked or was aborted
async fn finish_reporter(reporter: JoinHandle<()>) -> bool {
    match reporter.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Progress reporter stopped abnormally: {}", e);
            false
        }
    }
}

fn language_from(config: &Config, matches: &ArgMatches) -> LanguagePreference {
    let mut language = config.import.language.clone();
    if let Some(lang) = matches.get_one::<String>("lang") {
        language.target = lang.clone();
    }
    language
}

async fn run_channel(config: Config, matches: &ArgMatches) -> Result<()> {
    let source = matches
        .get_one::<String>("source")
        .ok_or_else(|| anyhow!("missing channel source"))?
        .clone();

    let mut settings = config.import.clone();
    if let Some(max) = matches.get_one::<usize>("max") {
        settings.max_items = *max;
    }
    if let Some(days) = matches.get_one::<u32>("days") {
        settings.lookback_days = *days;
    }
    if matches.get_flag("shorts") {
        settings.include_shorts = true;
    }
    if matches.get_flag("no-skip-existing") {
        settings.skip_existing = false;
    }
    if let Some(batch_size) = matches.get_one::<usize>("batch-size") {
        settings.batch_size = *batch_size;
    }
    settings.language = language_from(&config, matches);

    let pool = Arc::new(AddressPool::from_config(&config.proxy)?);
    let api = Arc::new(DataApiClient::new(&config.youtube)?);
    let descriptions: Arc<dyn DescriptionSource> = api.clone();
    let extractor = Arc::new(extractor_from_config(&config, pool, Some(descriptions)));
    let storage = Arc::new(JsonFileStorage::open(&config.storage.dir).await?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupted, finishing items in flight");
            on_signal.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let ImportProgress::ItemFinished { index, total, item_id, status } = event {
                info!("📊 [{}/{}] {} {:?}", index + 1, total, item_id, status);
            }
        }
    });

    info!("🚀 Importing up to {} new items from {}", settings.max_items, source);
    let pipeline = ChannelPipeline::new(api.clone(), api, storage, extractor)
        .with_progress(tx)
        .with_cancellation(cancel);
    let result = pipeline.run_channel_import(&source, &settings).await?;
    drop(pipeline);
    finish_reporter(reporter).await;

    info!("✅ Successful: {}", result.succeeded);
    info!("❌ Failed: {}", result.failed);
    if result.shortfall > 0 {
        warn!("⚠️ {} fewer new items than requested", result.shortfall);
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_video(config: Config, matches: &ArgMatches) -> Result<()> {
    let input = matches
        .get_one::<String>("item")
        .ok_or_else(|| anyhow!("missing item"))?;
    let item_id = extract_video_id(input).ok_or_else(|| anyhow!("not a video id or URL: {}", input))?;
    let language = language_from(&config, matches);

    let pool = Arc::new(AddressPool::from_config(&config.proxy)?);
    let descriptions: Option<Arc<dyn DescriptionSource>> = match DataApiClient::new(&config.youtube) {
        Ok(api) => Some(Arc::new(api)),
        Err(e) => {
            warn!("Description chapters disabled: {}", e);
            None
        }
    };
    let extractor = extractor_from_config(&config, pool, descriptions);

    info!("🎬 Extracting {}", item_id);
    let item = extractor.extract_one(&item_id, &language).await?;
    println!("{}", serde_json::to_string_pretty(&item)?);
    Ok(())
}

async fn run_proxy_status(config: Config, matches: &ArgMatches) -> Result<()> {
    let pool = AddressPool::from_config(&config.proxy)?;
    if !matches.get_flag("probe") {
        println!("{}", serde_json::to_string_pretty(&pool.status())?);
        return Ok(());
    }

    let probe_url = matches
        .get_one::<String>("probe-url")
        .map(String::as_str)
        .unwrap_or(PROBE_URL);
    let timeout = Duration::from_secs(config.youtube.request_timeout_secs);

    info!("🩺 Probing {} identities via {}", pool.size(), probe_url);
    let probes: Vec<_> = stream::iter(pool.identities())
        .map(|identity| probe_identity(identity, probe_url, timeout))
        .buffered(PROBE_CONCURRENCY)
        .collect()
        .await;

    for probe in &probes {
        if probe.healthy {
            info!("✅ {}", probe.message);
        } else {
            warn!("❌ {}: {}", probe.identity, probe.message);
        }
    }
    let healthy = probes.iter().filter(|p| p.healthy).count();
    info!("📊 {}/{} identities healthy", healthy, probes.len());

    println!("{}", serde_json::to_string_pretty(&probes)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_filter_precedence() {
        let (filter, fixed) = initial_filter(Some("yt_ingest=trace"), false);
        assert!(fixed);
        assert!(filter.to_string().contains("yt_ingest=trace"));

        let (filter, fixed) = initial_filter(None, true);
        assert!(fixed);
        assert!(filter.to_string().contains("yt_ingest=debug"));

        let (filter, fixed) = initial_filter(None, false);
        assert!(!fixed);
        assert!(filter.to_string().contains("yt_ingest=info"));
    }

    #[test]
    fn test_configured_filter() {
        assert!(configured_filter("debug").unwrap().to_string().contains("yt_ingest=debug"));
        assert!(configured_filter("not a level").is_err());
    }

    #[tokio::test]
    async fn test_finish_reporter_reports_panics() {
        assert!(finish_reporter(tokio::spawn(async {})).await);

        let panicking = tokio::spawn(async { panic!("reporter crashed") });
        assert!(!finish_reporter(panicking).await);
    }
}
