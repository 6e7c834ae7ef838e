use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, bail};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pixcache::domain::SystemClock;
use pixcache::infrastructure::{
    CacheConfig, CliArgs, Command, ImageCache, ImageFetcher, ImageLoader,
};

fn init_logging(config: &CacheConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<CacheConfig> {
    let path = args.config.clone().or_else(CacheConfig::default_config_path);
    let mut config = match path {
        Some(path) => CacheConfig::load(&path)?,
        None => CacheConfig::default(),
    };
    config.merge_with_args(args);
    Ok(config)
}

async fn run(command: Command, config: &CacheConfig, cache: Arc<ImageCache>) -> Result<()> {
    match command {
        Command::Get { urls, output } => {
            if output.is_some() && urls.len() != 1 {
                bail!("--output needs exactly one URL, got {}", urls.len());
            }

            let fetcher = Arc::new(ImageFetcher::new(&config.user_agent, config.timeout_secs)?);
            let loader = ImageLoader::new(cache, fetcher);

            let mut failed = 0usize;
            for result in loader.load_batch(&urls).await {
                match result {
                    Ok(image) => {
                        println!(
                            "{}\t{}\t{} bytes\t{}",
                            image.url,
                            image.source,
                            image.payload.len(),
                            if image.cached { "cached" } else { "uncached" }
                        );
                        if let Some(path) = &output {
                            tokio::fs::write(path, &image.payload).await?;
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("error: {e}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} downloads failed", urls.len());
            }
        }
        Command::Lookup { url } => match cache.lookup_with_source(&url).await {
            Some((entry, source)) => println!(
                "{}\t{source}\t{} bytes\texpires {}",
                entry.key,
                entry.size_bytes,
                entry
                    .expires_at
                    .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
            ),
            None => println!("miss"),
        },
        Command::Invalidate { url } => {
            cache.invalidate(&url).await;
            println!("invalidated {url}");
        }
        Command::Purge => {
            let purged = cache.purge_expired().await;
            println!("purged {purged} expired entries");
        }
        Command::Clear => {
            cache.clear().await?;
            println!("cleared {}", config.effective_cache_dir().display());
        }
        Command::Stats => println!("{}", cache.stats()),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    init_logging(&config)?;

    info!(version = pixcache::VERSION, "Starting pixcache");

    let cache = Arc::new(ImageCache::open(&config.image_cache(), Arc::new(SystemClock)).await?);

    run(args.command, &config, cache).await
}
