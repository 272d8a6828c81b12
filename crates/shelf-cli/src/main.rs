use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use shelf_adapters::{load_profile, BrowserPageExtractor, FixturePageExtractor, StorefrontProfile};
use shelf_browser::{BrowserConfig, BrowserSession, SnapshotStore};
use shelf_core::ProductRecord;
use shelf_sync::{AssembledCatalog, CatalogAssembler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shelf")]
#[command(about = "Collect a bounded, deduplicated product catalog from a paginated storefront")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Print the catalog as indented JSON (`--json false` for a numbered listing).
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set)]
    json: bool,

    #[arg(long, global = true, default_value_t = 100)]
    max_records: usize,

    /// JSON storefront profile; omitted keys keep the built-in defaults.
    #[arg(long, global = true)]
    profile: Option<PathBuf>,

    /// Page URL template containing `{page}`.
    #[arg(long, global = true)]
    url_template: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render pages in a headless browser.
    Scrape(ScrapeArgs),
    /// Replay saved `page-<n>.html` files instead of browsing.
    Replay { dir: PathBuf },
}

#[derive(Debug, Clone, clap::Args)]
struct ScrapeArgs {
    /// Seconds to wait for the product grid to become visible on each page.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    wait_timeout_secs: u64,

    #[arg(long)]
    headful: bool,

    /// Browser executable; auto-detected when omitted.
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Keep every rendered page's HTML (plus a `pages.jsonl` manifest) here.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
}

impl Default for ScrapeArgs {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 30,
            headful: false,
            chrome: None,
            snapshot_dir: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let profile = resolve_profile(cli.profile.as_ref(), cli.url_template.as_deref())?;

    let catalog = match cli
        .command
        .unwrap_or_else(|| Commands::Scrape(ScrapeArgs::default()))
    {
        Commands::Scrape(args) => scrape(&args, profile, cli.max_records).await?,
        Commands::Replay { dir } => {
            let extractor = FixturePageExtractor::new(&dir, profile)?;
            CatalogAssembler::new(extractor)
                .assemble(cli.max_records)
                .await
                .with_context(|| format!("replaying {}", dir.display()))?
        }
    };

    let output = if cli.json {
        render_json(&catalog.records)?
    } else {
        render_text(&catalog.records, cli.max_records)
    };
    println!("{output}");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chromiumoxide=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn resolve_profile(path: Option<&PathBuf>, url_template: Option<&str>) -> Result<StorefrontProfile> {
    let mut profile = match path {
        Some(path) => load_profile(path)?,
        None => StorefrontProfile::default(),
    };
    if let Some(template) = url_template {
        profile = profile.with_url_template(template);
    }
    profile.validate().context("invalid storefront profile")?;
    Ok(profile)
}

fn browser_config(args: &ScrapeArgs) -> BrowserConfig {
    BrowserConfig {
        headless: !args.headful,
        executable: args.chrome.clone(),
        wait_timeout: Duration::from_secs(args.wait_timeout_secs),
        ..Default::default()
    }
}

async fn scrape(args: &ScrapeArgs, profile: StorefrontProfile, max_records: usize) -> Result<AssembledCatalog> {
    let session = BrowserSession::launch(browser_config(args))
        .await
        .context("launching browser")?;

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling current page load");
                cancel.cancel();
            }
        }
    });

    let result = assemble_in_session(&session, profile, args, cancel, max_records).await;

    interrupt.abort();
    if let Err(err) = session.close().await {
        warn!("closing browser: {err}");
    }
    result
}

async fn assemble_in_session(
    session: &BrowserSession,
    profile: StorefrontProfile,
    args: &ScrapeArgs,
    cancel: CancellationToken,
    max_records: usize,
) -> Result<AssembledCatalog> {
    let mut extractor = BrowserPageExtractor::new(session, profile)?.with_cancellation(cancel);
    if let Some(dir) = &args.snapshot_dir {
        let store = SnapshotStore::new(dir);
        info!(dir = %store.run_dir().display(), "storing rendered page snapshots");
        extractor = extractor.with_snapshots(store);
    }
    let catalog = CatalogAssembler::new(extractor).assemble(max_records).await?;
    Ok(catalog)
}

fn render_json(records: &[ProductRecord]) -> Result<String> {
    serde_json::to_string_pretty(records).context("serializing catalog")
}

fn render_text(records: &[ProductRecord], max_records: usize) -> String {
    let mut out = format!("These are the {} products Found :\n\n", records.len());
    for (i, product) in records.iter().take(max_records).enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, product.name));
        out.push_str(&format!("   URL: {}\n", product.url));
        out.push_str(&format!("   Price: {}\n", product.price));
        if product.has_rating() {
            out.push_str(&format!(
                "   Rating: {:.2}/5 ({} reviews)\n",
                product.rating_avg, product.rating_count
            ));
        }
        out.push_str(&format!("   Image: {}\n\n", product.image));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn product(url: &str, rating_count: u32) -> ProductRecord {
        ProductRecord {
            url: url.to_string(),
            name: "Trail Bottle 600ml".to_string(),
            image: "https://cdn.raidlight.test/files/bottle.jpg".to_string(),
            price: "€14,90".to_string(),
            rating_avg: 4.666,
            rating_count,
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_json_output_and_hundred_records() {
        let cli = Cli::try_parse_from(["shelf"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.max_records, 100);
        assert!(cli.command.is_none());
    }

    #[test]
    fn json_flag_takes_an_explicit_value() {
        let cli = Cli::try_parse_from(["shelf", "--json", "false", "replay", "fixtures/raidlight"]).unwrap();
        assert!(!cli.json);
        assert!(matches!(cli.command, Some(Commands::Replay { ref dir }) if dir.ends_with("raidlight")));
    }

    #[test]
    fn grid_wait_must_be_at_least_one_second() {
        assert!(Cli::try_parse_from(["shelf", "scrape", "--wait-timeout-secs", "0"]).is_err());

        let cli = Cli::try_parse_from(["shelf", "scrape", "--wait-timeout-secs", "5"]).unwrap();
        let Some(Commands::Scrape(args)) = cli.command else {
            panic!("expected scrape command");
        };
        let config = browser_config(&args);
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, BrowserConfig::default().request_timeout);
    }

    #[test]
    fn text_listing_shows_rating_only_when_reviewed() {
        let records = vec![
            product("https://raidlight.com/products/trail-bottle-600ml", 3),
            product("https://raidlight.com/products/winter-trail-gloves", 0),
        ];
        let text = render_text(&records, 100);

        assert!(text.starts_with("These are the 2 products Found :\n\n1. Trail Bottle 600ml\n"));
        assert!(text.contains("   Rating: 4.67/5 (3 reviews)\n"));
        assert_eq!(text.matches("Rating:").count(), 1);
        assert!(text.contains("2. Trail Bottle 600ml\n   URL: https://raidlight.com/products/winter-trail-gloves\n"));
    }

    #[test]
    fn text_listing_is_capped_at_max_records() {
        let records = vec![
            product("https://raidlight.com/products/a", 0),
            product("https://raidlight.com/products/b", 0),
        ];
        let text = render_text(&records, 1);
        assert!(text.contains("1. "));
        assert!(!text.contains("2. "));
    }

    #[test]
    fn json_output_is_an_indented_array() {
        let json = render_json(&[product("https://raidlight.com/products/a", 1)]).unwrap();
        assert!(json.starts_with("[\n  {\n    \"url\": \"https://raidlight.com/products/a\""));
        assert_eq!(render_json(&[]).unwrap(), "[]");
    }

    #[test]
    fn url_template_override_must_keep_placeholder() {
        assert!(resolve_profile(None, Some("https://shop.test/all")).is_err());
        let profile = resolve_profile(None, Some("https://shop.test/all?page={page}")).unwrap();
        assert_eq!(profile.page_url(2).unwrap(), "https://shop.test/all?page=2");
    }
}
