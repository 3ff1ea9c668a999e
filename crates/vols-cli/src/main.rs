use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vols_adapters::{PortalClient, PortalHtmlExtractor, PortalSource};
use vols_core::SearchFilters;
use vols_storage::ActivityStore;
use vols_sync::{build_orchestrator, load_activity_with_detail, refresh_activity_detail, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "vols-cli")]
#[command(about = "Volunteer activity cache command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every listing page matching the filters into the local cache.
    Sync(SyncArgs),
    Migrate,
    Serve,
    /// Print one activity, fetching its detail page when the cache lacks it.
    Show {
        program_id: String,
        #[arg(long)]
        refresh: bool,
    },
    Districts {
        city_code: String,
    },
    Status {
        #[arg(long, default_value_t = 5)]
        runs: u32,
    },
}

/// Unset flags fall back to the `VOLS_SYNC_*` defaults.
#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    region: Option<String>,
    #[arg(long)]
    district: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    activity_type: Option<String>,
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    date_start: Option<String>,
    #[arg(long)]
    date_end: Option<String>,
    #[arg(long)]
    keyword: Option<String>,
}

impl SyncArgs {
    fn into_filters(self, defaults: &SearchFilters) -> SearchFilters {
        let pick = |flag: Option<String>, default: &String| flag.unwrap_or_else(|| default.clone());
        SearchFilters {
            region: pick(self.region, &defaults.region),
            district: pick(self.district, &defaults.district),
            category: pick(self.category, &defaults.category),
            activity_type: pick(self.activity_type, &defaults.activity_type),
            target: pick(self.target, &defaults.target),
            status: pick(self.status, &defaults.status),
            date_start: pick(self.date_start, &defaults.date_start),
            date_end: pick(self.date_end, &defaults.date_end),
            keyword: pick(self.keyword, &defaults.keyword),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let filters = args.into_filters(&config.default_filters);
            let orchestrator = build_orchestrator(&config).await?;
            let summary = orchestrator
                .run(filters, |page, total_pages, fetched| {
                    println!("page {page}/{total_pages}: {fetched} activities fetched");
                })
                .await?;
            println!(
                "sync finished: run_id={} pages={}/{} fetched={}",
                summary.run_id, summary.pages, summary.total_pages, summary.fetched
            );
            if let Some(error) = summary.error {
                bail!("sync run {} failed: {error}", summary.run_id);
            }
        }
        Commands::Migrate => {
            ActivityStore::open(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Serve => vols_web::serve_from_env().await?,
        Commands::Show {
            program_id,
            refresh,
        } => {
            let store = ActivityStore::open(&config.database_url).await?;
            let portal = PortalClient::new(config.portal_config())?;
            let record = if refresh {
                if store.get(&program_id).await?.is_none() {
                    store.ensure_placeholder(&program_id, Utc::now()).await?;
                }
                refresh_activity_detail(&portal, &PortalHtmlExtractor, &store, &program_id).await?
            } else {
                load_activity_with_detail(&portal, &PortalHtmlExtractor, &store, &program_id)
                    .await?
            };
            let Some(record) = record else {
                bail!("activity {program_id} not found on the portal");
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Districts { city_code } => {
            let portal = PortalClient::new(config.portal_config())?;
            let districts = portal.fetch_district_list(&city_code).await?;
            for (code, name) in districts {
                println!("{code}\t{name}");
            }
        }
        Commands::Status { runs } => {
            let store = ActivityStore::open(&config.database_url).await?;
            let (count, last_sync) = store.count_and_last_sync_time().await?;
            match last_sync {
                Some(ts) => println!("{count} cached activities, last listing sync {ts}"),
                None => println!("{count} cached activities, never synced"),
            }
            for run in store.recent_runs(runs).await? {
                println!(
                    "{} {} page {}/{} fetched={} started={}{}",
                    run.run_id,
                    run.status.as_str(),
                    run.current_page,
                    run.total_pages,
                    run.fetched,
                    run.started_at,
                    run.error.map(|e| format!(" error={e}")).unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}
