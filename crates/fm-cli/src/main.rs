use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "fm")]
#[command(about = "FrameMill operations CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Grant credits to a user
    Credit {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        amount: i64,
        #[arg(long, default_value = "manual grant")]
        description: String,
    },

    /// Show a user's balance
    Balance {
        #[arg(long)]
        user: Uuid,
    },

    /// Run one janitor sweep and print the report
    JanitorSweep {
        /// Config YAML paths in merge order (defaults apply when omitted)
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Probe width, height and duration of a media file
    Probe {
        #[arg(long)]
        input: String,
    },

    /// Generate the conventional thumbnail for a registered asset
    Thumbnail {
        #[arg(long)]
        asset: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = fm_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = fm_db::status(&pool).await?;
                    if s.schema_ready() {
                        println!("db_ok=true schema=ready");
                    } else {
                        println!(
                            "db_ok={} missing_tables={}",
                            s.reachable,
                            s.missing_tables.join(",")
                        );
                    }
                }
                DbCmd::Migrate => {
                    fm_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Credit {
            user,
            amount,
            description,
        } => {
            let pool = fm_db::connect_from_env().await?;
            let ledger = fm_ledger::Ledger::new(pool);
            let entry_id = ledger.credit(user, amount, &description).await?;
            let balance = ledger.balance(user).await?;
            println!("entry_id={entry_id} balance={balance}");
        }

        Commands::Balance { user } => {
            let pool = fm_db::connect_from_env().await?;
            let balance = fm_ledger::Ledger::new(pool).balance(user).await?;
            println!("balance={balance}");
        }

        Commands::JanitorSweep { config_paths } => {
            let settings = if config_paths.is_empty() {
                fm_config::Settings::default()
            } else {
                let paths: Vec<&str> = config_paths.iter().map(String::as_str).collect();
                fm_config::load_layered_yaml(&paths)?.settings()?
            };

            let pool = fm_db::connect_from_env().await?;
            let cfg = fm_janitor::JanitorConfig::from_settings(&settings.janitor);
            let report = fm_janitor::sweep(&pool, &cfg).await?;
            println!(
                "checked={} released={} skipped={} suspicious={} captured={}",
                report.reservations_checked,
                report.released,
                report.skipped,
                report.suspicious,
                report.captured
            );
        }

        Commands::ConfigHash { paths } => {
            let paths: Vec<&str> = paths.iter().map(String::as_str).collect();
            let loaded = fm_config::load_layered_yaml(&paths)?;
            println!("{}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Probe { input } => {
            let settings = fm_config::Settings::default();
            let runner = fm_media::MediaRunner::new(settings.media, settings.storage.root);
            let (width, height) = runner.probe_dimensions(&input).await?;
            let duration = runner.probe_duration(&input).await?;
            match duration {
                Some(secs) => println!("{width}x{height} duration={secs}s"),
                None => println!("{width}x{height}"),
            }
        }

        Commands::Thumbnail { asset } => {
            let settings = fm_config::Settings::default();
            let pool = fm_db::connect_from_env().await?;
            let row = fm_db::assets::fetch_asset(&pool, &asset)
                .await?
                .ok_or_else(|| anyhow::anyhow!("asset {asset} not found"))?;

            let runner = fm_media::MediaRunner::new(settings.media, settings.storage.root);
            let out = runner
                .thumbnail(&fm_media::InputAsset {
                    asset_id: row.asset_id,
                    kind: row.kind,
                    extension: row.extension,
                })
                .await?;
            println!("{out}");
        }
    }

    Ok(())
}
