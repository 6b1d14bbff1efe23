use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use digest_notify::config::Config;
use digest_notify::controller::{
    CheckOutcome, ControllerOptions, NotificationController, ToggleOutcome,
};
use digest_notify::feed::FeedClient;
use digest_notify::notify::DesktopNotifier;
use digest_notify::storage::{Database, DatabaseError};

type Controller = NotificationController<DesktopNotifier<Database>, Database>;

const UNSUPPORTED_MESSAGE: &str = "Notifications are not supported on this system.";

/// Get the config directory path (~/.config/digest-notify/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("digest-notify"))
}

#[derive(Parser, Debug)]
#[command(
    name = "digest-notify",
    about = "Desktop notifications for new Adobe Digest security bulletins"
)]
struct Args {
    /// Config file (default: ~/.config/digest-notify/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the state database (default: ~/.config/digest-notify/)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Turn notifications on (asking permission if needed) or off
    Toggle,
    /// Turn notifications on and keep checking in the foreground
    Enable,
    /// Turn notifications off
    Disable,
    /// Show the current notification state
    Status,
    /// Check the feed once, respecting the check interval.
    ///
    /// Clicking a notification raised here does nothing after the command
    /// exits; use `watch` for clickable notifications.
    Check,
    /// Keep checking in the foreground while notifications are enabled
    Watch,
    /// Forget the stored permission decision so the next enable asks again
    Revoke,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let data_dir = args.data_dir.clone().unwrap_or(config_dir);
    prepare_data_dir(&data_dir)?;

    let db_path = data_dir.join("state.db");
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open state database: {}", e)),
    };

    let notifier = DesktopNotifier::load(db.clone(), config.app_name.clone()).await;
    let feed = FeedClient::new(config.feed_url()?, config.request_timeout())
        .context("Failed to create HTTP client")?;
    let controller: Arc<Controller> = Arc::new(
        NotificationController::new(notifier, db, feed, ControllerOptions::from(&config)).await,
    );

    match args.command {
        Command::Toggle => match controller.toggle().await {
            ToggleOutcome::Unsupported => {
                eprintln!("{}", UNSUPPORTED_MESSAGE);
                std::process::exit(1);
            }
            ToggleOutcome::Disabled => println!("Notifications disabled."),
            ToggleOutcome::NotGranted => {
                println!("Notifications not enabled: permission was not granted.")
            }
            ToggleOutcome::Enabled => {
                announce_watching(&config);
                run_until_interrupted(&controller).await?;
            }
        },
        Command::Enable => {
            if !controller.is_supported() {
                eprintln!("{}", UNSUPPORTED_MESSAGE);
                std::process::exit(1);
            }
            if controller.request_permission().await {
                controller.start_periodic_checks().await;
                announce_watching(&config);
                run_until_interrupted(&controller).await?;
            } else {
                println!("Notifications not enabled: permission was not granted.");
            }
        }
        Command::Disable => {
            controller.disable().await;
            println!("Notifications disabled.");
        }
        Command::Status => print_status(&controller, &config).await,
        Command::Check => {
            let outcome = controller.check_for_updates().await;
            println!("{}", describe_check(outcome));
        }
        Command::Watch => {
            if controller.start_periodic_checks().await {
                announce_watching(&config);
                run_until_interrupted(&controller).await?;
            } else {
                println!("Notifications are disabled. Run `digest-notify toggle` to enable them.");
            }
        }
        Command::Revoke => {
            controller
                .notifier()
                .revoke()
                .await
                .context("Failed to reset notification permission")?;
            println!("Notification permission reset. The next enable will ask again.");
        }
    }

    Ok(())
}

fn prepare_data_dir(data_dir: &std::path::Path) -> Result<()> {
    if !data_dir.exists() {
        std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        tracing::info!(path = %data_dir.display(), "Created data directory");
    }

    // User-only access on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(data_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(data_dir, perms) {
                    tracing::warn!(
                        path = %data_dir.display(),
                        error = %e,
                        "Failed to set data directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %data_dir.display(),
                    error = %e,
                    "Failed to read data directory metadata"
                );
            }
        }
    }

    Ok(())
}

fn announce_watching(config: &Config) {
    let minutes = config.check_interval().as_secs() / 60;
    println!(
        "Notifications enabled. Checking {} every {} minutes; press Ctrl-C to stop.",
        config.feed_url, minutes
    );
}

async fn run_until_interrupted(controller: &Arc<Controller>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    controller.stop_periodic_checks().await;
    println!("Stopped.");
    Ok(())
}

async fn print_status(controller: &Arc<Controller>, config: &Config) {
    let settings = controller.settings().await;
    let last_check = settings
        .last_check
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());

    println!("Supported:   {}", controller.is_supported());
    println!("Permission:  {}", controller.permission());
    println!("Enabled:     {}", settings.enabled);
    println!("Last check:  {}", last_check);
    println!("Feed:        {}", config.feed_url);
    println!("Interval:    {} minutes", config.check_interval().as_secs() / 60);
}

fn describe_check(outcome: CheckOutcome) -> &'static str {
    match outcome {
        CheckOutcome::Disabled => "Notifications are disabled; nothing checked.",
        CheckOutcome::NotPermitted => "Notification permission not granted; nothing checked.",
        CheckOutcome::RateLimited => "Checked recently; try again after the check interval.",
        CheckOutcome::Failed => "Feed check failed; see the log for details.",
        CheckOutcome::EmptyFeed => "The feed has no entries.",
        CheckOutcome::UpToDate => "No new bulletins.",
        CheckOutcome::NewEntry { shown: true } => "New bulletin found; notification shown.",
        CheckOutcome::NewEntry { shown: false } => {
            "New bulletin found, but the notification could not be shown."
        }
    }
}
