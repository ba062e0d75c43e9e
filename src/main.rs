use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use ghostbot::config::Config;
use ghostbot::credentials::{SecretKind, SecureCredentials};
use ghostbot::database::CampaignDatabase;
use ghostbot::dispatch::{CampaignRun, CancelFlag, Dispatcher, RunOutcome};
use ghostbot::followup::run_follow_ups;
use ghostbot::recipient::{parse_contacts_json, RecipientTable};
use ghostbot::replies::ImapReplyChecker;
use ghostbot::smtp::SmtpSender;
use ghostbot::store::{validate_campaign_name, CampaignStore};
use ghostbot::ledger::RecipientLedger;
use ghostbot::summary::{campaign_report, failure_details, summarize};
use ghostbot::template::MessageTemplate;

/// Send-once batched email campaigns
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value = "~/.config/ghostbot/config.json")]
    config: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import a JSON contact list into a campaign
    Import {
        #[clap(long)]
        campaign: String,

        /// JSON array of contact objects
        #[clap(long)]
        file: PathBuf,

        /// Replace the stored list instead of appending to it
        #[clap(long)]
        replace: bool,
    },

    /// List campaigns with their progress
    Campaigns,

    /// Show progress and failed recipients for one campaign
    Status {
        #[clap(long)]
        campaign: String,
    },

    /// Write sent and pending recipients of a campaign as JSON
    Export {
        #[clap(long)]
        campaign: String,

        /// Output file; prints to stdout when omitted
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Show the next batch without sending anything
    Plan {
        #[clap(long)]
        campaign: String,
    },

    /// Send pending messages
    Send {
        #[clap(long, conflicts_with = "all", required_unless_present = "all")]
        campaign: Option<String>,

        /// Send every stored campaign, each on its own worker
        #[clap(long)]
        all: bool,

        #[clap(long)]
        subject: String,

        /// HTML body; supports {name}, {email} and other contact fields
        #[clap(long)]
        body_file: PathBuf,
    },

    /// Send follow-ups to recipients who have not replied
    FollowUp {
        #[clap(long)]
        campaign: String,
    },

    /// Store the SMTP or IMAP password in the system keyring
    SetPassword {
        #[clap(long, value_enum)]
        kind: PasswordKind,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PasswordKind {
    Smtp,
    Imap,
}

impl From<PasswordKind> for SecretKind {
    fn from(kind: PasswordKind) -> Self {
        match kind {
            PasswordKind::Smtp => SecretKind::Smtp,
            PasswordKind::Imap => SecretKind::Imap,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger
    env_logger::Builder::new()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let config_path = shellexpand::tilde(&args.config).into_owned();
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    // Write defaults back on first run so there is a file to edit
    if !Path::new(&config_path).exists() {
        config.save(&config_path)?;
        println!("Created default config at {}", config_path);
    }

    match args.command {
        Commands::Import { campaign, file, replace } => import(&config, &campaign, &file, replace),
        Commands::Campaigns => list_campaigns(&config),
        Commands::Status { campaign } => status(&config, validate_campaign_name(&campaign)?),
        Commands::Export { campaign, output } => {
            export(&config, validate_campaign_name(&campaign)?, output.as_deref())
        }
        Commands::Plan { campaign } => plan(&config, validate_campaign_name(&campaign)?),
        Commands::Send { campaign, all, subject, body_file } => {
            let body = fs::read_to_string(&body_file)
                .with_context(|| format!("Failed to read {}", body_file.display()))?;
            let template = MessageTemplate::new(subject, body);
            let campaigns = match campaign {
                Some(campaign) => vec![validate_campaign_name(&campaign)?.to_string()],
                None if all => open_database(&config)?.campaigns()?,
                None => bail!("Either --campaign or --all is required"),
            };
            send(config, campaigns, template).await
        }
        Commands::FollowUp { campaign } => {
            let campaign = validate_campaign_name(&campaign)?.to_string();
            follow_up(config, campaign).await
        }
        Commands::SetPassword { kind } => set_password(&config, kind.into()),
    }
}

fn open_database(config: &Config) -> Result<CampaignDatabase> {
    CampaignDatabase::new(&config.database_path())
}

fn load_table(db: &CampaignDatabase, campaign: &str) -> Result<RecipientTable> {
    let campaign = validate_campaign_name(campaign)?;
    CampaignStore::load(db, campaign)?
        .with_context(|| format!("No campaign named '{}'; import a contact list first", campaign))
}

fn import(config: &Config, campaign: &str, file: &Path, replace: bool) -> Result<()> {
    let campaign = validate_campaign_name(campaign)?;
    let content = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let records = parse_contacts_json(&content)?;
    let (table, warnings) = RecipientTable::from_records(records);

    for warning in &warnings {
        warn!("{}", warning);
    }

    let db = open_database(config)?;
    let accepted = table.len();
    if replace {
        db.save(campaign, &table)?;
        println!("Imported {} recipients into '{}' ({} rejected)", accepted, campaign, warnings.len());
    } else {
        let added = db.append(campaign, table)?;
        println!(
            "Added {} new recipients to '{}' ({} already present, {} rejected)",
            added,
            campaign,
            accepted - added,
            warnings.len()
        );
    }
    Ok(())
}

fn list_campaigns(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let campaigns = db.campaigns()?;
    if campaigns.is_empty() {
        println!("No campaigns yet. Import one with `ghostbot import`.");
        return Ok(());
    }

    for campaign in campaigns {
        let table = load_table(&db, &campaign)?;
        println!("{:<24} {}", campaign, summarize(&db, &campaign, &table));
    }
    Ok(())
}

fn status(config: &Config, campaign: &str) -> Result<()> {
    let db = open_database(config)?;
    let table = load_table(&db, campaign)?;
    let window = chrono::Duration::hours(config.dispatch.quota_window_hours as i64);

    println!("{}: {}", campaign, summarize(&db, campaign, &table));
    println!(
        "Sent in the last {}h: {}",
        config.dispatch.quota_window_hours,
        db.sent_since(campaign, chrono::Utc::now() - window)
    );

    let failures = failure_details(&db, campaign, &table);
    if !failures.is_empty() {
        println!("Failed recipients:");
        for failure in failures {
            println!(
                "  {} ({} attempt(s), last {}): {}",
                failure.email,
                failure.attempts,
                failure.failed_at.to_rfc3339(),
                failure.error
            );
        }
    }
    Ok(())
}

fn export(config: &Config, campaign: &str, output: Option<&Path>) -> Result<()> {
    let db = open_database(config)?;
    let table = load_table(&db, campaign)?;
    let report = campaign_report(&db, campaign, &table);
    let json = serde_json::to_string_pretty(&report)?;

    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Wrote {} sent and {} pending recipients to {}",
                report.sent.len(),
                report.pending.len(),
                path.display()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn plan(config: &Config, campaign: &str) -> Result<()> {
    let db = open_database(config)?;
    let table = load_table(&db, campaign)?;
    let dispatcher = Dispatcher::new(&db, config.dispatch.to_settings()?);

    match dispatcher.next_batch(campaign, &table) {
        Some(batch) => {
            println!("Next batch #{} ({} recipients):", batch.index, batch.len());
            for recipient in &batch.recipients {
                println!("  {}", recipient.email);
            }
        }
        None => println!("Nothing pending for '{}'", campaign),
    }
    Ok(())
}

/// Cancels `flag` on the first Ctrl-C.
fn cancel_on_ctrl_c(flag: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current message and stopping");
            flag.cancel();
        }
    });
}

async fn send(config: Config, campaigns: Vec<String>, template: MessageTemplate) -> Result<()> {
    if campaigns.is_empty() {
        println!("No campaigns to send.");
        return Ok(());
    }
    // Fail fast on a bad dispatch section before any worker starts
    config.dispatch.to_settings()?;

    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(cancel.clone());

    let results = tokio::task::spawn_blocking(move || {
        let credentials = SecureCredentials::new();

        // A shared send quota is checked against the ledger, so campaigns take turns
        if config.dispatch.daily_quota.is_some() {
            return campaigns
                .iter()
                .map(|campaign| {
                    let result = send_campaign(&config, campaign, &template, &credentials, cancel.clone());
                    (campaign.clone(), result)
                })
                .collect::<Vec<_>>();
        }

        std::thread::scope(|scope| {
            let workers: Vec<_> = campaigns
                .iter()
                .map(|campaign| {
                    let (config, template, credentials, cancel) = (&config, &template, &credentials, cancel.clone());
                    let handle = scope.spawn(move || {
                        send_campaign(config, campaign, template, credentials, cancel)
                    });
                    (campaign.clone(), handle)
                })
                .collect();

            workers
                .into_iter()
                .map(|(campaign, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("Worker for '{}' panicked", campaign)));
                    (campaign, result)
                })
                .collect::<Vec<_>>()
        })
    })
    .await?;

    let mut failed = 0;
    for (campaign, result) in results {
        match result {
            Ok(run) => print_run(&campaign, &run),
            Err(e) => {
                failed += 1;
                error!("Campaign '{}' stopped: {:#}", campaign, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} campaign(s) stopped with an error", failed);
    }
    Ok(())
}

fn send_campaign(
    config: &Config,
    campaign: &str,
    template: &MessageTemplate,
    credentials: &SecureCredentials,
    cancel: CancelFlag,
) -> Result<CampaignRun> {
    let db = open_database(config)?;
    let table = load_table(&db, campaign)?;
    let mut sender = SmtpSender::new(&config.sender, credentials)?;
    let dispatcher = Dispatcher::new(&db, config.dispatch.to_settings()?).with_cancel_flag(cancel);

    info!("Sending '{}': {}", campaign, summarize(&db, campaign, &table));
    let run = dispatcher.run_campaign(campaign, &table, template, &mut sender)?;
    info!("'{}' now at {}", campaign, summarize(&db, campaign, &table));
    Ok(run)
}

fn print_run(campaign: &str, run: &CampaignRun) {
    println!(
        "{}: {} sent, {} failed in {} batch(es)",
        campaign,
        run.sent_count(),
        run.failed_count(),
        run.batches.len()
    );
    for (email, detail) in run.failures() {
        println!("  failed {}: {}", email, detail);
    }
    match &run.outcome {
        RunOutcome::Finished => {}
        RunOutcome::QuotaBlocked { resume_after } => {
            println!("  quota reached; run again after {}", resume_after.to_rfc3339())
        }
        RunOutcome::Cancelled => println!("  cancelled; remaining recipients are still pending"),
    }
}

async fn follow_up(config: Config, campaign: String) -> Result<()> {
    let campaign_name = campaign.clone();
    let inbox = config
        .inbox
        .clone()
        .context("Follow-ups need an `inbox` section in the config to check for replies")?;

    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let credentials = SecureCredentials::new();
        let db = open_database(&config)?;
        let table = load_table(&db, &campaign)?;
        let mut sender = SmtpSender::new(&config.sender, &credentials)?;
        let mut replies = ImapReplyChecker::new(inbox, &credentials)?;
        let dispatcher = Dispatcher::new(&db, config.dispatch.to_settings()?).with_cancel_flag(cancel);

        let report = run_follow_ups(
            &dispatcher,
            &campaign,
            &table,
            &config.follow_up.template(),
            config.follow_up.delay(),
            &mut sender,
            &mut replies,
        )?;
        Ok(report)
    })
    .await??;

    println!("{} already replied", report.replied.len());
    for (email, detail) in &report.unchecked {
        println!("  could not check {}: {}", email, detail);
    }
    match report.run {
        Some(run) => print_run(&format!("{} follow-ups", campaign_name), &run),
        None => println!("No follow-ups due"),
    }
    Ok(())
}

fn set_password(config: &Config, kind: SecretKind) -> Result<()> {
    let account = match kind {
        SecretKind::Smtp => config.sender.smtp_username.clone(),
        SecretKind::Imap => config
            .inbox
            .as_ref()
            .map(|inbox| inbox.imap_username.clone())
            .context("No `inbox` section in the config")?,
    };

    println!("Enter the {} password for {}:", kind.as_str(), account);
    let mut password = String::new();
    io::stdin().lock().read_line(&mut password)?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("Empty password, nothing stored");
    }

    SecureCredentials::new().store_password(&account, kind, password)?;
    println!("Password stored for {}", account);
    Ok(())
}
