//! VeilVault CLI - Command line front end for the vault security engine.
//!
//! Every command is translated into an engine request, so the CLI sees
//! exactly what any other client sees: a success flag, an error kind with
//! a fixed message, and a JSON payload.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use veilvault_api::{
    AuditExported, Engine, MasterKeyRecovered, PasswordChanged, ProfileCreated, Request, Response,
};
use veilvault_common::{FolderId, Passphrase, ProfileId};
use veilvault_profile::{
    EngineConfig, FolderSummary, ProfileSummary, RelockSummary, RotationReport, UnlockMode,
    UnlockSummary,
};
use veilvault_security::EventFilter;

#[derive(Parser)]
#[command(name = "veilvault")]
#[command(about = "VeilVault - Hide and encrypt folders behind a master key")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Engine data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print raw JSON responses.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new profile.
    CreateProfile {
        /// Display name.
        #[arg(short, long)]
        name: String,
    },

    /// List profiles.
    Profiles,

    /// Delete a profile and its vault.
    DeleteProfile {
        #[arg(short, long)]
        profile: String,
    },

    /// Check a master key without touching any folder.
    Verify {
        #[arg(short, long)]
        profile: String,
    },

    /// Lock (hide and encrypt) a folder.
    Lock {
        #[arg(short, long)]
        profile: String,

        /// Folder to lock.
        path: PathBuf,
    },

    /// Unlock every folder of a profile.
    Unlock {
        #[arg(short, long)]
        profile: String,

        /// Restore for good and drop the vault copies.
        #[arg(long)]
        permanent: bool,

        /// Unlock a single folder.
        #[arg(short, long)]
        folder: Option<String>,
    },

    /// Re-hide temporarily unlocked folders.
    Relock {
        #[arg(short, long)]
        profile: String,
    },

    /// Permanently unlock a folder and forget it.
    Remove {
        #[arg(short, long)]
        profile: String,

        #[arg(short, long)]
        folder: String,
    },

    /// List a profile's folders.
    Folders {
        #[arg(short, long)]
        profile: String,
    },

    /// Change a profile's master key.
    ChangePassword {
        #[arg(short, long)]
        profile: String,
    },

    /// Retry vault re-encryption left over from a password change.
    RetryRotation {
        #[arg(short, long)]
        profile: String,
    },

    /// Recover a master key from a recovery key.
    Recover,

    /// Make a profile the target of captured secrets.
    SetActive {
        #[arg(short, long)]
        profile: String,
    },

    /// Vault maintenance.
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },

    /// Security audit trail.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Read JSON requests from stdin, one per line, and answer on stdout.
    Pipe,
}

#[derive(Subcommand)]
enum VaultAction {
    /// Show the vault layout.
    Structure {
        #[arg(short, long)]
        profile: String,
    },
    /// Check the vault for damage.
    Verify {
        #[arg(short, long)]
        profile: String,
    },
    /// Repair a damaged vault from snapshots and backups.
    Recover {
        #[arg(short, long)]
        profile: String,
    },
    /// Snapshot vault metadata.
    Snapshot {
        #[arg(short, long)]
        profile: String,
    },
    /// Remove stale temporary files.
    Cleanup {
        #[arg(short, long)]
        profile: String,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Show recorded security events.
    Events {
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Count events by type and severity.
    Stats {
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Write events to a JSON file under the data directory's exports.
    Export {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        profile: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => dirs::data_local_dir()
            .context("No local data directory on this platform")?
            .join("veilvault"),
    };
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let engine = tokio::task::spawn_blocking(move || Engine::open(data_dir, config))
        .await?
        .context("Failed to open engine")?;
    let engine = Arc::new(engine);
    info!(data_dir = %engine.data_dir().display(), "Engine opened");

    let result = run(&engine, cli.command, cli.json).await;
    if let Err(e) = engine.flush() {
        debug!(error = %e, "Flushing security events failed");
    }
    result
}

async fn run(engine: &Arc<Engine>, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::CreateProfile { name } => cmd_create_profile(engine, name, json).await,
        Commands::Profiles => {
            let response = call(engine, Request::ListProfiles).await?;
            show(&response, json, |profiles: Vec<ProfileSummary>| {
                if profiles.is_empty() {
                    println!("No profiles.");
                }
                for p in profiles {
                    let active = if p.is_active { " (active)" } else { "" };
                    println!(
                        "  {}  {}{}  folders: {}  created: {}",
                        p.id, p.name, active, p.folder_count, p.created_at
                    );
                }
            })
        }
        Commands::DeleteProfile { profile } => {
            let profile_id = parse_profile(&profile)?;
            let master_key = prompt_secret("Master key: ")?;
            let response = call(
                engine,
                Request::DeleteProfile {
                    profile_id,
                    master_key,
                },
            )
            .await?;
            show(&response, json, |_: bool| println!("Profile deleted."))
        }
        Commands::Verify { profile } => {
            let profile_id = parse_profile(&profile)?;
            let master_key = prompt_secret("Master key: ")?;
            let response = call(
                engine,
                Request::VerifyMasterKey {
                    profile_id,
                    master_key,
                },
            )
            .await?;
            show(&response, json, |ok: bool| {
                println!("{}", if ok { "Master key accepted." } else { "Master key rejected." })
            })
        }
        Commands::Lock { profile, path } => {
            let profile_id = parse_profile(&profile)?;
            let master_key = prompt_secret("Master key: ")?;
            let response = call(
                engine,
                Request::LockFolder {
                    profile_id,
                    master_key,
                    path,
                },
            )
            .await?;
            show(&response, json, |hidden: serde_json::Value| {
                println!("Folder locked: {}", hidden["folder_id"]);
                if hidden["fallback_used"] == true {
                    println!("  hidden with a placeholder; removal was not permitted");
                }
            })
        }
        Commands::Unlock {
            profile,
            permanent,
            folder,
        } => {
            let profile_id = parse_profile(&profile)?;
            let master_key = prompt_secret("Master key: ")?;
            let mode = if permanent {
                UnlockMode::Permanent
            } else {
                UnlockMode::Temporary
            };
            let request = match folder {
                Some(folder) => Request::UnlockFolder {
                    profile_id,
                    master_key,
                    folder_id: FolderId::new(folder).context("Invalid folder id")?,
                    mode,
                },
                None => Request::UnlockFolders {
                    profile_id,
                    master_key,
                    mode,
                },
            };
            let single = matches!(request, Request::UnlockFolder { .. });
            let response = call(engine, request).await?;
            if single {
                show(&response, json, |result: serde_json::Value| {
                    println!("Folder unlocked: {}", result["restored_path"])
                })
            } else {
                show(&response, json, print_unlock_summary)
            }
        }
        Commands::Relock { profile } => {
            let profile_id = parse_profile(&profile)?;
            let master_key = prompt_secret("Master key: ")?;
            let response = call(
                engine,
                Request::RelockFolders {
                    profile_id,
                    master_key,
                },
            )
            .await?;
            show(&response, json, |summary: RelockSummary| {
                println!("Relocked {} folder(s).", summary.relocked.len());
                for failure in summary.failed {
                    println!("  failed: {} ({:?})", failure.folder_id, failure.error_kind);
                }
            })
        }
        Commands::Remove { profile, folder } => {
            let profile_id = parse_profile(&profile)?;
            let folder_id = FolderId::new(folder).context("Invalid folder id")?;
            let master_key = prompt_secret("Master key: ")?;
            let response = call(
                engine,
                Request::RemoveFolder {
                    profile_id,
                    master_key,
                    folder_id,
                },
            )
            .await?;
            show(&response, json, |_: serde_json::Value| {
                println!("Folder restored and removed from the vault.")
            })
        }
        Commands::Folders { profile } => {
            let profile_id = parse_profile(&profile)?;
            let response = call(engine, Request::ListFolders { profile_id }).await?;
            show(&response, json, |folders: Vec<FolderSummary>| {
                if folders.is_empty() {
                    println!("No folders.");
                }
                for f in folders {
                    let pending = if f.awaiting_reencryption {
                        "  [awaiting re-encryption]"
                    } else {
                        ""
                    };
                    println!(
                        "  {}  {:?}  {}{}",
                        f.folder_id,
                        f.state,
                        f.original_path.display(),
                        pending
                    );
                }
            })
        }
        Commands::ChangePassword { profile } => cmd_change_password(engine, profile, json).await,
        Commands::RetryRotation { profile } => {
            let profile_id = parse_profile(&profile)?;
            let master_key = prompt_secret("Master key: ")?;
            let response = call(
                engine,
                Request::RetryFolderReencryption {
                    profile_id,
                    master_key,
                },
            )
            .await?;
            show(&response, json, |report: RotationReport| {
                println!(
                    "Re-encrypted {} folder(s), {} still pending.",
                    report.reencrypted.len(),
                    report.failed.len()
                )
            })
        }
        Commands::Recover => {
            let recovery_key = prompt_secret("Recovery key: ")?;
            let response = call(engine, Request::RecoverMasterKey { recovery_key }).await?;
            show(&response, json, |recovered: MasterKeyRecovered| {
                println!("Profile: {}", recovered.profile_id);
                println!("Master key: {}", recovered.master_key);
            })
        }
        Commands::SetActive { profile } => {
            let profile_id = parse_profile(&profile)?;
            let response = call(engine, Request::SetActiveProfile { profile_id }).await?;
            show(&response, json, |id: ProfileId| println!("Active profile: {}", id))
        }
        Commands::Vault { action } => cmd_vault(engine, action, json).await,
        Commands::Audit { action } => cmd_audit(engine, action, json).await,
        Commands::Pipe => cmd_pipe(engine).await,
    }
}

/// Create a profile and show its recovery key once.
async fn cmd_create_profile(engine: &Arc<Engine>, name: String, json: bool) -> Result<()> {
    info!("Creating profile: {}", name);

    let master_key = prompt_new_secret("Master key: ", "Confirm master key: ")?;
    let response = call(engine, Request::CreateProfile { name, master_key }).await?;
    show(&response, json, |created: ProfileCreated| {
        println!("Profile created successfully!");
        println!("  ID: {}", created.profile_id);
        println!("  Recovery key: {}", created.recovery_key);
        println!("\nStore the recovery key somewhere safe. It is not shown again.");
    })
}

async fn cmd_change_password(engine: &Arc<Engine>, profile: String, json: bool) -> Result<()> {
    info!("Changing master key for profile {}", profile);

    let profile_id = parse_profile(&profile)?;
    let old_master_key = prompt_secret("Current master key: ")?;
    let new_master_key = prompt_new_secret("New master key: ", "Confirm new master key: ")?;
    let response = call(
        engine,
        Request::ChangeProfilePassword {
            profile_id,
            old_master_key,
            new_master_key,
        },
    )
    .await?;
    show(&response, json, |changed: PasswordChanged| {
        println!("Master key changed successfully!");
        println!("  New recovery key: {}", changed.recovery_key);
        println!("  Folders re-encrypted: {}", changed.rotation.reencrypted.len());
        if !changed.rotation.failed.is_empty() {
            println!(
                "  Folders awaiting re-encryption: {} (run retry-rotation)",
                changed.rotation.failed.len()
            );
        }
    })
}

async fn cmd_vault(engine: &Arc<Engine>, action: VaultAction, json: bool) -> Result<()> {
    let request = match action {
        VaultAction::Structure { profile } => Request::GetVaultStructure {
            profile_id: parse_profile(&profile)?,
        },
        VaultAction::Verify { profile } => Request::ValidateVaultIntegrity {
            profile_id: parse_profile(&profile)?,
        },
        VaultAction::Recover { profile } => Request::AttemptVaultRecovery {
            profile_id: parse_profile(&profile)?,
        },
        VaultAction::Snapshot { profile } => Request::SnapshotVault {
            profile_id: parse_profile(&profile)?,
        },
        VaultAction::Cleanup { profile } => Request::CleanupTempArea {
            profile_id: parse_profile(&profile)?,
        },
    };
    let verify = matches!(request, Request::ValidateVaultIntegrity { .. });
    let response = call(engine, request).await?;
    if verify && !json {
        return show(&response, json, |valid: bool| {
            println!("{}", if valid { "Vault is intact." } else { "Vault is damaged." })
        });
    }
    show(&response, true, |_: serde_json::Value| {})
}

async fn cmd_audit(engine: &Arc<Engine>, action: AuditAction, json: bool) -> Result<()> {
    let filter = |profile: Option<String>| -> Result<EventFilter> {
        Ok(EventFilter {
            profile_id: profile.as_deref().map(parse_profile).transpose()?,
            ..EventFilter::default()
        })
    };
    let request = match action {
        AuditAction::Events { profile } => Request::SecurityEvents {
            filter: filter(profile)?,
        },
        AuditAction::Stats { profile } => Request::EventStatistics {
            filter: filter(profile)?,
        },
        AuditAction::Export { name, profile } => Request::ExportAuditLog {
            file_name: name,
            filter: filter(profile)?,
        },
    };
    let export = matches!(request, Request::ExportAuditLog { .. });
    let response = call(engine, request).await?;
    if export && !json {
        return show(&response, json, |exported: AuditExported| {
            println!("Exported {} event(s) to {}", exported.events, exported.path.display())
        });
    }
    show(&response, true, |_: serde_json::Value| {})
}

/// Answer newline-delimited JSON requests until stdin closes.
async fn cmd_pipe(engine: &Arc<Engine>) -> Result<()> {
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || -> Result<()> {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout().lock();
        for line in stdin.lock().lines() {
            let line = line.context("Failed to read request")?;
            if line.trim().is_empty() {
                continue;
            }
            let answer = engine.handle_json(&line);
            writeln!(stdout, "{}", answer).context("Failed to write response")?;
            stdout.flush()?;
        }
        Ok(())
    })
    .await?
}

async fn call(engine: &Arc<Engine>, request: Request) -> Result<Response> {
    let engine = Arc::clone(engine);
    let op = request.op();
    debug!(op, "Dispatching request");
    tokio::task::spawn_blocking(move || engine.handle(request))
        .await
        .with_context(|| format!("Request {} did not complete", op))
}

/// Print a response, either as JSON or through `render`.
fn show<T, F>(response: &Response, json: bool, render: F) -> Result<()>
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T),
{
    if !response.success {
        let message = response.message.as_deref().unwrap_or("Operation failed");
        anyhow::bail!("{}", message);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    let payload = response
        .payload_as::<T>()
        .context("Unexpected response payload")?;
    render(payload);
    Ok(())
}

fn print_unlock_summary(summary: UnlockSummary) {
    println!("Unlocked {} folder(s).", summary.unlocked.len());
    for result in &summary.unlocked {
        println!("  {}  {}", result.folder_id, result.restored_path.display());
        if !result.metadata_restored {
            println!("    metadata not fully restored");
        }
    }
    for failure in &summary.failed {
        println!("  failed: {} ({:?})", failure.folder_id, failure.error_kind);
    }
}

fn parse_profile(raw: &str) -> Result<ProfileId> {
    ProfileId::new(raw).context("Invalid profile id")
}

fn prompt_secret(prompt: &str) -> Result<Passphrase> {
    let secret = rpassword::prompt_password(prompt).context("Failed to read secret")?;
    Ok(Passphrase::new(secret))
}

fn prompt_new_secret(prompt: &str, confirm: &str) -> Result<Passphrase> {
    let secret = prompt_secret(prompt)?;
    let again = prompt_secret(confirm)?;

    if secret != again {
        anyhow::bail!("Keys do not match");
    }
    if secret.is_empty() {
        anyhow::bail!("Key cannot be empty");
    }
    Ok(secret)
}
