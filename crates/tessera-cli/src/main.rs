use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sea_orm_migration::MigratorTrait;
use tessera_core::audit::HistoryFilter;
use tessera_core::cleanup::spawn_maintenance_task;
use tessera_core::migrations::Migrator;
use tessera_core::{Config, RevokeReason, SessionService, db, logging};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Administer sessions, lockouts and the login audit trail")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database operations
    Db {
        #[command(subcommand)]
        action: DbCommands,
    },
    /// Session policy
    Policy {
        #[command(subcommand)]
        action: PolicyCommands,
    },
    /// Deactivate expired sessions now
    Sweep,
    /// Apply retention to old sessions and audit entries
    Purge,
    /// Session counts
    Stats,
    /// Login security report
    Report {
        /// Look-back window in hours
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Brute-force sources and users seen from many addresses
    Suspicious {
        /// Look-back window in hours
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// List a user's active sessions
    Sessions {
        user_id: i32,
    },
    /// Recent audit entries
    History {
        #[arg(long)]
        user_id: Option<i32>,
        #[arg(long)]
        login: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// End one session by id
    Revoke {
        session_id: i32,
        #[arg(long, default_value = "admin")]
        reason: String,
    },
    /// End every session of a user
    RevokeUser {
        user_id: i32,
        #[arg(long, default_value = "admin")]
        reason: String,
    },
    /// Run the maintenance loop until Ctrl-C
    Maintain,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run pending migrations
    Migrate,
    /// Roll back the most recent migrations
    Rollback {
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Print every setting
    Show,
    /// Change one setting
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    logging::init_for_environment(&config.environment);

    let conn = db::connect(&config).await?;

    if let Commands::Db { action } = &cli.command {
        match action {
            DbCommands::Migrate => {
                println!("Running pending migrations...");
                Migrator::up(&conn, None).await?;
                println!("Done.");
            }
            DbCommands::Rollback { steps } => {
                println!("Rolling back {} migration(s)...", steps);
                Migrator::down(&conn, Some(*steps)).await?;
                println!("Done.");
            }
        }
        return Ok(());
    }

    let service = Arc::new(SessionService::new(conn, &config)?);

    match cli.command {
        Commands::Db { .. } => {}
        Commands::Policy { action } => match action {
            PolicyCommands::Show => {
                for row in service.settings().rows().await? {
                    println!(
                        "{:<30} {:<12} {}",
                        row.key,
                        row.value,
                        row.description.unwrap_or_default()
                    );
                }
            }
            PolicyCommands::Set { key, value } => {
                let policy = service.settings().update_setting(&key, &value).await?;
                println!("{} = {}", key, value);
                println!("{:#?}", policy);
            }
        },
        Commands::Sweep => {
            let swept = service.cleanup_expired().await?;
            println!("Deactivated {} expired session(s)", swept);
        }
        Commands::Purge => {
            let outcome = service.purge_retained().await?;
            println!(
                "Purged {} session row(s) and {} audit entr(ies)",
                outcome.sessions, outcome.log_entries
            );
        }
        Commands::Stats => {
            let stats = service.session_statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Report { hours } => {
            let report = service.security_report(hours).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Suspicious { hours } => {
            let findings = service.suspicious_activity(hours).await?;
            if findings.is_empty() {
                println!("No suspicious activity in the last {} hour(s)", hours);
            } else {
                println!("{}", serde_json::to_string_pretty(&findings)?);
            }
        }
        Commands::Sessions { user_id } => {
            let sessions = service.list_active_sessions(user_id).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        Commands::History {
            user_id,
            login,
            limit,
        } => {
            let entries = service
                .audit()
                .history(HistoryFilter {
                    user_id,
                    login,
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            for e in entries {
                println!(
                    "{} {:<24} user={:<6} login={:<16} ip={:<15} ok={} {}",
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                    e.action,
                    e.user_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    e.login,
                    e.ip_address.as_deref().unwrap_or("-"),
                    e.success,
                    e.reason.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Revoke { session_id, reason } => {
            let reason: RevokeReason = reason.parse()?;
            if service.invalidate_session_by_id(session_id, reason).await? {
                println!("Session {} revoked", session_id);
            } else {
                println!("Session {} was already inactive", session_id);
            }
        }
        Commands::RevokeUser { user_id, reason } => {
            let reason: RevokeReason = reason.parse()?;
            let count = service.invalidate_all_for_user(user_id, reason).await?;
            println!("Revoked {} session(s) for user {}", count, user_id);
        }
        Commands::Maintain => {
            let restored = service.restore_lockouts().await?;
            tracing::info!(restored, "lockout counters restored");

            let cancel = CancellationToken::new();
            let handle = spawn_maintenance_task(
                Arc::clone(&service),
                Duration::from_secs(config.cleanup_interval_secs.max(1)),
                cancel.clone(),
            );
            println!(
                "Maintenance running every {}s, press Ctrl-C to stop",
                config.cleanup_interval_secs
            );

            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            handle.await?;
        }
    }

    Ok(())
}
