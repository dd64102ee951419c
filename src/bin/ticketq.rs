//! ticketq CLI: operator and worker interface to a ticket store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Duration;
use clap::{Parser, Subcommand};
use serde::Serialize;
use ticketq::activity::{ActivityEntry, Actor};
use ticketq::config::Config;
use ticketq::engine::{Engine, ReleaseBy, SweepConfig, Sweeper};
use ticketq::model::*;
use ticketq::store::SqliteStore;
use ticketq::telemetry::{TelemetryConfig, init_telemetry};
use ticketq::{Error, ErrorKind};

#[derive(Parser)]
#[command(name = "ticketq", about = "Ticket queue for humans and agents")]
struct Cli {
    /// Config file (defaults to ./ticketq.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database file, overriding config and TICKETQ_DB
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Name recorded as the human actor
    #[arg(long, global = true, env = "USER", default_value = "operator")]
    actor: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a ticket
    Create {
        /// Project key, e.g. CORE
        project: String,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "medium")]
        priority: Priority,
        #[arg(long)]
        parent: Option<TicketId>,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Show a ticket with its claim and prerequisites
    Show { id: TicketId },
    /// List tickets in queue order
    List {
        #[arg(long)]
        project: Option<String>,
        /// Repeatable
        #[arg(long)]
        status: Vec<Status>,
        #[arg(long)]
        parent: Option<TicketId>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Claim a ready ticket
    Claim {
        id: TicketId,
        #[arg(long)]
        worker: String,
        /// Lease length in seconds
        #[arg(long)]
        lease_secs: Option<i64>,
    },
    /// Claim the next ready ticket by priority and age
    ClaimNext {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        lease_secs: Option<i64>,
    },
    /// Extend a lease
    Renew {
        id: TicketId,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        lease_secs: Option<i64>,
    },
    /// Release a claim back to the queue
    Release {
        id: TicketId,
        /// Holder releasing its own claim; omit to release as operator
        #[arg(long)]
        worker: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Hand finished work to review
    Complete {
        id: TicketId,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        summary: Option<String>,
    },
    /// Route a ticket to human attention
    Flag { id: TicketId, reason: String },
    /// Answer a flagged ticket
    Respond { id: TicketId, answer: String },
    /// Accept reviewed work
    Accept { id: TicketId },
    /// Send reviewed work back to the queue
    Reject { id: TicketId, reason: String },
    /// Close a ticket without completing it
    Cancel {
        id: TicketId,
        #[arg(long, default_value = "wont_do")]
        resolution: Resolution,
    },
    /// Reopen a closed ticket
    Reopen { id: TicketId },
    /// Dependency edges
    Dep {
        #[command(subcommand)]
        action: DepAction,
    },
    /// Show a ticket's activity log
    Log { id: TicketId },
    /// Expire lapsed leases
    Expire {
        /// Report what would happen without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Expire a single ticket's lease
        #[arg(long)]
        ticket: Option<TicketId>,
    },
    /// Re-check every blocked ticket
    Resolve,
    /// Run the expiry sweep until interrupted
    Sweep {
        /// Seconds between passes (defaults to config)
        #[arg(long)]
        interval: Option<u64>,
        /// Also re-check blocked tickets on every pass
        #[arg(long)]
        resolve: bool,
    },
}

#[derive(Subcommand)]
enum DepAction {
    /// Make DEPENDENT wait on PREREQUISITE
    Add {
        dependent: TicketId,
        prerequisite: TicketId,
    },
    /// Remove an edge
    Remove {
        dependent: TicketId,
        prerequisite: TicketId,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(e),
    }
}

/// Print the error (and hint) and map its kind to the exit code.
fn report(e: anyhow::Error) -> ExitCode {
    match e.downcast_ref::<Error>() {
        Some(err) => {
            eprintln!("error: {err}");
            if let Some(hint) = err.hint() {
                eprintln!("hint: {hint}");
            }
            ExitCode::from(err.kind().code())
        }
        None => {
            eprintln!("error: {e:#}");
            ExitCode::from(ErrorKind::General.code())
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database = db;
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "ticketq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let engine = Engine::new(SqliteStore::open(&config.database)?)
        .with_config(config.engine_config());
    let out = Output { json: cli.json };
    let me = Actor::human(cli.actor);

    match cli.command {
        Command::Create {
            project,
            title,
            description,
            priority,
            parent,
            max_retries,
        } => {
            let mut new = NewTicket::new(project, title)
                .description(description)
                .priority(priority);
            if let Some(parent) = parent {
                new = new.parent(parent);
            }
            if let Some(n) = max_retries {
                new = new.max_retries(n);
            }
            out.ticket(&engine.create_ticket(new, &me)?)
        }
        Command::Show { id } => cmd_show(&engine, &out, &id),
        Command::List {
            project,
            status,
            parent,
            limit,
        } => {
            let filter = TicketFilter {
                project,
                statuses: status,
                parent,
                priority: None,
                limit: Some(limit),
            };
            out.tickets(&engine.list_tickets(&filter)?)
        }
        Command::Claim {
            id,
            worker,
            lease_secs,
        } => out.claim(&engine.claim(&id, &worker, lease(lease_secs))?),
        Command::ClaimNext {
            project,
            worker,
            lease_secs,
        } => match engine.claim_next(project.as_deref(), &worker, lease(lease_secs))? {
            Some(claim) => out.claim(&claim),
            None => out.message("no ready tickets"),
        },
        Command::Renew {
            id,
            worker,
            lease_secs,
        } => out.claim(&engine.renew(&id, &worker, lease(lease_secs))?),
        Command::Release { id, worker, reason } => {
            let by = match worker {
                Some(worker) => ReleaseBy::Holder(worker),
                None => ReleaseBy::Operator(me.name().unwrap_or("operator").to_string()),
            };
            out.ticket(&engine.release(&id, &by, reason.as_deref())?)
        }
        Command::Complete {
            id,
            worker,
            summary,
        } => out.ticket(&engine.complete(&id, &worker, summary.as_deref())?),
        Command::Flag { id, reason } => out.ticket(&engine.flag(&id, &me, &reason)?),
        Command::Respond { id, answer } => out.ticket(&engine.respond(&id, &me, &answer)?),
        Command::Accept { id } => {
            let closed = engine.accept(&id, &me)?;
            out.closed(&closed.ticket, &closed.propagation)
        }
        Command::Reject { id, reason } => out.ticket(&engine.reject(&id, &me, &reason)?),
        Command::Cancel { id, resolution } => {
            let closed = engine.cancel(&id, &me, resolution)?;
            out.closed(&closed.ticket, &closed.propagation)
        }
        Command::Reopen { id } => out.ticket(&engine.reopen(&id, &me)?),
        Command::Dep { action } => match action {
            DepAction::Add {
                dependent,
                prerequisite,
            } => out.ticket(&engine.add_dependency(&dependent, &prerequisite, &me)?),
            DepAction::Remove {
                dependent,
                prerequisite,
            } => out.ticket(&engine.remove_dependency(&dependent, &prerequisite, &me)?),
        },
        Command::Log { id } => out.activity(&engine.activity(&id)?),
        Command::Expire { dry_run, ticket } => match ticket {
            Some(id) => {
                let decision = engine.expire_one(&id)?;
                out.message(&format!("{id}: {}", decision.as_str()))
            }
            None => {
                let report = engine.expire_all(dry_run)?;
                out.report(&report, || {
                    format!(
                        "{}examined {}, requeued {}, escalated {}, skipped {}, errors {}",
                        if report.dry_run { "(dry run) " } else { "" },
                        report.examined,
                        report.requeued,
                        report.escalated,
                        report.skipped,
                        report.errors
                    )
                })
            }
        },
        Command::Resolve => {
            let report = engine.resolve_all()?;
            out.report(&report, || {
                format!(
                    "examined {}, unblocked {}, still blocked {}, errors {}",
                    report.examined,
                    report.unblocked,
                    report.still_blocked,
                    report.errors.len()
                )
            })
        }
        Command::Sweep { interval, resolve } => {
            let interval = interval
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| config.sweep_interval());
            cmd_sweep(engine, SweepConfig { interval, resolve }).await
        }
    }
}

fn lease(secs: Option<i64>) -> Option<Duration> {
    secs.map(Duration::seconds)
}

fn cmd_show(engine: &Engine<SqliteStore>, out: &Output, id: &TicketId) -> anyhow::Result<()> {
    let ticket = engine.get_ticket(id)?;
    let claim = engine.active_claim(id)?;
    let prerequisites = engine.prerequisites(id)?;

    if out.json {
        return out.print_json(&serde_json::json!({
            "ticket": ticket,
            "claim": claim,
            "prerequisites": prerequisites,
        }));
    }
    println!("ID:          {}", ticket.id);
    println!("Title:       {}", ticket.title);
    println!("Status:      {}", ticket.status);
    println!("Priority:    {}", ticket.priority);
    println!("Retries:     {}/{}", ticket.retry_count, ticket.max_retries);
    if let Some(ref parent) = ticket.parent {
        println!("Parent:      {parent}");
    }
    if let Some(resolution) = ticket.resolution {
        println!("Resolution:  {resolution}");
    }
    if let Some(ref reason) = ticket.human_flag_reason {
        println!("Flagged:     {reason}");
    }
    if !prerequisites.is_empty() {
        let list: Vec<String> = prerequisites.iter().map(ToString::to_string).collect();
        println!("Depends on:  {}", list.join(", "));
    }
    if let Some(claim) = claim {
        println!(
            "Claimed by:  {} until {}",
            claim.worker_id,
            claim.expires_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("Created:     {}", ticket.created_at);
    println!("Updated:     {}", ticket.updated_at);
    if let Some(completed) = ticket.completed_at {
        println!("Completed:   {completed}");
    }
    if !ticket.description.is_empty() {
        println!("---\n{}", ticket.description);
    }
    Ok(())
}

async fn cmd_sweep(engine: Engine<SqliteStore>, config: SweepConfig) -> anyhow::Result<()> {
    let sweeper = Sweeper::new(Arc::new(engine), config);

    let handle = sweeper.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    sweeper.run().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

struct Output {
    json: bool,
}

impl Output {
    fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn message(&self, text: &str) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(&serde_json::json!({ "message": text }));
        }
        println!("{text}");
        Ok(())
    }

    fn ticket(&self, ticket: &Ticket) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(ticket);
        }
        println!("{}  {}  {}", ticket.id, ticket.status, ticket.title);
        Ok(())
    }

    fn tickets(&self, tickets: &[Ticket]) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(tickets);
        }
        if tickets.is_empty() {
            println!("No tickets found.");
            return Ok(());
        }
        println!(
            "{:<12}  {:<12}  {:<8}  {:<7}  TITLE",
            "ID", "STATUS", "PRIORITY", "RETRIES"
        );
        println!("{}", "-".repeat(80));
        for t in tickets {
            println!(
                "{:<12}  {:<12}  {:<8}  {:<7}  {}",
                t.id.to_string(),
                t.status.as_str(),
                t.priority.to_string(),
                format!("{}/{}", t.retry_count, t.max_retries),
                t.title
            );
        }
        println!("\n{} ticket(s)", tickets.len());
        Ok(())
    }

    fn claim(&self, claim: &Claim) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(claim);
        }
        println!(
            "{} claimed by {} until {} (claim {})",
            claim.ticket_id,
            claim.worker_id,
            claim.expires_at.format("%Y-%m-%d %H:%M:%S"),
            claim.id
        );
        Ok(())
    }

    fn closed<R: Serialize>(&self, ticket: &Ticket, propagation: &R) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(&serde_json::json!({
                "ticket": ticket,
                "propagation": propagation,
            }));
        }
        self.ticket(ticket)
    }

    fn activity(&self, entries: &[ActivityEntry]) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(entries);
        }
        for e in entries {
            let details = e
                .details
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_default();
            println!(
                "{}  {:<18}  {:<20}  {}",
                e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                e.action.as_str(),
                e.actor.to_string(),
                details
            );
        }
        Ok(())
    }

    fn report<R: Serialize>(&self, report: &R, summary: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(report);
        }
        println!("{}", summary());
        Ok(())
    }
}
