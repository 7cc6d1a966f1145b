use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use lakeward::core::types::{CredentialStatus, HealthSnapshot};
use lakeward::orchestrator::EXIT_LOCK_HELD;
use lakeward::{
    HealthMonitor, Orchestrator, RunOptions, RunSummary, RuntimeContext, Scheduler,
    SessionAcquirer, ZoneLayout,
};

#[derive(Parser)]
#[command(
    name = "lakeward",
    version,
    about = "Multi-zone ingestion and promotion engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run, inspect, or verify the promotion pipeline.
    #[command(subcommand)]
    Pipeline(PipelineCommand),
    /// Inspect or refresh per-service credentials.
    #[command(subcommand)]
    Credentials(CredentialsCommand),
    /// Scheduler daemon control.
    #[command(subcommand)]
    Scheduler(SchedulerCommand),
}

#[derive(Subcommand)]
enum PipelineCommand {
    /// Invoke one orchestration pass.
    Run(RunArgs),
    /// Emit the current health snapshot.
    Status(StatusArgs),
    /// Recompute zone digests and compare against the hash indexes.
    Verify(VerifyArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Restrict to a comma-separated service list.
    #[arg(long, value_delimiter = ',')]
    services: Option<Vec<String>>,
    /// Skip extractor units; run cleaners only.
    #[arg(long)]
    no_extractors: bool,
    /// Skip cleaner units; run extractors only.
    #[arg(long)]
    no_cleaners: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Emit the snapshot as JSON instead of the table.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct VerifyArgs {
    #[arg(long, value_delimiter = ',')]
    services: Option<Vec<String>>,
}

#[derive(Subcommand)]
enum CredentialsCommand {
    /// Report credential status for a (service, account) pair.
    Check(CredentialArgs),
    /// Force an interactive refresh.
    Refresh(RefreshArgs),
}

#[derive(Args)]
struct CredentialArgs {
    #[arg(long)]
    service: String,
    #[arg(long)]
    account: Option<String>,
}

#[derive(Args)]
struct RefreshArgs {
    #[arg(long)]
    service: String,
    #[arg(long)]
    account: Option<String>,
    /// Refresh every declared account of the service.
    #[arg(long)]
    all: bool,
}

#[derive(Subcommand)]
enum SchedulerCommand {
    /// Start the scheduler with the configured triggers.
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL")
            .ok()
            .filter(|v| matches!(v.as_str(), "debug" | "info" | "warn" | "error"))
            .unwrap_or_else(|| "info".to_string());
        tracing_subscriber::EnvFilter::new(format!("lakeward={}", level))
    });
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let ctx = RuntimeContext::bootstrap()?;

    let exit_code = match cli.command {
        Command::Pipeline(PipelineCommand::Run(args)) => run_pipeline(ctx, args).await,
        Command::Pipeline(PipelineCommand::Status(args)) => pipeline_status(ctx, args),
        Command::Pipeline(PipelineCommand::Verify(args)) => pipeline_verify(ctx, args),
        Command::Credentials(CredentialsCommand::Check(args)) => credentials_check(ctx, args),
        Command::Credentials(CredentialsCommand::Refresh(args)) => {
            credentials_refresh(ctx, args).await
        }
        Command::Scheduler(SchedulerCommand::Daemon) => {
            Scheduler::new(ctx).daemon().await?;
            0
        }
    };

    std::process::exit(exit_code);
}

async fn run_pipeline(ctx: RuntimeContext, args: RunArgs) -> i32 {
    let orchestrator = Orchestrator::new(ctx);
    let opts = RunOptions {
        services: args.services,
        no_extractors: args.no_extractors,
        no_cleaners: args.no_cleaners,
    };
    match orchestrator.run(&opts).await {
        Ok(RunSummary::Completed(report)) => {
            for service in &report.services {
                let marker = if service.failed { "✗" } else { "✓" };
                println!(
                    "{} {} — {} unit(s), curated: {}",
                    marker,
                    service.service,
                    service.units.len(),
                    if service.reached_curated { "yes" } else { "no" }
                );
                for unit in &service.units {
                    if let Some(detail) = &unit.detail {
                        println!("    {} [{}] {:?}: {}", unit.unit, unit.stage, unit.outcome, detail);
                    }
                }
            }
            report.classification.exit_code()
        }
        Ok(RunSummary::AlreadyRunning) => {
            error!("another orchestration pass is already running");
            EXIT_LOCK_HELD
        }
        Err(e) => {
            error!("pipeline run failed: {}", e);
            3
        }
    }
}

fn pipeline_status(ctx: RuntimeContext, args: StatusArgs) -> i32 {
    let monitor = HealthMonitor::new(ctx);
    let snapshot = match monitor.snapshot() {
        Ok(s) => s,
        Err(e) => {
            error!("health snapshot failed: {}", e);
            return 5;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("snapshot serialize failed: {}", e);
                return 5;
            }
        }
    } else {
        print_snapshot(&snapshot);
    }
    snapshot.overall.exit_code()
}

fn print_snapshot(snapshot: &HealthSnapshot) {
    println!(
        "overall: {:?} ({} service(s), generated {})",
        snapshot.overall,
        snapshot.services.len(),
        snapshot.generated_at.to_rfc3339()
    );
    for service in &snapshot.services {
        println!(
            "\n{} — {:?} (score {})",
            service.service, service.status, service.health_score
        );
        for zone in &service.freshness {
            match zone.age_days {
                Some(age) => println!(
                    "  {:<8} {:>4} file(s), newest {:.1}d old",
                    zone.zone, zone.file_count, age
                ),
                None => println!("  {:<8} empty", zone.zone),
            }
        }
        for cred in &service.credentials {
            println!("  credentials[{}]: {:?}", cred.account, cred.status);
        }
        for bottleneck in &service.bottlenecks {
            println!("  bottleneck: {} — {}", bottleneck.kind, bottleneck.detail);
        }
        for rec in &service.recommendations {
            println!("  → {}", rec);
        }
    }
    if !snapshot.auto_actions.is_empty() {
        println!("\nremediation plan:");
        for action in &snapshot.auto_actions {
            println!(
                "  [{:?}] {:?} {} — {}",
                action.priority, action.kind, action.service, action.reason
            );
        }
    }
}

fn pipeline_verify(ctx: RuntimeContext, args: VerifyArgs) -> i32 {
    use lakeward::services::registry::discover_services;
    use lakeward::zones::PromotionEngine;

    let services = match discover_services(&ctx.project_root, &ctx.config) {
        Ok(s) => s,
        Err(e) => {
            error!("service discovery failed: {}", e);
            return 3;
        }
    };
    let engine = PromotionEngine::new(ZoneLayout::new(ctx.project_root.clone()));

    let mut mismatch_count = 0usize;
    for spec in services {
        if let Some(wanted) = &args.services {
            if !wanted.iter().any(|w| w == &spec.name) {
                continue;
            }
        }
        match engine.verify(&spec.name) {
            Ok(mismatches) => {
                for m in &mismatches {
                    match &m.actual {
                        Some(actual) => println!(
                            "{}/{}: {} — indexed {} but found {}",
                            m.zone, spec.name, m.rel_path, m.expected, actual
                        ),
                        None => println!(
                            "{}/{}: {} — indexed but missing on disk",
                            m.zone, spec.name, m.rel_path
                        ),
                    }
                }
                mismatch_count += mismatches.len();
            }
            Err(e) => {
                error!("verify failed for {}: {}", spec.name, e);
                mismatch_count += 1;
            }
        }
    }

    if mismatch_count == 0 {
        info!("verify: all hash indexes consistent");
        0
    } else {
        error!("verify: {} mismatch(es)", mismatch_count);
        3
    }
}

fn credentials_check(ctx: RuntimeContext, args: CredentialArgs) -> i32 {
    let layout = ZoneLayout::new(ctx.project_root.clone());
    let store = lakeward::CredentialStore::new(layout);
    let policy = ctx.config.policy(&args.service);

    match store.status(&args.service, args.account.as_deref(), &policy) {
        Ok(status) => {
            println!(
                "{}/{}: {:?}",
                args.service,
                args.account.as_deref().unwrap_or("default"),
                status
            );
            status.exit_code()
        }
        Err(e) => {
            error!("credential check failed: {}", e);
            CredentialStatus::Missing.exit_code()
        }
    }
}

async fn credentials_refresh(ctx: RuntimeContext, args: RefreshArgs) -> i32 {
    let layout = ZoneLayout::new(ctx.project_root.clone());
    let policy = ctx.config.policy(&args.service);
    let acquirer = SessionAcquirer::new(ctx, layout);

    let accounts: Vec<Option<String>> = if args.all {
        policy.effective_accounts()
    } else {
        vec![args.account]
    };

    for account in accounts {
        match acquirer
            .refresh_interactive(&args.service, account.as_deref())
            .await
        {
            Ok(session) => info!(
                "refreshed {}/{} ({})",
                args.service,
                account.as_deref().unwrap_or("default"),
                session.strategy
            ),
            Err(e) => {
                error!(
                    "refresh failed for {}/{}: {}",
                    args.service,
                    account.as_deref().unwrap_or("default"),
                    e
                );
                return 9;
            }
        }
    }
    0
}
