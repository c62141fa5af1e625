//! Copy-trading group lifecycle CLI.
//!
//! Administers users, groups, memberships and settlements against a SQLite
//! store, and can replay a full lifecycle against an in-memory store.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use copyhub::api::MemoryCopyEngine;
use copyhub::db::Database;
use copyhub::lifecycle::LifecycleOrchestrator;
use copyhub::models::{
    AccountDetails, Actor, Allocation, AllocationModel, Group, IbStatus, Member, MemberStatus,
    NewGroup, Role, Settlement, SettlementCycle, SettlementPeriod, SettlementStatus,
    SettlementSubmission, TradingStatus, User,
};
use copyhub::CoreConfig;

/// Copy-trading group lifecycle CLI.
#[derive(Parser)]
#[command(name = "copyhub")]
#[command(about = "Manage copy-trading groups, memberships and settlements", long_about = None)]
struct Cli {
    /// Database connection string (defaults to COPYHUB_DATABASE_URL or ./copyhub.db)
    #[arg(short, long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Copy engine base URL
    #[arg(long, env = "COPYHUB_COPIER_URL")]
    copier_url: Option<String>,

    /// Copy engine API key
    #[arg(long, env = "COPYHUB_COPIER_API_KEY", hide_env_values = true)]
    copier_api_key: Option<String>,

    /// Subscriber id performing the command
    #[arg(long = "as", env = "COPYHUB_ACTOR", default_value = "cli-admin")]
    actor: String,

    /// Role of the acting subscriber
    #[arg(long, env = "COPYHUB_ROLE", default_value = "admin")]
    role: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage user profiles
    #[command(subcommand)]
    User(UserCommand),

    /// Manage introducing-broker approval
    #[command(subcommand)]
    Ib(IbCommand),

    /// Manage groups and their trading status
    #[command(subcommand)]
    Group(GroupCommand),

    /// Manage group memberships
    #[command(subcommand)]
    Member(MemberCommand),

    /// Manage profit-sharing settlements
    #[command(subcommand)]
    Settlement(SettlementCommand),

    /// Run a join, approve, settle and resume cycle in memory, printing the admin stream
    Demo,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Create or update a user
    Add {
        user_id: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// user, master, manager or admin
        #[arg(short, long, default_value = "user")]
        role: String,
    },
}

#[derive(Subcommand)]
enum IbCommand {
    /// Set a user's IB status (not_changed, pending, approved, rejected)
    Set { user_id: String, status: String },
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Create a group (starts paused)
    Create {
        name: String,

        #[arg(short, long)]
        company: String,

        /// Profit-sharing percentage (10-100)
        #[arg(short, long)]
        percentage: Decimal,

        /// daily, weekly or monthly
        #[arg(short = 'y', long, default_value = "monthly")]
        cycle: String,
    },

    /// Set trading status (active, paused, suspended)
    Status { group_id: String, status: String },

    /// Change the profit-sharing percentage
    Percentage { group_id: String, percentage: Decimal },

    /// Issue a new API key; the old key stops working
    RotateKey { group_id: String },

    /// Soft-delete a group with no open members
    Delete { group_id: String },

    /// List groups
    List {
        /// Include deleted groups
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args)]
struct AccountArgs {
    /// Copy-engine account id
    #[arg(long)]
    account: String,

    #[arg(long)]
    broker: String,

    #[arg(long)]
    server: String,

    /// Opening balance
    #[arg(long)]
    balance: Decimal,

    /// ratio, fixed_lot or equity_proportional
    #[arg(long, default_value = "ratio")]
    allocation: String,

    /// Allocation value (multiplier, lot size or fraction)
    #[arg(long, default_value = "1")]
    allocation_value: Decimal,
}

impl AccountArgs {
    fn into_details(self) -> Result<AccountDetails> {
        Ok(AccountDetails {
            account_id: self.account,
            broker: self.broker,
            server: self.server,
            opening_balance: self.balance,
            allocation: Allocation {
                model: self.allocation.parse::<AllocationModel>()?,
                value: self.allocation_value,
            },
        })
    }
}

#[derive(Subcommand)]
enum MemberCommand {
    /// Request to join a group by referral code or group API key
    Join {
        user_id: String,
        code: String,

        #[command(flatten)]
        account: AccountArgs,

        /// Leave the current group as part of joining
        #[arg(long)]
        switch: bool,
    },

    /// Approve a pending member
    Approve { member_id: String },

    /// Reject a pending member
    Reject {
        member_id: String,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Leave a group
    Leave { member_id: String },

    /// Pause copying for an active member
    Pause { member_id: String },

    /// Resume copying for a paused member
    Resume { member_id: String },

    /// List members
    List {
        #[arg(short, long)]
        group: Option<String>,

        #[arg(short, long)]
        status: Option<String>,
    },
}

#[derive(Args)]
struct PeriodArgs {
    /// Period start (RFC 3339); defaults to `--days` before the end
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Period end (RFC 3339); defaults to now
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Period length in days when `--from` is omitted
    #[arg(long, default_value = "30")]
    days: i64,
}

impl PeriodArgs {
    fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.to.unwrap_or_else(Utc::now);
        let start = self.from.unwrap_or(end - Duration::days(self.days));
        (start, end)
    }
}

#[derive(Subcommand)]
enum SettlementCommand {
    /// Show the amount due for a period
    Calculate {
        group_id: String,

        #[command(flatten)]
        period: PeriodArgs,
    },

    /// Submit a settlement payment
    Submit {
        group_id: String,

        #[command(flatten)]
        period: PeriodArgs,

        #[arg(long)]
        method: String,

        #[arg(long)]
        reference: String,

        #[arg(long)]
        amount: Decimal,
    },

    /// Move a pending settlement into review
    Review { settlement_id: String },

    /// Approve a settlement, resuming the group if it was auto-paused
    Approve { settlement_id: String },

    /// Reject a settlement
    Reject {
        settlement_id: String,

        #[arg(short, long)]
        reason: String,
    },

    /// Append a remark
    Note { settlement_id: String, remark: String },

    /// List settlements
    List {
        #[arg(short, long)]
        group: Option<String>,

        /// Filter by status; defaults to pending and processing
        #[arg(short, long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = CoreConfig::from_env().context("Invalid COPYHUB_* configuration")?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }
    if let Some(url) = cli.copier_url {
        config.copier_base_url = url;
    }
    if cli.copier_api_key.is_some() {
        config.copier_api_key = cli.copier_api_key;
    }

    let actor = Actor::for_role(cli.actor, cli.role.parse::<Role>()?);
    match cli.command {
        Commands::Demo => run_demo(config).await,
        command => run(config, &actor, command).await,
    }
}

async fn run(config: CoreConfig, actor: &Actor, command: Commands) -> Result<()> {
    let core = LifecycleOrchestrator::connect(config.clone())
        .await
        .with_context(|| format!("Failed to open {}", config.database_url))?;

    match command {
        Commands::User(UserCommand::Add {
            user_id,
            name,
            role,
        }) => {
            let name = name.unwrap_or_else(|| user_id.clone());
            let user = core
                .register_user(actor, &User::new(user_id, name, role.parse::<Role>()?))
                .await?;
            print_user(&user);
        }

        Commands::Ib(IbCommand::Set { user_id, status }) => {
            let change = core
                .set_ib_status(actor, &user_id, status.parse::<IbStatus>()?)
                .await?;
            if !change.applied {
                println!("IB status unchanged");
            }
            print_user(&change.value);
        }

        Commands::Group(command) => run_group(&core, actor, command).await?,
        Commands::Member(command) => run_member(&core, actor, command).await?,
        Commands::Settlement(command) => run_settlement(&core, actor, command).await?,
        Commands::Demo => run_demo(config).await?,
    }

    Ok(())
}

async fn run_group(core: &LifecycleOrchestrator, actor: &Actor, command: GroupCommand) -> Result<()> {
    match command {
        GroupCommand::Create {
            name,
            company,
            percentage,
            cycle,
        } => {
            let group = core
                .create_group(
                    actor,
                    &NewGroup {
                        name,
                        company_name: company,
                        profit_sharing_percentage: percentage,
                        settlement_cycle: cycle.parse::<SettlementCycle>()?,
                    },
                )
                .await?;
            println!("Created group {}", group.group_id);
            println!("  Referral code: {}", group.referral_code);
            println!("  API key:       {}", group.api_key);
        }

        GroupCommand::Status { group_id, status } => {
            let change = core
                .set_group_trading_status(actor, &group_id, status.parse::<TradingStatus>()?)
                .await?;
            match change.transition {
                Some(t) => println!("{}: {} -> {}", group_id, t.from, t.to),
                None => println!("{} already {}", group_id, change.group.trading_status),
            }
        }

        GroupCommand::Percentage {
            group_id,
            percentage,
        } => {
            let group = core
                .update_profit_sharing(actor, &group_id, percentage)
                .await?;
            println!(
                "{} profit share now {}%",
                group.group_id, group.profit_sharing_percentage
            );
        }

        GroupCommand::RotateKey { group_id } => {
            let group = core.regenerate_api_key(actor, &group_id).await?;
            println!("{} API key: {}", group.group_id, group.api_key);
        }
        GroupCommand::Delete { group_id } => {
            core.delete_group(actor, &group_id).await?;
            println!("Deleted group {}", group_id);
        }

        GroupCommand::List { all } => {
            let groups = core.list_groups(all).await?;
            if groups.is_empty() {
                println!("No groups. Use 'copyhub group create' to add one.");
                return Ok(());
            }
            print_groups(&groups);
        }
    }
    Ok(())
}

async fn run_member(
    core: &LifecycleOrchestrator,
    actor: &Actor,
    command: MemberCommand,
) -> Result<()> {
    let member = match command {
        MemberCommand::Join {
            user_id,
            code,
            account,
            switch,
        } => {
            let joined = core
                .request_join(actor, &user_id, &code, &account.into_details()?, switch)
                .await?;
            if let Some(previous) = &joined.replaced {
                println!("Left group {} ({})", previous.group_id, previous.member_id);
            }
            joined.member
        }
        MemberCommand::Approve { member_id } => core.approve_member(actor, &member_id).await?,
        MemberCommand::Reject { member_id, reason } => {
            core.reject_member(actor, &member_id, reason.as_deref())
                .await?
        }
        MemberCommand::Leave { member_id } => core.leave_group(actor, &member_id).await?,
        MemberCommand::Pause { member_id } => core.pause_member(actor, &member_id).await?,
        MemberCommand::Resume { member_id } => core.resume_member(actor, &member_id).await?,
        MemberCommand::List { group, status } => {
            let status = status.map(|s| s.parse::<MemberStatus>()).transpose()?;
            let members = core.list_members(group.as_deref(), status).await?;
            print_members(&members);
            return Ok(());
        }
    };

    println!(
        "Member {} in {}: {}",
        member.member_id, member.group_id, member.status
    );
    Ok(())
}

async fn run_settlement(
    core: &LifecycleOrchestrator,
    actor: &Actor,
    command: SettlementCommand,
) -> Result<()> {
    let settlement = match command {
        SettlementCommand::Calculate { group_id, period } => {
            let (start, end) = period.bounds();
            let quote = core
                .calculate_settlement(actor, &group_id, start, end)
                .await?;
            println!("\n=== Settlement quote: {} ===", quote.group_id);
            println!("Period:       {} .. {}", quote.period_start, quote.period_end);
            println!("Gross profit: ${:.2}", quote.gross_profit);
            println!("Share:        {}%", quote.profit_sharing_percentage);
            println!("Amount due:   ${:.2}", quote.amount_due);
            return Ok(());
        }
        SettlementCommand::Submit {
            group_id,
            period,
            method,
            reference,
            amount,
        } => {
            let (start, end) = period.bounds();
            core.submit_settlement(
                actor,
                &SettlementSubmission {
                    group_id,
                    period: SettlementPeriod::new(start, end)?,
                    payment_method: method,
                    payment_reference: reference,
                    amount_paid: amount,
                },
            )
            .await?
        }
        SettlementCommand::Review { settlement_id } => {
            core.begin_settlement_review(actor, &settlement_id).await?
        }
        SettlementCommand::Approve { settlement_id } => {
            core.approve_settlement(actor, &settlement_id).await?
        }
        SettlementCommand::Reject {
            settlement_id,
            reason,
        } => {
            core.reject_settlement(actor, &settlement_id, &reason)
                .await?
        }
        SettlementCommand::Note {
            settlement_id,
            remark,
        } => {
            core.annotate_settlement(actor, &settlement_id, &remark)
                .await?
        }
        SettlementCommand::List { group, status } => {
            let settlements = match status {
                Some(status) => {
                    core.list_settlements(Some(status.parse::<SettlementStatus>()?), group.as_deref())
                        .await?
                }
                None => core.list_pending_settlements(group.as_deref()).await?,
            };
            print_settlements(&settlements);
            return Ok(());
        }
    };

    print_settlements(std::slice::from_ref(&settlement));
    Ok(())
}

async fn run_demo(config: CoreConfig) -> Result<()> {
    let engine = Arc::new(MemoryCopyEngine::new());
    let db = Database::in_memory().await?;
    let core = LifecycleOrchestrator::new(db, engine.clone(), config.clone());

    let admin = Actor::for_role("admin", Role::Admin);
    let master = Actor::for_role("master", Role::Master);

    let feed = core.subscribe(&admin).await?;
    let feed_id = feed.id();
    let printer = tokio::spawn(async move {
        let mut frames = Box::pin(feed.into_stream(config.keepalive()));
        while let Some(frame) = frames.next().await {
            if let Ok(line) = frame.to_line() {
                print!("{}", line);
            }
        }
    });

    info!("Creating group and member");
    let group = core
        .create_group(
            &master,
            &NewGroup {
                name: "Demo Alpha".to_string(),
                company_name: "Demo Capital".to_string(),
                profit_sharing_percentage: dec!(80),
                settlement_cycle: SettlementCycle::Weekly,
            },
        )
        .await?;
    core.register_user(&admin, &User::new("demo-user", "Demo User", Role::User))
        .await?;
    core.set_ib_status(&admin, "demo-user", IbStatus::Approved)
        .await?;

    let user = Actor::for_role("demo-user", Role::User);
    let joined = core
        .request_join(
            &user,
            "demo-user",
            &group.referral_code,
            &AccountDetails {
                account_id: "mt5-demo-1".to_string(),
                broker: "IC Markets".to_string(),
                server: "ICMarketsSC-Demo".to_string(),
                opening_balance: dec!(5000),
                allocation: Allocation::default(),
            },
            false,
        )
        .await?;
    core.approve_member(&admin, &joined.member.member_id).await?;
    core.set_group_trading_status(&master, &group.group_id, TradingStatus::Active)
        .await?;

    info!("Settling the period");
    engine.set_profit(&group.group_id, dec!(15000));
    let end = Utc::now();
    let settlement = core
        .submit_settlement(
            &master,
            &SettlementSubmission {
                group_id: group.group_id.clone(),
                period: SettlementPeriod::new(end - Duration::days(7), end)?,
                payment_method: "bank_transfer".to_string(),
                payment_reference: "DEMO-UTR-1".to_string(),
                amount_paid: dec!(12000),
            },
        )
        .await?;
    core.approve_settlement(&admin, &settlement.settlement_id)
        .await?;

    core.unsubscribe(feed_id);
    printer.await.context("Demo stream printer failed")?;

    let group = core.get_group(&group.group_id).await?;
    println!();
    print_groups(std::slice::from_ref(&group));
    Ok(())
}

fn print_user(user: &User) {
    println!(
        "{} ({}) role={} ib={} group={}",
        user.user_id,
        user.name,
        user.role,
        user.ib_status,
        user.group_id.as_deref().unwrap_or("-")
    );
}

fn print_groups(groups: &[Group]) {
    println!(
        "\n{:<38} {:<20} {:<10} {:>6} {:>8} {:<14}",
        "GROUP", "NAME", "TRADING", "SHARE", "ACTIVE", "REFERRAL"
    );
    println!("{}", "-".repeat(101));
    for g in groups {
        println!(
            "{:<38} {:<20} {:<10} {:>5}% {:>8} {:<14}",
            g.group_id,
            truncate(&g.name, 18),
            g.trading_status,
            g.profit_sharing_percentage,
            g.active_members,
            g.referral_code
        );
    }
}

fn print_members(members: &[Member]) {
    if members.is_empty() {
        println!("No members found.");
        return;
    }
    println!(
        "\n{:<38} {:<16} {:<10} {:<16} {:>12}",
        "MEMBER", "USER", "STATUS", "ACCOUNT", "BALANCE"
    );
    println!("{}", "-".repeat(96));
    for m in members {
        println!(
            "{:<38} {:<16} {:<10} {:<16} {:>12.2}",
            m.member_id,
            truncate(&m.user_id, 14),
            m.status,
            truncate(&m.account_id, 14),
            m.current_balance
        );
    }
}

fn print_settlements(settlements: &[Settlement]) {
    if settlements.is_empty() {
        println!("No settlements found.");
        return;
    }
    println!(
        "\n{:<38} {:<14} {:<11} {:>12} {:>12} {:<5}",
        "SETTLEMENT", "GROUP", "STATUS", "DUE", "PAID", "PAUSE"
    );
    println!("{}", "-".repeat(97));
    for s in settlements {
        println!(
            "{:<38} {:<14} {:<11} {:>12.2} {:>12.2} {:<5}",
            s.settlement_id,
            truncate(&s.group_id, 12),
            s.status,
            s.amount_due,
            s.amount_paid,
            if s.auto_pause_triggered { "yes" } else { "no" }
        );
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
