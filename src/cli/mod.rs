use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::application::{AuditReport, CardService, EntryFilter, LedgerConfig, NewCard};
use crate::domain::{
    format_cents, parse_cents, AccountRollup, CardStatus, CardView, EntryKind, EntryStatus,
    EntryView, LedgerEntry, UserId,
};

/// Cardledger - virtual card ledger
#[derive(Parser)]
#[command(name = "cardledger")]
#[command(about = "Issue virtual cards and keep an auditable ledger of their balances")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "CARDLEDGER_DATABASE", default_value = "cardledger.db")]
    pub database: String,

    /// Acting user (already authenticated upstream)
    #[arg(short, long, env = "CARDLEDGER_USER", global = true)]
    pub user: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Largest single credit or debit (e.g., "1000000.00")
    #[arg(long, env = "CARDLEDGER_MAX_AMOUNT", global = true)]
    pub max_amount: Option<String>,

    /// Milliseconds to wait for a busy card before giving up
    #[arg(long, env = "CARDLEDGER_LOCK_TIMEOUT_MS", default_value_t = 5000, global = true)]
    pub lock_timeout_ms: u64,

    /// Milliseconds SQLite waits on its own write lock
    #[arg(long, env = "CARDLEDGER_BUSY_TIMEOUT_MS", default_value_t = 5000, global = true)]
    pub busy_timeout_ms: u64,

    /// Attempts at finding an unused card number or entry reference
    #[arg(long, env = "CARDLEDGER_ID_RETRY_LIMIT", default_value_t = 256, global = true)]
    pub id_retry_limit: u32,

    /// Validity of new cards, in days
    #[arg(long, env = "CARDLEDGER_CARD_VALIDITY_DAYS", default_value_t = 1095, global = true)]
    pub card_validity_days: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Card management commands
    #[command(subcommand)]
    Card(CardCommands),

    /// Add funds to a card
    Credit {
        /// Card ID
        card: String,

        /// Amount (e.g., "50.00" or "50")
        amount: String,

        /// Description of the movement
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Take funds from a card
    Debit {
        /// Card ID
        card: String,

        /// Amount (e.g., "50.00" or "50")
        amount: String,

        /// Description of the movement
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List ledger entries
    Transactions {
        /// Only entries of this card
        #[arg(long)]
        card: Option<String>,

        /// Filter by status: pending, completed, failed, reversed
        #[arg(long)]
        status: Option<String>,

        /// Filter by kind: credit, debit
        #[arg(long)]
        kind: Option<String>,
    },

    /// Show the account summary
    Summary {
        /// Recompute before showing
        #[arg(long)]
        refresh: bool,
    },

    /// Verify a card's ledger against its balance
    Check {
        /// Card ID
        card: String,
    },
}

#[derive(Subcommand)]
pub enum CardCommands {
    /// Issue a new card
    Create {
        /// Card holder name
        holder_name: String,

        /// Initial balance (defaults to 0.00)
        #[arg(short, long)]
        balance: Option<String>,

        /// Expiry date (YYYY-MM-DD, defaults to the configured validity)
        #[arg(long)]
        expiry: Option<String>,
    },

    /// List cards
    List {
        /// Filter by status: active, blocked, expired
        #[arg(long)]
        status: Option<String>,
    },

    /// Show card details
    Show {
        /// Card ID
        id: String,
    },

    /// Block a card
    Block {
        /// Card ID
        id: String,
    },

    /// Unblock a blocked card
    Unblock {
        /// Card ID
        id: String,
    },
}

impl Cli {
    fn config(&self) -> Result<LedgerConfig> {
        let mut config = LedgerConfig::default()
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .with_id_retry_limit(self.id_retry_limit)
            .with_card_validity_days(self.card_validity_days);
        if let Some(max) = &self.max_amount {
            config = config.with_max_amount(
                parse_cents(max).context("Invalid maximum amount. Use '1000.00' or '1000'")?,
            );
        }
        Ok(config)
    }

    fn caller(&self) -> Result<UserId> {
        self.user
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(UserId::new)
            .context("No user given. Pass --user or set CARDLEDGER_USER")
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config()?;
        let output = Output { json: self.json };

        if let Commands::Init = self.command {
            CardService::init(&self.database, config).await?;
            println!("Database initialized: {}", self.database);
            return Ok(());
        }

        let caller = self.caller()?;
        let service = CardService::connect(&self.database, config).await?;

        match self.command {
            Commands::Init => {}

            Commands::Card(card_cmd) => {
                run_card_command(&service, &caller, &output, card_cmd).await?;
            }

            Commands::Credit {
                card,
                amount,
                description,
            } => {
                run_movement(
                    &service,
                    &caller,
                    &output,
                    EntryKind::Credit,
                    &card,
                    &amount,
                    &description,
                )
                .await?;
            }

            Commands::Debit {
                card,
                amount,
                description,
            } => {
                run_movement(
                    &service,
                    &caller,
                    &output,
                    EntryKind::Debit,
                    &card,
                    &amount,
                    &description,
                )
                .await?;
            }

            Commands::Transactions { card, status, kind } => {
                let status = status
                    .map(|s| {
                        EntryStatus::from_str(&s).with_context(|| {
                            format!(
                                "Invalid status '{}'. Use pending, completed, failed or reversed",
                                s
                            )
                        })
                    })
                    .transpose()?;
                let kind = kind
                    .map(|k| {
                        EntryKind::from_str(&k)
                            .with_context(|| format!("Invalid kind '{}'. Use credit or debit", k))
                    })
                    .transpose()?;

                let entries = match card {
                    Some(card) => {
                        let card_id = parse_card_id(&card)?;
                        service
                            .list_card_entries(&caller, card_id, status)
                            .await?
                            .into_iter()
                            .filter(|view| kind.is_none_or(|k| view.entry.kind == k))
                            .collect()
                    }
                    None => {
                        service
                            .list_entries(&caller, EntryFilter { status, kind })
                            .await?
                    }
                };
                output.entries(&entries)?;
            }

            Commands::Summary { refresh } => {
                let rollup = if refresh {
                    service.refresh_summary(&caller).await?
                } else {
                    service.account_summary(&caller).await?
                };
                output.summary(&rollup)?;
            }

            Commands::Check { card } => {
                let card_id = parse_card_id(&card)?;
                let report = service.audit_card(&caller, card_id).await?;
                output.audit(&report)?;
            }
        }

        Ok(())
    }
}

async fn run_card_command(
    service: &CardService,
    caller: &UserId,
    output: &Output,
    cmd: CardCommands,
) -> Result<()> {
    match cmd {
        CardCommands::Create {
            holder_name,
            balance,
            expiry,
        } => {
            let initial_balance = balance
                .map(|b| parse_cents(&b))
                .transpose()
                .context("Invalid balance format. Use '50.00' or '50'")?
                .unwrap_or(0);
            let expiry_date = expiry
                .map(|e| {
                    NaiveDate::parse_from_str(&e, "%Y-%m-%d")
                        .with_context(|| format!("Invalid date format '{}'. Use YYYY-MM-DD", e))
                })
                .transpose()?;

            let card = service
                .create_card(
                    caller,
                    NewCard {
                        holder_name,
                        initial_balance,
                        expiry_date,
                    },
                )
                .await?;
            output.card_created(&card)?;
        }

        CardCommands::List { status } => {
            let status = status
                .map(|s| {
                    CardStatus::from_str(&s).with_context(|| {
                        format!("Invalid status '{}'. Use active, blocked or expired", s)
                    })
                })
                .transpose()?;
            let cards = service.list_cards(caller, status).await?;
            output.cards(&cards)?;
        }

        CardCommands::Show { id } => {
            let card = service.get_card(caller, parse_card_id(&id)?).await?;
            output.card(&card)?;
        }

        CardCommands::Block { id } => {
            let card = service.block_card(caller, parse_card_id(&id)?).await?;
            output.card_status(&card)?;
        }

        CardCommands::Unblock { id } => {
            let card = service.unblock_card(caller, parse_card_id(&id)?).await?;
            output.card_status(&card)?;
        }
    }
    Ok(())
}

async fn run_movement(
    service: &CardService,
    caller: &UserId,
    output: &Output,
    kind: EntryKind,
    card: &str,
    amount: &str,
    description: &str,
) -> Result<()> {
    let card_id = parse_card_id(card)?;
    let amount = parse_cents(amount).context("Invalid amount format. Use '50.00' or '50'")?;
    let entry = service
        .process_transaction(caller, card_id, kind, amount, description)
        .await?;
    output.entry_recorded(&entry)
}

fn parse_card_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).context("Invalid card ID format (expected UUID)")
}

/// Renders results either as tables or as pretty JSON.
struct Output {
    json: bool,
}

impl Output {
    fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn card_created(&self, card: &CardView) -> Result<()> {
        if self.json {
            return self.print_json(card);
        }
        println!(
            "Issued card {} to {} ({})",
            card.masked_number, card.holder_name, card.id
        );
        println!("  Balance: {}", format_cents(card.balance));
        println!("  Expires: {}", card.expiry_date);
        Ok(())
    }

    fn card(&self, card: &CardView) -> Result<()> {
        if self.json {
            return self.print_json(card);
        }
        println!("Card: {}", card.masked_number);
        println!("  ID:         {}", card.id);
        println!("  Holder:     {}", card.holder_name);
        println!("  Status:     {}", card.status);
        println!("  Balance:    {}", format_cents(card.balance));
        println!("  Expires:    {}", card.expiry_date);
        println!(
            "  Issued:     {}",
            card.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!(
            "  Updated:    {}",
            card.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }

    fn card_status(&self, card: &CardView) -> Result<()> {
        if self.json {
            return self.print_json(card);
        }
        println!("Card {} is now {}", card.masked_number, card.status);
        Ok(())
    }

    fn cards(&self, cards: &[CardView]) -> Result<()> {
        if self.json {
            return self.print_json(cards);
        }
        if cards.is_empty() {
            println!("No cards found.");
            return Ok(());
        }
        println!(
            "{:<36}  {:<19}  {:<20}  {:<8}  {:>14}  {:<10}",
            "ID", "NUMBER", "HOLDER", "STATUS", "BALANCE", "EXPIRES"
        );
        println!("{}", "-".repeat(116));
        for card in cards {
            println!(
                "{:<36}  {:<19}  {:<20}  {:<8}  {:>14}  {:<10}",
                card.id,
                card.masked_number,
                truncate(&card.holder_name, 20),
                card.status.as_str(),
                format_cents(card.balance),
                card.expiry_date
            );
        }
        Ok(())
    }

    fn entry_recorded(&self, entry: &LedgerEntry) -> Result<()> {
        if self.json {
            return self.print_json(entry);
        }
        println!(
            "Recorded {} of {} ({})",
            entry.kind,
            format_cents(entry.amount),
            entry.reference
        );
        if let (Some(before), Some(after)) = (entry.balance_before, entry.balance_after) {
            println!("  Balance: {} -> {}", format_cents(before), format_cents(after));
        }
        Ok(())
    }

    fn entries(&self, entries: &[EntryView]) -> Result<()> {
        if self.json {
            return self.print_json(entries);
        }
        if entries.is_empty() {
            println!("No transactions found.");
            return Ok(());
        }
        println!(
            "{:<19}  {:<25}  {:<19}  {:<6}  {:>12}  {:<9}  {:<20}",
            "DATE", "REFERENCE", "CARD", "KIND", "AMOUNT", "STATUS", "DESCRIPTION"
        );
        println!("{}", "-".repeat(120));
        for view in entries {
            let entry = &view.entry;
            println!(
                "{:<19}  {:<25}  {:<19}  {:<6}  {:>12}  {:<9}  {:<20}",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.reference,
                view.card_masked_number,
                entry.kind.as_str(),
                format_cents(entry.amount),
                entry.status.as_str(),
                truncate(&entry.description, 20)
            );
        }
        Ok(())
    }

    fn summary(&self, rollup: &AccountRollup) -> Result<()> {
        if self.json {
            return self.print_json(rollup);
        }
        println!("Account summary for {}", rollup.user_id);
        println!("  Total balance:   {:>15}", format_cents(rollup.total_balance));
        println!(
            "  Cards:           {:>15}",
            format!("{} ({} active)", rollup.total_cards, rollup.active_cards)
        );
        println!("  Transactions:    {:>15}", rollup.total_transactions);
        println!("  Total credited:  {:>15}", format_cents(rollup.total_credited));
        println!("  Total debited:   {:>15}", format_cents(rollup.total_debited));
        match rollup.last_transaction_at {
            Some(last) => println!("  Last activity:   {}", last.format("%Y-%m-%d %H:%M:%S")),
            None => println!("  Last activity:   never"),
        }
        Ok(())
    }

    fn audit(&self, report: &AuditReport) -> Result<()> {
        if self.json {
            return self.print_json(report);
        }
        println!("Ledger integrity check passed for card {}", report.card_id);
        println!("  Balance:           {}", format_cents(report.balance));
        println!("  Completed entries: {}", report.completed_entries);
        println!("  Failed entries:    {}", report.failed_entries);
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max - 3).collect();
        format!("{}...", cut)
    }
}
