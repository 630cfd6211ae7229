//! Command-line interface for account administration.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use coffer_server::ServerConfig;
use coffer_store::{
    AccountDatabase, AccountId, AccountManager, CheckConfig, CountingProgressSink,
    HousekeepingConfig, HousekeepingRun, NamedLock, NeverStop, StoreBackend, StoreCheck,
    StoreError,
};

use crate::size::parse_size_literal;

/// Process exit codes used by the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Operation succeeded.
    Success,
    /// Lockable failure: account busy, or check found errors without fix.
    Failed,
    /// Bad command-line usage.
    Usage,
}

impl ExitCode {
    /// Converts to the process exit status.
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Failed => 1,
            ExitCode::Usage => 2,
        }
    }
}

/// Coffer account administration tool.
#[derive(Debug, Parser)]
#[command(name = "coffer-admin", version, about)]
pub struct Cli {
    /// Path to the daemon configuration file.
    #[arg(short, long, default_value = "/etc/coffer/coffer.toml")]
    pub config: PathBuf,

    /// The action to perform.
    #[command(subcommand)]
    pub command: AdminCommand,
}

/// Administrative actions on accounts.
#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    /// Create an account on a disc set with the given limits.
    Create {
        /// Account id in hex, without 0x.
        account: String,
        /// Disc set number for the new account.
        disc_set: usize,
        /// Soft limit (<n>B blocks, <n>M MiB, <n>G GiB).
        soft_limit: String,
        /// Hard limit (<n>B blocks, <n>M MiB, <n>G GiB).
        hard_limit: String,
    },
    /// Print information about an account.
    Info {
        /// Account id in hex.
        account: String,
        /// Machine-readable output.
        #[arg(short = 'm', long)]
        machine: bool,
    },
    /// Enable or disable logins for an account.
    Enabled {
        /// Account id in hex.
        account: String,
        /// `yes` or `no`.
        state: String,
    },
    /// Change an account's soft and hard limits.
    Setlimit {
        /// Account id in hex.
        account: String,
        /// New soft limit.
        soft_limit: String,
        /// New hard limit.
        hard_limit: String,
    },
    /// Set the cosmetic account name.
    Name {
        /// Account id in hex.
        account: String,
        /// The new name.
        new_name: String,
    },
    /// Delete an account and all of its data.
    Delete {
        /// Account id in hex.
        account: String,
        /// Pass `yes` to skip the confirmation prompt.
        confirm: Option<String>,
    },
    /// Check an account for consistency; `fix` repairs, `quiet` reduces
    /// output.
    Check {
        /// Account id in hex.
        account: String,
        /// `fix` and/or `quiet`.
        options: Vec<String>,
    },
    /// Run housekeeping on an account immediately.
    Housekeep {
        /// Account id in hex.
        account: String,
    },
}

fn parse_account(text: &str) -> Result<AccountId> {
    u32::from_str_radix(text.trim(), 16)
        .map(AccountId)
        .map_err(|_| anyhow!("'{text}' is not a hex account id"))
}

impl Cli {
    /// Executes the selected command, returning the exit code.
    pub fn run(self) -> ExitCode {
        let config = if self.config.exists() {
            match ServerConfig::from_file(&self.config) {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "cannot read configuration");
                    return ExitCode::Usage;
                }
            }
        } else {
            error!(config = %self.config.display(), "configuration file not found");
            return ExitCode::Usage;
        };

        let backend = match config.build_backend() {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "cannot build store backend");
                return ExitCode::Usage;
            }
        };

        match run_command(self.command, &backend, &config) {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "command failed");
                ExitCode::Failed
            }
        }
    }
}

/// Dispatches one admin command against a backend. Split from [`Cli::run`]
/// so tests can call it without a config file on disc.
pub fn run_command(
    command: AdminCommand,
    backend: &StoreBackend,
    config: &ServerConfig,
) -> Result<ExitCode> {
    let database = AccountDatabase::load(&config.account_db)?;

    match command {
        AdminCommand::Create {
            account,
            disc_set,
            soft_limit,
            hard_limit,
        } => {
            let account = parse_account(&account)?;
            let block_size = backend.disc_set(disc_set)?.block_size;
            let soft = parse_size_literal(&soft_limit, block_size)?;
            let hard = parse_size_literal(&hard_limit, block_size)?;
            let mut manager = AccountManager::new(backend, database);
            manager.create_account(account, disc_set, soft, hard)?;
            println!("account {account} created on disc set {disc_set}");
            Ok(ExitCode::Success)
        }

        AdminCommand::Info { account, machine } => {
            let account = parse_account(&account)?;
            let disc_set = database.disc_set(account)?;
            let set = backend.disc_set(disc_set)?;
            let info = coffer_store::AccountInfo::load(
                set,
                &coffer_store::accounts::account_root_rel(account),
                account,
                true,
            )?;

            if machine {
                println!("account: {account}");
                println!("name: {}", info.account_name());
                println!("enabled: {}", info.is_enabled());
                println!("blocks-used: {}", info.blocks_used());
                println!("blocks-soft-limit: {}", info.blocks_soft_limit());
                println!("blocks-hard-limit: {}", info.blocks_hard_limit());
                println!("blocks-current: {}", info.blocks_in_current_files());
                println!("blocks-old: {}", info.blocks_in_old_files());
                println!("blocks-deleted: {}", info.blocks_in_deleted_files());
                println!("blocks-directories: {}", info.blocks_in_directories());
                println!("files: {}", info.num_files());
                println!("old-files: {}", info.num_old_files());
                println!("deleted-files: {}", info.num_deleted_files());
                println!("directories: {}", info.num_directories());
                println!("last-object-id: {}", info.last_object_id());
                println!("client-store-marker: {}", info.client_store_marker());
            } else {
                println!("Account {account} ({})", info.account_name());
                println!(
                    "  enabled: {}",
                    if info.is_enabled() { "yes" } else { "no" }
                );
                println!(
                    "  blocks used: {} (soft limit {}, hard limit {})",
                    info.blocks_used(),
                    info.blocks_soft_limit(),
                    info.blocks_hard_limit()
                );
                println!(
                    "  files: {} current, {} old, {} deleted; {} directories",
                    info.num_files(),
                    info.num_old_files(),
                    info.num_deleted_files(),
                    info.num_directories()
                );
            }
            Ok(ExitCode::Success)
        }

        AdminCommand::Enabled { account, state } => {
            let enabled = match state.as_str() {
                "yes" => true,
                "no" => false,
                _ => return Ok(ExitCode::Usage),
            };
            let account = parse_account(&account)?;
            with_locked_info(backend, &database, account, |info| {
                info.set_enabled(enabled);
                Ok(())
            })
        }

        AdminCommand::Setlimit {
            account,
            soft_limit,
            hard_limit,
        } => {
            let account = parse_account(&account)?;
            let disc_set = database.disc_set(account)?;
            let block_size = backend.disc_set(disc_set)?.block_size;
            let soft = parse_size_literal(&soft_limit, block_size)?;
            let hard = parse_size_literal(&hard_limit, block_size)?;
            AccountManager::check_limits(soft, hard)?;
            with_locked_info(backend, &database, account, |info| {
                info.set_limits(soft, hard);
                Ok(())
            })
        }

        AdminCommand::Name { account, new_name } => {
            let account = parse_account(&account)?;
            with_locked_info(backend, &database, account, |info| {
                info.set_account_name(new_name.clone());
                Ok(())
            })
        }

        AdminCommand::Delete { account, confirm } => {
            let account = parse_account(&account)?;
            if confirm.as_deref() != Some("yes") {
                if !confirm_interactively(account)? {
                    println!("not deleted");
                    return Ok(ExitCode::Success);
                }
            }

            let mut manager = AccountManager::new(backend, database);
            let mut lock = NamedLock::new();
            match manager.lock_account(account, &mut lock) {
                Ok(()) => {}
                Err(e) if e.is_contention() => {
                    error!(account = %account, "account is in use");
                    return Ok(ExitCode::Failed);
                }
                Err(e) => return Err(e.into()),
            }
            manager.delete_account(account)?;
            println!("account {account} deleted");
            Ok(ExitCode::Success)
        }

        AdminCommand::Check { account, options } => {
            let mut fix = false;
            let mut quiet = false;
            for option in &options {
                match option.as_str() {
                    "fix" => fix = true,
                    "quiet" => quiet = true,
                    _ => return Ok(ExitCode::Usage),
                }
            }
            let account = parse_account(&account)?;
            let disc_set = database.disc_set(account)?;

            let manager = AccountManager::new(backend, database);
            let mut lock = NamedLock::new();
            match manager.lock_account(account, &mut lock) {
                Ok(()) => {}
                Err(e) if e.is_contention() => {
                    error!(account = %account, "account is in use");
                    return Ok(ExitCode::Failed);
                }
                Err(e) => return Err(e.into()),
            }

            let mut check = StoreCheck::new(
                backend,
                account,
                disc_set,
                CheckConfig {
                    fix_errors: fix,
                    quiet,
                },
            );
            let mut sink = CountingProgressSink::default();
            let report = check.run(&mut sink)?;

            if report.errors_found > 0 {
                println!(
                    "{} errors found{}",
                    report.errors_found,
                    if fix { " and fixed" } else { "; run with fix to repair" }
                );
                if !fix {
                    return Ok(ExitCode::Failed);
                }
            } else {
                println!("no errors found");
            }
            Ok(ExitCode::Success)
        }

        AdminCommand::Housekeep { account } => {
            let account = parse_account(&account)?;
            let disc_set = database.disc_set(account)?;
            let mut run =
                HousekeepingRun::new(backend, account, disc_set, HousekeepingConfig::default());
            let outcome = run.run(&mut NeverStop, &mut CountingProgressSink::default())?;
            if outcome.skipped_locked {
                error!(account = %account, "account is in use");
                return Ok(ExitCode::Failed);
            }
            println!(
                "housekeeping freed {} blocks ({} files, {} directories)",
                outcome.blocks_freed, outcome.files_deleted, outcome.directories_deleted
            );
            Ok(ExitCode::Success)
        }
    }
}

/// Locks the account, applies `mutate` to its info record, and saves.
fn with_locked_info(
    backend: &StoreBackend,
    database: &AccountDatabase,
    account: AccountId,
    mutate: impl FnOnce(&mut coffer_store::AccountInfo) -> Result<()>,
) -> Result<ExitCode> {
    let disc_set = database.disc_set(account)?;
    let set = backend.disc_set(disc_set)?;
    let root_rel = coffer_store::accounts::account_root_rel(account);

    let lock_path = coffer_store::accounts::write_lock_path(backend, disc_set, account)?;
    let mut lock = NamedLock::new();
    match lock.try_acquire(&lock_path) {
        Ok(()) => {}
        Err(StoreError::AlreadyLocked { .. }) => {
            error!(account = %account, "account is in use");
            return Ok(ExitCode::Failed);
        }
        Err(e) => return Err(e.into()),
    }

    let mut info = coffer_store::AccountInfo::load(set, &root_rel, account, false)?;
    mutate(&mut info)?;
    info.save(set, &root_rel)?;
    Ok(ExitCode::Success)
}

/// Asks on the terminal before deleting an account.
fn confirm_interactively(account: AccountId) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        return Ok(false);
    }
    println!("Really delete account {account} and all its data? Type 'yes' to continue:");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim() == "yes")
}
