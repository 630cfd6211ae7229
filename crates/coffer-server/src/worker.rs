//! The housekeeping worker.
//!
//! Runs on its own blocking thread beside the async listener. Every
//! interval it walks the account database and housekeeps each account in
//! turn; between accounts (and inside each run, at the engine's yield
//! points) it drains the control channel so sessions get their locks back
//! within about a second.
//!
//! A failure on one account aborts only that account's run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use coffer_store::{
    AccountDatabase, HousekeepingConfig, HousekeepingRun, NullProgressSink, StoreBackend,
};

use crate::control::ControlChannel;

/// Housekeeping worker state.
pub struct HousekeepingWorker {
    backend: Arc<StoreBackend>,
    account_db_path: PathBuf,
    interval: Duration,
    config: HousekeepingConfig,
}

impl HousekeepingWorker {
    /// Creates a worker over the given backend and account database.
    pub fn new(
        backend: Arc<StoreBackend>,
        account_db_path: PathBuf,
        interval: Duration,
        config: HousekeepingConfig,
    ) -> Self {
        Self {
            backend,
            account_db_path,
            interval,
            config,
        }
    }

    /// Runs until the control channel asks for termination.
    ///
    /// The poll cadence while idle is one second, matching the engine's
    /// own yield bound.
    pub fn run(&self, control: &mut ControlChannel) {
        let mut last_run: Option<Instant> = None;
        loop {
            if control.poll_idle() && control.terminate_requested() {
                info!("housekeeping worker terminating");
                return;
            }
            if control.take_reload_request() {
                info!("housekeeping worker acknowledging config reload");
            }

            let due = last_run.map_or(true, |t| t.elapsed() >= self.interval);
            if due {
                last_run = Some(Instant::now());
                self.run_all_accounts(control);
                if control.terminate_requested() {
                    return;
                }
            }

            std::thread::sleep(Duration::from_secs(1));
        }
    }

    /// One pass over every registered account.
    pub fn run_all_accounts(&self, control: &mut ControlChannel) {
        info!("starting housekeeping pass");
        let database = match AccountDatabase::load(&self.account_db_path) {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "cannot load account database; skipping pass");
                return;
            }
        };

        for (account, disc_set) in database.all() {
            let mut run =
                HousekeepingRun::new(&self.backend, account, disc_set, self.config.clone());
            match run.run(control, &mut NullProgressSink) {
                Ok(outcome) if outcome.skipped_locked => {
                    info!(account = %account, "account busy, housekeeping skipped");
                }
                Ok(outcome) => {
                    info!(account = %account,
                        files_deleted = outcome.files_deleted,
                        blocks_freed = outcome.blocks_freed,
                        stopped_early = outcome.stopped_early,
                        "housekept account");
                }
                Err(e) => {
                    warn!(account = %account, error = %e,
                        "housekeeping failed for account, continuing with the next");
                }
            }

            if control.terminate_requested() {
                return;
            }
        }
        info!("finished housekeeping pass");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlCommand;
    use coffer_store::backend::single_disc_backend;
    use coffer_store::{AccountId, AccountManager};
    use std::sync::mpsc::channel;
    use tempfile::TempDir;

    #[test]
    fn test_single_pass_over_accounts() {
        let dir = TempDir::new().unwrap();
        let store_root = dir.path().join("store");
        std::fs::create_dir_all(&store_root).unwrap();
        let backend = Arc::new(single_disc_backend(&store_root, 4096));
        let db_path = dir.path().join("accounts.txt");

        let db = AccountDatabase::load(&db_path).unwrap();
        let mut mgr = AccountManager::new(&backend, db);
        mgr.create_account(AccountId(1), 0, 100, 200).unwrap();
        mgr.create_account(AccountId(2), 0, 100, 200).unwrap();

        let worker = HousekeepingWorker::new(
            backend,
            db_path,
            Duration::from_secs(3600),
            HousekeepingConfig::default(),
        );

        let (_tx, rx) = channel();
        let mut control = ControlChannel::new(rx);
        worker.run_all_accounts(&mut control);
    }

    #[test]
    fn test_terminate_stops_pass() {
        let dir = TempDir::new().unwrap();
        let store_root = dir.path().join("store");
        std::fs::create_dir_all(&store_root).unwrap();
        let backend = Arc::new(single_disc_backend(&store_root, 4096));
        let db_path = dir.path().join("accounts.txt");

        let db = AccountDatabase::load(&db_path).unwrap();
        let mut mgr = AccountManager::new(&backend, db);
        mgr.create_account(AccountId(1), 0, 100, 200).unwrap();

        let worker = HousekeepingWorker::new(
            backend,
            db_path,
            Duration::from_secs(3600),
            HousekeepingConfig::default(),
        );

        let (tx, rx) = channel();
        tx.send(ControlCommand::Terminate).unwrap();
        let mut control = ControlChannel::new(rx);
        worker.run(&mut control);
        assert!(control.terminate_requested());
    }
}
