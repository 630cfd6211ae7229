//! Control protocol between the daemon and the housekeeping worker.
//!
//! Line-oriented ASCII, one command per line:
//!
//! * `h`: reload configuration
//! * `t`: terminate
//! * `r<hex account id>`: release the named account's lock soon
//!
//! Inside one process the commands travel over an mpsc channel; the same
//! codec also serves the external stream socket so an operator (or a
//! second process) can send the identical bytes.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use coffer_store::{AccountId, HousekeepingControl, HousekeepingCoordinator};

/// A parsed control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Reload the daemon configuration.
    ReloadConfig,
    /// Shut the worker (and daemon) down.
    Terminate,
    /// Stop housekeeping on the given account so a session can lock it.
    ReleaseAccount(AccountId),
}

impl ControlCommand {
    /// Parses one line of the control protocol.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "h" => Some(ControlCommand::ReloadConfig),
            "t" => Some(ControlCommand::Terminate),
            _ => {
                let hex = line.strip_prefix('r')?;
                u32::from_str_radix(hex, 16)
                    .ok()
                    .map(|id| ControlCommand::ReleaseAccount(AccountId(id)))
            }
        }
    }

    /// Renders the command as a protocol line (without the newline).
    pub fn encode(&self) -> String {
        match self {
            ControlCommand::ReloadConfig => "h".to_string(),
            ControlCommand::Terminate => "t".to_string(),
            ControlCommand::ReleaseAccount(id) => format!("r{id}"),
        }
    }
}

/// Receiving end of the control channel, polled by housekeeping at its
/// yield points.
pub struct ControlChannel {
    rx: Receiver<ControlCommand>,
    terminate: bool,
    reload: bool,
}

impl ControlChannel {
    /// Wraps a receiver.
    pub fn new(rx: Receiver<ControlCommand>) -> Self {
        Self {
            rx,
            terminate: false,
            reload: false,
        }
    }

    /// True once a terminate command has been seen.
    pub fn terminate_requested(&self) -> bool {
        self.terminate
    }

    /// True once a reload command has been seen; reading clears it.
    pub fn take_reload_request(&mut self) -> bool {
        std::mem::take(&mut self.reload)
    }

    /// Drains pending commands, returning true when the current account
    /// should be released.
    fn poll(&mut self, account: Option<AccountId>) -> bool {
        let mut release = false;
        while let Ok(command) = self.rx.try_recv() {
            debug!(?command, "control command received");
            match command {
                ControlCommand::Terminate => self.terminate = true,
                ControlCommand::ReloadConfig => self.reload = true,
                ControlCommand::ReleaseAccount(id) => {
                    if account == Some(id) {
                        info!(account = %id, "yielding account to a waiting session");
                        release = true;
                    }
                }
            }
        }
        release || self.terminate
    }

    /// Polls without an active account (between accounts).
    pub fn poll_idle(&mut self) -> bool {
        self.poll(None)
    }
}

impl HousekeepingControl for ControlChannel {
    fn should_stop(&mut self, account: AccountId) -> bool {
        self.poll(Some(account))
    }
}

/// Sending side used by sessions to nudge the worker off an account.
pub struct DaemonCoordinator {
    tx: Mutex<Sender<ControlCommand>>,
}

impl DaemonCoordinator {
    /// Wraps a sender.
    pub fn new(tx: Sender<ControlCommand>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    /// Sends an arbitrary control command.
    pub fn send(&self, command: ControlCommand) {
        let tx = self.tx.lock().expect("control sender poisoned");
        if tx.send(command).is_err() {
            warn!("housekeeping worker is gone; control command dropped");
        }
    }
}

impl HousekeepingCoordinator for DaemonCoordinator {
    fn request_account_release(&self, account: AccountId) {
        self.send(ControlCommand::ReleaseAccount(account));
    }
}

/// Serves the control protocol on a unix socket, forwarding parsed
/// commands to the worker. Unknown lines are logged and dropped; no reply
/// is ever sent.
pub async fn serve_control_socket(
    path: std::path::PathBuf,
    coordinator: std::sync::Arc<DaemonCoordinator>,
) -> std::io::Result<()> {
    // A stale socket from a previous run would make bind fail.
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path)?;
    info!(socket = %path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, BufReader};
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match ControlCommand::parse(&line) {
                    Some(command) => coordinator.send(command),
                    None => warn!(line = %line, "ignoring malformed control line"),
                }
            }
        });
    }
}
