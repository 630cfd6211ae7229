//! The daemon: TLS listener, per-connection sessions, worker wiring.

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use coffer_store::{AccountDatabase, HousekeepingConfig, StoreBackend, StoreContext};

use crate::config::ServerConfig;
use crate::control::{ControlChannel, ControlCommand, DaemonCoordinator};
use crate::error::{ServerError, ServerResult};
use crate::session::{read_frame_with_body_timeout, write_frame, Command, Response, Session};
use crate::tls;
use crate::worker::HousekeepingWorker;

/// The assembled daemon.
pub struct Daemon {
    config: ServerConfig,
    backend: Arc<StoreBackend>,
    coordinator: Arc<DaemonCoordinator>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

impl Daemon {
    /// Builds the daemon from configuration, starting the housekeeping
    /// worker thread.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let backend = Arc::new(config.build_backend()?);

        let (tx, rx) = channel::<ControlCommand>();
        let coordinator = Arc::new(DaemonCoordinator::new(tx));

        let worker = HousekeepingWorker::new(
            backend.clone(),
            config.account_db.clone(),
            Duration::from_secs(config.housekeeping_interval_secs),
            HousekeepingConfig::default(),
        );
        let worker_handle = std::thread::Builder::new()
            .name("housekeeping".to_string())
            .spawn(move || {
                let mut control = ControlChannel::new(rx);
                worker.run(&mut control);
            })?;

        Ok(Self {
            config,
            backend,
            coordinator,
            worker_handle: Some(worker_handle),
        })
    }

    /// Accepts connections until interrupted, then shuts the worker down.
    pub async fn run(mut self) -> ServerResult<()> {
        let acceptor = tls::build_acceptor(&self.config.tls)?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "coffer store daemon listening");

        if let Some(socket) = self.config.control_socket.clone() {
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::control::serve_control_socket(socket, coordinator).await {
                    error!(error = %e, "control socket failed");
                }
            });
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let acceptor = acceptor.clone();
                    let backend = self.backend.clone();
                    let coordinator = self.coordinator.clone();
                    let account_db = self.config.account_db.clone();
                    let op_timeout =
                        Duration::from_secs(self.config.operation_timeout_secs);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(
                            stream, acceptor, backend, coordinator, account_db, op_timeout,
                        )
                        .await
                        {
                            warn!(peer = %peer, error = %e, "session ended with error");
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
            }
        }

        self.coordinator.send(ControlCommand::Terminate);
        if let Some(handle) = self.worker_handle.take() {
            if handle.join().is_err() {
                error!("housekeeping worker panicked");
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: tokio_rustls::TlsAcceptor,
    backend: Arc<StoreBackend>,
    coordinator: Arc<DaemonCoordinator>,
    account_db: std::path::PathBuf,
    op_timeout: Duration,
) -> ServerResult<()> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| ServerError::Tls(format!("handshake failed: {e}")))?;

    let account = {
        let (_, connection) = tls_stream.get_ref();
        let certs = connection
            .peer_certificates()
            .ok_or_else(|| ServerError::AuthenticationFailed("no client certificate".into()))?;
        let leaf = certs
            .first()
            .ok_or_else(|| ServerError::AuthenticationFailed("empty certificate chain".into()))?;
        tls::account_from_peer_cert(leaf.as_ref())?
    };

    let database = AccountDatabase::load(&account_db)?;
    let disc_set = database
        .disc_set(account)
        .map_err(|_| ServerError::AuthenticationFailed(format!("unknown account {account}")))?;

    let mut context = StoreContext::new(backend, coordinator, account, disc_set);
    // Sessions are writers; the lock acquisition nudges housekeeping off
    // the account and retries before giving up.
    tokio::task::block_in_place(|| context.open(true))?;

    if !context.account_info()?.is_enabled() {
        tokio::task::block_in_place(|| context.finish())?;
        return Err(ServerError::AuthenticationFailed(format!(
            "account {account} is disabled"
        )));
    }

    info!(account = %account, "session started");
    let mut session = Session::new(context);
    let mut tls_stream = tls_stream;

    let result = async {
        loop {
            // An idle client may sit between operations indefinitely, but
            // once a frame begins its body (the payload included) must
            // arrive within the operation timeout.
            let command: Command =
                match read_frame_with_body_timeout(&mut tls_stream, Some(op_timeout)).await {
                    Ok(c) => c,
                    Err(ServerError::Io(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        // Clean hang-up between operations.
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };

            let response = tokio::task::block_in_place(|| session.handle(command));
            let finished = matches!(response, Response::Finished);
            write_frame(&mut tls_stream, &response).await?;
            if finished {
                return Ok(());
            }
        }
    }
    .await;

    if !session.is_finished() {
        if let Err(e) = tokio::task::block_in_place(|| session.finish()) {
            warn!(account = %account, error = %e, "failed to flush session state");
        }
    }
    info!(account = %account, "session ended");
    result
}
