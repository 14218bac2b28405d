use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tracing::{debug, error, info, instrument, warn};

use crate::aof::Aof;
use crate::codec::FrameCodec;
use crate::commands::executable::Executable;
use crate::commands::{Command, CommandParserError};
use crate::config::Config;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Binds from `config`, restores the database and serves clients until Ctrl-C or SIGTERM.
pub async fn run(config: Config) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let server = Server::bind(config).await?;

    server.serve(shutdown_signal()).await
}

/// Completes on Ctrl-C, or on SIGTERM on unix. The SIGTERM handler is installed right away, not
/// on first poll.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            None
        }
    };

    async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Some(mut sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }
    }
}

/// A listening server together with the database it serves and the log that persists it.
pub struct Server {
    listener: TcpListener,
    store: Store,
    aof: Aof,
    config: Config,
}

impl Server {
    /// Binds the listener and opens the AOF, then replays the AOF into a fresh store. Failing to
    /// bind or to open the file is fatal, a damaged log is not: the server starts with whatever
    /// could be restored.
    pub async fn bind(config: Config) -> Result<Server, Error> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let aof = Aof::open(&config.aof_path).await?;
        let store = Store::new();

        restore(&aof, &store).await;

        info!("Redis server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            store,
            aof,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// Accepts connections until `shutdown` completes. The listener is then closed, which ends the
    /// accept loop, and the AOF is flushed and closed. Connections already accepted keep running
    /// until their clients go away.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        let Server {
            listener,
            store,
            aof,
            config,
        } = self;

        tokio::pin!(shutdown);

        loop {
            let (socket, client_address) = tokio::select! {
                accepted = accept_with_backoff(|| listener.accept()) => accepted,
                _ = &mut shutdown => break,
            };

            info!("Accepted connection from {:?}", client_address);

            let store = store.clone();
            let aof = aof.clone();
            let max_frame_size = config.max_frame_size;

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(socket, client_address, store, aof, max_frame_size).await
                {
                    error!("Connection error: {}", e);
                }
            });
        }

        drop(listener);
        info!("Server stopped accepting connections");

        aof.close().await?;
        Ok(())
    }
}

/// Calls `accept` until it succeeds. Errors such as EMFILE tend to persist, so each failure is
/// followed by a pause of [`ACCEPT_BACKOFF`].
async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Rebuilds `store` from the AOF by running every logged command through the regular command
/// path. Returns the number of commands applied.
pub async fn restore(aof: &Aof, store: &Store) -> usize {
    let mut restored = 0;

    let result = aof
        .replay(|frame| match Command::try_from(frame) {
            Ok(cmd) => match cmd.exec(store.clone()) {
                Ok(_) => restored += 1,
                Err(e) => warn!("Failed to apply command from AOF: {}", e),
            },
            Err(e) => warn!("Invalid command in AOF, skipping: {}", e),
        })
        .await;

    match result {
        Ok(_) if restored > 0 => info!("Restored {} commands from AOF", restored),
        Ok(_) => {}
        Err(e) => {
            warn!("Failed to restore from AOF: {}", e);
            warn!("Starting with a partial database, {} commands restored", restored);
        }
    }

    restored
}

#[instrument(
    name = "connection",
    skip(stream, client_address, store, aof, max_frame_size),
    fields(connection_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    store: Store,
    aof: Aof,
    max_frame_size: usize,
) -> Result<(), Error> {
    let mut conn = Connection::with_codec(stream, FrameCodec::new(max_frame_size));

    tracing::Span::current()
        .record("connection_id", conn.id.to_string())
        .record("client_address", client_address.to_string());

    loop {
        let frame = match conn.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            // The stream can't be trusted to be in sync anymore.
            Err(e) => {
                warn!("Dropping connection: {}", e);
                break;
            }
        };

        debug!("Received frame from client: {}", frame);
        let res = dispatch(frame, &store, &aof).await;
        debug!("Sending response to client: {}", res);

        conn.write_frame(res).await?;
    }

    info!(bytes_read = conn.bytes_read(), "Connection closed");
    Ok(())
}

/// Runs a single request and returns the reply.
///
/// Write commands are appended to the AOF only once they parsed and executed successfully, so
/// the log never holds a command that was rejected. A failed append is logged; the in-memory
/// store stays authoritative.
pub async fn dispatch(frame: Frame, store: &Store, aof: &Aof) -> Frame {
    let cmd = match Command::try_from(frame.clone()) {
        Ok(cmd) => cmd,
        Err(err) => {
            match &err {
                CommandParserError::UnknownCommand { command } => {
                    warn!("Unknown command: {}", command)
                }
                CommandParserError::InvalidFrame { .. } | CommandParserError::EmptyCommand => {
                    warn!("Invalid request: {}", err)
                }
                _ => debug!("Rejected command: {}", err),
            }
            return err.into();
        }
    };

    let name = cmd.name();

    if !cmd.is_write() {
        return exec(cmd, store);
    }

    // Writes hold the log while they run, so the log order matches the order they were applied.
    let mut log = aof.lock().await;
    let res = exec(cmd, store);

    if !matches!(res, Frame::Error(_)) {
        if let Err(e) = log.append(&frame).await {
            warn!("Failed to write {} to AOF: {}", name, e);
        }
    }

    res
}

fn exec(cmd: Command, store: &Store) -> Frame {
    let name = cmd.name();

    match cmd.exec(store.clone()) {
        Ok(res) => res,
        Err(e) => {
            error!("Failed to execute {}: {}", name, e);
            Frame::Error(format!("ERR {}", e))
        }
    }
}
