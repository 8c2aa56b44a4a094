//! Connection handler module
//!
//! Drives one client connection from accept to close:
//! - Handshake and server key exchange
//! - Login block decoding, credential checks and save loading
//! - Hand-off of the authenticated session to the world
//! - Reader and writer tasks for the rest of the connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::crypto::CipherPair;
use crate::error::{LoginResponse, NetworkError, ProtocolError, Result};
use crate::game::persistence::{hash_password, LoadOutcome, PlayerSave};
use crate::game::world::PendingLogin;
use crate::net::codec::{FrameDecoder, FrameEncoder};
use crate::net::session::{GameSession, SessionHandle, SessionId};
use crate::net::transport::{read_loop, write_loop, BufferedTransport};
use crate::protocol::login::{
    handshake_response, validate_credentials, LoginBlock, LoginReply, LoginType, HANDSHAKE_OPCODE,
};
use crate::protocol::messages::incoming_size;
use crate::state::AppState;

/// Time allowed from accept to the login response
const LOGIN_TIMEOUT_SECS: u64 = 30;

/// A session that made it into the world
struct Admitted {
    handle: Arc<SessionHandle>,
    decoder: FrameDecoder,
    outbound: mpsc::Receiver<bytes::Bytes>,
}

/// Connection handler for processing client connections
pub struct ConnectionHandler {
    state: Arc<AppState>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Handle a TCP connection until it closes
    pub async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let id = self.state.registry.open(addr)?;
        debug!(session_id = id, address = %addr, "Handling TCP connection");

        let result = self.run(id, addr, stream).await;
        self.state.registry.close(id);
        result
    }

    async fn run(&self, id: SessionId, addr: SocketAddr, stream: TcpStream) -> Result<()> {
        let mut transport = BufferedTransport::new(stream);

        let login = timeout(
            Duration::from_secs(LOGIN_TIMEOUT_SECS),
            self.login(&mut transport, id, addr),
        )
        .await
        .map_err(|_| NetworkError::Timeout)??;
        let Some(Admitted {
            handle,
            decoder,
            outbound,
        }) = login
        else {
            return Ok(());
        };

        let (reader, writer, buffer) = transport.into_parts();
        let writer_task = tokio::spawn(write_loop(writer, outbound, handle.clone()));
        read_loop(reader, buffer, decoder, handle.clone()).await;

        // the world drops the outbound sender once the player is logged out
        if let Err(e) = writer_task.await {
            error!(session_id = id, error = %e, "Writer task panicked");
        }
        debug!(session_id = id, "Session ended");
        Ok(())
    }

    /// Handshake and login. `None` means the client was sent a rejection.
    async fn login(
        &self,
        transport: &mut BufferedTransport,
        id: SessionId,
        addr: SocketAddr,
    ) -> Result<Option<Admitted>> {
        let opcode = transport.read_byte().await?;
        if opcode != HANDSHAKE_OPCODE {
            return Err(ProtocolError::InvalidHandshake(opcode).into());
        }
        let _name_hash = transport.read_byte().await?;

        let server_key: u64 = rand::random();
        transport.queue_write(&handshake_response(server_key));
        transport.flush().await?;

        let login_type = LoginType::from_u8(transport.read_byte().await?)?;
        let length = transport.read_byte().await? as usize;
        let block = transport.read_exact(length).await?;
        let block = self
            .state
            .login_decoder
            .decode(login_type, block, server_key)?;

        let save = match self.authenticate(id, &block).await {
            Ok(save) => save,
            Err(code) => {
                info!(session_id = id, username = %block.username, ?code, "Login rejected");
                reject(transport, code).await?;
                return Ok(None);
            }
        };
        let username = save.username.clone();

        match self.admit(id, addr, &block, save).await {
            Ok((admitted, rights)) => {
                transport.queue_write(&LoginReply::Accepted { rights }.encode());
                if let Err(e) = transport.flush().await {
                    // already in the world; the next tick logs it out
                    admitted.handle.signal_disconnect();
                    return Err(e);
                }
                self.state.registry.attach(admitted.handle.clone());
                info!(session_id = id, player = %username, address = %addr, "Login accepted");
                Ok(Some(admitted))
            }
            Err(code) => {
                self.state.registry.release_username(id, &username);
                info!(session_id = id, player = %username, ?code, "Login rejected");
                reject(transport, code).await?;
                Ok(None)
            }
        }
    }

    /// Check credentials and load the save, claiming the username on success
    async fn authenticate(
        &self,
        id: SessionId,
        block: &LoginBlock,
    ) -> std::result::Result<PlayerSave, LoginResponse> {
        let username = validate_credentials(&block.username, &block.password)?;
        if !self.state.registry.claim_username(id, &username) {
            return Err(LoginResponse::AlreadyLoggedIn);
        }

        let store = self.state.store.clone();
        let password = block.password.clone();
        let name = username.clone();
        let loaded = tokio::task::spawn_blocking(move || match store.load(&name, &password) {
            LoadOutcome::Loaded {
                credential_ok: true,
                save,
            } => Ok(*save),
            LoadOutcome::Loaded { .. } => Err(LoginResponse::InvalidCredentials),
            LoadOutcome::NotFound => hash_password(&password)
                .map(|hash| PlayerSave::new(name.as_str(), hash))
                .map_err(|e| LoginResponse::from(&e)),
            LoadOutcome::Corrupt(reason) => {
                warn!(player = %name, reason = %reason, "Refusing login to unreadable save");
                Err(LoginResponse::CouldNotCompleteLogin)
            }
        })
        .await
        .unwrap_or_else(|e| {
            error!(player = %username, error = %e, "Load task panicked");
            Err(LoginResponse::CouldNotCompleteLogin)
        });

        if loaded.is_err() {
            self.state.registry.release_username(id, &username);
        }
        loaded
    }

    /// Build the session and wait for the world to place the player
    async fn admit(
        &self,
        id: SessionId,
        addr: SocketAddr,
        block: &LoginBlock,
        save: PlayerSave,
    ) -> std::result::Result<(Admitted, u8), LoginResponse> {
        let config = &self.state.config;
        let (handle, inbound) = SessionHandle::new(id, addr, config.inbound_queue_capacity);
        handle.set_username(save.username.as_str());

        let (encoder, decoder) = CipherPair::for_server(block.keys).split();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_capacity);
        let session = GameSession::new(
            handle.clone(),
            inbound,
            FrameEncoder::new(encoder),
            outbound_tx,
        );

        let rights = save.rights.as_u8();
        let (reply, placed) = oneshot::channel();
        let pending = PendingLogin {
            save,
            session,
            reply,
        };
        if self.state.logins.send(pending).await.is_err() {
            return Err(LoginResponse::ServerUpdating);
        }

        match placed.await {
            Ok(Ok(index)) => {
                debug!(session_id = id, index, "Player placed in world");
                Ok((
                    Admitted {
                        handle,
                        decoder: FrameDecoder::new(decoder, incoming_size),
                        outbound: outbound_rx,
                    },
                    rights,
                ))
            }
            Ok(Err(code)) => Err(code),
            Err(_) => Err(LoginResponse::ServerUpdating),
        }
    }
}

async fn reject(transport: &mut BufferedTransport, code: LoginResponse) -> Result<()> {
    transport.queue_write(&LoginReply::Rejected(code).encode());
    transport.flush().await
}

/// Accept game connections until shutdown is signalled
pub async fn accept_connections(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(address = %addr, "New game connection");
                        let handler = ConnectionHandler::new(state.clone());
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle_tcp(stream, addr).await {
                                warn!(address = %addr, error = %e, "Game connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept game connection");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Game connection acceptor shutting down");
                break;
            }
        }
    }
}
