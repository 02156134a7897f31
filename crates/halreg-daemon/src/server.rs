//! Unix-socket IPC server fronting the registry.
//!
//! Accepts connections on a Unix domain socket and dispatches JSON-RPC
//! method calls to a single dispatch task that exclusively owns the
//! [`Registry`] and [`TokenStore`]. Connection tasks only frame and
//! unframe; every mutation, including death cleanup, runs to completion
//! on the dispatch task, so no caller ever observes a half-updated index.
//!
//! Death watch: a handle published over a connection is keyed to that
//! connection. When the connection closes, one death command per linked
//! handle is funneled through the dispatch task, which clears the handle
//! everywhere it was published. Subscription pushes ride the same
//! connection; a closed connection makes delivery fail, which drops the
//! listener registry-side.

use crate::protocol::{
    read_frame, write_frame, HandleDescriptor, RegistrationEvent, RpcRequest, RpcResponse,
};
use halreg_core::{
    DeathWatch, DumpEntry, FqName, HandleId, IpcConfig, ListenerGone, RegistrationListener,
    Registry, RegistryConfig, ResolveMode, Result, ServiceHandle, TokenStore,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Transport cookie reserved for the daemon's self-registered services.
/// Connection ids start at 1, so cookie 0 never sees a death event.
const DAEMON_COOKIE: u64 = 0;

/// Handle to a running registry server. Dropping shuts down the server
/// and removes the socket file.
pub struct ServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Shut down the server gracefully: stop accepting connections and
    /// signal all active connection handlers to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Registry server over a Unix domain socket.
pub struct RegistryServer;

impl RegistryServer {
    /// Bind the socket, register the daemon's own control interface, and
    /// start serving. A stale socket file at the path is removed first.
    pub async fn start(socket_path: &Path, mode: ResolveMode) -> Result<ServerHandle> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;

        info!("Registry server listening on {}", socket_path.display());

        let links = ConnLinkTable::default();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(cmd_rx, links, mode));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            cmd_tx,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(ServerHandle {
            socket_path: socket_path.to_path_buf(),
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        cmd_tx: mpsc::UnboundedSender<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));
        let mut next_conn_id: u64 = 1;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Registry server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_IPC_CONNECTIONS {
                                warn!(
                                    "Rejecting connection: at max capacity ({})",
                                    IpcConfig::MAX_IPC_CONNECTIONS
                                );
                                continue;
                            }

                            let conn_id = next_conn_id;
                            next_conn_id += 1;

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let cmd_tx = cmd_tx.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection {} opened", conn_id);
                                if let Err(e) =
                                    handle_connection(stream, conn_id, &cmd_tx, &mut conn_shutdown).await
                                {
                                    debug!("Connection {} ended: {}", conn_id, e);
                                }
                                // The close event drives death cleanup for
                                // everything this peer published.
                                let _ = cmd_tx.send(Command::ConnectionClosed { conn_id });
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// Handle links per connection, fed by the registry's death-watch calls.
#[derive(Clone, Default)]
struct ConnLinkTable {
    inner: Arc<Mutex<HashMap<u64, HashSet<HandleId>>>>,
}

impl ConnLinkTable {
    /// Snapshot and forget every handle linked to `conn_id`.
    fn take(&self, conn_id: u64) -> Vec<HandleId> {
        self.inner
            .lock()
            .expect("link table lock poisoned")
            .remove(&conn_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }
}

impl DeathWatch for ConnLinkTable {
    fn link(&mut self, handle: &ServiceHandle) {
        self.inner
            .lock()
            .expect("link table lock poisoned")
            .entry(handle.transport_cookie())
            .or_default()
            .insert(handle.id());
    }

    fn unlink(&mut self, handle: &ServiceHandle) {
        let mut links = self.inner.lock().expect("link table lock poisoned");
        if let Some(set) = links.get_mut(&handle.transport_cookie()) {
            set.remove(&handle.id());
            if set.is_empty() {
                links.remove(&handle.transport_cookie());
            }
        }
    }
}

/// Listener that pushes registration notifications down a connection's
/// outbound channel. The channel closing (peer gone) turns every send
/// into [`ListenerGone`], which makes the registry drop the listener.
struct PushListener {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl RegistrationListener for PushListener {
    fn on_registration(
        &self,
        fq_name: &FqName,
        instance: &str,
        preexisting: bool,
    ) -> std::result::Result<(), ListenerGone> {
        let event = RegistrationEvent {
            fq_name: fq_name.to_string(),
            instance: instance.to_string(),
            preexisting,
        };
        let frame = serde_json::to_vec(&RpcRequest::notification(&event)).map_err(|_| ListenerGone)?;
        self.outbound.send(frame).map_err(|_| ListenerGone)
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Publish {
        conn_id: u64,
        owner_pid: Option<u32>,
        chain: Vec<String>,
        instance: String,
        reply: Reply<Option<u64>>,
    },
    Resolve {
        fq_name: String,
        instance: String,
        reply: Reply<Option<HandleDescriptor>>,
    },
    List {
        reply: Reply<Vec<String>>,
    },
    ListByInterface {
        fq_name: String,
        reply: Reply<Vec<String>>,
    },
    Subscribe {
        fq_name: String,
        instance: String,
        listener: Arc<PushListener>,
        reply: Reply<bool>,
    },
    RegisterPassthrough {
        fq_name: String,
        instance: String,
        pid: u32,
        reply: Reply<bool>,
    },
    DebugDump {
        reply: Reply<Vec<DumpEntry>>,
    },
    CreateToken {
        conn_id: u64,
        owner_pid: Option<u32>,
        reply: Reply<u64>,
    },
    GetToken {
        token: u64,
        reply: Reply<Option<HandleDescriptor>>,
    },
    UnregisterToken {
        token: u64,
        reply: Reply<bool>,
    },
    ConnectionClosed {
        conn_id: u64,
    },
}

/// The single dispatch point: exclusively owns the registry and token
/// store, services commands sequentially, and is also where death events
/// land. No other task touches registry state.
async fn dispatch_loop(
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    links: ConnLinkTable,
    mode: ResolveMode,
) {
    let mut registry = Registry::with_death_watch(mode, Box::new(links.clone()));
    let mut tokens = TokenStore::new();
    // Strong handles backing tokens, per connection. Dropping them on
    // disconnect is what makes weak promotion fail.
    let mut token_handles: HashMap<u64, Vec<ServiceHandle>> = HashMap::new();
    let mut next_handle_id: u64 = 1;

    // The registry is its own first service, like any other manager.
    let own_handle = ServiceHandle::new(
        HandleId(next_handle_id),
        Some(std::process::id()),
        DAEMON_COOKIE,
    );
    next_handle_id += 1;
    let own_chain: Vec<String> = RegistryConfig::MANAGER_CHAIN
        .iter()
        .map(|s| s.to_string())
        .collect();
    if !registry.publish(&own_chain, RegistryConfig::MANAGER_INSTANCE, own_handle) {
        error!("Failed to register the registry with itself");
    }

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Publish {
                conn_id,
                owner_pid,
                chain,
                instance,
                reply,
            } => {
                let handle = ServiceHandle::new(HandleId(next_handle_id), owner_pid, conn_id);
                next_handle_id += 1;
                let handle_id = handle.id().0;
                let ok = registry.publish(&chain, &instance, handle);
                let _ = reply.send(ok.then_some(handle_id));
            }
            Command::Resolve {
                fq_name,
                instance,
                reply,
            } => {
                let descriptor = registry
                    .resolve(&fq_name, &instance)
                    .map(|h| HandleDescriptor::from(&h));
                let _ = reply.send(descriptor);
            }
            Command::List { reply } => {
                let _ = reply.send(registry.list());
            }
            Command::ListByInterface { fq_name, reply } => {
                let _ = reply.send(registry.list_by_interface(&fq_name));
            }
            Command::Subscribe {
                fq_name,
                instance,
                listener,
                reply,
            } => {
                let _ = reply.send(registry.subscribe(&fq_name, &instance, listener));
            }
            Command::RegisterPassthrough {
                fq_name,
                instance,
                pid,
                reply,
            } => {
                let _ = reply.send(registry.register_passthrough_client(&fq_name, &instance, pid));
            }
            Command::DebugDump { reply } => {
                let _ = reply.send(registry.debug_dump());
            }
            Command::CreateToken {
                conn_id,
                owner_pid,
                reply,
            } => {
                let handle = ServiceHandle::new(HandleId(next_handle_id), owner_pid, conn_id);
                next_handle_id += 1;
                let token = tokens.create_token(&handle);
                token_handles.entry(conn_id).or_default().push(handle);
                let _ = reply.send(token);
            }
            Command::GetToken { token, reply } => {
                let descriptor = tokens.get(token).map(|h| HandleDescriptor::from(&h));
                let _ = reply.send(descriptor);
            }
            Command::UnregisterToken { token, reply } => {
                let _ = reply.send(tokens.unregister(token));
            }
            Command::ConnectionClosed { conn_id } => {
                for handle_id in links.take(conn_id) {
                    registry.on_remote_death(handle_id);
                }
                if let Some(handles) = token_handles.remove(&conn_id) {
                    for handle in handles {
                        handle.mark_dead();
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    conn_id: u64,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    conn_shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let owner_pid = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .map(|pid| pid as u32);

    let (mut reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx));

    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => {
                match result? {
                    Some(frame) => frame,
                    None => break, // clean disconnect
                }
            }
            _ = conn_shutdown.changed() => break,
        };

        let response = process_frame(&frame, conn_id, owner_pid, cmd_tx, &outbound_tx).await;
        let bytes = serde_json::to_vec(&response)?;
        if outbound_tx.send(bytes).is_err() {
            break;
        }
    }

    drop(outbound_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = outbound_rx.recv().await {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
}

struct MethodError {
    code: i32,
    message: String,
}

impl MethodError {
    fn invalid_params(e: impl std::fmt::Display) -> Self {
        Self {
            code: -32602,
            message: format!("Invalid params: {e}"),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32000,
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct PublishParams {
    interface_chain: Vec<String>,
    instance: String,
}

#[derive(Deserialize)]
struct ResolveParams {
    fq_name: String,
    instance: String,
}

#[derive(Deserialize)]
struct InterfaceParams {
    fq_name: String,
}

#[derive(Deserialize)]
struct SubscribeParams {
    fq_name: String,
    /// Empty string subscribes to the whole interface.
    #[serde(default)]
    instance: String,
}

#[derive(Deserialize)]
struct PassthroughParams {
    fq_name: String,
    instance: String,
    /// Defaults to the calling connection's pid.
    pid: Option<u32>,
}

#[derive(Deserialize)]
struct TokenParams {
    token: u64,
}

async fn process_frame(
    frame: &[u8],
    conn_id: u64,
    owner_pid: Option<u32>,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    outbound_tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(e) => return RpcResponse::error(None, -32700, format!("Parse error: {e}")),
    };

    let id = request.id;
    let params = request.params.unwrap_or(serde_json::Value::Null);

    match dispatch_method(&request.method, params, conn_id, owner_pid, cmd_tx, outbound_tx).await {
        Ok(result) => RpcResponse::success(id, result),
        Err(e) => RpcResponse::error(id, e.code, e.message),
    }
}

async fn dispatch_method(
    method: &str,
    params: serde_json::Value,
    conn_id: u64,
    owner_pid: Option<u32>,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    outbound_tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> std::result::Result<serde_json::Value, MethodError> {
    match method {
        "publish" => {
            let p: PublishParams = parse_params(params)?;
            let handle_id = ask(cmd_tx, |reply| Command::Publish {
                conn_id,
                owner_pid,
                chain: p.interface_chain,
                instance: p.instance,
                reply,
            })
            .await?;
            Ok(serde_json::json!({ "ok": handle_id.is_some(), "handle_id": handle_id }))
        }
        "resolve" => {
            let p: ResolveParams = parse_params(params)?;
            let handle = ask(cmd_tx, |reply| Command::Resolve {
                fq_name: p.fq_name,
                instance: p.instance,
                reply,
            })
            .await?;
            Ok(serde_json::json!({ "handle": handle }))
        }
        "list" => {
            let services = ask(cmd_tx, |reply| Command::List { reply }).await?;
            Ok(serde_json::json!({ "services": services }))
        }
        "list_by_interface" => {
            let p: InterfaceParams = parse_params(params)?;
            let instances = ask(cmd_tx, |reply| Command::ListByInterface {
                fq_name: p.fq_name,
                reply,
            })
            .await?;
            Ok(serde_json::json!({ "instances": instances }))
        }
        "subscribe" => {
            let p: SubscribeParams = parse_params(params)?;
            let listener = Arc::new(PushListener {
                outbound: outbound_tx.clone(),
            });
            let ok = ask(cmd_tx, |reply| Command::Subscribe {
                fq_name: p.fq_name,
                instance: p.instance,
                listener,
                reply,
            })
            .await?;
            Ok(serde_json::json!({ "ok": ok }))
        }
        "register_passthrough" => {
            let p: PassthroughParams = parse_params(params)?;
            let pid = p
                .pid
                .or(owner_pid)
                .ok_or_else(|| MethodError::invalid_params("no pid supplied or derivable"))?;
            let ok = ask(cmd_tx, |reply| Command::RegisterPassthrough {
                fq_name: p.fq_name,
                instance: p.instance,
                pid,
                reply,
            })
            .await?;
            Ok(serde_json::json!({ "ok": ok }))
        }
        "debug_dump" => {
            let entries = ask(cmd_tx, |reply| Command::DebugDump { reply }).await?;
            Ok(serde_json::json!({ "entries": entries }))
        }
        "create_token" => {
            let token = ask(cmd_tx, |reply| Command::CreateToken {
                conn_id,
                owner_pid,
                reply,
            })
            .await?;
            Ok(serde_json::json!({ "token": token }))
        }
        "get_token" => {
            let p: TokenParams = parse_params(params)?;
            let handle = ask(cmd_tx, |reply| Command::GetToken { token: p.token, reply }).await?;
            Ok(serde_json::json!({ "handle": handle }))
        }
        "unregister_token" => {
            let p: TokenParams = parse_params(params)?;
            let ok = ask(cmd_tx, |reply| Command::UnregisterToken { token: p.token, reply }).await?;
            Ok(serde_json::json!({ "ok": ok }))
        }
        "ping" => Ok(serde_json::json!({ "pong": true })),
        _ => Err(MethodError {
            code: -32601,
            message: format!("Method not found: {method}"),
        }),
    }
}

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> std::result::Result<T, MethodError> {
    serde_json::from_value(params).map_err(MethodError::invalid_params)
}

async fn ask<T>(
    cmd_tx: &mpsc::UnboundedSender<Command>,
    build: impl FnOnce(Reply<T>) -> Command,
) -> std::result::Result<T, MethodError> {
    let (tx, rx) = oneshot::channel();
    cmd_tx
        .send(build(tx))
        .map_err(|_| MethodError::internal("registry dispatch unavailable"))?;
    rx.await
        .map_err(|_| MethodError::internal("registry dispatch dropped the reply"))
}
