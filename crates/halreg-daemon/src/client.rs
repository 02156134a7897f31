//! IPC client for the registry daemon.
//!
//! Connects to the daemon's Unix socket and provides typed wrappers for
//! every registry method. Because the server pushes registration
//! notifications down the same connection, a background reader task
//! routes incoming frames: replies are matched to pending calls by id,
//! pushes are forwarded to the event receiver handed out at connect time.

use crate::protocol::{
    read_frame, write_frame, HandleDescriptor, Incoming, RegistrationEvent, RpcRequest,
    REGISTRATION_METHOD,
};
use halreg_core::{DumpEntry, IpcConfig, RegistryError, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Incoming>>>>;

/// Client connection to the registry daemon.
pub struct RegistryClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader_task: tokio::task::JoinHandle<()>,
}

impl RegistryClient {
    /// Connect to the daemon's socket.
    ///
    /// Returns the client plus the stream of registration events for any
    /// subscriptions made over this connection.
    pub async fn connect(
        socket_path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RegistrationEvent>)> {
        let stream = tokio::time::timeout(
            IpcConfig::IPC_CONNECT_TIMEOUT,
            UnixStream::connect(socket_path),
        )
        .await
        .map_err(|_| RegistryError::transport("timed out connecting to registry daemon"))??;

        debug!("Connected to registry daemon at {}", socket_path.display());

        let (reader, writer) = stream.into_split();
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(reader, pending.clone(), event_tx));

        Ok((
            Self {
                writer: Mutex::new(writer),
                pending,
                next_id: AtomicU64::new(1),
                reader_task,
            },
            event_rx,
        ))
    }

    /// Call a JSON-RPC method and await its reply.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);
        let request_bytes = serde_json::to_vec(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request_bytes).await?;
        }

        let response = rx
            .await
            .map_err(|_| RegistryError::transport("connection to registry daemon lost"))?;

        if let Some(err) = response.error {
            return Err(RegistryError::transport(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }
        response
            .result
            .ok_or_else(|| RegistryError::transport("reply carried neither result nor error"))
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let result = self.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Publish this connection as the implementation of `interface_chain`
    /// under `instance`. Returns the daemon-assigned handle id, or `None`
    /// when the publish was rejected.
    pub async fn publish(&self, interface_chain: &[&str], instance: &str) -> Result<Option<u64>> {
        #[derive(Deserialize)]
        struct R {
            handle_id: Option<u64>,
        }
        let r: R = self
            .call_as(
                "publish",
                serde_json::json!({ "interface_chain": interface_chain, "instance": instance }),
            )
            .await?;
        Ok(r.handle_id)
    }

    /// Resolve (identity, instance) to a handle descriptor.
    pub async fn resolve(&self, fq_name: &str, instance: &str) -> Result<Option<HandleDescriptor>> {
        #[derive(Deserialize)]
        struct R {
            handle: Option<HandleDescriptor>,
        }
        let r: R = self
            .call_as(
                "resolve",
                serde_json::json!({ "fq_name": fq_name, "instance": instance }),
            )
            .await?;
        Ok(r.handle)
    }

    /// List every registered instance that currently has a live handle.
    pub async fn list(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct R {
            services: Vec<String>,
        }
        let r: R = self.call_as("list", serde_json::json!({})).await?;
        Ok(r.services)
    }

    /// List live instance names under one interface identity.
    pub async fn list_by_interface(&self, fq_name: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct R {
            instances: Vec<String>,
        }
        let r: R = self
            .call_as("list_by_interface", serde_json::json!({ "fq_name": fq_name }))
            .await?;
        Ok(r.instances)
    }

    /// Subscribe to arrivals of (identity, instance); an empty instance
    /// subscribes to the whole interface. Events arrive on the receiver
    /// returned by [`RegistryClient::connect`].
    pub async fn subscribe(&self, fq_name: &str, instance: &str) -> Result<bool> {
        #[derive(Deserialize)]
        struct R {
            ok: bool,
        }
        let r: R = self
            .call_as(
                "subscribe",
                serde_json::json!({ "fq_name": fq_name, "instance": instance }),
            )
            .await?;
        Ok(r.ok)
    }

    /// Record a passthrough client for (identity, instance). With
    /// `pid: None`, the daemon records the calling process.
    pub async fn register_passthrough(
        &self,
        fq_name: &str,
        instance: &str,
        pid: Option<u32>,
    ) -> Result<bool> {
        #[derive(Deserialize)]
        struct R {
            ok: bool,
        }
        let r: R = self
            .call_as(
                "register_passthrough",
                serde_json::json!({ "fq_name": fq_name, "instance": instance, "pid": pid }),
            )
            .await?;
        Ok(r.ok)
    }

    /// Fetch the passthrough diagnostic dump.
    pub async fn debug_dump(&self) -> Result<Vec<DumpEntry>> {
        #[derive(Deserialize)]
        struct R {
            entries: Vec<DumpEntry>,
        }
        let r: R = self.call_as("debug_dump", serde_json::json!({})).await?;
        Ok(r.entries)
    }

    /// Mint a token backed by this connection.
    pub async fn create_token(&self) -> Result<u64> {
        #[derive(Deserialize)]
        struct R {
            token: u64,
        }
        let r: R = self.call_as("create_token", serde_json::json!({})).await?;
        Ok(r.token)
    }

    /// Resolve a token to its handle descriptor, if still live.
    pub async fn get_token(&self, token: u64) -> Result<Option<HandleDescriptor>> {
        #[derive(Deserialize)]
        struct R {
            handle: Option<HandleDescriptor>,
        }
        let r: R = self
            .call_as("get_token", serde_json::json!({ "token": token }))
            .await?;
        Ok(r.handle)
    }

    /// Drop a token. Returns whether it existed.
    pub async fn unregister_token(&self, token: u64) -> Result<bool> {
        #[derive(Deserialize)]
        struct R {
            ok: bool,
        }
        let r: R = self
            .call_as("unregister_token", serde_json::json!({ "token": token }))
            .await?;
        Ok(r.ok)
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    mut reader: tokio::net::unix::OwnedReadHalf,
    pending: PendingMap,
    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => break,
        };

        let incoming: Incoming = match serde_json::from_slice(&frame) {
            Ok(incoming) => incoming,
            Err(e) => {
                debug!("Discarding unparseable frame: {}", e);
                continue;
            }
        };

        // Server push: a registration notification (method, no id).
        if incoming.id.is_none() && incoming.method.as_deref() == Some(REGISTRATION_METHOD) {
            let Some(params) = incoming.params else {
                continue;
            };
            match serde_json::from_value::<RegistrationEvent>(params) {
                Ok(event) => {
                    if event_tx.send(event).is_err() {
                        // Receiver dropped; stop forwarding but keep
                        // routing replies.
                        debug!("Registration event receiver dropped");
                    }
                }
                Err(e) => debug!("Malformed registration event: {}", e),
            }
            continue;
        }

        // Reply to a pending call.
        if let Some(id) = incoming.id {
            let tx = pending.lock().expect("pending map lock poisoned").remove(&id);
            if let Some(tx) = tx {
                let _ = tx.send(incoming);
            }
        } else {
            debug!("Discarding unexpected frame");
        }
    }

    // Connection gone: fail every in-flight call.
    pending.lock().expect("pending map lock poisoned").clear();
}
