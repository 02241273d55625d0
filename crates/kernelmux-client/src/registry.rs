//! Keyed set of kernel clients, one per kernel id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::client::KernelClient;
use crate::config::ClientConfig;
use crate::connector::ConnectorFactory;
use crate::error::{ClientError, Result};

/// Kernel lifecycle notifications from whatever supervises kernel processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Started(String),
    Restarted(String),
    Shutdown(String),
}

/// Owns at most one [`KernelClient`] per kernel id.
///
/// Pass it around behind an `Arc`; it holds no global state.
pub struct KernelClientRegistry {
    clients: Mutex<HashMap<String, Arc<KernelClient>>>,
    factory: Arc<dyn ConnectorFactory>,
    config: ClientConfig,
}

impl std::fmt::Debug for KernelClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelClientRegistry")
            .field("kernels", &self.kernel_ids())
            .finish_non_exhaustive()
    }
}

impl KernelClientRegistry {
    pub fn new(factory: Arc<dyn ConnectorFactory>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            clients: Mutex::new(HashMap::new()),
            factory,
            config,
        })
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Arc<KernelClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The client for `kernel_id`, created (but not connected) on first use.
    pub fn get_or_create(&self, kernel_id: &str) -> Result<Arc<KernelClient>> {
        let mut clients = self.clients();
        if let Some(client) = clients.get(kernel_id) {
            return Ok(Arc::clone(client));
        }
        let connector = self.factory.connector(kernel_id)?;
        let client = Arc::new(KernelClient::spawn(
            kernel_id,
            connector,
            self.config.clone(),
        )?);
        clients.insert(kernel_id.to_string(), Arc::clone(&client));
        debug!(kernel_id, clients = clients.len(), "registered kernel client");
        Ok(client)
    }

    pub fn get(&self, kernel_id: &str) -> Option<Arc<KernelClient>> {
        self.clients().get(kernel_id).cloned()
    }

    pub fn contains(&self, kernel_id: &str) -> bool {
        self.clients().contains_key(kernel_id)
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    /// Registered kernel ids, sorted.
    pub fn kernel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Connect an already registered client.
    pub async fn connect(&self, kernel_id: &str) -> Result<()> {
        let client = self
            .get(kernel_id)
            .ok_or_else(|| ClientError::UnknownKernel(kernel_id.to_string()))?;
        client.connect().await
    }

    /// Remove and tear down a client. Returns whether one was registered.
    pub async fn remove(&self, kernel_id: &str) -> bool {
        let removed = self.clients().remove(kernel_id);
        match removed {
            Some(client) => {
                client.shutdown().await;
                info!(kernel_id, "removed kernel client");
                true
            }
            None => false,
        }
    }

    /// Tear down every client.
    pub async fn shutdown_all(&self) {
        let clients: Vec<Arc<KernelClient>> = self.clients().drain().map(|(_, c)| c).collect();
        let count = clients.len();
        for client in clients {
            client.shutdown().await;
        }
        if count > 0 {
            info!(count, "shut down all kernel clients");
        }
    }

    /// React to a kernel lifecycle event.
    pub async fn handle_event(&self, event: KernelEvent) -> Result<()> {
        debug!(?event, "kernel event");
        match event {
            KernelEvent::Started(kernel_id) => {
                let client = self.get_or_create(&kernel_id)?;
                client.connect().await
            }
            KernelEvent::Restarted(kernel_id) => {
                let client = self
                    .get(&kernel_id)
                    .ok_or(ClientError::UnknownKernel(kernel_id))?;
                client.reset_activity();
                Ok(())
            }
            KernelEvent::Shutdown(kernel_id) => {
                self.remove(&kernel_id).await;
                Ok(())
            }
        }
    }
}
