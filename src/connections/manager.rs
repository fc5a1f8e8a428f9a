//! Lifecycle of the tool connections shared by every phase of a build.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::types::{ConnectionState, Health, ProviderConfig, ToolConnection, ToolProvider};
use crate::errors::ConnectionError;
use crate::hooks::{HookContext, HookManager};
use crate::recovery::Backoff;

/// Tunables for connection recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Reconnect attempts before a provider is marked permanently degraded
    pub max_reconnect_attempts: u32,
    pub backoff: Backoff,
    pub health_check_on_open: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            backoff: Backoff::default(),
            health_check_on_open: true,
        }
    }
}

/// Owns one `ToolConnection` per provider name.
pub struct ConnectionManager {
    provider: Arc<dyn ToolProvider>,
    configs: BTreeMap<String, ProviderConfig>,
    connections: Mutex<BTreeMap<String, Arc<ToolConnection>>>,
    hooks: Arc<HookManager>,
    settings: ConnectionSettings,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("providers", &self.configs.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        provider: Arc<dyn ToolProvider>,
        configs: Vec<ProviderConfig>,
        hooks: Arc<HookManager>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            provider,
            configs: configs.into_iter().map(|c| (c.name.clone(), c)).collect(),
            connections: Mutex::new(BTreeMap::new()),
            hooks,
            settings,
        }
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<ToolConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `provider` is known to this manager.
    pub fn is_configured(&self, provider: &str) -> bool {
        self.configs.contains_key(provider) || self.connections().contains_key(provider)
    }

    /// The current connection for `provider`, if one was opened.
    pub fn get(&self, provider: &str) -> Option<Arc<ToolConnection>> {
        self.connections().get(provider).cloned()
    }

    /// Open a connection to `provider_name`. Idempotent per provider: a
    /// ready connection is returned as-is. A degraded one is reported as not
    /// ready; only `reconnect` brings it back.
    pub async fn open(
        &self,
        provider_name: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<ToolConnection>, ConnectionError> {
        let conn = self
            .connections()
            .entry(provider_name.to_string())
            .or_insert_with(|| Arc::new(ToolConnection::new(config.clone())))
            .clone();

        let mut handle = conn.handle.lock().await;
        match conn.state() {
            ConnectionState::Ready => return Ok(conn.clone()),
            ConnectionState::Disconnected => {}
            state @ (ConnectionState::Connecting | ConnectionState::Degraded) => {
                return Err(ConnectionError::NotReady {
                    provider: provider_name.to_string(),
                    state: state.to_string(),
                });
            }
        }

        conn.transition(ConnectionState::Connecting);
        match self.provider.connect(conn.config()).await {
            Ok(mut new_handle) => {
                if self.settings.health_check_on_open {
                    let health = new_handle.health_check().await;
                    conn.mark_health_checked();
                    if let Health::Degraded(reason) = health {
                        warn!(provider = provider_name, %reason, "provider unhealthy on open");
                        *handle = Some(new_handle);
                        conn.transition(ConnectionState::Degraded);
                        return Err(ConnectionError::NotReady {
                            provider: provider_name.to_string(),
                            state: ConnectionState::Degraded.to_string(),
                        });
                    }
                }
                *handle = Some(new_handle);
                conn.transition(ConnectionState::Ready);
                info!(provider = provider_name, "tool provider connected");
                Ok(conn.clone())
            }
            Err(source) => {
                conn.transition(ConnectionState::Degraded);
                Err(ConnectionError::Provider {
                    provider: provider_name.to_string(),
                    source,
                })
            }
        }
    }

    /// Open every configured provider. Failures are logged and leave the
    /// connection degraded; they surface when an invocation needs it.
    pub async fn open_all(&self) {
        use futures::future::join_all;

        let opens = self
            .configs
            .iter()
            .map(|(name, config)| async move { (name, self.open(name, config).await) });
        for (name, result) in join_all(opens).await {
            if let Err(e) = result {
                warn!(provider = %name, error = %e, "failed to open tool provider");
            }
        }
    }

    /// Invoke `capability` on a ready connection.
    pub async fn invoke(
        &self,
        conn: &ToolConnection,
        capability: &str,
        args: Value,
    ) -> Result<Value, ConnectionError> {
        let provider = conn.provider().to_string();
        let not_ready = || ConnectionError::NotReady {
            provider: provider.clone(),
            state: conn.state().to_string(),
        };
        if !conn.is_ready() {
            return Err(not_ready());
        }

        self.hooks
            .notify(&HookContext::pre_tool_use(&provider, capability))
            .await;

        let result = {
            let mut handle = conn.handle.lock().await;
            // Re-check under the handle lock: another caller may have degraded it.
            match handle.as_mut() {
                Some(h) if conn.is_ready() => h.invoke(capability, args).await.map_err(|source| {
                    conn.transition(ConnectionState::Degraded);
                    ConnectionError::Provider {
                        provider: provider.clone(),
                        source,
                    }
                }),
                _ => Err(not_ready()),
            }
        };

        let error = result.as_ref().err().map(|e| e.to_string());
        self.hooks
            .notify(&HookContext::post_tool_use(&provider, capability, error))
            .await;
        result
    }

    /// Invoke `capability` on the connection for `provider`.
    pub async fn invoke_by_name(
        &self,
        provider: &str,
        capability: &str,
        args: Value,
    ) -> Result<Value, ConnectionError> {
        let conn = self
            .get(provider)
            .ok_or_else(|| ConnectionError::UnknownProvider(provider.to_string()))?;
        self.invoke(&conn, capability, args).await
    }

    /// Health-check a connection. A failed check degrades it; a passing check never
    /// restores a degraded connection (only `reconnect` does).
    pub async fn health_check(&self, conn: &ToolConnection) -> ConnectionState {
        let mut handle = conn.handle.lock().await;
        let Some(h) = handle.as_mut() else {
            return conn.state();
        };
        let health = h.health_check().await;
        conn.mark_health_checked();
        if let Health::Degraded(reason) = health {
            warn!(provider = conn.provider(), %reason, "health check failed");
            conn.transition(ConnectionState::Degraded);
        }
        conn.state()
    }

    /// Re-establish a degraded connection with bounded exponential backoff.
    /// Exhausting the attempts marks the provider permanently degraded for
    /// the rest of the build.
    pub async fn reconnect(&self, conn: &ToolConnection) -> Result<(), ConnectionError> {
        let provider = conn.provider().to_string();
        let exhausted = || ConnectionError::PermanentlyDegraded {
            provider: provider.clone(),
            attempts: self.settings.max_reconnect_attempts,
        };
        if conn.is_permanently_degraded() {
            return Err(exhausted());
        }

        let mut handle = conn.handle.lock().await;
        // Another caller may have finished a reconnect cycle while we waited.
        if conn.is_ready() {
            return Ok(());
        }
        if conn.is_permanently_degraded() {
            return Err(exhausted());
        }

        for attempt in 1..=self.settings.max_reconnect_attempts {
            if let Some(mut old) = handle.take() {
                if let Err(e) = old.disconnect().await {
                    debug!(provider = %provider, error = %e, "disconnect before reconnect failed");
                }
            }
            conn.transition(ConnectionState::Connecting);
            let reason = match self.provider.connect(conn.config()).await {
                Ok(mut new_handle) => {
                    let health = new_handle.health_check().await;
                    conn.mark_health_checked();
                    *handle = Some(new_handle);
                    match health {
                        Health::Ok => {
                            conn.transition(ConnectionState::Ready);
                            info!(provider = %provider, attempt, "tool provider reconnected");
                            return Ok(());
                        }
                        Health::Degraded(reason) => format!("health check failed: {reason}"),
                    }
                }
                Err(e) => e.to_string(),
            };
            conn.transition(ConnectionState::Degraded);
            warn!(provider = %provider, attempt, error = %reason, "reconnect failed");
            if attempt < self.settings.max_reconnect_attempts {
                tokio::time::sleep(self.settings.backoff.delay(attempt)).await;
            }
        }

        conn.mark_permanently_degraded();
        warn!(provider = %provider, "tool provider permanently degraded");
        Err(exhausted())
    }

    /// Make sure `provider` is ready before an invocation that needs it:
    /// open it if it was never opened, reconnect it if degraded.
    pub async fn ensure_ready(&self, provider: &str) -> Result<Arc<ToolConnection>, ConnectionError> {
        let conn = match self.get(provider) {
            Some(conn) => conn,
            None => {
                let config = self
                    .configs
                    .get(provider)
                    .ok_or_else(|| ConnectionError::UnknownProvider(provider.to_string()))?;
                match self.open(provider, config).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        debug!(provider, error = %e, "open failed, trying reconnect");
                        self.get(provider)
                            .ok_or_else(|| ConnectionError::UnknownProvider(provider.to_string()))?
                    }
                }
            }
        };

        match conn.state() {
            ConnectionState::Ready => Ok(conn),
            ConnectionState::Disconnected => {
                let config = conn.config().clone();
                self.open(provider, &config).await
            }
            ConnectionState::Connecting | ConnectionState::Degraded => {
                self.reconnect(&conn).await?;
                Ok(conn)
            }
        }
    }

    /// Close every connection. Best effort: individual failures are logged
    /// and returned, never raised.
    pub async fn close_all(&self) -> Vec<String> {
        let connections: Vec<Arc<ToolConnection>> =
            std::mem::take(&mut *self.connections()).into_values().collect();

        let mut errors = Vec::new();
        for conn in connections {
            let mut handle = conn.handle.lock().await;
            if let Some(mut h) = handle.take() {
                if let Err(e) = h.disconnect().await {
                    warn!(provider = conn.provider(), error = %e, "failed to close tool provider");
                    errors.push(format!("{}: {e}", conn.provider()));
                }
            }
            conn.transition(ConnectionState::Disconnected);
        }
        errors
    }
}
