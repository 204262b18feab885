//! Mux client pool for one default config
//!
//! Dispatch picks the first client with headroom; when every client is
//! full or dead a new one is dialed. Dead clients are pruned on the way.

use tracing::debug;

use super::client::{MuxClient, MuxSession};
use crate::config::VlessConfig;
use crate::error::TunnelError;
use crate::vless::Destination;

/// Owns any number of [`MuxClient`]s for one [`VlessConfig`]
pub struct MuxManager {
    config: VlessConfig,
    clients: Vec<MuxClient>,
}

impl MuxManager {
    #[must_use]
    pub fn new(config: VlessConfig) -> Self {
        Self {
            config,
            clients: Vec::new(),
        }
    }

    /// Live client count
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Open a UDP session, reusing a client with headroom or dialing a
    /// new one.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` when a fresh carrier dial fails.
    pub async fn open_udp(
        &mut self,
        dest: &Destination,
        global_id: Option<[u8; 8]>,
    ) -> Result<MuxSession, TunnelError> {
        self.clients.retain(|c| !c.is_closed());

        for client in &self.clients {
            if !client.is_full() {
                match client.open_udp(dest, global_id) {
                    Ok(session) => return Ok(session),
                    // Lost a race with the cap or a close; try the next
                    Err(_) => continue,
                }
            }
        }

        debug!(
            "Mux manager dialing client #{} for {}",
            self.clients.len() + 1,
            self.config.name
        );
        let client = MuxClient::connect(&self.config).await?;
        let session = client.open_udp(dest, global_id).map_err(TunnelError::from)?;
        self.clients.push(client);
        Ok(session)
    }

    /// Close every client; all their sessions see synthetic closes.
    pub fn close_all(&mut self) {
        for client in self.clients.drain(..) {
            client.close();
        }
    }
}

impl Drop for MuxManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl std::fmt::Debug for MuxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxManager")
            .field("config", &self.config.name)
            .field("clients", &self.clients.len())
            .finish()
    }
}
