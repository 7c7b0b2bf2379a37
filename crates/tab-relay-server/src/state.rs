//! Relay shared state.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use tab_relay_core::config::RelayConfig;
use tab_relay_core::protocol::VersionDescriptor;
use tab_relay_core::targets::TargetRegistry;

use crate::clients::{ClientSet, Outbound};
use crate::extension::ExtensionLink;

/// State shared by all connections and handlers. All mutation goes through
/// methods here or on the owned components, never raw references.
pub struct RelayState {
    pub config: RelayConfig,
    pub version: VersionDescriptor,
    pub targets: Mutex<TargetRegistry>,
    pub clients: ClientSet,
    pub extension: ExtensionLink,
    auto_attach_announced: AtomicBool,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let timeout = config.extension_timeout();
        Self {
            config,
            version: VersionDescriptor::default(),
            targets: Mutex::new(TargetRegistry::new()),
            clients: ClientSet::new(),
            extension: ExtensionLink::new(timeout),
            auto_attach_announced: AtomicBool::new(false),
        }
    }

    /// Extension endpoint opened. If this supersedes a live connection, all
    /// bookkeeping tied to the old extension instance is discarded: its
    /// targets, its pending requests, and every client whose session ids
    /// were scoped to it.
    pub async fn extension_opened(&self, tx: mpsc::UnboundedSender<Outbound>) -> u64 {
        let (generation, replaced) = self.extension.begin_connection(tx).await;
        if replaced {
            self.targets.lock().await.clear();
            self.clients.disconnect_all("extension connection replaced").await;
        }
        self.auto_attach_announced.store(false, Ordering::SeqCst);
        generation
    }

    /// Extension endpoint closed without a replacement pending. Returns
    /// false when `generation` is stale (the connection was superseded and
    /// the replacement sweep already ran).
    pub async fn extension_closed(&self, generation: u64) -> bool {
        if !self.extension.end_connection(generation).await {
            return false;
        }
        self.targets.lock().await.clear();
        self.clients.disconnect_all("extension disconnected").await;
        true
    }

    /// True exactly once per extension generation, on the first
    /// browser-global auto-attach call.
    pub fn first_auto_attach(&self) -> bool {
        !self.auto_attach_announced.swap(true, Ordering::SeqCst)
    }
}
