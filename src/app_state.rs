use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::{config::AppConfig, protocol::ProtocolHandler, session::SessionMachine};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub session: SessionMachine,
    pub protocol: ProtocolHandler,
    pub host_connected: Arc<AtomicBool>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    /// Reserva el único hueco de anfitrión. `None` si ya hay uno conectado.
    pub fn claim_host_slot(&self) -> Option<HostSlot> {
        if self.host_connected.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(HostSlot {
            flag: self.host_connected.clone(),
        })
    }
}

/// Hueco de anfitrión ocupado; se libera al soltarlo (también si el upgrade falla).
pub struct HostSlot {
    flag: Arc<AtomicBool>,
}

impl Drop for HostSlot {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
