//! Protocolo host ↔ widget: comandos entrantes, eventos salientes y la
//! validación (origen, forma, tipo) previa al despacho a la sesión.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    config::OriginPolicy,
    models::{FilePayload, GroundingChunk},
    session::SessionMachine,
};

/// Comandos del anfitrión, etiquetados por `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundCommand {
    InitChat {
        files: Vec<FilePayload>,
        #[serde(default, rename = "chatDisplayName")]
        chat_display_name: Option<String>,
    },
    SendMessage {
        message: String,
    },
    ResetChat {},
}

impl InboundCommand {
    pub const KNOWN_TYPES: [&'static str; 3] = ["initChat", "sendMessage", "resetChat"];
}

/// Eventos hacia el anfitrión, etiquetados por `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundEvent {
    ChatReady {
        #[serde(rename = "documentName")]
        document_name: String,
    },
    ChatResponse {
        text: String,
        #[serde(rename = "groundingChunks")]
        grounding_chunks: Vec<GroundingChunk>,
    },
    ChatError {
        message: String,
    },
    ChatEnded {
        message: String,
    },
}

#[derive(Clone)]
pub struct ProtocolHandler {
    origin: OriginPolicy,
    machine: SessionMachine,
}

impl ProtocolHandler {
    pub fn new(origin: OriginPolicy, machine: SessionMachine) -> Self {
        Self { origin, machine }
    }

    /// Valida un mensaje crudo del anfitrión.
    ///
    /// Origen inválido, JSON ilegible o `type` desconocido: se registra y se
    /// descarta sin evento. Un `type` conocido con carga inválida se responde
    /// con `chatError`.
    pub fn accept(&self, origin: Option<&str>, raw: &str) -> Option<InboundCommand> {
        if !self.origin.allows(origin) {
            warn!("Mensaje descartado: origen no permitido ({:?}).", origin);
            return None;
        }

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Mensaje descartado: JSON inválido ({}).", e);
                return None;
            }
        };
        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
            warn!("Mensaje descartado: falta el campo 'type'.");
            return None;
        };
        if !InboundCommand::KNOWN_TYPES.contains(&kind.as_str()) {
            warn!("Mensaje descartado: tipo desconocido '{}'.", kind);
            return None;
        }

        match serde_json::from_value::<InboundCommand>(value) {
            Ok(command) => {
                debug!("Comando '{}' aceptado.", kind);
                Some(command)
            }
            Err(e) => {
                self.machine
                    .reject(format!("Invalid '{kind}' command: {e}"));
                None
            }
        }
    }

    /// Valida el comando y aplica su fase síncrona aquí mismo, en orden de
    /// llegada. Sólo la parte asíncrona va a su propia tarea; no se espera.
    pub fn dispatch(&self, origin: Option<&str>, raw: &str) -> Option<JoinHandle<()>> {
        let command = self.accept(origin, raw)?;
        let accepted = self.machine.begin(command)?;
        let machine = self.machine.clone();
        Some(tokio::spawn(async move { machine.complete(accepted).await }))
    }
}
