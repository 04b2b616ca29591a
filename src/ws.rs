//! Canal WebSocket con el frame anfitrión.
//!
//! Cada frame de texto es un comando del protocolo; los eventos de la sesión
//! se envían como JSON. Cerrar el socket equivale a descargar el anfitrión.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::{AppState, HostSlot},
    protocol::OutboundEvent,
};

pub async fn run_host_channel(
    socket: WebSocket,
    origin: Option<String>,
    state: AppState,
    _slot: HostSlot,
) {
    let connection = Uuid::new_v4();
    info!("Anfitrión conectado [{}] (origen: {:?}).", connection, origin);
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();
    state.session.attach_host(tx);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("No se pudo serializar el evento {:?}: {}", event, e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.protocol.dispatch(origin.as_deref(), &text);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Error en el canal con el anfitrión [{}]: {}", connection, e);
                break;
            }
        }
    }

    info!("Anfitrión desconectado [{}]; liberando la sesión.", connection);
    state.session.on_host_unload();
    writer.abort();
}
