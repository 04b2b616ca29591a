//! Máquina de estados de la sesión de chat.
//!
//! Estados: `Initializing` → `Uploading` → `Chatting`, con `Error` ante
//! cualquier fallo de la inicialización. Las comprobaciones de estado se hacen
//! antes de lanzar trabajo asíncrono; además cada cadena asíncrona captura la
//! generación de la sesión y sólo confirma resultados si sigue siendo la actual
//! (un reset o una descarga del anfitrión incrementan la generación).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    llm::{describe_error, RagBackend},
    models::{
        document_label, ChatMessage, FilePayload, SessionSnapshot, SessionStatus, UploadProgress,
    },
    progress::{progress_at, total_steps},
    protocol::{InboundCommand, OutboundEvent},
    rag::{ProvisionObserver, Provisioned, RagStoreManager, Superseded, TeardownHandle},
    resolver::FileResolver,
};

/// Respuesta fija del modelo cuando una consulta falla.
pub const APOLOGY_MESSAGE: &str =
    "Sorry, I ran into a problem while answering that. Please try again.";
pub const SESSION_ENDED_MESSAGE: &str = "Chat session ended.";

#[derive(Debug, Default)]
struct SessionState {
    status: SessionStatus,
    generation: u64,
    chat_history: Vec<ChatMessage>,
    example_questions: Vec<String>,
    document_name: String,
    last_error: Option<String>,
    progress: Option<UploadProgress>,
}

impl SessionState {
    /// Vuelve a `Initializing` con una generación nueva.
    fn restart(&mut self) {
        let generation = self.generation + 1;
        *self = SessionState {
            generation,
            ..Default::default()
        };
    }
}

struct Inner {
    state: Mutex<SessionState>,
    store: RagStoreManager,
    teardown: TeardownHandle,
    resolver: FileResolver,
    host: Mutex<Option<UnboundedSender<OutboundEvent>>>,
    ready_delay: Duration,
}

/// Sesión única del widget. Clonar comparte la misma sesión.
#[derive(Clone)]
pub struct SessionMachine {
    inner: Arc<Inner>,
}

impl SessionMachine {
    pub fn new(backend: Arc<dyn RagBackend>, resolver: FileResolver, ready_delay: Duration) -> Self {
        let store = RagStoreManager::new(backend);
        let teardown = store.teardown_handle();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState::default()),
                store,
                teardown,
                resolver,
                host: Mutex::new(None),
                ready_delay,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Aplica `update` sólo si `generation` sigue siendo la actual.
    fn update_if_current(&self, generation: u64, update: impl FnOnce(&mut SessionState)) -> bool {
        let mut state = self.lock_state();
        if state.generation != generation {
            return false;
        }
        update(&mut state);
        true
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock_state();
        SessionSnapshot {
            status: state.status,
            active_store_id: self.inner.store.active_store(),
            chat_history: state.chat_history.clone(),
            example_questions: state.example_questions.clone(),
            document_name: state.document_name.clone(),
            last_error: state.last_error.clone(),
            progress: state.progress.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // CANAL CON EL ANFITRIÓN
    // ---------------------------------------------------------------------

    pub fn attach_host(&self, sender: UnboundedSender<OutboundEvent>) {
        let mut host = self.inner.host.lock().unwrap_or_else(PoisonError::into_inner);
        *host = Some(sender);
    }

    pub fn detach_host(&self) {
        self.inner
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub(crate) fn emit(&self, event: OutboundEvent) {
        let host = self.inner.host.lock().unwrap_or_else(PoisonError::into_inner);
        match host.as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    debug!("El anfitrión ya no escucha; evento descartado.");
                }
            }
            None => debug!("Sin anfitrión conectado; evento descartado: {:?}", event),
        }
    }

    /// Rechaza un comando sin cambiar de estado.
    pub(crate) fn reject(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Comando rechazado: {}", message);
        self.emit(OutboundEvent::ChatError { message });
    }

    // ---------------------------------------------------------------------
    // COMANDOS
    // ---------------------------------------------------------------------
    //
    // Cada comando tiene dos fases: `begin` comprueba el estado y aplica los
    // cambios inmediatos sin esperar a nada; `complete` ejecuta la parte
    // asíncrona. El protocolo llama a `begin` en orden de llegada y sólo lanza
    // `complete` en su propia tarea.

    /// Fase síncrona de un comando. `None` si se rechazó (ya se avisó al anfitrión).
    pub fn begin(&self, command: InboundCommand) -> Option<Accepted> {
        match command {
            InboundCommand::InitChat {
                files,
                chat_display_name,
            } => self.begin_start(files, chat_display_name),
            InboundCommand::SendMessage { message } => self.begin_query(message),
            InboundCommand::ResetChat {} => Some(self.begin_reset()),
        }
    }

    /// Fase asíncrona de un comando aceptado por `begin`.
    pub async fn complete(&self, accepted: Accepted) {
        match accepted {
            Accepted::Start {
                generation,
                files,
                display_name,
                previous_store,
            } => {
                self.run_start(generation, files, display_name, previous_store)
                    .await
            }
            Accepted::Query {
                generation,
                text,
                store_id,
            } => self.run_query(generation, text, store_id).await,
            Accepted::Reset { store_id } => self.run_reset(store_id).await,
        }
    }

    /// `Initializing | Error | Chatting → Uploading → Chatting | Error`.
    pub async fn start_session(&self, files: Vec<FilePayload>, display_name: Option<String>) {
        if let Some(accepted) = self.begin_start(files, display_name) {
            self.complete(accepted).await;
        }
    }

    /// `Chatting → Chatting`. El mensaje del usuario se añade antes de consultar.
    pub async fn send_message(&self, message: String) {
        if let Some(accepted) = self.begin_query(message) {
            self.complete(accepted).await;
        }
    }

    /// Cualquier estado → `Initializing`, liberando el store si existe.
    pub async fn reset(&self) {
        let accepted = self.begin_reset();
        self.complete(accepted).await;
    }

    fn begin_start(&self, files: Vec<FilePayload>, display_name: Option<String>) -> Option<Accepted> {
        if files.is_empty() {
            self.reject("No documents were provided to start the chat.");
            return None;
        }

        let accepted = {
            let mut state = self.lock_state();
            if state.status == SessionStatus::Uploading {
                None
            } else {
                state.restart();
                state.status = SessionStatus::Uploading;
                // Si venimos de `Chatting`, el store anterior se libera antes de crear otro.
                Some((state.generation, self.inner.store.take_active()))
            }
        };
        let Some((generation, previous_store)) = accepted else {
            self.reject("A chat session is already being prepared.");
            return None;
        };
        Some(Accepted::Start {
            generation,
            files,
            display_name,
            previous_store,
        })
    }

    fn begin_query(&self, message: String) -> Option<Accepted> {
        let text = message.trim().to_string();
        let accepted = {
            let mut state = self.lock_state();
            if state.status != SessionStatus::Chatting {
                Err("The chat is not ready yet. Wait for the documents to finish loading.")
            } else if text.is_empty() {
                Err("Cannot send an empty message.")
            } else {
                state.chat_history.push(ChatMessage::user(text.clone()));
                Ok((state.generation, self.inner.store.active_store()))
            }
        };
        match accepted {
            Ok((generation, store_id)) => Some(Accepted::Query {
                generation,
                text,
                store_id,
            }),
            Err(reason) => {
                self.reject(reason);
                None
            }
        }
    }

    fn begin_reset(&self) -> Accepted {
        let mut state = self.lock_state();
        state.restart();
        Accepted::Reset {
            store_id: self.inner.store.take_active(),
        }
    }

    async fn run_start(
        &self,
        generation: u64,
        files: Vec<FilePayload>,
        display_name: Option<String>,
        previous_store: Option<String>,
    ) {
        if let Some(store_id) = previous_store {
            info!("Liberando el store anterior {} antes de reiniciar.", store_id);
            self.inner.store.discard(&store_id).await;
        }

        info!("Iniciando sesión con {} fichero(s).", files.len());
        let observer = GenerationObserver {
            machine: self,
            generation,
        };
        let result = self
            .inner
            .store
            .provision(&files, &self.inner.resolver, &observer)
            .await;

        match result {
            Ok(provisioned) => {
                self.finish_start(generation, &files, display_name, provisioned)
                    .await
            }
            Err(err) => self.fail_start(generation, err),
        }
    }

    async fn finish_start(
        &self,
        generation: u64,
        files: &[FilePayload],
        display_name: Option<String>,
        provisioned: Provisioned,
    ) {
        let names: Vec<&str> = files.iter().map(FilePayload::display_name).collect();
        let ready = progress_at(total_steps(files.len()), &names);
        if !self.update_if_current(generation, |s| s.progress = Some(ready)) {
            debug!("Sesión reemplazada antes de estar lista.");
            return;
        }

        // Se muestra "listo" un momento antes de pasar a `Chatting`.
        tokio::time::sleep(self.inner.ready_delay).await;

        let document_name = document_label(display_name.as_deref(), files);
        let committed = self.update_if_current(generation, |s| {
            s.status = SessionStatus::Chatting;
            s.document_name = document_name.clone();
            s.example_questions = provisioned.example_questions;
            s.progress = None;
        });
        if committed {
            info!(
                "Sesión lista sobre '{}' (store {}).",
                document_name, provisioned.store_id
            );
            self.emit(OutboundEvent::ChatReady { document_name });
        } else {
            debug!("Sesión reemplazada antes de estar lista.");
        }
    }

    fn fail_start(&self, generation: u64, err: anyhow::Error) {
        if err.is::<Superseded>() {
            debug!("Inicialización abandonada: {}", err);
            return;
        }
        let message = describe_error(&err);
        let committed = self.update_if_current(generation, |s| {
            s.status = SessionStatus::Error;
            s.last_error = Some(message.clone());
            s.progress = None;
        });
        if committed {
            error!("Error al preparar la sesión: {:#}", err);
            self.emit(OutboundEvent::ChatError { message });
        } else {
            debug!("Fallo de una inicialización ya reemplazada: {:#}", err);
        }
    }

    async fn run_query(&self, generation: u64, text: String, store_id: Option<String>) {
        let result = match store_id {
            Some(store_id) => self.inner.store.query(&store_id, &text).await,
            None => Err(anyhow!("No document index is active for this chat")),
        };

        match result {
            Ok(answer) => {
                let reply = ChatMessage::model(
                    answer.text.clone(),
                    Some(answer.grounding_chunks.clone()),
                );
                if self.update_if_current(generation, |s| s.chat_history.push(reply)) {
                    self.emit(OutboundEvent::ChatResponse {
                        text: answer.text,
                        grounding_chunks: answer.grounding_chunks,
                    });
                } else {
                    debug!("Respuesta descartada: la sesión cambió durante la consulta.");
                }
            }
            Err(err) => {
                let apology = ChatMessage::model(APOLOGY_MESSAGE, None);
                if self.update_if_current(generation, |s| s.chat_history.push(apology)) {
                    error!("Error en la consulta: {:#}", err);
                    self.emit(OutboundEvent::ChatError {
                        message: describe_error(&err),
                    });
                } else {
                    debug!("Error de una consulta ya reemplazada: {:#}", err);
                }
            }
        }
    }

    async fn run_reset(&self, store_id: Option<String>) {
        if let Some(store_id) = store_id {
            self.inner.store.discard(&store_id).await;
        }
        info!("Sesión reiniciada.");
        self.emit(OutboundEvent::ChatEnded {
            message: SESSION_ENDED_MESSAGE.to_string(),
        });
    }

    /// Acción local del widget: `Error → Initializing`, sin tocar ningún store.
    pub fn acknowledge_error(&self) -> bool {
        let mut state = self.lock_state();
        if state.status != SessionStatus::Error {
            return false;
        }
        state.status = SessionStatus::Initializing;
        state.last_error = None;
        true
    }

    /// El frame anfitrión se ha descargado: borrado del store sin esperar y
    /// sesión limpia para el próximo anfitrión.
    pub fn on_host_unload(&self) -> Option<JoinHandle<()>> {
        self.detach_host();
        let mut state = self.lock_state();
        state.restart();
        self.inner.teardown.fire()
    }

    /// Cierre ordenado del servidor: el borrado sí se espera.
    pub async fn shutdown(&self) {
        self.detach_host();
        self.lock_state().restart();
        if let Some(store_id) = self.inner.store.release().await {
            info!("Store {} liberado al apagar.", store_id);
        }
    }
}

/// Comando que ya pasó las comprobaciones de estado.
pub enum Accepted {
    Start {
        generation: u64,
        files: Vec<FilePayload>,
        display_name: Option<String>,
        previous_store: Option<String>,
    },
    Query {
        generation: u64,
        text: String,
        store_id: Option<String>,
    },
    Reset {
        store_id: Option<String>,
    },
}

/// Publica el progreso y registra el store sólo para la generación indicada.
struct GenerationObserver<'a> {
    machine: &'a SessionMachine,
    generation: u64,
}

impl ProvisionObserver for GenerationObserver<'_> {
    fn on_progress(&self, progress: UploadProgress) -> bool {
        self.machine
            .update_if_current(self.generation, |s| s.progress = Some(progress))
    }

    fn on_store_created(&self, store_id: &str) -> bool {
        // El estado sigue bloqueado mientras se registra el store, así un reset
        // no puede colarse entre la comprobación y el registro.
        let state = self.machine.lock_state();
        if state.generation != self.generation {
            return false;
        }
        self.machine.inner.store.adopt(store_id);
        true
    }
}
