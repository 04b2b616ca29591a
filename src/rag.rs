//! Ciclo de vida del store RAG de la sesión.
//!
//! Flujo de aprovisionamiento:
//!   1. `initialize()` del backend y creación del store (nombre derivado de la hora).
//!   2. Resolución y subida secuencial de cada fichero.
//!   3. Generación de preguntas sugeridas.
//!
//! El identificador activo vive en un único slot compartido con el
//! `TeardownHandle`; quien lo saca del slot es quien borra el store, así que
//! cada store creado se borra como mucho una vez.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    llm::RagBackend,
    models::{FilePayload, QueryAnswer, UploadProgress},
    progress::progress_at,
    resolver::FileResolver,
};

/// La sesión que pidió el aprovisionamiento ya no es la actual.
#[derive(Debug, Error)]
#[error("the chat session was replaced before initialization finished")]
pub struct Superseded;

/// Recibe el avance del aprovisionamiento y decide si sigue siendo relevante.
pub trait ProvisionObserver: Send + Sync {
    /// Se llama antes de cada paso. `false` aborta el aprovisionamiento.
    fn on_progress(&self, progress: UploadProgress) -> bool;
    /// Registra el store recién creado. `false` si la sesión ya no lo quiere.
    fn on_store_created(&self, store_id: &str) -> bool;
}

/// Resultado de un aprovisionamiento completo.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub store_id: String,
    pub example_questions: Vec<String>,
}

type StoreSlot = Arc<Mutex<Option<String>>>;

fn lock(slot: &StoreSlot) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RagStoreManager {
    backend: Arc<dyn RagBackend>,
    active: StoreSlot,
}

impl RagStoreManager {
    pub fn new(backend: Arc<dyn RagBackend>) -> Self {
        Self {
            backend,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Nombre único para un store nuevo.
    pub fn new_store_name() -> String {
        format!("chat-session-{}", Utc::now().timestamp_millis())
    }

    pub fn active_store(&self) -> Option<String> {
        lock(&self.active).clone()
    }

    /// Registra `store_id` como store activo.
    pub fn adopt(&self, store_id: &str) {
        let mut slot = lock(&self.active);
        if let Some(previous) = slot.replace(store_id.to_string()) {
            // No debería ocurrir: la sesión libera el anterior antes de crear otro.
            warn!("Se reemplaza el store activo {} sin liberarlo.", previous);
        }
    }

    pub fn teardown_handle(&self) -> TeardownHandle {
        TeardownHandle {
            backend: self.backend.clone(),
            active: self.active.clone(),
        }
    }

    /// Crea el store, sube los ficheros en orden y genera las sugerencias.
    ///
    /// Si algo falla después de crear el store, se intenta borrarlo antes de
    /// devolver el error (sólo si la sesión todavía lo posee).
    pub async fn provision(
        &self,
        files: &[FilePayload],
        resolver: &FileResolver,
        observer: &dyn ProvisionObserver,
    ) -> Result<Provisioned> {
        let mut created: Option<String> = None;
        let result = self.run_provision(files, resolver, observer, &mut created).await;

        if let (Err(err), Some(store_id)) = (&result, created) {
            warn!("Fallo al inicializar ({:#}); limpiando store {}.", err, store_id);
            self.release_if_owned(&store_id).await;
        }
        result
    }

    async fn run_provision(
        &self,
        files: &[FilePayload],
        resolver: &FileResolver,
        observer: &dyn ProvisionObserver,
        created: &mut Option<String>,
    ) -> Result<Provisioned> {
        let names: Vec<&str> = files.iter().map(FilePayload::display_name).collect();

        if !observer.on_progress(progress_at(0, &names)) {
            return Err(Superseded.into());
        }
        self.backend.initialize().await?;
        let store_name = Self::new_store_name();
        let store_id = self.backend.create_rag_store(&store_name).await?;

        if !observer.on_store_created(&store_id) {
            // Nadie más conoce este store: se borra aquí mismo.
            self.discard(&store_id).await;
            return Err(Superseded.into());
        }
        *created = Some(store_id.clone());

        for (index, file) in files.iter().enumerate() {
            if !observer.on_progress(progress_at(index + 1, &names)) {
                return Err(Superseded.into());
            }
            let resolved = resolver.resolve(file).await?;
            self.backend
                .upload_to_rag_store(&store_id, &resolved)
                .await
                .with_context(|| format!("Failed to upload '{}'", resolved.name))?;
        }

        if !observer.on_progress(progress_at(files.len() + 1, &names)) {
            return Err(Superseded.into());
        }
        let example_questions = self
            .backend
            .generate_example_questions(&store_id)
            .await
            .context("Failed to generate example questions")?;

        Ok(Provisioned {
            store_id,
            example_questions,
        })
    }

    pub async fn query(&self, store_id: &str, message: &str) -> Result<QueryAnswer> {
        self.backend.file_search(store_id, message).await
    }

    /// Saca el store activo del slot sin borrarlo (el llamante lo borra).
    pub fn take_active(&self) -> Option<String> {
        lock(&self.active).take()
    }

    /// Libera el store activo, si lo hay. Los fallos sólo se registran.
    pub async fn release(&self) -> Option<String> {
        let store_id = self.take_active()?;
        self.discard(&store_id).await;
        Some(store_id)
    }

    /// Libera `store_id` sólo si sigue siendo el store activo.
    pub async fn release_if_owned(&self, store_id: &str) -> bool {
        let owned = {
            let mut slot = lock(&self.active);
            if slot.as_deref() == Some(store_id) {
                slot.take()
            } else {
                None
            }
        };
        match owned {
            Some(id) => {
                self.discard(&id).await;
                true
            }
            None => {
                info!("El store {} ya fue liberado por otra vía.", store_id);
                false
            }
        }
    }

    /// Borra un store que ya no está en el slot.
    pub async fn discard(&self, store_id: &str) {
        delete_logged(self.backend.as_ref(), store_id).await;
    }
}

/// Acceso al store activo para la limpieza al descargar el frame anfitrión.
#[derive(Clone)]
pub struct TeardownHandle {
    backend: Arc<dyn RagBackend>,
    active: StoreSlot,
}

impl TeardownHandle {
    /// Lanza el borrado del store activo sin esperar a que termine.
    pub fn fire(&self) -> Option<JoinHandle<()>> {
        let store_id = lock(&self.active).take()?;
        let backend = self.backend.clone();
        info!("Descarga del anfitrión: borrando store {} en segundo plano.", store_id);
        Some(tokio::spawn(async move {
            delete_logged(backend.as_ref(), &store_id).await;
        }))
    }
}

async fn delete_logged(backend: &dyn RagBackend, store_id: &str) {
    if let Err(err) = backend.delete_rag_store(store_id).await {
        error!("No se pudo borrar el store {}: {:#}", store_id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{BackendCall, ScriptedBackend};
    use reqwest::Client;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Recorder {
        steps: Mutex<Vec<UploadProgress>>,
        accept_store: bool,
        manager_slot: Option<StoreSlot>,
        stop_after_create: AtomicBool,
    }

    impl Recorder {
        fn accepting(slot: StoreSlot) -> Self {
            Self {
                steps: Mutex::new(Vec::new()),
                accept_store: true,
                manager_slot: Some(slot),
                stop_after_create: AtomicBool::new(false),
            }
        }
    }

    impl ProvisionObserver for Recorder {
        fn on_progress(&self, progress: UploadProgress) -> bool {
            self.steps.lock().unwrap().push(progress);
            !self.stop_after_create.load(Ordering::SeqCst)
        }

        fn on_store_created(&self, store_id: &str) -> bool {
            if !self.accept_store {
                return false;
            }
            if let Some(slot) = &self.manager_slot {
                *slot.lock().unwrap() = Some(store_id.to_string());
            }
            true
        }
    }

    fn inline(name: &str) -> FilePayload {
        FilePayload {
            file_name: Some(name.into()),
            base64_data: Some("aG9sYQ==".into()),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        }
    }

    fn setup(backend: ScriptedBackend) -> (Arc<ScriptedBackend>, RagStoreManager, FileResolver) {
        let backend = Arc::new(backend);
        let manager = RagStoreManager::new(backend.clone());
        (backend, manager, FileResolver::new(Client::new()))
    }

    #[test]
    fn store_names_are_timestamp_derived() {
        let name = RagStoreManager::new_store_name();
        let millis: i64 = name.trim_start_matches("chat-session-").parse().unwrap();
        assert!(millis > 0);
    }

    #[tokio::test]
    async fn provisions_in_order_and_reports_every_step() {
        let (backend, manager, resolver) = setup(ScriptedBackend::new());
        let observer = Recorder::accepting(manager.active.clone());

        let done = manager
            .provision(&[inline("a.txt"), inline("b.txt")], &resolver, &observer)
            .await
            .unwrap();

        assert_eq!(done.store_id, "fileSearchStores/test-1");
        assert_eq!(manager.active_store().as_deref(), Some("fileSearchStores/test-1"));
        let calls = backend.calls();
        assert_eq!(calls[0], BackendCall::Initialize);
        assert!(matches!(calls[1], BackendCall::Create(ref n) if n.starts_with("chat-session-")));
        assert_eq!(
            calls[2..],
            [
                BackendCall::Upload { store: done.store_id.clone(), file: "a.txt".into() },
                BackendCall::Upload { store: done.store_id.clone(), file: "b.txt".into() },
                BackendCall::Questions(done.store_id.clone()),
            ]
        );
        let steps: Vec<usize> = observer.steps.lock().unwrap().iter().map(|p| p.current).collect();
        assert_eq!(steps, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failure_after_create_deletes_the_store_once() {
        let (backend, manager, resolver) = setup(ScriptedBackend {
            fail_upload_of: Some("b.txt".into()),
            ..ScriptedBackend::new()
        });
        let observer = Recorder::accepting(manager.active.clone());

        let err = manager
            .provision(&[inline("a.txt"), inline("b.txt")], &resolver, &observer)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("b.txt"));
        assert_eq!(backend.deletes(), vec!["fileSearchStores/test-1".to_string()]);
        assert!(manager.active_store().is_none());
        // Una liberación posterior no vuelve a borrar.
        assert!(manager.release().await.is_none());
        assert_eq!(backend.deletes().len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_file_fails_before_its_upload() {
        let (backend, manager, resolver) = setup(ScriptedBackend::new());
        let observer = Recorder::accepting(manager.active.clone());
        let broken = FilePayload {
            file_name: Some("nada.pdf".into()),
            ..Default::default()
        };

        assert!(manager.provision(&[broken], &resolver, &observer).await.is_err());
        assert_eq!(backend.uploads(), 0);
        assert_eq!(backend.deletes().len(), 1);
    }

    #[tokio::test]
    async fn create_failure_needs_no_cleanup() {
        let (backend, manager, resolver) = setup(ScriptedBackend {
            fail_create: Some("quota exceeded".into()),
            ..ScriptedBackend::new()
        });
        let observer = Recorder::accepting(manager.active.clone());

        assert!(manager.provision(&[inline("a.txt")], &resolver, &observer).await.is_err());
        assert!(backend.deletes().is_empty());
    }

    #[tokio::test]
    async fn rejected_store_is_discarded_immediately() {
        let (backend, manager, resolver) = setup(ScriptedBackend::new());
        let observer = Recorder {
            accept_store: false,
            ..Recorder::accepting(manager.active.clone())
        };

        let err = manager
            .provision(&[inline("a.txt")], &resolver, &observer)
            .await
            .unwrap_err();
        assert!(err.is::<Superseded>());
        assert_eq!(backend.deletes(), vec!["fileSearchStores/test-1".to_string()]);
        assert_eq!(backend.uploads(), 0);
    }

    #[tokio::test]
    async fn release_if_owned_skips_foreign_ids() {
        let (backend, manager, _) = setup(ScriptedBackend::new());
        manager.adopt("fileSearchStores/current");

        assert!(!manager.release_if_owned("fileSearchStores/old").await);
        assert!(backend.deletes().is_empty());
        assert!(manager.release_if_owned("fileSearchStores/current").await);
        assert_eq!(backend.deletes(), vec!["fileSearchStores/current".to_string()]);
    }

    #[tokio::test]
    async fn teardown_deletes_in_background_and_swallows_errors() {
        let (backend, manager, _) = setup(ScriptedBackend {
            fail_delete: Some("network down".into()),
            ..ScriptedBackend::new()
        });
        manager.adopt("fileSearchStores/live");
        let handle = manager.teardown_handle();

        let task = handle.fire().expect("había un store activo");
        task.await.unwrap();
        assert_eq!(backend.deletes(), vec!["fileSearchStores/live".to_string()]);
        assert!(manager.active_store().is_none());
        // Sin store activo no hay nada que lanzar.
        assert!(handle.fire().is_none());
    }
}
