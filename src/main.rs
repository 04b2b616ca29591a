// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod llm;
mod models;
mod progress;
mod protocol;
mod rag;
mod resolver;
mod session;
mod ws;

use crate::app_state::AppState;
use axum::Router;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Cliente HTTP compartido (descargas de ficheros + backend RAG)
    let http = reqwest::Client::builder()
        .timeout(cfg.fetch_timeout)
        .build()
        .expect("Error creando el cliente HTTP");

    // 4. Backend RAG y motor de sesión
    let backend = Arc::new(llm::GeminiRagClient::from_config(&cfg, http.clone()));
    if cfg.gemini_api_key.is_none() {
        info!("GEMINI_API_KEY no está definida; las sesiones fallarán hasta configurarla.");
    }
    let session = session::SessionMachine::new(
        backend,
        resolver::FileResolver::new(http),
        cfg.ready_delay,
    );
    let protocol = protocol::ProtocolHandler::new(cfg.host_origin.clone(), session.clone());

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        session,
        protocol,
        host_connected: Arc::new(AtomicBool::new(false)),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new("frontend"))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir la dirección del servidor");
    info!("🚀 Widget escuchando en http://{} (anfitrión: {:?})", server_addr, app_state.config.host_origin);

    // Configurar el apagado ordenado (endpoint /api/shutdown o Ctrl+C).
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::select! {
                _ = shutdown_rx => {},
                _ = tokio::signal::ctrl_c() => {},
            }
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error en el servidor");

    // No dejar stores huérfanos en el backend.
    app_state.session.shutdown().await;
    info!("✅ Servidor cerrado correctamente.");
}
