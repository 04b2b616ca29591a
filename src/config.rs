//! Carga y gestión de configuración de la aplicación (servidor + backend RAG).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use url::Url;

/// Origen aceptado para los mensajes del frame anfitrión.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Cualquier origen, siempre que venga informado.
    Any,
    /// Un único origen exacto (esquema + host + puerto).
    Exact(String),
}

impl OriginPolicy {
    pub fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::Any);
        }
        Ok(Self::Exact(normalize_origin(s)?))
    }

    /// Comprueba un origen recibido. `None` nunca es válido.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return false;
        };
        match self {
            Self::Any => !origin.trim().is_empty(),
            Self::Exact(expected) => normalize_origin(origin)
                .map(|o| &o == expected)
                .unwrap_or(false),
        }
    }
}

/// Reduce una URL u origen a su serialización `esquema://host[:puerto]`.
fn normalize_origin(raw: &str) -> Result<String> {
    let url = Url::parse(raw).map_err(|e| anyhow!("Origen inválido '{raw}': {e}"))?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(anyhow!("Origen opaco no soportado: {raw}"));
    }
    Ok(origin.ascii_serialization())
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub host_origin: OriginPolicy,

    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,

    pub ready_delay: Duration,
    pub upload_poll_interval: Duration,
    pub upload_poll_max_attempts: u32,
    pub fetch_timeout: Duration,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let host_origin_str = env::var("HOST_ORIGIN").unwrap_or_else(|_| "*".to_string());
        let host_origin = OriginPolicy::from_str(&host_origin_str)?;

        // La clave es opcional: sin ella el backend falla en `initialize()`.
        let gemini_api_key = env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        let gemini_model =
            env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());
        let gemini_base_url = env::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string());

        let ready_delay = Duration::from_millis(env_number("READY_DELAY_MS", 1000)?);
        let upload_poll_interval =
            Duration::from_millis(env_number("UPLOAD_POLL_INTERVAL_MS", 2000)?);
        let upload_poll_max_attempts = env_number("UPLOAD_POLL_MAX_ATTEMPTS", 60)?;
        let fetch_timeout = Duration::from_secs(env_number("FETCH_TIMEOUT_SECS", 60)?);

        Ok(Self {
            server_addr,
            host_origin,
            gemini_api_key,
            gemini_model,
            gemini_base_url,
            ready_delay,
            upload_poll_interval,
            upload_poll_max_attempts,
            fetch_timeout,
        })
    }
}

fn env_number<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow!("Valor numérico inválido en {key}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
