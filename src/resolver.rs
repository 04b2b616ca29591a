//! Resolución de los descriptores de fichero del anfitrión a bytes concretos,
//! ya sea descargando una URL o decodificando base64 en línea.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use mime_guess::MimeGuess;
use reqwest::{header::CONTENT_TYPE, Client};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::models::{FilePayload, ResolvedFile};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Ni `url` ni `base64Data` + `mimeType`.
    #[error("File '{0}' has no content: provide either a url or base64Data with a mimeType")]
    MissingSource(String),

    #[error("File '{name}' has an invalid url '{url}': {reason}")]
    InvalidUrl {
        name: String,
        url: String,
        reason: String,
    },

    #[error("Failed to fetch file '{name}': {status}")]
    FetchStatus { name: String, status: String },

    #[error("Failed to fetch file '{name}': {source}")]
    Fetch {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("File '{name}' contains malformed base64 data: {source}")]
    Decode {
        name: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// Convierte `FilePayload` en `ResolvedFile`.
#[derive(Clone, Debug)]
pub struct FileResolver {
    http: Client,
}

impl FileResolver {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub async fn resolve(&self, payload: &FilePayload) -> Result<ResolvedFile, ResolveError> {
        let name = payload.display_name().to_string();

        if let Some(url) = payload.url.as_deref().filter(|u| !u.trim().is_empty()) {
            if payload.base64_data.is_some() {
                warn!("El fichero '{}' trae url y base64Data; se usa la url.", name);
            }
            return self.fetch(name, url, payload.mime_type.as_deref()).await;
        }

        match (payload.base64_data.as_deref(), payload.mime_type.as_deref()) {
            (Some(data), Some(mime)) if !mime.trim().is_empty() => {
                decode_inline(name, data, mime)
            }
            _ => Err(ResolveError::MissingSource(name)),
        }
    }

    async fn fetch(
        &self,
        name: String,
        raw_url: &str,
        declared_mime: Option<&str>,
    ) -> Result<ResolvedFile, ResolveError> {
        let url = Url::parse(raw_url.trim()).map_err(|e| ResolveError::InvalidUrl {
            name: name.clone(),
            url: raw_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ResolveError::InvalidUrl {
                name,
                url: raw_url.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        debug!("Descargando '{}' desde {}", name, url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ResolveError::Fetch {
                name: name.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let status = match status.canonical_reason() {
                Some(reason) => format!("{} {}", status.as_u16(), reason),
                None => status.as_u16().to_string(),
            };
            return Err(ResolveError::FetchStatus { name, status });
        }

        let served_mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|source| ResolveError::Fetch {
                name: name.clone(),
                source,
            })?;

        let mime_type = declared_mime
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string)
            .or(served_mime)
            .unwrap_or_else(|| guess_mime(&name));

        Ok(ResolvedFile {
            name,
            mime_type,
            bytes: bytes.to_vec(),
        })
    }
}

fn decode_inline(name: String, data: &str, mime: &str) -> Result<ResolvedFile, ResolveError> {
    // Se aceptan también data URLs completas ("data:...;base64,XXXX").
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|source| ResolveError::Decode {
            name: name.clone(),
            source,
        })?;

    Ok(ResolvedFile {
        name,
        mime_type: mime.to_string(),
        bytes,
    })
}

fn guess_mime(name: &str) -> String {
    MimeGuess::from_path(name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    fn resolver() -> FileResolver {
        FileResolver::new(Client::new())
    }

    /// Servidor local: una ruta sirve texto y otra responde 404.
    async fn spawn_file_server() -> String {
        let app = Router::new()
            .route(
                "/notes.txt",
                get(|| async { ([("content-type", "text/plain")], "apuntes de prueba") }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn inline_round_trip_preserves_bytes_and_type() {
        let original: Vec<u8> = (0..=255u8).collect();
        let payload = FilePayload {
            file_name: Some("blob.bin".into()),
            base64_data: Some(BASE64.encode(&original)),
            mime_type: Some("application/x-custom".into()),
            ..Default::default()
        };
        let file = resolver().resolve(&payload).await.unwrap();
        assert_eq!(file.bytes, original);
        assert_eq!(file.mime_type, "application/x-custom");
        assert_eq!(file.name, "blob.bin");
    }

    #[tokio::test]
    async fn accepts_data_url_prefix() {
        let payload = FilePayload {
            file_name: Some("hola.txt".into()),
            base64_data: Some("data:text/plain;base64,aG9sYQ==".into()),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        };
        let file = resolver().resolve(&payload).await.unwrap();
        assert_eq!(file.bytes, b"hola");
    }

    #[tokio::test]
    async fn neither_source_is_a_validation_error() {
        let payload = FilePayload {
            file_name: Some("vacio.pdf".into()),
            ..Default::default()
        };
        let err = resolver().resolve(&payload).await.unwrap_err();
        assert!(matches!(err, ResolveError::MissingSource(ref n) if n == "vacio.pdf"));

        // base64 sin mimeType tampoco es una fuente válida.
        let payload = FilePayload {
            base64_data: Some("aGVsbG8=".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolver().resolve(&payload).await,
            Err(ResolveError::MissingSource(_))
        ));
    }

    #[tokio::test]
    async fn malformed_base64_is_reported() {
        let payload = FilePayload {
            file_name: Some("roto.txt".into()),
            base64_data: Some("%%%no-es-base64%%%".into()),
            mime_type: Some("text/plain".into()),
            ..Default::default()
        };
        let err = resolver().resolve(&payload).await.unwrap_err();
        assert!(matches!(err, ResolveError::Decode { .. }));
        assert!(err.to_string().contains("roto.txt"));
    }

    #[tokio::test]
    async fn fetches_url_with_served_content_type() {
        let base = spawn_file_server().await;
        let payload = FilePayload {
            file_name: Some("notes.txt".into()),
            url: Some(format!("{base}/notes.txt")),
            ..Default::default()
        };
        let file = resolver().resolve(&payload).await.unwrap();
        assert_eq!(file.bytes, "apuntes de prueba".as_bytes());
        assert!(file.mime_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn declared_mime_type_wins_over_served_one() {
        let base = spawn_file_server().await;
        let payload = FilePayload {
            file_name: Some("notes.md".into()),
            url: Some(format!("{base}/notes.txt")),
            mime_type: Some("text/markdown".into()),
            ..Default::default()
        };
        let file = resolver().resolve(&payload).await.unwrap();
        assert_eq!(file.mime_type, "text/markdown");
    }

    #[tokio::test]
    async fn non_success_status_includes_status_text() {
        let base = spawn_file_server().await;
        let payload = FilePayload {
            file_name: Some("perdido.pdf".into()),
            url: Some(format!("{base}/missing")),
            ..Default::default()
        };
        let err = resolver().resolve(&payload).await.unwrap_err();
        assert!(matches!(err, ResolveError::FetchStatus { .. }));
        assert!(err.to_string().contains("404 Not Found"));
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let payload = FilePayload {
            url: Some("file:///etc/passwd".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolver().resolve(&payload).await,
            Err(ResolveError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn guesses_mime_from_extension() {
        assert_eq!(guess_mime("informe.pdf"), "application/pdf");
        assert_eq!(guess_mime("sin_extension"), DEFAULT_MIME_TYPE);
    }
}
