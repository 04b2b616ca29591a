//! Modelos de dominio de la sesión de chat (ficheros, mensajes, estado).

use serde::{Deserialize, Serialize};

/// Nombre usado cuando el anfitrión no informa `fileName`.
pub const FALLBACK_FILE_NAME: &str = "document";

/// Descriptor de un fichero enviado por el anfitrión.
/// Debe traer exactamente una fuente: `url` o `base64Data` + `mimeType`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub base64_data: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl FilePayload {
    /// Nombre efectivo del fichero (con valor por defecto si falta).
    pub fn display_name(&self) -> &str {
        self.file_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(FALLBACK_FILE_NAME)
    }
}

/// Fichero ya resuelto, con sus bytes en memoria, listo para subir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// Fragmento de cita devuelto junto a una respuesta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingChunk {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_chunks: Option<Vec<GroundingChunk>>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![text.into()],
            grounding_chunks: None,
        }
    }

    pub fn model(text: impl Into<String>, grounding_chunks: Option<Vec<GroundingChunk>>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![text.into()],
            grounding_chunks,
        }
    }
}

/// Respuesta de una consulta al store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryAnswer {
    pub text: String,
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    #[default]
    Initializing,
    Uploading,
    Chatting,
    Error,
}

/// Progreso de una inicialización (ver `progress`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub current: usize,
    pub total: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Copia de solo lectura del estado de la sesión, para la UI del widget.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub active_store_id: Option<String>,
    pub chat_history: Vec<ChatMessage>,
    pub example_questions: Vec<String>,
    pub document_name: String,
    pub last_error: Option<String>,
    pub progress: Option<UploadProgress>,
}

/// Etiqueta legible del corpus actual.
///
/// Prioridad: nombre indicado por el anfitrión, nombre del único fichero,
/// `"A & B"` para dos ficheros, `"N documents"` en otro caso.
pub fn document_label(display_name: Option<&str>, files: &[FilePayload]) -> String {
    if let Some(name) = display_name.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match files {
        [single] => single.display_name().to_string(),
        [first, second] => format!("{} & {}", first.display_name(), second.display_name()),
        _ => format!("{} documents", files.len()),
    }
}
