//! Abstracción sobre el backend RAG (stores de búsqueda de ficheros + modelo).
//! El motor de sesión sólo conoce el trait `RagBackend`; la implementación
//! incluida habla con la API REST de Gemini File Search.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::models::{GroundingChunk, QueryAnswer, ResolvedFile};

/// Mensaje para el anfitrión cuando falla la credencial.
pub const CREDENTIAL_ERROR_MESSAGE: &str =
    "Your API key is invalid or missing. Check the widget configuration and try again.";

/// Operaciones remotas que necesita el motor. Todas pueden fallar.
#[async_trait]
pub trait RagBackend: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    /// Devuelve el identificador opaco del store creado.
    async fn create_rag_store(&self, display_name: &str) -> Result<String>;
    async fn upload_to_rag_store(&self, store_id: &str, file: &ResolvedFile) -> Result<()>;
    async fn generate_example_questions(&self, store_id: &str) -> Result<Vec<String>>;
    async fn file_search(&self, store_id: &str, message: &str) -> Result<QueryAnswer>;
    async fn delete_rag_store(&self, store_id: &str) -> Result<()>;
}

/// ¿El error (o alguna de sus causas) indica una clave inválida o ausente?
pub fn is_credential_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let msg = cause.to_string().to_lowercase();
        msg.contains("api key") || msg.contains("api_key")
    })
}

/// Texto de diagnóstico que se envía al anfitrión en `chatError`.
pub fn describe_error(err: &anyhow::Error) -> String {
    if is_credential_error(err) {
        CREDENTIAL_ERROR_MESSAGE.to_string()
    } else {
        format!("{err:#}")
    }
}

// ---------------------------------------------------------------------
// GEMINI FILE SEARCH
// ---------------------------------------------------------------------

const QUESTIONS_PROMPT: &str = r#"
Based only on the documents available through file search, propose 4 short,
specific questions a reader could ask about them.
Reply with a single JSON array of strings and nothing else.
"#;

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StoreResource {
    name: String,
}

/// Operación de larga duración devuelta por la subida.
#[derive(Debug, Default, Deserialize)]
struct Operation {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<ApiStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<RawGroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGroundingChunk {
    #[serde(default)]
    retrieved_context: Option<RetrievedContext>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievedContext {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Cliente de la API REST de Gemini File Search.
#[derive(Debug, Clone)]
pub struct GeminiRagClient {
    http: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    poll_interval: Duration,
    poll_max_attempts: u32,
}

impl GeminiRagClient {
    /// Construye el cliente a partir de la configuración.
    pub fn from_config(cfg: &AppConfig, http: Client) -> Self {
        Self {
            http,
            api_key: cfg.gemini_api_key.clone(),
            model: cfg.gemini_model.clone(),
            base_url: cfg.gemini_base_url.trim_end_matches('/').to_string(),
            poll_interval: cfg.upload_poll_interval,
            poll_max_attempts: cfg.upload_poll_max_attempts,
        }
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("API key is missing: set GEMINI_API_KEY"))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1beta/{}", self.base_url, path)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .header("x-goog-api-key", self.api_key()?)
            .send()
            .await
            .with_context(|| format!("{what} request could not be sent"))?;
        let response = check_status(response, what).await?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("{what} returned an unexpected response"))
    }

    async fn generate(&self, store_id: &str, prompt: &str, what: &str) -> Result<GenerateContentResponse> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "tools": [{ "fileSearch": { "fileSearchStoreNames": [store_id] } }],
        });
        let url = self.endpoint(&format!("models/{}:generateContent", self.model));
        self.send_json(self.http.post(url).json(&body), what).await
    }

    async fn wait_for_operation(&self, mut operation: Operation, label: &str) -> Result<()> {
        let mut attempts = 0;
        loop {
            if operation.done {
                if let Some(err) = operation.error {
                    bail!("Indexing of '{label}' failed: {}", err.message);
                }
                return Ok(());
            }
            if attempts >= self.poll_max_attempts {
                bail!("Indexing of '{label}' did not finish after {attempts} checks");
            }
            attempts += 1;
            tokio::time::sleep(self.poll_interval).await;

            let name = operation
                .name
                .clone()
                .ok_or_else(|| anyhow!("Upload of '{label}' returned an operation without name"))?;
            debug!("Consultando operación {} (intento {})", name, attempts);
            operation = self
                .send_json(self.http.get(self.endpoint(&name)), "Operation status")
                .await?;
        }
    }
}

#[async_trait]
impl RagBackend for GeminiRagClient {
    async fn initialize(&self) -> Result<()> {
        self.api_key()?;
        Ok(())
    }

    async fn create_rag_store(&self, display_name: &str) -> Result<String> {
        let request = self
            .http
            .post(self.endpoint("fileSearchStores"))
            .json(&json!({ "displayName": display_name }));
        let store: StoreResource = self.send_json(request, "Create store").await?;
        info!("Store '{}' creado ({}).", display_name, store.name);
        Ok(store.name)
    }

    async fn upload_to_rag_store(&self, store_id: &str, file: &ResolvedFile) -> Result<()> {
        let url = format!(
            "{}/upload/v1beta/{}:uploadToFileSearchStore?uploadType=media",
            self.base_url, store_id
        );
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, file.mime_type.as_str())
            .body(file.bytes.clone());
        let operation: Operation = self.send_json(request, "Upload").await?;
        self.wait_for_operation(operation, &file.name).await?;
        info!("Fichero '{}' indexado en {}.", file.name, store_id);
        Ok(())
    }

    async fn generate_example_questions(&self, store_id: &str) -> Result<Vec<String>> {
        let response = self
            .generate(store_id, QUESTIONS_PROMPT, "Question generation")
            .await?;
        let text = response_text(&response).unwrap_or_default();
        Ok(parse_questions(&text))
    }

    async fn file_search(&self, store_id: &str, message: &str) -> Result<QueryAnswer> {
        let response = self.generate(store_id, message, "Query").await?;
        into_answer(response)
    }

    async fn delete_rag_store(&self, store_id: &str) -> Result<()> {
        let url = format!("{}?force=true", self.endpoint(store_id));
        let response = self
            .http
            .delete(url)
            .header("x-goog-api-key", self.api_key()?)
            .send()
            .await
            .context("Delete store request could not be sent")?;
        check_status(response, "Delete store").await?;
        info!("Store {} eliminado.", store_id);
        Ok(())
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    bail!("{what} failed ({status}): {message}")
}

fn response_text(response: &GenerateContentResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();
    Some(text)
}

fn into_answer(response: GenerateContentResponse) -> Result<QueryAnswer> {
    let text = response_text(&response)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| anyhow!("The model returned an empty answer"))?;

    let grounding_chunks = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.grounding_metadata)
        .map(|meta| {
            meta.grounding_chunks
                .into_iter()
                .filter_map(|chunk| chunk.retrieved_context)
                .filter_map(|ctx| {
                    let title = ctx.title;
                    ctx.text.map(|text| GroundingChunk { text, title })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(QueryAnswer {
        text,
        grounding_chunks,
    })
}

/// Interpreta la lista de preguntas sugeridas devuelta por el modelo.
fn parse_questions(raw: &str) -> Vec<String> {
    // Limpiar la respuesta del LLM para asegurar que solo contenga el JSON
    let json_response = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match serde_json::from_str::<Vec<String>>(json_response) {
        Ok(questions) => questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect(),
        Err(e) => {
            warn!("No se pudieron interpretar las preguntas sugeridas. Error: {}. Respuesta LLM: '{}'", e, raw);
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------
// BACKEND DE PRUEBAS
// ---------------------------------------------------------------------
