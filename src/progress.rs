//! Contabilidad de pasos de una inicialización.
//!
//! `total = ficheros + 2`: crear el índice, un paso por fichero y generar
//! sugerencias. El paso `total` es el mensaje final de "listo".

use crate::models::UploadProgress;

pub fn total_steps(file_count: usize) -> usize {
    file_count + 2
}

/// Progreso correspondiente al paso `step` de una subida de `file_names`.
pub fn progress_at(step: usize, file_names: &[&str]) -> UploadProgress {
    let file_count = file_names.len();
    let total = total_steps(file_count);
    let current = step.min(total);

    let (message, file_name) = if current == 0 {
        ("Creating index...".to_string(), None)
    } else if current <= file_count {
        let name = file_names[current - 1];
        (
            format!("Processing file {current} of {file_count}..."),
            Some(name.to_string()),
        )
    } else if current == file_count + 1 {
        ("Generating suggestions...".to_string(), None)
    } else {
        ("All set! Ready to chat.".to_string(), None)
    };

    UploadProgress {
        current,
        total,
        message,
        file_name,
    }
}
