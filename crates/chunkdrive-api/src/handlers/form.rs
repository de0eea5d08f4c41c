//! Multipart forms carrying one binary field next to text fields.
//!
//! The binary field is buffered; the router's body limit bounds its size.

use axum::extract::multipart::MultipartError;
use axum::extract::Multipart;
use axum::http::StatusCode;
use bytes::Bytes;
use chunkdrive_core::AppError;
use chunkdrive_storage::ByteReader;
use std::collections::HashMap;

pub(crate) struct UploadForm {
    fields: HashMap<String, String>,
    body: Option<Bytes>,
    file_field: &'static str,
}

impl UploadForm {
    /// Read the whole form. Exactly one field named `file_field` carries the bytes.
    pub(crate) async fn read(
        mut multipart: Multipart,
        file_field: &'static str,
    ) -> Result<Self, AppError> {
        let mut form = UploadForm {
            fields: HashMap::new(),
            body: None,
            file_field,
        };

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().map(|s| s.to_string()).unwrap_or_default();
            if name == file_field {
                if form.body.is_some() {
                    return Err(AppError::InvalidInput(format!(
                        "Multiple '{}' fields are not allowed",
                        file_field
                    )));
                }
                form.body = Some(field.bytes().await.map_err(multipart_error)?);
            } else {
                let value = field.text().await.map_err(multipart_error)?;
                form.fields.insert(name, value);
            }
        }

        Ok(form)
    }

    pub(crate) fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn require(&self, name: &str) -> Result<&str, AppError> {
        self.text(name)
            .ok_or_else(|| AppError::InvalidInput(format!("Missing form field '{}'", name)))
    }

    pub(crate) fn part_number(&self) -> Result<u32, AppError> {
        self.require("part_number")?
            .trim()
            .parse::<u32>()
            .map_err(|_| AppError::InvalidInput("part_number must be a positive integer".to_string()))
    }

    pub(crate) fn take_body(&mut self) -> Result<ByteReader, AppError> {
        let body = self.body.take().ok_or_else(|| {
            AppError::InvalidInput(format!("Missing file field '{}'", self.file_field))
        })?;
        Ok(Box::pin(std::io::Cursor::new(body)))
    }
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::InvalidInput(format!("Failed to read multipart: {}", e.body_text()))
    }
}
