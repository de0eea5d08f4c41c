use serde::{Deserialize, Serialize};

use crate::error::{codes, AppError, ErrorMetadata};

/// `{code, message, data}` body used by storage nodes.
///
/// A non-zero `code` is a domain error and is distinct from the HTTP status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i32,
    pub message: String,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: codes::OK,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == codes::OK
    }

    /// Convert into the payload, or the error kind the code stands for.
    pub fn into_result(self) -> Result<T, AppError> {
        if self.code != codes::OK {
            return Err(AppError::from_app_code(self.code, self.message));
        }
        self.data
            .ok_or_else(|| AppError::Storage("Storage node returned an empty payload".to_string()))
    }
}

impl ApiEnvelope<()> {
    pub fn from_error(err: &AppError) -> Self {
        Self {
            code: err.app_code(),
            message: err.client_message(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_maps_back_to_kind() {
        let body = serde_json::to_string(&ApiEnvelope::from_error(&AppError::NotFound(
            "unknown upload id".into(),
        )))
        .unwrap();
        let parsed: ApiEnvelope<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert!(!parsed.is_ok());
        assert!(matches!(parsed.into_result(), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_ok_envelope_without_data_is_error() {
        let parsed: ApiEnvelope<u32> =
            serde_json::from_str(r#"{"code":0,"message":"success"}"#).unwrap();
        assert!(matches!(parsed.into_result(), Err(AppError::Storage(_))));
    }
}
