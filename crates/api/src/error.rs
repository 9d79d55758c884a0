//! The error type returned by API handlers.
//!
//! Wraps the shared domain taxonomy and maps it onto HTTP statuses;
//! everything else (driver faults, I/O) renders as a 500 without
//! leaking details beyond the error chain's display form. The body is
//! `{"errors": [{"type", "code", "message", "context"}, ...]}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    errors: Vec<WireError>,
}

#[derive(Debug, Serialize)]
struct WireError {
    #[serde(rename = "type")]
    node_type: String,
    code: String,
    message: String,
    context: Map<String, Value>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<manifest::Error> for ApiError {
    fn from(err: manifest::Error) -> ApiError {
        let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_REQUEST);
        let errors = err
            .to_responses()
            .into_iter()
            .map(|r| WireError {
                node_type: r.node_type.to_string(),
                code: r.code.to_string(),
                message: r.message,
                context: r.context,
            })
            .collect();
        ApiError { status, errors }
    }
}

impl From<backends::Error> for ApiError {
    fn from(err: backends::Error) -> ApiError {
        match err {
            backends::Error::Domain(domain) => domain.into(),
            err @ backends::Error::RevisionMismatch { .. } => {
                let mut context = Map::new();
                if let backends::Error::RevisionMismatch {
                    model,
                    id,
                    expected,
                } = &err
                {
                    context.insert("model".to_string(), Value::String(model.clone()));
                    context.insert("id".to_string(), Value::String(id.clone()));
                    context.insert("revision".to_string(), Value::String(expected.clone()));
                }
                ApiError {
                    status: StatusCode::CONFLICT,
                    errors: vec![WireError {
                        node_type: "model".to_string(),
                        code: "ConflictingValue".to_string(),
                        message: err.to_string(),
                        context,
                    }],
                }
            }
            other => internal(other.to_string()),
        }
    }
}

impl From<keymap::Error> for ApiError {
    fn from(err: keymap::Error) -> ApiError {
        internal(err.to_string())
    }
}

fn internal(message: String) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        errors: vec![WireError {
            node_type: "system".to_string(),
            code: "InternalError".to_string(),
            message,
            context: Map::new(),
        }],
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            for error in &self.errors {
                tracing::error!(status = %self.status, message = %error.message, "request failed");
            }
        }
        let body = serde_json::json!({ "errors": self.errors });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_domain_error_status_and_context() {
        let err: ApiError = manifest::Error::ItemDoesNotExist {
            model: "country".into(),
            id: "x".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.errors[0].node_type, "model");
        assert_eq!(err.errors[0].code, "ItemDoesNotExist");
        assert_eq!(err.errors[0].context["id"], serde_json::json!("x"));
    }

    #[test]
    fn test_revision_mismatch_maps_to_conflict() {
        let err: ApiError = backends::Error::RevisionMismatch {
            model: "country".into(),
            id: "x".into(),
            expected: "r1".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.errors[0].code, "ConflictingValue");
        assert_eq!(err.errors[0].context["revision"], serde_json::json!("r1"));
    }

    #[test]
    fn test_wire_shape_has_all_fields() {
        let err: ApiError = manifest::Error::UnavailableSubresource {
            prop: "subarray".into(),
            prop_type: "array".into(),
        }
        .into();
        let wire = serde_json::to_value(&err.errors).unwrap();
        assert_eq!(wire[0]["type"], serde_json::json!("property"));
        assert_eq!(wire[0]["code"], serde_json::json!("UnavailableSubresource"));
        assert_eq!(
            wire[0]["context"],
            serde_json::json!({"prop": "subarray", "prop_type": "array"}),
        );
        assert!(wire[0]["message"].as_str().unwrap().contains("subarray"));
    }

    #[test]
    fn test_multiple_errors_render_all() {
        let err: ApiError = manifest::Error::Multiple(vec![
            manifest::Error::FieldNotInResource {
                model: "country".into(),
                prop: "a".into(),
            },
            manifest::Error::UnknownOperator {
                prop: "b".into(),
                operator: "almost".into(),
            },
        ])
        .into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.errors.len(), 2);
    }
}
