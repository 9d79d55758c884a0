//! The stable error taxonomy shared by every subsystem.
//!
//! Each variant has a stable code (its variant name) and an HTTP status.
//! Infrastructure failures (database driver errors, I/O) are wrapped by
//! the crates that produce them and map to 500 at the HTTP boundary;
//! this enum covers the domain failures a caller can act on.

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{model}: item {id:?} does not exist")]
    ItemDoesNotExist { model: String, id: String },

    #[error("{model}: multiple rows found where one was expected for {id:?}")]
    MultipleRowsFound { model: String, id: String },

    #[error("{model}: unique constraint violated on property {prop:?}")]
    UniqueConstraint { model: String, prop: String },

    #[error("subresource {prop:?} of type {prop_type:?} is not available")]
    UnavailableSubresource { prop: String, prop_type: String },

    #[error("{model}: property {prop:?} is not part of this resource")]
    FieldNotInResource { model: String, prop: String },

    #[error("unknown operator {operator:?} on property {prop:?}")]
    UnknownOperator { prop: String, operator: String },

    #[error("invalid value {value} for property {prop:?} of type {dtype:?}")]
    InvalidValue {
        prop: String,
        dtype: String,
        value: serde_json::Value,
    },

    #[error("value {value} of property {prop:?} is not a member of its enum")]
    ValueNotInEnum {
        prop: String,
        value: serde_json::Value,
    },

    #[error("property {prop:?} is managed by the service and cannot be written")]
    ManagedProperty { prop: String },

    #[error("insufficient scope, {scope:?} is required")]
    InsufficientScope { scope: String },

    #[error("insufficient permission to {action} {node}")]
    InsufficientPermission { action: String, node: String },

    #[error("unknown content type {content_type:?}")]
    UnknownContentType { content_type: String },

    #[error("invalid JSON body: {detail}")]
    Json { detail: String },

    #[error("client {client_id:?} already exists")]
    ClientAlreadyExists { client_id: String },

    #[error("unknown request parameter {name:?}")]
    UnknownParameter { name: String },

    #[error("{feature} is not implemented")]
    NotImplementedFeature { feature: String },

    #[error("no authorization server is configured")]
    NoAuthServer,

    #[error("manifest load error at {path}: {detail}")]
    ManifestLoad { path: String, detail: String },

    #[error("multiple errors")]
    Multiple(Vec<Error>),
}

impl Error {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        use Error::*;
        match self {
            NotFound { .. } => "NotFoundError",
            ItemDoesNotExist { .. } => "ItemDoesNotExist",
            MultipleRowsFound { .. } => "MultipleRowsFound",
            UniqueConstraint { .. } => "UniqueConstraint",
            UnavailableSubresource { .. } => "UnavailableSubresource",
            FieldNotInResource { .. } => "FieldNotInResource",
            UnknownOperator { .. } => "UnknownOperator",
            InvalidValue { .. } => "InvalidValue",
            ValueNotInEnum { .. } => "ValueNotInEnum",
            ManagedProperty { .. } => "ManagedProperty",
            InsufficientScope { .. } => "InsufficientScopeError",
            InsufficientPermission { .. } => "InsufficientPermission",
            UnknownContentType { .. } => "UnknownContentType",
            Json { .. } => "JSONError",
            ClientAlreadyExists { .. } => "ClientAlreadyExists",
            UnknownParameter { .. } => "UnknownParameter",
            NotImplementedFeature { .. } => "NotImplementedFeature",
            NoAuthServer => "NoAuthServer",
            ManifestLoad { .. } => "ManifestLoad",
            Multiple(..) => "MultipleErrors",
        }
    }

    /// HTTP status this kind maps to. `Multiple` shares the status of
    /// its first member; all members are required to agree.
    pub fn status(&self) -> u16 {
        use Error::*;
        match self {
            NotFound { .. } | ItemDoesNotExist { .. } => 404,
            MultipleRowsFound { .. } | ManifestLoad { .. } => 500,
            InsufficientScope { .. } | InsufficientPermission { .. } => 403,
            UnknownContentType { .. } => 415,
            NotImplementedFeature { .. } => 501,
            NoAuthServer => 503,
            Multiple(errors) => errors.first().map(Error::status).unwrap_or(500),
            _ => 400,
        }
    }

    /// Kind of node the error binds to: the wire `type` field.
    pub fn node_type(&self) -> &'static str {
        use Error::*;
        match self {
            NotFound { kind, .. } => kind,
            ItemDoesNotExist { .. }
            | MultipleRowsFound { .. }
            | UniqueConstraint { .. }
            | FieldNotInResource { .. } => "model",
            UnavailableSubresource { .. }
            | UnknownOperator { .. }
            | InvalidValue { .. }
            | ValueNotInEnum { .. }
            | ManagedProperty { .. } => "property",
            ManifestLoad { .. } => "manifest",
            _ => "system",
        }
    }

    /// Structured fields of the error: the wire `context` object.
    pub fn context(&self) -> serde_json::Map<String, serde_json::Value> {
        use serde_json::Value;
        use Error::*;

        let mut context = serde_json::Map::new();
        let mut put = |key: &str, value: Value| {
            context.insert(key.to_string(), value);
        };
        match self {
            NotFound { name, .. } => put("name", Value::String(name.clone())),
            ItemDoesNotExist { model, id } | MultipleRowsFound { model, id } => {
                put("model", Value::String(model.clone()));
                put("id", Value::String(id.clone()));
            }
            UniqueConstraint { model, prop } | FieldNotInResource { model, prop } => {
                put("model", Value::String(model.clone()));
                put("property", Value::String(prop.clone()));
            }
            UnavailableSubresource { prop, prop_type } => {
                put("prop", Value::String(prop.clone()));
                put("prop_type", Value::String(prop_type.clone()));
            }
            UnknownOperator { prop, operator } => {
                put("property", Value::String(prop.clone()));
                put("operator", Value::String(operator.clone()));
            }
            InvalidValue { prop, dtype, value } => {
                put("property", Value::String(prop.clone()));
                put("type", Value::String(dtype.clone()));
                put("value", value.clone());
            }
            ValueNotInEnum { prop, value } => {
                put("property", Value::String(prop.clone()));
                put("value", value.clone());
            }
            ManagedProperty { prop } => put("property", Value::String(prop.clone())),
            InsufficientScope { scope } => put("scope", Value::String(scope.clone())),
            InsufficientPermission { action, node } => {
                put("action", Value::String(action.clone()));
                put("node", Value::String(node.clone()));
            }
            UnknownContentType { content_type } => {
                put("content_type", Value::String(content_type.clone()));
            }
            Json { detail } => put("detail", Value::String(detail.clone())),
            ClientAlreadyExists { client_id } => {
                put("client_id", Value::String(client_id.clone()));
            }
            UnknownParameter { name } => put("name", Value::String(name.clone())),
            NotImplementedFeature { feature } => {
                put("feature", Value::String(feature.clone()));
            }
            ManifestLoad { path, .. } => put("path", Value::String(path.clone())),
            NoAuthServer | Multiple(..) => {}
        }
        context
    }

    /// Render this error (or each member of `Multiple`) into wire shape.
    pub fn to_responses(&self) -> Vec<ErrorResponse> {
        match self {
            Error::Multiple(errors) => errors.iter().flat_map(Error::to_responses).collect(),
            other => vec![ErrorResponse {
                node_type: other.node_type(),
                code: other.code(),
                message: other.to_string(),
                context: other.context(),
            }],
        }
    }
}

/// One error in wire shape:
/// `{"type", "code", "message", "context"}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub node_type: &'static str,
    pub code: &'static str,
    pub message: String,
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::ItemDoesNotExist {
                model: "country".into(),
                id: "x".into()
            }
            .status(),
            404,
        );
        assert_eq!(
            Error::MultipleRowsFound {
                model: "country".into(),
                id: "x".into()
            }
            .status(),
            500,
        );
        assert_eq!(Error::NoAuthServer.status(), 503);
        assert_eq!(
            Error::NotImplementedFeature {
                feature: "multi-master writes".into()
            }
            .status(),
            501,
        );
    }

    #[test]
    fn test_multiple_errors_share_status() {
        let err = Error::Multiple(vec![
            Error::FieldNotInResource {
                model: "country".into(),
                prop: "a".into(),
            },
            Error::FieldNotInResource {
                model: "country".into(),
                prop: "b".into(),
            },
        ]);
        assert_eq!(err.status(), 400);
        assert_eq!(err.to_responses().len(), 2);
    }

    #[test]
    fn test_response_shape() {
        let err = Error::UnavailableSubresource {
            prop: "subarray".into(),
            prop_type: "array".into(),
        };
        let responses = err.to_responses();
        let wire = serde_json::to_value(&responses[0]).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "type": "property",
                "code": "UnavailableSubresource",
                "message": "subresource \"subarray\" of type \"array\" is not available",
                "context": {"prop": "subarray", "prop_type": "array"},
            }),
        );
    }

    #[test]
    fn test_context_carries_the_failing_id() {
        let err = Error::ItemDoesNotExist {
            model: "country".into(),
            id: "abc".into(),
        };
        let context = err.context();
        assert_eq!(context["model"], serde_json::json!("country"));
        assert_eq!(context["id"], serde_json::json!("abc"));
        assert_eq!(err.node_type(), "model");
    }
}
