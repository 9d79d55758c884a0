use indexmap::IndexMap;
use serde::Serialize;

use crate::names::ModelName;
use crate::node::Property;

/// The data type of a property.
///
/// Scalar variants carry no payload; container variants own their item
/// or member properties. References are stored by qualified model name
/// and resolved through the manifest at each use, never as pointers, so
/// the model graph may be cyclic.
#[derive(Debug, Clone, Serialize)]
pub enum DataType {
    String,
    Text,
    Integer,
    Number,
    Boolean,
    Date,
    Time,
    DateTime,
    Uri,
    Binary,
    File,
    Geometry,
    PrimaryKey,
    /// `array<T>`: the boxed property describes one item.
    Array(Box<Property>),
    /// `object{...}`: ordered member properties.
    Object(IndexMap<String, Property>),
    /// `ref<Model>`: reference to another model, optionally narrowed to
    /// specific referenced properties.
    Ref {
        model: ModelName,
        refprops: Vec<String>,
    },
}

impl DataType {
    /// The tag used in manifests and error messages.
    pub fn tag(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Text => "text",
            DataType::Integer => "integer",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::Time => "time",
            DataType::DateTime => "datetime",
            DataType::Uri => "uri",
            DataType::Binary => "binary",
            DataType::File => "file",
            DataType::Geometry => "geometry",
            DataType::PrimaryKey => "pk",
            DataType::Array(..) => "array",
            DataType::Object(..) => "object",
            DataType::Ref { .. } => "ref",
        }
    }

    /// Parse a scalar type tag from a manifest cell. Container and ref
    /// types are assembled by the loader, not named directly here.
    pub fn scalar_from_tag(tag: &str) -> Option<DataType> {
        Some(match tag {
            "string" => DataType::String,
            "text" => DataType::Text,
            "integer" => DataType::Integer,
            "number" => DataType::Number,
            "boolean" => DataType::Boolean,
            "date" => DataType::Date,
            "time" => DataType::Time,
            "datetime" => DataType::DateTime,
            "uri" => DataType::Uri,
            "binary" => DataType::Binary,
            "file" => DataType::File,
            "geometry" => DataType::Geometry,
            "pk" => DataType::PrimaryKey,
            _ => return None,
        })
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            DataType::Array(..) | DataType::Object(..) | DataType::Ref { .. } | DataType::File
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            DataType::Date | DataType::Time | DataType::DateTime
        )
    }
}
