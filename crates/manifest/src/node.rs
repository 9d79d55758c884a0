use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::Serialize;

use crate::access::Access;
use crate::dtype::DataType;
use crate::names::{DatasetName, ModelName};

/// Maturity level of a model or property, 1 (draft) to 5 (identifiers
/// fully reconciled). Levels above 3 promise globally identifiable
/// references and switch ref handling to surrogate `_id` keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Level(pub u8);

impl Level {
    /// References at this level are stored as surrogate `_id` values.
    pub fn identifiable(self) -> bool {
        self.0 > 3
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub name: DatasetName,
    pub title: String,
    pub description: String,
    pub access: Access,
    /// URI prefixes declared for the dataset, `prefix -> expansion`.
    pub prefixes: BTreeMap<String, String>,
    pub resources: IndexMap<String, Resource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Rows live in the service's own relational store.
    Internal,
    /// Rows are projected from an external SQL source.
    Sql,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub name: String,
    pub kind: ResourceKind,
    /// Name of the backend configuration this resource reads through.
    pub backend: String,
    /// External address of the resource (DSN or schema), verbatim from
    /// the manifest source.
    pub external: String,
    pub models: Vec<ModelName>,
}

/// Binding of a model to its external source table.
#[derive(Debug, Clone, Serialize)]
pub struct ModelExternal {
    /// Source table or view name.
    pub name: String,
    /// Source-side filter formula merged into every read.
    pub prepare: Option<rql::Expr>,
    /// Source column names making up the natural primary key, in order.
    pub pkeys: Vec<String>,
    /// True when the source has no usable primary key; surrogate ids
    /// then derive from whole-row content.
    pub unknown_primary_key: bool,
}

/// Keyset pagination spec: the property to page by and the page size.
#[derive(Debug, Clone, Serialize)]
pub struct PageSpec {
    pub prop: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub name: ModelName,
    pub dataset: Option<DatasetName>,
    pub resource: Option<String>,
    pub title: String,
    pub description: String,
    pub uri: Option<String>,
    pub access: Access,
    pub level: Option<Level>,
    /// Ordered top-level properties.
    pub properties: IndexMap<String, Property>,
    /// Places of the properties making up the primary key.
    pub primary_key: Vec<String>,
    pub external: Option<ModelExternal>,
    /// Keymap namespace override; defaults to the model type.
    pub keymap: Option<String>,
    pub page: Option<PageSpec>,

    // Flattened views, computed once by `link()`.
    #[serde(skip)]
    flat_props: BTreeMap<String, Property>,
    #[serde(skip)]
    props_in_lists: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Property {
    pub name: String,
    /// Dotted path from the model root.
    pub place: String,
    pub dtype: DataType,
    pub access: Access,
    pub level: Option<Level>,
    pub title: String,
    pub description: String,
    pub uri: Option<String>,
    pub unique: bool,
    /// Source binding: the foreign column this property reads from and
    /// an optional per-cell formula.
    pub external: Option<PropertyExternal>,
    /// Enum translation table: source value -> prepared value.
    pub enum_members: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertyExternal {
    pub name: String,
    pub prepare: Option<rql::Expr>,
}

impl Property {
    pub fn new(name: impl Into<String>, place: impl Into<String>, dtype: DataType) -> Property {
        Property {
            name: name.into(),
            place: place.into(),
            dtype,
            access: Access::default(),
            level: None,
            title: String::new(),
            description: String::new(),
            uri: None,
            unique: false,
            external: None,
            enum_members: None,
        }
    }
}

impl Model {
    pub fn new(name: ModelName) -> Model {
        Model {
            name,
            dataset: None,
            resource: None,
            title: String::new(),
            description: String::new(),
            uri: None,
            access: Access::default(),
            level: None,
            properties: IndexMap::new(),
            primary_key: Vec::new(),
            external: None,
            keymap: None,
            page: None,
            flat_props: BTreeMap::new(),
            props_in_lists: BTreeSet::new(),
        }
    }

    /// Wire name of the model, used as `_type` and as the default
    /// keymap namespace.
    pub fn model_type(&self) -> &str {
        self.name.as_str()
    }

    /// Keymap namespace for this model's surrogate keys.
    pub fn keymap_namespace(&self) -> &str {
        self.keymap.as_deref().unwrap_or_else(|| self.model_type())
    }

    /// Compute the flattened property views. Called once after loading;
    /// the model is immutable afterwards.
    pub fn link(&mut self) {
        let mut flat = BTreeMap::new();
        let mut in_lists = BTreeSet::new();
        for prop in self.properties.values() {
            collect(prop, false, &mut flat, &mut in_lists);
        }
        self.flat_props = flat;
        self.props_in_lists = in_lists;
    }

    /// Mapping of dotted place -> property, covering nested object
    /// members and array items.
    pub fn flat_props(&self) -> &BTreeMap<String, Property> {
        &self.flat_props
    }

    pub fn flat_prop(&self, place: &str) -> Option<&Property> {
        self.flat_props.get(place)
    }

    /// Places of leaf properties that sit under an array anywhere in
    /// the tree. Conditions on these are answered from the lists table.
    pub fn props_in_lists(&self) -> &BTreeSet<String> {
        &self.props_in_lists
    }

    pub fn has_lists(&self) -> bool {
        !self.props_in_lists.is_empty()
    }

    /// Qualified names of models this model references.
    pub fn refs(&self) -> Vec<&ModelName> {
        self.flat_props
            .values()
            .filter_map(|p| match &p.dtype {
                DataType::Ref { model, .. } => Some(model),
                _ => None,
            })
            .collect()
    }
}

fn collect(
    prop: &Property,
    inside_list: bool,
    flat: &mut BTreeMap<String, Property>,
    in_lists: &mut BTreeSet<String>,
) {
    flat.insert(prop.place.clone(), prop.clone());
    match &prop.dtype {
        DataType::Object(members) => {
            for member in members.values() {
                collect(member, inside_list, flat, in_lists);
            }
        }
        DataType::Array(item) => {
            // The item property of a scalar array shares the array's
            // place, so insert order matters: the item wins for lookup.
            collect(item, true, flat, in_lists);
        }
        _ => {
            if inside_list {
                in_lists.insert(prop.place.clone());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::names::ModelName;

    fn nested_model() -> Model {
        // country:
        //   code: string
        //   coordinates: object { lat: number, lon: number }
        //   notes: array<object { note: string, since: date }>
        //   tags: array<string>
        let mut model = Model::new(ModelName::new("country"));
        model
            .properties
            .insert("code".into(), Property::new("code", "code", DataType::String));

        let mut coords = IndexMap::new();
        coords.insert(
            "lat".into(),
            Property::new("lat", "coordinates.lat", DataType::Number),
        );
        coords.insert(
            "lon".into(),
            Property::new("lon", "coordinates.lon", DataType::Number),
        );
        model.properties.insert(
            "coordinates".into(),
            Property::new("coordinates", "coordinates", DataType::Object(coords)),
        );

        let mut note = IndexMap::new();
        note.insert(
            "note".into(),
            Property::new("note", "notes.note", DataType::String),
        );
        note.insert(
            "since".into(),
            Property::new("since", "notes.since", DataType::Date),
        );
        let items = Property::new("notes", "notes", DataType::Object(note));
        model.properties.insert(
            "notes".into(),
            Property::new("notes", "notes", DataType::Array(Box::new(items))),
        );

        let tag_item = Property::new("tags", "tags", DataType::String);
        model.properties.insert(
            "tags".into(),
            Property::new("tags", "tags", DataType::Array(Box::new(tag_item))),
        );

        model.link();
        model
    }

    #[test]
    fn test_flat_props_cover_nested_places() {
        let model = nested_model();
        let places: Vec<&str> = model.flat_props().keys().map(String::as_str).collect();
        assert_eq!(
            places,
            vec![
                "code",
                "coordinates",
                "coordinates.lat",
                "coordinates.lon",
                "notes",
                "notes.note",
                "notes.since",
                "tags",
            ],
        );
    }

    #[test]
    fn test_props_in_lists() {
        let model = nested_model();
        let in_lists: Vec<&str> = model.props_in_lists().iter().map(String::as_str).collect();
        // Object members outside arrays are not list props; everything
        // under `notes` is, and so is the scalar array itself.
        assert_eq!(in_lists, vec!["notes.note", "notes.since", "tags"]);
        assert!(model.has_lists());
    }

    #[test]
    fn test_object_members_are_not_list_props() {
        let model = nested_model();
        assert!(!model.props_in_lists().contains("coordinates.lat"));
    }
}
