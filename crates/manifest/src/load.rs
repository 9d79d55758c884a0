//! Tabular manifest loading.
//!
//! A manifest is a CSV table with the columns
//! `id,d,r,b,m,property,type,ref,source,prepare,level,access,uri,title,
//! description`. Rows open scopes top-down: a non-empty `d` starts a
//! dataset, `r` a resource within it, `m` a model, and `property` rows
//! attach to the open model. Dotted property names attach into the
//! nested object or array declared by their ancestor rows; `name[]`
//! declares the item type of a scalar array. A row with type `enum`
//! following a property adds one member to that property's enum, with
//! `source` as the stored value and `prepare` as the value it maps to.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::access::Access;
use crate::dtype::DataType;
use crate::error::Error;
use crate::names::{DatasetName, ModelName, PropertyPlace};
use crate::node::{
    Dataset, Level, Model, ModelExternal, PageSpec, Property, PropertyExternal, Resource,
    ResourceKind,
};
use crate::Manifest;

#[derive(Debug, serde::Deserialize)]
struct Row {
    #[serde(default)]
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    d: String,
    #[serde(default)]
    r: String,
    #[serde(default)]
    b: String,
    #[serde(default)]
    m: String,
    #[serde(default)]
    property: String,
    #[serde(default, rename = "type")]
    dtype: String,
    #[serde(default, rename = "ref")]
    ref_: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    prepare: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    access: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

pub fn from_reader(name: &str, input: impl std::io::Read) -> Result<Manifest, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(input);

    let mut loader = Loader::new(name);
    for (line, row) in reader.deserialize::<Row>().enumerate() {
        let row = row.map_err(|err| Error::ManifestLoad {
            path: format!("{name}:{}", line + 2),
            detail: err.to_string(),
        })?;
        loader.row(&row).map_err(|err| at_line(err, name, line))?;
    }
    loader.finish()
}

pub fn from_path(path: &std::path::Path) -> Result<Manifest, Error> {
    let name = path.display().to_string();
    let file = std::fs::File::open(path).map_err(|err| Error::ManifestLoad {
        path: name.clone(),
        detail: err.to_string(),
    })?;
    from_reader(&name, file)
}

fn at_line(err: Error, name: &str, line: usize) -> Error {
    match err {
        Error::ManifestLoad { path, detail } if path.is_empty() => Error::ManifestLoad {
            path: format!("{name}:{}", line + 2),
            detail,
        },
        other => other,
    }
}

fn load_error(detail: impl Into<String>) -> Error {
    Error::ManifestLoad {
        path: String::new(),
        detail: detail.into(),
    }
}

fn none_if_empty(cell: &str) -> Option<String> {
    if cell.is_empty() {
        None
    } else {
        Some(cell.to_string())
    }
}

struct Loader {
    manifest_name: String,
    datasets: IndexMap<DatasetName, Dataset>,
    models: IndexMap<ModelName, Model>,
    dataset: Option<DatasetName>,
    resource: Option<String>,
    model: Option<ModelName>,
    // Last loaded property place, for attaching enum member rows.
    last_prop: Option<String>,
    // Declared (not inherited) access per node, for propagation.
    given_access: BTreeMap<String, Access>,
}

impl Loader {
    fn new(name: &str) -> Loader {
        Loader {
            manifest_name: name.to_string(),
            datasets: IndexMap::new(),
            models: IndexMap::new(),
            dataset: None,
            resource: None,
            model: None,
            last_prop: None,
            given_access: BTreeMap::new(),
        }
    }

    fn row(&mut self, row: &Row) -> Result<(), Error> {
        if !row.d.is_empty() {
            self.dataset(row)?;
        } else if !row.r.is_empty() {
            self.resource(row)?;
        } else if !row.m.is_empty() {
            self.model(row)?;
        } else if row.dtype == "enum" {
            self.enum_member(row)?;
        } else if !row.property.is_empty() {
            self.property(row)?;
        }
        Ok(())
    }

    fn dataset(&mut self, row: &Row) -> Result<(), Error> {
        let name = DatasetName::new(&row.d);
        if !name.is_valid() {
            return Err(load_error(format!("invalid dataset name {:?}", row.d)));
        }
        if let Some(access) = self.parse_access(&row.access)? {
            self.given_access.insert(name.to_string(), access);
        }
        self.datasets.insert(
            name.clone(),
            Dataset {
                name: name.clone(),
                title: row.title.clone(),
                description: row.description.clone(),
                access: Access::default(),
                prefixes: BTreeMap::new(),
                resources: IndexMap::new(),
            },
        );
        self.dataset = Some(name);
        self.resource = None;
        self.model = None;
        self.last_prop = None;
        Ok(())
    }

    fn resource(&mut self, row: &Row) -> Result<(), Error> {
        let dataset = self
            .dataset
            .as_ref()
            .ok_or_else(|| load_error("resource row outside of a dataset"))?
            .clone();
        let kind = match row.dtype.as_str() {
            "sql" => ResourceKind::Sql,
            "" | "internal" | "postgresql" => ResourceKind::Internal,
            other => return Err(load_error(format!("unknown resource type {other:?}"))),
        };
        let resource = Resource {
            name: row.r.clone(),
            kind,
            backend: if row.b.is_empty() {
                row.r.clone()
            } else {
                row.b.clone()
            },
            external: row.source.clone(),
            models: Vec::new(),
        };
        self.datasets
            .get_mut(&dataset)
            .expect("dataset scope was just opened")
            .resources
            .insert(row.r.clone(), resource);
        self.resource = Some(row.r.clone());
        self.model = None;
        self.last_prop = None;
        Ok(())
    }

    fn model(&mut self, row: &Row) -> Result<(), Error> {
        let name = match &self.dataset {
            Some(ds) => ModelName::new(format!("{ds}/{}", row.m)),
            None => ModelName::new(&row.m),
        };
        if !name.is_valid() {
            return Err(load_error(format!("invalid model name {:?}", row.m)));
        }

        let mut model = Model::new(name.clone());
        model.dataset = self.dataset.clone();
        model.resource = self.resource.clone();
        model.title = row.title.clone();
        model.description = row.description.clone();
        model.uri = none_if_empty(&row.uri);
        model.level = self.parse_level(&row.level)?;
        model.primary_key = row
            .ref_
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if let Some(access) = self.parse_access(&row.access)? {
            self.given_access.insert(name.to_string(), access);
        }

        // A model under an external SQL resource reads from a source
        // table; internal models persist in the service's own store.
        let (prepare, page) = self.parse_model_prepare(&row.prepare)?;
        model.page = page;
        if let (Some(ds), Some(r)) = (self.dataset.clone(), self.resource.clone()) {
            let resource = self
                .datasets
                .get_mut(&ds)
                .expect("dataset scope is open")
                .resources
                .get_mut(&r)
                .expect("resource scope is open");
            resource.models.push(name.clone());
            if resource.kind == ResourceKind::Sql {
                model.external = Some(ModelExternal {
                    name: row.source.clone(),
                    prepare,
                    pkeys: Vec::new(), // resolved in finish()
                    unknown_primary_key: model.primary_key.is_empty(),
                });
            }
        }

        self.models.insert(name.clone(), model);
        self.model = Some(name);
        self.last_prop = None;
        Ok(())
    }

    fn property(&mut self, row: &Row) -> Result<(), Error> {
        let model_name = self
            .model
            .as_ref()
            .ok_or_else(|| load_error("property row outside of a model"))?
            .clone();

        let (place, scalar_array_item) = match row.property.strip_suffix("[]") {
            Some(stripped) => (stripped.to_string(), true),
            None => (row.property.clone(), false),
        };
        if !PropertyPlace::new(&place).is_valid() {
            return Err(load_error(format!(
                "invalid property place {:?}",
                row.property
            )));
        }

        let name = place.rsplit('.').next().expect("place is non-empty");
        let dtype = self.parse_dtype(row, &place)?;
        let mut prop = Property::new(name, &place, dtype);
        prop.level = self.parse_level(&row.level)?;
        prop.uri = none_if_empty(&row.uri);
        prop.title = row.title.clone();
        prop.description = row.description.clone();
        prop.unique = row.dtype.split_whitespace().any(|w| w == "unique");
        if !row.source.is_empty() || !row.prepare.is_empty() {
            prop.external = Some(PropertyExternal {
                name: if row.source.is_empty() {
                    name.to_string()
                } else {
                    row.source.clone()
                },
                prepare: self.parse_prepare(&row.prepare)?,
            });
        }
        if let Some(access) = self.parse_access(&row.access)? {
            self.given_access
                .insert(format!("{model_name}:{place}"), access);
        }

        let model = self
            .models
            .get_mut(&model_name)
            .expect("model scope is open");
        attach(model, &place, prop, scalar_array_item)?;
        self.last_prop = Some(place);
        Ok(())
    }

    fn enum_member(&mut self, row: &Row) -> Result<(), Error> {
        let model_name = self
            .model
            .as_ref()
            .ok_or_else(|| load_error("enum row outside of a model"))?
            .clone();
        let place = self
            .last_prop
            .as_ref()
            .ok_or_else(|| load_error("enum row does not follow a property"))?
            .clone();

        let prepared = match self.parse_prepare(&row.prepare)? {
            Some(rql::Expr::Value(value)) => value.to_json(),
            Some(other) => {
                return Err(load_error(format!(
                    "enum prepare must be a literal, got {:?}",
                    rql::unparse(&other)
                )))
            }
            None => serde_json::Value::String(row.source.clone()),
        };

        let model = self
            .models
            .get_mut(&model_name)
            .expect("model scope is open");
        let prop = lookup_mut(model, &place)
            .ok_or_else(|| load_error(format!("enum member for unknown property {place:?}")))?;
        prop.enum_members
            .get_or_insert_with(BTreeMap::new)
            .insert(row.source.clone(), prepared);
        Ok(())
    }

    fn parse_dtype(&self, row: &Row, place: &str) -> Result<DataType, Error> {
        let tag = row
            .dtype
            .split_whitespace()
            .next()
            .unwrap_or_default();
        match tag {
            "" => Ok(DataType::String),
            "ref" => {
                let (target, refprops) = match row.ref_.split_once('[') {
                    Some((target, rest)) => {
                        let rest = rest.trim_end_matches(']');
                        (
                            target.trim(),
                            rest.split(',').map(|s| s.trim().to_string()).collect(),
                        )
                    }
                    None => (row.ref_.trim(), Vec::new()),
                };
                let model = match &self.dataset {
                    // Bare target names resolve within the dataset.
                    Some(ds) if !target.contains('/') => {
                        ModelName::new(format!("{ds}/{target}"))
                    }
                    _ => ModelName::new(target),
                };
                Ok(DataType::Ref {
                    model,
                    refprops,
                })
            }
            "array" => Ok(DataType::Array(Box::new(Property::new(
                place.rsplit('.').next().unwrap_or(place),
                place,
                DataType::Object(IndexMap::new()),
            )))),
            "object" => Ok(DataType::Object(IndexMap::new())),
            tag => DataType::scalar_from_tag(tag)
                .ok_or_else(|| load_error(format!("unknown property type {tag:?}"))),
        }
    }

    fn parse_access(&self, cell: &str) -> Result<Option<Access>, Error> {
        if cell.is_empty() {
            return Ok(None);
        }
        Access::parse(cell)
            .map(Some)
            .ok_or_else(|| load_error(format!("unknown access level {cell:?}")))
    }

    fn parse_level(&self, cell: &str) -> Result<Option<Level>, Error> {
        if cell.is_empty() {
            return Ok(None);
        }
        cell.parse::<u8>()
            .ok()
            .filter(|n| (1..=5).contains(n))
            .map(|n| Some(Level(n)))
            .ok_or_else(|| load_error(format!("level must be 1..=5, got {cell:?}")))
    }

    fn parse_prepare(&self, cell: &str) -> Result<Option<rql::Expr>, Error> {
        if cell.is_empty() {
            return Ok(None);
        }
        rql::parse(cell)
            .map(Some)
            .map_err(|err| load_error(format!("bad formula {cell:?}: {err}")))
    }

    /// Model-level `prepare` may carry a `page(prop[,size])` clause next
    /// to source filters; split it off into the page spec.
    fn parse_model_prepare(
        &self,
        cell: &str,
    ) -> Result<(Option<rql::Expr>, Option<PageSpec>), Error> {
        let Some(expr) = self.parse_prepare(cell)? else {
            return Ok((None, None));
        };
        let mut page = None;
        let mut rest = Vec::new();
        for clause in expr.conjuncts() {
            match clause {
                rql::Expr::Op { name, args } if name == "page" => {
                    let prop = match args.first() {
                        Some(rql::Expr::Bind(place)) => place.clone(),
                        _ => return Err(load_error("page() expects a property")),
                    };
                    let size = match args.get(1) {
                        Some(rql::Expr::Value(rql::Value::Integer(n))) => *n as usize,
                        None => 1000,
                        _ => return Err(load_error("page() size must be an integer")),
                    };
                    page = Some(PageSpec { prop, size });
                }
                other => rest.push(other.clone()),
            }
        }
        let prepare = match rest.len() {
            0 => None,
            1 => Some(rest.pop().expect("len is 1")),
            _ => Some(rql::Expr::op("and", rest)),
        };
        Ok((prepare, page))
    }

    fn finish(mut self) -> Result<Manifest, Error> {
        let model_names: Vec<ModelName> = self.models.keys().cloned().collect();

        // Link flattened views and resolve source pkeys.
        for name in &model_names {
            let model = self.models.get_mut(name).expect("known model");
            model.link();
            let pkeys: Vec<String> = model
                .primary_key
                .iter()
                .map(|place| {
                    model
                        .flat_prop(place)
                        .and_then(|p| p.external.as_ref().map(|e| e.name.clone()))
                        .unwrap_or_else(|| place.clone())
                })
                .collect();
            if let Some(external) = &mut model.external {
                external.pkeys = pkeys;
            }
        }

        // Check referenced models and primary key properties exist.
        let mut errors = Vec::new();
        for name in &model_names {
            let model = &self.models[name];
            for target in model.refs() {
                if !self.models.contains_key(target) {
                    errors.push(Error::ManifestLoad {
                        path: format!("model {name}"),
                        detail: format!("referenced model {target:?} is not defined"),
                    });
                }
            }
            for place in &model.primary_key {
                if model.flat_prop(place).is_none() {
                    errors.push(Error::ManifestLoad {
                        path: format!("model {name}"),
                        detail: format!("primary key property {place:?} is not defined"),
                    });
                }
            }
        }

        if !errors.is_empty() {
            return Err(if errors.len() == 1 {
                errors.pop().expect("len is 1")
            } else {
                Error::Multiple(errors)
            });
        }

        self.propagate_access();

        tracing::debug!(
            name = %self.manifest_name,
            datasets = self.datasets.len(),
            models = self.models.len(),
            "loaded manifest",
        );

        Ok(Manifest {
            name: self.manifest_name,
            datasets: self.datasets,
            models: self.models,
        })
    }

    /// Declared access propagates: children inherit from the nearest
    /// declared parent (default protected), and a child declared more
    /// open than its parent raises the parent.
    fn propagate_access(&mut self) {
        let given = std::mem::take(&mut self.given_access);

        for (name, dataset) in self.datasets.iter_mut() {
            dataset.access = given
                .get(name.as_str())
                .copied()
                .unwrap_or_default();
        }

        for (name, model) in self.models.iter_mut() {
            let dataset_given = model
                .dataset
                .as_ref()
                .and_then(|ds| given.get(ds.as_str()).copied());
            let model_given = given.get(name.as_str()).copied();
            let mut access = model_given.or(dataset_given).unwrap_or_default();

            let inherited = access;
            let places: Vec<String> = model.flat_props().keys().cloned().collect();
            for place in places {
                let prop_given = given.get(&format!("{name}:{place}")).copied();
                if let Some(prop) = lookup_mut(model, &place) {
                    prop.access = prop_given.unwrap_or(inherited);
                }
                // A more open child raises the model.
                if let Some(prop_access) = prop_given {
                    if prop_access > access {
                        access = prop_access;
                    }
                }
            }
            model.access = access;

            if let Some(ds) = model.dataset.clone() {
                if let Some(dataset) = self.datasets.get_mut(&ds) {
                    if access > dataset.access {
                        dataset.access = access;
                    }
                }
            }
        }
    }
}

/// Attach a loaded property into the model tree at its dotted place.
fn attach(
    model: &mut Model,
    place: &str,
    prop: Property,
    scalar_array_item: bool,
) -> Result<(), Error> {
    let mut parts: Vec<&str> = place.split('.').collect();
    let leaf = parts.pop().expect("place is non-empty");

    let mut members: &mut IndexMap<String, Property> = &mut model.properties;
    let mut prefix = String::new();
    for part in parts {
        prefix = if prefix.is_empty() {
            part.to_string()
        } else {
            format!("{prefix}.{part}")
        };
        let parent = members.get_mut(part).ok_or_else(|| {
            load_error(format!(
                "nested property {place:?} declared before its parent {prefix:?}"
            ))
        })?;
        members = match &mut parent.dtype {
            DataType::Object(members) => members,
            DataType::Array(item) => match &mut item.dtype {
                DataType::Object(members) => members,
                _ => {
                    return Err(load_error(format!(
                        "cannot nest {place:?} under scalar array {prefix:?}"
                    )))
                }
            },
            _ => {
                return Err(load_error(format!(
                    "cannot nest {place:?} under scalar property {prefix:?}"
                )))
            }
        };
    }

    if scalar_array_item {
        // `name[]` re-types the array's items from the default object.
        let parent = members.get_mut(leaf).ok_or_else(|| {
            load_error(format!("item row {place:?}[] has no array property"))
        })?;
        match &mut parent.dtype {
            DataType::Array(item) => {
                **item = prop;
                Ok(())
            }
            other => Err(load_error(format!(
                "item row {place:?}[] attaches to {:?}, not an array",
                other.tag()
            ))),
        }
    } else {
        members.insert(leaf.to_string(), prop);
        Ok(())
    }
}

/// Mutable lookup of a property by place, descending objects and array
/// items.
fn lookup_mut<'a>(model: &'a mut Model, place: &str) -> Option<&'a mut Property> {
    let mut parts = place.split('.');
    let first = parts.next()?;
    let mut prop = model.properties.get_mut(first)?;
    for part in parts {
        let members = match &mut prop.dtype {
            DataType::Object(members) => members,
            DataType::Array(item) => match &mut item.dtype {
                DataType::Object(members) => members,
                _ => return None,
            },
            _ => return None,
        };
        prop = members.get_mut(part)?;
    }
    // A scalar array's leaf is its item property.
    if matches!(&prop.dtype, DataType::Array(item) if !matches!(item.dtype, DataType::Object(..)))
    {
        let DataType::Array(item) = &mut prop.dtype else {
            unreachable!()
        };
        return Some(item);
    }
    Some(prop)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = "\
id,d,r,b,m,property,type,ref,source,prepare,level,access,uri,title,description
,datasets/gov/example,,,,,,,,,,open,,Example,
,,sqlres,sqldb,,,sql,,sqlite:///ext.db,,,,,,
,,,,country,,,code,salis,\"page(code,100)\",4,,,Countries,
,,,,,code,string unique,,kodas,,,,,Code,
,,,,,title,string,,pavadinimas,,,,,,
,,,,,driving,string,,vairavimas,,,,,,
,,,,,,enum,,l,'left',,,,,
,,,,,,enum,,r,'right',,,,,
,,,,city,,,name,miestas,,4,,,,
,,,,,name,string,,pavadinimas,,,,,,
,,,,,country,ref,country,salis,,4,,,,
";

    fn load() -> Manifest {
        from_reader("test", MANIFEST.as_bytes()).unwrap()
    }

    #[test]
    fn test_load_scopes() {
        let manifest = load();
        let dataset = manifest.dataset("datasets/gov/example").unwrap();
        assert_eq!(dataset.resources.len(), 1);
        assert_eq!(
            dataset.resources["sqlres"].models,
            vec![
                ModelName::new("datasets/gov/example/country"),
                ModelName::new("datasets/gov/example/city"),
            ],
        );

        let country = manifest.model("datasets/gov/example/country").unwrap();
        assert_eq!(country.primary_key, vec!["code"]);
        assert_eq!(country.external.as_ref().unwrap().name, "salis");
        assert_eq!(country.external.as_ref().unwrap().pkeys, vec!["kodas"]);
        assert_eq!(country.page.as_ref().unwrap().prop, "code");
        assert_eq!(country.page.as_ref().unwrap().size, 100);
    }

    #[test]
    fn test_load_property_details() {
        let manifest = load();
        let country = manifest.model("datasets/gov/example/country").unwrap();

        let code = country.flat_prop("code").unwrap();
        assert!(code.unique);
        assert_eq!(code.external.as_ref().unwrap().name, "kodas");

        let driving = country.flat_prop("driving").unwrap();
        let members = driving.enum_members.as_ref().unwrap();
        assert_eq!(members["l"], serde_json::json!("left"));
        assert_eq!(members["r"], serde_json::json!("right"));
    }

    #[test]
    fn test_load_ref_resolves_within_dataset() {
        let manifest = load();
        let city = manifest.model("datasets/gov/example/city").unwrap();
        match &city.flat_prop("country").unwrap().dtype {
            DataType::Ref { model, .. } => {
                assert_eq!(model.as_str(), "datasets/gov/example/country");
            }
            other => panic!("expected ref, got {:?}", other.tag()),
        }
    }

    #[test]
    fn test_load_access_inheritance() {
        let manifest = load();
        // Dataset is declared open; the model inherits it.
        let country = manifest.model("datasets/gov/example/country").unwrap();
        assert_eq!(country.access, Access::Open);
        assert_eq!(country.flat_prop("code").unwrap().access, Access::Open);
    }

    #[test]
    fn test_load_unknown_ref_fails() {
        let bad = "\
id,d,r,b,m,property,type,ref,source,prepare,level,access,uri,title,description
,,,,city,,,,,,,,,,
,,,,,country,ref,country,,,,,,,
";
        let err = from_reader("test", bad.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("referenced model"));
    }

    #[test]
    fn test_load_nested_before_parent_fails() {
        let bad = "\
id,d,r,b,m,property,type,ref,source,prepare,level,access,uri,title,description
,,,,city,,,,,,,,,,
,,,,,coordinates.lat,number,,,,,,,,
";
        let err = from_reader("test", bad.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("before its parent"));
    }
}
