//! The loaded schema graph: datasets, models, properties and their
//! data types, plus the traversals and access rules built on top.
//!
//! A [`Manifest`] is built once at startup from tabular source files
//! and is immutable afterwards, so it can be shared freely between
//! request tasks. Models reference each other by qualified name and are
//! resolved through the manifest at each use; the graph may be cyclic.

pub mod access;
pub mod nested;

mod dtype;
mod error;
mod load;
mod names;
mod node;

pub use access::{access_check, Access, Action, Scopes};
pub use dtype::DataType;
pub use error::{Error, ErrorResponse};
pub use load::{from_path, from_reader};
pub use names::{DatasetName, ModelName, PropertyPlace};
pub use node::{
    Dataset, Level, Model, ModelExternal, PageSpec, Property, PropertyExternal, Resource,
    ResourceKind,
};

use indexmap::IndexMap;

#[derive(Debug)]
pub struct Manifest {
    pub name: String,
    pub(crate) datasets: IndexMap<DatasetName, Dataset>,
    pub(crate) models: IndexMap<ModelName, Model>,
}

impl Manifest {
    /// Look a model up by qualified name.
    pub fn model(&self, qn: &str) -> Result<&Model, Error> {
        self.models
            .get(&ModelName::new(qn))
            .ok_or_else(|| Error::NotFound {
                kind: "model",
                name: qn.to_string(),
            })
    }

    pub fn has_model(&self, qn: &str) -> bool {
        self.models.contains_key(&ModelName::new(qn))
    }

    pub fn dataset(&self, qn: &str) -> Result<&Dataset, Error> {
        self.datasets
            .get(&DatasetName::new(qn))
            .ok_or_else(|| Error::NotFound {
                kind: "dataset",
                name: qn.to_string(),
            })
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    /// Models owned by the given dataset, in manifest order.
    pub fn models_in_dataset<'a>(&'a self, dataset: &'a str) -> impl Iterator<Item = &'a Model> {
        self.models
            .values()
            .filter(move |m| m.dataset.as_deref() == Some(dataset))
    }

    /// Order models so that referenced models come before the models
    /// referencing them. Inserts in this order never dangle; deletes
    /// run it reversed. Cycles are broken at the first revisited node.
    pub fn sort_models_by_refs<'a>(&'a self, models: &[&'a Model]) -> Vec<&'a Model> {
        let selected: IndexMap<&str, &Model> =
            models.iter().map(|m| (m.model_type(), *m)).collect();
        let mut visited = std::collections::BTreeSet::new();
        let mut sorted = Vec::new();

        fn visit<'a>(
            model: &'a Model,
            selected: &IndexMap<&str, &'a Model>,
            visited: &mut std::collections::BTreeSet<String>,
            sorted: &mut Vec<&'a Model>,
        ) {
            if !visited.insert(model.model_type().to_string()) {
                return;
            }
            for target in model.refs() {
                if let Some(dep) = selected.get(target.as_str()) {
                    visit(dep, selected, visited, sorted);
                }
            }
            sorted.push(model);
        }

        for model in selected.values() {
            visit(model, &selected, &mut visited, &mut sorted);
        }
        sorted
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn model_with_ref(name: &str, target: Option<&str>) -> Model {
        let mut model = Model::new(ModelName::new(name));
        if let Some(target) = target {
            model.properties.insert(
                "parent".into(),
                Property::new(
                    "parent",
                    "parent",
                    DataType::Ref {
                        model: ModelName::new(target),
                        refprops: vec![],
                    },
                ),
            );
        }
        model.link();
        model
    }

    #[test]
    fn test_sort_models_by_refs() {
        let country = model_with_ref("country", None);
        let city = model_with_ref("city", Some("country"));
        let street = model_with_ref("street", Some("city"));

        let manifest = Manifest {
            name: "test".into(),
            datasets: IndexMap::new(),
            models: IndexMap::new(),
        };

        // Input order is reversed; output follows references.
        let sorted = manifest.sort_models_by_refs(&[&street, &city, &country]);
        let names: Vec<&str> = sorted.iter().map(|m| m.model_type()).collect();
        assert_eq!(names, vec!["country", "city", "street"]);
    }

    #[test]
    fn test_sort_models_by_refs_tolerates_cycles() {
        let a = model_with_ref("a", Some("b"));
        let b = model_with_ref("b", Some("a"));
        let manifest = Manifest {
            name: "test".into(),
            datasets: IndexMap::new(),
            models: IndexMap::new(),
        };
        let sorted = manifest.sort_models_by_refs(&[&a, &b]);
        assert_eq!(sorted.len(), 2);
    }
}
