use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Access level of a manifest node, ordered from most to least
/// restricted. A child declaring a higher level raises its parents at
/// load time; an undeclared node inherits from the nearest declared
/// parent, defaulting to `Protected`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Private,
    #[default]
    Protected,
    Public,
    Open,
}

impl Access {
    pub fn parse(cell: &str) -> Option<Access> {
        Some(match cell {
            "private" => Access::Private,
            "protected" => Access::Protected,
            "public" => Access::Public,
            "open" => Access::Open,
            _ => return None,
        })
    }
}

/// Operation a caller performs against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Getall,
    Getone,
    Search,
    Changes,
    Insert,
    Upsert,
    Update,
    Patch,
    Delete,
    Wipe,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Getall => "getall",
            Action::Getone => "getone",
            Action::Search => "search",
            Action::Changes => "changes",
            Action::Insert => "insert",
            Action::Upsert => "upsert",
            Action::Update => "update",
            Action::Patch => "patch",
            Action::Delete => "delete",
            Action::Wipe => "wipe",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Action::Getall | Action::Getone | Action::Search | Action::Changes
        )
    }
}

/// Scopes granted to the caller of a request, as parsed from its
/// bearer token by the authentication collaborator.
#[derive(Debug, Clone, Default)]
pub struct Scopes(Vec<String>);

impl Scopes {
    pub fn new(scopes: impl IntoIterator<Item = String>) -> Scopes {
        Scopes(scopes.into_iter().collect())
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s == scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Decide whether a caller may perform `action` against a node with the
/// given access level.
///
/// `Open` nodes are readable without any scope. Everything else
/// requires the action scope (`lode_getall`, `lode_insert`, ...);
/// writes always require it, even on open nodes.
pub fn access_check(
    node: &str,
    access: Access,
    action: Action,
    scopes: &Scopes,
) -> Result<(), Error> {
    let scope = format!("lode_{}", action.as_str());
    let granted = scopes.contains(&scope) || scopes.contains("lode_admin");

    if access == Access::Open && !action.is_write() {
        return Ok(());
    }
    if granted {
        return Ok(());
    }
    if access == Access::Private && !scopes.contains("lode_admin") {
        return Err(Error::InsufficientPermission {
            action: action.as_str().to_string(),
            node: node.to_string(),
        });
    }
    Err(Error::InsufficientScope { scope })
}
