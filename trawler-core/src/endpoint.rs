//! Logical shard addresses.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Identity of a remote node hosting a shard. Equality and hashing are by
/// name; liveness is advisory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeId {
    pub name: String,
    pub host: String,
    pub remote_port: u16,
    pub active: bool,
}

impl NodeId {
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for NodeId {}

impl Hash for NodeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Logical address of one shard: a filesystem path plus an optional remote
/// node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub path: PathBuf,
    pub node: Option<NodeId>,
}

impl Endpoint {
    pub fn local(path: impl Into<PathBuf>) -> Endpoint {
        Endpoint {
            path: path.into(),
            node: None,
        }
    }

    pub fn remote(path: impl Into<PathBuf>, node: NodeId) -> Endpoint {
        Endpoint {
            path: path.into(),
            node: Some(node),
        }
    }

    pub fn is_local(&self) -> bool {
        self.node.is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{}@{}", self.path.display(), node.name),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// Ordered endpoint list addressed by a multi-shard database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Endpoints(pub Vec<Endpoint>);

impl Endpoints {
    pub fn new(endpoints: Vec<Endpoint>) -> Endpoints {
        Endpoints(endpoints)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.0.iter()
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(";");
        write!(f, "[{joined}]")
    }
}

impl From<Vec<Endpoint>> for Endpoints {
    fn from(endpoints: Vec<Endpoint>) -> Endpoints {
        Endpoints(endpoints)
    }
}

impl From<Endpoint> for Endpoints {
    fn from(endpoint: Endpoint) -> Endpoints {
        Endpoints(vec![endpoint])
    }
}
