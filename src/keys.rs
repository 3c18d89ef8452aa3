use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;

/// Identity of a watched object. Cluster-scoped objects (nodes) carry an
/// empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Name under which this object's configuration file is kept, without
    /// extension: `<namespace>-<name>`.
    pub fn config_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.namespace, self.name)
        }
    }
}

impl TryFrom<&meta::ObjectMeta> for ObjectKey {
    type Error = &'static str;
    fn try_from(metadata: &meta::ObjectMeta) -> Result<Self, Self::Error> {
        Ok(Self {
            namespace: metadata.namespace.clone().ok_or("no namespace")?,
            name: metadata.name.clone().ok_or("no name")?,
        })
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}
