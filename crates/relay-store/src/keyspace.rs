/// Key layout on a shared backend: `<namespace>:<kind>:<id>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn prefix(&self, kind: &str) -> String {
        format!("{}:{}:", self.namespace, kind)
    }

    pub fn key(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}", self.namespace, kind, id)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("relay")
    }
}
