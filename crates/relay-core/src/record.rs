use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A small structured value kept in the state store under a string key.
///
/// Each record kind declares a closed set of update operations; the store
/// applies them atomically (under its own lock or the distributed lock), so
/// callers never fetch, mutate and write back a shared record themselves.
pub trait Record: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Mutation applied by `KvStore::update_field`.
    type Update: Clone + Debug + Send + Sync + 'static;

    /// Key-space segment, e.g. `session` in `<ns>:session:<key>`.
    const KIND: &'static str;

    fn apply(&mut self, update: &Self::Update);

    /// Mirror of the store deadline. Records without one ignore it.
    fn set_expire_at(&mut self, _at: DateTime<Utc>) {}
}
