//! Application registry.
//!
//! Readers are many (workers, HTTP handlers); writers only at startup and
//! config reload, so a plain read/write lock over the insertion-ordered
//! list is enough.

use std::sync::{Arc, RwLock};

use crate::models::Application;
use crate::types::Sha;

/// In-memory registry of applications keyed by name.
#[derive(Default)]
pub struct ApplicationStore {
    applications: RwLock<Vec<Arc<Application>>>,
}

impl ApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, application: Arc<Application>) {
        self.applications
            .write()
            .expect("application store lock poisoned")
            .push(application);
    }

    /// Looks up an application by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<Application>> {
        self.applications
            .read()
            .expect("application store lock poisoned")
            .iter()
            .find(|application| application.name == name)
            .cloned()
    }

    /// Resolves a possibly-absent selector: a named lookup when `name` is
    /// given, otherwise the single default application if present.
    pub fn get_or_default(&self, name: Option<&str>) -> Option<Arc<Application>> {
        match name {
            Some(name) => self.get(name),
            None => self.get_default(),
        }
    }

    /// Returns the `is_default` application, if any.
    pub fn get_default(&self) -> Option<Arc<Application>> {
        self.applications
            .read()
            .expect("application store lock poisoned")
            .iter()
            .find(|application| application.is_default())
            .cloned()
    }

    /// Finds the application knowing a commit hash. An ambiguous hash
    /// (known to more than one application) yields no result.
    pub fn get_by_hash(&self, hash: &Sha) -> Option<Arc<Application>> {
        let applications = self
            .applications
            .read()
            .expect("application store lock poisoned");
        let mut matches = applications.iter().filter(|application| {
            application.with_git_state(|state| state.hash_to_objects_map.contains_key(hash))
        });
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(Arc::clone(first))
    }

    /// Snapshot of all applications in insertion order.
    pub fn get_all(&self) -> Vec<Arc<Application>> {
        self.applications
            .read()
            .expect("application store lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApplicationGitState;
    use crate::test_utils::{sha, test_application, test_application_with};

    #[test]
    fn get_finds_by_name() {
        let store = ApplicationStore::new();
        store.add(test_application("one"));
        store.add(test_application("two"));

        assert_eq!(store.get("two").unwrap().name, "two");
        assert!(store.get("three").is_none());
    }

    #[test]
    fn get_or_default_falls_back_to_default_application() {
        let store = ApplicationStore::new();
        store.add(test_application("plain"));
        store.add(test_application_with("fallback", |conf| {
            conf.is_default = true;
        }));

        assert_eq!(store.get_or_default(None).unwrap().name, "fallback");
        assert_eq!(store.get_or_default(Some("plain")).unwrap().name, "plain");
    }

    #[test]
    fn get_or_default_without_default_yields_none() {
        let store = ApplicationStore::new();
        store.add(test_application("plain"));
        assert!(store.get_or_default(None).is_none());
    }

    #[test]
    fn get_by_hash_requires_unambiguous_owner() {
        let store = ApplicationStore::new();
        let one = test_application("one");
        let two = test_application("two");

        let mut state = ApplicationGitState::default();
        state.hash_to_objects_map.insert(sha("aa"), Default::default());
        one.replace_git_state(state.clone());

        store.add(Arc::clone(&one));
        store.add(Arc::clone(&two));

        assert_eq!(store.get_by_hash(&sha("aa")).unwrap().name, "one");

        // Same hash known to a second application: ambiguous, no result.
        two.replace_git_state(state);
        assert!(store.get_by_hash(&sha("aa")).is_none());
    }

    #[test]
    fn get_all_preserves_insertion_order() {
        let store = ApplicationStore::new();
        store.add(test_application("one"));
        store.add(test_application("two"));

        let names: Vec<_> = store
            .get_all()
            .iter()
            .map(|application| application.name.clone())
            .collect();
        assert_eq!(names, vec!["one", "two"]);
    }
}
