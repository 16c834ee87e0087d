//! Persisted service records and re-parse identity resolution

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::compose::classify::ServiceClassification;
use crate::compose::parse::ServiceGraph;

/// A persisted service belonging to a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Uuid,
    pub stack_id: Uuid,
    pub name: String,
    pub image: Option<String>,
    pub classification: ServiceClassification,
}

/// In-memory store for service records.
///
/// On redeploy, services are matched to existing records by name and
/// owning-stack id ONLY, never by image: changing a service's image in
/// the compose source updates the existing record rather than creating a
/// duplicate.
#[derive(Debug, Default)]
pub struct ServiceStore {
    records: Mutex<Vec<ServiceRecord>>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile a freshly-parsed service graph against the stored records
    /// for one stack. Returns the records after reconciliation.
    pub fn reconcile(&self, stack_id: Uuid, graph: &ServiceGraph) -> Vec<ServiceRecord> {
        let mut records = self.records.lock().expect("poisoned lock");
        let mut result = Vec::with_capacity(graph.services.len());

        for service in &graph.services {
            // Find-or-create by name + stack id.
            let position = records
                .iter()
                .position(|r| r.stack_id == stack_id && r.name == service.name);
            let index = match position {
                Some(index) => index,
                None => {
                    records.push(ServiceRecord {
                        id: Uuid::new_v4(),
                        stack_id,
                        name: service.name.clone(),
                        image: service.image.clone(),
                        classification: service.classification,
                    });
                    records.len() - 1
                }
            };

            // Image updates are applied as a separate step after matching.
            if records[index].image != service.image {
                debug!(
                    "Service {} image changed: {:?} -> {:?}",
                    service.name, records[index].image, service.image
                );
                records[index].image = service.image.clone();
            }

            result.push(records[index].clone());
        }

        result
    }

    pub fn for_stack(&self, stack_id: Uuid) -> Vec<ServiceRecord> {
        self.records
            .lock()
            .expect("poisoned lock")
            .iter()
            .filter(|r| r.stack_id == stack_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::document::RawComposeDocument;
    use crate::compose::parse;

    fn graph(image: &str) -> ServiceGraph {
        let yaml = format!("services:\n  app:\n    image: {}\n", image);
        let raw = RawComposeDocument::parse(&yaml).unwrap();
        parse::parse(&raw).unwrap()
    }

    #[test]
    fn test_image_change_updates_existing_record() {
        let store = ServiceStore::new();
        let stack_id = Uuid::new_v4();

        let first = store.reconcile(stack_id, &graph("acme/app:v1"));
        assert_eq!(first.len(), 1);
        let original_id = first[0].id;

        let second = store.reconcile(stack_id, &graph("acme/app:v2"));
        assert_eq!(second.len(), 1);
        // Matched by name + stack id, not by image: same record, new image.
        assert_eq!(second[0].id, original_id);
        assert_eq!(second[0].image.as_deref(), Some("acme/app:v2"));
        assert_eq!(store.for_stack(stack_id).len(), 1);
    }

    #[test]
    fn test_same_name_different_stacks_stay_separate() {
        let store = ServiceStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.reconcile(a, &graph("acme/app:v1"));
        store.reconcile(b, &graph("acme/app:v1"));

        assert_eq!(store.for_stack(a).len(), 1);
        assert_eq!(store.for_stack(b).len(), 1);
        assert_ne!(store.for_stack(a)[0].id, store.for_stack(b)[0].id);
    }
}
