use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lxp_types::type_label::DESCRIPTOR_NAME_LABEL;
use lxp_types::{Lxp, TypeLabel};
use tracing::{debug, info};

use crate::bucket::Bucket;
use crate::error::{StoreError, StoreResult};

/// Registry of record types, owned by a store.
///
/// Types are immutable once registered. Each registration persists a
/// descriptor record into the store's types bucket; [`load_from`] rebuilds
/// the registry from that bucket when the store is reopened.
///
/// [`load_from`]: Self::load_from
#[derive(Default)]
pub struct TypeFactory {
    types: RwLock<HashMap<String, Arc<TypeLabel>>>,
}

impl TypeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `source`, persist its descriptor into `types_bucket`, and
    /// register it under `name`.
    pub fn create_type(
        &self,
        source: &str,
        name: &str,
        types_bucket: &dyn Bucket,
    ) -> StoreResult<Arc<TypeLabel>> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidName {
                name: name.to_string(),
                reason: "type name is empty".into(),
            });
        }
        let labels = TypeLabel::parse_descriptor(source)?;

        // Held across the descriptor write so two registrations of the same
        // name cannot both persist a descriptor.
        let mut types = self.types.write().expect("type registry poisoned");
        if types.contains_key(name) {
            return Err(StoreError::TypeAlreadyRegistered(name.to_string()));
        }
        let mut record = TypeLabel::descriptor_record(name, &labels);
        let descriptor = types_bucket.make_persistent(&mut record)?;
        let label = Arc::new(TypeLabel::new(name, descriptor, labels));
        types.insert(name.to_string(), Arc::clone(&label));

        info!(type_name = name, %descriptor, labels = label.labels().len(), "type registered");
        Ok(label)
    }

    /// The type registered under `name`, if any.
    pub fn type_with_name(&self, name: &str) -> Option<Arc<TypeLabel>> {
        self.types
            .read()
            .expect("type registry poisoned")
            .get(name)
            .cloned()
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .read()
            .expect("type registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.types.read().expect("type registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every descriptor record found in `bucket`. Returns the
    /// number of types loaded.
    pub fn load_from(&self, bucket: &dyn Bucket) -> StoreResult<usize> {
        let mut loaded = 0;
        for oid in bucket.oids()? {
            let record = bucket.get_object_by_id(oid)?;
            if !record.contains_label(DESCRIPTOR_NAME_LABEL) {
                continue;
            }
            let label = TypeLabel::from_descriptor_record(&record)?;
            let name = label.name().to_string();
            let mut types = self.types.write().expect("type registry poisoned");
            if types.contains_key(&name) {
                return Err(StoreError::corrupt(
                    bucket.path(),
                    format!("type {name} is described twice"),
                ));
            }
            types.insert(name, Arc::new(label));
            loaded += 1;
        }
        debug!(bucket = %bucket.id(), loaded, "types loaded");
        Ok(loaded)
    }

    /// Check a record against its type. Untyped records always pass.
    ///
    /// A typed record fails if its type is not registered, if it points at a
    /// different descriptor than the registered one, or if it lacks any
    /// label the descriptor requires.
    pub fn validate(&self, record: &Lxp) -> StoreResult<()> {
        let Some(type_ref) = record.get_type() else {
            return Ok(());
        };
        let type_name = type_ref.name();
        let Some(label) = self.type_with_name(type_name) else {
            return Err(StoreError::TypeValidation {
                type_name: type_name.to_string(),
                reason: "type is not registered".into(),
            });
        };
        if label.descriptor() != type_ref.descriptor() {
            return Err(StoreError::TypeValidation {
                type_name: type_name.to_string(),
                reason: format!(
                    "record references descriptor {}, registered descriptor is {}",
                    type_ref.descriptor(),
                    label.descriptor()
                ),
            });
        }
        let missing = label.missing_labels(record);
        if !missing.is_empty() {
            return Err(StoreError::TypeValidation {
                type_name: type_name.to_string(),
                reason: format!("missing labels: {}", missing.join(", ")),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for TypeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeFactory")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::test_support::context;
    use crate::bucket::{create_bucket, BucketHandle, BucketKind};
    use lxp_types::{Oid, TypeRef};

    fn types_bucket(dir: &std::path::Path) -> BucketHandle {
        let ctx = context(dir);
        create_bucket("_store", "types", &dir.join("types"), BucketKind::Directory, &ctx).unwrap()
    }

    #[test]
    fn create_persists_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = types_bucket(dir.path());
        let factory = TypeFactory::new();
        let person = factory
            .create_type(r#"["age", "address"]"#, "person", bucket.as_ref())
            .unwrap();
        assert_eq!(person.labels(), ["age", "address"]);

        let stored = bucket.get_object_by_id(person.descriptor()).unwrap();
        assert_eq!(TypeLabel::from_descriptor_record(&stored).unwrap(), *person);
        assert_eq!(factory.type_with_name("person").unwrap(), person);
        assert!(factory.type_with_name("car").is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = types_bucket(dir.path());
        let factory = TypeFactory::new();
        factory.create_type("[]", "t", bucket.as_ref()).unwrap();
        assert!(matches!(
            factory.create_type(r#"["x"]"#, "t", bucket.as_ref()),
            Err(StoreError::TypeAlreadyRegistered(_))
        ));
        assert_eq!(bucket.len().unwrap(), 1);
    }

    #[test]
    fn bad_descriptor_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = types_bucket(dir.path());
        let factory = TypeFactory::new();
        assert!(matches!(
            factory.create_type("not json", "t", bucket.as_ref()),
            Err(StoreError::Record(_))
        ));
        assert!(bucket.is_empty().unwrap());
        assert!(factory.is_empty());
    }

    #[test]
    fn validate_reports_missing_labels() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = types_bucket(dir.path());
        let factory = TypeFactory::new();
        let person = factory
            .create_type(r#"["age", "address"]"#, "person", bucket.as_ref())
            .unwrap();

        let mut record = person.new_record().with("age", "42");
        match factory.validate(&record) {
            Err(StoreError::TypeValidation { type_name, reason }) => {
                assert_eq!(type_name, "person");
                assert_eq!(reason, "missing labels: address");
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        record.put("address", "home");
        factory.validate(&record).unwrap();
        factory.validate(&Lxp::new().with("free", "form")).unwrap();
    }

    #[test]
    fn validate_rejects_unknown_and_stale_types() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = types_bucket(dir.path());
        let factory = TypeFactory::new();
        let t = factory.create_type("[]", "t", bucket.as_ref()).unwrap();

        let unknown = Lxp::typed(TypeRef::new("ghost", Oid::new(1)));
        assert!(matches!(
            factory.validate(&unknown),
            Err(StoreError::TypeValidation { .. })
        ));
        let stale = Lxp::typed(TypeRef::new("t", Oid::new(t.descriptor().as_u64() + 100)));
        assert!(matches!(
            factory.validate(&stale),
            Err(StoreError::TypeValidation { .. })
        ));
    }

    #[test]
    fn load_rebuilds_registry() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = types_bucket(dir.path());
        let first = TypeFactory::new();
        first.create_type(r#"["a"]"#, "one", bucket.as_ref()).unwrap();
        first.create_type(r#"["b", "c"]"#, "two", bucket.as_ref()).unwrap();

        let second = TypeFactory::new();
        assert_eq!(second.load_from(bucket.as_ref()).unwrap(), 2);
        assert_eq!(second.type_names(), vec!["one", "two"]);
        assert_eq!(second.type_with_name("two"), first.type_with_name("two"));
    }
}
