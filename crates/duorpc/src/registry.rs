//! # Service Registry
//!
//! Lookup indices derived from a `ServiceCatalog`.
//!
//! ## Philosophy
//!
//! - **Build once**: All validation happens in `from_catalog`; a registry that
//!   exists is consistent.
//! - **Read only**: No method takes `&mut self`, so one registry is shared by every
//!   connection behind an `Arc` without locking.

use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::ServiceCatalog;
use crate::catalog::ServiceDefinition;
use crate::catalog::ServiceId;
use crate::schema::TypeCatalog;

/// Registry construction errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Two services share the same numeric ID.
    DuplicateId(ServiceId),
    /// Two services of the same kind share a name.
    DuplicateName { kind: &'static str, name: String },
    /// A service references a schema that is not in the type catalog.
    UnknownType { service: String, type_name: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "duplicate service id {}", id.0),
            Self::DuplicateName { kind, name } => write!(f, "duplicate {} name '{}'", kind, name),
            Self::UnknownType { service, type_name } => {
                write!(f, "service '{}' references unknown type '{}'", service, type_name)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// O(1) lookup of services by wire ID and by name.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: Vec<Arc<ServiceDefinition>>,
    by_id: HashMap<ServiceId, Arc<ServiceDefinition>>,
    api_by_name: HashMap<String, Arc<ServiceDefinition>>,
    message_by_name: HashMap<String, Arc<ServiceDefinition>>,
}

impl ServiceRegistry {
    /// Builds the indices in one pass over the catalog.
    ///
    /// An API and a message may share a name; two services of the same kind may not.
    pub fn from_catalog(catalog: &ServiceCatalog) -> Result<Self> {
        let mut registry = Self {
            services: Vec::with_capacity(catalog.services.len()),
            by_id: HashMap::with_capacity(catalog.services.len()),
            api_by_name: HashMap::new(),
            message_by_name: HashMap::new(),
        };

        for def in &catalog.services {
            let def = Arc::new(def.clone());

            if registry.by_id.insert(def.id, def.clone()).is_some() {
                return Err(Error::DuplicateId(def.id));
            }

            let by_name = if def.is_api() {
                &mut registry.api_by_name
            } else {
                &mut registry.message_by_name
            };
            if by_name.insert(def.name.clone(), def.clone()).is_some() {
                return Err(Error::DuplicateName { kind: def.kind_label(), name: def.name.clone() });
            }

            registry.services.push(def);
        }

        Ok(registry)
    }

    /// Checks that every schema name referenced by a service exists in `types`.
    pub fn validate_types(&self, types: &TypeCatalog) -> Result<()> {
        for def in &self.services {
            for type_name in def.type_names() {
                if !types.contains(type_name) {
                    return Err(Error::UnknownType {
                        service: def.name.clone(),
                        type_name: type_name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn lookup_by_id(&self, id: ServiceId) -> Option<&Arc<ServiceDefinition>> {
        self.by_id.get(&id)
    }

    pub fn lookup_api_by_name(&self, name: &str) -> Option<&Arc<ServiceDefinition>> {
        self.api_by_name.get(name)
    }

    pub fn lookup_message_by_name(&self, name: &str) -> Option<&Arc<ServiceDefinition>> {
        self.message_by_name.get(name)
    }

    /// Services in catalog order.
    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceDefinition>> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
