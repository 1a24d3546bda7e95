//! # Module Registry
//!
//! The broker's view of the network: which modules are declared, which instances are
//! connected, and what services they offer.
//!
//! ## Invariants
//! - Service names are unique within a module instance.
//! - No two methods of a service share a name and parameter list.
//! - An instance is visible to lookups from `insert` until `remove`; its descriptor never
//!   changes in between, though services may be added.

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use dashmap::DashMap;

use sbwrpc::Fault;
use sbwrpc::FaultKind;
use sbwrpc::MethodDescriptor;
use sbwrpc::ModuleDescriptor;
use sbwrpc::ModuleId;
use sbwrpc::ModuleStatus;
use sbwrpc::Selector;
use sbwrpc::ServiceDescriptor;
use sbwrpc::Value;

/// A connected module instance.
#[derive(Debug, Clone)]
pub struct ModuleEntry {
    pub id: ModuleId,
    pub descriptor: ModuleDescriptor,
    pub services: Vec<ServiceDescriptor>,
}

impl ModuleEntry {
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Default)]
pub struct Registry {
    modules: DashMap<ModuleId, ModuleEntry>,
    declarations: RwLock<HashMap<String, ModuleDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    //  Declarations
    // ========================================================================

    /// Records how a module is started. A later declaration replaces an earlier one.
    pub fn declare(&self, descriptor: ModuleDescriptor) {
        let mut declarations = self.declarations.write().unwrap_or_else(PoisonError::into_inner);
        declarations.insert(descriptor.name.clone(), descriptor);
    }

    pub fn declaration(&self, name: &str) -> Option<ModuleDescriptor> {
        let declarations = self.declarations.read().unwrap_or_else(PoisonError::into_inner);
        declarations.get(name).cloned()
    }

    /// Forgets a declaration. Running instances are unaffected.
    pub fn undeclare(&self, name: &str) -> Option<ModuleDescriptor> {
        let mut declarations = self.declarations.write().unwrap_or_else(PoisonError::into_inner);
        declarations.remove(name)
    }

    /// All declarations, sorted by name.
    pub fn declarations(&self) -> Vec<ModuleDescriptor> {
        let declarations = self.declarations.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<ModuleDescriptor> = declarations.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Declarations, followed by running modules that were never declared when
    /// `include_running` is set. Each name appears once.
    pub fn modules(&self, include_running: bool) -> Vec<ModuleDescriptor> {
        let mut modules = self.declarations();
        if include_running {
            for id in self.ids() {
                if let Some(entry) = self.get(id) {
                    if !modules.iter().any(|m| m.name == entry.descriptor.name) {
                        modules.push(entry.descriptor);
                    }
                }
            }
        }
        modules
    }

    pub fn status(&self, name: &str) -> ModuleStatus {
        if self.find_running(name).is_some() {
            ModuleStatus::Running
        } else if self.declaration(name).is_some() {
            ModuleStatus::Registered
        } else {
            ModuleStatus::Unregistered
        }
    }

    // ========================================================================
    //  Instances
    // ========================================================================

    /// Adds a connected instance after validating its services.
    pub fn insert(
        &self,
        id: ModuleId,
        descriptor: ModuleDescriptor,
        services: Vec<ServiceDescriptor>,
    ) -> Result<(), Fault> {
        for (index, service) in services.iter().enumerate() {
            validate_service(service)?;
            if services[..index].iter().any(|s| s.name == service.name) {
                return Err(duplicate(format!("service `{}` of {}", service.name, descriptor.name)));
            }
        }
        if self.modules.contains_key(&id) {
            return Err(duplicate(format!("{}", id)));
        }
        self.modules.insert(id, ModuleEntry { id, descriptor, services });
        Ok(())
    }

    /// Adds a service to a connected instance.
    pub fn add_service(&self, id: ModuleId, service: ServiceDescriptor) -> Result<(), Fault> {
        validate_service(&service)?;
        let mut entry = self.modules.get_mut(&id).ok_or_else(|| module_not_found(id))?;
        if entry.service(&service.name).is_some() {
            return Err(duplicate(format!("service `{}` of {}", service.name, entry.descriptor.name)));
        }
        entry.services.push(service);
        Ok(())
    }

    pub fn remove(&self, id: ModuleId) -> Option<ModuleEntry> {
        self.modules.remove(&id).map(|(_, entry)| entry)
    }

    pub fn get(&self, id: ModuleId) -> Option<ModuleEntry> {
        self.modules.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.modules.contains_key(&id)
    }

    /// The oldest running instance of the named module.
    pub fn find_running(&self, name: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .filter(|e| e.descriptor.name == name)
            .map(|e| e.id)
            .min()
    }

    /// Ids of every registered instance, ascending.
    pub fn ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.modules.iter().map(|e| e.id).collect();
        ids.sort();
        ids
    }

    // ========================================================================
    //  Lookup
    // ========================================================================

    /// A service of a running instance.
    pub fn service(&self, id: ModuleId, service: &str) -> Result<ServiceDescriptor, Fault> {
        let entry = self.modules.get(&id).ok_or_else(|| module_not_found(id))?;
        entry.service(service).cloned().ok_or_else(|| {
            Fault::new(
                FaultKind::ServiceNotFound,
                format!("{} has no service `{}`", entry.descriptor.name, service),
            )
        })
    }

    /// Resolves a selector on a service of a running instance.
    pub fn resolve(&self, id: ModuleId, service: &str, selector: &str) -> Result<MethodDescriptor, Fault> {
        let descriptor = self.service(id, service)?;
        let selector = Selector::parse(selector)?;
        let index = selector.resolve(descriptor.signatures())?;
        Ok(descriptor.methods[index].clone())
    }

    /// Summaries of every service in `category`, or below it when `recursive`.
    pub fn find_services(&self, category: &str, recursive: bool) -> Vec<Value> {
        let mut entries: Vec<ModuleEntry> = self.modules.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);

        entries
            .iter()
            .flat_map(|entry| {
                entry
                    .services
                    .iter()
                    .filter(|s| s.in_category(category, recursive))
                    .map(|s| s.summary(entry.id, &entry.descriptor.name))
            })
            .collect()
    }

    /// The immediate subcategories of `parent`, sorted and without duplicates.
    pub fn categories(&self, parent: &str) -> Vec<String> {
        let parent = parent.trim_matches('/');
        let mut found: Vec<String> = self
            .modules
            .iter()
            .flat_map(|e| e.services.iter().map(|s| s.category.clone()).collect::<Vec<_>>())
            .filter_map(|category| {
                let category = category.trim_matches('/');
                let rest = if parent.is_empty() {
                    category
                } else {
                    category.strip_prefix(parent)?.strip_prefix('/')?
                };
                let child = rest.split('/').next()?;
                (!child.is_empty()).then(|| child.to_string())
            })
            .collect();
        found.sort();
        found.dedup();
        found
    }
}

/// Rejects services with two methods a full selector could not tell apart.
pub fn validate_service(service: &ServiceDescriptor) -> Result<(), Fault> {
    for (index, method) in service.methods.iter().enumerate() {
        if service.methods[..index].iter().any(|m| m.signature.same_shape(&method.signature)) {
            return Err(duplicate(format!("method `{}` of service `{}`", method.signature, service.name)));
        }
    }
    Ok(())
}

fn duplicate(what: String) -> Fault {
    Fault::new(FaultKind::DuplicateDefinition, format!("{} is already defined", what))
}

pub(crate) fn module_not_found(id: ModuleId) -> Fault {
    Fault::new(FaultKind::ModuleNotFound, format!("no module instance {}", id))
}
