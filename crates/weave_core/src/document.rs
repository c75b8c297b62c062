//! Entity documents — the read-only walk handed to serialization
//! collaborators.
//!
//! The walk groups an entity's occupied slots by owning system and merges
//! each component's own flat document with its class name. The store has
//! no opinion on what happens to the document afterwards.

use serde_json::{Map, Value, json};

use weave_component::Entity;

use crate::registry::{Registry, SystemId};

impl Registry {
    /// Build the nested document describing `entity`: a `type`/`entityId`
    /// header plus a `data` object keyed by system id, each system object
    /// keyed by slot index with the component's
    /// [`document()`](weave_component::ComponentData::document) output and
    /// its `class` name, alongside the system's `sysClass` name. Systems
    /// with no occupants are omitted.
    #[must_use]
    pub fn entity_document(&self, entity: &Entity) -> Value {
        let mut data = Map::new();
        for (system, slot, component) in entity.occupied() {
            let entry = data.entry(system.to_string()).or_insert_with(|| {
                let mut system_doc = Map::new();
                if let Ok(name) = self.system_name(SystemId(system as u32)) {
                    system_doc.insert("sysClass".to_string(), Value::String(name));
                }
                Value::Object(system_doc)
            });
            if let Value::Object(system_doc) = entry {
                let mut component_doc = component.document();
                if let Value::Object(fields) = &mut component_doc {
                    fields.insert(
                        "class".to_string(),
                        Value::String(self.type_name_of(component.tag()).to_string()),
                    );
                }
                system_doc.insert(slot.to_string(), component_doc);
            }
        }
        json!({
            "type": "Entity",
            "entityId": entity.id(),
            "data": Value::Object(data),
        })
    }
}
