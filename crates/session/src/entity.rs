//! Entity handles
//!
//! A session tracks entities by identity, never by value: two equal but
//! distinct instances are two entities. [`Tracked`] is the shared handle the
//! application and the session both hold; its allocation address is the
//! identity used as the tracking key.

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Value};

use docstore_core::{DocStoreError, DocStoreResult, Document};

/// Shared handle to an entity
///
/// Clones refer to the same entity. Mutate through [`Tracked::borrow_mut`];
/// the session picks the changes up by diffing at save time.
pub struct Tracked<T>(Rc<RefCell<T>>);

impl<T> Tracked<T> {
    /// Wrap a new, transient entity
    pub fn new(entity: T) -> Self {
        Tracked(Rc::new(RefCell::new(entity)))
    }

    /// Shared access to the entity
    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    /// Exclusive access to the entity
    ///
    /// Release the borrow before calling back into the session.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    /// True when both handles refer to the same entity
    pub fn ptr_eq(&self, other: &Tracked<T>) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn entity_id(&self) -> EntityId {
        EntityId(Rc::as_ptr(&self.0) as *const () as usize)
    }
}

impl<T: Document> Tracked<T> {
    pub(crate) fn erased(&self) -> Rc<dyn ErasedEntity> {
        self.0.clone()
    }

    pub(crate) fn from_erased(entity: Rc<dyn ErasedEntity>) -> Option<Tracked<T>> {
        entity.into_any().downcast::<RefCell<T>>().ok().map(Tracked)
    }
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Tracked(Rc::clone(&self.0))
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tracked").field(&self.0.borrow()).finish()
    }
}

/// Reference identity of a tracked entity
///
/// Stable for as long as the session holds the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EntityId(usize);

/// Type-erased view the identity map keeps of an entity
pub(crate) trait ErasedEntity {
    /// Serialized body
    fn to_json(&self) -> DocStoreResult<Map<String, Value>>;

    /// Identifier the entity reports for itself
    fn document_id(&self) -> Option<String>;

    fn set_document_id(&self, id: &str);

    /// Overwrite the entity in place from a stored body
    fn replace_from_json(&self, key: &str, data: &Map<String, Value>) -> DocStoreResult<()>;

    fn type_name(&self) -> &'static str;

    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: Document> ErasedEntity for RefCell<T> {
    fn to_json(&self) -> DocStoreResult<Map<String, Value>> {
        match serde_json::to_value(&*self.borrow())? {
            Value::Object(map) => Ok(map),
            other => Err(DocStoreError::invalid_input(format!(
                "{} must serialize to a JSON object, got {}",
                std::any::type_name::<T>(),
                other
            ))),
        }
    }

    fn document_id(&self) -> Option<String> {
        self.borrow().id().map(str::to_string)
    }

    fn set_document_id(&self, id: &str) {
        self.borrow_mut().set_id(id);
    }

    fn replace_from_json(&self, key: &str, data: &Map<String, Value>) -> DocStoreResult<()> {
        let fresh = materialize::<T>(key, data)?;
        *self.borrow_mut() = fresh;
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Build an entity from a stored body and give it `key` as identifier
pub(crate) fn materialize<T: Document>(key: &str, data: &Map<String, Value>) -> DocStoreResult<T> {
    let mut entity: T = serde_json::from_value(Value::Object(data.clone()))?;
    entity.set_id(key);
    Ok(entity)
}

/// Stored properties the entity's serialized form does not produce
///
/// They are merged back into every put so a type that only knows some of a
/// document's fields does not drop the rest on re-save.
pub(crate) fn extra_fields(
    stored: &Map<String, Value>,
    serialized: &Map<String, Value>,
) -> Map<String, Value> {
    stored
        .iter()
        .filter(|(name, _)| !serialized.contains_key(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Serialized form with remembered extra fields merged in
pub(crate) fn with_extras(
    mut serialized: Map<String, Value>,
    extras: &Map<String, Value>,
) -> Map<String, Value> {
    for (name, value) in extras {
        if !serialized.contains_key(name) {
            serialized.insert(name.clone(), value.clone());
        }
    }
    serialized
}
