// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named-slot value containers.
//!
//! The same contract carries method parameters, computation locals and
//! persisted service fields, so the runner and the storage layer can move
//! state around without knowing which kind of state it is.

use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised by slot access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    /// Slot index is past the end of the container.
    #[error("slot index {index} out of range (container has {count} slots)")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Number of slots in the container.
        count: usize,
    },

    /// No slot with the given name exists.
    #[error("no slot named '{0}'")]
    UnknownSlot(String),

    /// The value cannot be stored in or decoded from the slot.
    #[error("invalid value for slot '{slot}': {reason}")]
    InvalidValue {
        /// Slot name.
        slot: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Ordered name → value access shared by every kind of engine state.
pub trait ValueContainer: Send {
    /// Number of slots.
    fn count(&self) -> usize;

    /// Name of the slot at `index`.
    fn name(&self, index: usize) -> Option<&str>;

    /// Current value of the slot at `index`.
    fn get(&self, index: usize) -> Option<Value>;

    /// Overwrite the slot at `index`.
    fn set(&mut self, index: usize, value: Value) -> Result<(), SlotError>;

    /// Position of the slot called `name`.
    fn index_of(&self, name: &str) -> Option<usize> {
        (0..self.count()).find(|&i| self.name(i) == Some(name))
    }
}

/// Convenience operations available on every container.
pub trait ValueContainerExt: ValueContainer {
    /// Copy every slot into an owned [`NamedValues`].
    fn snapshot(&self) -> NamedValues {
        let mut out = NamedValues::with_capacity(self.count());
        for i in 0..self.count() {
            if let Some(name) = self.name(i) {
                out.push(name, self.get(i).unwrap_or(Value::Null));
            }
        }
        out
    }

    /// Assign values by slot name. Names the container does not have are
    /// skipped; returns how many slots were written.
    fn load_from(&mut self, source: &NamedValues) -> Result<usize, SlotError> {
        let mut written = 0;
        for (name, value) in source.iter() {
            if let Some(index) = self.index_of(name) {
                self.set(index, value.clone())?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Read a slot by name.
    fn get_by_name(&self, name: &str) -> Option<Value> {
        self.index_of(name).and_then(|i| self.get(i))
    }

    /// Write a slot by name.
    fn set_by_name(&mut self, name: &str, value: Value) -> Result<(), SlotError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| SlotError::UnknownSlot(name.to_string()))?;
        self.set(index, value)
    }
}

impl<T: ValueContainer + ?Sized> ValueContainerExt for T {}

/// Static slot layout registered alongside a routine method or service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSchema {
    names: Arc<[String]>,
}

impl SlotSchema {
    /// Build a schema from slot names in order.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// A schema with no slots.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Slot names in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the schema has no slots.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Concatenate two schemas.
    pub fn extend(&self, other: &SlotSchema) -> SlotSchema {
        SlotSchema::new(self.names.iter().chain(other.names.iter()).cloned())
    }

    /// Create a container with one null slot per name.
    pub fn create_container(&self) -> NamedValues {
        NamedValues {
            entries: self
                .names
                .iter()
                .map(|n| (n.clone(), Value::Null))
                .collect(),
        }
    }
}

/// Owned, ordered list of named values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamedValues {
    entries: Vec<(String, Value)>,
}

impl NamedValues {
    /// An empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty container with room for `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append a slot.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.entries.push((name.into(), value));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value.into());
        self
    }

    /// Iterate over `(name, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Borrow a value by name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Decode a value by name. A missing or null slot decodes to `None`.
    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, SlotError> {
        match self.value(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| SlotError::InvalidValue {
                    slot: name.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no slots.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ValueContainer for NamedValues {
    fn count(&self) -> usize {
        self.entries.len()
    }

    fn name(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(n, _)| n.as_str())
    }

    fn get(&self, index: usize) -> Option<Value> {
        self.entries.get(index).map(|(_, v)| v.clone())
    }

    fn set(&mut self, index: usize, value: Value) -> Result<(), SlotError> {
        let count = self.entries.len();
        let slot = self
            .entries
            .get_mut(index)
            .ok_or(SlotError::OutOfRange { index, count })?;
        slot.1 = value;
        Ok(())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for NamedValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Slot values shared between a service object and the engine.
///
/// A service keeps a clone and reads its fields through it while a routine
/// runs; the engine loads persisted values into it before the step and
/// snapshots it afterwards.
#[derive(Debug, Clone, Default)]
pub struct SharedValues {
    schema: SlotSchema,
    values: Arc<Mutex<Vec<Value>>>,
}

impl SharedValues {
    /// Create null-initialized shared slots for `schema`.
    pub fn new(schema: SlotSchema) -> Self {
        let values = vec![Value::Null; schema.len()];
        Self {
            schema,
            values: Arc::new(Mutex::new(values)),
        }
    }

    /// Slot layout.
    pub fn schema(&self) -> &SlotSchema {
        &self.schema
    }

    /// Decode a field by name. A null field decodes to `None`.
    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, SlotError> {
        match self.get_by_name(name) {
            None => Err(SlotError::UnknownSlot(name.to_string())),
            Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| SlotError::InvalidValue {
                    slot: name.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Encode and store a field by name. Takes `&self` because the slots
    /// are shared.
    pub fn store<T: Serialize>(&self, name: &str, value: &T) -> Result<(), SlotError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| SlotError::UnknownSlot(name.to_string()))?;
        let encoded = serde_json::to_value(value).map_err(|e| SlotError::InvalidValue {
            slot: name.to_string(),
            reason: e.to_string(),
        })?;
        self.values.lock().unwrap_or_else(PoisonError::into_inner)[index] = encoded;
        Ok(())
    }
}

impl ValueContainer for SharedValues {
    fn count(&self) -> usize {
        self.schema.len()
    }

    fn name(&self, index: usize) -> Option<&str> {
        self.schema.names().get(index).map(String::as_str)
    }

    fn get(&self, index: usize) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    fn set(&mut self, index: usize, value: Value) -> Result<(), SlotError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let count = values.len();
        let slot = values
            .get_mut(index)
            .ok_or(SlotError::OutOfRange { index, count })?;
        *slot = value;
        Ok(())
    }
}
