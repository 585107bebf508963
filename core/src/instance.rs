//! Default instance data of one active frame.

use crate::handle::{InstanceIndex, StateIndex};
use crate::value::{StructType, StructValue};
use std::sync::Arc;

/// Instance blocks, parameters and per-state parameter blocks of one frame.
///
/// Slots are addressed by the index baked into the definition. A slot holds a
/// value for the whole frame lifetime; activation only resets it to defaults.
/// While a node is being called its own block is taken out of the storage and
/// reads of it through [`InstanceStorage::get`] return `None`.
#[derive(Debug, Clone)]
pub struct InstanceStorage {
    instances: Vec<Option<StructValue>>,
    active: Vec<bool>,
    parameters: StructValue,
    state_parameters: Vec<Option<StructValue>>,
}

impl InstanceStorage {
    pub fn new(
        instance_types: &[Arc<StructType>],
        parameters: StructValue,
        state_parameters: Vec<Option<StructValue>>,
    ) -> Self {
        InstanceStorage {
            instances: instance_types
                .iter()
                .map(|ty| Some(StructValue::new(ty)))
                .collect(),
            active: vec![false; instance_types.len()],
            parameters,
            state_parameters,
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Resets a slot to its declared defaults and marks it active.
    ///
    /// Returns false, leaving the data untouched, if the slot is already active.
    pub fn activate(&mut self, index: InstanceIndex) -> bool {
        let i = index.index();
        match self.active.get(i) {
            Some(false) => {}
            Some(true) => return false,
            None => return false,
        }
        if let Some(Some(value)) = self.instances.get_mut(i) {
            value.reset_to_defaults();
        }
        self.active[i] = true;
        true
    }

    pub fn deactivate(&mut self, index: InstanceIndex) {
        if let Some(active) = self.active.get_mut(index.index()) {
            *active = false;
        }
    }

    pub fn is_active(&self, index: InstanceIndex) -> bool {
        self.active.get(index.index()).copied().unwrap_or(false)
    }

    pub fn get(&self, index: InstanceIndex) -> Option<&StructValue> {
        self.instances.get(index.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: InstanceIndex) -> Option<&mut StructValue> {
        self.instances.get_mut(index.index()).and_then(Option::as_mut)
    }

    /// Takes a block out for the duration of a node call.
    pub fn take(&mut self, index: InstanceIndex) -> Option<StructValue> {
        self.instances.get_mut(index.index()).and_then(Option::take)
    }

    pub fn restore(&mut self, index: InstanceIndex, value: StructValue) {
        if let Some(slot) = self.instances.get_mut(index.index()) {
            *slot = Some(value);
        }
    }

    pub fn parameters(&self) -> &StructValue {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut StructValue {
        &mut self.parameters
    }

    pub fn state_parameters(&self, state: StateIndex) -> Option<&StructValue> {
        self.state_parameters.get(state.index()).and_then(Option::as_ref)
    }

    pub fn state_parameters_mut(&mut self, state: StateIndex) -> Option<&mut StructValue> {
        self.state_parameters
            .get_mut(state.index())
            .and_then(Option::as_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FieldDesc, ValueType};

    fn storage() -> InstanceStorage {
        let counter = StructType::new("Counter", vec![FieldDesc::new("Count", ValueType::Int)]);
        let params = StructType::new("Params", vec![]);
        InstanceStorage::new(&[counter.clone(), counter], StructValue::new(&params), vec![None])
    }

    #[test]
    fn test_activate_resets_and_refuses_double_activation() {
        let mut storage = storage();
        let slot = InstanceIndex(1);
        assert!(storage.activate(slot));
        storage.get_mut(slot).unwrap().set_int("Count", 4);

        assert!(!storage.activate(slot));
        assert_eq!(storage.get(slot).unwrap().int("Count"), Some(4));

        storage.deactivate(slot);
        assert!(storage.activate(slot));
        assert_eq!(storage.get(slot).unwrap().int("Count"), Some(0));
    }

    #[test]
    fn test_taken_block_is_invisible_until_restored() {
        let mut storage = storage();
        let slot = InstanceIndex(0);
        let mut value = storage.take(slot).unwrap();
        assert!(storage.get(slot).is_none());
        value.set_int("Count", 9);
        storage.restore(slot, value);
        assert_eq!(storage.get(slot).unwrap().int("Count"), Some(9));
    }
}
