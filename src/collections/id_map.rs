// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::rand::{
    rngs::SmallRng,
    RngCore,
    SeedableRng,
};
use ::std::{
    collections::HashMap,
    hash::Hash,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Pre-allocated capacity for the id table.
const DEFAULT_SIZE: usize = 1024;

/// Seed for the random number generator used to generate external ids.
/// This value was chosen arbitrarily.
const SCHEDULER_SEED: u64 = 42;
const MAX_RETRIES_ID_ALLOC: usize = 500;

//======================================================================================================================
// Structures
//======================================================================================================================

/// This data structure is a general-purpose map for obfuscating ids from external modules. It takes an external id type
/// and an internal id type and translates between the two. The ID types must be basic types that can be converted back
/// and forth between u64 and therefore each other.
pub struct IdMap<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: From<u64> + Into<u64> + Copy> {
    /// Map between external and internal ids.
    ids: HashMap<E, I>,
    /// Small random number generator for external ids.
    rng: SmallRng,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: From<u64> + Into<u64> + Copy> IdMap<E, I> {
    /// Retrieve the mapping for this external id if it exists.
    pub fn get(&self, external_id: &E) -> Option<I> {
        self.ids.get(external_id).copied()
    }

    /// Remove the mapping for this external id. If the mapping exists, return the internal id mapped to it.
    pub fn remove(&mut self, external_id: &E) -> Option<I> {
        self.ids.remove(external_id)
    }

    /// Generate a new external id and insert the mapping to the internal id. If the generated id is currently in use,
    /// keep generating until we find an unused id (up to a maximum number of tries).
    pub fn insert_with_new_id(&mut self, internal_id: I) -> E {
        for _ in 0..MAX_RETRIES_ID_ALLOC {
            let external_id: E = E::from(self.rng.next_u64());
            if !self.ids.contains_key(&external_id) {
                self.ids.insert(external_id, internal_id);
                return external_id;
            }
        }
        panic!("Could not find a valid task id");
    }

    /// Number of live mappings.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// A default implementation for the external to internal id map.
impl<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: From<u64> + Into<u64> + Copy> Default for IdMap<E, I> {
    fn default() -> Self {
        Self {
            ids: HashMap::<E, I>::with_capacity(DEFAULT_SIZE),
            rng: SmallRng::seed_from_u64(SCHEDULER_SEED),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::IdMap;
    use crate::scheduler::TaskId;
    use ::anyhow::Result;

    #[derive(Eq, PartialEq, Clone, Copy, Debug)]
    struct Offset(u64);

    impl From<u64> for Offset {
        fn from(value: u64) -> Self {
            Self(value)
        }
    }

    impl From<Offset> for u64 {
        fn from(value: Offset) -> Self {
            value.0
        }
    }

    #[test]
    fn generated_ids_are_unique() -> Result<()> {
        let mut ids: IdMap<TaskId, Offset> = IdMap::default();
        let first: TaskId = ids.insert_with_new_id(Offset(1));
        let second: TaskId = ids.insert_with_new_id(Offset(2));
        crate::ensure_neq!(first, second);
        crate::ensure_eq!(ids.get(&first), Some(Offset(1)));
        crate::ensure_eq!(ids.get(&second), Some(Offset(2)));
        Ok(())
    }

    #[test]
    fn remove_drops_the_mapping() -> Result<()> {
        let mut ids: IdMap<TaskId, Offset> = IdMap::default();
        let id: TaskId = ids.insert_with_new_id(Offset(7));
        crate::ensure_eq!(ids.remove(&id), Some(Offset(7)));
        crate::ensure_eq!(ids.get(&id), None);
        crate::ensure_eq!(ids.is_empty(), true);
        Ok(())
    }
}
