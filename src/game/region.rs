//! Spatial index
//!
//! The world plane is split into 64x64 regions. Each region owns the set of
//! entity ids located inside it; entities keep only the coordinates of their
//! region as a lookup convenience. Regions are created the first time they
//! are referenced and are never removed.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::error::WorldError;
use crate::game::entity::{EntityCore, EntityId};
use crate::game::position::{Position, RegionCoordinates};

/// One cell of the spatial index
#[derive(Debug, Clone)]
pub struct Region {
    coordinates: RegionCoordinates,
    entities: HashSet<EntityId>,
}

impl Region {
    fn new(coordinates: RegionCoordinates) -> Self {
        Self {
            coordinates,
            entities: HashSet::new(),
        }
    }

    pub fn coordinates(&self) -> RegionCoordinates {
        self.coordinates
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.iter().copied()
    }
}

/// Sparse map of regions keyed by coordinates
#[derive(Debug, Default)]
pub struct RegionIndex {
    regions: HashMap<RegionCoordinates, Region>,
}

impl RegionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Region at `coordinates`, created on first use
    pub fn region_for(&mut self, coordinates: RegionCoordinates) -> &mut Region {
        self.regions
            .entry(coordinates)
            .or_insert_with(|| Region::new(coordinates))
    }

    /// Region at `coordinates` if it has ever been referenced
    pub fn region(&self, coordinates: RegionCoordinates) -> Option<&Region> {
        self.regions.get(&coordinates)
    }

    /// Number of regions created so far
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Place `entity` at `position`.
    ///
    /// A move inside the current region only updates the position. Otherwise
    /// the entity leaves its old region before joining the new one, and the
    /// entity's recorded region is updated in the same call.
    pub fn place(&mut self, entity: &mut EntityCore, position: Position) -> Result<(), WorldError> {
        let id = entity.id();
        let target = position.region_coordinates();

        if let Some(current) = entity.region() {
            if current == target {
                entity.set_placement(position, Some(current));
                return Ok(());
            }
            self.remove(id, current)?;
        }

        if !self.region_for(target).entities.insert(id) {
            return Err(WorldError::DuplicatePlacement {
                entity: id,
                region: target,
            });
        }
        entity.set_placement(position, Some(target));
        trace!(entity = %id, region = %target, "Entity placed");
        Ok(())
    }

    /// Remove `entity` from its region; a no-op for unplaced entities
    pub fn evict(&mut self, entity: &mut EntityCore) -> Result<(), WorldError> {
        if let Some(current) = entity.region() {
            self.remove(entity.id(), current)?;
            entity.clear_region();
            trace!(entity = %entity.id(), region = %current, "Entity evicted");
        }
        Ok(())
    }

    fn remove(&mut self, id: EntityId, recorded: RegionCoordinates) -> Result<(), WorldError> {
        let removed = self
            .regions
            .get_mut(&recorded)
            .is_some_and(|region| region.entities.remove(&id));
        if removed {
            Ok(())
        } else {
            Err(WorldError::RegionMismatch {
                entity: id,
                recorded: Some(recorded),
                actual: self.locate(id),
            })
        }
    }

    /// Scan for the region holding `id`. Only used for diagnostics.
    pub fn locate(&self, id: EntityId) -> Option<RegionCoordinates> {
        self.regions
            .values()
            .find(|region| region.contains(id))
            .map(Region::coordinates)
    }

    /// Entity ids in the 3x3 block of regions centred on `center`
    pub fn surrounding(&self, center: RegionCoordinates) -> impl Iterator<Item = EntityId> + '_ {
        center
            .surrounding()
            .filter_map(move |coords| self.regions.get(&coords))
            .flat_map(Region::entities)
    }

    /// Check that `entity`'s recorded region matches both its position and the index
    pub fn verify(&self, entity: &EntityCore) -> Result<(), WorldError> {
        let recorded = entity.region();
        let actual = self.locate(entity.id());
        let derived = entity.position().map(|p| p.region_coordinates());

        let consistent = match recorded {
            Some(region) => derived == Some(region) && actual == Some(region),
            None => actual.is_none(),
        };
        if consistent {
            Ok(())
        } else {
            Err(WorldError::RegionMismatch {
                entity: entity.id(),
                recorded,
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: i32, y: i32) -> Position {
        Position::new(x, y, 0).unwrap()
    }

    #[test]
    fn test_region_for_is_lazy_and_idempotent() {
        let mut index = RegionIndex::new();
        assert!(index.is_empty());
        let coords = RegionCoordinates::new(50, 50);
        index.region_for(coords);
        index.region_for(coords);
        assert_eq!(index.len(), 1);
        assert_eq!(index.region(coords).unwrap().coordinates(), coords);
    }

    #[test]
    fn test_place_and_evict() {
        let mut index = RegionIndex::new();
        let mut entity = EntityCore::new(EntityId::npc(1));

        index.place(&mut entity, pos(3222, 3222)).unwrap();
        let coords = pos(3222, 3222).region_coordinates();
        assert_eq!(entity.region(), Some(coords));
        assert!(index.region(coords).unwrap().contains(entity.id()));
        index.verify(&entity).unwrap();

        index.evict(&mut entity).unwrap();
        assert_eq!(entity.region(), None);
        assert!(index.region(coords).unwrap().is_empty());
        index.verify(&entity).unwrap();

        // evicting again is a no-op
        index.evict(&mut entity).unwrap();
    }

    #[test]
    fn test_same_region_move_keeps_cardinality() {
        let mut index = RegionIndex::new();
        let mut a = EntityCore::new(EntityId::player(1));
        let mut b = EntityCore::new(EntityId::player(2));
        index.place(&mut a, pos(3200, 3200)).unwrap();
        index.place(&mut b, pos(3210, 3210)).unwrap();
        let coords = pos(3200, 3200).region_coordinates();
        assert_eq!(index.region(coords).unwrap().len(), 2);

        for step in 1..20 {
            index.place(&mut a, pos(3200 + step, 3200)).unwrap();
            assert_eq!(index.region(coords).unwrap().len(), 2);
            index.verify(&a).unwrap();
        }
        assert_eq!(a.position(), Some(pos(3219, 3200)));
    }

    #[test]
    fn test_entity_is_in_exactly_one_region() {
        let mut index = RegionIndex::new();
        let mut entity = EntityCore::new(EntityId::player(7));
        for (x, y) in [(10, 10), (70, 10), (70, 70), (200, 3000), (201, 3000)] {
            index.place(&mut entity, pos(x, y)).unwrap();
            let holders = index
                .regions
                .values()
                .filter(|region| region.contains(entity.id()))
                .count();
            assert_eq!(holders, 1);
            index.verify(&entity).unwrap();
        }
    }

    #[test]
    fn test_duplicate_placement_is_rejected() {
        let mut index = RegionIndex::new();
        let mut first = EntityCore::new(EntityId::npc(4));
        let mut clone = EntityCore::new(EntityId::npc(4));
        index.place(&mut first, pos(100, 100)).unwrap();

        let err = index.place(&mut clone, pos(101, 100)).unwrap_err();
        assert!(matches!(err, WorldError::DuplicatePlacement { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_surrounding_collects_neighbours() {
        let mut index = RegionIndex::new();
        let mut near = EntityCore::new(EntityId::npc(1));
        let mut adjacent = EntityCore::new(EntityId::npc(2));
        let mut far = EntityCore::new(EntityId::npc(3));
        index.place(&mut near, pos(3200, 3200)).unwrap();
        index.place(&mut adjacent, pos(3264, 3264)).unwrap();
        index.place(&mut far, pos(3400, 3200)).unwrap();

        let mut seen: Vec<_> = index
            .surrounding(pos(3200, 3200).region_coordinates())
            .collect();
        seen.sort();
        assert_eq!(seen, vec![EntityId::npc(1), EntityId::npc(2)]);
    }
}
