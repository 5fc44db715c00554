//! The replicated game field: a fixed-size grid of positioned entities.
//!
//! Every server holds one `Grid`. The master mutates it inside the commit
//! path of the replication protocol and replicas mirror it by applying the
//! same committed updates in the same order, so `apply` must be fully
//! deterministic: an update that is invalid on the master is equally invalid
//! on every replica.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::{Update, UpdateKind};

pub const GRID_WIDTH: u16 = 25;
pub const GRID_HEIGHT: u16 = 25;

/// A cell coordinate on the game field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: u16,
    pub y: u16,
}

impl Position {
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    pub fn in_bounds(&self) -> bool {
        self.x < GRID_WIDTH && self.y < GRID_HEIGHT
    }
}

/// A unit occupying one cell. The id matches the owning client's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: u32,
    pub hit_points: i32,
}

/// Result of applying an update to the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The grid changed.
    Applied,
    /// The update was invalid against the current state; nothing changed.
    Rejected,
    /// A query; carries the contents of the queried cell.
    Cell(Option<Entity>),
}

/// Mapping from occupied positions to the entities standing on them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    cells: HashMap<Position, Entity>,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_at(&self, pos: Position) -> Option<Entity> {
        self.cells.get(&pos).copied()
    }

    /// Position of the entity owned by `id`, if it is on the field.
    pub fn position_of(&self, id: u32) -> Option<Position> {
        self.cells
            .iter()
            .find(|(_, entity)| entity.id == id)
            .map(|(pos, _)| *pos)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Replaces the whole field with a snapshot received from the master.
    pub fn restore(&mut self, snapshot: Grid) {
        self.cells = snapshot.cells;
    }

    /// Applies a committed update. Deterministic: identical inputs on
    /// identical grids yield identical outcomes on every server.
    pub fn apply(&mut self, update: &Update) -> ApplyOutcome {
        let target = update.target;
        match update.kind {
            UpdateKind::Spawn => {
                if !target.in_bounds()
                    || update.value <= 0
                    || self.cells.contains_key(&target)
                    || self.position_of(update.origin).is_some()
                {
                    return ApplyOutcome::Rejected;
                }
                self.cells.insert(
                    target,
                    Entity {
                        id: update.origin,
                        hit_points: update.value,
                    },
                );
                ApplyOutcome::Applied
            }
            UpdateKind::Move => {
                let Some(from) = self.position_of(update.origin) else {
                    return ApplyOutcome::Rejected;
                };
                if !target.in_bounds() || self.cells.contains_key(&target) {
                    return ApplyOutcome::Rejected;
                }
                match self.cells.remove(&from) {
                    Some(entity) => {
                        self.cells.insert(target, entity);
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Rejected,
                }
            }
            UpdateKind::Damage => {
                if update.value <= 0 {
                    return ApplyOutcome::Rejected;
                }
                match self.cells.get_mut(&target) {
                    Some(entity) => {
                        entity.hit_points -= update.value;
                        if entity.hit_points <= 0 {
                            self.cells.remove(&target);
                        }
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Rejected,
                }
            }
            UpdateKind::Heal => {
                if update.value <= 0 {
                    return ApplyOutcome::Rejected;
                }
                match self.cells.get_mut(&target) {
                    Some(entity) => {
                        entity.hit_points += update.value;
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Rejected,
                }
            }
            UpdateKind::Remove => {
                if self.cells.remove(&target).is_some() {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Rejected
                }
            }
            UpdateKind::Query => ApplyOutcome::Cell(self.entity_at(target)),
        }
    }
}
