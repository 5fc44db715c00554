//! Bot behavior: decides the next update to submit based on the mirrored
//! grid state.

use rand::Rng;

use shared::{Grid, Position, Update, UpdateKind, GRID_HEIGHT, GRID_WIDTH};

/// A scripted player driving one unit.
pub struct Bot {
    client_id: u32,
    spawn_hit_points: i32,
    next_seq: u64,
}

impl Bot {
    pub fn new(client_id: u32, spawn_hit_points: i32) -> Self {
        Self {
            client_id,
            spawn_hit_points,
            next_seq: 1,
        }
    }

    /// Picks the next action against the mirrored state. Correlation ids
    /// increase monotonically, including for updates the server later
    /// rejects or aborts.
    pub fn next_update<R: Rng>(&mut self, grid: &Grid, rng: &mut R) -> Update {
        let seq = self.next_seq;
        self.next_seq += 1;

        let (kind, target, value) = match grid.position_of(self.client_id) {
            None => {
                let target = random_free_cell(grid, rng);
                (UpdateKind::Spawn, target, self.spawn_hit_points)
            }
            Some(position) => self.action_at(position, grid, rng),
        };

        Update {
            kind,
            target,
            value,
            seq,
            origin: self.client_id,
        }
    }

    fn action_at<R: Rng>(
        &self,
        position: Position,
        grid: &Grid,
        rng: &mut R,
    ) -> (UpdateKind, Position, i32) {
        match rng.gen_range(0..10) {
            // Mostly wander around.
            0..=5 => match random_adjacent_free_cell(position, grid, rng) {
                Some(target) => (UpdateKind::Move, target, 0),
                None => (UpdateKind::Query, position, 0),
            },
            6..=7 => {
                // Pick on somebody else when there is somebody else.
                let victim = random_other_entity(grid, self.client_id, rng);
                match victim {
                    Some(target) => (UpdateKind::Damage, target, 1 + rng.gen_range(0..3)),
                    None => (UpdateKind::Heal, position, 1),
                }
            }
            8 => (UpdateKind::Heal, position, 1 + rng.gen_range(0..2)),
            _ => {
                let target = Position::new(
                    rng.gen_range(0..GRID_WIDTH),
                    rng.gen_range(0..GRID_HEIGHT),
                );
                (UpdateKind::Query, target, 0)
            }
        }
    }
}

fn random_free_cell<R: Rng>(grid: &Grid, rng: &mut R) -> Position {
    loop {
        let candidate = Position::new(rng.gen_range(0..GRID_WIDTH), rng.gen_range(0..GRID_HEIGHT));
        if grid.entity_at(candidate).is_none() {
            return candidate;
        }
    }
}

fn random_adjacent_free_cell<R: Rng>(
    position: Position,
    grid: &Grid,
    rng: &mut R,
) -> Option<Position> {
    let mut candidates = Vec::with_capacity(4);
    if position.x > 0 {
        candidates.push(Position::new(position.x - 1, position.y));
    }
    if position.x + 1 < GRID_WIDTH {
        candidates.push(Position::new(position.x + 1, position.y));
    }
    if position.y > 0 {
        candidates.push(Position::new(position.x, position.y - 1));
    }
    if position.y + 1 < GRID_HEIGHT {
        candidates.push(Position::new(position.x, position.y + 1));
    }
    candidates.retain(|cell| grid.entity_at(*cell).is_none());
    if candidates.is_empty() {
        None
    } else {
        Some(candidates[rng.gen_range(0..candidates.len())])
    }
}

fn random_other_entity<R: Rng>(grid: &Grid, own_id: u32, rng: &mut R) -> Option<Position> {
    let others: Vec<Position> = (0..GRID_WIDTH)
        .flat_map(|x| (0..GRID_HEIGHT).map(move |y| Position::new(x, y)))
        .filter(|cell| {
            grid.entity_at(*cell)
                .map_or(false, |entity| entity.id != own_id)
        })
        .collect();
    if others.is_empty() {
        None
    } else {
        Some(others[rng.gen_range(0..others.len())])
    }
}
