//! Grid arithmetic for the 100x100 dungeon.

use crate::{DUNGEON_SIZE_X, DUNGEON_SIZE_Y, VISION_RANGE};
use std::fmt;

pub const MOVE_STEP: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North = 0,
    South = 1,
    East = 2,
    West = 3,
}

impl Direction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::North),
            1 => Some(Direction::South),
            2 => Some(Direction::East),
            3 => Some(Direction::West),
            _ => None,
        }
    }

    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "north" => Some(Direction::North),
            "south" => Some(Direction::South),
            "east" => Some(Direction::East),
            "west" => Some(Direction::West),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub x: u8,
    pub y: u8,
}

impl Location {
    pub fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    /// One move step; leaving an edge wraps to the opposite side.
    pub fn step(self, direction: Direction) -> Location {
        let wrap = |value: u8, delta: i16, size: u8| -> u8 {
            (value as i16 + delta).rem_euclid(size as i16) as u8
        };
        let step = MOVE_STEP as i16;
        match direction {
            Direction::North => Location::new(self.x, wrap(self.y, -step, DUNGEON_SIZE_Y)),
            Direction::South => Location::new(self.x, wrap(self.y, step, DUNGEON_SIZE_Y)),
            Direction::East => Location::new(wrap(self.x, step, DUNGEON_SIZE_X), self.y),
            Direction::West => Location::new(wrap(self.x, -step, DUNGEON_SIZE_X), self.y),
        }
    }

    pub fn sees(self, other: Location) -> bool {
        self.x.abs_diff(other.x) <= VISION_RANGE && self.y.abs_diff(other.y) <= VISION_RANGE
    }
}

/// Inclusive rectangle of the grid owned by one area server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub min_x: u8,
    pub max_x: u8,
    pub min_y: u8,
    pub max_y: u8,
}

impl Area {
    pub const WHOLE: Area = Area {
        min_x: 0,
        max_x: DUNGEON_SIZE_X - 1,
        min_y: 0,
        max_y: DUNGEON_SIZE_Y - 1,
    };

    pub fn contains(&self, location: Location) -> bool {
        (self.min_x..=self.max_x).contains(&location.x)
            && (self.min_y..=self.max_y).contains(&location.y)
    }

    /// Vision is clipped to the area both players are standing in.
    pub fn in_vision(&self, viewer: Location, other: Location) -> bool {
        self.contains(viewer) && self.contains(other) && viewer.sees(other)
    }

    /// Edges of the area that fall inside the viewer's vision range.
    pub fn visible_edges(&self, viewer: Location) -> Vec<Boundary> {
        let range = VISION_RANGE as i16;
        let (x, y) = (viewer.x as i16, viewer.y as i16);
        let mut edges = Vec::new();
        if x + range > self.max_x as i16 {
            edges.push(Boundary::X(self.max_x));
        }
        if x - range < self.min_x as i16 {
            edges.push(Boundary::X(self.min_x));
        }
        if y + range > self.max_y as i16 {
            edges.push(Boundary::Y(self.max_y));
        }
        if y - range < self.min_y as i16 {
            edges.push(Boundary::Y(self.min_y));
        }
        edges
    }

    pub fn is_valid(&self) -> bool {
        self.min_x <= self.max_x
            && self.min_y <= self.max_y
            && self.max_x < DUNGEON_SIZE_X
            && self.max_y < DUNGEON_SIZE_Y
    }
}

impl Default for Area {
    fn default() -> Self {
        Area::WHOLE
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x {}..={} y {}..={}",
            self.min_x, self.max_x, self.min_y, self.max_y
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    X(u8),
    Y(u8),
}

/// Text map of the grid, `O` for an occupied cell.
pub fn render_map(occupied: impl IntoIterator<Item = Location>) -> String {
    let mut grid = vec![vec![b'-'; DUNGEON_SIZE_X as usize]; DUNGEON_SIZE_Y as usize];
    for location in occupied {
        grid[location.y as usize][location.x as usize] = b'O';
    }
    let mut out = String::with_capacity(grid.len() * (DUNGEON_SIZE_X as usize + 3));
    for row in grid {
        out.push('+');
        out.extend(row.into_iter().map(char::from));
        out.push_str("+\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_codes() {
        assert_eq!(Direction::from_u8(0), Some(Direction::North));
        assert_eq!(Direction::from_u8(3), Some(Direction::West));
        assert_eq!(Direction::from_u8(4), None);
        assert_eq!(Direction::parse("east"), Some(Direction::East));
        assert_eq!(Direction::parse("up"), None);
    }

    #[test]
    fn test_step_wraps_at_edges() {
        let corner = Location::new(1, 98);
        assert_eq!(corner.step(Direction::West), Location::new(98, 98));
        assert_eq!(corner.step(Direction::South), Location::new(1, 1));
        assert_eq!(corner.step(Direction::North), Location::new(1, 95));
        assert_eq!(corner.step(Direction::East), Location::new(4, 98));
    }

    #[test]
    fn test_vision_inside_area() {
        let area = Area {
            min_x: 0,
            max_x: 49,
            min_y: 0,
            max_y: 99,
        };
        let me = Location::new(45, 10);
        assert!(area.in_vision(me, Location::new(49, 15)));
        assert!(!area.in_vision(me, Location::new(50, 10)));
        assert!(!area.in_vision(me, Location::new(40, 16)));
    }

    #[test]
    fn test_visible_edges() {
        let area = Area {
            min_x: 50,
            max_x: 99,
            min_y: 0,
            max_y: 99,
        };
        let edges = area.visible_edges(Location::new(52, 50));
        assert_eq!(edges, vec![Boundary::X(50)]);
        assert!(area.visible_edges(Location::new(70, 50)).is_empty());
    }

    #[test]
    fn test_render_map_marks_players() {
        let map = render_map(vec![Location::new(0, 0), Location::new(99, 99)]);
        let rows: Vec<&str> = map.lines().collect();
        assert_eq!(rows.len(), 100);
        assert!(rows[0].starts_with("+O-"));
        assert!(rows[99].ends_with("-O+"));
    }
}
