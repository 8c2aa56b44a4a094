//! World coordinates
//!
//! `Position` is an immutable, validated tile coordinate. Construction rejects
//! anything outside the map, so every `Position` held by the simulation is
//! placeable. `RegionCoordinates` is the spatial index key derived from it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WorldError;

/// Region cells are 64x64 tiles.
pub const REGION_SHIFT: i32 = 6;

/// Side length of a region cell in tiles.
pub const REGION_SIZE: i32 = 1 << REGION_SHIFT;

/// Chebyshev distance within which another mob is visible.
pub const VIEW_DISTANCE: i32 = 15;

/// Largest valid x or y coordinate.
pub const MAX_COORDINATE: i32 = 16383;

/// Largest valid plane.
pub const MAX_PLANE: i32 = 3;

/// A tile coordinate on one of the four planes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPosition", into = "RawPosition")]
pub struct Position {
    x: i32,
    y: i32,
    plane: i32,
}

#[derive(Serialize, Deserialize)]
struct RawPosition {
    x: i32,
    y: i32,
    #[serde(default)]
    plane: i32,
}

impl TryFrom<RawPosition> for Position {
    type Error = WorldError;

    fn try_from(raw: RawPosition) -> Result<Self, Self::Error> {
        Position::new(raw.x, raw.y, raw.plane)
    }
}

impl From<Position> for RawPosition {
    fn from(pos: Position) -> Self {
        RawPosition {
            x: pos.x,
            y: pos.y,
            plane: pos.plane,
        }
    }
}

/// Where new players appear
pub const DEFAULT_SPAWN: Position = Position {
    x: 3222,
    y: 3218,
    plane: 0,
};

impl Position {
    /// Create a position, rejecting coordinates outside the map
    pub fn new(x: i32, y: i32, plane: i32) -> Result<Self, WorldError> {
        if !(0..=MAX_COORDINATE).contains(&x)
            || !(0..=MAX_COORDINATE).contains(&y)
            || !(0..=MAX_PLANE).contains(&plane)
        {
            return Err(WorldError::OutOfBounds { x, y, plane });
        }
        Ok(Self { x, y, plane })
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn plane(&self) -> i32 {
        self.plane
    }

    /// The region cell containing this position
    pub fn region_coordinates(&self) -> RegionCoordinates {
        RegionCoordinates {
            x: self.x >> REGION_SHIFT,
            y: self.y >> REGION_SHIFT,
        }
    }

    /// Straight-line distance in whole tiles, ignoring plane
    pub fn distance(&self, other: &Position) -> i32 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt() as i32
    }

    /// Whether `other` is on the same plane and within `radius` tiles on both axes
    pub fn is_within_radius(&self, other: &Position, radius: i32) -> bool {
        if self.plane != other.plane {
            return false;
        }
        (self.x - other.x).abs() <= radius && (self.y - other.y).abs() <= radius
    }

    /// Whether `other` is close enough to be shown to an observer standing here
    pub fn is_viewable(&self, other: &Position) -> bool {
        self.is_within_radius(other, VIEW_DISTANCE)
    }

    /// A new position offset from this one
    pub fn translate(&self, dx: i32, dy: i32) -> Result<Position, WorldError> {
        Position::new(self.x + dx, self.y + dy, self.plane)
    }

    /// The adjacent tile in `direction`
    pub fn step(&self, direction: Direction) -> Result<Position, WorldError> {
        let (dx, dy) = direction.delta();
        self.translate(dx, dy)
    }

    /// 8x8 chunk column, as sent in the map region message
    pub fn chunk_x(&self) -> i32 {
        self.x >> 3
    }

    /// 8x8 chunk row, as sent in the map region message
    pub fn chunk_y(&self) -> i32 {
        self.y >> 3
    }

    /// X relative to the 104x104 map area loaded around `base`
    pub fn local_x(&self, base: &Position) -> i32 {
        self.x - 8 * (base.chunk_x() - 6)
    }

    /// Y relative to the 104x104 map area loaded around `base`
    pub fn local_y(&self, base: &Position) -> i32 {
        self.y - 8 * (base.chunk_y() - 6)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.plane)
    }
}

/// Key of a region cell in the spatial index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionCoordinates {
    pub x: i32,
    pub y: i32,
}

impl RegionCoordinates {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// This cell and its eight neighbours, skipping cells off the map edge
    pub fn surrounding(self) -> impl Iterator<Item = RegionCoordinates> {
        let max = MAX_COORDINATE >> REGION_SHIFT;
        (-1..=1).flat_map(move |dx| {
            (-1..=1).filter_map(move |dy| {
                let x = self.x + dx;
                let y = self.y + dy;
                if (0..=max).contains(&x) && (0..=max).contains(&y) {
                    Some(RegionCoordinates { x, y })
                } else {
                    None
                }
            })
        })
    }
}

impl fmt::Display for RegionCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}

/// Walking direction, numbered the way the client expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    NorthWest,
    North,
    NorthEast,
    West,
    East,
    SouthWest,
    South,
    SouthEast,
}

impl Direction {
    /// Wire id (0-7)
    pub fn id(self) -> u32 {
        match self {
            Direction::NorthWest => 0,
            Direction::North => 1,
            Direction::NorthEast => 2,
            Direction::West => 3,
            Direction::East => 4,
            Direction::SouthWest => 5,
            Direction::South => 6,
            Direction::SouthEast => 7,
        }
    }

    /// Tile offset of one step
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::NorthWest => (-1, 1),
            Direction::North => (0, 1),
            Direction::NorthEast => (1, 1),
            Direction::West => (-1, 0),
            Direction::East => (1, 0),
            Direction::SouthWest => (-1, -1),
            Direction::South => (0, -1),
            Direction::SouthEast => (1, -1),
        }
    }

    /// Direction of a single step, or `None` for no movement
    pub fn from_delta(dx: i32, dy: i32) -> Option<Direction> {
        match (dx.signum(), dy.signum()) {
            (-1, 1) => Some(Direction::NorthWest),
            (0, 1) => Some(Direction::North),
            (1, 1) => Some(Direction::NorthEast),
            (-1, 0) => Some(Direction::West),
            (1, 0) => Some(Direction::East),
            (-1, -1) => Some(Direction::SouthWest),
            (0, -1) => Some(Direction::South),
            (1, -1) => Some(Direction::SouthEast),
            _ => None,
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
    fn test_bounds_rejected() {
        assert!(Position::new(-1, 0, 0).is_err());
        assert!(Position::new(0, 16384, 0).is_err());
        assert!(Position::new(0, 0, 4).is_err());
        assert!(Position::new(3222, 3222, 0).is_ok());
    }

    #[test]
    fn test_region_coordinates() {
        assert_eq!(pos(63, 0).region_coordinates(), RegionCoordinates::new(0, 0));
        assert_eq!(pos(64, 0).region_coordinates(), RegionCoordinates::new(1, 0));
        assert_eq!(
            pos(3222, 3218).region_coordinates(),
            RegionCoordinates::new(50, 50)
        );
    }

    #[test]
    fn test_within_radius_is_chebyshev() {
        let a = pos(100, 100);
        assert!(a.is_within_radius(&pos(101, 101), 1));
        assert!(!a.is_within_radius(&pos(102, 101), 1));
        assert!(a.is_viewable(&pos(115, 85)));
        assert!(!a.is_viewable(&pos(116, 100)));
        assert!(!a.is_within_radius(&Position::new(100, 100, 1).unwrap(), 5));
    }

    #[test]
    fn test_distance() {
        assert_eq!(pos(0, 0).distance(&pos(3, 4)), 5);
        assert_eq!(pos(10, 10).distance(&pos(10, 10)), 0);
    }

    #[test]
    fn test_surrounding_clips_map_edge() {
        assert_eq!(RegionCoordinates::new(10, 10).surrounding().count(), 9);
        assert_eq!(RegionCoordinates::new(0, 0).surrounding().count(), 4);
    }

    #[test]
    fn test_direction_roundtrip() {
        for dir in [
            Direction::NorthWest,
            Direction::North,
            Direction::NorthEast,
            Direction::West,
            Direction::East,
            Direction::SouthWest,
            Direction::South,
            Direction::SouthEast,
        ] {
            let (dx, dy) = dir.delta();
            assert_eq!(Direction::from_delta(dx, dy), Some(dir));
        }
        assert_eq!(Direction::from_delta(0, 0), None);
    }

    #[test]
    fn test_local_coordinates() {
        let base = pos(3222, 3222);
        // chunk 402, map origin (402 - 6) * 8 = 3168
        assert_eq!(base.local_x(&base), 54);
        assert_eq!(pos(3230, 3222).local_x(&base), 62);
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Position = serde_json::from_str(r#"{"x":3222,"y":3222,"plane":0}"#).unwrap();
        assert_eq!(ok, pos(3222, 3222));
        assert!(serde_json::from_str::<Position>(r#"{"x":-5,"y":0,"plane":0}"#).is_err());
    }
}
