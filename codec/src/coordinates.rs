/*!
Pixel coordinates and the pixel matrix map.

A [`PixelMatrix`] maps `(column, row)` coordinates to [`PixelCell`]s. Reading
a coordinate that was never written yields the matrix fill cell, so a matrix
built from a sparse definition file can still be serialized completely.
*/

use crate::pixel::PixelCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Zero-based pixel address on the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub column: u16,
    pub row: u16,
}

impl Coordinate {
    pub fn new(column: u16, row: u16) -> Self {
        Self { column, row }
    }
}

impl From<(u16, u16)> for Coordinate {
    fn from((column, row): (u16, u16)) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.column, self.row)
    }
}

/// Map of pixel coordinates to latch records
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMatrix {
    fill: PixelCell,
    cells: BTreeMap<Coordinate, PixelCell>,
}

impl PixelMatrix {
    /// Create an empty matrix whose missing pixels read as all-zero cells
    pub fn new(width: u8) -> Self {
        Self::with_fill(PixelCell::zeroed(width))
    }

    /// Create an empty matrix whose missing pixels read as `fill`
    pub fn with_fill(fill: PixelCell) -> Self {
        Self {
            fill,
            cells: BTreeMap::new(),
        }
    }

    /// Latch width of the cells in this matrix
    pub fn width(&self) -> u8 {
        self.fill.width()
    }

    pub fn fill(&self) -> PixelCell {
        self.fill
    }

    pub fn insert(&mut self, column: u16, row: u16, cell: PixelCell) -> Option<PixelCell> {
        self.cells.insert(Coordinate::new(column, row), cell)
    }

    /// The cell at a coordinate, or the fill cell if none was stored
    pub fn get(&self, column: u16, row: u16) -> PixelCell {
        self.cells
            .get(&Coordinate::new(column, row))
            .copied()
            .unwrap_or(self.fill)
    }

    pub fn contains(&self, column: u16, row: u16) -> bool {
        self.cells.contains_key(&Coordinate::new(column, row))
    }

    /// Number of explicitly stored cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Stored cells in column-major order
    pub fn iter(&self) -> impl Iterator<Item = (Coordinate, PixelCell)> + '_ {
        self.cells.iter().map(|(coordinate, cell)| (*coordinate, *cell))
    }

    /// Number of stored cells whose latches are not all zero
    pub fn count_nonzero(&self) -> usize {
        self.cells.values().filter(|cell| cell.latches() != 0).count()
    }

    /// Coordinates where `self` and `other` disagree, over a full geometry
    pub fn differences(&self, other: &PixelMatrix, columns: u16, rows: u16) -> Vec<Coordinate> {
        let mut mismatches = Vec::new();
        for column in 0..columns {
            for row in 0..rows {
                if self.get(column, row) != other.get(column, row) {
                    mismatches.push(Coordinate::new(column, row));
                }
            }
        }
        mismatches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_pixels_read_as_fill() {
        let mut matrix = PixelMatrix::new(14);
        matrix.insert(1, 2, PixelCell::new(14, 0x2000));
        assert_eq!(matrix.get(1, 2).latches(), 0x2000);
        assert_eq!(matrix.get(0, 0).latches(), 0);
        assert!(matrix.contains(1, 2));
        assert!(!matrix.contains(0, 0));
        assert_eq!(matrix.len(), 1);

        let masked = PixelMatrix::with_fill(PixelCell::new(22, 0x2001FE));
        assert_eq!(masked.get(5, 5).latches(), 0x2001FE);
    }

    #[test]
    fn test_iteration_is_column_major() {
        let mut matrix = PixelMatrix::new(8);
        matrix.insert(1, 0, PixelCell::new(8, 3));
        matrix.insert(0, 5, PixelCell::new(8, 0));
        matrix.insert(0, 1, PixelCell::new(8, 1));
        let order: Vec<_> = matrix.iter().map(|(c, _)| (c.column, c.row)).collect();
        assert_eq!(order, vec![(0, 1), (0, 5), (1, 0)]);
        assert_eq!(matrix.count_nonzero(), 2);
    }

    #[test]
    fn test_differences() {
        let mut a = PixelMatrix::new(8);
        let mut b = PixelMatrix::new(8);
        a.insert(1, 1, PixelCell::new(8, 1));
        b.insert(0, 0, PixelCell::new(8, 0));
        assert_eq!(a.differences(&b, 2, 2), vec![Coordinate::new(1, 1)]);
    }
}
