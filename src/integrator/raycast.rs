//! Integer grid traversal along a ray segment
//!
//! Amanatides & Woo stepping: starting from the cell containing the
//! segment start, repeatedly advance across the nearest cell boundary
//! until the cell containing the segment end has been emitted. Inputs are
//! already scaled to grid units (1 cell = 1 unit), so the same caster
//! serves voxel-level and block-level traversal.

use glam::{IVec3, Vec3};

/// Iterator over the grid cells crossed by a segment
pub struct RayCaster {
    current: IVec3,
    step: IVec3,
    t_max: Vec3,
    t_delta: Vec3,
    remaining: u32,
}

impl RayCaster {
    /// Traverse from `start` to `end`, both in grid units
    pub fn new(start: Vec3, end: Vec3) -> Self {
        let start_index = IVec3::new(
            start.x.floor() as i32,
            start.y.floor() as i32,
            start.z.floor() as i32,
        );
        let end_index = IVec3::new(
            end.x.floor() as i32,
            end.y.floor() as i32,
            end.z.floor() as i32,
        );
        let diff = end_index - start_index;
        let direction = end - start;

        let mut step = IVec3::ZERO;
        let mut t_max = Vec3::INFINITY;
        let mut t_delta = Vec3::INFINITY;
        for axis in 0..3 {
            let d = direction[axis];
            if d.abs() < f32::EPSILON {
                continue;
            }
            step[axis] = if d > 0.0 { 1 } else { -1 };
            t_delta[axis] = (1.0 / d).abs();
            let boundary = if d > 0.0 {
                start_index[axis] as f32 + 1.0
            } else {
                start_index[axis] as f32
            };
            t_max[axis] = (boundary - start[axis]) / d;
        }

        Self {
            current: start_index,
            step,
            t_max,
            t_delta,
            remaining: (diff.x.abs() + diff.y.abs() + diff.z.abs()) as u32 + 1,
        }
    }
}

impl Iterator for RayCaster {
    type Item = IVec3;

    fn next(&mut self) -> Option<IVec3> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let emitted = self.current;

        // Advance across the nearest boundary
        let axis = if self.t_max.x < self.t_max.y {
            if self.t_max.x < self.t_max.z { 0 } else { 2 }
        } else if self.t_max.y < self.t_max.z {
            1
        } else {
            2
        };
        self.current[axis] += self.step[axis];
        self.t_max[axis] += self.t_delta[axis];

        Some(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_cell() {
        let cells: Vec<_> = RayCaster::new(Vec3::splat(0.4), Vec3::splat(0.6)).collect();
        assert_eq!(cells, vec![IVec3::ZERO]);
    }

    #[test]
    fn test_axis_aligned() {
        let cells: Vec<_> =
            RayCaster::new(Vec3::new(0.5, 0.5, 0.5), Vec3::new(3.5, 0.5, 0.5)).collect();
        assert_eq!(
            cells,
            vec![
                IVec3::new(0, 0, 0),
                IVec3::new(1, 0, 0),
                IVec3::new(2, 0, 0),
                IVec3::new(3, 0, 0),
            ]
        );
    }

    #[test]
    fn test_negative_direction() {
        let cells: Vec<_> =
            RayCaster::new(Vec3::new(0.5, 0.5, 0.5), Vec3::new(-1.5, 0.5, 0.5)).collect();
        assert_eq!(
            cells,
            vec![IVec3::new(0, 0, 0), IVec3::new(-1, 0, 0), IVec3::new(-2, 0, 0)]
        );
    }

    #[test]
    fn test_diagonal_is_connected_and_complete() {
        let start = Vec3::new(0.2, 0.3, 0.4);
        let end = Vec3::new(4.7, 3.1, -2.8);
        let cells: Vec<_> = RayCaster::new(start, end).collect();

        assert_eq!(cells.first().copied(), Some(IVec3::new(0, 0, 0)));
        assert_eq!(cells.last().copied(), Some(IVec3::new(4, 3, -3)));
        // Each step moves exactly one cell along one axis
        for pair in cells.windows(2) {
            let d = pair[1] - pair[0];
            assert_eq!(d.x.abs() + d.y.abs() + d.z.abs(), 1);
        }
        // Cell count for a 6-connected walk
        assert_eq!(cells.len(), 4 + 3 + 3 + 1);
    }
}
