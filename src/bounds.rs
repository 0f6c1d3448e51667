use nalgebra as na;

/// Axis-aligned bounding box of a point set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min: na::Vector3<f32>,
    pub max: na::Vector3<f32>,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min: na::Vector3::zeros(),
            max: na::Vector3::zeros(),
        }
    }
}

impl Bounds {
    /// Bounds over flat `xyz` triples. An empty slice gives a zero box at the origin.
    pub fn from_xyz(points: &[f32]) -> Self {
        let mut chunks = points.chunks_exact(3);
        let Some(first) = chunks.next() else {
            return Self::default();
        };
        let first = na::Vector3::new(first[0], first[1], first[2]);
        let (min, max) = chunks.fold((first, first), |(min, max), p| {
            let p = na::Vector3::new(p[0], p[1], p[2]);
            (min.inf(&p), max.sup(&p))
        });
        Self { min, max }
    }

    pub fn center(&self) -> na::Vector3<f32> {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> na::Vector3<f32> {
        self.max - self.min
    }

    pub fn max_extent(&self) -> f32 {
        self.size().max()
    }
}
