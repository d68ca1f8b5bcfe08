//! Permutohedral lattice for fast high-dimensional Gaussian filtering.
//!
//! Points are embedded in the `d`-dimensional hyperplane of `Z^{d+1}` whose
//! coordinates sum to zero and splatted onto the vertices of their enclosing
//! simplex. A Gaussian blur becomes a `[1 2 1]` blur along each of the `d + 1`
//! lattice axes, after which the values are sliced back out with the same
//! barycentric weights.

use std::collections::HashMap;

use crate::{CrfError, CrfResult};

/// Adjacent vertices of one lattice vertex along one axis.
#[derive(Debug, Clone, Copy)]
struct Neighbours {
    minus: Option<usize>,
    plus: Option<usize>,
}

/// Lattice built from a fixed set of feature vectors.
///
/// Building costs `O(N·d²)`; every [`compute`](Self::compute) after that is
/// linear in the number of points and lattice vertices.
#[derive(Debug, Clone)]
pub struct PermutohedralLattice {
    points: usize,
    dim: usize,
    vertices: usize,
    /// `points * (dim + 1)` vertex indices.
    offset: Vec<usize>,
    /// `points * (dim + 1)` splat weights, paired with `offset`.
    barycentric: Vec<f32>,
    /// `(dim + 1) * vertices` blur neighbours, axis-major.
    blur_neighbours: Vec<Neighbours>,
}

impl PermutohedralLattice {
    /// Builds the lattice for `features`, laid out point-major with `dim`
    /// values per point.
    ///
    /// # Errors
    ///
    /// Returns [`CrfError::FeatureLength`] if `dim` is zero or does not divide
    /// `features.len()`.
    pub fn new(features: &[f32], dim: usize) -> CrfResult<Self> {
        if dim == 0 || features.len() % dim != 0 {
            return Err(CrfError::FeatureLength {
                len: features.len(),
                dim,
            });
        }
        let points = features.len() / dim;
        let d = dim;
        let d1 = d + 1;
        let di = d as i32;
        let d1i = d1 as i32;

        // Standard deviation of the blur along each lattice axis.
        let inv_std_dev = (2.0f32 / 3.0).sqrt() * d1 as f32;
        let scale_factor: Vec<f32> = (0..d)
            .map(|i| inv_std_dev / (((i + 2) * (i + 1)) as f32).sqrt())
            .collect();

        // Vertices of the canonical simplex, one row per remainder.
        let mut canonical = vec![0i32; d1 * d1];
        for i in 0..=d {
            let ii = i as i32;
            for j in 0..=(d - i) {
                canonical[i * d1 + j] = ii;
            }
            for j in (d - i + 1)..=d {
                canonical[i * d1 + j] = ii - d1i;
            }
        }

        let mut table = LatticeTable::with_capacity(dim, points * d1);
        let mut offset = Vec::with_capacity(points * d1);
        let mut barycentric = Vec::with_capacity(points * d1);

        let mut elevated = vec![0f32; d1];
        let mut rem0 = vec![0i32; d1];
        let mut rank = vec![0i32; d1];
        let mut weights = vec![0f32; d + 2];
        let mut key = vec![0i32; d];
        let down_factor = 1.0 / d1 as f32;

        for feature in features.chunks_exact(dim) {
            // Elevate onto the hyperplane.
            let mut sm = 0.0f32;
            for j in (1..=d).rev() {
                let cf = feature[j - 1] * scale_factor[j - 1];
                elevated[j] = sm - j as f32 * cf;
                sm += cf;
            }
            elevated[0] = sm;

            // Closest remainder-0 lattice point.
            let mut sum = 0i32;
            for i in 0..=d {
                let v = down_factor * elevated[i];
                let up = v.ceil() * d1 as f32;
                let down = v.floor() * d1 as f32;
                rem0[i] = if up - elevated[i] < elevated[i] - down {
                    up as i32
                } else {
                    down as i32
                };
                sum += rem0[i];
            }
            sum /= d1i;

            // Rank of each coordinate's distance to that point.
            rank.iter_mut().for_each(|r| *r = 0);
            for i in 0..d {
                let delta = elevated[i] - rem0[i] as f32;
                for j in (i + 1)..=d {
                    if delta < elevated[j] - rem0[j] as f32 {
                        rank[i] += 1;
                    } else {
                        rank[j] += 1;
                    }
                }
            }

            // Move back onto the plane if the rounding left it.
            for i in 0..=d {
                rank[i] += sum;
                if rank[i] < 0 {
                    rank[i] += d1i;
                    rem0[i] += d1i;
                } else if rank[i] > di {
                    rank[i] -= d1i;
                    rem0[i] -= d1i;
                }
            }

            weights.iter_mut().for_each(|w| *w = 0.0);
            for i in 0..=d {
                let v = (elevated[i] - rem0[i] as f32) * down_factor;
                let slot = (di - rank[i]) as usize;
                weights[slot] += v;
                weights[slot + 1] -= v;
            }
            weights[0] += 1.0 + weights[d + 1];

            for remainder in 0..=d {
                for i in 0..d {
                    key[i] = rem0[i] + canonical[remainder * d1 + rank[i] as usize];
                }
                offset.push(table.find_or_insert(&key));
                barycentric.push(weights[remainder]);
            }
        }

        let vertices = table.len();
        let mut blur_neighbours = Vec::with_capacity(d1 * vertices);
        let mut n1 = vec![0i32; d];
        let mut n2 = vec![0i32; d];
        for axis in 0..=d {
            for vertex in 0..vertices {
                let key = table.key(vertex);
                for k in 0..d {
                    n1[k] = key[k] - 1;
                    n2[k] = key[k] + 1;
                }
                if axis < d {
                    n1[axis] = key[axis] + di;
                    n2[axis] = key[axis] - di;
                }
                blur_neighbours.push(Neighbours {
                    minus: table.find(&n1),
                    plus: table.find(&n2),
                });
            }
        }

        tracing::trace!(points, dim, vertices, "permutohedral lattice built");

        Ok(Self {
            points,
            dim,
            vertices,
            offset,
            barycentric,
            blur_neighbours,
        })
    }

    pub fn points(&self) -> usize {
        self.points
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vertices(&self) -> usize {
        self.vertices
    }

    /// Filters `input` (point-major, `value_size` values per point).
    /// `reverse` blurs the axes in the opposite order, which applies the
    /// transposed filter.
    ///
    /// # Errors
    ///
    /// Returns [`CrfError::ValueLength`] if `input` is not
    /// `points * value_size` long.
    pub fn compute(&self, input: &[f32], value_size: usize, reverse: bool) -> CrfResult<Vec<f32>> {
        let expected = self.points * value_size;
        if input.len() != expected || value_size == 0 {
            return Err(CrfError::ValueLength {
                expected,
                actual: input.len(),
            });
        }
        let d1 = self.dim + 1;

        // Splat
        let mut values = vec![0f32; self.vertices * value_size];
        for (point, sample) in input.chunks_exact(value_size).enumerate() {
            for corner in 0..d1 {
                let vertex = self.offset[point * d1 + corner];
                let weight = self.barycentric[point * d1 + corner];
                let target = &mut values[vertex * value_size..(vertex + 1) * value_size];
                for (t, s) in target.iter_mut().zip(sample) {
                    *t += weight * s;
                }
            }
        }

        // Blur
        let mut scratch = vec![0f32; values.len()];
        for step in 0..d1 {
            let axis = if reverse { self.dim - step } else { step };
            let neighbours =
                &self.blur_neighbours[axis * self.vertices..(axis + 1) * self.vertices];
            for (vertex, n) in neighbours.iter().enumerate() {
                let base = vertex * value_size;
                for k in 0..value_size {
                    let minus = n.minus.map_or(0.0, |m| values[m * value_size + k]);
                    let plus = n.plus.map_or(0.0, |p| values[p * value_size + k]);
                    scratch[base + k] = values[base + k] + 0.5 * (minus + plus);
                }
            }
            std::mem::swap(&mut values, &mut scratch);
        }

        // Slice, compensating for the blur's energy loss.
        let alpha = 1.0 / (1.0 + 2f32.powi(-(self.dim as i32)));
        let mut output = vec![0f32; expected];
        for (point, out) in output.chunks_exact_mut(value_size).enumerate() {
            for corner in 0..d1 {
                let vertex = self.offset[point * d1 + corner];
                let weight = self.barycentric[point * d1 + corner] * alpha;
                let source = &values[vertex * value_size..(vertex + 1) * value_size];
                for (o, s) in out.iter_mut().zip(source) {
                    *o += weight * s;
                }
            }
        }

        Ok(output)
    }
}

/// Insertion-ordered map from lattice keys to vertex indices.
#[derive(Debug)]
struct LatticeTable {
    dim: usize,
    keys: Vec<i32>,
    index: HashMap<Vec<i32>, usize>,
}

impl LatticeTable {
    fn with_capacity(dim: usize, capacity: usize) -> Self {
        Self {
            dim,
            keys: Vec::with_capacity(capacity * dim),
            index: HashMap::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn key(&self, vertex: usize) -> &[i32] {
        &self.keys[vertex * self.dim..(vertex + 1) * self.dim]
    }

    fn find(&self, key: &[i32]) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn find_or_insert(&mut self, key: &[i32]) -> usize {
        if let Some(&vertex) = self.index.get(key) {
            return vertex;
        }
        let vertex = self.index.len();
        self.keys.extend_from_slice(key);
        self.index.insert(key.to_vec(), vertex);
        vertex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_features(width: usize, height: usize, scale: f32) -> Vec<f32> {
        let mut features = Vec::with_capacity(width * height * 2);
        for y in 0..height {
            for x in 0..width {
                features.push(y as f32 / scale);
                features.push(x as f32 / scale);
            }
        }
        features
    }

    #[test]
    fn splat_weights_sum_to_one() {
        let features = grid_features(6, 5, 3.0);
        let lattice = PermutohedralLattice::new(&features, 2).unwrap();

        assert_eq!(lattice.points(), 30);
        for weights in lattice.barycentric.chunks_exact(3) {
            let total: f32 = weights.iter().sum();
            assert!((total - 1.0).abs() < 1e-4, "weights = {weights:?}");
        }
    }

    #[test]
    fn filtering_ones_is_positive_and_smooth() {
        let features = grid_features(8, 8, 2.0);
        let lattice = PermutohedralLattice::new(&features, 2).unwrap();
        let ones = vec![1.0; 64];

        let norm = lattice.compute(&ones, 1, false).unwrap();
        assert_eq!(norm.len(), 64);
        assert!(norm.iter().all(|v| *v > 0.0));

        // Interior points see more mass than corners.
        let corner = norm[0];
        let centre = norm[4 * 8 + 4];
        assert!(centre > corner, "centre {centre} corner {corner}");
    }

    #[test]
    fn distant_points_do_not_interact() {
        let features = vec![0.0, 0.0, 1000.0, 1000.0];
        let lattice = PermutohedralLattice::new(&features, 2).unwrap();

        let out = lattice.compute(&[1.0, 0.0], 1, false).unwrap();
        assert!(out[0] > 0.0);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn filter_is_linear_in_values() {
        let features = grid_features(4, 4, 1.5);
        let lattice = PermutohedralLattice::new(&features, 2).unwrap();
        let a: Vec<f32> = (0..32).map(|i| (i % 7) as f32).collect();
        let doubled: Vec<f32> = a.iter().map(|v| v * 2.0).collect();

        let fa = lattice.compute(&a, 2, false).unwrap();
        let f2a = lattice.compute(&doubled, 2, false).unwrap();
        for (x, y) in fa.iter().zip(&f2a) {
            assert!((2.0 * x - y).abs() < 1e-3);
        }
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(matches!(
            PermutohedralLattice::new(&[0.0; 5], 2),
            Err(CrfError::FeatureLength { len: 5, dim: 2 })
        ));

        let lattice = PermutohedralLattice::new(&[0.0; 4], 2).unwrap();
        assert!(matches!(
            lattice.compute(&[1.0; 3], 1, false),
            Err(CrfError::ValueLength {
                expected: 2,
                actual: 3,
            })
        ));
    }
}
