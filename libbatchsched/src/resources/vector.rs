use std::fmt;

use serde::{Deserialize, Serialize};

use super::{name_of, PODS};

/// Comparison slack; accounting quantities are reals but all mutations are
/// paired with exact inverses, so drift only enters through fairness math.
pub(crate) const EPSILON: f64 = 1e-9;

/// An ordered sequence of non-negative quantities, one per resource name.
/// Missing trailing coordinates are implicit zeros, so vectors built before
/// a new resource name was interned stay valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector(Vec<f64>);

impl ResourceVector {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A vector with the pods coordinate set to one, the shape every pod
    /// requirement starts from.
    pub fn one_pod() -> Self {
        let mut v = Self::new();
        v.set(PODS, 1.0);
        v
    }

    pub fn get(&self, index: usize) -> f64 {
        self.0.get(index).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, index: usize, value: f64) {
        if self.0.len() <= index {
            self.0.resize(index + 1, 0.0);
        }
        self.0[index] = value;
    }

    pub fn add(&mut self, index: usize, delta: f64) {
        self.set(index, self.get(index) + delta);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|v| v.abs() < EPSILON)
    }

    pub fn add_assign(&mut self, other: &ResourceVector) {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), 0.0);
        }
        for (i, v) in other.0.iter().enumerate() {
            self.0[i] += v;
        }
    }

    pub fn sub_assign(&mut self, other: &ResourceVector) {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), 0.0);
        }
        for (i, v) in other.0.iter().enumerate() {
            self.0[i] -= v;
        }
    }

    pub fn plus(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = self.clone();
        out.add_assign(other);
        out
    }

    pub fn minus(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = self.clone();
        out.sub_assign(other);
        out
    }

    /// Coordinate-wise comparison over the union of coordinates. With the
    /// implicit-zero extension this is exactly: every shared coordinate of
    /// `self` <= `other`, extras of `self` <= 0, extras of `other` >= 0.
    pub fn less_equal(&self, other: &ResourceVector) -> bool {
        let len = self.0.len().max(other.0.len());
        (0..len).all(|i| self.get(i) <= other.get(i) + EPSILON)
    }

    /// Coordinate-wise max, used for effective init-container quotas.
    pub fn max_with(&self, other: &ResourceVector) -> ResourceVector {
        let len = self.0.len().max(other.0.len());
        let mut out = ResourceVector::new();
        for i in 0..len {
            let v = self.get(i).max(other.get(i));
            if v != 0.0 {
                out.set(i, v);
            }
        }
        out
    }

    pub fn scaled(&self, factor: f64) -> ResourceVector {
        ResourceVector(self.0.iter().map(|v| v * factor).collect())
    }

    /// Clamps small negative residue from inverse arithmetic back to zero.
    pub fn clamp_non_negative(&mut self) {
        for v in self.0.iter_mut() {
            if *v < 0.0 && *v > -EPSILON {
                *v = 0.0;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.0.iter().copied().enumerate()
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (i, v) in self.iter() {
            if v.abs() < EPSILON {
                continue;
            }
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name_of(i), v)?;
            first = false;
        }
        if first {
            write!(f, "<empty>")?;
        }
        Ok(())
    }
}
