use super::Variable;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};

/// Dense state vector indexed by variable row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateVector(Vec<f64>);

impl StateVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(len: usize) -> Self {
        Self(vec![0.0; len])
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }

    /// `self += factor * step`
    pub fn add_scaled(&mut self, factor: f64, step: &[f64]) {
        for (x, dx) in self.0.iter_mut().zip(step) {
            *x += factor * dx;
        }
    }
}

impl Deref for StateVector {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

impl DerefMut for StateVector {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.0
    }
}

impl From<Vec<f64>> for StateVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Read access to variable values during term evaluation.
///
/// Active variables read the dense state; inactive ones fall back to the
/// value last stored in the equation system.
#[derive(Clone, Copy)]
pub struct StateView<'a, V> {
    values: &'a [f64],
    rows: &'a HashMap<Variable<V>, usize>,
    stored: &'a BTreeMap<Variable<V>, f64>,
}

impl<'a, V: Copy + Ord + std::hash::Hash> StateView<'a, V> {
    pub(crate) fn new(
        values: &'a [f64],
        rows: &'a HashMap<Variable<V>, usize>,
        stored: &'a BTreeMap<Variable<V>, f64>,
    ) -> Self {
        Self {
            values,
            rows,
            stored,
        }
    }

    pub fn value(&self, variable: Variable<V>) -> f64 {
        match self.rows.get(&variable) {
            Some(&row) if row < self.values.len() => self.values[row],
            _ => self.stored.get(&variable).copied().unwrap_or(0.0),
        }
    }
}
