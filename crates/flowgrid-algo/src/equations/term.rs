use super::{StateView, Variable, VariableKind};

/// One additive contribution to an equation.
///
/// A term only declares the variables it wants derivatives for. It may read
/// other variables through the [`StateView`] (they then act as constants in
/// the Jacobian), which is how fixed tap ratios or shunt susceptances enter
/// the flow formulas without becoming unknowns.
pub trait EquationTerm<V: VariableKind> {
    fn variables(&self) -> &[Variable<V>];

    fn eval(&self, state: &StateView<'_, V>) -> f64;

    /// Partial derivative with respect to one of [`Self::variables`].
    fn der(&self, variable: Variable<V>, state: &StateView<'_, V>) -> f64;

    fn name(&self) -> &'static str;
}

/// `x`: pins a single variable (target equations).
#[derive(Debug, Clone)]
pub struct VariableTerm<V> {
    variables: [Variable<V>; 1],
}

impl<V: VariableKind> VariableTerm<V> {
    pub fn new(variable: Variable<V>) -> Self {
        Self {
            variables: [variable],
        }
    }
}

impl<V: VariableKind> EquationTerm<V> for VariableTerm<V> {
    fn variables(&self) -> &[Variable<V>] {
        &self.variables
    }

    fn eval(&self, state: &StateView<'_, V>) -> f64 {
        state.value(self.variables[0])
    }

    fn der(&self, variable: Variable<V>, _state: &StateView<'_, V>) -> f64 {
        if variable == self.variables[0] {
            1.0
        } else {
            0.0
        }
    }

    fn name(&self) -> &'static str {
        "variable"
    }
}

/// `sign * x`: flow carried by a dummy variable of a non-impedant branch.
#[derive(Debug, Clone)]
pub struct SignedVariableTerm<V> {
    variables: [Variable<V>; 1],
    sign: f64,
}

impl<V: VariableKind> SignedVariableTerm<V> {
    pub fn new(variable: Variable<V>, negate: bool) -> Self {
        Self {
            variables: [variable],
            sign: if negate { -1.0 } else { 1.0 },
        }
    }
}

impl<V: VariableKind> EquationTerm<V> for SignedVariableTerm<V> {
    fn variables(&self) -> &[Variable<V>] {
        &self.variables
    }

    fn eval(&self, state: &StateView<'_, V>) -> f64 {
        self.sign * state.value(self.variables[0])
    }

    fn der(&self, variable: Variable<V>, _state: &StateView<'_, V>) -> f64 {
        if variable == self.variables[0] {
            self.sign
        } else {
            0.0
        }
    }

    fn name(&self) -> &'static str {
        "signed_variable"
    }
}

/// `x1 - x2`: equality of two variables across a non-impedant branch.
#[derive(Debug, Clone)]
pub struct DifferenceTerm<V> {
    variables: [Variable<V>; 2],
}

impl<V: VariableKind> DifferenceTerm<V> {
    pub fn new(first: Variable<V>, second: Variable<V>) -> Self {
        Self {
            variables: [first, second],
        }
    }
}

impl<V: VariableKind> EquationTerm<V> for DifferenceTerm<V> {
    fn variables(&self) -> &[Variable<V>] {
        &self.variables
    }

    fn eval(&self, state: &StateView<'_, V>) -> f64 {
        state.value(self.variables[0]) - state.value(self.variables[1])
    }

    fn der(&self, variable: Variable<V>, _state: &StateView<'_, V>) -> f64 {
        if variable == self.variables[0] {
            1.0
        } else if variable == self.variables[1] {
            -1.0
        } else {
            0.0
        }
    }

    fn name(&self) -> &'static str {
        "difference"
    }
}
