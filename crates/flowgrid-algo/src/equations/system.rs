use super::{
    EquationId, EquationKind, EquationTerm, StateVector, StateView, TargetProvider, Variable,
    VariableKind,
};
use crate::initializer::StateInitializer;
use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Handle to a term registered in an [`EquationSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermId(usize);

struct EquationEntry {
    active: bool,
    terms: Vec<TermId>,
}

struct TermEntry<V: VariableKind, E> {
    equation: EquationId<E>,
    active: bool,
    term: Box<dyn EquationTerm<V>>,
}

/// Row/column assignment of the active variables and equations.
#[derive(Debug, Clone)]
pub struct SystemIndex<V, E> {
    rows: HashMap<Variable<V>, usize>,
    variables: Vec<Variable<V>>,
    columns: HashMap<EquationId<E>, usize>,
    equations: Vec<EquationId<E>>,
}

impl<V: VariableKind, E: EquationKind> SystemIndex<V, E> {
    pub fn row(&self, variable: Variable<V>) -> Option<usize> {
        self.rows.get(&variable).copied()
    }

    pub fn column(&self, equation: EquationId<E>) -> Option<usize> {
        self.columns.get(&equation).copied()
    }

    /// Active variables in row order
    pub fn variables(&self) -> &[Variable<V>] {
        &self.variables
    }

    /// Active equations in column order
    pub fn equations(&self) -> &[EquationId<E>] {
        &self.equations
    }

    pub fn row_count(&self) -> usize {
        self.variables.len()
    }

    pub fn column_count(&self) -> usize {
        self.equations.len()
    }

    pub(crate) fn rows(&self) -> &HashMap<Variable<V>, usize> {
        &self.rows
    }
}

/// Registry of variables, equations and terms for one physical domain.
///
/// The system lives for one topology. During a run, elements are only
/// (de)activated, never removed, so [`TermId`]s stay valid.
pub struct EquationSystem<V: VariableKind, E: EquationKind> {
    values: BTreeMap<Variable<V>, f64>,
    equations: BTreeMap<EquationId<E>, EquationEntry>,
    terms: Vec<TermEntry<V, E>>,
    index: OnceCell<SystemIndex<V, E>>,
    structure_version: u64,
}

impl<V: VariableKind, E: EquationKind> std::fmt::Debug for EquationSystem<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquationSystem")
            .field("variables", &self.values.len())
            .field("equations", &self.equations.len())
            .field("terms", &self.terms.len())
            .field("structure_version", &self.structure_version)
            .finish()
    }
}

impl<V: VariableKind, E: EquationKind> Default for EquationSystem<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: VariableKind, E: EquationKind> EquationSystem<V, E> {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            equations: BTreeMap::new(),
            terms: Vec::new(),
            index: OnceCell::new(),
            structure_version: 0,
        }
    }

    fn invalidate(&mut self) {
        self.index.take();
        self.structure_version += 1;
    }

    /// Monotonic counter bumped by every structural change.
    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a variable (stored value 0 unless already known).
    pub fn create_variable(&mut self, element: usize, kind: V) -> Variable<V> {
        let variable = Variable::new(element, kind);
        self.values.entry(variable).or_insert(0.0);
        variable
    }

    /// Register an active equation, or return the existing one untouched.
    pub fn create_equation(&mut self, element: usize, kind: E) -> EquationId<E> {
        let id = EquationId::new(element, kind);
        if !self.equations.contains_key(&id) {
            self.equations.insert(
                id,
                EquationEntry {
                    active: true,
                    terms: Vec::new(),
                },
            );
            self.invalidate();
        }
        id
    }

    pub fn has_equation(&self, id: EquationId<E>) -> bool {
        self.equations.contains_key(&id)
    }

    /// Append a term to an equation (created on demand).
    pub fn add_term(&mut self, equation: EquationId<E>, term: Box<dyn EquationTerm<V>>) -> TermId {
        self.create_equation(equation.element, equation.kind);
        for variable in term.variables() {
            self.values.entry(*variable).or_insert(0.0);
        }
        let id = TermId(self.terms.len());
        self.terms.push(TermEntry {
            equation,
            active: true,
            term,
        });
        if let Some(entry) = self.equations.get_mut(&equation) {
            entry.terms.push(id);
        }
        self.invalidate();
        id
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Returns true when the activation actually changed.
    pub fn set_equation_active(&mut self, id: EquationId<E>, active: bool) -> bool {
        let changed = match self.equations.get_mut(&id) {
            Some(entry) if entry.active != active => {
                entry.active = active;
                true
            }
            _ => false,
        };
        if changed {
            self.invalidate();
        }
        changed
    }

    pub fn is_equation_active(&self, id: EquationId<E>) -> bool {
        self.equations.get(&id).map(|e| e.active).unwrap_or(false)
    }

    /// Returns true when the activation actually changed.
    pub fn set_term_active(&mut self, term: TermId, active: bool) -> bool {
        let changed = match self.terms.get_mut(term.0) {
            Some(entry) if entry.active != active => {
                entry.active = active;
                true
            }
            _ => false,
        };
        if changed {
            self.invalidate();
        }
        changed
    }

    pub fn is_term_active(&self, term: TermId) -> bool {
        self.terms.get(term.0).map(|t| t.active).unwrap_or(false)
    }

    pub fn term_equation(&self, term: TermId) -> Option<EquationId<E>> {
        self.terms.get(term.0).map(|t| t.equation)
    }

    // =========================================================================
    // Stored values
    // =========================================================================

    pub fn set_variable_value(&mut self, variable: Variable<V>, value: f64) {
        self.values.insert(variable, value);
    }

    pub fn variable_value(&self, variable: Variable<V>) -> f64 {
        self.values.get(&variable).copied().unwrap_or(0.0)
    }

    /// Copy a solved state back into the stored values.
    pub fn store_state(&mut self, state: &[f64]) {
        let index = self.index().clone();
        for (row, variable) in index.variables().iter().enumerate() {
            if let Some(value) = state.get(row) {
                self.values.insert(*variable, *value);
            }
        }
    }

    // =========================================================================
    // Index
    // =========================================================================

    /// Current row/column assignment, rebuilt if the structure changed.
    pub fn index(&self) -> &SystemIndex<V, E> {
        self.index.get_or_init(|| self.build_index())
    }

    fn build_index(&self) -> SystemIndex<V, E> {
        let mut equations = Vec::new();
        let mut active_variables = BTreeSet::new();
        for (id, entry) in &self.equations {
            if !entry.active {
                continue;
            }
            equations.push(*id);
            for term_id in &entry.terms {
                let term = &self.terms[term_id.0];
                if term.active {
                    active_variables.extend(term.term.variables().iter().copied());
                }
            }
        }

        let variables: Vec<Variable<V>> = active_variables.into_iter().collect();
        let rows = variables.iter().enumerate().map(|(i, v)| (*v, i)).collect();
        let columns = equations.iter().enumerate().map(|(i, e)| (*e, i)).collect();

        SystemIndex {
            rows,
            variables,
            columns,
            equations,
        }
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    pub fn view<'a>(&'a self, state: &'a [f64]) -> StateView<'a, V> {
        StateView::new(state, self.index().rows(), &self.values)
    }

    /// View on the stored values only.
    pub fn stored_view(&self) -> StateView<'_, V> {
        StateView::new(&[], self.index().rows(), &self.values)
    }

    /// Sum of the active terms of an equation, active or not.
    pub fn evaluate_equation(&self, id: EquationId<E>, view: &StateView<'_, V>) -> f64 {
        self.equations
            .get(&id)
            .map(|entry| {
                entry
                    .terms
                    .iter()
                    .map(|t| &self.terms[t.0])
                    .filter(|t| t.active)
                    .map(|t| t.term.eval(view))
                    .sum()
            })
            .unwrap_or(0.0)
    }

    pub fn evaluate_term(&self, term: TermId, view: &StateView<'_, V>) -> f64 {
        self.terms
            .get(term.0)
            .map(|t| t.term.eval(view))
            .unwrap_or(0.0)
    }

    /// Partial derivatives of a term with respect to its declared variables.
    pub fn term_gradient(&self, term: TermId, view: &StateView<'_, V>) -> Vec<(Variable<V>, f64)> {
        self.terms
            .get(term.0)
            .map(|t| {
                t.term
                    .variables()
                    .iter()
                    .map(|v| (*v, t.term.der(*v, view)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Value of every active equation, in column order.
    pub fn update_equations(&self, state: &[f64]) -> Vec<f64> {
        let view = self.view(state);
        self.index()
            .equations()
            .iter()
            .map(|id| self.evaluate_equation(*id, &view))
            .collect()
    }

    pub fn create_state_vector(&self, initializer: &dyn StateInitializer<V>) -> StateVector {
        self.index()
            .variables()
            .iter()
            .map(|v| initializer.initial_value(*v, self.variable_value(*v)))
            .collect::<Vec<_>>()
            .into()
    }

    /// Target of every active equation, in column order.
    pub fn create_target_vector(&self, targets: &dyn TargetProvider<E>) -> Vec<f64> {
        self.index()
            .equations()
            .iter()
            .map(|id| targets.target(*id))
            .collect()
    }

    /// `equation value − target` for every active equation.
    pub fn mismatch(&self, state: &[f64], targets: &[f64]) -> Vec<f64> {
        self.update_equations(state)
            .into_iter()
            .zip(targets)
            .map(|(value, target)| value - target)
            .collect()
    }

    /// The `count` equations with the largest absolute mismatch.
    pub fn find_largest_mismatches(&self, mismatch: &[f64], count: usize) -> Vec<(EquationId<E>, f64)> {
        let mut ranked: Vec<(EquationId<E>, f64)> = self
            .index()
            .equations()
            .iter()
            .copied()
            .zip(mismatch.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        ranked.truncate(count);
        ranked
    }

    /// Jacobian entries as `(variable row, equation column, ∂eq/∂var)`.
    ///
    /// Zero derivatives are kept so the pattern depends on structure only.
    pub fn jacobian_triplets(&self, state: &[f64]) -> Vec<(usize, usize, f64)> {
        let view = self.view(state);
        let index = self.index();
        let mut triplets = Vec::new();
        for (column, id) in index.equations().iter().enumerate() {
            let Some(entry) = self.equations.get(id) else {
                continue;
            };
            for term_id in &entry.terms {
                let term = &self.terms[term_id.0];
                if !term.active {
                    continue;
                }
                for variable in term.term.variables() {
                    if let Some(row) = index.row(*variable) {
                        triplets.push((row, column, term.term.der(*variable, &view)));
                    }
                }
            }
        }
        triplets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::{DifferenceTerm, MismatchCategory, VariableTerm};
    use crate::initializer::PreviousValueInitializer;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Var {
        X,
        Y,
    }

    impl VariableKind for Var {}

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Constraint {
        Pin,
        Link,
    }

    impl EquationKind for Constraint {
        fn mismatch_category(self) -> MismatchCategory {
            MismatchCategory::Voltage
        }
    }

    struct Zero;

    impl TargetProvider<Constraint> for Zero {
        fn target(&self, _equation: EquationId<Constraint>) -> f64 {
            0.0
        }
    }

    fn sample() -> (EquationSystem<Var, Constraint>, TermId) {
        let mut system = EquationSystem::new();
        let y1 = system.create_variable(1, Var::Y);
        let x0 = system.create_variable(0, Var::X);
        let x1 = system.create_variable(1, Var::X);
        system.add_term(EquationId::new(1, Constraint::Link), Box::new(DifferenceTerm::new(x1, x0)));
        system.add_term(EquationId::new(0, Constraint::Pin), Box::new(VariableTerm::new(x0)));
        let t = system.add_term(EquationId::new(1, Constraint::Link), Box::new(VariableTerm::new(y1)));
        (system, t)
    }

    #[test]
    fn rows_and_columns_follow_element_then_type_order() {
        let (system, _) = sample();
        let index = system.index();
        let rows: Vec<_> = index.variables().iter().map(|v| (v.element, v.kind)).collect();
        assert_eq!(rows, vec![(0, Var::X), (1, Var::X), (1, Var::Y)]);
        let cols: Vec<_> = index.equations().iter().map(|e| (e.element, e.kind)).collect();
        assert_eq!(cols, vec![(0, Constraint::Pin), (1, Constraint::Link)]);
    }

    #[test]
    fn deactivating_a_term_drops_its_only_variable_and_bumps_version() {
        let (mut system, t) = sample();
        let before = system.structure_version();
        assert_eq!(system.index().row_count(), 3);

        assert!(system.set_term_active(t, false));
        assert!(system.structure_version() > before);
        assert_eq!(system.index().row_count(), 2);
        assert!(system.index().row(Variable::new(1, Var::Y)).is_none());

        // same activation again is not a structural change
        let version = system.structure_version();
        assert!(!system.set_term_active(t, false));
        assert_eq!(system.structure_version(), version);
    }

    #[test]
    fn value_changes_keep_the_index() {
        let (mut system, _) = sample();
        let version = system.structure_version();
        system.set_variable_value(Variable::new(0, Var::X), 3.0);
        system.store_state(&[1.0, 2.0, 3.0]);
        assert_eq!(system.structure_version(), version);
        assert_eq!(system.variable_value(Variable::new(1, Var::Y)), 3.0);
    }

    #[test]
    fn inactive_variables_read_stored_values() {
        let (mut system, t) = sample();
        system.set_variable_value(Variable::new(1, Var::Y), 7.0);
        system.set_term_active(t, false);
        let view = system.view(&[1.0, 4.0]);
        assert_eq!(view.value(Variable::new(1, Var::Y)), 7.0);
        assert_eq!(view.value(Variable::new(1, Var::X)), 4.0);
        // inactive term still evaluates on demand
        assert_eq!(system.evaluate_term(t, &view), 7.0);
    }

    #[test]
    fn update_equations_is_pure() {
        let (system, _) = sample();
        let state = vec![0.3, -0.2, 0.9];
        let targets = system.create_target_vector(&Zero);
        let first = system.mismatch(&state, &targets);
        let second = system.mismatch(&state, &targets);
        assert_eq!(first, second);
        assert!((first[1] - (-0.2 - 0.3 + 0.9)).abs() < 1e-15);
    }

    #[test]
    fn largest_mismatches_are_sorted_by_magnitude() {
        let (system, _) = sample();
        let largest = system.find_largest_mismatches(&[0.1, -2.0], 1);
        assert_eq!(largest.len(), 1);
        assert_eq!(largest[0].0, EquationId::new(1, Constraint::Link));
    }

    #[test]
    fn state_vector_uses_stored_values_with_previous_initializer() {
        let (mut system, _) = sample();
        system.set_variable_value(Variable::new(1, Var::X), 0.5);
        let state = system.create_state_vector(&PreviousValueInitializer);
        assert_eq!(&state[..], &[0.0, 0.5, 0.0]);
    }

    #[test]
    fn jacobian_triplets_cover_every_active_term_variable() {
        let (system, _) = sample();
        let triplets = system.jacobian_triplets(&[0.0, 0.0, 0.0]);
        assert_eq!(triplets.len(), 4);
        assert!(triplets.contains(&(0, 1, -1.0)));
        assert!(triplets.contains(&(1, 1, 1.0)));
    }
}
