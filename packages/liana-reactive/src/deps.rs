//! Explicit dependency lists.

use crate::{untrack, Derived, State};

/// A cell, or a collection of cells, that can be registered as an explicit
/// dependency of a compute.
///
/// The trait is deliberately untyped: a dependency list only registers
/// reads, it never produces values, so cells with different value types
/// compose into one list. Homogeneous lists fit in arrays, mixed lists in
/// tuples (nest tuples or switch to `&dyn Dependency` arrays past four
/// entries).
pub trait Dependency {
    /// Register with the compute that is currently running. Outside of a
    /// compute this does nothing.
    fn register(&self);
}

impl<T> Dependency for State<T> {
    fn register(&self) {
        self.track();
    }
}

impl<T> Dependency for Derived<T> {
    fn register(&self) {
        self.track();
    }
}

impl<D: Dependency + ?Sized> Dependency for &D {
    fn register(&self) {
        (**self).register();
    }
}

impl<D: Dependency, const N: usize> Dependency for [D; N] {
    fn register(&self) {
        for dep in self {
            dep.register();
        }
    }
}

impl<A: Dependency, B: Dependency> Dependency for (A, B) {
    fn register(&self) {
        self.0.register();
        self.1.register();
    }
}

impl<A: Dependency, B: Dependency, C: Dependency> Dependency for (A, B, C) {
    fn register(&self) {
        self.0.register();
        self.1.register();
        self.2.register();
    }
}

impl<A: Dependency, B: Dependency, C: Dependency, D: Dependency> Dependency for (A, B, C, D) {
    fn register(&self) {
        self.0.register();
        self.1.register();
        self.2.register();
        self.3.register();
    }
}

/// Pin a compute's dependency set to an explicit list.
///
/// The returned closure registers exactly `deps` and then evaluates `f`
/// with tracking suspended, so reads inside the body can never widen the
/// dependency set. This is the opt-out from automatic discovery: the cell
/// recomputes when a listed dependency changes and only then.
///
/// # Example
/// ```
/// # use liana_reactive::*;
/// let price = create_state(100);
/// let tax = create_state(19);
/// let gross = create_derived(on(price, move || price.get() + tax.get()));
/// assert_eq!(gross.get(), 119);
///
/// tax.set(7);
/// assert_eq!(gross.get(), 119); // tax is not in the dependency list
///
/// price.set(200);
/// assert_eq!(gross.get(), 207);
/// ```
pub fn on<T>(
    deps: impl Dependency + 'static,
    mut f: impl FnMut() -> T + 'static,
) -> impl FnMut() -> T + 'static {
    move || {
        deps.register();
        untrack(&mut f)
    }
}
