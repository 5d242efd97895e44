use std::fmt;

/// Field-group scoped merge from `desired` into `existing`.
///
/// Must be idempotent: on an already converged object it returns `false` and
/// leaves `existing` untouched.
pub trait Mutator<K>: Send + Sync {
    fn name(&self) -> &str;

    fn mutate(&self, desired: &K, existing: &mut K) -> bool;
}

impl<K, M: Mutator<K> + ?Sized> Mutator<K> for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn mutate(&self, desired: &K, existing: &mut K) -> bool {
        (**self).mutate(desired, existing)
    }
}

/// Ad-hoc mutator from a closure.
pub struct FnMutator<F> {
    name: &'static str,
    f: F,
}

pub fn from_fn<K, F>(name: &'static str, f: F) -> FnMutator<F>
where
    F: Fn(&K, &mut K) -> bool + Send + Sync,
{
    FnMutator { name, f }
}

impl<K, F> Mutator<K> for FnMutator<F>
where
    F: Fn(&K, &mut K) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn mutate(&self, desired: &K, existing: &mut K) -> bool {
        (self.f)(desired, existing)
    }
}

/// Ordered mutators for one resource. Built fresh every pass.
pub struct Pipeline<K> {
    mutators: Vec<Box<dyn Mutator<K>>>,
}

impl<K> Default for Pipeline<K> {
    fn default() -> Self {
        Self { mutators: Vec::new() }
    }
}

impl<K> Pipeline<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, m: impl Mutator<K> + 'static) -> Self {
        self.push(m);
        self
    }

    pub fn push(&mut self, m: impl Mutator<K> + 'static) {
        self.mutators.push(Box::new(m));
    }

    pub fn push_boxed(&mut self, m: Box<dyn Mutator<K>>) {
        self.mutators.push(m);
    }

    pub fn extend(&mut self, other: Pipeline<K>) {
        self.mutators.extend(other.mutators);
    }

    /// Run every mutator in order and OR the results. Never short-circuits:
    /// later mutators still run after an earlier one reported a change.
    pub fn apply(&self, desired: &K, existing: &mut K) -> bool {
        let mut changed = false;
        for m in &self.mutators {
            changed |= m.mutate(desired, existing);
        }
        changed
    }

    pub fn names(&self) -> Vec<&str> {
        self.mutators.iter().map(|m| m.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mutators.iter().any(|m| m.name() == name)
    }

    pub fn len(&self) -> usize {
        self.mutators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }
}

impl<K> FromIterator<Box<dyn Mutator<K>>> for Pipeline<K> {
    fn from_iter<I: IntoIterator<Item = Box<dyn Mutator<K>>>>(iter: I) -> Self {
        Self { mutators: iter.into_iter().collect() }
    }
}

impl<K> fmt::Debug for Pipeline<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
