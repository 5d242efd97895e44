//! AMP reconcile: converge live objects toward desired ones.
//!
//! A [`Mutator`] copies one field group from the desired object into the
//! existing one and reports whether it changed anything. Mutators compose into
//! an ordered [`Pipeline`]; [`reconcile_kind`] runs the get → create | mutate →
//! update cycle for a single resource.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod engine;
pub mod mutator;
pub mod selector;
pub mod workload;

pub use catalog::{CreateOnly, DefaultsOnly, Field, FieldSync, KeyDefaults, MultiFieldSync};
pub use engine::{reconcile_kind, Reconciler};
pub use mutator::{from_fn, FnMutator, Mutator, Pipeline};
pub use selector::{replicas_unless_overridden, select_mutators};
pub use workload::{ArgsSync, ContainerResourcesSync, EnvSync, ReplicasSync};
