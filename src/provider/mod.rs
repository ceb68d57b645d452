//! Typed, scoped capabilities shared between tasks.
//!
//! A provider is a named value produced by one task and consumed by others.
//! Providers are declared through typed tokens, so a dependency on
//! [`ProviderType<T>`] resolves to a `&T` and the wiring is checked when the
//! task graph is built, long before any task runs.
//!
//! ## Provider kinds
//!
//! * [`ProviderType<T>`]: a single value, produced by exactly one task in a
//!   given scope.
//! * [`AdditiveType<V>`]: a keyed collection many tasks contribute to during
//!   the run phase. Contributions go through a [`Collector`] while tasks run,
//!   and the finished collection is read through [`Collected`] once every
//!   task has run. Keys must be unique across all contributors.
//!
//! ## Scopes
//!
//! Every export carries a [`Scope`] that decides which tasks can see it. See
//! the variant docs for the exact visibility rules.

mod registry;
mod store;

use std::any::{TypeId, type_name};
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

pub(crate) use registry::{Registry, Resolution};
pub use store::{Collected, Collector};
pub(crate) use store::{FinalizedStore, ProviderStore};

/// How far an exported provider is visible in the generator tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Visible only to the tasks of the node that declares the export.
    Instance,
    /// Visible to every task below the nearest package root above (or at) the
    /// declaring node. Without any package root, the whole tree.
    Package,
    /// Visible to every task in the tree.
    Project,
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Instance => write!(f, "instance scope"),
            Scope::Package => write!(f, "package scope"),
            Scope::Project => write!(f, "project scope"),
        }
    }
}

/// A typed token for a single-valued provider.
///
/// ```rust
/// use tsugite::ProviderType;
///
/// struct Config {
///     crate_name: String,
/// }
///
/// const CONFIG: ProviderType<Config> = ProviderType::new("config");
/// ```
pub struct ProviderType<T> {
    name: &'static str,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> ProviderType<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ProviderType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ProviderType<T> {}

/// A typed token for an additive, keyed provider. `V` is the type of a single
/// contribution.
pub struct AdditiveType<V> {
    name: &'static str,
    _phantom: PhantomData<fn() -> V>,
}

impl<V> AdditiveType<V> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<V> Clone for AdditiveType<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for AdditiveType<V> {}

/// Runtime description of a provider kind, erased from its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Kind {
    pub name: &'static str,
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub additive: bool,
}

impl Kind {
    pub fn single<T: Send + Sync + 'static>(token: &ProviderType<T>) -> Self {
        Self {
            name: token.name,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            additive: false,
        }
    }

    pub fn additive<V: Send + Sync + 'static>(token: &AdditiveType<V>) -> Self {
        Self {
            name: token.name,
            type_id: TypeId::of::<V>(),
            type_name: type_name::<V>(),
            additive: true,
        }
    }

    pub fn describe(&self) -> &'static str {
        self.type_name
    }
}

/// When a dependency has to be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timing {
    /// The producer must finish `run` before the dependent task's `run`.
    Run,
    /// The value is only read during `build`, after every task has run. No
    /// ordering edge is added, which is what allows back-references.
    Build,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Requirement {
    pub kind: Kind,
    pub timing: Timing,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Export {
    pub kind: Kind,
    pub scope: Scope,
}
