use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::core::{Dynamic, TaskId};
use crate::error::ProviderError;
use crate::provider::Registry;

pub(crate) struct Contribution {
    value: Dynamic,
    owner: TaskId,
}

type Entries = BTreeMap<String, Contribution>;

#[derive(Default)]
struct Contributions {
    entries: Entries,
    /// Keys a task tried to claim after another task already had them.
    rejected: Vec<(String, TaskId)>,
}

enum Cell {
    Single(OnceLock<Dynamic>),
    /// Writers are serialized per provider, whichever tasks they come from.
    Additive(Mutex<Contributions>),
}

/// Provider values while the run phase is in progress.
///
/// Single values are published by the scheduler once their producer's `run`
/// has settled. Additive values are only writable, through [`Collector`].
pub(crate) struct ProviderStore {
    cells: Vec<Cell>,
    names: Vec<&'static str>,
}

impl ProviderStore {
    pub fn new(registry: &Registry) -> Self {
        let cells = registry
            .slots
            .iter()
            .map(|slot| match slot.kind.additive {
                true => Cell::Additive(Mutex::default()),
                false => Cell::Single(OnceLock::new()),
            })
            .collect();

        let names = registry.slots.iter().map(|slot| slot.kind.name).collect();

        Self { cells, names }
    }

    pub fn publish(&self, slot: usize, value: Dynamic) -> Result<(), ProviderError> {
        match &self.cells[slot] {
            Cell::Single(cell) => cell
                .set(value)
                .map_err(|_| ProviderError::AlreadyProvided(self.names[slot].to_string())),
            Cell::Additive(_) => Err(ProviderError::NotExported(self.names[slot].to_string())),
        }
    }

    /// The first key `task` failed to contribute to an additive slot, whether
    /// or not the task looked at the error.
    pub fn rejected(&self, slot: usize, task: &TaskId) -> Option<String> {
        let Cell::Additive(cell) = &self.cells[slot] else {
            return None;
        };

        let contributions = cell.lock().unwrap_or_else(PoisonError::into_inner);
        contributions
            .rejected
            .iter()
            .find(|(_, owner)| owner == task)
            .map(|(key, _)| key.clone())
    }

    pub fn single(&self, slot: usize) -> Option<&Dynamic> {
        match &self.cells[slot] {
            Cell::Single(cell) => cell.get(),
            Cell::Additive(_) => None,
        }
    }

    pub fn collector<'a, V>(&'a self, slot: usize, owner: &'a TaskId) -> Option<Collector<'a, V>> {
        match &self.cells[slot] {
            Cell::Additive(cell) => Some(Collector {
                cell,
                provider: self.names[slot],
                owner,
                _phantom: PhantomData,
            }),
            Cell::Single(_) => None,
        }
    }

    /// Closes the run phase. From here on nothing can be contributed.
    pub fn finalize(self) -> FinalizedStore {
        let cells = self
            .cells
            .into_iter()
            .map(|cell| match cell {
                Cell::Single(cell) => Finalized::Single(cell.into_inner()),
                Cell::Additive(cell) => Finalized::Additive(
                    cell.into_inner()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entries,
                ),
            })
            .collect();

        FinalizedStore { cells }
    }
}

enum Finalized {
    Single(Option<Dynamic>),
    Additive(Entries),
}

/// Provider values during the build phase. Everything is read-only.
pub(crate) struct FinalizedStore {
    cells: Vec<Finalized>,
}

impl FinalizedStore {
    pub fn single(&self, slot: usize) -> Option<&Dynamic> {
        match &self.cells[slot] {
            Finalized::Single(value) => value.as_ref(),
            Finalized::Additive(_) => None,
        }
    }

    pub fn collected<V>(&self, slot: usize) -> Option<Collected<'_, V>> {
        match &self.cells[slot] {
            Finalized::Additive(map) => Some(Collected {
                map,
                _phantom: PhantomData,
            }),
            Finalized::Single(_) => None,
        }
    }
}

/// Write access to an additive provider, available only during `run`.
///
/// Keys are unique across every contributor of the provider; adding a key
/// twice fails with [`ProviderError::DuplicateKey`] naming the task that
/// claimed it first.
pub struct Collector<'a, V> {
    cell: &'a Mutex<Contributions>,
    provider: &'static str,
    owner: &'a TaskId,
    _phantom: PhantomData<fn(V)>,
}

impl<V> Collector<'_, V>
where
    V: Send + Sync + 'static,
{
    pub fn add(&self, key: impl Into<String>, value: V) -> Result<(), ProviderError> {
        let mut contributions = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        let Contributions { entries, rejected } = &mut *contributions;

        match entries.entry(key.into()) {
            Entry::Occupied(entry) => {
                rejected.push((entry.key().clone(), self.owner.clone()));
                Err(ProviderError::DuplicateKey {
                    provider: self.provider.to_string(),
                    key: entry.key().clone(),
                    owner: entry.get().owner.clone(),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(Contribution {
                    value: Arc::new(value),
                    owner: self.owner.clone(),
                });
                Ok(())
            }
        }
    }
}

/// The finished contents of an additive provider, available during `build`.
/// Entries iterate in key order, independent of which task finished first.
pub struct Collected<'a, V> {
    map: &'a Entries,
    _phantom: PhantomData<fn() -> V>,
}

impl<'a, V> Collected<'a, V>
where
    V: Send + Sync + 'static,
{
    pub fn get(&self, key: &str) -> Option<&'a V> {
        self.map
            .get(key)
            .and_then(|entry| entry.value.downcast_ref::<V>())
    }

    /// The task that contributed `key`.
    pub fn contributor(&self, key: &str) -> Option<&'a TaskId> {
        self.map.get(key).map(|entry| &entry.owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a V)> + 'a {
        self.map.iter().filter_map(|(key, entry)| {
            entry
                .value
                .downcast_ref::<V>()
                .map(|value| (key.as_str(), value))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.map.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &'a V> + 'a {
        self.iter().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
