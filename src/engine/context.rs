use std::any::{TypeId, type_name};
use std::sync::Arc;

use crate::core::{Dynamic, TaskId};
use crate::error::ProviderError;
use crate::output::{FileEntry, PostWriteCommand};
use crate::provider::{
    AdditiveType, Collected, Collector, FinalizedStore, ProviderStore, ProviderType, Resolution,
    Timing,
};

/// Run-phase closure of a task.
pub(crate) type RunFn = Arc<dyn Fn(&RunContext<'_>) -> anyhow::Result<RunOutput> + Send + Sync>;

/// Deferred build-phase closure returned from `run`.
pub(crate) type BuildFn = Box<dyn FnOnce(&mut BuildContext<'_>) -> anyhow::Result<()> + Send>;

pub(crate) struct Provided {
    pub name: &'static str,
    pub type_id: TypeId,
    pub value: Dynamic,
}

/// What a task's `run` hands back to the scheduler: the values of its
/// exported providers and, optionally, the closure to call in the build
/// phase.
#[derive(Default)]
pub struct RunOutput {
    pub(crate) provided: Vec<Provided>,
    pub(crate) build: Option<BuildFn>,
}

impl RunOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value of an exported provider. Dependents may run as soon as
    /// this task's `run` has returned.
    pub fn provide<T>(mut self, provider: &ProviderType<T>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.provided.push(Provided {
            name: provider.name(),
            type_id: TypeId::of::<T>(),
            value: Arc::new(value),
        });
        self
    }

    /// Defers rendering to the build phase, which starts once every task in
    /// the graph has finished `run`.
    pub fn build<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&mut BuildContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.build = Some(Box::new(callback));
        self
    }
}

/// The view of the providers a task gets during `run`.
///
/// Only run-phase dependencies can be read here. Additive providers the task
/// contributes to are reachable through [`RunContext::collector`], which is
/// write-only.
pub struct RunContext<'a> {
    pub(crate) task: &'a TaskId,
    pub(crate) resolution: &'a Resolution,
    pub(crate) store: &'a ProviderStore,
}

impl<'a> RunContext<'a> {
    pub fn task(&self) -> &'a TaskId {
        self.task
    }

    pub fn get<T>(&self, provider: &ProviderType<T>) -> Result<&'a T, ProviderError>
    where
        T: Send + Sync + 'static,
    {
        let name = provider.name();

        let (requirement, slot) = self
            .resolution
            .requirement(name)
            .filter(|(requirement, _)| !requirement.kind.additive)
            .ok_or_else(|| ProviderError::NotDeclared(name.to_string()))?;

        if requirement.timing == Timing::Build {
            return Err(ProviderError::Unavailable(name.to_string()));
        }

        let value = self
            .store
            .single(*slot)
            .ok_or_else(|| ProviderError::Unavailable(name.to_string()))?;

        downcast(name, value)
    }

    pub fn collector<V>(&self, provider: &AdditiveType<V>) -> Result<Collector<'a, V>, ProviderError>
    where
        V: Send + Sync + 'static,
    {
        let name = provider.name();

        let (export, slot) = self
            .resolution
            .export(name)
            .filter(|(export, _)| export.kind.additive)
            .ok_or_else(|| ProviderError::NotExported(name.to_string()))?;

        if export.kind.type_id != TypeId::of::<V>() {
            return Err(ProviderError::TypeMismatch {
                provider: name.to_string(),
                expected: type_name::<V>(),
            });
        }

        self.store
            .collector(*slot, self.task)
            .ok_or_else(|| ProviderError::NotExported(name.to_string()))
    }
}

/// The view a task gets during `build`: every provider it declared, with its
/// final value, plus the sinks for output files and post-write commands.
pub struct BuildContext<'a> {
    pub(crate) task: &'a TaskId,
    pub(crate) resolution: &'a Resolution,
    pub(crate) store: &'a FinalizedStore,
    pub(crate) files: Vec<FileEntry>,
    pub(crate) commands: Vec<PostWriteCommand>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(
        task: &'a TaskId,
        resolution: &'a Resolution,
        store: &'a FinalizedStore,
    ) -> Self {
        Self {
            task,
            resolution,
            store,
            files: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn task(&self) -> &'a TaskId {
        self.task
    }

    pub fn get<T>(&self, provider: &ProviderType<T>) -> Result<&'a T, ProviderError>
    where
        T: Send + Sync + 'static,
    {
        let name = provider.name();

        let (_, slot) = self
            .resolution
            .requirement(name)
            .filter(|(requirement, _)| !requirement.kind.additive)
            .ok_or_else(|| ProviderError::NotDeclared(name.to_string()))?;

        let value = self
            .store
            .single(*slot)
            .ok_or_else(|| ProviderError::Unavailable(name.to_string()))?;

        downcast(name, value)
    }

    /// The finished contents of an additive provider. Both readers declared
    /// with `collects` and the contributors themselves may call this.
    pub fn collected<V>(&self, provider: &AdditiveType<V>) -> Result<Collected<'a, V>, ProviderError>
    where
        V: Send + Sync + 'static,
    {
        let name = provider.name();

        let slot = self
            .resolution
            .requirement(name)
            .filter(|(requirement, _)| requirement.kind.additive)
            .map(|(requirement, slot)| (requirement.kind, *slot))
            .or_else(|| {
                self.resolution
                    .export(name)
                    .filter(|(export, _)| export.kind.additive)
                    .map(|(export, slot)| (export.kind, *slot))
            });

        let (kind, slot) = slot.ok_or_else(|| ProviderError::NotDeclared(name.to_string()))?;

        if kind.type_id != TypeId::of::<V>() {
            return Err(ProviderError::TypeMismatch {
                provider: name.to_string(),
                expected: type_name::<V>(),
            });
        }

        self.store
            .collected(slot)
            .ok_or_else(|| ProviderError::Unavailable(name.to_string()))
    }

    /// Adds a file to this run's output.
    pub fn write(&mut self, entry: FileEntry) {
        self.files.push(entry);
    }

    /// Schedules a command to run after the files have been written.
    pub fn command(&mut self, command: PostWriteCommand) {
        self.commands.push(command);
    }
}

fn downcast<'a, T>(name: &str, value: &'a Dynamic) -> Result<&'a T, ProviderError>
where
    T: Send + Sync + 'static,
{
    value
        .downcast_ref::<T>()
        .ok_or_else(|| ProviderError::TypeMismatch {
            provider: name.to_string(),
            expected: type_name::<T>(),
        })
}
