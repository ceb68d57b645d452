mod diagnostics;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use rayon::prelude::*;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::TaskId;
use crate::engine::context::Provided;
use crate::engine::{BuildContext, BuildFn, RunContext, RunOutput, TaskGraph};
use crate::error::{Phase, ProviderError, SyncError, TaskExecutionError};
use crate::io::{PHASE_STYLE, TASK_STYLE, as_overhead};
use crate::output::{FileEntry, PostWriteCommand};
use crate::provider::{FinalizedStore, ProviderStore, Resolution};

pub use diagnostics::{Diagnostics, TaskDiagnostics, TaskExecution};

/// What one task rendered during the build phase.
pub(crate) struct BuildOutput {
    pub task: NodeIndex,
    pub files: Vec<FileEntry>,
    pub commands: Vec<PostWriteCommand>,
}

/// Runs both phases over the graph. Build outputs come back in topological
/// order, whatever order the workers finished in.
pub(crate) fn execute(graph: &TaskGraph) -> Result<(Vec<BuildOutput>, Diagnostics), SyncError> {
    let s = Instant::now();

    let store = ProviderStore::new(&graph.registry);
    let (builds, run_times) = run_phase(graph, &store)?;

    let store = store.finalize();
    let (outputs, build_times) = build_phase(graph, &store, builds)?;

    tracing::info!("Generated {} tasks {}", graph.order.len(), as_overhead(s));

    let diagnostics = Diagnostics::new(graph, run_times, build_times);
    Ok((outputs, diagnostics))
}

/// Executes every task's `run` on the rayon pool. A task is spawned as soon
/// as the producers of its run-phase dependencies have finished and their
/// values have been published.
fn run_phase(
    graph: &TaskGraph,
    store: &ProviderStore,
) -> Result<(HashMap<NodeIndex, BuildFn>, HashMap<NodeIndex, TaskExecution>), SyncError> {
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .graph
        .node_indices()
        .map(|index| (index, graph.dependency_count(index)))
        .collect();

    let total_tasks = graph.graph.node_count();
    let mut completed_tasks = 0;

    let mut builds = HashMap::new();
    let mut execution_times = HashMap::new();

    if total_tasks == 0 {
        return Ok((builds, execution_times));
    }

    let root_span = tracing::span!(Level::INFO, "run_phase");
    root_span.pb_set_length(total_tasks as u64);
    root_span.pb_set_style(&PHASE_STYLE);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    rayon::scope(|s| -> Result<(), SyncError> {
        let (result_sender, result_receiver) =
            channel::<(NodeIndex, Result<RunOutput, SyncError>, TaskExecution)>();

        let spawn_task = |index: NodeIndex| {
            let task = graph.task(index);
            let resolution = &graph.registry.resolved[index.index()];
            let sender = result_sender.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", id = %task.id);
                span.pb_set_style(&TASK_STYLE);
                span.pb_set_message(&format!("Running {}", task.id));
                let _enter = span.enter();

                let context = RunContext {
                    task: &task.id,
                    resolution,
                    store,
                };

                let start = Instant::now();
                let output = guard(|| (task.run)(&context))
                    .map_err(|error| task_error(&task.id, Phase::Run, error));
                let duration = start.elapsed();

                // The receiver is gone once an earlier task has failed.
                let _ = sender.send((index, output, TaskExecution { start, duration }));
            });
        };

        for &index in &graph.order {
            if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                spawn_task(index);
            }
        }

        while completed_tasks < total_tasks {
            let Some((index, output, execution)) = receive(&result_receiver) else {
                break;
            };

            let output = output?;
            let task = graph.task(index);
            let resolution = &graph.registry.resolved[index.index()];

            publish(store, resolution, output.provided)
                .map_err(|error| task_error(&task.id, Phase::Run, error.into()))?;

            // Contributors may drop the error of a rejected key; the key is
            // still taken.
            for (export, slot) in &resolution.exports {
                if let Some(key) = store.rejected(*slot, &task.id) {
                    return Err(SyncError::DuplicateKey {
                        provider: export.kind.name.to_string(),
                        key,
                        task: task.id.clone(),
                    });
                }
            }

            if let Some(build) = output.build {
                builds.insert(index, build);
            }

            execution_times.insert(index, execution);
            completed_tasks += 1;
            root_span.pb_inc(1);

            if let Some(dependents_of_completed) = dependents.get(&index) {
                for &dependent in dependents_of_completed {
                    if let Some(count) = dependency_counts.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            spawn_task(dependent);
                        }
                    }
                }
            }
        }

        Ok(())
    })?;

    tracing::debug!("run phase complete");
    Ok((builds, execution_times))
}

/// Waits for the next finished task. The scheduler itself occupies a pool
/// thread, so while nothing has arrived it helps with queued tasks instead
/// of blocking; on a single-threaded pool blocking would never return.
fn receive<T>(receiver: &Receiver<T>) -> Option<T> {
    loop {
        match receiver.try_recv() {
            Ok(message) => return Some(message),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        if matches!(rayon::yield_now(), Some(rayon::Yield::Executed)) {
            continue;
        }

        match receiver.recv_timeout(Duration::from_millis(1)) {
            Ok(message) => return Some(message),
            Err(RecvTimeoutError::Disconnected) => return None,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Checks the values a task handed back against its declared exports, then
/// makes them visible to dependents.
fn publish(
    store: &ProviderStore,
    resolution: &Resolution,
    provided: Vec<Provided>,
) -> Result<(), ProviderError> {
    for item in provided {
        let Some((export, slot)) = resolution
            .export(item.name)
            .filter(|(export, _)| !export.kind.additive)
        else {
            return Err(ProviderError::NotExported(item.name.to_string()));
        };

        if export.kind.type_id != item.type_id {
            return Err(ProviderError::TypeMismatch {
                provider: item.name.to_string(),
                expected: export.kind.type_name,
            });
        }

        store.publish(*slot, item.value)?;
    }

    for (export, slot) in &resolution.exports {
        if !export.kind.additive && store.single(*slot).is_none() {
            return Err(ProviderError::MissingExport(export.kind.name.to_string()));
        }
    }

    Ok(())
}

/// Executes the deferred build closures against the frozen store.
///
/// Tasks are grouped by their depth in the graph: the longest chain of
/// run-phase dependencies leading to them. No path connects two tasks of the
/// same depth, so a level runs in parallel, and levels run one after another.
fn build_phase(
    graph: &TaskGraph,
    store: &FinalizedStore,
    mut builds: HashMap<NodeIndex, BuildFn>,
) -> Result<(Vec<BuildOutput>, HashMap<NodeIndex, TaskExecution>), SyncError> {
    let mut levels: Vec<Vec<(NodeIndex, BuildFn)>> = Vec::new();
    for (index, level) in levels_of(graph) {
        if let Some(build) = builds.remove(&index) {
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push((index, build));
        }
    }

    let total: usize = levels.iter().map(Vec::len).sum();

    let root_span = tracing::span!(Level::INFO, "build_phase");
    root_span.pb_set_length(total as u64);
    root_span.pb_set_style(&PHASE_STYLE);
    root_span.pb_set_message("Building outputs...");
    let _enter = root_span.enter();

    let mut outputs = Vec::with_capacity(total);
    let mut execution_times = HashMap::new();

    for level in levels {
        let results: Vec<_> = level
            .into_par_iter()
            .map(|(index, build)| -> Result<(BuildOutput, TaskExecution), SyncError> {
                let task = graph.task(index);
                let resolution = &graph.registry.resolved[index.index()];

                let span = tracing::span!(Level::INFO, "build", id = %task.id);
                span.pb_set_style(&TASK_STYLE);
                span.pb_set_message(&format!("Building {}", task.id));
                let _enter = span.enter();

                let mut context = BuildContext::new(&task.id, resolution, store);

                let start = Instant::now();
                let result = guard(|| build(&mut context));
                let duration = start.elapsed();
                root_span.pb_inc(1);

                result.map_err(|error| task_error(&task.id, Phase::Build, error))?;

                Ok((
                    BuildOutput {
                        task: index,
                        files: context.files,
                        commands: context.commands,
                    },
                    TaskExecution { start, duration },
                ))
            })
            .collect();

        // The first failure of the level, in topological order, wins.
        for result in results {
            let (output, execution) = result?;
            execution_times.insert(output.task, execution);
            outputs.push(output);
        }
    }

    // Outputs are merged in the same order tasks ran.
    let position: HashMap<NodeIndex, usize> = graph
        .order
        .iter()
        .enumerate()
        .map(|(position, &index)| (index, position))
        .collect();
    outputs.sort_by_key(|output| position[&output.task]);

    tracing::debug!("build phase complete");
    Ok((outputs, execution_times))
}

/// Every task with its depth, in topological order. Depth is the number of
/// tasks on the longest dependency chain leading to it.
fn levels_of(graph: &TaskGraph) -> Vec<(NodeIndex, usize)> {
    let mut depth: HashMap<NodeIndex, usize> = HashMap::new();

    graph
        .order
        .iter()
        .map(|&index| {
            let level = graph
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|producer| depth.get(&producer))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);
            depth.insert(index, level);
            (index, level)
        })
        .collect()
}

/// Turns a panic inside a task closure into an ordinary task error.
fn guard<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
}

fn task_error(task: &TaskId, phase: Phase, error: anyhow::Error) -> SyncError {
    if let Some(ProviderError::DuplicateKey { provider, key, .. }) =
        error.downcast_ref::<ProviderError>()
    {
        return SyncError::DuplicateKey {
            provider: provider.clone(),
            key: key.clone(),
            task: task.clone(),
        };
    }

    TaskExecutionError {
        task: task.clone(),
        phase,
        source: error,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::provider::{AdditiveType, ProviderType, Scope};
    use crate::tree::GeneratorNode;

    const COUNT: ProviderType<u32> = ProviderType::new("count");
    const DOUBLED: ProviderType<u32> = ProviderType::new("doubled");
    const ROUTES: AdditiveType<String> = AdditiveType::new("routes");

    fn files(outputs: &[BuildOutput]) -> Vec<(String, String)> {
        outputs
            .iter()
            .flat_map(|output| &output.files)
            .map(|file| {
                let text = String::from_utf8_lossy(file.contents.as_bytes()).into_owned();
                (file.path.to_string(), text)
            })
            .collect()
    }

    #[test]
    fn test_dependency_values_flow() {
        let mut app = GeneratorNode::new("app");
        app.task("count")
            .exports(&COUNT, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&COUNT, 21)));
        app.task("double")
            .depends_on(&COUNT)
            .exports(&DOUBLED, Scope::Project)
            .run(|ctx| {
                let count = *ctx.get(&COUNT)?;
                Ok(RunOutput::new().provide(&DOUBLED, count * 2))
            });
        app.task("render").reads(&DOUBLED).build(|ctx| {
            let value = ctx.get(&DOUBLED)?;
            ctx.write(FileEntry::text("answer", "answer.txt", format!("{value}")));
            Ok(())
        });

        let graph = TaskGraph::build(&app).unwrap();
        let (outputs, diagnostics) = execute(&graph).unwrap();

        assert_eq!(files(&outputs), vec![("answer.txt".into(), "42".into())]);
        assert_eq!(diagnostics.tasks.len(), 3);
    }

    #[test]
    fn test_additive_visible_only_in_build() {
        let mut app = GeneratorNode::new("app");
        for name in ["users", "posts"] {
            app.child(name, move |node: &mut GeneratorNode| {
                node.task("route")
                    .contributes(&ROUTES, Scope::Project)
                    .run(move |ctx| {
                        ctx.collector(&ROUTES)?.add(name, format!("/{name}"))?;
                        Ok(RunOutput::new())
                    });
            });
        }
        app.task("router").collects(&ROUTES).build(|ctx| {
            let routes: Vec<_> = ctx.collected(&ROUTES)?.values().cloned().collect();
            ctx.write(FileEntry::text("router", "routes.txt", routes.join(",")));
            Ok(())
        });

        let graph = TaskGraph::build(&app).unwrap();
        let (outputs, _) = execute(&graph).unwrap();

        assert_eq!(
            files(&outputs),
            vec![("routes.txt".into(), "/posts,/users".into())]
        );
    }

    #[test]
    fn test_duplicate_additive_key() {
        let mut app = GeneratorNode::new("app");
        for name in ["a", "b"] {
            app.child(name, |node: &mut GeneratorNode| {
                node.task("route")
                    .contributes(&ROUTES, Scope::Project)
                    .run(|ctx| {
                        ctx.collector(&ROUTES)?.add("same", "/".to_string())?;
                        Ok(RunOutput::new())
                    });
            });
        }

        let graph = TaskGraph::build(&app).unwrap();
        let err = execute(&graph).err().unwrap();

        assert!(matches!(
            err,
            SyncError::DuplicateKey { ref provider, ref key, .. } if provider == "routes" && key == "same"
        ));
    }

    #[test]
    fn test_discarded_duplicate_key_still_fails() {
        let mut app = GeneratorNode::new("app");
        for name in ["a", "b"] {
            app.child(name, |node: &mut GeneratorNode| {
                node.task("route")
                    .contributes(&ROUTES, Scope::Project)
                    .run(|ctx| {
                        let _ = ctx.collector(&ROUTES)?.add("same", "/".to_string());
                        Ok(RunOutput::new())
                    });
            });
        }

        let graph = TaskGraph::build(&app).unwrap();
        let err = execute(&graph).err().unwrap();

        assert!(matches!(
            err,
            SyncError::DuplicateKey { ref key, .. } if key == "same"
        ));
    }

    #[test]
    fn test_value_provided_twice() {
        let mut app = GeneratorNode::new("app");
        app.task("count")
            .exports(&COUNT, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&COUNT, 1).provide(&COUNT, 2)));

        let graph = TaskGraph::build(&app).unwrap();
        let err = execute(&graph).err().unwrap();

        let SyncError::Task(error) = err else {
            panic!("expected a task error");
        };
        assert!(matches!(
            error.source.downcast_ref::<ProviderError>(),
            Some(ProviderError::AlreadyProvided(name)) if name == "count"
        ));
    }

    #[test]
    fn test_builds_follow_dependencies() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut app = GeneratorNode::new("app");
        let first = log.clone();
        app.task("count")
            .exports(&COUNT, Scope::Project)
            .run(move |_| {
                let log = first.clone();
                Ok(RunOutput::new().provide(&COUNT, 1).build(move |_| {
                    std::thread::sleep(Duration::from_millis(20));
                    log.lock().unwrap().push("count");
                    Ok(())
                }))
            });
        let second = log.clone();
        app.task("double")
            .depends_on(&COUNT)
            .exports(&DOUBLED, Scope::Project)
            .run(move |ctx| {
                let log = second.clone();
                let count = *ctx.get(&COUNT)?;
                Ok(RunOutput::new().provide(&DOUBLED, count * 2).build(move |_| {
                    log.lock().unwrap().push("double");
                    Ok(())
                }))
            });

        let graph = TaskGraph::build(&app).unwrap();
        execute(&graph).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["count", "double"]);
    }

    #[test]
    fn test_panic_becomes_task_error() {
        let mut app = GeneratorNode::new("app");
        app.task("boom").run(|_| panic!("exploded"));

        let graph = TaskGraph::build(&app).unwrap();
        let err = execute(&graph).err().unwrap();

        let SyncError::Task(error) = err else {
            panic!("expected a task error");
        };
        assert_eq!(error.phase, Phase::Run);
        assert!(error.source.to_string().contains("exploded"));
    }

    #[test]
    fn test_missing_export() {
        let mut app = GeneratorNode::new("app");
        app.task("lazy")
            .exports(&COUNT, Scope::Project)
            .run(|_| Ok(RunOutput::new()));

        let graph = TaskGraph::build(&app).unwrap();
        let err = execute(&graph).err().unwrap();

        let SyncError::Task(error) = err else {
            panic!("expected a task error");
        };
        assert!(matches!(
            error.source.downcast_ref::<ProviderError>(),
            Some(ProviderError::MissingExport(name)) if name == "count"
        ));
    }

    #[test]
    fn test_build_read_breaks_cycle() {
        let runs = Arc::new(AtomicUsize::new(0));

        let mut app = GeneratorNode::new("app");
        let counter = runs.clone();
        app.task("parent")
            .depends_on(&DOUBLED)
            .exports(&COUNT, Scope::Project)
            .run(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let doubled = *ctx.get(&DOUBLED)?;
                Ok(RunOutput::new().provide(&COUNT, doubled + 1))
            });
        app.task("child")
            .reads(&COUNT)
            .exports(&DOUBLED, Scope::Project)
            .run(|_| {
                Ok(RunOutput::new().provide(&DOUBLED, 10).build(|ctx| {
                    let parent = ctx.get(&COUNT)?;
                    ctx.write(FileEntry::text("child", "child.txt", parent.to_string()));
                    Ok(())
                }))
            });

        let graph = TaskGraph::build(&app).unwrap();
        let (outputs, _) = execute(&graph).unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(files(&outputs), vec![("child.txt".into(), "11".into())]);
    }

    #[test]
    fn test_build_read_unavailable_during_run() {
        let mut app = GeneratorNode::new("app");
        app.task("count")
            .exports(&COUNT, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&COUNT, 1)));
        app.task("eager").reads(&COUNT).run(|ctx| {
            ctx.get(&COUNT)?;
            Ok(RunOutput::new())
        });

        let graph = TaskGraph::build(&app).unwrap();
        let err = execute(&graph).err().unwrap();

        let SyncError::Task(error) = err else {
            panic!("expected a task error");
        };
        assert!(matches!(
            error.source.downcast_ref::<ProviderError>(),
            Some(ProviderError::Unavailable(_))
        ));
    }
}
