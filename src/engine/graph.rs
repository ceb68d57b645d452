use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::TaskId;
use crate::error::{ConfigurationError, SyncError};
use crate::provider::{Registry, Timing};
use crate::tree::{FlatTask, FlatTree, GeneratorNode};

/// The validated task graph of a generator tree.
///
/// Node `i` of `graph` is task `i` of `tree`. An edge `a -> b` means `a` has
/// to finish `run` before `b` may start. Only run-phase dependencies on
/// single providers add edges; build-phase reads and additive collections
/// never do.
pub(crate) struct TaskGraph {
    pub tree: FlatTree,
    pub registry: Registry,
    pub graph: DiGraph<usize, ()>,
    /// A topological order of the graph, stable for a given tree.
    pub order: Vec<NodeIndex>,
}

impl TaskGraph {
    pub fn build(root: &GeneratorNode) -> Result<Self, SyncError> {
        let tree = root.flatten()?;
        let registry = Registry::build(&tree)?;

        let mut graph = DiGraph::with_capacity(tree.tasks.len(), tree.tasks.len());
        for index in 0..tree.tasks.len() {
            graph.add_node(index);
        }

        for (task, resolution) in registry.resolved.iter().enumerate() {
            for (requirement, slot) in &resolution.requirements {
                if requirement.timing != Timing::Run || requirement.kind.additive {
                    continue;
                }

                let producer = registry.producer(*slot);
                graph.update_edge(NodeIndex::new(producer), NodeIndex::new(task), ());
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            let path = cycle
                .into_iter()
                .map(|index| tree.tasks[index.index()].id.clone())
                .collect();

            return Err(ConfigurationError::Cycle(path).into());
        }

        let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
            let id = tree.tasks[cycle.node_id().index()].id.clone();
            ConfigurationError::Cycle(vec![id.clone(), id])
        })?;

        tracing::debug!(
            tasks = graph.node_count(),
            edges = graph.edge_count(),
            "task graph built"
        );

        Ok(Self {
            tree,
            registry,
            graph,
            order,
        })
    }

    pub fn task(&self, index: NodeIndex) -> &FlatTask {
        &self.tree.tasks[index.index()]
    }

    pub fn id(&self, index: NodeIndex) -> &TaskId {
        &self.task(index).id
    }

    pub fn dependency_count(&self, index: NodeIndex) -> usize {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Active,
    Done,
}

/// Depth-first search for a cycle, visiting nodes and successors in index
/// order so the reported path is the same on every run. The path starts and
/// ends with the same node.
fn find_cycle(graph: &DiGraph<usize, ()>) -> Option<Vec<NodeIndex>> {
    let mut marks = vec![Mark::New; graph.node_count()];

    for start in graph.node_indices() {
        if marks[start.index()] != Mark::New {
            continue;
        }

        marks[start.index()] = Mark::Active;
        let mut stack = vec![(start, successors(graph, start))];

        loop {
            let Some(top) = stack.last_mut() else {
                break;
            };
            let node = top.0;

            match top.1.pop() {
                Some(next) => match marks[next.index()] {
                    Mark::New => {
                        marks[next.index()] = Mark::Active;
                        stack.push((next, successors(graph, next)));
                    }
                    Mark::Active => {
                        let from = stack
                            .iter()
                            .position(|(index, _)| *index == next)
                            .unwrap_or(0);

                        let mut cycle: Vec<_> = stack[from..].iter().map(|(index, _)| *index).collect();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Mark::Done => {}
                },
                None => {
                    marks[node.index()] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }

    None
}

/// Successors in descending order, so popping yields them ascending.
fn successors(graph: &DiGraph<usize, ()>, node: NodeIndex) -> Vec<NodeIndex> {
    let mut next: Vec<_> = graph.neighbors(node).collect();
    next.sort_unstable_by(|a, b| b.cmp(a));
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AdditiveType, ProviderType, Scope};
    use crate::RunOutput;

    const A: ProviderType<u32> = ProviderType::new("a");
    const B: ProviderType<u32> = ProviderType::new("b");
    const C: ProviderType<u32> = ProviderType::new("c");
    const ITEMS: AdditiveType<u32> = AdditiveType::new("items");

    fn position(graph: &TaskGraph, name: &str) -> usize {
        graph
            .order
            .iter()
            .position(|&index| graph.task(index).id.name.as_ref() == name)
            .unwrap()
    }

    #[test]
    fn test_order_follows_dependencies() {
        let mut app = GeneratorNode::new("app");
        app.task("last")
            .depends_on(&B)
            .run(|_| Ok(RunOutput::new()));
        app.task("middle")
            .depends_on(&A)
            .exports(&B, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&B, 2)));
        app.task("first")
            .exports(&A, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&A, 1)));

        let graph = TaskGraph::build(&app).unwrap();

        assert_eq!(graph.graph.edge_count(), 2);
        assert!(position(&graph, "first") < position(&graph, "middle"));
        assert!(position(&graph, "middle") < position(&graph, "last"));
    }

    #[test]
    fn test_cycle_reports_path() {
        let mut app = GeneratorNode::new("app");
        app.task("x")
            .depends_on(&C)
            .exports(&A, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&A, 1)));
        app.task("y")
            .depends_on(&A)
            .exports(&B, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&B, 2)));
        app.task("z")
            .depends_on(&B)
            .exports(&C, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&C, 3)));

        let err = TaskGraph::build(&app).err().unwrap();
        let SyncError::Configuration(ConfigurationError::Cycle(path)) = err else {
            panic!("expected a cycle");
        };

        let names: Vec<_> = path.iter().map(|id| id.name.to_string()).collect();
        assert_eq!(names, vec!["x", "y", "z", "x"]);
    }

    #[test]
    fn test_build_reads_allow_back_references() {
        let mut app = GeneratorNode::new("app");
        app.task("parent")
            .depends_on(&B)
            .exports(&A, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&A, 1)));
        app.task("child")
            .reads(&A)
            .exports(&B, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&B, 2)));

        let graph = TaskGraph::build(&app).unwrap();

        assert_eq!(graph.graph.edge_count(), 1);
        assert!(position(&graph, "child") < position(&graph, "parent"));
    }

    #[test]
    fn test_additive_adds_no_edges() {
        let mut app = GeneratorNode::new("app");
        app.task("reader")
            .collects(&ITEMS)
            .run(|_| Ok(RunOutput::new()));
        app.task("writer")
            .contributes(&ITEMS, Scope::Project)
            .run(|_| Ok(RunOutput::new()));

        let graph = TaskGraph::build(&app).unwrap();
        assert_eq!(graph.graph.edge_count(), 0);
    }
}
