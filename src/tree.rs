use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{ArcStr, NodePath, TaskId};
use crate::engine::{BuildContext, RunContext, RunFn, RunOutput};
use crate::error::ConfigurationError;
use crate::provider::{AdditiveType, Export, Kind, ProviderType, Requirement, Scope, Timing};

/// A composable unit that fills a [`GeneratorNode`] with tasks and children.
///
/// Generator catalogs implement this trait; plain closures taking
/// `&mut GeneratorNode` implement it as well.
pub trait Generator {
    fn compose(&self, node: &mut GeneratorNode);
}

impl<F> Generator for F
where
    F: Fn(&mut GeneratorNode),
{
    fn compose(&self, node: &mut GeneratorNode) {
        self(node)
    }
}

/// A named instance in the generator tree.
///
/// A node owns a list of tasks and a list of named children. Its identity is
/// its [`NodePath`] from the root, so sibling names must be unique. Nodes are
/// plain data: the tree can be synced any number of times.
///
/// # Example
///
/// ```rust
/// use tsugite::{FileEntry, GeneratorNode, ProviderType, RunOutput, Scope};
///
/// const NAME: ProviderType<String> = ProviderType::new("name");
///
/// let mut root = GeneratorNode::new("app");
///
/// root.task("name")
///     .exports(&NAME, Scope::Project)
///     .run(|_| Ok(RunOutput::new().provide(&NAME, "demo".to_string())));
///
/// root.child("readme", |node: &mut GeneratorNode| {
///     node.task("render").reads(&NAME).build(|ctx| {
///         let name = ctx.get(&NAME)?;
///         ctx.write(FileEntry::text("readme", "README.md", format!("# {name}\n")));
///         Ok(())
///     });
/// });
/// ```
pub struct GeneratorNode {
    pub(crate) name: ArcStr,
    pub(crate) package_root: bool,
    pub(crate) tasks: Vec<TaskSpec>,
    pub(crate) children: Vec<GeneratorNode>,
}

pub(crate) struct TaskSpec {
    pub name: ArcStr,
    pub requirements: Vec<Requirement>,
    pub exports: Vec<Export>,
    pub run: RunFn,
}

impl GeneratorNode {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().into(),
            package_root: false,
            tasks: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Creates a node and lets `generator` compose it.
    pub fn compose(name: impl AsRef<str>, generator: impl Generator) -> Self {
        let mut node = Self::new(name);
        generator.compose(&mut node);
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Marks this node as a package boundary for [`Scope::Package`] exports.
    pub fn package_root(mut self) -> Self {
        self.package_root = true;
        self
    }

    pub fn set_package_root(&mut self, package_root: bool) -> &mut Self {
        self.package_root = package_root;
        self
    }

    /// Adds a child node composed by `generator`.
    pub fn child(&mut self, name: impl AsRef<str>, generator: impl Generator) -> &mut Self {
        self.children.push(GeneratorNode::compose(name, generator));
        self
    }

    pub fn add_child(&mut self, node: GeneratorNode) -> &mut Self {
        self.children.push(node);
        self
    }

    pub fn children(&self) -> impl Iterator<Item = &GeneratorNode> {
        self.children.iter()
    }

    /// Starts the definition of a task owned by this node.
    pub fn task(&mut self, name: impl AsRef<str>) -> TaskDef<'_> {
        TaskDef {
            node: self,
            name: name.as_ref().into(),
            requirements: Vec::new(),
            exports: Vec::new(),
        }
    }

    /// Flattens the tree into arenas indexed by position, rejecting duplicate
    /// node paths and task ids on the way.
    pub(crate) fn flatten(&self) -> Result<FlatTree, ConfigurationError> {
        let mut flat = FlatTree {
            nodes: Vec::new(),
            tasks: Vec::new(),
        };

        flatten_rec(self, NodePath::root(&self.name), None, &mut flat)?;
        Ok(flat)
    }
}

impl Debug for GeneratorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks: Vec<_> = self.tasks.iter().map(|task| &task.name).collect();
        f.debug_struct("GeneratorNode")
            .field("name", &self.name)
            .field("package_root", &self.package_root)
            .field("tasks", &tasks)
            .field("children", &self.children)
            .finish()
    }
}

fn flatten_rec(
    node: &GeneratorNode,
    path: NodePath,
    parent: Option<usize>,
    flat: &mut FlatTree,
) -> Result<(), ConfigurationError> {
    let index = flat.nodes.len();
    flat.nodes.push(FlatNode {
        path: path.clone(),
        parent,
        package_root: node.package_root,
    });

    let mut names = HashSet::new();
    for task in &node.tasks {
        let id = TaskId::new(path.clone(), &task.name);
        if !names.insert(task.name.clone()) {
            return Err(ConfigurationError::DuplicateTask(id));
        }

        flat.tasks.push(FlatTask {
            id,
            node: index,
            requirements: task.requirements.clone(),
            exports: task.exports.clone(),
            run: task.run.clone(),
        });
    }

    let mut children = HashSet::new();
    for child in &node.children {
        let child_path = path.join(&child.name);
        if !children.insert(child.name.clone()) {
            return Err(ConfigurationError::DuplicateNode(child_path));
        }

        flatten_rec(child, child_path, Some(index), flat)?;
    }

    Ok(())
}

pub(crate) struct FlatNode {
    pub path: NodePath,
    pub parent: Option<usize>,
    pub package_root: bool,
}

pub(crate) struct FlatTask {
    pub id: TaskId,
    pub node: usize,
    pub requirements: Vec<Requirement>,
    pub exports: Vec<Export>,
    pub run: RunFn,
}

/// The generator tree laid out in arenas. Node `0` is the root; parents
/// always precede their children.
pub(crate) struct FlatTree {
    pub nodes: Vec<FlatNode>,
    pub tasks: Vec<FlatTask>,
}

impl FlatTree {
    /// Iterates over `node` and all of its ancestors, closest first.
    pub fn ancestors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(node), |&index| self.nodes[index].parent)
    }

    /// The node an export of `scope` declared at `node` is hoisted to.
    pub fn boundary(&self, node: usize, scope: Scope) -> usize {
        match scope {
            Scope::Instance => node,
            Scope::Package => self
                .ancestors(node)
                .find(|&index| self.nodes[index].package_root)
                .unwrap_or(0),
            Scope::Project => 0,
        }
    }
}

/// Declares the provider wiring of a task before attaching its closure.
pub struct TaskDef<'a> {
    node: &'a mut GeneratorNode,
    name: ArcStr,
    requirements: Vec<Requirement>,
    exports: Vec<Export>,
}

impl<'a> TaskDef<'a> {
    /// Requires `provider` before this task runs. The value is available
    /// through [`RunContext::get`] and [`BuildContext::get`].
    pub fn depends_on<T>(mut self, provider: &ProviderType<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.requirements.push(Requirement {
            kind: Kind::single(provider),
            timing: Timing::Run,
        });
        self
    }

    /// Reads `provider` during the build phase only. No ordering is implied,
    /// so the producer may itself depend on this task.
    pub fn reads<T>(mut self, provider: &ProviderType<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.requirements.push(Requirement {
            kind: Kind::single(provider),
            timing: Timing::Build,
        });
        self
    }

    /// Reads the finished collection of an additive provider during build.
    pub fn collects<V>(mut self, provider: &AdditiveType<V>) -> Self
    where
        V: Send + Sync + 'static,
    {
        self.requirements.push(Requirement {
            kind: Kind::additive(provider),
            timing: Timing::Build,
        });
        self
    }

    /// Declares that this task's `run` produces `provider`.
    pub fn exports<T>(mut self, provider: &ProviderType<T>, scope: Scope) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.exports.push(Export {
            kind: Kind::single(provider),
            scope,
        });
        self
    }

    /// Declares that this task contributes entries to `provider` during `run`.
    pub fn contributes<V>(mut self, provider: &AdditiveType<V>, scope: Scope) -> Self
    where
        V: Send + Sync + 'static,
    {
        self.exports.push(Export {
            kind: Kind::additive(provider),
            scope,
        });
        self
    }

    /// Attaches the run-phase closure and finishes the task definition.
    pub fn run<F>(self, callback: F) -> &'a mut GeneratorNode
    where
        F: Fn(&RunContext<'_>) -> anyhow::Result<RunOutput> + Send + Sync + 'static,
    {
        self.node.tasks.push(TaskSpec {
            name: self.name,
            requirements: self.requirements,
            exports: self.exports,
            run: Arc::new(callback),
        });
        self.node
    }

    /// Shorthand for a task whose `run` does nothing but defer to `build`.
    pub fn build<F>(self, callback: F) -> &'a mut GeneratorNode
    where
        F: Fn(&mut BuildContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.run(move |_| {
            let callback = callback.clone();
            Ok(RunOutput::new().build(move |ctx| callback(ctx)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(node: &mut GeneratorNode, name: &str) {
        node.task(name).run(|_| Ok(RunOutput::new()));
    }

    #[test]
    fn test_flatten_paths() {
        let mut root = GeneratorNode::new("app");
        noop(&mut root, "root");
        root.child("module", |node: &mut GeneratorNode| {
            noop(node, "setup");
            node.child("feature", |node: &mut GeneratorNode| noop(node, "main"));
        });

        let flat = root.flatten().unwrap();
        let ids: Vec<_> = flat.tasks.iter().map(|task| task.id.to_string()).collect();

        assert_eq!(
            ids,
            vec!["/app:root", "/app/module:setup", "/app/module/feature:main"]
        );
        assert_eq!(flat.nodes[2].parent, Some(1));
        assert_eq!(flat.nodes[2].path.to_string(), "/app/module/feature");
        assert_eq!(flat.ancestors(2).collect::<Vec<_>>(), vec![2, 1, 0]);
    }

    #[test]
    fn test_duplicate_child() {
        let mut root = GeneratorNode::new("app");
        root.add_child(GeneratorNode::new("web"));
        root.add_child(GeneratorNode::new("web"));

        let err = root.flatten().err().unwrap();
        assert!(matches!(err, ConfigurationError::DuplicateNode(path) if path.to_string() == "/app/web"));
    }

    #[test]
    fn test_duplicate_task() {
        let mut root = GeneratorNode::new("app");
        noop(&mut root, "main");
        noop(&mut root, "main");

        let err = root.flatten().err().unwrap();
        assert!(matches!(err, ConfigurationError::DuplicateTask(id) if id.to_string() == "/app:main"));
    }

    #[test]
    fn test_boundary() {
        let mut root = GeneratorNode::new("app");
        root.add_child(
            GeneratorNode::compose("pkg", |node: &mut GeneratorNode| {
                node.add_child(GeneratorNode::new("inner"));
            })
            .package_root(),
        );
        root.add_child(GeneratorNode::new("loose"));

        let flat = root.flatten().unwrap();
        // 0 app, 1 pkg, 2 inner, 3 loose
        assert_eq!(flat.boundary(2, Scope::Instance), 2);
        assert_eq!(flat.boundary(2, Scope::Package), 1);
        assert_eq!(flat.boundary(2, Scope::Project), 0);
        assert_eq!(flat.boundary(3, Scope::Package), 0);
    }
}
