use std::collections::HashMap;

use crate::error::{ConfigurationError, SyncError};
use crate::provider::{Export, Kind, Requirement, Scope};
use crate::tree::FlatTree;

/// One registered provider: a name exported at a given scope, hoisted to a
/// boundary node. Single providers have exactly one producer, additive ones
/// collect every contributor.
#[derive(Debug)]
pub(crate) struct Slot {
    pub kind: Kind,
    pub scope: Scope,
    pub boundary: usize,
    pub producers: Vec<usize>,
}

/// The provider wiring of one task, as slot indices.
#[derive(Debug, Default, Clone)]
pub(crate) struct Resolution {
    pub requirements: Vec<(Requirement, usize)>,
    pub exports: Vec<(Export, usize)>,
}

impl Resolution {
    pub fn requirement(&self, name: &str) -> Option<&(Requirement, usize)> {
        self.requirements
            .iter()
            .find(|(requirement, _)| requirement.kind.name == name)
    }

    pub fn export(&self, name: &str) -> Option<&(Export, usize)> {
        self.exports
            .iter()
            .find(|(export, _)| export.kind.name == name)
    }
}

/// Build-time provider registry.
///
/// Exports are hoisted to the boundary node of their scope and keyed by
/// `(boundary, scope, name)`. Resolution walks from the requesting task's
/// node up to the root and takes the first match, so closer exports shadow
/// farther ones.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub slots: Vec<Slot>,
    index: HashMap<(usize, Scope, &'static str), usize>,
    /// Per task, in the same order as `FlatTree::tasks`.
    pub resolved: Vec<Resolution>,
}

impl Registry {
    /// Registers every export of the tree, then resolves every requirement.
    /// All wiring errors surface here, before any task executes.
    pub fn build(tree: &FlatTree) -> Result<Self, SyncError> {
        let mut registry = Registry {
            resolved: vec![Resolution::default(); tree.tasks.len()],
            ..Default::default()
        };

        for (index, task) in tree.tasks.iter().enumerate() {
            for export in &task.exports {
                let slot = registry.register(tree, index, export)?;
                registry.resolved[index].exports.push((*export, slot));
            }
        }

        for (index, task) in tree.tasks.iter().enumerate() {
            for requirement in &task.requirements {
                let slot = registry.resolve(tree, index, requirement)?;
                registry.resolved[index]
                    .requirements
                    .push((*requirement, slot));
            }
        }

        for slot in &registry.slots {
            tracing::debug!(
                "Provider '{}' ({}) at {} has {} producer(s)",
                slot.kind.name,
                slot.scope,
                tree.nodes[slot.boundary].path,
                slot.producers.len()
            );
        }

        Ok(registry)
    }

    pub fn register(
        &mut self,
        tree: &FlatTree,
        task: usize,
        export: &Export,
    ) -> Result<usize, ConfigurationError> {
        let boundary = tree.boundary(tree.tasks[task].node, export.scope);
        let key = (boundary, export.scope, export.kind.name);

        let Some(&index) = self.index.get(&key) else {
            let index = self.slots.len();
            self.slots.push(Slot {
                kind: export.kind,
                scope: export.scope,
                boundary,
                producers: vec![task],
            });
            self.index.insert(key, index);
            return Ok(index);
        };

        let slot = &mut self.slots[index];
        if slot.producers.contains(&task) {
            return Ok(index);
        }

        let first = tree.tasks[slot.producers[0]].id.clone();
        let second = tree.tasks[task].id.clone();

        if !(slot.kind.additive && export.kind.additive) {
            return Err(ConfigurationError::AmbiguousProvider {
                provider: export.kind.name.to_string(),
                scope: export.scope,
                first,
                second,
            });
        }

        if slot.kind.type_id != export.kind.type_id {
            return Err(ConfigurationError::ProviderTypeMismatch {
                provider: export.kind.name.to_string(),
                task: second,
                producer: first,
                expected: export.kind.describe(),
                found: slot.kind.describe(),
            });
        }

        slot.producers.push(task);
        Ok(index)
    }

    pub fn resolve(
        &self,
        tree: &FlatTree,
        task: usize,
        requirement: &Requirement,
    ) -> Result<usize, SyncError> {
        let own = tree.tasks[task].node;
        let name = requirement.kind.name;

        let found = tree.ancestors(own).find_map(|node| {
            let scopes: &[Scope] = if node == own {
                &[Scope::Instance, Scope::Package, Scope::Project]
            } else {
                &[Scope::Package, Scope::Project]
            };

            scopes
                .iter()
                .find_map(|&scope| self.index.get(&(node, scope, name)).copied())
        });

        let Some(index) = found else {
            return Err(SyncError::ProviderNotFound {
                provider: name.to_string(),
                task: tree.tasks[task].id.clone(),
            });
        };

        let slot = &self.slots[index];
        if slot.kind.type_id != requirement.kind.type_id
            || slot.kind.additive != requirement.kind.additive
        {
            return Err(ConfigurationError::ProviderTypeMismatch {
                provider: name.to_string(),
                task: tree.tasks[task].id.clone(),
                producer: tree.tasks[slot.producers[0]].id.clone(),
                expected: requirement.kind.describe(),
                found: slot.kind.describe(),
            }
            .into());
        }

        if !slot.kind.additive && slot.producers.contains(&task) {
            return Err(ConfigurationError::SelfDependency {
                provider: name.to_string(),
                task: tree.tasks[task].id.clone(),
            }
            .into());
        }

        Ok(index)
    }

    /// The task producing a single-valued slot.
    pub fn producer(&self, slot: usize) -> usize {
        self.slots[slot].producers[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AdditiveType, ProviderType};
    use crate::{GeneratorNode, RunOutput};

    const CONFIG: ProviderType<String> = ProviderType::new("config");
    const ROUTES: ProviderType<Vec<String>> = ProviderType::new("routes");
    const FIELDS: AdditiveType<String> = AdditiveType::new("fields");

    fn nested(scope: Option<Scope>) -> GeneratorNode {
        let mut app = GeneratorNode::new("app");

        let def = app.task("config");
        let def = match scope {
            Some(scope) => def.exports(&CONFIG, scope),
            None => def.exports(&CONFIG, Scope::Instance),
        };
        def.run(|_| Ok(RunOutput::new().provide(&CONFIG, "cfg".into())));

        app.child("module", |module: &mut GeneratorNode| {
            module.child("feature", |feature: &mut GeneratorNode| {
                feature
                    .task("consumer")
                    .depends_on(&CONFIG)
                    .run(|_| Ok(RunOutput::new()));
            });
        });

        app
    }

    #[test]
    fn test_project_scope_walks_up() {
        let flat = nested(Some(Scope::Project)).flatten().unwrap();
        let registry = Registry::build(&flat).unwrap();

        let (_, slot) = registry.resolved[1].requirements[0];
        assert_eq!(registry.producer(slot), 0);
        assert_eq!(registry.slots[slot].scope, Scope::Project);
        assert_eq!(registry.slots[slot].boundary, 0);
    }

    #[test]
    fn test_instance_scope_not_visible() {
        let flat = nested(None).flatten().unwrap();
        let err = Registry::build(&flat).unwrap_err();

        assert!(matches!(
            err,
            SyncError::ProviderNotFound { ref provider, ref task }
                if provider == "config" && task.to_string() == "/app/module/feature:consumer"
        ));
    }

    #[test]
    fn test_ambiguous_package_exports() {
        let mut app = GeneratorNode::new("app").package_root();
        for name in ["a", "b"] {
            app.child(name, |node: &mut GeneratorNode| {
                node.task("routes")
                    .exports(&ROUTES, Scope::Package)
                    .run(|_| Ok(RunOutput::new().provide(&ROUTES, vec![])));
            });
        }

        let flat = app.flatten().unwrap();
        let err = Registry::build(&flat).unwrap_err();

        assert!(matches!(
            err,
            SyncError::Configuration(ConfigurationError::AmbiguousProvider { ref provider, scope: Scope::Package, .. })
                if provider == "routes"
        ));
    }

    #[test]
    fn test_additive_contributors_share_slot() {
        let mut app = GeneratorNode::new("app");
        for name in ["a", "b"] {
            app.child(name, |node: &mut GeneratorNode| {
                node.task("field")
                    .contributes(&FIELDS, Scope::Project)
                    .run(|_| Ok(RunOutput::new()));
            });
        }
        app.task("model")
            .collects(&FIELDS)
            .run(|_| Ok(RunOutput::new()));

        let flat = app.flatten().unwrap();
        let registry = Registry::build(&flat).unwrap();

        assert_eq!(registry.slots.len(), 1);
        assert_eq!(registry.slots[0].producers.len(), 2);
    }

    #[test]
    fn test_package_sibling_visible_and_shadowing() {
        let mut app = GeneratorNode::new("app");
        app.task("config")
            .exports(&CONFIG, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&CONFIG, "project".into())));

        let mut pkg = GeneratorNode::new("pkg").package_root();
        pkg.child("settings", |node: &mut GeneratorNode| {
            node.task("config")
                .exports(&CONFIG, Scope::Package)
                .run(|_| Ok(RunOutput::new().provide(&CONFIG, "package".into())));
        });
        pkg.child("server", |node: &mut GeneratorNode| {
            node.task("main")
                .depends_on(&CONFIG)
                .run(|_| Ok(RunOutput::new()));
        });
        app.add_child(pkg);

        app.child("other", |node: &mut GeneratorNode| {
            node.task("main")
                .depends_on(&CONFIG)
                .run(|_| Ok(RunOutput::new()));
        });

        let flat = app.flatten().unwrap();
        let registry = Registry::build(&flat).unwrap();

        // tasks: 0 app:config, 1 settings:config, 2 server:main, 3 other:main
        let (_, inside) = registry.resolved[2].requirements[0];
        let (_, outside) = registry.resolved[3].requirements[0];
        assert_eq!(registry.producer(inside), 1);
        assert_eq!(registry.producer(outside), 0);
        assert_eq!(flat.nodes[registry.slots[inside].boundary].path.to_string(), "/app/pkg");
    }

    #[test]
    fn test_type_mismatch() {
        const WRONG: ProviderType<u32> = ProviderType::new("config");

        let mut app = GeneratorNode::new("app");
        app.task("config")
            .exports(&CONFIG, Scope::Project)
            .run(|_| Ok(RunOutput::new().provide(&CONFIG, "cfg".into())));
        app.task("consumer")
            .depends_on(&WRONG)
            .run(|_| Ok(RunOutput::new()));

        let flat = app.flatten().unwrap();
        let err = Registry::build(&flat).unwrap_err();

        assert!(matches!(
            err,
            SyncError::Configuration(ConfigurationError::ProviderTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_self_dependency() {
        let mut app = GeneratorNode::new("app");
        app.task("loop")
            .exports(&CONFIG, Scope::Instance)
            .depends_on(&CONFIG)
            .run(|_| Ok(RunOutput::new()));

        let flat = app.flatten().unwrap();
        let err = Registry::build(&flat).unwrap_err();

        assert!(matches!(
            err,
            SyncError::Configuration(ConfigurationError::SelfDependency { .. })
        ));
    }
}
