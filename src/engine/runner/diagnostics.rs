use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;

use crate::core::TaskId;
use crate::engine::TaskGraph;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Timings of a single task across both phases.
#[derive(Debug, Clone)]
pub struct TaskDiagnostics {
    pub id: TaskId,
    pub run: Option<TaskExecution>,
    /// `None` when the task had nothing to build.
    pub build: Option<TaskExecution>,
}

impl TaskDiagnostics {
    pub fn total(&self) -> Duration {
        let run = self.run.as_ref().map(|t| t.duration).unwrap_or_default();
        let build = self.build.as_ref().map(|t| t.duration).unwrap_or_default();
        run + build
    }
}

/// Execution metrics of a generator run.
///
/// Tasks are listed in the topological order they were scheduled in.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub tasks: Vec<TaskDiagnostics>,
    /// Run-phase ordering edges, as indices into `tasks`.
    pub edges: Vec<(usize, usize)>,
}

impl Diagnostics {
    pub(crate) fn new(
        graph: &TaskGraph,
        mut run: HashMap<NodeIndex, TaskExecution>,
        mut build: HashMap<NodeIndex, TaskExecution>,
    ) -> Self {
        let position: HashMap<NodeIndex, usize> = graph
            .order
            .iter()
            .enumerate()
            .map(|(i, &index)| (index, i))
            .collect();

        let tasks = graph
            .order
            .iter()
            .map(|index| TaskDiagnostics {
                id: graph.id(*index).clone(),
                run: run.remove(index),
                build: build.remove(index),
            })
            .collect();

        let edges = graph
            .graph
            .raw_edges()
            .iter()
            .filter_map(|edge| Some((*position.get(&edge.source())?, *position.get(&edge.target())?)))
            .collect();

        Self { tasks, edges }
    }

    /// The `n` tasks that took the longest, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<&TaskDiagnostics> {
        let mut tasks: Vec<_> = self.tasks.iter().collect();
        tasks.sort_by(|a, b| b.total().cmp(&a.total()));
        tasks.truncate(n);
        tasks
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for task in &self.tasks {
            let secs = task.total().as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for (i, task) in self.tasks.iter().enumerate() {
            let name = task.id.to_string().replace('"', "\\\"");
            let duration = task.total();

            let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);
            let (r, g, b) = gradient(t);

            let _ = writeln!(f, "    {i}[\"{name}\\n{duration:.2?}\"]");
            let _ = writeln!(f, "    style {i} fill:#{r:02X}{g:02X}{b:02X}");
        }

        for (source, target) in &self.edges {
            let _ = writeln!(f, "    {source} --> {target}");
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> (u8, u8, u8) {
    let t = t.clamp(0.0, 1.0);

    if t < 0.5 {
        let r = (255.0 * t * 2.0) as u8;
        (r, 255, 0)
    } else {
        let g = (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8;
        (255, g, 0)
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for task in &self.tasks {
            write!(f, "{:<48}", task.id.to_string())?;

            match &task.run {
                Some(run) => write!(f, " run {:>10.2?}", run.duration)?,
                None => write!(f, " run {:>10}", "-")?,
            }

            match &task.build {
                Some(build) => writeln!(f, " build {:>10.2?}", build.duration)?,
                None => writeln!(f, " build {:>10}", "-")?,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodePath;

    fn task(name: &str, millis: u64) -> TaskDiagnostics {
        TaskDiagnostics {
            id: TaskId::new(NodePath::root("app"), name),
            run: Some(TaskExecution {
                start: Instant::now(),
                duration: Duration::from_millis(millis),
            }),
            build: None,
        }
    }

    #[test]
    fn test_gradient_endpoints() {
        assert_eq!(gradient(0.0), (0, 255, 0));
        assert_eq!(gradient(1.0), (255, 0, 0));
    }

    #[test]
    fn test_render_mermaid() {
        let diagnostics = Diagnostics {
            tasks: vec![task("fast", 1), task("slow", 9)],
            edges: vec![(0, 1)],
        };

        let mermaid = diagnostics.render_mermaid();

        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("0[\"/app:fast"));
        assert!(mermaid.contains("style 0 fill:#00FF00"));
        assert!(mermaid.contains("style 1 fill:#FF0000"));
        assert!(mermaid.contains("0 --> 1"));
    }

    #[test]
    fn test_slowest() {
        let diagnostics = Diagnostics {
            tasks: vec![task("a", 3), task("b", 7), task("c", 5)],
            edges: vec![],
        };

        let names: Vec<_> = diagnostics
            .slowest(2)
            .into_iter()
            .map(|task| task.id.name.to_string())
            .collect();

        assert_eq!(names, vec!["b", "c"]);
    }
}
