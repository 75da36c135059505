//! Task graph analysis and scheduling.
//!
//! Turns the flat list of tasks the host's `Tracker` returns into a graph
//! annotated with dependency depth and cycle membership, then groups tasks
//! into [`ParallelGroup`]s that can run concurrently: everything at the
//! same depth, modulo the `max_workers` ceiling and any caller-supplied
//! sequentialization heuristic.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::types::{ParallelGroup, Task, TaskId, TaskNode};

/// Filter a tracker's full task list down to the tasks a worker could still
/// be assigned: status [`TaskStatus::is_actionable`] and not already merged
/// or cancelled. Called before [`analyze`] so completed and cancelled tasks
/// never occupy a group or get re-run; their ids simply stop appearing as
/// dependencies, which `analyze` already treats as satisfied.
#[must_use]
pub fn actionable_tasks(tasks: &[Task]) -> Vec<Task> {
    tasks.iter().filter(|t| t.status.is_actionable()).cloned().collect()
}

/// The result of analyzing a task list: per-task graph facts plus the
/// overall topological grouping.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub nodes: BTreeMap<TaskId, TaskNode>,
    pub groups: Vec<ParallelGroup>,
    pub cyclic_task_ids: Vec<TaskId>,
}

impl TaskGraph {
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        self.cyclic_task_ids.is_empty()
    }
}

/// Build a [`TaskGraph`] from a flat task list.
///
/// Dependencies on unknown task ids are ignored (the dependency simply
/// contributes nothing to depth or grouping) rather than treated as an
/// error, since the host's tracker is the source of truth and may reference
/// tasks outside the current batch (e.g. already completed).
#[must_use]
pub fn analyze(tasks: &[Task]) -> TaskGraph {
    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();

    let cyclic = detect_cycles(tasks, &by_id);

    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for task in tasks {
        for dep in &task.depends_on {
            if by_id.contains_key(dep) {
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }
    }

    let mut depth_cache: HashMap<TaskId, usize> = HashMap::new();
    let mut nodes = BTreeMap::new();
    for task in tasks {
        let depth = if cyclic.contains(&task.id) {
            0
        } else {
            compute_depth(&task.id, &by_id, &cyclic, &mut depth_cache)
        };
        let node = TaskNode {
            task: task.clone(),
            dependencies: task
                .depends_on
                .iter()
                .filter(|d| by_id.contains_key(d))
                .cloned()
                .collect(),
            dependents: dependents.get(&task.id).cloned().unwrap_or_default(),
            depth,
            in_cycle: cyclic.contains(&task.id),
        };
        nodes.insert(task.id.clone(), node);
    }

    let groups = group_by_depth(&nodes);

    TaskGraph {
        nodes,
        groups,
        cyclic_task_ids: {
            let mut v: Vec<TaskId> = cyclic.into_iter().collect();
            v.sort();
            v
        },
    }
}

/// DFS tricolor cycle detection. Returns the set of task ids that
/// participate in at least one cycle.
fn detect_cycles(tasks: &[Task], by_id: &HashMap<&TaskId, &Task>) -> HashSet<TaskId> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<TaskId, Color> = tasks.iter().map(|t| (t.id.clone(), Color::White)).collect();
    let mut in_cycle: HashSet<TaskId> = HashSet::new();
    let mut stack: Vec<TaskId> = Vec::new();

    fn visit(
        id: &TaskId,
        by_id: &HashMap<&TaskId, &Task>,
        color: &mut HashMap<TaskId, Color>,
        stack: &mut Vec<TaskId>,
        in_cycle: &mut HashSet<TaskId>,
    ) {
        color.insert(id.clone(), Color::Gray);
        stack.push(id.clone());

        if let Some(task) = by_id.get(id) {
            for dep in &task.depends_on {
                if !by_id.contains_key(dep) {
                    continue;
                }
                match color.get(dep).copied().unwrap_or(Color::White) {
                    Color::White => visit(dep, by_id, color, stack, in_cycle),
                    Color::Gray => {
                        // Found a cycle: everything on the stack from dep's
                        // position onward participates.
                        if let Some(pos) = stack.iter().position(|x| x == dep) {
                            for member in &stack[pos..] {
                                in_cycle.insert(member.clone());
                            }
                        }
                        in_cycle.insert(dep.clone());
                        in_cycle.insert(id.clone());
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        color.insert(id.clone(), Color::Black);
    }

    for task in tasks {
        if color.get(&task.id).copied() == Some(Color::White) {
            visit(&task.id, by_id, &mut color, &mut stack, &mut in_cycle);
        }
    }

    in_cycle
}

fn compute_depth(
    id: &TaskId,
    by_id: &HashMap<&TaskId, &Task>,
    cyclic: &HashSet<TaskId>,
    cache: &mut HashMap<TaskId, usize>,
) -> usize {
    if let Some(&d) = cache.get(id) {
        return d;
    }
    let Some(task) = by_id.get(id) else { return 0 };

    let mut max_dep_depth: Option<usize> = None;
    for dep in &task.depends_on {
        if !by_id.contains_key(dep) || cyclic.contains(dep) {
            continue;
        }
        let d = compute_depth(dep, by_id, cyclic, cache);
        max_dep_depth = Some(max_dep_depth.map_or(d, |m| m.max(d)));
    }

    let depth = max_dep_depth.map_or(0, |d| d + 1);
    cache.insert(id.clone(), depth);
    depth
}

/// Group acyclic nodes by depth (Kahn-level grouping), in ascending depth
/// order. Within a group, task ids are sorted ascending for deterministic
/// scheduling. Cyclic tasks are excluded entirely — they must be resolved
/// or force-sequentialized by the caller before scheduling.
fn group_by_depth(nodes: &BTreeMap<TaskId, TaskNode>) -> Vec<ParallelGroup> {
    let mut by_depth: BTreeMap<usize, Vec<TaskId>> = BTreeMap::new();
    for node in nodes.values() {
        if node.in_cycle {
            continue;
        }
        by_depth.entry(node.depth).or_default().push(node.task.id.clone());
    }

    by_depth
        .into_iter()
        .enumerate()
        .map(|(index, (depth, mut task_ids))| {
            task_ids.sort();
            let max_priority = task_ids
                .iter()
                .filter_map(|id| nodes.get(id))
                .map(|n| n.task.priority)
                .max()
                .unwrap_or(0);
            ParallelGroup {
                index,
                tasks: task_ids,
                depth,
                max_priority,
            }
        })
        .collect()
}

/// Split a group's task list into worker batches no larger than
/// `max_workers`, ordered by descending priority then ascending id.
#[must_use]
pub fn worker_batches<'a>(
    group: &'a ParallelGroup,
    nodes: &'a BTreeMap<TaskId, TaskNode>,
    max_workers: usize,
) -> Vec<Vec<&'a TaskId>> {
    let mut ordered: Vec<&TaskId> = group.tasks.iter().collect();
    ordered.sort_by(|a, b| {
        let pa = nodes.get(*a).map_or(0, |n| n.task.priority);
        let pb = nodes.get(*b).map_or(0, |n| n.task.priority);
        pb.cmp(&pa).then_with(|| a.cmp(b))
    });
    let max_workers = max_workers.max(1);
    ordered.chunks(max_workers).map(<[&TaskId]>::to_vec).collect()
}

/// Scheduling metadata derived from a [`TaskGraph`]: whether there's enough
/// independent work to bother running workers in parallel, and how wide that
/// parallelism can go.
pub mod schedule {
    use crate::config::SequentializeCheck;
    use crate::model::types::Task;

    use super::TaskGraph;

    /// The scheduling metadata for one group analysis: how many tasks are
    /// actionable, how wide the widest group is, and whether the engine
    /// should bother running more than one worker at a time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedulePlan {
        pub actionable_task_count: usize,
        pub max_parallelism: usize,
        pub recommend_parallel: bool,
    }

    /// `true` if a group of tasks should run as multiple concurrent workers
    /// rather than one at a time: more than one task, and (if a
    /// sequentialization heuristic is configured) the heuristic doesn't veto
    /// it.
    #[must_use]
    pub fn should_run_parallel(tasks: &[Task], check: Option<&SequentializeCheck>) -> bool {
        if tasks.len() < 2 {
            return false;
        }
        match check {
            Some(check) => !(check.0)(tasks),
            None => true,
        }
    }

    /// Derive a [`SchedulePlan`] from an analyzed graph: the total actionable
    /// task count, the widest group capped at `max_workers`, and whether
    /// running in parallel is worthwhile for at least one group.
    #[must_use]
    pub fn plan(graph: &TaskGraph, max_workers: usize, sequentialize_check: Option<&SequentializeCheck>) -> SchedulePlan {
        let actionable_task_count = graph.nodes.len();
        let max_workers = max_workers.max(1);

        let max_parallelism = graph
            .groups
            .iter()
            .map(|g| g.tasks.len().min(max_workers))
            .max()
            .unwrap_or(0);

        let recommend_parallel = graph.groups.iter().any(|group| {
            let tasks: Vec<Task> = group.tasks.iter().filter_map(|id| graph.nodes.get(id)).map(|n| n.task.clone()).collect();
            should_run_parallel(&tasks, sequentialize_check)
        });

        SchedulePlan {
            actionable_task_count,
            max_parallelism,
            recommend_parallel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::model::types::TaskStatus;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: TaskId::new(id).unwrap(),
            title: id.to_owned(),
            description: String::new(),
            status: TaskStatus::Open,
            priority: 0,
            depends_on: deps.iter().map(|d| TaskId::new(*d).unwrap()).collect(),
            labels: Vec::new(),
            task_type: None,
            epic: None,
        }
    }

    #[test]
    fn linear_chain_produces_one_task_per_group() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        let graph = analyze(&tasks);
        assert!(graph.is_acyclic());
        assert_eq!(graph.groups.len(), 3);
        assert_eq!(graph.groups[0].tasks, vec![TaskId::new("a").unwrap()]);
        assert_eq!(graph.groups[1].tasks, vec![TaskId::new("b").unwrap()]);
        assert_eq!(graph.groups[2].tasks, vec![TaskId::new("c").unwrap()]);
    }

    #[test]
    fn independent_tasks_share_a_group() {
        let tasks = vec![task("a", &[]), task("b", &[])];
        let graph = analyze(&tasks);
        assert_eq!(graph.groups.len(), 1);
        assert_eq!(graph.groups[0].tasks.len(), 2);
    }

    #[test]
    fn diamond_dependency_orders_by_depth() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ];
        let graph = analyze(&tasks);
        assert_eq!(graph.groups.len(), 3);
        assert_eq!(graph.groups[0].tasks, vec![TaskId::new("a").unwrap()]);
        assert_eq!(
            graph.groups[1].tasks,
            vec![TaskId::new("b").unwrap(), TaskId::new("c").unwrap()]
        );
        assert_eq!(graph.groups[2].tasks, vec![TaskId::new("d").unwrap()]);
    }

    #[test]
    fn cycle_is_detected_and_excluded_from_groups() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"]), task("c", &[])];
        let graph = analyze(&tasks);
        assert!(!graph.is_acyclic());
        assert_eq!(
            graph.cyclic_task_ids,
            vec![TaskId::new("a").unwrap(), TaskId::new("b").unwrap()]
        );
        let all_grouped: Vec<&TaskId> = graph.groups.iter().flat_map(|g| g.tasks.iter()).collect();
        assert_eq!(all_grouped, vec![&TaskId::new("c").unwrap()]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = vec![task("a", &["a"])];
        let graph = analyze(&tasks);
        assert!(!graph.is_acyclic());
    }

    #[test]
    fn dependency_on_unknown_task_is_ignored() {
        let tasks = vec![task("a", &["ghost"])];
        let graph = analyze(&tasks);
        assert!(graph.is_acyclic());
        assert_eq!(graph.nodes[&TaskId::new("a").unwrap()].depth, 0);
    }

    #[test]
    fn actionable_tasks_drops_completed_and_cancelled() {
        let mut done = task("a", &[]);
        done.status = TaskStatus::Completed;
        let mut cancelled = task("b", &[]);
        cancelled.status = TaskStatus::Cancelled;
        let open = task("c", &[]);
        let mut in_progress = task("d", &[]);
        in_progress.status = TaskStatus::InProgress;

        let actionable = actionable_tasks(&[done, cancelled, open.clone(), in_progress.clone()]);
        assert_eq!(actionable, vec![open, in_progress]);
    }

    #[test]
    fn actionable_tasks_drop_out_of_dependency_analysis_as_satisfied() {
        // "b" depends on "a", which is already completed and therefore
        // filtered out before analysis; "a" simply disappears as a known
        // dependency id, leaving "b" at depth 0 rather than blocked.
        let mut done = task("a", &[]);
        done.status = TaskStatus::Completed;
        let b = task("b", &["a"]);

        let actionable = actionable_tasks(&[done, b]);
        let graph = analyze(&actionable);
        assert!(graph.is_acyclic());
        assert_eq!(graph.nodes[&TaskId::new("b").unwrap()].depth, 0);
    }

    #[test]
    fn schedule_plan_reports_widest_group_capped_by_max_workers() {
        let tasks = vec![task("a", &[]), task("b", &[]), task("c", &[])];
        let graph = analyze(&tasks);
        let plan = schedule::plan(&graph, 2, None);
        assert_eq!(plan.actionable_task_count, 3);
        assert_eq!(plan.max_parallelism, 2);
        assert!(plan.recommend_parallel);
    }

    #[test]
    fn schedule_plan_does_not_recommend_parallel_for_a_linear_chain() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        let graph = analyze(&tasks);
        let plan = schedule::plan(&graph, 4, None);
        assert_eq!(plan.max_parallelism, 1);
        assert!(!plan.recommend_parallel);
    }

    #[test]
    fn should_run_parallel_is_false_for_a_single_task() {
        let tasks = vec![task("a", &[])];
        assert!(!schedule::should_run_parallel(&tasks, None));
    }

    #[test]
    fn worker_batches_respects_max_workers_and_priority_order() {
        let mut t1 = task("a", &[]);
        t1.priority = 5;
        let mut t2 = task("b", &[]);
        t2.priority = 1;
        let t3 = task("c", &[]);
        let tasks = vec![t1, t2, t3];
        let graph = analyze(&tasks);
        let group = &graph.groups[0];
        let batches = worker_batches(group, &graph.nodes, 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(*batches[0][0], TaskId::new("a").unwrap());
    }

    #[test]
    fn grouping_is_deterministic_across_runs() {
        let tasks = vec![task("z", &[]), task("a", &[]), task("m", &[])];
        let g1 = analyze(&tasks).groups;
        let g2 = analyze(&tasks).groups;
        assert_eq!(g1, g2);
        assert_eq!(
            g1[0].tasks,
            vec![
                TaskId::new("a").unwrap(),
                TaskId::new("m").unwrap(),
                TaskId::new("z").unwrap()
            ]
        );
    }

    /// A random task list of `2..8` tasks where each task's dependency set is
    /// an arbitrary (possibly cyclic, possibly self-referential) subset of
    /// the others, referenced by index.
    fn arb_tasks() -> impl Strategy<Value = Vec<Task>> {
        (2_usize..8).prop_flat_map(|n| {
            prop::collection::vec(prop::collection::vec(0..n, 0..3), n).prop_map(move |deps_per_task| {
                (0..n)
                    .map(|i| {
                        let id = format!("t{i}");
                        let deps: Vec<String> =
                            deps_per_task[i].iter().filter(|&&d| d != i).map(|&d| format!("t{d}")).collect();
                        task(&id, &deps.iter().map(String::as_str).collect::<Vec<_>>())
                    })
                    .collect()
            })
        })
    }

    proptest! {
        #[test]
        fn every_task_ends_up_either_grouped_or_cyclic(tasks in arb_tasks()) {
            let graph = analyze(&tasks);
            let grouped: usize = graph.groups.iter().map(|g| g.tasks.len()).sum();
            prop_assert_eq!(grouped + graph.cyclic_task_ids.len(), tasks.len());
        }

        #[test]
        fn cyclic_and_grouped_ids_are_disjoint(tasks in arb_tasks()) {
            let graph = analyze(&tasks);
            let cyclic: HashSet<&TaskId> = graph.cyclic_task_ids.iter().collect();
            for group in &graph.groups {
                for id in &group.tasks {
                    prop_assert!(!cyclic.contains(id), "task {id} is both grouped and cyclic");
                }
            }
        }

        #[test]
        fn acyclic_dependencies_have_strictly_lower_depth(tasks in arb_tasks()) {
            let graph = analyze(&tasks);
            for (id, node) in &graph.nodes {
                if node.in_cycle {
                    continue;
                }
                for dep in &node.dependencies {
                    let dep_node = &graph.nodes[dep];
                    if dep_node.in_cycle {
                        continue;
                    }
                    prop_assert!(
                        dep_node.depth < node.depth,
                        "task {id} at depth {} depends on {dep} at depth {}",
                        node.depth,
                        dep_node.depth
                    );
                }
            }
        }

        #[test]
        fn group_indices_are_contiguous_from_zero(tasks in arb_tasks()) {
            let graph = analyze(&tasks);
            for (expected, group) in graph.groups.iter().enumerate() {
                prop_assert_eq!(group.index, expected);
            }
        }
    }
}
