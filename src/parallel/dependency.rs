//! Goal dependency graph and wave scheduling.
//!
//! Goals form a DAG through `requires`. The graph is layered by longest path
//! from the roots, then each layer is split into waves so that no two members
//! of a wave have overlapping declared paths. Waves run one after another;
//! members of a wave run concurrently.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::StructuralError;
use crate::goal::{escapes_root, is_glob, literal_base, normalize_path, path_contains, Goal};

/// Goals that run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    pub index: usize,
    /// Goal ids in launch order (priority descending, then id).
    pub goals: Vec<String>,
}

/// Two goals whose declared paths overlap and which therefore never share
/// a wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEdge {
    pub first: String,
    pub second: String,
    /// The pair of declared paths that overlapped first.
    pub paths: (String, String),
}

impl ConflictEdge {
    pub fn involves(&self, a: &str, b: &str) -> bool {
        (self.first == a && self.second == b) || (self.first == b && self.second == a)
    }
}

/// Ordered waves covering every goal exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub waves: Vec<Wave>,
    pub conflicts: Vec<ConflictEdge>,
}

impl Schedule {
    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn goal_count(&self) -> usize {
        self.waves.iter().map(|wave| wave.goals.len()).sum()
    }

    /// Index of the wave holding `goal_id`.
    pub fn wave_of(&self, goal_id: &str) -> Option<usize> {
        self.waves
            .iter()
            .find(|wave| wave.goals.iter().any(|id| id == goal_id))
            .map(|wave| wave.index)
    }

    pub fn conflicts(&self) -> &[ConflictEdge] {
        &self.conflicts
    }
}

/// `requires` graph over a validated goal set.
///
/// Edges point from a requirement to the goal that requires it.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
    goals: HashMap<String, Goal>,
}

impl DependencyGraph {
    /// Validate `goals` and build the graph.
    pub fn new(goals: &[Goal]) -> Result<Self, StructuralError> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        let mut by_id = HashMap::new();

        for (position, goal) in goals.iter().enumerate() {
            if goal.id.trim().is_empty() {
                return Err(StructuralError::EmptyGoalId(position));
            }
            if nodes.contains_key(&goal.id) {
                return Err(StructuralError::DuplicateGoal(goal.id.clone()));
            }
            if let Some(pattern) = goal.declared_paths.iter().find(|path| escapes_root(path)) {
                return Err(StructuralError::InvalidPattern {
                    goal: goal.id.clone(),
                    pattern: pattern.clone(),
                    message: "path escapes the repository root".to_string(),
                });
            }
            for pattern in goal.declared_paths.iter().filter(|path| is_glob(path)) {
                if let Err(err) = glob::Pattern::new(&normalize_path(pattern)) {
                    return Err(StructuralError::InvalidPattern {
                        goal: goal.id.clone(),
                        pattern: pattern.clone(),
                        message: err.msg.to_string(),
                    });
                }
            }
            nodes.insert(goal.id.clone(), graph.add_node(goal.id.clone()));
            by_id.insert(goal.id.clone(), goal.clone());
        }

        for goal in goals {
            let dependent = nodes[&goal.id];
            let mut seen = HashSet::new();
            for required in &goal.requires {
                let Some(&requirement) = nodes.get(required) else {
                    return Err(StructuralError::UnresolvedDependency {
                        goal: goal.id.clone(),
                        missing: required.clone(),
                    });
                };
                if seen.insert(required.as_str()) {
                    graph.add_edge(requirement, dependent, ());
                }
            }
        }

        let dependency_graph = Self {
            graph,
            nodes,
            goals: by_id,
        };
        if let Some(cycle) = dependency_graph.find_cycle() {
            return Err(StructuralError::Cycle { cycle });
        }
        Ok(dependency_graph)
    }

    /// Validate `goals` and compute their schedule.
    pub fn build(goals: &[Goal]) -> Result<Schedule, StructuralError> {
        Ok(Self::new(goals)?.schedule())
    }

    pub fn goal(&self, id: &str) -> Option<&Goal> {
        self.goals.get(id)
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    /// Layer each goal by longest path, then split layers into
    /// conflict-free waves.
    pub fn schedule(&self) -> Schedule {
        let conflicts = self.conflict_edges();
        let conflicting: HashSet<(&str, &str)> = conflicts
            .iter()
            .flat_map(|edge| {
                [
                    (edge.first.as_str(), edge.second.as_str()),
                    (edge.second.as_str(), edge.first.as_str()),
                ]
            })
            .collect();

        let mut waves: Vec<Wave> = Vec::new();
        for mut layer in self.layers() {
            layer.sort_by(|a, b| self.launch_order(a, b));
            let mut sub_waves: Vec<Vec<String>> = Vec::new();
            for goal_id in layer {
                let slot = sub_waves.iter_mut().find(|members| {
                    members
                        .iter()
                        .all(|member| !conflicting.contains(&(member.as_str(), goal_id.as_str())))
                });
                match slot {
                    Some(members) => members.push(goal_id),
                    None => sub_waves.push(vec![goal_id]),
                }
            }
            for goals in sub_waves {
                waves.push(Wave {
                    index: waves.len(),
                    goals,
                });
            }
        }

        tracing::debug!(
            goals = self.goals.len(),
            waves = waves.len(),
            conflicts = conflicts.len(),
            "Built goal schedule"
        );
        Schedule { waves, conflicts }
    }

    /// Goals not in `completed` whose requirements all are, in launch order.
    pub fn ready_goals(&self, completed: &HashSet<String>) -> Vec<&Goal> {
        let mut ready: Vec<&Goal> = self
            .goals
            .values()
            .filter(|goal| !completed.contains(&goal.id))
            .filter(|goal| goal.requires.iter().all(|id| completed.contains(id)))
            .collect();
        ready.sort_by(|a, b| self.launch_order(&a.id, &b.id));
        ready
    }

    /// True if neither goal requires the other, directly or transitively,
    /// and their declared paths do not overlap.
    pub fn can_run_parallel(&self, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        let (Some(first), Some(second)) = (self.goals.get(a), self.goals.get(b)) else {
            return false;
        };
        !self.depends_on(a, b) && !self.depends_on(b, a) && overlap(first, second).is_none()
    }

    /// Every goal that requires `id`, directly or transitively, sorted.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.nodes.get(id) else {
            return Vec::new();
        };
        let mut dependents = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                dependents.insert(self.graph[node].clone());
            }
        }
        dependents.into_iter().collect()
    }

    /// Whether `dependent` requires `requirement`, directly or transitively.
    pub fn depends_on(&self, dependent: &str, requirement: &str) -> bool {
        let (Some(&from), Some(&to)) = (self.nodes.get(dependent), self.nodes.get(requirement))
        else {
            return false;
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, from);
        while let Some(node) = dfs.next(reversed) {
            if node == to && node != from {
                return true;
            }
        }
        false
    }

    /// Launch and merge order: priority descending, then id ascending.
    /// NaN priorities sort by `f64::total_cmp`.
    pub fn launch_order(&self, a: &str, b: &str) -> Ordering {
        let priority = |id: &str| self.goals.get(id).map(|goal| goal.priority).unwrap_or(0.0);
        priority(b).total_cmp(&priority(a)).then_with(|| a.cmp(b))
    }

    fn layers(&self) -> Vec<Vec<String>> {
        // Validated acyclic in `new`.
        let order = toposort(&self.graph, None).unwrap_or_default();
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut layers: Vec<Vec<String>> = Vec::new();
        for node in order {
            let layer = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|requirement| depth.get(&requirement))
                .map(|requirement_depth| requirement_depth + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, layer);
            if layers.len() <= layer {
                layers.resize_with(layer + 1, Vec::new);
            }
            layers[layer].push(self.graph[node].clone());
        }
        layers
    }

    fn conflict_edges(&self) -> Vec<ConflictEdge> {
        let mut ids: Vec<&String> = self.goals.keys().collect();
        ids.sort();
        let mut edges = Vec::new();
        for (position, first) in ids.iter().enumerate() {
            for second in &ids[position + 1..] {
                if self.depends_on(first, second) || self.depends_on(second, first) {
                    continue;
                }
                if let Some(paths) = overlap(&self.goals[*first], &self.goals[*second]) {
                    edges.push(ConflictEdge {
                        first: (*first).clone(),
                        second: (*second).clone(),
                        paths,
                    });
                }
            }
        }
        edges
    }

    /// A cycle in `requires` order, starting and ending at its smallest id.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut candidates: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&node| self.graph.contains_edge(node, node))
            })
            .collect();
        for component in candidates.iter_mut() {
            component.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        }
        candidates.sort_by(|a, b| self.graph[a[0]].cmp(&self.graph[b[0]]));

        let component = candidates.first()?;
        let start = component[0];
        let members: HashSet<NodeIndex> = component.iter().copied().collect();

        // Shortest walk from `start` back to itself along `requires`.
        let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut closing = None;
        while let Some(node) = queue.pop_front() {
            let mut requirements: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|next| members.contains(next))
                .collect();
            requirements.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            for next in requirements {
                if next == start {
                    closing = Some(node);
                    break;
                }
                if !previous.contains_key(&next) {
                    previous.insert(next, node);
                    queue.push_back(next);
                }
            }
            if closing.is_some() {
                break;
            }
        }

        let mut path = Vec::new();
        let mut cursor = closing?;
        while cursor != start {
            path.push(self.graph[cursor].clone());
            cursor = previous[&cursor];
        }
        path.push(self.graph[start].clone());
        path.reverse();
        path.push(self.graph[start].clone());
        Some(path)
    }
}

/// First pair of overlapping declared paths between two goals.
///
/// Paths overlap when their literal bases are equal or one contains the
/// other component-wise. This can over-serialize (`src/*.rs` against
/// `src/lib.md`) but never misses a real overlap.
fn overlap(first: &Goal, second: &Goal) -> Option<(String, String)> {
    for a in &first.declared_paths {
        let base_a = literal_base(a);
        for b in &second.declared_paths {
            let base_b = literal_base(b);
            if path_contains(&base_a, &base_b) || path_contains(&base_b, &base_a) {
                return Some((a.clone(), b.clone()));
            }
        }
    }
    None
}
