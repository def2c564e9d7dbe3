//! Dependency ordering for the resources declared by a form.
//!
//! Every resource has an id and a list of ids it depends on. The graph is
//! validated (unknown references, self references and cycles are rejected)
//! and then ordered with Kahn's algorithm. Ties between resources that become
//! eligible at the same time are broken by declaration order, so the same
//! form always yields the same application order.

use ahash::AHashMap as HashMap;
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GraphError {
    #[error("resource id must not be empty")]
    EmptyId,

    #[error("duplicate resource id {0:?}")]
    DuplicateId(String),

    #[error("resource {id:?} depends on unknown resource {missing:?}")]
    MissingDependency { id: String, missing: String },

    #[error("resource {0:?} depends on itself")]
    SelfReference(String),

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    depends_on: Vec<Vec<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

// === impl GraphError ===

impl GraphError {
    /// Self references are reported separately but are cycles of length one.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Cycle(_) | Self::SelfReference(_))
    }
}

// === impl DependencyGraph ===

impl DependencyGraph {
    /// Builds a graph from `(id, depends_on)` pairs in declaration order.
    ///
    /// Only identity problems (empty or duplicate ids) are reported here; the
    /// edges are checked by [`DependencyGraph::validate`].
    pub fn new<I, S, D>(resources: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut ids = Vec::new();
        let mut index = HashMap::new();
        let mut depends_on = Vec::new();

        for (id, deps) in resources {
            let id = id.into();
            if id.is_empty() {
                return Err(GraphError::EmptyId);
            }
            if index.contains_key(&id) {
                return Err(GraphError::DuplicateId(id));
            }

            let mut edges = Vec::<String>::new();
            for dep in deps {
                let dep = dep.into();
                if !edges.contains(&dep) {
                    edges.push(dep);
                }
            }

            index.insert(id.clone(), ids.len());
            ids.push(id);
            depends_on.push(edges);
        }

        Ok(Self {
            ids,
            index,
            depends_on,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Ids in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.ids.iter().map(String::as_str)
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        match self.index.get(id) {
            Some(&i) => &self.depends_on[i],
            None => &[],
        }
    }

    /// Checks that every reference resolves, that no resource depends on
    /// itself, and that the graph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (id, deps) in self.ids.iter().zip(&self.depends_on) {
            for dep in deps {
                if dep == id {
                    return Err(GraphError::SelfReference(id.clone()));
                }
                if !self.index.contains_key(dep) {
                    return Err(GraphError::MissingDependency {
                        id: id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        let mut marks = vec![Mark::Unvisited; self.ids.len()];
        let mut stack = Vec::new();
        for start in 0..self.ids.len() {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    /// Returns every id exactly once, each after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&str>, GraphError> {
        self.validate()?;

        let mut remaining = self.depends_on.iter().map(Vec::len).collect::<Vec<_>>();
        let mut dependents = vec![Vec::new(); self.ids.len()];
        for i in 0..self.ids.len() {
            for dep in self.edges(i) {
                dependents[dep].push(i);
            }
        }

        let mut eligible = (0..self.ids.len())
            .filter(|&i| remaining[i] == 0)
            .collect::<BTreeSet<_>>();
        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(i) = eligible.pop_first() {
            order.push(self.ids[i].as_str());
            for &dependent in &dependents[i] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    eligible.insert(dependent);
                }
            }
        }

        debug_assert_eq!(order.len(), self.ids.len());
        Ok(order)
    }

    fn edges(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.depends_on[i]
            .iter()
            .filter_map(|dep| self.index.get(dep).copied())
    }

    fn visit(
        &self,
        i: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Result<(), GraphError> {
        marks[i] = Mark::OnStack;
        stack.push(i);

        for dep in self.edges(i) {
            match marks[dep] {
                Mark::Done => {}
                Mark::Unvisited => self.visit(dep, marks, stack)?,
                Mark::OnStack => {
                    let start = stack.iter().position(|&j| j == dep).unwrap_or(0);
                    let mut chain = stack[start..]
                        .iter()
                        .map(|&j| self.ids[j].clone())
                        .collect::<Vec<_>>();
                    chain.push(self.ids[dep].clone());
                    return Err(GraphError::Cycle(chain));
                }
            }
        }

        stack.pop();
        marks[i] = Mark::Done;
        Ok(())
    }
}
