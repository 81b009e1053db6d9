use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

use tokio::sync::watch;
use tracing::debug;
use tracing::info;

use crate::config::invalid;
use crate::GridError;
use crate::Result;

/// Lifecycle of one service. Ordered: a service is never available before ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    Uninitialized,
    /// Constructed and wired, not yet serving
    Ready,
    Available,
}

struct ServiceNode {
    deps: Vec<String>,
    state: watch::Sender<ServiceState>,
}

/// Directed acyclic graph of services and what they depend on.
///
/// Services are registered with [`add`](Self::add), validated and ordered by
/// [`build`](Self::build), then share their state through watch channels so
/// any task can wait on availability without callbacks.
#[derive(Default)]
pub struct ServiceGraph {
    services: HashMap<String, ServiceNode>,
    insertion: Vec<String>,
    order: Vec<String>,
}

impl std::fmt::Debug for ServiceGraph {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let states: Vec<(&str, ServiceState)> = self
            .insertion
            .iter()
            .filter_map(|n| self.services.get(n).map(|s| (n.as_str(), *s.state.borrow())))
            .collect();
        f.debug_struct("ServiceGraph").field("states", &states).finish()
    }
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: &str,
        deps: &[&str],
    ) -> &mut Self {
        if !self.services.contains_key(name) {
            self.insertion.push(name.to_string());
        }
        let (state, _) = watch::channel(ServiceState::Uninitialized);
        self.services.insert(
            name.to_string(),
            ServiceNode {
                deps: deps.iter().map(|d| d.to_string()).collect(),
                state,
            },
        );
        self
    }

    /// Checks every dependency exists and the graph has no cycle.
    ///
    /// Returns the construction order: dependencies before dependents,
    /// ties broken by registration order.
    pub fn build(&mut self) -> Result<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &self.insertion {
            let node = &self.services[name];
            indegree.entry(name).or_insert(0);
            for dep in &node.deps {
                if !self.services.contains_key(dep) {
                    return Err(invalid(format!("service {name} depends on unknown service {dep}")));
                }
                *indegree.entry(name).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(name);
            }
        }

        let mut queue: VecDeque<&str> = self
            .insertion
            .iter()
            .map(String::as_str)
            .filter(|n| indegree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.insertion.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for next in dependents.get(name).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.insertion.len() {
            let stuck: Vec<&str> = self
                .insertion
                .iter()
                .map(String::as_str)
                .filter(|n| !order.iter().any(|o| o == n))
                .collect();
            return Err(invalid(format!("service dependency cycle among {stuck:?}")));
        }

        debug!(?order, "service construction order");
        self.order = order.clone();
        Ok(order)
    }

    /// Construction order computed by the last successful [`build`](Self::build).
    pub fn order(&self) -> &[String] {
        &self.order
    }

    fn node(
        &self,
        name: &str,
    ) -> std::result::Result<&ServiceNode, GridError> {
        self.services
            .get(name)
            .ok_or_else(|| GridError::ServiceGraph(format!("unknown service {name}")))
    }

    pub fn state(
        &self,
        name: &str,
    ) -> Result<ServiceState> {
        Ok(*self.node(name)?.state.borrow())
    }

    pub fn set_state(
        &self,
        name: &str,
        state: ServiceState,
    ) -> Result<()> {
        let node = self.node(name)?;
        let previous = node.state.send_replace(state);
        if previous != state {
            info!(service = name, ?previous, ?state, "service state changed");
        }
        Ok(())
    }

    pub fn set_ready(
        &self,
        name: &str,
    ) -> Result<()> {
        self.set_state(name, ServiceState::Ready)
    }

    pub fn set_available(
        &self,
        name: &str,
    ) -> Result<()> {
        self.set_state(name, ServiceState::Available)
    }

    /// Marks every service uninitialized, waking nobody up.
    pub fn reset_all(&self) {
        for node in self.services.values() {
            node.state.send_replace(ServiceState::Uninitialized);
        }
    }

    /// `name` and everything it depends on, directly or not.
    pub fn closure(
        &self,
        name: &str,
    ) -> Result<BTreeSet<String>> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(n) = stack.pop() {
            let node = self.node(&n)?;
            if seen.insert(n) {
                stack.extend(node.deps.iter().cloned());
            }
        }
        Ok(seen)
    }

    /// Waits until `name` and all of its transitive dependencies are available.
    pub async fn await_available(
        &self,
        name: &str,
    ) -> Result<()> {
        let mut receivers = Vec::new();
        for n in self.closure(name)? {
            receivers.push((n.clone(), self.node(&n)?.state.subscribe()));
        }
        loop {
            for (n, rx) in receivers.iter_mut() {
                rx.wait_for(|s| *s == ServiceState::Available)
                    .await
                    .map_err(|_| GridError::ServiceGraph(format!("service {n} dropped")))?;
            }
            // a dependency may have dropped back while we waited on another one
            if receivers.iter().all(|(_, rx)| *rx.borrow() == ServiceState::Available) {
                return Ok(());
            }
        }
    }
}
