use std::collections::BTreeMap;

use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Created(String),
    Changed(String),
    Deleted(String),
}

/// Hierarchical observable key store used for coordination metadata.
///
/// Children are listed in creation order. Ephemeral nodes carry the session
/// that created them and vanish when that session disconnects.
#[cfg_attr(test, automock)]
pub trait DistributedTree: Send + Sync + 'static {
    /// Creates `path` (and missing parents). Returns false if it already exists.
    fn create(
        &self,
        path: &str,
        data: Bytes,
        ephemeral_session: Option<String>,
    ) -> Result<bool>;

    fn set(
        &self,
        path: &str,
        data: Bytes,
    ) -> Result<()>;

    fn get(
        &self,
        path: &str,
    ) -> Result<Option<Bytes>>;

    fn exists(
        &self,
        path: &str,
    ) -> Result<bool>;

    /// Names of the direct children of `path` in creation order.
    fn children(
        &self,
        path: &str,
    ) -> Result<Vec<String>>;

    /// Deletes `path` and everything below it.
    fn delete(
        &self,
        path: &str,
    ) -> Result<bool>;

    /// Removes every ephemeral node of `session`; returns the removed paths.
    fn disconnect(
        &self,
        session: &str,
    ) -> Result<Vec<String>>;

    fn subscribe(&self) -> broadcast::Receiver<TreeEvent>;
}

#[derive(Debug)]
struct TreeNode {
    data: Bytes,
    ephemeral_session: Option<String>,
    created: u64,
}

#[derive(Debug, Default)]
struct TreeState {
    nodes: BTreeMap<String, TreeNode>,
    next_created: u64,
}

impl TreeState {
    fn insert(
        &mut self,
        path: &str,
        data: Bytes,
        ephemeral_session: Option<String>,
    ) {
        self.next_created += 1;
        self.nodes.insert(
            path.to_string(),
            TreeNode {
                data,
                ephemeral_session,
                created: self.next_created,
            },
        );
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parents(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut idx = 0;
    while let Some(pos) = path[idx + 1..].find('/') {
        idx += pos + 1;
        out.push(path[..idx].to_string());
    }
    out
}

fn is_below(
    path: &str,
    root: &str,
) -> bool {
    path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/'
}

/// In-memory [`DistributedTree`] shared by every member of a
/// [`LocalNetwork`](crate::LocalNetwork).
pub struct MemTree {
    state: RwLock<TreeState>,
    events: broadcast::Sender<TreeEvent>,
}

impl Default for MemTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTree {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(TreeState::default()),
            events,
        }
    }

    fn notify(
        &self,
        event: TreeEvent,
    ) {
        trace!(?event, "tree event");
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl DistributedTree for MemTree {
    fn create(
        &self,
        path: &str,
        data: Bytes,
        ephemeral_session: Option<String>,
    ) -> Result<bool> {
        let path = normalize(path);
        let mut created = Vec::new();
        {
            let mut state = self.state.write();
            if state.nodes.contains_key(&path) {
                return Ok(false);
            }
            for parent in parents(&path) {
                if !state.nodes.contains_key(&parent) {
                    state.insert(&parent, Bytes::new(), None);
                    created.push(parent);
                }
            }
            state.insert(&path, data, ephemeral_session);
            created.push(path);
        }
        for p in created {
            self.notify(TreeEvent::Created(p));
        }
        Ok(true)
    }

    fn set(
        &self,
        path: &str,
        data: Bytes,
    ) -> Result<()> {
        let path = normalize(path);
        let existed = {
            let mut state = self.state.write();
            match state.nodes.get_mut(&path) {
                Some(node) => {
                    node.data = data.clone();
                    true
                }
                None => false,
            }
        };
        if existed {
            self.notify(TreeEvent::Changed(path));
            Ok(())
        } else {
            self.create(&path, data, None).map(|_| ())
        }
    }

    fn get(
        &self,
        path: &str,
    ) -> Result<Option<Bytes>> {
        Ok(self.state.read().nodes.get(&normalize(path)).map(|n| n.data.clone()))
    }

    fn exists(
        &self,
        path: &str,
    ) -> Result<bool> {
        Ok(self.state.read().nodes.contains_key(&normalize(path)))
    }

    fn children(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        let root = normalize(path);
        let state = self.state.read();
        let mut children: Vec<(u64, String)> = state
            .nodes
            .range(root.clone()..)
            .take_while(|(p, _)| p.starts_with(&root))
            .filter(|(p, _)| is_below(p, &root) && !p[root.len() + 1..].contains('/'))
            .map(|(p, n)| (n.created, p[root.len() + 1..].to_string()))
            .collect();
        children.sort_by_key(|(created, _)| *created);
        Ok(children.into_iter().map(|(_, name)| name).collect())
    }

    fn delete(
        &self,
        path: &str,
    ) -> Result<bool> {
        let root = normalize(path);
        let removed: Vec<String> = {
            let mut state = self.state.write();
            let doomed: Vec<String> = state
                .nodes
                .keys()
                .filter(|p| **p == root || is_below(p, &root))
                .cloned()
                .collect();
            for p in &doomed {
                state.nodes.remove(p);
            }
            doomed
        };
        let any = !removed.is_empty();
        for p in removed {
            self.notify(TreeEvent::Deleted(p));
        }
        Ok(any)
    }

    fn disconnect(
        &self,
        session: &str,
    ) -> Result<Vec<String>> {
        let owned: Vec<String> = self
            .state
            .read()
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_session.as_deref() == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for p in &owned {
            self.delete(p)?;
        }
        Ok(owned)
    }

    fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }
}
