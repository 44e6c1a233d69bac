use serde_json::{Map, Value};

use shared::domain::{StoreSnapshot, TodoId};

/// Client-side replica of one user's subtree, kept current by applying the
/// `put` and `patch` deltas streamed by the backend. Snapshots are read
/// straight off the replica, so every delta yields a full snapshot.
#[derive(Debug, Default)]
pub struct ScopeMirror {
    tree: Value,
}

impl ScopeMirror {
    /// Replaces the subtree at `path` with `data`; `null` removes it. The
    /// root path replaces the whole replica.
    pub fn apply_put(&mut self, path: &str, data: Value) {
        let segments = split_path(path);
        if segments.is_empty() {
            self.tree = data;
            return;
        }
        if data.is_null() {
            remove_at(&mut self.tree, &segments);
        } else {
            *slot_at(&mut self.tree, &segments) = data;
        }
    }

    /// Merges `data`'s children into the node at `path`; a `null` child
    /// removes that key.
    pub fn apply_patch(&mut self, path: &str, data: Value) {
        let Value::Object(children) = data else {
            return;
        };
        for (key, child) in children {
            let mut segments = split_path(path);
            segments.push(&key);
            if child.is_null() {
                remove_at(&mut self.tree, &segments);
            } else {
                *slot_at(&mut self.tree, &segments) = child;
            }
        }
    }

    /// The replica as key-ordered record entries. A non-object root (the
    /// scope is empty or holds a stray scalar) has no records.
    pub fn snapshot(&self) -> StoreSnapshot {
        let entries = match &self.tree {
            Value::Object(records) => records
                .iter()
                .map(|(id, value)| (TodoId::new(id.clone()), value.clone()))
                .collect(),
            _ => Vec::new(),
        };
        StoreSnapshot { entries }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Walks to the node at `segments`, materializing missing intermediate
/// objects, and returns a slot the caller can write through.
fn slot_at<'a>(tree: &'a mut Value, segments: &[&str]) -> &'a mut Value {
    segments.iter().fold(tree, |node, segment| {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        match node {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => unreachable!("node was just replaced with an object"),
        }
    })
}

fn remove_at(tree: &mut Value, segments: &[&str]) {
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };
    let mut current = tree;
    for segment in parents {
        let next = match current {
            Value::Object(map) => map.get_mut(*segment),
            _ => None,
        };
        match next {
            Some(child) => current = child,
            None => return,
        }
    }
    if let Value::Object(map) = current {
        map.remove(*leaf);
    }
}

#[cfg(test)]
#[path = "tests/mirror_tests.rs"]
mod tests;
