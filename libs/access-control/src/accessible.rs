use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::entity::{Resource, ResourceRef};

/// One folder listed at the root of a principal's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRootEntry {
  pub id: i64,
  pub name: String,
  /// The real location. Only the display position is virtual.
  pub path: String,
  /// False for physical children of the root.
  pub promoted: bool,
}

/// Paths of the readable folders, sorted.
pub fn accessible_paths(folders: &[Resource], readable: &HashSet<ResourceRef>) -> Vec<String> {
  let mut paths = folders
    .iter()
    .filter(|f| readable.contains(&f.resource_ref()))
    .map(|f| f.path.clone())
    .collect::<Vec<_>>();
  paths.sort();
  paths
}

/// The folders shown when listing the root: readable physical children of the root, then every
/// readable deeper folder whose parent is not readable, surfaced as if it were a child of the
/// root. Entries sharing a name are all kept.
pub fn virtual_root_view(
  folders: &[Resource],
  readable: &HashSet<ResourceRef>,
) -> Vec<VirtualRootEntry> {
  let Some(root) = folders.iter().find(|f| f.is_root()) else {
    return vec![];
  };
  let root_ref = root.resource_ref();

  let mut physical = vec![];
  let mut promoted = vec![];
  for folder in folders {
    if folder.is_root() || !readable.contains(&folder.resource_ref()) {
      continue;
    }
    match folder.parent {
      Some(parent) if parent == root_ref => physical.push(entry(folder, false)),
      Some(parent) if !readable.contains(&parent) => promoted.push(entry(folder, true)),
      _ => {},
    }
  }
  physical.sort_by(|a, b| a.path.cmp(&b.path));
  promoted.sort_by(|a, b| a.path.cmp(&b.path));
  physical.extend(promoted);
  physical
}

fn entry(folder: &Resource, promoted: bool) -> VirtualRootEntry {
  VirtualRootEntry {
    id: folder.id,
    name: folder.name.clone(),
    path: folder.path.clone(),
    promoted,
  }
}
