use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use app_error::AppError;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::entity::{normalize_path, Resource, ResourceRef, ROOT_PATH};
use crate::store::GrantStore;

/// A slice of a candidate list. Applied before resolution, so only the slice is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
  pub offset: usize,
  /// None means no limit.
  pub limit: Option<usize>,
}

impl Page {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn new(offset: usize, limit: usize) -> Self {
    Self {
      offset,
      limit: Some(limit),
    }
  }

  pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
    let iter = items.into_iter().skip(self.offset);
    match self.limit {
      Some(limit) => iter.take(limit).collect(),
      None => iter.collect(),
    }
  }
}

/// The candidates of a tree request, in breadth-first order.
#[derive(Debug, Clone)]
pub struct TreePlan {
  pub root: Resource,
  pub candidates: Vec<Resource>,
  /// Folders at the depth cap that still have children. Callers re-query from them.
  pub unresolved_below: Vec<String>,
}

/// Turns a request into the set of resources to resolve, with as few store reads as possible:
/// one lookup for a list of paths, one `children` call per tree level.
#[derive(Clone)]
pub struct BatchPlanner {
  store: Arc<dyn GrantStore>,
  max_tree_depth: usize,
  max_bulk_batch: usize,
}

impl BatchPlanner {
  pub fn new(store: Arc<dyn GrantStore>, max_tree_depth: usize, max_bulk_batch: usize) -> Self {
    Self {
      store,
      max_tree_depth,
      max_bulk_batch,
    }
  }

  pub fn max_bulk_batch(&self) -> usize {
    self.max_bulk_batch
  }

  pub fn check_batch(&self, requested: usize) -> Result<(), AppError> {
    if requested > self.max_bulk_batch {
      return Err(AppError::BatchTooLarge {
        requested,
        max: self.max_bulk_batch,
      });
    }
    Ok(())
  }

  pub fn check_depth(&self, requested: usize) -> Result<(), AppError> {
    if requested > self.max_tree_depth {
      return Err(AppError::DepthExceeded {
        requested,
        max: self.max_tree_depth,
      });
    }
    Ok(())
  }

  /// Loads the resources at `paths`, normalized by this call. Returns them in request order
  /// paired with the path as requested. An unknown path fails the whole call with
  /// [AppError::InvalidResource]. A folder wins over a file with the same path.
  pub async fn plan_paths(&self, paths: &[String]) -> Result<Vec<(String, Resource)>, AppError> {
    self.check_batch(paths.len())?;
    let normalized = paths
      .iter()
      .map(|path| normalize_path(path))
      .collect::<Vec<_>>();
    let unique = normalized
      .iter()
      .cloned()
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect::<Vec<_>>();

    let mut found = self.store.resources_by_paths(&unique).await?;
    if unique.iter().any(|p| p == ROOT_PATH) && !found.iter().any(|r| r.path == ROOT_PATH) {
      found.push(self.store.root_folder().await?);
    }
    found.sort_by(|a, b| a.kind.cmp(&b.kind));

    let mut missing = vec![];
    let mut planned = Vec::with_capacity(normalized.len());
    for (requested, path) in paths.iter().zip(normalized) {
      match found.iter().find(|r| r.path == path) {
        Some(resource) => planned.push((requested.clone(), resource.clone())),
        None => missing.push(requested.clone()),
      }
    }
    if !missing.is_empty() {
      return Err(AppError::InvalidResource(missing.join(", ")));
    }
    Ok(planned)
  }

  pub async fn plan_path(&self, path: &str) -> Result<Resource, AppError> {
    let mut planned = self.plan_paths(&[path.to_string()]).await?;
    planned
      .pop()
      .map(|(_, resource)| resource)
      .ok_or_else(|| AppError::InvalidResource(path.to_string()))
  }

  /// Loads the resources behind `refs`, in request order, failing on any unknown one.
  pub async fn plan_refs(&self, refs: &[ResourceRef]) -> Result<Vec<Resource>, AppError> {
    self.check_batch(refs.len())?;
    let unique = refs.iter().copied().collect::<BTreeSet<_>>();
    let found = self
      .store
      .resources(&unique.into_iter().collect::<Vec<_>>())
      .await?;
    let mut planned = Vec::with_capacity(refs.len());
    let mut missing = vec![];
    for resource_ref in refs {
      match found.iter().find(|r| r.resource_ref() == *resource_ref) {
        Some(resource) => planned.push(resource.clone()),
        None => missing.push(resource_ref.to_string()),
      }
    }
    if !missing.is_empty() {
      return Err(AppError::InvalidResource(missing.join(", ")));
    }
    Ok(planned)
  }

  /// Breadth-first walk below `root_path` down to `depth` levels. The root itself is the first
  /// candidate. Costs one store call per level plus one to find the unresolved frontier.
  pub async fn plan_tree(&self, root_path: &str, depth: usize) -> Result<TreePlan, AppError> {
    self.check_depth(depth)?;
    let root = self.plan_path(root_path).await?;
    let mut candidates = vec![root.clone()];
    let mut unresolved_below = vec![];
    if !root.is_folder() {
      return Ok(TreePlan {
        root,
        candidates,
        unresolved_below,
      });
    }

    let mut visited = HashSet::from([root.resource_ref()]);
    let mut level = vec![root.id];
    for current_depth in 1..=depth {
      if level.is_empty() {
        break;
      }
      let children = self.store.children(&level).await?;
      trace!(
        "[permission planner]: depth {} of {} has {} resources",
        current_depth,
        root.path,
        children.len()
      );
      level = children
        .iter()
        .filter(|r| r.is_folder())
        .map(|r| r.id)
        .collect();
      candidates.extend(
        children
          .into_iter()
          .filter(|r| visited.insert(r.resource_ref())),
      );
    }

    if !level.is_empty() {
      let below = self.store.children(&level).await?;
      let parents = below
        .iter()
        .filter_map(|r| r.parent)
        .collect::<HashSet<_>>();
      unresolved_below = candidates
        .iter()
        .filter(|r| parents.contains(&r.resource_ref()))
        .map(|r| r.path.clone())
        .collect();
    }

    Ok(TreePlan {
      root,
      candidates,
      unresolved_below,
    })
  }

  /// Every folder, the root included, split into chunks of at most `max_bulk_batch`.
  pub async fn plan_all_folders(&self) -> Result<Vec<Vec<Resource>>, AppError> {
    let mut folders = self.store.all_folders().await?;
    if !folders.iter().any(|f| f.is_root()) {
      folders.insert(0, self.store.root_folder().await?);
    }
    Ok(
      folders
        .chunks(self.max_bulk_batch.max(1))
        .map(|chunk| chunk.to_vec())
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_slices_candidates_test() {
    let items = (0..10).collect::<Vec<_>>();
    assert_eq!(Page::new(2, 3).apply(items.clone()), vec![2, 3, 4]);
    assert_eq!(Page::new(8, 5).apply(items.clone()), vec![8, 9]);
    assert_eq!(Page::all().apply(items.clone()).len(), 10);
    assert!(Page::new(20, 5).apply(items).is_empty());
  }
}
