use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use app_error::AppError;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::accessible::{accessible_paths, virtual_root_view, VirtualRootEntry};
use crate::act::{Capability, CapabilitySet};
use crate::cache::{CacheEntry, CacheKey, CacheStats, PermissionCache};
use crate::config::AccessControlSetting;
use crate::entity::{
  normalize_path, Grant, Principal, Resource, ResourceKind, ResourceRef, Subject, ROOT_PATH,
};
use crate::explain::{explain_resolution, ExplainReport};
use crate::instrument::{DualRunVerifier, Instrumentation, OperationClass};
use crate::metrics::AccessControlMetrics;
use crate::planner::{BatchPlanner, Page};
use crate::resolver::{Decision, EffectivePermission, Provenance};
use crate::store::GrantStore;
use crate::strategy::{BatchResolver, NaiveResolver, PermissionResolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionChange {
  GrantChanged { resource: ResourceRef },
  GroupMembershipChanged { group_id: i64 },
  PrincipalChanged { uid: i64 },
}

/// Result of a tree request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeAccess {
  pub root: String,
  pub depth: usize,
  /// Every resolved resource of the requested page, denied ones included, keyed by path.
  pub permissions: BTreeMap<String, EffectivePermission>,
  /// Folders at the depth cap that have children which were not resolved.
  pub unresolved_below: Vec<String>,
  /// Candidates found before pagination.
  pub total_candidates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmStats {
  pub folders_warmed: usize,
  pub files_warmed: usize,
}

enum Invalidation {
  Resource(ResourceRef),
  Principal(i64),
  Group(i64),
}

/// Computes, caches, invalidates and batches effective-permission decisions.
///
/// Readers resolve fully in parallel. A mutation writes the grant store, then bumps the
/// invalidation epoch and invalidates the cache under the write side of `invalidation_gate`
/// before returning. A reader writes its results back under the read side, and only when the
/// epoch it loaded before reading the store is still current. Either the write lands before
/// the invalidation removes it, or it is skipped.
pub struct PermissionEngine {
  store: Arc<dyn GrantStore>,
  cache: Arc<dyn PermissionCache>,
  resolver: Arc<dyn PermissionResolver>,
  planner: BatchPlanner,
  setting: AccessControlSetting,
  instrumentation: Instrumentation,
  dual_run: Option<DualRunVerifier>,
  metrics: Arc<AccessControlMetrics>,
  invalidation_epoch: AtomicU64,
  /// Orders cache write-backs against epoch bumps and the invalidations that follow them.
  invalidation_gate: RwLock<()>,
  /// Set when neither an invalidation nor the fallback clear succeeded.
  cache_bypass: AtomicBool,
  change_tx: broadcast::Sender<PermissionChange>,
}

impl PermissionEngine {
  pub fn new(
    store: Arc<dyn GrantStore>,
    cache: Arc<dyn PermissionCache>,
    setting: AccessControlSetting,
    metrics: Arc<AccessControlMetrics>,
  ) -> Self {
    let planner = BatchPlanner::new(
      store.clone(),
      setting.max_tree_depth,
      setting.max_bulk_batch,
    );
    let instrumentation = Instrumentation::new(setting.slow_thresholds.clone(), metrics.clone());
    let dual_run = setting.dual_run.enabled.then(|| {
      DualRunVerifier::new(&setting.dual_run, Arc::new(NaiveResolver), metrics.clone())
    });
    let (change_tx, _) = broadcast::channel(1000);
    Self {
      store,
      cache,
      resolver: Arc::new(BatchResolver),
      planner,
      setting,
      instrumentation,
      dual_run,
      metrics,
      invalidation_epoch: AtomicU64::new(0),
      invalidation_gate: RwLock::new(()),
      cache_bypass: AtomicBool::new(false),
      change_tx,
    }
  }

  /// Replaces the resolution strategy. [BatchResolver] by default.
  pub fn with_resolver(mut self, resolver: Arc<dyn PermissionResolver>) -> Self {
    self.resolver = resolver;
    self
  }

  /// Replaces the resolver dual-run compares against. [NaiveResolver] by default.
  pub fn with_reference_resolver(mut self, reference: Arc<dyn PermissionResolver>) -> Self {
    if self.setting.dual_run.enabled {
      self.dual_run = Some(DualRunVerifier::new(
        &self.setting.dual_run,
        reference,
        self.metrics.clone(),
      ));
    }
    self
  }

  pub fn resolver_name(&self) -> &'static str {
    self.resolver.name()
  }

  pub fn setting(&self) -> &AccessControlSetting {
    &self.setting
  }

  pub fn dual_run(&self) -> Option<&DualRunVerifier> {
    self.dual_run.as_ref()
  }

  pub fn is_cache_bypassed(&self) -> bool {
    self.cache_bypass.load(Ordering::SeqCst)
  }

  pub fn subscribe_change(&self) -> broadcast::Receiver<PermissionChange> {
    self.change_tx.subscribe()
  }

  /// The effective permission of `uid` on the resource at `path`.
  #[instrument(level = "debug", skip(self))]
  pub async fn effective_permission(
    &self,
    uid: i64,
    path: &str,
  ) -> Result<EffectivePermission, AppError> {
    self
      .instrumentation
      .measure(
        OperationClass::Single,
        "effective_permission",
        1,
        self.effective_permission_inner(uid, path),
      )
      .await
  }

  async fn effective_permission_inner(
    &self,
    uid: i64,
    path: &str,
  ) -> Result<EffectivePermission, AppError> {
    let resource = self.planner.plan_path(path).await?;
    let resource_ref = resource.resource_ref();
    let mut resolved = self
      .resolve_resources(uid, &[resource], OperationClass::Single)
      .await?;
    resolved
      .remove(&resource_ref)
      .ok_or_else(|| AppError::Internal(anyhow!("{} was not resolved", resource_ref)))
  }

  /// Decision for one capability. A store failure denies, except read on the root which
  /// degrades to [Provenance::RootDefault].
  pub async fn resolve(
    &self,
    uid: i64,
    path: &str,
    capability: Capability,
  ) -> Result<Decision, AppError> {
    match self.effective_permission(uid, path).await {
      Ok(permission) => Ok(permission.decide(capability)),
      Err(err) if err.is_store_unavailable() => {
        let allowed = degraded_access(path, capability);
        warn!(
          "[permission]: store unavailable while resolving {} for uid {}: {}, degraded to {}",
          path,
          uid,
          err,
          if allowed { "root-default" } else { "deny" }
        );
        if allowed {
          Ok(Decision::Granted(Provenance::RootDefault))
        } else {
          Ok(Decision::Denied)
        }
      },
      Err(err) => Err(err),
    }
  }

  pub async fn can_access(
    &self,
    uid: i64,
    path: &str,
    capability: Capability,
  ) -> Result<bool, AppError> {
    Ok(self.resolve(uid, path, capability).await?.is_granted())
  }

  /// Resolves a set of resources with a constant number of store reads.
  #[instrument(level = "debug", skip_all, fields(uid = uid, count = refs.len()))]
  pub async fn resolve_many(
    &self,
    uid: i64,
    refs: &[ResourceRef],
    page: Page,
  ) -> Result<HashMap<ResourceRef, EffectivePermission>, AppError> {
    self
      .instrumentation
      .measure(
        OperationClass::Bulk,
        "resolve_many",
        refs.len(),
        self.resolve_many_inner(uid, refs, page),
      )
      .await
  }

  async fn resolve_many_inner(
    &self,
    uid: i64,
    refs: &[ResourceRef],
    page: Page,
  ) -> Result<HashMap<ResourceRef, EffectivePermission>, AppError> {
    let candidates = page.apply(refs.to_vec());
    let resources = self.planner.plan_refs(&candidates).await?;
    self
      .resolve_resources(uid, &resources, OperationClass::Bulk)
      .await
  }

  pub async fn bulk_access(
    &self,
    uid: i64,
    paths: &[String],
    capability: Capability,
  ) -> Result<HashMap<String, bool>, AppError> {
    self
      .bulk_access_page(uid, paths, capability, Page::all())
      .await
  }

  /// Maps each requested path of the page to whether `uid` holds `capability` on it. Unknown
  /// paths fail the call; a store failure denies everything except read on the root.
  #[instrument(level = "debug", skip_all, fields(uid = uid, count = paths.len()))]
  pub async fn bulk_access_page(
    &self,
    uid: i64,
    paths: &[String],
    capability: Capability,
    page: Page,
  ) -> Result<HashMap<String, bool>, AppError> {
    self
      .instrumentation
      .measure(
        OperationClass::Bulk,
        "bulk_access",
        paths.len(),
        self.bulk_access_inner(uid, paths, capability, page),
      )
      .await
  }

  async fn bulk_access_inner(
    &self,
    uid: i64,
    paths: &[String],
    capability: Capability,
    page: Page,
  ) -> Result<HashMap<String, bool>, AppError> {
    let candidates = page.apply(paths.to_vec());
    let result = async {
      let planned = self.planner.plan_paths(&candidates).await?;
      let resources = planned
        .iter()
        .map(|(_, resource)| resource.clone())
        .collect::<Vec<_>>();
      let resolved = self
        .resolve_resources(uid, &resources, OperationClass::Bulk)
        .await?;
      Ok::<_, AppError>(
        planned
          .into_iter()
          .map(|(path, resource)| {
            let allowed = resolved
              .get(&resource.resource_ref())
              .map(|permission| permission.allows(capability))
              .unwrap_or(false);
            (path, allowed)
          })
          .collect::<HashMap<_, _>>(),
      )
    }
    .await;

    match result {
      Err(err) if err.is_store_unavailable() => {
        warn!(
          "[permission]: store unavailable during bulk access for uid {}: {}, denying {} paths",
          uid,
          err,
          candidates.len()
        );
        Ok(
          candidates
            .into_iter()
            .map(|path| {
              let allowed = degraded_access(&path, capability);
              (path, allowed)
            })
            .collect(),
        )
      },
      other => other,
    }
  }

  pub async fn tree_access(
    &self,
    uid: i64,
    root_path: &str,
    depth: usize,
  ) -> Result<TreeAccess, AppError> {
    self
      .tree_access_page(uid, root_path, depth, Page::all())
      .await
  }

  /// Resolves `root_path` and its descendants down to `depth` levels. The page slices the
  /// breadth-first candidate list before resolution.
  #[instrument(level = "debug", skip(self))]
  pub async fn tree_access_page(
    &self,
    uid: i64,
    root_path: &str,
    depth: usize,
    page: Page,
  ) -> Result<TreeAccess, AppError> {
    let start = Instant::now();
    let result = self.tree_access_inner(uid, root_path, depth, page).await;
    let count = result
      .as_ref()
      .map(|tree| tree.permissions.len())
      .unwrap_or(0);
    self
      .instrumentation
      .record(OperationClass::Tree, "tree_access", count, start.elapsed());
    result
  }

  async fn tree_access_inner(
    &self,
    uid: i64,
    root_path: &str,
    depth: usize,
    page: Page,
  ) -> Result<TreeAccess, AppError> {
    let plan = self.planner.plan_tree(root_path, depth).await?;
    let total_candidates = plan.candidates.len();
    let candidates = page.apply(plan.candidates);
    let resolved = self
      .resolve_resources(uid, &candidates, OperationClass::Tree)
      .await?;
    let permissions = candidates
      .iter()
      .map(|resource| {
        let permission = resolved
          .get(&resource.resource_ref())
          .cloned()
          .unwrap_or_default();
        (resource.path.clone(), permission)
      })
      .collect();
    Ok(TreeAccess {
      root: plan.root.path,
      depth,
      permissions,
      unresolved_below: plan.unresolved_below,
      total_candidates,
    })
  }

  /// Every folder `uid` can read, whatever its ancestors, sorted by path.
  pub async fn accessible_folders(&self, uid: i64) -> Result<Vec<String>, AppError> {
    let start = Instant::now();
    let result = self
      .readable_folders(uid)
      .await
      .map(|(folders, readable)| accessible_paths(&folders, &readable));
    self.instrumentation.record(
      OperationClass::Accessible,
      "accessible_folders",
      result.as_ref().map(|paths| paths.len()).unwrap_or(0),
      start.elapsed(),
    );
    result
  }

  /// Paths listed at the root of `uid`'s view: readable children of the root followed by the
  /// promoted folders.
  pub async fn accessible_roots(&self, uid: i64) -> Result<Vec<String>, AppError> {
    Ok(
      self
        .virtual_root_view(uid)
        .await?
        .into_iter()
        .map(|entry| entry.path)
        .collect(),
    )
  }

  pub async fn virtual_root_view(&self, uid: i64) -> Result<Vec<VirtualRootEntry>, AppError> {
    let start = Instant::now();
    let result = self
      .readable_folders(uid)
      .await
      .map(|(folders, readable)| virtual_root_view(&folders, &readable));
    self.instrumentation.record(
      OperationClass::Accessible,
      "virtual_root_view",
      result.as_ref().map(|entries| entries.len()).unwrap_or(0),
      start.elapsed(),
    );
    result
  }

  async fn readable_folders(
    &self,
    uid: i64,
  ) -> Result<(Vec<Resource>, HashSet<ResourceRef>), AppError> {
    let chunks = self.planner.plan_all_folders().await?;
    let mut folders = vec![];
    let mut readable = HashSet::new();
    for chunk in chunks {
      let resolved = self
        .resolve_resources(uid, &chunk, OperationClass::Accessible)
        .await?;
      readable.extend(
        resolved
          .into_iter()
          .filter(|(_, permission)| permission.allows(Capability::Read))
          .map(|(resource, _)| resource),
      );
      folders.extend(chunk);
    }
    Ok((folders, readable))
  }

  async fn load_principal(&self, uid: i64) -> Result<Principal, AppError> {
    Ok(
      self
        .store
        .principal(uid)
        .await?
        .unwrap_or_else(|| Principal::user(uid)),
    )
  }

  /// Cache first, then one resolver pass over the misses, written back to the cache.
  async fn resolve_resources(
    &self,
    uid: i64,
    resources: &[Resource],
    class: OperationClass,
  ) -> Result<HashMap<ResourceRef, EffectivePermission>, AppError> {
    let mut seen = HashSet::with_capacity(resources.len());
    let unique = resources
      .iter()
      .filter(|r| seen.insert(r.resource_ref()))
      .collect::<Vec<_>>();
    let mut result = HashMap::with_capacity(unique.len());
    if unique.is_empty() {
      return Ok(result);
    }

    let use_cache = !self.is_cache_bypassed();
    if use_cache {
      let keys = unique
        .iter()
        .map(|r| CacheKey::new(uid, r.resource_ref()))
        .collect::<Vec<_>>();
      match self.cache.get_many(&keys).await {
        Ok(hits) => result.extend(hits.into_iter().map(|(key, value)| (key.resource, value))),
        Err(err) => warn!("[permission]: cache read failed, resolving from store: {}", err),
      }
    }
    let misses = unique
      .into_iter()
      .filter(|r| !result.contains_key(&r.resource_ref()))
      .cloned()
      .collect::<Vec<_>>();
    self
      .metrics
      .record_cache_lookup(result.len() as u64, misses.len() as u64);
    if misses.is_empty() {
      return Ok(result);
    }

    let epoch = self.invalidation_epoch.load(Ordering::SeqCst);
    let principal = self.load_principal(uid).await?;
    let computed = self
      .resolver
      .resolve_many(self.store.as_ref(), &principal, &misses)
      .await?;
    if use_cache {
      self.write_back(&principal, &misses, &computed, epoch).await;
    }
    if class != OperationClass::Single {
      if let Some(dual_run) = &self.dual_run {
        dual_run.maybe_verify(
          self.store.clone(),
          principal,
          misses,
          computed.clone(),
        );
      }
    }
    result.extend(computed);
    Ok(result)
  }

  async fn write_back(
    &self,
    principal: &Principal,
    resources: &[Resource],
    computed: &HashMap<ResourceRef, EffectivePermission>,
    epoch: u64,
  ) {
    let groups = principal.groups.iter().copied().collect::<Vec<_>>();
    let entries = resources
      .iter()
      .filter_map(|resource| {
        let resource_ref = resource.resource_ref();
        let permission = computed.get(&resource_ref)?;
        Some(CacheEntry {
          key: CacheKey::new(principal.uid, resource_ref),
          permission: permission.clone(),
          groups: groups.clone(),
          depends_on: if resource.is_folder() {
            None
          } else {
            permission.inherited_from.or(resource.parent)
          },
          ttl: self.setting.cache_ttl,
        })
      })
      .collect::<Vec<_>>();
    let count = entries.len();

    let _gate = self.invalidation_gate.read().await;
    // An invalidation ran while these results were computed from the store.
    if self.invalidation_epoch.load(Ordering::SeqCst) != epoch {
      debug!(
        "[permission]: dropping {} results computed before an invalidation",
        count
      );
      return;
    }
    if let Err(err) = self.cache.put_many(entries).await {
      warn!("[permission]: failed to cache {} results: {}", count, err);
    }
  }

  /// Invalidates every cached decision on `resource`, and on the files inheriting from it.
  #[instrument(level = "debug", skip(self))]
  pub async fn on_grant_changed(&self, resource: ResourceRef) {
    self
      .apply_invalidations(vec![Invalidation::Resource(resource)])
      .await;
    let _ = self
      .change_tx
      .send(PermissionChange::GrantChanged { resource });
  }

  /// Invalidates every cached decision of the current members of `group_id` and of the
  /// principals that were members when their entries were computed.
  #[instrument(level = "debug", skip(self))]
  pub async fn on_group_membership_changed(&self, group_id: i64) {
    let mut targets = vec![Invalidation::Group(group_id)];
    match self.store.group_members(group_id).await {
      Ok(members) => targets.extend(members.into_iter().map(Invalidation::Principal)),
      Err(err) => {
        warn!(
          "[permission]: failed to load members of group {}: {}, clearing the cache",
          group_id, err
        );
        let _gate = self.invalidation_gate.write().await;
        self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        self.clear_after_failure().await;
      },
    }
    self.apply_invalidations(targets).await;
    let _ = self
      .change_tx
      .send(PermissionChange::GroupMembershipChanged { group_id });
  }

  /// Invalidates every cached decision of `uid`. Used when the admin flag or the groups of a
  /// user change.
  #[instrument(level = "debug", skip(self))]
  pub async fn on_principal_changed(&self, uid: i64) {
    self
      .apply_invalidations(vec![Invalidation::Principal(uid)])
      .await;
    let _ = self
      .change_tx
      .send(PermissionChange::PrincipalChanged { uid });
  }

  async fn apply_invalidations(&self, targets: Vec<Invalidation>) {
    let _gate = self.invalidation_gate.write().await;
    self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
    for target in targets {
      let result = match target {
        Invalidation::Resource(resource) => self.cache.invalidate(&resource).await,
        Invalidation::Principal(uid) => self.cache.invalidate_for_principal(uid).await,
        Invalidation::Group(group_id) => self.cache.invalidate_for_group(group_id).await,
      };
      if let Err(err) = result {
        self.recover_cache(err).await;
        return;
      }
    }
    if self.is_cache_bypassed() {
      self.clear_after_failure().await;
    }
  }

  /// Callers hold the write side of `invalidation_gate`.
  async fn recover_cache(&self, err: AppError) {
    error!(
      "[permission]: cache invalidation failed: {}, clearing the cache",
      err
    );
    self.clear_after_failure().await;
  }

  /// Clears the cache. While that fails the cache is bypassed for reads and writes. Callers
  /// hold the write side of `invalidation_gate`.
  async fn clear_after_failure(&self) {
    match self.cache.clear().await {
      Ok(()) => {
        if self.cache_bypass.swap(false, Ordering::SeqCst) {
          info!("[permission]: cache cleared, no longer bypassed");
        }
        self.metrics.record_cache_bypassed(false);
      },
      Err(err) => {
        if !self.cache_bypass.swap(true, Ordering::SeqCst) {
          error!(
            "[permission]: failed to clear the cache: {}, bypassing it until a clear succeeds",
            err
          );
        }
        self.metrics.record_cache_bypassed(true);
      },
    }
  }

  /// Sets the capabilities `subject` holds on `resource`. Returns once the cache no longer
  /// holds any decision computed from the previous grant.
  #[instrument(level = "info", skip(self))]
  pub async fn grant(
    &self,
    subject: Subject,
    resource: ResourceRef,
    capabilities: CapabilitySet,
  ) -> Result<(), AppError> {
    let grant = Grant::new(subject, resource, capabilities);
    self.store.upsert_grant(&grant).await?;
    self.metrics.record_grant_mutation();
    self.on_grant_changed(resource).await;
    Ok(())
  }

  #[instrument(level = "info", skip(self))]
  pub async fn revoke(&self, subject: Subject, resource: ResourceRef) -> Result<bool, AppError> {
    let removed = self.store.delete_grant(subject, resource).await?;
    self.metrics.record_grant_mutation();
    self.on_grant_changed(resource).await;
    Ok(removed)
  }

  /// Applies several grants, then invalidates every touched resource once. On a store failure
  /// the grants already written are invalidated before the error is returned.
  pub async fn grant_many(&self, grants: Vec<Grant>) -> Result<(), AppError> {
    let mut touched = Vec::with_capacity(grants.len());
    let mut failure = None;
    for grant in &grants {
      if let Err(err) = self.store.upsert_grant(grant).await {
        failure = Some(err);
        break;
      }
      self.metrics.record_grant_mutation();
      if !touched.contains(&grant.resource) {
        touched.push(grant.resource);
      }
    }
    self
      .apply_invalidations(touched.iter().copied().map(Invalidation::Resource).collect())
      .await;
    for resource in touched {
      let _ = self
        .change_tx
        .send(PermissionChange::GrantChanged { resource });
    }
    match failure {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  pub async fn add_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError> {
    let added = self.store.add_group_member(group_id, uid).await?;
    self.metrics.record_grant_mutation();
    self.membership_changed(group_id, uid).await;
    Ok(added)
  }

  pub async fn remove_group_member(&self, group_id: i64, uid: i64) -> Result<bool, AppError> {
    let removed = self.store.remove_group_member(group_id, uid).await?;
    self.metrics.record_grant_mutation();
    self.membership_changed(group_id, uid).await;
    Ok(removed)
  }

  async fn membership_changed(&self, group_id: i64, uid: i64) {
    self
      .apply_invalidations(vec![Invalidation::Principal(uid)])
      .await;
    let _ = self
      .change_tx
      .send(PermissionChange::GroupMembershipChanged { group_id });
  }

  pub async fn set_admin(&self, uid: i64, is_admin: bool) -> Result<bool, AppError> {
    let changed = self.store.set_admin(uid, is_admin).await?;
    self.on_principal_changed(uid).await;
    Ok(changed)
  }

  pub async fn cache_stats(&self) -> Result<CacheStats, AppError> {
    self.cache.stats().await
  }

  /// Which rule of the resolution order fired for `uid` on `path`, computed from the store.
  pub async fn explain(&self, uid: i64, path: &str) -> Result<ExplainReport, AppError> {
    let resource = self.planner.plan_path(path).await?;
    let principal = self.load_principal(uid).await?;
    let cached = if self.is_cache_bypassed() {
      None
    } else {
      self
        .cache
        .get(&CacheKey::new(uid, resource.resource_ref()))
        .await
        .unwrap_or_default()
    };
    explain_resolution(self.store.as_ref(), &principal, resource, cached.as_ref()).await
  }

  pub async fn clear_cache(&self) -> Result<(), AppError> {
    let _gate = self.invalidation_gate.write().await;
    self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
    self.cache.clear().await?;
    self.cache_bypass.store(false, Ordering::SeqCst);
    self.metrics.record_cache_bypassed(false);
    Ok(())
  }

  pub async fn sweep_expired_cache(&self) -> Result<u64, AppError> {
    if self.is_cache_bypassed() {
      let _gate = self.invalidation_gate.write().await;
      self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
      self.clear_after_failure().await;
      return Ok(0);
    }
    self.cache.sweep_expired().await
  }

  /// Resolves and caches the resources `uid` or its groups hold grants on.
  pub async fn warm_cache_for_user(
    &self,
    uid: i64,
    limit: Option<usize>,
  ) -> Result<WarmStats, AppError> {
    let limit = limit.unwrap_or(self.setting.warm_cache_limit);
    let principal = self.load_principal(uid).await?;
    let targets = self
      .store
      .grant_targets(&principal.subjects(), limit)
      .await?;
    let mut stats = WarmStats::default();
    for chunk in targets.chunks(self.planner.max_bulk_batch().max(1)) {
      let resources = self.planner.plan_refs(chunk).await?;
      let resolved = self
        .resolve_resources(uid, &resources, OperationClass::Bulk)
        .await?;
      for resource in resolved.keys() {
        match resource.kind {
          ResourceKind::Folder => stats.folders_warmed += 1,
          ResourceKind::File => stats.files_warmed += 1,
        }
      }
    }
    info!(
      "[permission]: warmed {} folders and {} files for uid {}",
      stats.folders_warmed, stats.files_warmed, uid
    );
    Ok(stats)
  }

  /// Periodically removes expired entries. Stops once the engine is dropped.
  pub fn spawn_cache_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
    let engine = Arc::downgrade(self);
    let period = self.setting.cache_sweep_interval;
    tokio::spawn(async move {
      let mut interval = interval(period);
      // the first tick completes immediately
      interval.tick().await;
      loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
          break;
        };
        match engine.sweep_expired_cache().await {
          Ok(0) => {},
          Ok(removed) => debug!("[permission]: swept {} expired cache entries", removed),
          Err(err) => warn!("[permission]: cache sweep failed: {}", err),
        }
      }
    })
  }
}

fn degraded_access(path: &str, capability: Capability) -> bool {
  capability == Capability::Read && normalize_path(path) == ROOT_PATH
}
