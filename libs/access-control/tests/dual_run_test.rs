use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use access_control::act::Capability;
use access_control::config::{AccessControlSetting, DualRunSetting};
use access_control::entity::{Principal, Resource, ResourceRef, Subject};
use access_control::resolver::EffectivePermission;
use access_control::store::GrantStore;
use access_control::strategy::{NaiveResolver, PermissionResolver};
use app_error::AppError;
use async_trait::async_trait;

mod util;
use util::{grant, mkdir, setup_engine, setup_engine_with, touch, wait_until};

fn dual_run_setting() -> AccessControlSetting {
  AccessControlSetting {
    dual_run: DualRunSetting {
      enabled: true,
      sample_rate: 1.0,
      max_inflight: 4,
    },
    ..Default::default()
  }
}

/// Denies everything, so every granted result diverges from it.
struct DenyAllResolver;

#[async_trait]
impl PermissionResolver for DenyAllResolver {
  fn name(&self) -> &'static str {
    "deny-all"
  }

  async fn resolve_many(
    &self,
    _store: &dyn GrantStore,
    _principal: &Principal,
    resources: &[Resource],
  ) -> Result<HashMap<ResourceRef, EffectivePermission>, AppError> {
    Ok(
      resources
        .iter()
        .map(|r| (r.resource_ref(), EffectivePermission::denied()))
        .collect(),
    )
  }
}

#[tokio::test]
async fn batch_and_naive_resolvers_agree_test() {
  let t = setup_engine_with(dual_run_setting()).await;
  let (uid, group_id) = (10, 100);
  let a = mkdir(t.store.as_ref(), "/A").await;
  let c = mkdir(t.store.as_ref(), "/A/B/C").await;
  touch(t.store.as_ref(), "/A/doc.txt").await;
  touch(t.store.as_ref(), "/A/B/C/deep.txt").await;
  touch(t.store.as_ref(), "/top.txt").await;
  t.engine.add_group_member(group_id, uid).await.unwrap();
  grant(&t.engine, Subject::Group(group_id), &a, &[Capability::Read]).await;
  grant(&t.engine, Subject::User(uid), &c, &[Capability::Write]).await;

  let tree = t.engine.tree_access(uid, "/", 3).await.unwrap();
  assert_eq!(tree.total_candidates, 6);
  assert_eq!(tree.unresolved_below, vec!["/A/B/C".to_string()]);

  let verifier = t.engine.dual_run().unwrap();
  assert!(wait_until(Duration::from_secs(5), || verifier.checked() >= 1).await);
  assert_eq!(verifier.mismatches(), 0);
  assert_eq!(t.metrics.dual_run_mismatch_count(), 0);
}

#[tokio::test]
async fn divergent_reference_is_reported_test() {
  let t = setup_engine_with(dual_run_setting()).await;
  let uid = 10;
  let a = mkdir(t.store.as_ref(), "/A").await;
  mkdir(t.store.as_ref(), "/B").await;
  grant(&t.engine, Subject::User(uid), &a, &[Capability::Read]).await;

  let engine = Arc::try_unwrap(t.engine)
    .ok()
    .unwrap()
    .with_reference_resolver(Arc::new(DenyAllResolver));
  let result = engine
    .bulk_access(
      uid,
      &["/A".to_string(), "/B".to_string()],
      Capability::Read,
    )
    .await
    .unwrap();
  // the served answer comes from the batch resolver
  assert!(result["/A"]);
  assert!(!result["/B"]);

  let verifier = engine.dual_run().unwrap();
  assert!(wait_until(Duration::from_secs(5), || verifier.checked() >= 1).await);
  assert_eq!(verifier.mismatches(), 1);
  assert_eq!(t.metrics.dual_run_mismatch_count(), 1);
}

#[tokio::test]
async fn single_lookups_are_not_sampled_test() {
  let t = setup_engine_with(dual_run_setting()).await;
  mkdir(t.store.as_ref(), "/A").await;
  t.engine.can_access(10, "/A", Capability::Read).await.unwrap();
  tokio::time::sleep(Duration::from_millis(20)).await;
  assert_eq!(t.engine.dual_run().unwrap().checked(), 0);
}

#[tokio::test]
async fn dual_run_is_off_by_default_test() {
  let t = setup_engine().await;
  assert!(t.engine.dual_run().is_none());
  assert_eq!(t.engine.resolver_name(), "batch");
  assert_eq!(NaiveResolver.name(), "naive");
}
