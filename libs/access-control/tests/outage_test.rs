use access_control::act::Capability;
use access_control::entity::Subject;
use access_control::resolver::{Decision, Provenance};

mod util;
use util::{grant, mkdir, setup_engine, touch};

#[tokio::test]
async fn store_outage_denies_everything_but_root_read_test() {
  let t = setup_engine().await;
  let uid = 10;
  let a = mkdir(t.store.as_ref(), "/A").await;
  touch(t.store.as_ref(), "/A/doc.txt").await;
  grant(&t.engine, Subject::User(uid), &a, &[Capability::Read]).await;
  t.store.set_unavailable(true);

  assert_eq!(
    t.engine.resolve(uid, "/", Capability::Read).await.unwrap(),
    Decision::Granted(Provenance::RootDefault)
  );
  assert_eq!(
    t.engine.resolve(uid, "/", Capability::Write).await.unwrap(),
    Decision::Denied
  );
  assert_eq!(
    t.engine.resolve(uid, "/A", Capability::Read).await.unwrap(),
    Decision::Denied
  );

  let paths = vec!["/".to_string(), "/A".to_string(), "/A/doc.txt".to_string()];
  let bulk = t
    .engine
    .bulk_access(uid, &paths, Capability::Read)
    .await
    .unwrap();
  assert!(bulk["/"]);
  assert!(!bulk["/A"]);
  assert!(!bulk["/A/doc.txt"]);

  t.store.set_unavailable(false);
  assert!(t.engine.can_access(uid, "/A", Capability::Read).await.unwrap());
}

#[tokio::test]
async fn store_outage_fails_tree_and_listing_test() {
  let t = setup_engine().await;
  mkdir(t.store.as_ref(), "/A/B").await;
  t.store.set_unavailable(true);

  let err = t.engine.tree_access(10, "/A", 2).await.unwrap_err();
  assert!(err.is_store_unavailable());
  let err = t.engine.accessible_folders(10).await.unwrap_err();
  assert!(err.is_store_unavailable());
  let err = t.engine.accessible_roots(10).await.unwrap_err();
  assert!(err.is_store_unavailable());
  let err = t.engine.explain(10, "/A").await.unwrap_err();
  assert!(err.is_store_unavailable());
}

#[tokio::test]
async fn mutation_during_outage_fails_without_invalidating_test() {
  let t = setup_engine().await;
  let uid = 10;
  let a = mkdir(t.store.as_ref(), "/A").await;
  assert!(!t.engine.can_access(uid, "/A", Capability::Read).await.unwrap());
  assert_eq!(t.cache.len(), 1);

  t.store.set_unavailable(true);
  let err = t
    .engine
    .grant(Subject::User(uid), a.resource_ref(), Capability::Read.into())
    .await
    .unwrap_err();
  assert!(err.is_store_unavailable());
  assert_eq!(t.cache.len(), 1);
}
