use access_control::act::Capability;
use access_control::engine::PermissionChange;
use access_control::entity::{ResourceKind, Subject};
use access_control::explain::ExplainRule;
use access_control::resolver::{Decision, Provenance};
use access_control::store::GrantStore;

mod util;
use util::{grant, mkdir, setup_engine, touch, ADMIN_UID};

#[tokio::test]
async fn grant_on_deep_folder_does_not_open_ancestors_test() {
  let t = setup_engine().await;
  let uid = 10;
  let c = mkdir(t.store.as_ref(), "/A/B/C").await;
  grant(&t.engine, Subject::User(uid), &c, &[Capability::Read]).await;

  for path in ["/A", "/A/B"] {
    let decision = t.engine.resolve(uid, path, Capability::Read).await.unwrap();
    assert_eq!(decision, Decision::Denied, "{}", path);
  }
  let decision = t
    .engine
    .resolve(uid, "/A/B/C", Capability::Read)
    .await
    .unwrap();
  assert_eq!(decision, Decision::Granted(Provenance::Direct));
  assert!(!t
    .engine
    .can_access(uid, "/A/B/C", Capability::Write)
    .await
    .unwrap());
}

#[tokio::test]
async fn file_inherits_group_grant_of_its_folder_test() {
  let t = setup_engine().await;
  let (uid, group_id) = (10, 100);
  let a = mkdir(t.store.as_ref(), "/A").await;
  touch(t.store.as_ref(), "/A/doc.txt").await;
  t.engine.add_group_member(group_id, uid).await.unwrap();
  grant(&t.engine, Subject::Group(group_id), &a, &[Capability::Read]).await;

  let decision = t
    .engine
    .resolve(uid, "/A/doc.txt", Capability::Read)
    .await
    .unwrap();
  assert_eq!(decision, Decision::Granted(Provenance::InheritedFromParent));
  assert_eq!(
    t.engine.resolve(uid, "/A", Capability::Read).await.unwrap(),
    Decision::Granted(Provenance::ViaGroup)
  );

  let report = t.engine.explain(uid, "/A/doc.txt").await.unwrap();
  assert_eq!(report.fired(), vec![ExplainRule::InheritedFromParent]);
  assert_eq!(report.effective, Capability::Read.into());
  assert_eq!(report.cached, Some(Capability::Read.into()));
}

#[tokio::test]
async fn folders_do_not_inherit_test() {
  let t = setup_engine().await;
  let uid = 10;
  let a = mkdir(t.store.as_ref(), "/A").await;
  mkdir(t.store.as_ref(), "/A/B").await;
  touch(t.store.as_ref(), "/A/B/deep.txt").await;
  grant(&t.engine, Subject::User(uid), &a, &[Capability::Read, Capability::Write]).await;

  assert!(t.engine.can_access(uid, "/A", Capability::Write).await.unwrap());
  assert!(!t.engine.can_access(uid, "/A/B", Capability::Read).await.unwrap());
  // only the immediate folder of a file is consulted
  assert!(!t
    .engine
    .can_access(uid, "/A/B/deep.txt", Capability::Read)
    .await
    .unwrap());
}

#[tokio::test]
async fn root_default_read_test() {
  let t = setup_engine().await;
  let uid = 10;
  mkdir(t.store.as_ref(), "/A").await;
  touch(t.store.as_ref(), "/readme.txt").await;

  assert_eq!(
    t.engine.resolve(uid, "/", Capability::Read).await.unwrap(),
    Decision::Granted(Provenance::RootDefault)
  );
  assert_eq!(
    t.engine.resolve(uid, "", Capability::Read).await.unwrap(),
    Decision::Granted(Provenance::RootDefault)
  );
  assert_eq!(
    t.engine.resolve(uid, "/", Capability::Write).await.unwrap(),
    Decision::Denied
  );
  assert_eq!(
    t.engine
      .resolve(uid, "/readme.txt", Capability::Read)
      .await
      .unwrap(),
    Decision::Granted(Provenance::InheritedFromParent)
  );
  assert_eq!(
    t.engine.resolve(uid, "/A", Capability::Read).await.unwrap(),
    Decision::Denied
  );
}

#[tokio::test]
async fn admin_override_test() {
  let t = setup_engine().await;
  touch(t.store.as_ref(), "/A/B/secret.txt").await;
  for capability in Capability::ALL {
    assert_eq!(
      t.engine
        .resolve(ADMIN_UID, "/A/B/secret.txt", capability)
        .await
        .unwrap(),
      Decision::Granted(Provenance::AdminOverride)
    );
  }

  let uid = 10;
  assert!(!t.engine.can_access(uid, "/A", Capability::Delete).await.unwrap());
  t.engine.set_admin(uid, true).await.unwrap();
  assert!(t.engine.can_access(uid, "/A", Capability::Delete).await.unwrap());
  t.engine.set_admin(uid, false).await.unwrap();
  assert!(!t.engine.can_access(uid, "/A", Capability::Delete).await.unwrap());
}

#[tokio::test]
async fn direct_takes_precedence_over_group_test() {
  let t = setup_engine().await;
  let (uid, group_id) = (10, 100);
  let a = mkdir(t.store.as_ref(), "/A").await;
  t.engine.add_group_member(group_id, uid).await.unwrap();
  grant(&t.engine, Subject::Group(group_id), &a, &[Capability::Read, Capability::Share]).await;
  grant(&t.engine, Subject::User(uid), &a, &[Capability::Read]).await;

  assert_eq!(
    t.engine.resolve(uid, "/A", Capability::Read).await.unwrap(),
    Decision::Granted(Provenance::Direct)
  );
  assert_eq!(
    t.engine.resolve(uid, "/A", Capability::Share).await.unwrap(),
    Decision::Granted(Provenance::ViaGroup)
  );
}

#[tokio::test]
async fn owner_gets_no_implicit_access_test() {
  let t = setup_engine().await;
  let file = touch(t.store.as_ref(), "/A/owned.txt").await;
  assert_eq!(file.owner_uid, Some(ADMIN_UID));

  let owner = 10;
  let a = mkdir(t.store.as_ref(), "/A").await;
  let own = t
    .store
    .create_resource(ResourceKind::File, "/A/mine.txt", a.id, Some(owner))
    .await
    .unwrap();
  assert_eq!(own.owner_uid, Some(owner));
  assert!(!t
    .engine
    .can_access(owner, "/A/mine.txt", Capability::Read)
    .await
    .unwrap());
}

#[tokio::test]
async fn resolution_is_deterministic_test() {
  let t = setup_engine().await;
  let (uid, group_id) = (10, 100);
  let a = mkdir(t.store.as_ref(), "/A").await;
  touch(t.store.as_ref(), "/A/doc.txt").await;
  t.engine.add_group_member(group_id, uid).await.unwrap();
  grant(&t.engine, Subject::Group(group_id), &a, &[Capability::Write]).await;

  let computed = t.engine.effective_permission(uid, "/A/doc.txt").await.unwrap();
  let cached = t.engine.effective_permission(uid, "/A/doc.txt").await.unwrap();
  assert_eq!(computed, cached);
  t.engine.clear_cache().await.unwrap();
  let recomputed = t.engine.effective_permission(uid, "/A/doc.txt").await.unwrap();
  assert_eq!(computed, recomputed);
  assert_eq!(computed.inherited_from, Some(a.resource_ref()));
}

#[tokio::test]
async fn decision_follows_grant_and_revoke_test() {
  let t = setup_engine().await;
  let uid = 10;
  let a = mkdir(t.store.as_ref(), "/A").await;
  touch(t.store.as_ref(), "/A/doc.txt").await;
  let mut changes = t.engine.subscribe_change();

  // warm the cache with the denial
  assert!(!t.engine.can_access(uid, "/A", Capability::Read).await.unwrap());
  assert!(!t
    .engine
    .can_access(uid, "/A/doc.txt", Capability::Read)
    .await
    .unwrap());

  grant(&t.engine, Subject::User(uid), &a, &[Capability::Read]).await;
  assert_eq!(
    changes.recv().await.unwrap(),
    PermissionChange::GrantChanged {
      resource: a.resource_ref()
    }
  );
  assert!(t.engine.can_access(uid, "/A", Capability::Read).await.unwrap());
  assert!(t
    .engine
    .can_access(uid, "/A/doc.txt", Capability::Read)
    .await
    .unwrap());

  assert!(t
    .engine
    .revoke(Subject::User(uid), a.resource_ref())
    .await
    .unwrap());
  assert!(!t.engine.can_access(uid, "/A", Capability::Read).await.unwrap());
  assert!(!t
    .engine
    .can_access(uid, "/A/doc.txt", Capability::Read)
    .await
    .unwrap());
  assert!(!t
    .engine
    .revoke(Subject::User(uid), a.resource_ref())
    .await
    .unwrap());
}

#[tokio::test]
async fn unknown_path_is_invalid_resource_test() {
  let t = setup_engine().await;
  let err = t
    .engine
    .can_access(10, "/missing", Capability::Read)
    .await
    .unwrap_err();
  assert!(err.is_invalid_resource());
}

#[tokio::test]
async fn warm_cache_for_user_test() {
  let t = setup_engine().await;
  let (uid, group_id) = (10, 100);
  let a = mkdir(t.store.as_ref(), "/A").await;
  let b = mkdir(t.store.as_ref(), "/B").await;
  let doc = touch(t.store.as_ref(), "/B/doc.txt").await;
  t.engine.add_group_member(group_id, uid).await.unwrap();
  grant(&t.engine, Subject::User(uid), &a, &[Capability::Read]).await;
  grant(&t.engine, Subject::Group(group_id), &b, &[Capability::Write]).await;
  grant(&t.engine, Subject::User(uid), &doc, &[Capability::Delete]).await;
  t.engine.clear_cache().await.unwrap();

  let stats = t.engine.warm_cache_for_user(uid, None).await.unwrap();
  assert_eq!(stats.folders_warmed, 2);
  assert_eq!(stats.files_warmed, 1);
  assert_eq!(t.cache.len(), 3);

  t.store.reset_round_trips();
  assert!(t.engine.can_access(uid, "/B", Capability::Write).await.unwrap());
  // path lookup only, the decision comes from the cache
  assert_eq!(t.store.round_trips(), 1);
}
