//! End-to-end behaviour of the store through the `Repository` facade.

use ebs_store::{
    HeadUpdate, NewPatch, Op, PatchKey, Reconstructor, Repository, StoreConfig, StoreError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn open_repo() -> (tempfile::TempDir, Repository) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    (dir, repo)
}

fn task_ops(i: usize) -> Vec<Op> {
    vec![Op::add(
        "/data/tasks/-",
        json!({"title": format!("task {i}"), "done": i % 3 == 0}),
    )]
}

#[test]
fn test_new_owner_document() {
    let (_dir, repo) = open_repo();
    let owner = repo.patches.create_owner("").unwrap();
    let (etag, body) = repo.owner_data(owner.id).unwrap();
    assert_eq!(owner.id, 1);
    assert_eq!(etag, 1);
    assert_eq!(body, json!({"data": null}));
}

#[test]
fn test_root_invariant_holds_for_every_owner() {
    let (_dir, repo) = open_repo();
    for i in 0..5 {
        let owner = repo.patches.create_owner(&format!("user{i}")).unwrap();
        repo.patches
            .create_patch(owner.id, owner.head, vec![Op::replace("/data", json!(i))], None)
            .unwrap();
        let root = repo.patches.root_of(owner.id).unwrap();
        assert_eq!(root.id, root.parent_id);
        assert!(root.snapshot.is_some());
    }
}

#[test]
fn test_reconstruction_is_snapshot_placement_invariant() {
    let (_dir, repo) = open_repo();
    let owner = repo.patches.create_owner("u").unwrap();
    let mut ids = vec![repo
        .patches
        .create_patch(owner.id, owner.head, vec![Op::replace("/data", json!({"tasks": []}))], None)
        .unwrap()
        .id];
    for i in 0..30 {
        let parent = *ids.last().unwrap();
        ids.push(repo.patches.create_patch(owner.id, parent, task_ops(i), None).unwrap().id);
    }

    let baseline: Vec<Value> = ids
        .iter()
        .map(|id| repo.reconstructor.get_data(*id).unwrap())
        .collect();

    let eager = Reconstructor::with_threshold(repo.store().clone(), Duration::ZERO);
    for id in ids.iter().step_by(7) {
        assert!(eager.reconstruct(*id).unwrap().document.is_object());
    }

    for (id, expected) in ids.iter().zip(&baseline) {
        assert_eq!(&repo.reconstructor.get_data(*id).unwrap(), expected);
    }
    let tasks = baseline.last().unwrap()["data"]["tasks"].as_array().unwrap().len();
    assert_eq!(tasks, 30);
}

#[test]
fn test_snapshot_write_back_preserves_value() {
    let (_dir, repo) = open_repo();
    let owner = repo.patches.create_owner("u").unwrap();
    let first = repo
        .patches
        .create_patch(owner.id, owner.head, vec![Op::replace("/data", json!({"tasks": []}))], None)
        .unwrap();
    let second = repo.patches.create_patch(owner.id, first.id, task_ops(1), None).unwrap();

    let before = repo.reconstructor.get_data(second.id).unwrap();
    let eager = Reconstructor::with_threshold(repo.store().clone(), Duration::ZERO);
    assert!(eager.reconstruct(second.id).unwrap().snapshot_written);
    assert!(repo.patches.get_patch(second.id).unwrap().snapshot.is_some());
    assert_eq!(repo.reconstructor.get_data(second.id).unwrap(), before);
}

#[test]
fn test_concurrent_head_updates_across_threads() {
    let (_dir, repo) = open_repo();
    let owner = repo.patches.create_owner("u").unwrap();
    let candidates: Vec<u64> = (0..16)
        .map(|i| {
            repo.patches
                .create_patch(owner.id, owner.head, vec![Op::replace("/data", json!(i))], None)
                .unwrap()
                .id
        })
        .collect();

    let repo = Arc::new(repo);
    let (owner_id, expected) = (owner.id, owner.head);
    let handles: Vec<_> = candidates
        .iter()
        .map(|&candidate| {
            let repo = repo.clone();
            std::thread::spawn(move || {
                repo.heads
                    .update_head(owner_id, candidate, Some(expected))
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<HeadUpdate> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let updated = outcomes.iter().filter(|o| o.is_updated()).count();
    assert_eq!(updated, 1);

    let head = repo.heads.get_head(owner.id).unwrap().patch_id;
    assert!(candidates.contains(&head));
    for outcome in &outcomes {
        if let HeadUpdate::Refused { current, .. } = outcome {
            assert_eq!(*current, head);
        }
    }
}

#[test]
fn test_sync_scenario() {
    let (_dir, repo) = open_repo();
    let owner = repo.patches.create_owner("test_user1").unwrap();

    // Two devices get ids 1 and 2 in creation order.
    let c1 = repo.queue.create_client(owner.id, "phone").unwrap();
    let c2 = repo.queue.create_client(owner.id, "laptop").unwrap();
    assert_eq!((c1, c2), (1, 2));

    // The first poll returns only the root.
    let pending = repo.queue.get_pending(owner.id, c1, 100).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, PatchKey::ROOT);
    assert_eq!(pending[0].parent_key, PatchKey::ROOT);
    assert_eq!(
        serde_json::to_string(&pending[0].ops).unwrap(),
        r#"[{"op":"replace","path":"","value":{"data":null}}]"#
    );

    // Acknowledging empties the queue, and acknowledging twice is harmless.
    repo.queue.delete_pending(owner.id, c1, &[pending[0].key]).unwrap();
    assert!(repo.queue.get_pending(owner.id, c1, 100).unwrap().is_empty());
    assert_eq!(repo.queue.delete_pending(owner.id, c1, &[pending[0].key]).unwrap(), 0);

    // The head starts at the system root.
    let head = repo.heads.get_head(owner.id).unwrap();
    assert_eq!(head.key, PatchKey::ROOT);
    assert_eq!(head.name, "System");

    let key = PatchKey::new(c1, 42, 1);
    repo.queue
        .create_patches(
            owner.id,
            &[NewPatch {
                key,
                parent_key: PatchKey::ROOT,
                ops: vec![Op::replace("/data", json!({"tasks": ["buy milk"]}))],
            }],
        )
        .unwrap();

    // Wrong previous key: refused, head unchanged.
    let refused = repo
        .heads
        .update_head_if_not_modified(owner.id, key, PatchKey::new(2, 2, 2))
        .unwrap();
    assert!(!refused.is_updated());
    assert_eq!(repo.heads.get_head(owner.id).unwrap().key, PatchKey::ROOT);

    // Correct previous key: accepted.
    let accepted = repo
        .heads
        .update_head_if_not_modified(owner.id, key, PatchKey::ROOT)
        .unwrap();
    assert!(accepted.is_updated());
    let head = repo.heads.get_head(owner.id).unwrap();
    assert_eq!(head.key, key);
    assert_eq!(head.name, "phone");

    // The other device sees the upload; the author does not.
    let for_c2 = repo.queue.get_pending(owner.id, c2, 100).unwrap();
    assert_eq!(for_c2.iter().map(|p| p.key).collect::<Vec<_>>(), vec![PatchKey::ROOT, key]);
    assert!(repo.queue.get_pending(owner.id, c1, 100).unwrap().is_empty());

    let (_, doc) = repo.owner_data(owner.id).unwrap();
    assert_eq!(doc, json!({"data": {"tasks": ["buy milk"]}}));
}

#[test]
fn test_unknown_new_key_is_invalid_patch() {
    let (_dir, repo) = open_repo();
    let owner = repo.patches.create_owner("u").unwrap();
    let err = repo
        .heads
        .update_head_if_not_modified(owner.id, PatchKey::new(1, 1, 1), PatchKey::ROOT)
        .unwrap_err();
    assert_eq!(err.kind(), ebs_store::ErrorKind::InvalidPatch);
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("db"));
    let (owner_id, head) = {
        let repo = Repository::open(config.clone()).unwrap();
        let owner = repo.patches.create_owner("u").unwrap();
        let patch = repo
            .patches
            .create_patch(owner.id, owner.head, vec![Op::replace("/data", json!("kept"))], None)
            .unwrap();
        repo.heads.update_head(owner.id, patch.id, Some(owner.head)).unwrap();
        repo.queue.create_client(owner.id, "phone").unwrap();
        (owner.id, patch.id)
    };

    let repo = Repository::open(config).unwrap();
    assert_eq!(repo.owner_data(owner_id).unwrap(), (head, json!({"data": "kept"})));
    assert_eq!(repo.queue.create_client(owner_id, "tablet").unwrap(), 2);
    assert!(matches!(
        repo.patches.get_owner(owner_id + 1),
        Err(StoreError::OwnerNotFound(_))
    ));
}
