//! Request dispatch onto the repository.
//!
//! Store calls block on RocksDB, so each request runs on the blocking pool.
//! Store errors become `Response::Error` with the status of their kind; a
//! refused head update is a normal `PreconditionFailed` answer.

use ebs_store::{json_patch, HeadUpdate, NewPatch, Op, Patch, Repository, StoreError};
use thiserror::Error;

use crate::protocol::{Request, Response, WireNewPatch, WirePatch};

/// Why a request could not be served.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("Malformed patch body: {0}")]
    BadPatch(String),
    #[error("Request handler failed: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::Store(e) => e.kind().status(),
            ServiceError::BadPatch(_) => 400,
            ServiceError::Internal(_) => 500,
        }
    }
}

/// Async front of a [`Repository`].
#[derive(Clone)]
pub struct Service {
    repo: Repository,
}

impl Service {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Serve one request. Never fails: errors are folded into the response.
    pub async fn handle(&self, request: Request) -> Response {
        let repo = self.repo.clone();
        let name = request.name();
        let result = tokio::task::spawn_blocking(move || execute(&repo, request))
            .await
            .unwrap_or_else(|e| Err(ServiceError::Internal(e.to_string())));

        match result {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status >= 500 {
                    log::error!("{name} failed: {e}");
                } else {
                    log::debug!("{name} rejected ({status}): {e}");
                }
                Response::Error {
                    status,
                    message: e.to_string(),
                }
            }
        }
    }
}

/// Synchronous dispatch of one request.
pub fn execute(repo: &Repository, request: Request) -> Result<Response, ServiceError> {
    let response = match request {
        Request::Health => Response::Health {
            status: "ok".to_string(),
        },

        Request::CreateOwner { name } => {
            let owner = repo.patches.create_owner(&name)?;
            Response::Owner {
                owner_id: owner.id,
                head: owner.head,
                path: format!("/users/{}", owner.id),
            }
        }
        Request::CreatePatch {
            owner_id,
            parent_id,
            patch,
        } => {
            let ops = parse_body(&patch)?;
            let created = repo.patches.create_patch(owner_id, parent_id, ops, None)?;
            Response::PatchCreated {
                etag: created.id,
                path: format!("/data/{}", created.id),
            }
        }
        Request::GetData { patch_id } => {
            let document = repo.reconstructor.get_data(patch_id)?;
            data_response(patch_id, &document)?
        }
        Request::GetOwnerData { owner_id } => {
            let (head, document) = repo.owner_data(owner_id)?;
            data_response(head, &document)?
        }
        Request::GetHeadId { owner_id } => {
            let head = repo.heads.get_head(owner_id)?;
            Response::HeadId {
                value: head.patch_id,
                updated_at: head.updated_at,
            }
        }
        Request::PutHeadId {
            owner_id,
            value,
            if_match,
        } => head_id_response(repo.heads.update_head(owner_id, value, if_match)?),

        Request::CreateClient { owner_id, name } => Response::ClientCreated {
            client_id: repo.queue.create_client(owner_id, &name)?,
        },
        Request::GetPendingPatches {
            owner_id,
            client_id,
            size,
        } => {
            let size = usize::try_from(size).unwrap_or(usize::MAX);
            let patches = repo
                .queue
                .get_pending(owner_id, client_id, size)?
                .into_iter()
                .map(wire_patch)
                .collect::<Result<_, _>>()?;
            Response::Patches { patches }
        }
        Request::DeletePendingPatches {
            owner_id,
            client_id,
            keys,
        } => Response::Deleted {
            removed: repo.queue.delete_pending(owner_id, client_id, &keys)? as u64,
        },
        Request::CreatePatches { owner_id, patches } => {
            let batch = patches
                .into_iter()
                .map(new_patch)
                .collect::<Result<Vec<_>, _>>()?;
            Response::PatchesCreated {
                ids: repo.queue.create_patches(owner_id, &batch)?,
            }
        }
        Request::GetHead { owner_id } => {
            let head = repo.heads.get_head(owner_id)?;
            Response::Head {
                key: head.key,
                patch: head.patch_id,
                created_at: head.created_at,
                name: head.name,
            }
        }
        Request::UpdateHead { owner_id, key } => {
            let patch_id = repo
                .patches
                .find_by_key(owner_id, &key)?
                .ok_or(StoreError::InvalidPatchKey { owner_id, key })?;
            Response::HeadUpdated {
                updated: repo.heads.update_head(owner_id, patch_id, None)?.is_updated(),
            }
        }
        Request::UpdateHeadIfNotModified {
            owner_id,
            key,
            prev_key,
        } => Response::HeadUpdated {
            updated: repo
                .heads
                .update_head_if_not_modified(owner_id, key, prev_key)?
                .is_updated(),
        },
    };
    Ok(response)
}

fn parse_body(body: &str) -> Result<Vec<Op>, ServiceError> {
    json_patch::parse_ops(body).map_err(|e| ServiceError::BadPatch(e.to_string()))
}

fn data_response(etag: u64, document: &serde_json::Value) -> Result<Response, ServiceError> {
    let body = serde_json::to_string(document).map_err(|e| ServiceError::Internal(e.to_string()))?;
    Ok(Response::Data {
        body,
        etag,
        path: format!("/data/{etag}"),
    })
}

fn head_id_response(outcome: HeadUpdate) -> Response {
    match outcome {
        HeadUpdate::Updated {
            patch_id,
            updated_at,
        } => Response::HeadId {
            value: patch_id,
            updated_at,
        },
        HeadUpdate::Refused {
            current,
            updated_at,
            ..
        } => Response::PreconditionFailed {
            current,
            updated_at,
        },
    }
}

fn wire_patch(patch: Patch) -> Result<WirePatch, ServiceError> {
    let body = serde_json::to_string(&patch.ops).map_err(|e| ServiceError::Internal(e.to_string()))?;
    Ok(WirePatch {
        id: patch.id,
        key: patch.key,
        parent_key: patch.parent_key,
        patch: body,
        created_at: patch.created_at,
    })
}

fn new_patch(wire: WireNewPatch) -> Result<NewPatch, ServiceError> {
    Ok(NewPatch {
        key: wire.key,
        parent_key: wire.parent_key,
        ops: parse_body(&wire.patch)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebs_store::{PatchKey, StoreConfig};

    fn open_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, repo)
    }

    fn create_owner(repo: &Repository) -> u64 {
        match execute(repo, Request::CreateOwner { name: "u".into() }).unwrap() {
            Response::Owner { owner_id, path, .. } => {
                assert_eq!(path, format!("/users/{owner_id}"));
                owner_id
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_new_owner_data() {
        let (_dir, repo) = open_repo();
        let owner_id = create_owner(&repo);
        let response = execute(&repo, Request::GetOwnerData { owner_id }).unwrap();
        assert_eq!(
            response,
            Response::Data {
                body: r#"{"data":null}"#.into(),
                etag: 1,
                path: "/data/1".into(),
            }
        );
    }

    #[test]
    fn test_malformed_patch_is_bad_request() {
        let (_dir, repo) = open_repo();
        let owner_id = create_owner(&repo);
        let err = execute(
            &repo,
            Request::CreatePatch {
                owner_id,
                parent_id: 1,
                patch: "{not json".into(),
            },
        )
        .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_error_statuses() {
        let (_dir, repo) = open_repo();
        let owner_id = create_owner(&repo);

        let missing = execute(&repo, Request::GetData { patch_id: 999 }).unwrap_err();
        assert_eq!(missing.status(), 404);

        let bad_parent = execute(
            &repo,
            Request::CreatePatch {
                owner_id,
                parent_id: 999,
                patch: "[]".into(),
            },
        )
        .unwrap_err();
        assert_eq!(bad_parent.status(), 400);

        let bad_target = execute(
            &repo,
            Request::PutHeadId {
                owner_id,
                value: 999,
                if_match: None,
            },
        )
        .unwrap_err();
        assert_eq!(bad_target.status(), 400);
    }

    #[test]
    fn test_put_head_id_refusal_is_412() {
        let (_dir, repo) = open_repo();
        let owner_id = create_owner(&repo);
        let etag = match execute(
            &repo,
            Request::CreatePatch {
                owner_id,
                parent_id: 1,
                patch: r#"[{"op":"replace","path":"/data","value":1}]"#.into(),
            },
        )
        .unwrap()
        {
            Response::PatchCreated { etag, path } => {
                assert_eq!(path, format!("/data/{etag}"));
                etag
            }
            other => panic!("unexpected {other:?}"),
        };

        // Stale precondition with an unknown target is still 412.
        let stale = execute(
            &repo,
            Request::PutHeadId {
                owner_id,
                value: 999,
                if_match: Some(42),
            },
        )
        .unwrap();
        assert!(matches!(stale, Response::PreconditionFailed { current: 1, .. }));

        let refused = execute(
            &repo,
            Request::PutHeadId {
                owner_id,
                value: etag,
                if_match: Some(etag),
            },
        )
        .unwrap();
        assert_eq!(refused.status(), 412);
        assert!(matches!(refused, Response::PreconditionFailed { current: 1, .. }));

        let accepted = execute(
            &repo,
            Request::PutHeadId {
                owner_id,
                value: etag,
                if_match: Some(1),
            },
        )
        .unwrap();
        assert!(matches!(accepted, Response::HeadId { value, .. } if value == etag));
    }

    #[test]
    fn test_unconditional_key_update() {
        let (_dir, repo) = open_repo();
        let owner_id = create_owner(&repo);
        let client_id = match execute(
            &repo,
            Request::CreateClient {
                owner_id,
                name: "phone".into(),
            },
        )
        .unwrap()
        {
            Response::ClientCreated { client_id } => client_id,
            other => panic!("unexpected {other:?}"),
        };
        let key = PatchKey::new(client_id, 1, 1);
        execute(
            &repo,
            Request::CreatePatches {
                owner_id,
                patches: vec![WireNewPatch {
                    key,
                    parent_key: PatchKey::ROOT,
                    patch: r#"[{"op":"replace","path":"/data","value":"x"}]"#.into(),
                }],
            },
        )
        .unwrap();

        let response = execute(&repo, Request::UpdateHead { owner_id, key }).unwrap();
        assert_eq!(response, Response::HeadUpdated { updated: true });

        let unknown = execute(
            &repo,
            Request::UpdateHead {
                owner_id,
                key: PatchKey::new(9, 9, 9),
            },
        )
        .unwrap_err();
        assert_eq!(unknown.status(), 400);
    }

    #[tokio::test]
    async fn test_handle_folds_errors() {
        let (_dir, repo) = open_repo();
        let service = Service::new(repo);
        let response = service.handle(Request::GetOwnerData { owner_id: 42 }).await;
        assert!(matches!(response, Response::Error { status: 404, .. }));
    }
}
