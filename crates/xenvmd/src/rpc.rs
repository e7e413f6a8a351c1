//! The JSON-RPC front end.
//!
//! One POST endpoint decodes JSON-RPC 2.0 envelopes and dispatches onto
//! the VG store and host registry, each operation under its own lock
//! discipline; `GET /health` reports liveness. The same router serves the
//! TCP and Unix-domain listeners.

use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use xenvm_proto::extent;
use xenvm_proto::op::RedoOp;
use xenvm_proto::rpc::{
    CreateLvParams, HostParams, NameParams, RenameLvParams, ResizeLvParams, RpcError, RpcRequest,
    RpcResponse, SetStatusParams, TagParams,
};
use xenvm_proto::vg::{areas_to_segments, Vg};
use xenvm_proto::XvError;

use crate::daemon::SharedDaemon;
use crate::vgstore::new_lv_op;

pub fn router(daemon: SharedDaemon) -> Router {
    Router::new()
        .route("/", post(rpc_endpoint))
        .route("/health", get(health))
        .with_state(daemon)
}

async fn health() -> &'static str {
    "OK"
}

async fn rpc_endpoint(State(daemon): State<SharedDaemon>, body: String) -> Json<RpcResponse> {
    let req: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            return Json(RpcResponse::error(
                Value::Null,
                RpcError::new(RpcError::PARSE_ERROR, format!("parse error: {e}")),
            ));
        }
    };
    let id = req.id.clone();
    debug!("rpc: {}", req.method);
    match dispatch(&daemon, &req).await {
        Ok(result) => Json(RpcResponse::result(id, result)),
        Err(e) => Json(RpcResponse::error(id, e)),
    }
}

fn params<T: DeserializeOwned>(req: &RpcRequest) -> Result<T, RpcError> {
    serde_json::from_value(req.params.clone()).map_err(RpcError::invalid_params)
}

fn to_value<T: serde::Serialize>(v: T) -> Result<Value, RpcError> {
    serde_json::to_value(v).map_err(|e| RpcError::new(RpcError::INTERNAL, e.to_string()))
}

fn mib_to_extents(vg: &Vg, size_mib: u64) -> u64 {
    (size_mib << 20).div_ceil(vg.extent_size_bytes())
}

pub async fn dispatch(daemon: &SharedDaemon, req: &RpcRequest) -> Result<Value, RpcError> {
    match req.method.as_str() {
        "get" => {
            let vg = daemon.vg.read(|vg| vg.clone()).await;
            to_value(vg)
        }
        "get_lv" => {
            let p: NameParams = params(req)?;
            let vg = daemon
                .vg
                .read(|vg| vg.with_single_lv(&p.name))
                .await
                .ok_or_else(|| RpcError::from(XvError::NotFound(p.name.clone())))?;
            to_value(vg)
        }
        "create_lv" => {
            let p: CreateLvParams = params(req)?;
            let op = daemon
                .vg
                .write(|vg| new_lv_op(vg, &p.name, mib_to_extents(vg, p.size_mib)))
                .await?;
            daemon.vg.sync().await?;
            match op {
                RedoOp::LvCreate { lv } => to_value(lv),
                _ => Err(RpcError::new(RpcError::INTERNAL, "unexpected op")),
            }
        }
        "rename_lv" => {
            let p: RenameLvParams = params(req)?;
            daemon
                .vg
                .write(|vg| {
                    let id = vg
                        .lv_id_by_name(&p.name)
                        .ok_or_else(|| XvError::NotFound(p.name.clone()))?;
                    Ok(RedoOp::LvRename {
                        id,
                        new_name: p.new_name.clone(),
                    })
                })
                .await?;
            daemon.vg.sync().await?;
            Ok(Value::Null)
        }
        "remove_lv" => {
            let p: NameParams = params(req)?;
            daemon
                .vg
                .write(|vg| {
                    let id = vg
                        .lv_id_by_name(&p.name)
                        .ok_or_else(|| XvError::NotFound(p.name.clone()))?;
                    Ok(RedoOp::LvRemove { id })
                })
                .await?;
            daemon.vg.sync().await?;
            Ok(Value::Null)
        }
        "resize_lv" => {
            let p: ResizeLvParams = params(req)?;
            daemon
                .vg
                .write(|vg| {
                    let lv = vg
                        .lv_by_name(&p.name)
                        .ok_or_else(|| XvError::NotFound(p.name.clone()))?;
                    let want = mib_to_extents(vg, p.size_mib);
                    let current = lv.size_in_extents();
                    if want > current {
                        let areas = extent::find(&vg.free_space, want - current)?;
                        Ok(RedoOp::LvExpand {
                            id: lv.id.clone(),
                            segments: areas_to_segments(current, &areas),
                        })
                    } else {
                        Ok(RedoOp::LvReduce {
                            id: lv.id.clone(),
                            new_size: want,
                        })
                    }
                })
                .await?;
            daemon.vg.sync().await?;
            Ok(Value::Null)
        }
        "set_status" => {
            let p: SetStatusParams = params(req)?;
            daemon
                .vg
                .write(|vg| {
                    let id = vg
                        .lv_id_by_name(&p.name)
                        .ok_or_else(|| XvError::NotFound(p.name.clone()))?;
                    Ok(RedoOp::LvSetStatus {
                        id,
                        status: p.status.clone(),
                    })
                })
                .await?;
            Ok(Value::Null)
        }
        "add_tag" => {
            let p: TagParams = params(req)?;
            daemon
                .vg
                .write(|vg| {
                    let id = vg
                        .lv_id_by_name(&p.name)
                        .ok_or_else(|| XvError::NotFound(p.name.clone()))?;
                    Ok(RedoOp::LvAddTag {
                        id,
                        tag: p.tag.clone(),
                    })
                })
                .await?;
            Ok(Value::Null)
        }
        "remove_tag" => {
            let p: TagParams = params(req)?;
            daemon
                .vg
                .write(|vg| {
                    let id = vg
                        .lv_id_by_name(&p.name)
                        .ok_or_else(|| XvError::NotFound(p.name.clone()))?;
                    Ok(RedoOp::LvRemoveTag {
                        id,
                        tag: p.tag.clone(),
                    })
                })
                .await?;
            Ok(Value::Null)
        }
        "flush" => {
            // the daemon keeps no host→LV index: flushing one volume
            // means draining every host's queue
            let _p: NameParams = params(req)?;
            daemon.hosts.flush_all().await?;
            Ok(Value::Null)
        }
        "shutdown" => {
            let d = daemon.clone();
            tokio::spawn(async move {
                if let Err(e) = d.hosts.shutdown().await {
                    warn!("host shutdown failed: {e}");
                }
                d.journal.shutdown().await;
                d.shutdown.notify_waiters();
                tokio::time::sleep(Duration::from_secs(1)).await;
                info!("exiting on request");
                std::process::exit(0);
            });
            Ok(Value::Null)
        }
        "Host.create" => {
            let p: HostParams = params(req)?;
            daemon.hosts.create(&p.host).await?;
            Ok(Value::Null)
        }
        "Host.connect" => {
            let p: HostParams = params(req)?;
            daemon.hosts.connect(&p.host).await?;
            Ok(Value::Null)
        }
        "Host.disconnect" => {
            let p: HostParams = params(req)?;
            daemon.hosts.disconnect(&p.host).await?;
            Ok(Value::Null)
        }
        "Host.destroy" => {
            let p: HostParams = params(req)?;
            daemon.hosts.destroy(&p.host).await?;
            Ok(Value::Null)
        }
        "Host.all" => to_value(daemon.hosts.all().await?),
        other => Err(RpcError::method_not_found(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_daemon;
    use serde_json::json;
    use xenvm_proto::rpc::HostStatus;
    use xenvm_proto::vg::LvStatus;

    fn req(method: &str, params: Value) -> RpcRequest {
        RpcRequest::new(method, params, json!(1))
    }

    #[tokio::test]
    async fn test_lv_lifecycle_over_rpc() {
        let daemon = test_daemon().await;

        let lv = dispatch(&daemon, &req("create_lv", json!({"name": "data", "size_mib": 8})))
            .await
            .unwrap();
        assert_eq!(lv["name"], "data");

        // 8 MiB on a 1 MiB-extent VG
        let vg: Vg = serde_json::from_value(
            dispatch(&daemon, &req("get_lv", json!({"name": "data"})))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(vg.lvs.len(), 1);
        assert_eq!(vg.lv_by_name("data").unwrap().size_in_extents(), 8);

        dispatch(
            &daemon,
            &req("resize_lv", json!({"name": "data", "size_mib": 12})),
        )
        .await
        .unwrap();
        dispatch(
            &daemon,
            &req("rename_lv", json!({"name": "data", "new_name": "data2"})),
        )
        .await
        .unwrap();
        dispatch(
            &daemon,
            &req("add_tag", json!({"name": "data2", "tag": "prod"})),
        )
        .await
        .unwrap();
        dispatch(
            &daemon,
            &req("set_status", json!({"name": "data2", "status": ["read"]})),
        )
        .await
        .unwrap();

        let vg: Vg = serde_json::from_value(dispatch(&daemon, &req("get", json!({}))).await.unwrap())
            .unwrap();
        let lv = vg.lv_by_name("data2").unwrap();
        assert_eq!(lv.size_in_extents(), 12);
        assert_eq!(lv.tags, vec!["prod".to_string()]);
        assert_eq!(lv.status, vec![LvStatus::Read]);

        dispatch(&daemon, &req("remove_lv", json!({"name": "data2"})))
            .await
            .unwrap();
        let err = dispatch(&daemon, &req("get_lv", json!({"name": "data2"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_lv_twice_is_an_error() {
        let daemon = test_daemon().await;
        let p = json!({"name": "dup", "size_mib": 1});
        dispatch(&daemon, &req("create_lv", p.clone())).await.unwrap();
        let err = dispatch(&daemon, &req("create_lv", p)).await.unwrap_err();
        assert_eq!(err.code, RpcError::ALREADY_EXISTS);
    }

    #[tokio::test]
    async fn test_host_methods_and_error_codes() {
        let daemon = test_daemon().await;

        let err = dispatch(&daemon, &req("Host.connect", json!({"host": "h1"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::HOST_NOT_CREATED);

        dispatch(&daemon, &req("Host.create", json!({"host": "h1"})))
            .await
            .unwrap();
        dispatch(&daemon, &req("Host.connect", json!({"host": "h1"})))
            .await
            .unwrap();
        let all: Vec<HostStatus> = serde_json::from_value(
            dispatch(&daemon, &req("Host.all", json!({}))).await.unwrap(),
        )
        .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "h1");

        dispatch(&daemon, &req("Host.destroy", json!({"host": "h1"})))
            .await
            .unwrap();
        let all: Vec<HostStatus> = serde_json::from_value(
            dispatch(&daemon, &req("Host.all", json!({}))).await.unwrap(),
        )
        .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_params() {
        let daemon = test_daemon().await;
        let err = dispatch(&daemon, &req("no_such_method", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::METHOD_NOT_FOUND);

        let err = dispatch(&daemon, &req("create_lv", json!({"wrong": true})))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_flush_is_flush_all() {
        let daemon = test_daemon().await;
        dispatch(&daemon, &req("Host.create", json!({"host": "h1"})))
            .await
            .unwrap();
        dispatch(&daemon, &req("Host.connect", json!({"host": "h1"})))
            .await
            .unwrap();
        // flushing a volume the daemon has never heard of still succeeds:
        // it drains every host queue
        dispatch(&daemon, &req("flush", json!({"name": "whatever"})))
            .await
            .unwrap();
    }
}
