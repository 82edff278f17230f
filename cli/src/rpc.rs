// Local RPC for operators
//
// `ptt start` serves POST /rpc on 127.0.0.1. A request names a method and
// carries its params; the reply holds either a result or an error string.
// The other subcommands reach the running node through `call`.

use crate::node::Node;
use anyhow::{Context, Result};
use hyper::{Body, Method, Request};
use ptt_core::entity::JoinType;
use ptt_core::ptt::Invitation;
use ptt_core::transport::node_id_to_peer_id;
use ptt_core::PttID;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use warp::Filter;

const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub user_id: Option<String>,
    pub peer_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntitySummary {
    pub id: String,
    pub name: String,
    pub service: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct InviteParams {
    name: Option<String>,
    entity_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    invitation: String,
    addr: Option<String>,
}

/// Lifecycle requests handed to the loop that owns the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Shutdown,
    Restart,
}

pub struct RpcContext {
    pub node: RwLock<Option<Arc<Node>>>,
    pub control: mpsc::Sender<Control>,
}

pub fn git_commit() -> &'static str {
    option_env!("PTT_GIT_COMMIT").unwrap_or("unknown")
}

// ============================================================================
// SERVER
// ============================================================================

pub fn serve(port: u16, ctx: Arc<RpcContext>) -> tokio::task::JoinHandle<()> {
    let ctx_filter = warp::any().map(move || ctx.clone());

    let route = warp::path!("rpc" / ..)
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_REQUEST_BYTES))
        .and(warp::body::json())
        .and(ctx_filter)
        .and_then(handle_rpc);

    info!(port, "rpc listening on 127.0.0.1");
    tokio::spawn(async move {
        warp::serve(route).run(([127, 0, 0, 1], port)).await;
    })
}

async fn handle_rpc(req: RpcRequest, ctx: Arc<RpcContext>) -> Result<impl warp::Reply, Infallible> {
    let method = req.method.clone();
    let response = match dispatch(&ctx, req).await {
        Ok(result) => RpcResponse {
            result: Some(result),
            error: None,
        },
        Err(e) => {
            warn!(%method, "rpc failed: {:#}", e);
            RpcResponse {
                result: None,
                error: Some(format!("{:#}", e)),
            }
        }
    };
    Ok(warp::reply::json(&response))
}

async fn dispatch(ctx: &RpcContext, req: RpcRequest) -> Result<Value> {
    match req.method.as_str() {
        "get_version" => return Ok(json!(env!("CARGO_PKG_VERSION"))),
        "get_git_commit" => return Ok(json!(git_commit())),
        "shutdown" => {
            ctx.control.send(Control::Shutdown).await.context("Node loop gone")?;
            return Ok(json!(true));
        }
        "restart" => {
            ctx.control.send(Control::Restart).await.context("Node loop gone")?;
            return Ok(json!(true));
        }
        _ => {}
    }

    let node = ctx.node.read().await.clone().context("Node not running")?;
    match req.method.as_str() {
        "count_peers" => Ok(json!(node.ptt.count_peers())),
        "get_peers" => {
            let peers: Vec<PeerInfo> = node
                .ptt
                .peers()
                .into_iter()
                .map(|p| PeerInfo {
                    node_id: p.node_id.to_string(),
                    user_id: p.user_id.map(|id| id.to_string()),
                    peer_type: format!("{:?}", p.peer_type),
                })
                .collect();
            Ok(serde_json::to_value(peers)?)
        }
        "list_entities" => {
            let entities: Vec<EntitySummary> = node
                .ptt
                .entities()
                .iter()
                .map(|pm| {
                    let info = pm.entity();
                    EntitySummary {
                        id: info.id.to_string(),
                        name: info.name,
                        service: info.service,
                        status: format!("{:?}", info.status),
                    }
                })
                .collect();
            Ok(serde_json::to_value(entities)?)
        }
        "invite" => {
            let params: InviteParams = serde_json::from_value(req.params).context("Invalid params")?;
            let pm = match (params.entity_id, params.name) {
                (Some(id), _) => {
                    let id: PttID = id.parse().context("Invalid entity id")?;
                    node.ptt.entity(&id).context("No such entity")?
                }
                (None, Some(name)) => node.board.create_entity(&name, false).await?,
                (None, None) => anyhow::bail!("Give an entity id or a name"),
            };
            let invitation = pm.invitation(JoinType::Entity)?;
            let peer_id = node_id_to_peer_id(&node.ptt.node_id())?;
            Ok(json!({
                "entity_id": pm.entity_id().to_string(),
                "invitation": invitation.encode()?,
                "peer_id": peer_id.to_string(),
            }))
        }
        "join" => {
            let params: JoinParams = serde_json::from_value(req.params).context("Invalid params")?;
            let invitation = Invitation::decode(&params.invitation).context("Invalid invitation")?;
            if let Some(addr) = &params.addr {
                let (addr_node, addr) = crate::node::parse_peer_addr(addr)?;
                if addr_node != invitation.node {
                    anyhow::bail!("Address belongs to another node");
                }
                node.swarm.add_address(addr_node, addr).await?;
            }
            let entity_id = invitation.entity_id;
            node.ptt.join(invitation).await?;
            Ok(json!({ "entity_id": entity_id.to_string() }))
        }
        other => anyhow::bail!("Unknown method: {}", other),
    }
}

// ============================================================================
// CLIENT
// ============================================================================

pub async fn call(port: u16, method: &str, params: Value) -> Result<Value> {
    let client = hyper::Client::new();
    let body = serde_json::to_string(&RpcRequest {
        method: method.to_string(),
        params,
    })?;
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://127.0.0.1:{}/rpc", port))
        .header("content-type", "application/json")
        .body(Body::from(body))?;

    let resp = client
        .request(req)
        .await
        .context("Node not reachable, is `ptt start` running?")?;
    let status = resp.status();
    let body_bytes = hyper::body::to_bytes(resp.into_body()).await?;
    if !status.is_success() {
        anyhow::bail!("RPC failed with status {}: {}", status, String::from_utf8_lossy(&body_bytes));
    }

    let response: RpcResponse = serde_json::from_slice(&body_bytes).context("Failed to parse RPC response")?;
    match response.error {
        Some(error) => anyhow::bail!("{}", error),
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (RpcContext, mpsc::Receiver<Control>) {
        let (control, control_rx) = mpsc::channel(4);
        let ctx = RpcContext {
            node: RwLock::new(None),
            control,
        };
        (ctx, control_rx)
    }

    fn request(method: &str) -> RpcRequest {
        RpcRequest {
            method: method.to_string(),
            params: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_version_without_node() {
        let (ctx, _rx) = context();
        let version = dispatch(&ctx, request("get_version")).await.unwrap();
        assert_eq!(version, json!(env!("CARGO_PKG_VERSION")));
        let commit = dispatch(&ctx, request("get_git_commit")).await.unwrap();
        assert_eq!(commit, json!(git_commit()));
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_control_loop() {
        let (ctx, mut rx) = context();
        dispatch(&ctx, request("restart")).await.unwrap();
        dispatch(&ctx, request("shutdown")).await.unwrap();
        assert_eq!(rx.recv().await, Some(Control::Restart));
        assert_eq!(rx.recv().await, Some(Control::Shutdown));
    }

    #[tokio::test]
    async fn test_node_methods_need_running_node() {
        let (ctx, _rx) = context();
        assert!(dispatch(&ctx, request("count_peers")).await.is_err());
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let response = RpcResponse {
            result: Some(json!(3)),
            error: None,
        };
        assert_eq!(serde_json::to_string(&response).unwrap(), r#"{"result":3}"#);
    }
}
