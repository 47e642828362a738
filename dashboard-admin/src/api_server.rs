use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use dashboard_admin_apis::GroupsConfig;
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::{
    cluster::ClusterApi,
    dashboard_config::ConfigSource,
    errors::DashboardError,
    groups::{describe_groups, get_all_groups, update_groups_cr},
    settings::{SettingsUpdate, read_settings, update_settings},
    utils::metric_name,
};

const API_SERVER: &'static str = "api_server";

/// Shared state of all requests: the cluster seam, the dashboard
/// configuration source and request metrics.
pub(crate) struct ApiState<C, S> {
    cluster: C,
    dashboard_config: S,
    request_count: Counter<u64>,
}

impl<C: ClusterApi, S: ConfigSource> ApiState<C, S> {
    pub(crate) fn new(cluster: C, dashboard_config: S) -> Self {
        let meter: Meter = global::meter(API_SERVER);
        let request_count = meter
            .u64_counter(metric_name("requests_total"))
            .with_description("Count of API requests by route and status code")
            .build();
        Self {
            cluster,
            dashboard_config,
            request_count,
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let (status, body) = match serde_json::to_vec(body) {
        Ok(body) => (status, body),
        Err(e) => {
            error!("failed to serialize response: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string() }).to_string().into_bytes(),
            )
        }
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message }))
}

fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

/// Answers 500 with the error message when the settings store cannot be
/// read. The partially read settings are logged, not returned.
async fn get_cluster_settings<C: ClusterApi, S: ConfigSource>(
    state: &ApiState<C, S>,
) -> Response<Full<Bytes>> {
    let config = state.dashboard_config.snapshot();
    match read_settings(&state.cluster, &config).await {
        Ok(settings) => json_response(StatusCode::OK, &settings),
        Err(e) => {
            if let DashboardError::SettingsUnavailable { partial, .. } = &e {
                debug!("partially read cluster settings: {:?}", partial);
            }
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &e.message())
        }
    }
}

async fn put_cluster_settings<C: ClusterApi, S: ConfigSource>(
    state: &ApiState<C, S>,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let update = match SettingsUpdate::from_query(query) {
        Ok(update) => update,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.message()),
    };
    let config = state.dashboard_config.snapshot();
    let outcome = update_settings(&state.cluster, &config, &update).await;
    json_response(StatusCode::OK, &outcome)
}

async fn get_groups_config<C: ClusterApi, S: ConfigSource>(
    state: &ApiState<C, S>,
) -> Response<Full<Bytes>> {
    let config = state.dashboard_config.snapshot();
    match describe_groups(&state.cluster, &config).await {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.message()),
    }
}

async fn put_groups_config<C: ClusterApi, S: ConfigSource>(
    state: &ApiState<C, S>,
    body: &Bytes,
) -> Response<Full<Bytes>> {
    let groups: GroupsConfig = match serde_json::from_slice(body) {
        Ok(groups) => groups,
        Err(e) => {
            let e = DashboardError::InvalidRequest(format!("invalid groups config: {}", e));
            return error_response(StatusCode::BAD_REQUEST, &e.message());
        }
    };
    let config = state.dashboard_config.snapshot();
    match update_groups_cr(&state.cluster, &config, &groups).await {
        Ok(groups) => json_response(StatusCode::OK, &groups),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.message()),
    }
}

async fn get_groups<C: ClusterApi, S: ConfigSource>(
    state: &ApiState<C, S>,
) -> Response<Full<Bytes>> {
    match get_all_groups(&state.cluster).await {
        Ok(groups) => json_response(StatusCode::OK, &groups),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.message()),
    }
}

/// Dispatch a request with an already collected body.
pub(crate) async fn route<C: ClusterApi, S: ConfigSource>(
    state: &ApiState<C, S>,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &Bytes,
) -> Response<Full<Bytes>> {
    debug!("{} {}", method, path);
    let path = path.trim_end_matches('/');
    let response = match (method, path) {
        (&Method::GET, "/healthz") => json_response(StatusCode::OK, &"ok"),
        (&Method::GET, "/api/cluster-settings") => get_cluster_settings(state).await,
        (&Method::PUT, "/api/cluster-settings") => put_cluster_settings(state, query).await,
        (&Method::GET, "/api/groups-config") => get_groups_config(state).await,
        (&Method::PUT, "/api/groups-config") => put_groups_config(state, body).await,
        (&Method::GET, "/api/groups") => get_groups(state).await,
        _ => not_found(),
    };
    state.request_count.add(
        1,
        &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("path", path.to_string()),
            KeyValue::new("status", response.status().as_u16() as i64),
        ],
    );
    response
}

async fn serve_req<C: ClusterApi, S: ConfigSource>(
    req: Request<Incoming>,
    state: Arc<ApiState<C, S>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            warn!("failed to read request body: {}", e);
            return Ok(error_response(StatusCode::BAD_REQUEST, "unreadable request body"));
        }
    };
    Ok(route(
        state.as_ref(),
        &parts.method,
        parts.uri.path(),
        parts.uri.query(),
        &body,
    )
    .await)
}

pub(crate) async fn start_api_server<C, S>(
    addr: SocketAddr,
    state: Arc<ApiState<C, S>>,
) -> anyhow::Result<()>
where
    C: ClusterApi + 'static,
    S: ConfigSource + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on http://{}", addr);
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve_req(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                if !e.is_incomplete_message() {
                    warn!("connection error from {}: {}", remote_addr, e);
                }
            }
        });
    }
}
