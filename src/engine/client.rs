//! gRPC implementation of the engine protocol
//!
//! Three services are involved: the authentication server issues a session
//! token, the controller starts workers and resolves persistent queries, and
//! the worker itself executes tables and serves snapshots. Every call after
//! authentication carries the token as `authorization` metadata.

use super::connection::ServerConfig;
use super::credentials::AuthProof;
use super::error::{EngineError, ProvisioningFailure, Result};
use super::proto::{self, AUTH_SERVICE, CONTROLLER_SERVICE, WORKER_SERVICE};
use super::query::{QuerySpec, SnapshotTarget, TableOperation, TableSource};
use super::transport::{
    Connector, EngineConnection, FrameStream, QueryInfo, WorkerRequest, WorkerStatus,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Request, Status};
use tonic_prost::ProstCodec;
use tracing::{debug, info, warn};

/// Authenticated gRPC client over a channel
pub type AuthGrpcClient = Grpc<InterceptedService<Channel, AuthInterceptor>>;

/// Interceptor that adds the session token to all requests once authenticated
#[derive(Clone)]
pub struct AuthInterceptor {
    token: Option<MetadataValue<Ascii>>,
}

impl AuthInterceptor {
    fn new(token: Option<&str>) -> Result<Self> {
        let token = match token {
            Some(token) => Some(token.parse::<MetadataValue<Ascii>>().map_err(|e| {
                EngineError::Authentication(format!("Invalid token format: {}", e))
            })?),
            None => None,
        };
        Ok(AuthInterceptor { token })
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        if let Some(token) = &self.token {
            request
                .metadata_mut()
                .insert("authorization", token.clone());
        }
        Ok(request)
    }
}

/// Open a channel, with TLS only for https:// endpoints
async fn dial(endpoint: &str, connect_timeout: Duration) -> Result<Channel> {
    let use_tls = endpoint.starts_with("https://");

    let mut channel_builder = Endpoint::from_shared(endpoint.to_string())
        .map_err(|e| {
            EngineError::Configuration(format!("Invalid endpoint '{}': {}", endpoint, e))
        })?
        .connect_timeout(connect_timeout);

    if use_tls {
        let tls = ClientTlsConfig::new().with_native_roots();
        channel_builder = channel_builder.tls_config(tls).map_err(|e| {
            EngineError::Configuration(format!("Failed to configure TLS for '{}': {}", endpoint, e))
        })?;
    }

    channel_builder
        .connect()
        .await
        .map_err(|e| EngineError::Connection(format!("Failed to connect to '{}': {}", endpoint, e)))
}

fn method_path(service: &str, method: &str) -> std::result::Result<PathAndQuery, Status> {
    PathAndQuery::try_from(format!("/{}/{}", service, method))
        .map_err(|e| Status::internal(format!("invalid method path: {}", e)))
}

/// Connector dialing the servers listed in `connection.json`
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    server: ServerConfig,
    connect_timeout: Duration,
    client_name: String,
}

impl GrpcConnector {
    pub fn new(server: ServerConfig, connect_timeout: Duration) -> Self {
        GrpcConnector {
            server,
            connect_timeout,
            client_name: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    fn describe(&self) -> String {
        self.server.server_url.clone()
    }

    async fn connect(&self) -> Result<Box<dyn EngineConnection>> {
        let mut last_error = None;
        let mut auth_channel = None;
        for endpoint in self.server.auth_endpoints() {
            match dial(&endpoint, self.connect_timeout).await {
                Ok(channel) => {
                    debug!("Connected to authentication server {}", endpoint);
                    auth_channel = Some(channel);
                    break;
                }
                Err(e) => {
                    warn!("Authentication server {} unreachable: {}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }
        let auth_channel = auth_channel.ok_or_else(|| {
            last_error.unwrap_or_else(|| {
                EngineError::Configuration("no authentication servers configured".into())
            })
        })?;

        let controller_endpoint = self.server.controller_endpoint();
        let controller_channel = dial(&controller_endpoint, self.connect_timeout).await?;
        debug!("Connected to controller {}", controller_endpoint);

        Ok(Box::new(GrpcConnection {
            auth_channel,
            controller_channel,
            worker_channel: None,
            token: None,
            client_name: self.client_name.clone(),
            connect_timeout: self.connect_timeout,
        }))
    }
}

/// One authenticated connection to the auth server, controller and (once bound) a worker
pub struct GrpcConnection {
    auth_channel: Channel,
    controller_channel: Channel,
    worker_channel: Option<Channel>,
    token: Option<String>,
    client_name: String,
    connect_timeout: Duration,
}

impl GrpcConnection {
    fn client(&self, channel: &Channel) -> std::result::Result<AuthGrpcClient, Status> {
        let interceptor = AuthInterceptor::new(self.token.as_deref())
            .map_err(|e| Status::unauthenticated(e.to_string()))?;
        Ok(Grpc::new(InterceptedService::new(channel.clone(), interceptor)))
    }

    async fn unary<Req, Resp>(
        &self,
        channel: &Channel,
        service: &'static str,
        method: &'static str,
        message: Req,
    ) -> std::result::Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.client(channel)?;
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("{} not ready: {}", service, e)))?;
        let path = method_path(service, method)?;
        let codec = ProstCodec::<Req, Resp>::default();
        let response = grpc.unary(Request::new(message), path, codec).await?;
        Ok(response.into_inner())
    }

    fn worker(&self) -> Result<&Channel> {
        self.worker_channel
            .as_ref()
            .ok_or_else(|| EngineError::Connection("connection is not bound to a worker".into()))
    }
}

fn auth_error(status: Status) -> EngineError {
    match status.code() {
        Code::Unauthenticated | Code::PermissionDenied => {
            EngineError::Authentication(status.message().to_string())
        }
        _ => EngineError::from(status),
    }
}

fn provisioning_error(worker: &str, status: Status) -> EngineError {
    let reason = match status.code() {
        Code::ResourceExhausted => ProvisioningFailure::ResourcesExhausted(status.message().into()),
        Code::AlreadyExists => ProvisioningFailure::DuplicateName,
        Code::InvalidArgument | Code::FailedPrecondition | Code::PermissionDenied => {
            ProvisioningFailure::Rejected(status.message().into())
        }
        Code::Unauthenticated => return EngineError::Authentication(status.message().into()),
        _ => return EngineError::from(status),
    };
    EngineError::provisioning(worker, reason)
}

fn table_error(spec_is_scope: bool, status: Status, fallback: fn(String) -> EngineError) -> EngineError {
    match status.code() {
        Code::NotFound if spec_is_scope => EngineError::TableNotFound(status.message().into()),
        Code::NotFound | Code::InvalidArgument | Code::FailedPrecondition => {
            fallback(status.message().into())
        }
        _ => EngineError::from(status),
    }
}

/// Serialize a spec into the wire program
pub fn to_program(spec: &QuerySpec) -> proto::TableProgram {
    use proto::table_op::Op;
    use proto::table_program::Source;

    let source = match spec.source() {
        TableSource::Empty { size } => Source::EmptySize(*size),
        TableSource::Scope { name } => Source::ScopeName(name.clone()),
        TableSource::Handle(handle) => Source::Ticket(handle.ticket().to_string()),
    };
    let ops = spec
        .operations()
        .iter()
        .map(|op| proto::TableOp {
            op: Some(match op {
                TableOperation::Update { formulas } => Op::Update(proto::UpdateOp {
                    formulas: formulas.clone(),
                }),
                TableOperation::Head { rows } => Op::Head(*rows),
                TableOperation::Tail { rows } => Op::Tail(*rows),
            }),
        })
        .collect();

    proto::TableProgram {
        source: Some(source),
        ops,
    }
}

fn target_program(target: &SnapshotTarget) -> proto::TableProgram {
    match target {
        SnapshotTarget::Handle(handle) => proto::TableProgram {
            source: Some(proto::table_program::Source::Ticket(
                handle.ticket().to_string(),
            )),
            ops: Vec::new(),
        },
        SnapshotTarget::Spec(spec) => to_program(spec),
    }
}

fn is_scope(target: &SnapshotTarget) -> bool {
    matches!(
        target,
        SnapshotTarget::Spec(spec) if matches!(spec.source(), TableSource::Scope { .. })
    )
}

#[async_trait]
impl EngineConnection for GrpcConnection {
    async fn challenge(&mut self) -> Result<Vec<u8>> {
        let request = proto::ChallengeRequest {
            client_name: self.client_name.clone(),
        };
        let response: proto::ChallengeResponse = self
            .unary(&self.auth_channel, AUTH_SERVICE, "GetChallenge", request)
            .await
            .map_err(auth_error)?;
        Ok(response.nonce)
    }

    async fn authenticate(&mut self, proof: &AuthProof) -> Result<()> {
        use proto::auth_request::Proof;

        let proof = match proof {
            AuthProof::Password { username, password } => Proof::Password(proto::PasswordProof {
                username: username.clone(),
                password: password.clone(),
            }),
            AuthProof::Signature {
                username,
                operate_as,
                public_key,
                nonce,
                signature,
            } => Proof::Signature(proto::SignatureProof {
                username: username.clone(),
                operate_as: operate_as.clone(),
                public_key: public_key.clone(),
                nonce: nonce.clone(),
                signature: signature.clone(),
            }),
        };
        let request = proto::AuthRequest {
            client_name: self.client_name.clone(),
            proof: Some(proof),
        };

        let response: proto::AuthResponse = self
            .unary(&self.auth_channel, AUTH_SERVICE, "Authenticate", request)
            .await
            .map_err(auth_error)?;

        if !response.accepted || response.token.is_empty() {
            let reason = if response.reason.is_empty() {
                "credentials rejected".to_string()
            } else {
                response.reason
            };
            return Err(EngineError::Authentication(reason));
        }

        // Validate now so a bad token fails here rather than on the next call
        AuthInterceptor::new(Some(&response.token))?;
        self.token = Some(response.token);
        Ok(())
    }

    async fn start_worker(&mut self, request: &WorkerRequest) -> Result<String> {
        let message = proto::StartWorkerRequest {
            name: request.name.clone(),
            heap_mb: request.heap_mb,
            operation_timeout_ms: request.operation_timeout.as_millis() as u64,
            client_session_id: request.client_session_id.clone(),
        };
        let response: proto::StartWorkerResponse = self
            .unary(&self.controller_channel, CONTROLLER_SERVICE, "StartWorker", message)
            .await
            .map_err(|status| provisioning_error(&request.name, status))?;
        info!("Controller accepted worker '{}' as {}", request.name, response.worker_id);
        Ok(response.worker_id)
    }

    async fn worker_status(&mut self, worker_id: &str) -> Result<WorkerStatus> {
        let message = proto::WorkerRef {
            worker_id: worker_id.to_string(),
        };
        let response: proto::WorkerStatusResponse = self
            .unary(&self.controller_channel, CONTROLLER_SERVICE, "WorkerStatus", message)
            .await?;

        let status = match response.state() {
            proto::WorkerState::Running if !response.endpoint.is_empty() => WorkerStatus::Running {
                endpoint: response.endpoint,
            },
            proto::WorkerState::Failed => WorkerStatus::Failed {
                reason: response.message,
            },
            proto::WorkerState::Stopped => WorkerStatus::Stopped,
            _ => WorkerStatus::Starting,
        };
        Ok(status)
    }

    async fn stop_worker(&mut self, worker_id: &str) -> Result<()> {
        let message = proto::WorkerRef {
            worker_id: worker_id.to_string(),
        };
        let result: std::result::Result<proto::StopWorkerResponse, Status> = self
            .unary(&self.controller_channel, CONTROLLER_SERVICE, "StopWorker", message)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => {
                debug!("Worker {} already gone", worker_id);
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    async fn cancel_start(&mut self, client_session_id: &str) -> Result<()> {
        let message = proto::CancelStartRequest {
            client_session_id: client_session_id.to_string(),
        };
        let result: std::result::Result<proto::StopWorkerResponse, Status> = self
            .unary(&self.controller_channel, CONTROLLER_SERVICE, "CancelStart", message)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(status.into()),
        }
    }

    async fn find_query(&mut self, name: &str) -> Result<Option<QueryInfo>> {
        let message = proto::GetQueryRequest {
            name: name.to_string(),
        };
        let result: std::result::Result<proto::QueryInfo, Status> = self
            .unary(&self.controller_channel, CONTROLLER_SERVICE, "GetQuery", message)
            .await;
        match result {
            Ok(info) => Ok(Some(QueryInfo {
                name: info.name,
                serial: info.serial,
                status: info.status,
                endpoint: info.endpoint,
            })),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(auth_error(status)),
        }
    }

    async fn bind_worker(&mut self, endpoint: &str) -> Result<()> {
        let channel = dial(endpoint, self.connect_timeout).await?;
        debug!("Bound connection to worker {}", endpoint);
        self.worker_channel = Some(channel);
        Ok(())
    }

    async fn execute(&mut self, spec: &QuerySpec) -> Result<String> {
        let scope = matches!(spec.source(), TableSource::Scope { .. });
        let message = proto::ExecuteRequest {
            program: Some(to_program(spec)),
        };
        let channel = self.worker()?.clone();
        let response: proto::ExecuteResponse = self
            .unary(&channel, WORKER_SERVICE, "Execute", message)
            .await
            .map_err(|status| table_error(scope, status, EngineError::QueryExecution))?;
        Ok(response.ticket)
    }

    async fn snapshot(&mut self, target: &SnapshotTarget) -> Result<FrameStream> {
        let scope = is_scope(target);
        let message = proto::SnapshotRequest {
            program: Some(target_program(target)),
        };
        let channel = self.worker()?.clone();
        let mut grpc = self.client(&channel)?;
        grpc.ready()
            .await
            .map_err(|e| EngineError::Connection(format!("worker not ready: {}", e)))?;
        let path = method_path(WORKER_SERVICE, "Snapshot")?;
        let codec = ProstCodec::<proto::SnapshotRequest, proto::SnapshotFrame>::default();
        let response = grpc
            .server_streaming(Request::new(message), path, codec)
            .await
            .map_err(|status| table_error(scope, status, EngineError::Snapshot))?;

        Ok(response
            .into_inner()
            .map(|frame| frame.map_err(EngineError::from))
            .boxed())
    }

    async fn release(&mut self, tickets: &[String]) -> Result<()> {
        if tickets.is_empty() || self.worker_channel.is_none() {
            return Ok(());
        }
        let message = proto::ReleaseRequest {
            tickets: tickets.to_vec(),
        };
        let channel = self.worker()?.clone();
        let result: std::result::Result<proto::ReleaseResponse, Status> =
            self.unary(&channel, WORKER_SERVICE, "Release", message).await;
        match result {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(status.into()),
        }
    }

    async fn disconnect(&mut self) {
        // Dropping the channels closes the underlying HTTP/2 connections
        self.worker_channel = None;
        self.token = None;
    }
}
