//! gRPC surface of a storage node
//!
//! Thin adapter between the generated `BackupService` trait and
//! [`BackupManager`]: decode requests, call the manager, map errors.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use polymerase_common::{BackupMeta, BackupType, DatabaseId, Error, StorageType};
use polymerase_meta_store::keys;
use polymerase_proto::backup::backup_request::Request as BackupRequestKind;
use polymerase_proto::backup::backup_service_server::BackupService;
use polymerase_proto::backup::{
    self as pb, AllocateHostRequest, AllocateHostResponse, BackupFileInfo, BackupReply,
    FileStream, GetFileByKeyRequest, GetKeysAtPointRequest, GetKeysAtPointResponse,
    GetLatestToLsnRequest, GetLatestToLsnResponse, PostCheckpointsRequest,
    PostCheckpointsResponse, PurgePrevBackupRequest, PurgePrevBackupResponse,
};
use polymerase_storage::{BackupManager, TransferRequest, run_transfer};
use std::pin::Pin;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info, warn};

/// Backup service backed by the local node
pub struct BackupNodeService {
    manager: BackupManager,
}

impl BackupNodeService {
    pub const fn new(manager: BackupManager) -> Self {
        Self { manager }
    }
}

/// Map a domain error onto the gRPC status a client sees
fn to_status(err: Error) -> Status {
    match &err {
        Error::Validation(_) | Error::KeyDecode(_) => Status::invalid_argument(err.to_string()),
        Error::NotFound(_) | Error::LineageNotFound { .. } => Status::not_found(err.to_string()),
        Error::Protocol(_) | Error::ChainBroken { .. } => {
            Status::failed_precondition(err.to_string())
        }
        Error::Aborted(_) => Status::aborted(err.to_string()),
        Error::AlreadyExists(_) => Status::already_exists(err.to_string()),
        Error::Lock(_) => Status::unavailable(err.to_string()),
        Error::Io(_)
        | Error::Store(_)
        | Error::Serialization(_)
        | Error::Deserialization(_)
        | Error::Internal(_) => {
            error!("Request failed: {}", err);
            Status::internal(err.to_string())
        }
    }
}

fn parse_db(db: String) -> Result<DatabaseId, Status> {
    DatabaseId::new(db).map_err(to_status)
}

fn check_storage_type(storage_type: &str) -> Result<(), Status> {
    if storage_type.is_empty() || storage_type == StorageType::Local.as_str() {
        Ok(())
    } else {
        Err(Status::invalid_argument(format!(
            "unsupported storage type {storage_type:?}"
        )))
    }
}

const fn backup_type_to_proto(t: BackupType) -> pb::BackupType {
    match t {
        BackupType::Full => pb::BackupType::Full,
        BackupType::Incremental => pb::BackupType::Incremental,
        BackupType::LogicalDump => pb::BackupType::LogicalDump,
    }
}

fn backup_type_from_proto(raw: i32) -> polymerase_common::Result<BackupType> {
    match pb::BackupType::try_from(raw) {
        Ok(pb::BackupType::Full) => Ok(BackupType::Full),
        Ok(pb::BackupType::Incremental) => Ok(BackupType::Incremental),
        Ok(pb::BackupType::LogicalDump) => Ok(BackupType::LogicalDump),
        Ok(pb::BackupType::Unspecified) | Err(_) => {
            Err(Error::validation(format!("unknown backup type {raw}")))
        }
    }
}

/// Decode one message of a transfer stream
fn transfer_request(msg: pb::BackupRequest) -> polymerase_common::Result<TransferRequest> {
    match msg.request {
        Some(BackupRequestKind::Initialize(init)) => Ok(TransferRequest::Initialize {
            db: init.db,
            backup_type: backup_type_from_proto(init.backup_type)?,
            lsn: Some(init.lsn).filter(|lsn| !lsn.is_empty()),
        }),
        Some(BackupRequestKind::Content(chunk)) => Ok(TransferRequest::Content(Bytes::from(chunk))),
        Some(BackupRequestKind::Checkpoint(raw)) => {
            Ok(TransferRequest::Checkpoint(Bytes::from(raw)))
        }
        Some(BackupRequestKind::ClientError(e)) => Ok(TransferRequest::ClientError(e.message)),
        None => Err(Error::protocol("transfer message carries no request")),
    }
}

fn file_info(meta: &BackupMeta) -> BackupFileInfo {
    BackupFileInfo {
        storage_type: meta.storage_type.as_str().to_string(),
        backup_type: backup_type_to_proto(meta.backup_type).into(),
        key: keys::storage_key(&meta.key),
        size: meta.file_size,
        from_lsn: meta.from_lsn.clone().unwrap_or_default(),
        to_lsn: meta.to_lsn.clone().unwrap_or_default(),
        stored_time: meta.stored_time.to_rfc3339(),
        node_id: meta.node_id.to_string(),
        host_addr: meta.host_addr.clone(),
    }
}

type FileChunkStream = Pin<Box<dyn Stream<Item = Result<FileStream, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl BackupService for BackupNodeService {
    async fn transfer_backup(
        &self,
        request: Request<Streaming<pb::BackupRequest>>,
    ) -> Result<Response<BackupReply>, Status> {
        let remote = request
            .remote_addr()
            .map_or_else(|| "unknown".to_string(), |a| a.to_string());
        let requests = request.into_inner().map(|item| match item {
            Ok(msg) => transfer_request(msg),
            Err(status) => Err(Error::Aborted(format!(
                "transport error: {}",
                status.message()
            ))),
        });

        match run_transfer(self.manager.transfer_context(), requests).await {
            Ok(reply) => Ok(Response::new(BackupReply {
                message: reply.message,
                key: reply.key,
            })),
            Err(e) => {
                warn!("Transfer from {} failed: {}", remote, e);
                Err(to_status(e))
            }
        }
    }

    async fn get_latest_to_lsn(
        &self,
        request: Request<GetLatestToLsnRequest>,
    ) -> Result<Response<GetLatestToLsnResponse>, Status> {
        let db = parse_db(request.into_inner().db)?;
        let lsn = self
            .manager
            .get_latest_to_lsn(&db)
            .await
            .map_err(to_status)?;
        Ok(Response::new(GetLatestToLsnResponse { lsn }))
    }

    async fn get_keys_at_point(
        &self,
        request: Request<GetKeysAtPointRequest>,
    ) -> Result<Response<GetKeysAtPointResponse>, Status> {
        let req = request.into_inner();
        let db = parse_db(req.db)?;
        let chain = self
            .manager
            .get_keys_at_point(&db, &req.from)
            .await
            .map_err(to_status)?;
        Ok(Response::new(GetKeysAtPointResponse {
            keys: chain.iter().map(file_info).collect(),
        }))
    }

    type GetFileByKeyStream = FileChunkStream;

    async fn get_file_by_key(
        &self,
        request: Request<GetFileByKeyRequest>,
    ) -> Result<Response<Self::GetFileByKeyStream>, Status> {
        let req = request.into_inner();
        check_storage_type(&req.storage_type)?;
        let rx = self
            .manager
            .stream_backup(&req.key)
            .await
            .map_err(to_status)?;
        info!("Streaming {}", req.key);
        let stream = ReceiverStream::new(rx).map(|chunk| {
            chunk
                .map(|content| FileStream {
                    content: content.to_vec(),
                })
                .map_err(to_status)
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn purge_prev_backup(
        &self,
        request: Request<PurgePrevBackupRequest>,
    ) -> Result<Response<PurgePrevBackupResponse>, Status> {
        let db = parse_db(request.into_inner().db)?;
        let message = self
            .manager
            .purge_prev_backup(&db)
            .await
            .map_err(to_status)?;
        Ok(Response::new(PurgePrevBackupResponse { message }))
    }

    async fn post_checkpoints(
        &self,
        request: Request<PostCheckpointsRequest>,
    ) -> Result<Response<PostCheckpointsResponse>, Status> {
        let req = request.into_inner();
        let meta = self
            .manager
            .update_checkpoint(&req.key, &req.content)
            .await
            .map_err(to_status)?;
        Ok(Response::new(PostCheckpointsResponse {
            message: format!("Checkpoint of {} updated", meta.key),
        }))
    }

    async fn allocate_host(
        &self,
        request: Request<AllocateHostRequest>,
    ) -> Result<Response<AllocateHostResponse>, Status> {
        let db = parse_db(request.into_inner().db)?;
        let placement = self.manager.allocate_host(&db).await.map_err(to_status)?;
        Ok(Response::new(AllocateHostResponse {
            node_id: placement.node_id.to_string(),
            addr: placement.addr,
        }))
    }
}
