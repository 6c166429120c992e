//! Inbound backup transfer sessions
//!
//! One session per producer stream:
//!
//! ```text
//! Init --initialize--> Receiving --finalize--> Finalized
//!                          |
//!                          +--abort / error / drop--> Aborted
//! ```
//!
//! A session owns its temp artifact. Every path out of `Receiving` other
//! than a successful finalize removes it, so an aborted or cancelled
//! session leaves neither a temp directory nor a catalog record behind.

use crate::chain::ChainResolver;
use crate::disk::{ArtifactWriter, PhysicalStorage, TempArtifact};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use polymerase_common::checkpoint::CHECKPOINTS_FILE_NAME;
use polymerase_common::{
    BackupKey, BackupMeta, BackupRequest, BackupType, Checkpoints, DatabaseId, Error, NodeId,
    Result, StorageType, TimePoint,
};
use polymerase_meta_store::{MetadataStore, keys};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every session on a node
#[derive(Clone)]
pub struct TransferContext {
    pub store: MetadataStore,
    pub storage: Arc<dyn PhysicalStorage>,
    pub resolver: ChainResolver,
    pub node_id: NodeId,
    /// Address recorded as the host of every backup received here
    pub host_addr: String,
}

/// Externally visible session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Receiving,
    Finalized,
    Aborted,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Receiving => "receiving",
            Self::Finalized => "finalized",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

struct Receiving {
    /// Record persisted on finalize; `file_size` accrues as chunks arrive
    draft: BackupMeta,
    temp: TempArtifact,
    writer: ArtifactWriter,
    manifest: Option<Vec<u8>>,
}

enum SessionState {
    Init,
    Receiving(Box<Receiving>),
    Finalized,
    Aborted,
}

impl SessionState {
    const fn phase(&self) -> SessionPhase {
        match self {
            Self::Init => SessionPhase::Init,
            Self::Receiving(_) => SessionPhase::Receiving,
            Self::Finalized => SessionPhase::Finalized,
            Self::Aborted => SessionPhase::Aborted,
        }
    }
}

/// State machine driving one inbound backup stream
pub struct TransferSession {
    ctx: TransferContext,
    state: SessionState,
}

impl TransferSession {
    #[must_use]
    pub const fn new(ctx: TransferContext) -> Self {
        Self {
            ctx,
            state: SessionState::Init,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Key the artifact will be stored under, once initialized
    #[must_use]
    pub fn key(&self) -> Option<&BackupKey> {
        match &self.state {
            SessionState::Receiving(r) => Some(&r.draft.key),
            _ => None,
        }
    }

    fn illegal(&self, op: &str) -> Error {
        Error::protocol(format!("{op} is not allowed in state {}", self.phase()))
    }

    /// Start the session at the current time
    pub async fn initialize(&mut self, db: DatabaseId, request: BackupRequest) -> Result<BackupKey> {
        self.initialize_at(db, request, Utc::now()).await
    }

    /// Start the session as if the backup began at `now`
    ///
    /// Incrementals are attached to the lineage whose backup ended at the
    /// supplied LSN; a failed lookup leaves no temp state behind.
    pub async fn initialize_at(
        &mut self,
        db: DatabaseId,
        request: BackupRequest,
        now: DateTime<Utc>,
    ) -> Result<BackupKey> {
        if !matches!(self.state, SessionState::Init) {
            return Err(self.illegal("initialize"));
        }

        let at = TimePoint::from_datetime(now);
        let (key, from_lsn) = match &request {
            BackupRequest::Full | BackupRequest::LogicalDump => {
                (BackupKey::root(db, at), None)
            }
            BackupRequest::Incremental { lsn } => {
                let base = self
                    .ctx
                    .resolver
                    .search_base_time_point_by_lsn(&db, lsn)
                    .await?;
                (BackupKey::new(db, base, at), Some(lsn.clone()))
            }
        };
        if self.ctx.store.get_backup_meta(&key).await?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "{} (time points have one-second resolution)",
                keys::storage_key(&key)
            )));
        }
        let backup_type = request.backup_type();
        let (temp, writer) = self.ctx.storage.create_temp(&key, backup_type).await?;

        info!(
            "Receiving {} backup {} on node {}",
            backup_type, key, self.ctx.node_id
        );
        let draft = BackupMeta {
            key: key.clone(),
            backup_type,
            from_lsn,
            to_lsn: None,
            stored_time: now,
            file_size: 0,
            storage_type: StorageType::Local,
            host_addr: self.ctx.host_addr.clone(),
            node_id: self.ctx.node_id.clone(),
            checkpoints: None,
        };
        self.state = SessionState::Receiving(Box::new(Receiving {
            draft,
            temp,
            writer,
            manifest: None,
        }));
        Ok(key)
    }

    /// Append a chunk of artifact bytes; a write failure aborts the session
    pub async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        let SessionState::Receiving(r) = &mut self.state else {
            return Err(self.illegal("content"));
        };
        if let Err(e) = r.writer.write_all(chunk).await {
            self.abort(&format!("artifact write failed: {e}"));
            return Err(e.into());
        }
        r.draft.file_size += chunk.len() as u64;
        debug!("Appended {} bytes to {}", chunk.len(), r.draft.key);
        Ok(())
    }

    /// Attach the producer's checkpoint manifest
    ///
    /// A manifest that does not parse or contradicts the session is
    /// rejected with [`Error::Validation`]; the session keeps receiving.
    pub fn post_checkpoint(&mut self, raw: &[u8]) -> Result<()> {
        let SessionState::Receiving(r) = &mut self.state else {
            return Err(self.illegal("checkpoint"));
        };
        let cp = Checkpoints::parse(raw)?;
        let mut draft = r.draft.clone();
        draft.backfill_checkpoints(cp)?;
        debug!(
            "Checkpoints of {}: from_lsn={:?} to_lsn={:?}",
            draft.key, draft.from_lsn, draft.to_lsn
        );
        r.draft = draft;
        r.manifest = Some(raw.to_vec());
        Ok(())
    }

    /// Discard the session; a no-op outside `Receiving`
    pub fn abort(&mut self, reason: &str) {
        match std::mem::replace(&mut self.state, SessionState::Aborted) {
            SessionState::Receiving(r) => {
                let Receiving {
                    draft,
                    temp,
                    writer,
                    ..
                } = *r;
                drop(writer);
                if let Err(e) = self.ctx.storage.discard_temp(&temp) {
                    error!("Failed to remove temp artifact {}: {}", temp.dir.display(), e);
                }
                warn!("Aborted backup {}: {}", draft.key, reason);
            }
            SessionState::Init => {
                self.state = SessionState::Init;
                warn!("Session ended before initialize: {}", reason);
            }
            other => {
                debug!("Ignoring abort in state {}: {}", other.phase(), reason);
                self.state = other;
            }
        }
    }

    /// Close the artifact, move it into place and catalog it
    ///
    /// Nothing is catalogued unless relocation succeeds. Returns the
    /// persisted record.
    pub async fn finalize(&mut self) -> Result<BackupMeta> {
        let r = match std::mem::replace(&mut self.state, SessionState::Aborted) {
            SessionState::Receiving(r) => r,
            other => {
                self.state = other;
                return Err(self.illegal("finalize"));
            }
        };
        let Receiving {
            draft,
            temp,
            mut writer,
            manifest,
        } = *r;

        let closed = writer.shutdown().await;
        drop(writer);
        let staged = match closed {
            Err(e) => Err(Error::from(e)),
            Ok(()) if draft.file_size == 0 => Err(Error::validation(format!(
                "backup {} received no content",
                draft.key
            ))),
            Ok(()) => match &manifest {
                Some(raw) => {
                    self.ctx
                        .storage
                        .write_temp_file(&temp, CHECKPOINTS_FILE_NAME, raw)
                        .await
                }
                None => Ok(()),
            },
        };
        let storage_key = keys::storage_key(&draft.key);
        let relocated = match staged {
            Ok(()) => self.ctx.storage.relocate(&temp, &storage_key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = relocated {
            if let Err(rm) = self.ctx.storage.discard_temp(&temp) {
                error!("Failed to remove temp artifact {}: {}", temp.dir.display(), rm);
            }
            warn!("Aborted backup {}: {}", draft.key, e);
            return Err(e);
        }

        if let Err(e) = self.ctx.store.create_backup_meta(&draft).await {
            error!(
                "Artifact {} is stored but could not be catalogued: {}",
                storage_key, e
            );
            return Err(e);
        }
        self.state = SessionState::Finalized;
        info!(
            "Stored {} backup {} ({} bytes)",
            draft.backup_type, storage_key, draft.file_size
        );
        Ok(draft)
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Receiving(_)) {
            self.abort("session dropped before finalize");
        }
    }
}

/// Message of an inbound transfer stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferRequest {
    Initialize {
        db: String,
        backup_type: BackupType,
        lsn: Option<String>,
    },
    Content(Bytes),
    Checkpoint(Bytes),
    ClientError(String),
}

/// Single reply sent when the stream closes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferReply {
    pub message: String,
    /// Storage key of the stored artifact
    pub key: String,
}

/// Drive a session from a stream of requests until it closes
///
/// Any error aborts the session and is returned, except a rejected
/// checkpoint manifest, which is reported in the reply while the artifact
/// is still stored. A client error before `Initialize` is only logged.
/// Dropping the returned future mid-stream aborts too.
pub async fn run_transfer<S>(ctx: TransferContext, mut requests: S) -> Result<TransferReply>
where
    S: Stream<Item = Result<TransferRequest>> + Unpin + Send,
{
    let mut session = TransferSession::new(ctx);
    let mut rejected_manifest: Option<String> = None;

    while let Some(item) = requests.next().await {
        let step = match item {
            Ok(TransferRequest::Initialize {
                db,
                backup_type,
                lsn,
            }) => match (DatabaseId::new(db), BackupRequest::new(backup_type, lsn)) {
                (Ok(db), Ok(request)) => session.initialize(db, request).await.map(|_| ()),
                (Err(e), _) | (_, Err(e)) => Err(e),
            },
            Ok(TransferRequest::Content(chunk)) => session.append(&chunk).await,
            Ok(TransferRequest::Checkpoint(raw)) => match session.post_checkpoint(&raw) {
                Err(Error::Validation(msg)) if session.phase() == SessionPhase::Receiving => {
                    warn!("Rejected checkpoint manifest: {}", msg);
                    rejected_manifest = Some(msg);
                    Ok(())
                }
                other => other,
            },
            Ok(TransferRequest::ClientError(msg)) if session.phase() == SessionPhase::Init => {
                warn!("Client error before initialize: {}", msg);
                Ok(())
            }
            Ok(TransferRequest::ClientError(msg)) => {
                session.abort(&msg);
                return Err(Error::Aborted(msg));
            }
            Err(e) => Err(e),
        };
        if let Err(e) = step {
            session.abort(&e.to_string());
            return Err(e);
        }
    }

    let meta = session.finalize().await?;
    let key = keys::storage_key(&meta.key);
    let message = match rejected_manifest {
        Some(msg) => format!("Backup stored, checkpoint manifest rejected: {msg}"),
        None => "Backup stored".to_string(),
    };
    Ok(TransferReply { message, key })
}
