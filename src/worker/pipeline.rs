use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::config::DaemonConfig;
use crate::directory::{ClaimStore, Job, JobDirectory, ResultStream};
use crate::error::{ArchiverError, Result};
use crate::identity::{Account, IdentityService};
use crate::scheduler::ClaimedJob;
use crate::store::{bytes_body, content_md5, file_digest, ObjectStore, PutOptions};
use crate::worker::export::{export_empty, export_stream, ExportSummary};
use crate::worker::heartbeat::Heartbeater;
use crate::worker::scratch::ScratchDir;

const JOB_ERROR_CONTENT_TYPE: &str = "application/x-json-stream; type=job-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    CreateScratch,
    StartHeartbeat,
    ResolveOwner,
    ExportErrors,
    ExportFailedInputs,
    ExportInputs,
    ExportOutputs,
    UploadManifest,
    UploadStreams,
    DeleteLiveMarker,
    MarkArchiveDone,
    ReuploadManifest,
    CleanScratch,
}

/// Pipeline stages in execution order.
pub const STAGES: [Stage; 13] = [
    Stage::CreateScratch,
    Stage::StartHeartbeat,
    Stage::ResolveOwner,
    Stage::ExportErrors,
    Stage::ExportFailedInputs,
    Stage::ExportInputs,
    Stage::ExportOutputs,
    Stage::UploadManifest,
    Stage::UploadStreams,
    Stage::DeleteLiveMarker,
    Stage::MarkArchiveDone,
    Stage::ReuploadManifest,
    Stage::CleanScratch,
];

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::CreateScratch => "scratch-created",
            Stage::StartHeartbeat => "heartbeat-started",
            Stage::ResolveOwner => "identity-resolved",
            Stage::ExportErrors => "errors-exported",
            Stage::ExportFailedInputs => "failed-inputs-exported",
            Stage::ExportInputs => "inputs-exported",
            Stage::ExportOutputs => "outputs-exported",
            Stage::UploadManifest => "manifest-uploaded",
            Stage::UploadStreams => "streams-uploaded",
            Stage::DeleteLiveMarker => "live-marker-deleted",
            Stage::MarkArchiveDone => "archive-marked-done",
            Stage::ReuploadManifest => "manifest-reuploaded",
            Stage::CleanScratch => "scratch-cleaned",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct ArchiverSettings {
    pub scratch_root: PathBuf,
    pub admin_root: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_retries: u32,
    pub export_stall_limit: u32,
}

impl From<&DaemonConfig> for ArchiverSettings {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            scratch_root: config.scratch_dir.clone(),
            admin_root: config.admin_root.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_retries: config.heartbeat_retries,
            export_stall_limit: config.export_stall_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub job_id: String,
    pub login: String,
    pub exports: Vec<ExportSummary>,
    /// Uploads skipped because the owner's job directory was gone.
    pub skipped_uploads: usize,
    pub renewals: u64,
}

/// Per-job state shared by the stages.
struct ArchiveContext {
    job: Job,
    claimed: ClaimedJob,
    scratch: Option<ScratchDir>,
    heartbeat: Option<Heartbeater>,
    account: Option<Account>,
    exports: Vec<ExportSummary>,
    skipped_uploads: usize,
}

impl ArchiveContext {
    fn scratch(&self) -> Result<&ScratchDir> {
        self.scratch
            .as_ref()
            .ok_or_else(|| ArchiverError::Internal("scratch directory not created".into()))
    }

    fn account(&self) -> Result<&Account> {
        self.account
            .as_ref()
            .ok_or_else(|| ArchiverError::Internal("owner not resolved".into()))
    }

    fn job_root(&self) -> Result<String> {
        Ok(format!("/{}/jobs/{}", self.account()?.login, self.job.job_id))
    }

    fn owner_options(&self, content_type: &str) -> PutOptions {
        PutOptions::new(content_type)
            .header("authorization", &format!("Token {}", self.job.auth.token))
            .header("access-control-allow-origin", "*")
    }
}

/// Archives one claimed job: exports its result streams to scratch files,
/// uploads them with the manifest, marks the job archived and drops the
/// scratch directory.
///
/// Stages run strictly in order and the first failure aborts the rest. The
/// heartbeat is stopped exactly once whatever the outcome; the claim is
/// never released on failure, it goes stale and the takeover sweep
/// recovers the job.
pub struct Archiver {
    identity: String,
    directory: Arc<dyn JobDirectory>,
    claims: Arc<dyn ClaimStore>,
    store: Arc<dyn ObjectStore>,
    identity_service: Arc<dyn IdentityService>,
    settings: ArchiverSettings,
}

impl Archiver {
    pub fn new(
        identity: &str,
        directory: Arc<dyn JobDirectory>,
        claims: Arc<dyn ClaimStore>,
        store: Arc<dyn ObjectStore>,
        identity_service: Arc<dyn IdentityService>,
        settings: ArchiverSettings,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            directory,
            claims,
            store,
            identity_service,
            settings,
        }
    }

    pub fn settings(&self) -> &ArchiverSettings {
        &self.settings
    }

    pub async fn archive(&self, claimed: ClaimedJob) -> Result<ArchiveReport> {
        let span = tracing::info_span!("archive", job_id = %claimed.job_id());
        self.run(claimed).instrument(span).await
    }

    async fn run(&self, claimed: ClaimedJob) -> Result<ArchiveReport> {
        let mut ctx = ArchiveContext {
            job: claimed.job.clone(),
            claimed,
            scratch: None,
            heartbeat: None,
            account: None,
            exports: Vec::new(),
            skipped_uploads: 0,
        };

        let mut outcome = Ok(());
        for stage in STAGES {
            if let Err(e) = self.run_stage(stage, &mut ctx).await {
                tracing::warn!(%stage, error = %e, "Archive stage failed");
                outcome = Err(e);
                break;
            }
            tracing::debug!(%stage, "Stage complete");
        }

        let renewals = match ctx.heartbeat.take() {
            Some(heartbeat) => heartbeat.stop().await,
            None => 0,
        };

        if let Err(e) = outcome {
            if let Some(scratch) = ctx.scratch.take() {
                if let Err(clean) = scratch.remove().await {
                    tracing::warn!(error = %clean, "Failed to remove scratch directory");
                }
            }
            return Err(e);
        }

        let login = ctx.account()?.login.clone();
        tracing::info!(renewals, skipped = ctx.skipped_uploads, "Job archived");
        Ok(ArchiveReport {
            job_id: ctx.job.job_id,
            login,
            exports: ctx.exports,
            skipped_uploads: ctx.skipped_uploads,
            renewals,
        })
    }

    async fn run_stage(&self, stage: Stage, ctx: &mut ArchiveContext) -> Result<()> {
        match stage {
            Stage::CreateScratch => {
                let scratch =
                    ScratchDir::create(&self.settings.scratch_root, &ctx.job.job_id).await?;
                ctx.scratch = Some(scratch);
            }
            Stage::StartHeartbeat => {
                let heartbeat = Heartbeater::start(
                    self.claims.clone(),
                    &ctx.claimed.claim,
                    &self.identity,
                    self.settings.heartbeat_interval,
                    self.settings.heartbeat_retries,
                )
                .await?;
                ctx.heartbeat = Some(heartbeat);
            }
            Stage::ResolveOwner => {
                let account = self.identity_service.resolve_owner(&ctx.job.owner).await?;
                tracing::debug!(login = %account.login, "Resolved owner");
                ctx.account = Some(account);
            }
            Stage::ExportErrors => self.export(ctx, Some(ResultStream::Errors)).await?,
            Stage::ExportFailedInputs => {
                self.export(ctx, Some(ResultStream::FailedInputs)).await?
            }
            Stage::ExportInputs => self.export(ctx, Some(ResultStream::Inputs)).await?,
            Stage::ExportOutputs => {
                let stream = ctx
                    .job
                    .output_phase()
                    .map(|phase| ResultStream::Outputs { phase });
                self.export(ctx, stream).await?
            }
            Stage::UploadManifest | Stage::ReuploadManifest => {
                self.upload_manifest(ctx).await?;
                if stage == Stage::ReuploadManifest {
                    self.upload_admin_manifest(ctx).await?;
                }
            }
            Stage::UploadStreams => {
                for stream in [
                    ResultStream::Outputs { phase: 0 },
                    ResultStream::Errors,
                    ResultStream::Inputs,
                    ResultStream::FailedInputs,
                ] {
                    self.upload_stream(ctx, stream).await?;
                }
            }
            Stage::DeleteLiveMarker => {
                let path = format!("{}/live", ctx.job_root()?);
                match self.store.unlink(&path).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        tracing::debug!(%path, "Live marker already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
            Stage::MarkArchiveDone => {
                if !ctx.heartbeat.as_ref().is_some_and(|h| h.is_running()) {
                    return Err(ArchiverError::ClaimLost(ctx.job.job_id.clone()));
                }
                ctx.job = self.directory.archive_done(&ctx.job.job_id).await?;
            }
            Stage::CleanScratch => {
                if let Some(scratch) = ctx.scratch.take() {
                    scratch.remove().await?;
                }
            }
        }
        Ok(())
    }

    /// Export `stream` into its scratch file; `None` writes an empty file
    /// for jobs without an output phase.
    async fn export(&self, ctx: &mut ArchiveContext, stream: Option<ResultStream>) -> Result<()> {
        let file_name = stream
            .map(|s| s.file_name())
            .unwrap_or(ResultStream::Outputs { phase: 0 }.file_name());
        let path = ctx.scratch()?.file(file_name);
        let summary = match stream {
            Some(stream) => {
                export_stream(
                    self.directory.as_ref(),
                    &ctx.job.job_id,
                    stream,
                    &path,
                    self.settings.export_stall_limit,
                )
                .await?
            }
            None => export_empty(&path).await?,
        };
        ctx.exports.push(summary);
        Ok(())
    }

    async fn upload_manifest(&self, ctx: &mut ArchiveContext) -> Result<()> {
        let path = format!("{}/job.json", ctx.job_root()?);
        let body = serde_json::to_vec(&ctx.job.manifest())?;
        let opts = ctx
            .owner_options("application/json")
            .size(body.len() as u64)
            .md5(content_md5(&body));
        self.put_owner_object(ctx, &path, bytes_body(body), opts)
            .await
    }

    async fn upload_stream(&self, ctx: &mut ArchiveContext, stream: ResultStream) -> Result<()> {
        let local = ctx.scratch()?.file(stream.file_name());
        let path = format!("{}/{}", ctx.job_root()?, stream.file_name());
        let content_type = match stream {
            ResultStream::Errors => JOB_ERROR_CONTENT_TYPE,
            _ => "text/plain",
        };
        let (size, md5) = file_digest(&local).await?;
        let body = tokio::fs::File::open(&local).await?;
        let opts = ctx.owner_options(content_type).size(size).md5(md5);
        self.put_owner_object(ctx, &path, Box::pin(body), opts)
            .await
    }

    async fn put_owner_object(
        &self,
        ctx: &mut ArchiveContext,
        path: &str,
        body: crate::store::ObjectBody,
        opts: PutOptions,
    ) -> Result<()> {
        match self.store.put(path, body, opts).await {
            Ok(()) => {
                tracing::debug!(%path, "Uploaded");
                Ok(())
            }
            Err(ArchiverError::DirectoryNotFound(dir)) => {
                tracing::warn!(%path, %dir, "Owner job directory missing, skipping upload");
                ctx.skipped_uploads += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_admin_manifest(&self, ctx: &ArchiveContext) -> Result<()> {
        let dir = admin_archive_dir(&self.settings.admin_root, &ctx.job);
        self.store.mkdir(&dir).await?;
        let body = serde_json::to_vec(&ctx.job.redacted())?;
        let opts = PutOptions::new("application/json")
            .header("access-control-allow-origin", "*")
            .size(body.len() as u64)
            .md5(content_md5(&body));
        let path = format!("{}/job.json", dir);
        self.store.put(&path, bytes_body(body), opts).await?;
        tracing::debug!(%path, "Uploaded admin copy");
        Ok(())
    }
}

/// `{admin_root}/job_archives/YYYY/MM/DD/HH/{job_id}`, from the job's
/// creation time in UTC.
pub fn admin_archive_dir(admin_root: &str, job: &Job) -> String {
    format!(
        "{}/job_archives/{}/{}",
        admin_root.trim_end_matches('/'),
        job.time_created.format("%Y/%m/%d/%H"),
        job.job_id
    )
}
