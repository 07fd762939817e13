use super::encoder::Encoder;
use super::error::JobError;
use crate::common::mime::file_extension_for;
use crate::infrastructure::queue::{BrokerChannel, BrokerClient, Delivery, QueueError, Topology};
use crate::infrastructure::storage::{BlobStore, CdnInvalidator, UploadedFile};
use crate::modules::transcoding::model::{Job, JobPatch};
use crate::modules::transcoding::rendition::{
    master_playlist, RenditionOutput, MASTER_PLAYLIST, RENDITION_LADDER,
};
use crate::modules::transcoding::repository::JobStore;
use futures_util::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const OUTPUT_DIR: &str = "hls-files";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub work_dir: PathBuf,
    pub queue: String,
    pub routing_key: String,
    /// Wait before re-subscribing when the broker is not connected.
    pub restart_delay: Duration,
    /// Wait before re-subscribing after any other subscribe failure or a
    /// consumer that ended on its own.
    pub resubscribe_delay: Duration,
}

impl WorkerSettings {
    pub fn new(work_dir: impl Into<PathBuf>, topology: &Topology) -> Self {
        Self {
            work_dir: work_dir.into(),
            queue: topology.queue.clone(),
            routing_key: topology.routing_key.clone(),
            restart_delay: Duration::from_secs(5),
            resubscribe_delay: Duration::from_secs(2),
        }
    }
}

/// Consumes transcoding tasks one at a time and turns each uploaded source
/// into an HLS ladder in object storage.
pub struct TranscodingWorker<C> {
    broker: Arc<BrokerClient<C>>,
    jobs: Arc<dyn JobStore>,
    storage: Arc<dyn BlobStore>,
    cdn: Arc<dyn CdnInvalidator>,
    encoder: Arc<dyn Encoder>,
    settings: WorkerSettings,
    stop: CancellationToken,
}

impl<C: BrokerChannel> TranscodingWorker<C> {
    pub fn new(
        broker: Arc<BrokerClient<C>>,
        jobs: Arc<dyn JobStore>,
        storage: Arc<dyn BlobStore>,
        cdn: Arc<dyn CdnInvalidator>,
        encoder: Arc<dyn Encoder>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            broker,
            jobs,
            storage,
            cdn,
            encoder,
            settings,
            stop: CancellationToken::new(),
        }
    }

    /// Stops re-arming the consumer. A job already being processed runs to
    /// completion first.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Subscribes to the task queue and keeps the subscription alive until
    /// `stop` is called.
    pub async fn run(self: Arc<Self>) {
        info!("🎥 Starting transcoding worker on '{}'", self.settings.queue);

        while !self.stop.is_cancelled() {
            let worker = self.clone();
            let subscribed = self
                .broker
                .consume(&self.settings.queue, move |delivery| {
                    let worker = worker.clone();
                    async move { worker.handle_delivery(delivery).await }
                })
                .await;

            let delay = match subscribed {
                Ok(mut handle) => {
                    info!("🎥 Transcoding worker listening (consumer {})", handle.consumer_tag);

                    let stopped = tokio::select! {
                        _ = self.stop.cancelled() => true,
                        _ = handle.closed() => false,
                    };
                    if stopped {
                        handle.stop();
                        handle.closed().await;
                        break;
                    }

                    warn!("Task consumer ended, resubscribing");
                    self.settings.resubscribe_delay
                }
                Err(QueueError::NotInitialized) => {
                    warn!(
                        "Broker not connected, restarting worker in {:?}",
                        self.settings.restart_delay
                    );
                    self.settings.restart_delay
                }
                Err(e) => {
                    error!("Failed to subscribe to '{}': {}", self.settings.queue, e);
                    self.settings.resubscribe_delay
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("🎥 Transcoding worker stopped");
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let job: Job = match serde_json::from_slice(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                error!(message_id = delivery.message_id(), "Discarding unreadable task: {}", e);
                if let Err(e) = self.broker.nack(&delivery, false, false).await {
                    error!("Failed to nack task: {}", e);
                }
                return;
            }
        };

        info!(job_id = %job.id, "📦 Received transcoding job");

        match self.process_video(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, "✅ Job completed");
                if let Err(e) = self.broker.ack(&delivery).await {
                    error!(job_id = %job.id, "Failed to ack task: {}", e);
                }
            }
            Err(e) => {
                error!(job_id = %job.id, "❌ Error processing video: {}", e);
                match self
                    .broker
                    .initiate_message_retry(&delivery, &self.settings.routing_key)
                    .await
                {
                    Ok(true) => info!(job_id = %job.id, "Job scheduled for retry"),
                    Ok(false) => self.mark_failed(job.id, &e).await,
                    // The delivery is unsettled; the broker redelivers it
                    // and the job stays PROCESSING until then.
                    Err(retry_error) => {
                        error!(job_id = %job.id, "Failed to schedule retry: {}", retry_error);
                    }
                }
            }
        }
    }

    /// Runs the pipeline for `job`, then cleans up whatever the outcome.
    pub async fn process_video(&self, job: &Job) -> Result<(), JobError> {
        let job_dir = self.settings.work_dir.join(job.id.to_string());
        let result = self.run_pipeline(job, &job_dir).await;
        self.cleanup(job, &job_dir).await;
        result
    }

    async fn run_pipeline(&self, job: &Job, job_dir: &Path) -> Result<(), JobError> {
        let output_dir = job_dir.join(OUTPUT_DIR);
        tokio::fs::create_dir_all(&output_dir).await?;

        let source_url = job.source_url.as_deref().ok_or(JobError::MissingSource)?;
        let extension = file_extension_for(job.mime_type.as_deref().unwrap_or_default());
        let input = job_dir.join(format!("input{}", extension));

        let size = self
            .storage
            .download_to_file(source_url, &input)
            .await
            .map_err(JobError::Download)?;
        info!(job_id = %job.id, "⬇️ Downloaded {} bytes", size);

        let mut renditions = self.encode_renditions(&input, &output_dir).await?;
        tokio::fs::write(output_dir.join(MASTER_PLAYLIST), master_playlist(&renditions)).await?;

        let prefix = format!("{}-hls-outputs", job.id);
        let uploaded = self
            .storage
            .upload_folder(&output_dir, &prefix)
            .await
            .map_err(JobError::Upload)?;

        attach_locations(&mut renditions, &uploaded);
        for rendition in &renditions {
            debug!(
                job_id = %job.id,
                "Rendition {} at {}",
                rendition.resolution,
                rendition.url.as_deref().unwrap_or("<not uploaded>")
            );
        }

        let master = uploaded
            .iter()
            .find(|file| file.file_name == MASTER_PLAYLIST)
            .ok_or(JobError::ManifestMissing)?;

        self.jobs
            .update(job.id, JobPatch::completed(master.key.clone(), master.url.clone()))
            .await?;

        Ok(())
    }

    /// Encodes every rung concurrently and waits for all of them, so a
    /// failure never leaves an encoder writing into a removed directory.
    async fn encode_renditions(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<Vec<RenditionOutput>, JobError> {
        let results = join_all(
            RENDITION_LADDER
                .iter()
                .map(|spec| self.encoder.encode(spec, input, output_dir)),
        )
        .await;

        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(RENDITION_LADDER.iter().map(RenditionOutput::from).collect())
    }

    async fn cleanup(&self, job: &Job, job_dir: &Path) {
        match tokio::fs::remove_dir_all(job_dir).await {
            Ok(()) => debug!(job_id = %job.id, "Removed {}", job_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job.id, "Failed to remove {}: {}", job_dir.display(), e),
        }

        let Some(source_key) = job.source_key.as_deref() else {
            return;
        };

        if let Err(e) = self.storage.delete(source_key).await {
            warn!(job_id = %job.id, "Failed to delete source {}: {}", source_key, e);
        }
        if let Err(e) = self.cdn.invalidate(source_key).await {
            warn!(job_id = %job.id, "Failed to invalidate {}: {}", source_key, e);
        }
    }

    async fn mark_failed(&self, id: Uuid, cause: &JobError) {
        match self.jobs.update(id, JobPatch::failed(cause.error_info())).await {
            Ok(_) => info!(job_id = %id, "Job marked as FAILED"),
            Err(e) => error!(job_id = %id, "Failed to mark job as FAILED: {}", e),
        }
    }
}

fn attach_locations(renditions: &mut [RenditionOutput], uploaded: &[UploadedFile]) {
    for rendition in renditions {
        if let Some(file) = uploaded.iter().find(|f| f.file_name == rendition.file_name) {
            rendition.url = Some(file.url.clone());
            rendition.key = Some(file.key.clone());
        }
    }
}
