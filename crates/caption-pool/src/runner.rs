use crate::{
    batch::{BatchQueue, BatchRun, BatchSummary},
    cleanup::finalize_caption,
    notification::{BatchEvent, CaptionEvent, DownloadEvent, ModelEvent},
    payload::{
        file_label, BatchHandle, CaptionHandle, CaptionOutcome, CaptionRequest, CaptionSpec,
        DatasetStats, ExportSummary, Generated, ImportSummary, JobHandle, ModelState, Reply,
        RunnerPayload, RunnerSnapshot,
    },
    sidecar::{has_sidecar, read_sidecar, write_sidecar},
    BatchPlan, CaptionCache, JobError, JobEvent, JobStatus,
};
use file_downloader::{DownloadError, DownloadProgress, DownloadRequest, ModelFetcher};
use futures::StreamExt;
use model_catalog::{find_vision_encoder, is_image_file, scan_images, VISION_ENCODER_SOURCES};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use vlm_inference::{GenerateRequest, VisionEngine};

const CHANNEL_CAPACITY: usize = 512;
const PROGRESS_CAPACITY: usize = 64;

/// Handle to the job runner. The runner owns the inference engine, the caption
/// cache, the batch queue and the image workspace; every operation is a message
/// to its loop, so admission checks never race each other.
#[derive(Clone, Debug)]
pub struct CaptionRunner {
    tx: mpsc::Sender<RunnerPayload>,
}

struct RunningCaption {
    image: PathBuf,
    spec: CaptionSpec,
    cancel: CancellationToken,
    in_batch: bool,
    done: Option<Reply<CaptionOutcome>>,
}

struct RunnerContext {
    /// `None` while a load or caption worker holds the engine.
    engine: Option<Box<dyn VisionEngine>>,
    fetcher: Arc<dyn ModelFetcher>,
    events: mpsc::UnboundedSender<JobEvent>,
    tx: mpsc::WeakSender<RunnerPayload>,
    model: ModelState,
    pending_load: Option<Reply<()>>,
    caption: Option<RunningCaption>,
    batch: Option<BatchRun>,
    downloading: Option<String>,
    download_worker: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    cache: CaptionCache,
    images: Vec<PathBuf>,
    last_inference: Option<Duration>,
}

impl CaptionRunner {
    /// Spawn the runner loop. Must be called from within a tokio runtime.
    pub fn new<E: VisionEngine>(
        engine: E,
        fetcher: Arc<dyn ModelFetcher>,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut ctx = RunnerContext {
            engine: Some(Box::new(engine)),
            fetcher,
            events,
            tx: tx.downgrade(),
            model: ModelState::Unloaded,
            pending_load: None,
            caption: None,
            batch: None,
            downloading: None,
            download_worker: None,
            workers: vec![],
            cache: CaptionCache::new(),
            images: vec![],
            last_inference: None,
        };

        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                match payload {
                    RunnerPayload::Shutdown { reply } => {
                        ctx.shutdown(&mut rx).await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    payload => ctx.handle(payload).await,
                }
            }
            ctx.release_engine().await;
            tracing::info!("Caption runner stopped");
        });

        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> RunnerPayload,
    ) -> Result<T, JobError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| JobError::RunnerStopped)?;
        rx.await.map_err(|_| JobError::RunnerStopped)?
    }

    /// Admit a model load. The returned handle resolves once the model is resident.
    pub async fn load_model(
        &self,
        model_path: impl AsRef<Path>,
        vision_path: impl AsRef<Path>,
    ) -> Result<JobHandle<()>, JobError> {
        let (done, done_rx) = oneshot::channel();
        self.request(|reply| RunnerPayload::LoadModel {
            model_path: model_path.as_ref().to_path_buf(),
            vision_path: vision_path.as_ref().to_path_buf(),
            done,
            reply,
        })
        .await?;
        Ok(JobHandle::new(done_rx))
    }

    pub async fn unload_model(&self) -> Result<(), JobError> {
        self.request(|reply| RunnerPayload::UnloadModel { reply })
            .await
    }

    pub async fn caption(
        &self,
        image: impl AsRef<Path>,
        spec: CaptionSpec,
    ) -> Result<CaptionHandle, JobError> {
        let image = image.as_ref().to_path_buf();
        let (tokens, tokens_rx) = mpsc::unbounded_channel();
        let (done, done_rx) = oneshot::channel();
        let request = CaptionRequest {
            image: image.clone(),
            spec,
            tokens,
            done,
        };
        self.request(|reply| RunnerPayload::Caption { request, reply })
            .await?;
        Ok(CaptionHandle::new(image, tokens_rx, JobHandle::new(done_rx)))
    }

    pub async fn start_batch(
        &self,
        images: Vec<PathBuf>,
        spec: CaptionSpec,
        skip_existing: bool,
    ) -> Result<BatchHandle, JobError> {
        let (done, done_rx) = oneshot::channel();
        let plan = self
            .request(|reply| RunnerPayload::StartBatch {
                images,
                spec,
                skip_existing,
                done,
                reply,
            })
            .await?;
        Ok(BatchHandle::new(plan, JobHandle::new(done_rx)))
    }

    /// Cancel the running caption. A running batch is drained and ends after it.
    pub async fn cancel_current_caption(&self) -> Result<(), JobError> {
        self.tx
            .send(RunnerPayload::CancelCurrent)
            .await
            .map_err(|_| JobError::RunnerStopped)
    }

    /// Cancel the running caption only. A running batch moves on to its next item.
    pub async fn skip_current_item(&self) -> Result<(), JobError> {
        self.tx
            .send(RunnerPayload::SkipCurrent)
            .await
            .map_err(|_| JobError::RunnerStopped)
    }

    pub async fn download_model(
        &self,
        request: DownloadRequest,
    ) -> Result<JobHandle<PathBuf>, JobError> {
        let (done, done_rx) = oneshot::channel();
        self.request(|reply| RunnerPayload::Download {
            request,
            done,
            reply,
        })
        .await?;
        Ok(JobHandle::new(done_rx))
    }

    /// Resolves to the vision encoder in `target_dir`, downloading the first
    /// available one when none is present.
    pub async fn download_vision_encoder(
        &self,
        target_dir: impl AsRef<Path>,
        token: Option<String>,
    ) -> Result<JobHandle<PathBuf>, JobError> {
        let (done, done_rx) = oneshot::channel();
        self.request(|reply| RunnerPayload::DownloadVisionEncoder {
            target_dir: target_dir.as_ref().to_path_buf(),
            token,
            done,
            reply,
        })
        .await?;
        Ok(JobHandle::new(done_rx))
    }

    pub async fn import_images(&self, paths: Vec<PathBuf>) -> Result<ImportSummary, JobError> {
        self.request(|reply| RunnerPayload::ImportImages { paths, reply })
            .await
    }

    pub async fn import_folder(&self, dir: impl AsRef<Path>) -> Result<ImportSummary, JobError> {
        let dir = dir.as_ref().to_path_buf();
        self.request(|reply| RunnerPayload::ImportFolder { dir, reply })
            .await
    }

    pub async fn caption_for(&self, image: impl AsRef<Path>) -> Result<Option<String>, JobError> {
        let image = image.as_ref().to_path_buf();
        self.request(|reply| RunnerPayload::CaptionFor { image, reply })
            .await
    }

    pub async fn set_caption(
        &self,
        image: impl AsRef<Path>,
        text: impl Into<String>,
    ) -> Result<(), JobError> {
        let image = image.as_ref().to_path_buf();
        let text = text.into();
        self.request(|reply| RunnerPayload::SetCaption { image, text, reply })
            .await
    }

    pub async fn save_caption(
        &self,
        image: impl AsRef<Path>,
        text: impl Into<String>,
    ) -> Result<PathBuf, JobError> {
        let image = image.as_ref().to_path_buf();
        let text = text.into();
        self.request(|reply| RunnerPayload::SaveCaption { image, text, reply })
            .await
    }

    pub async fn export_all(&self) -> Result<ExportSummary, JobError> {
        self.request(|reply| RunnerPayload::ExportAll { reply })
            .await
    }

    pub async fn clear_workspace(&self) -> Result<(), JobError> {
        self.request(|reply| RunnerPayload::ClearWorkspace { reply })
            .await
    }

    pub async fn dataset_stats(&self) -> Result<DatasetStats, JobError> {
        self.request(|reply| RunnerPayload::DatasetStats { reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<RunnerSnapshot, JobError> {
        self.request(|reply| RunnerPayload::Snapshot { reply })
            .await
    }

    /// Cancel running work, join every worker and release the model.
    pub async fn shutdown(&self) -> Result<(), JobError> {
        self.request(|reply| RunnerPayload::Shutdown { reply })
            .await
    }
}

impl RunnerContext {
    fn emit(&self, event: JobEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("job event receiver dropped");
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<RunnerPayload>> {
        self.tx.upgrade()
    }

    fn is_loading(&self) -> bool {
        matches!(self.model, ModelState::Loading { .. })
    }

    fn is_generating(&self) -> bool {
        self.caption.is_some() || self.batch.is_some()
    }

    async fn handle(&mut self, payload: RunnerPayload) {
        self.workers.retain(|worker| !worker.is_finished());

        match payload {
            RunnerPayload::LoadModel {
                model_path,
                vision_path,
                done,
                reply,
            } => {
                let result = self.start_load(model_path, vision_path, done);
                let _ = reply.send(result);
            }
            RunnerPayload::UnloadModel { reply } => {
                let result = self.unload().await;
                let _ = reply.send(result);
            }
            RunnerPayload::Caption { request, reply } => {
                let result = self.admit_caption(request);
                let _ = reply.send(result);
            }
            RunnerPayload::StartBatch {
                images,
                spec,
                skip_existing,
                done,
                reply,
            } => {
                let result = self.start_batch(images, spec, skip_existing, done).await;
                let _ = reply.send(result);
            }
            RunnerPayload::CancelCurrent => {
                if let Some(batch) = self.batch.as_mut() {
                    batch.dropped = batch.queue.drain();
                    batch.cancel_requested = true;
                    tracing::info!("Batch cancel requested, {} items dropped", batch.dropped);
                }
                self.cancel_running_caption();
            }
            RunnerPayload::SkipCurrent => {
                self.cancel_running_caption();
            }
            RunnerPayload::Download {
                request,
                done,
                reply,
            } => {
                let result = self.start_download(request, done);
                let _ = reply.send(result);
            }
            RunnerPayload::DownloadVisionEncoder {
                target_dir,
                token,
                done,
                reply,
            } => {
                let result = self.start_vision_encoder_download(target_dir, token, done);
                let _ = reply.send(result);
            }
            RunnerPayload::ImportImages { paths, reply } => {
                let summary = self.import_images(paths).await;
                let _ = reply.send(Ok(summary));
            }
            RunnerPayload::ImportFolder { dir, reply } => {
                let result = match scan_images(&dir) {
                    Ok(paths) => Ok(self.import_images(paths).await),
                    Err(e) => Err(JobError::Persistence(e)),
                };
                let _ = reply.send(result);
            }
            RunnerPayload::CaptionFor { image, reply } => {
                let result = self.caption_for(image).await;
                let _ = reply.send(result);
            }
            RunnerPayload::SetCaption { image, text, reply } => {
                self.cache.insert(image, text);
                let _ = reply.send(Ok(()));
            }
            RunnerPayload::SaveCaption { image, text, reply } => {
                let result = match write_sidecar(&image, &text).await {
                    Ok(path) => {
                        self.cache.insert(image, text);
                        Ok(path)
                    }
                    Err(e) => Err(JobError::Persistence(e)),
                };
                let _ = reply.send(result);
            }
            RunnerPayload::ExportAll { reply } => {
                let summary = self.export_all().await;
                let _ = reply.send(Ok(summary));
            }
            RunnerPayload::ClearWorkspace { reply } => {
                // a batch over a cleared workspace ends as cancelled
                if let Some(batch) = self.batch.as_mut() {
                    batch.dropped = batch.queue.drain();
                    batch.cancel_requested = true;
                }
                self.cache.clear();
                self.images.clear();
                let _ = reply.send(Ok(()));
            }
            RunnerPayload::DatasetStats { reply } => {
                let stats = self.dataset_stats().await;
                let _ = reply.send(Ok(stats));
            }
            RunnerPayload::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            RunnerPayload::LoadFinished {
                engine,
                model_path,
                vision_path,
                result,
            } => {
                self.finish_load(engine, model_path, vision_path, result);
            }
            RunnerPayload::CaptionFinished {
                engine,
                image,
                generated,
                elapsed,
            } => {
                self.finish_caption(engine, image, generated, elapsed).await;
            }
            RunnerPayload::DownloadFinished { result, done } => {
                self.downloading = None;
                self.download_worker = None;
                let _ = done.send(result);
            }
            RunnerPayload::Shutdown { reply } => {
                // handled by the loop itself
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn start_load(
        &mut self,
        model_path: PathBuf,
        vision_path: PathBuf,
        done: Reply<()>,
    ) -> Result<(), JobError> {
        if self.is_loading() {
            return Err(JobError::Busy("a model is already loading"));
        }
        if self.is_generating() {
            return Err(JobError::Busy("captioning in progress"));
        }
        if !model_path.is_file() {
            return Err(JobError::ModelLoad(format!(
                "Model file not found: {}",
                model_path.display()
            )));
        }
        if !vision_path.is_file() {
            return Err(JobError::ModelLoad(format!(
                "Vision encoder file not found: {}",
                vision_path.display()
            )));
        }

        let (mut engine, tx) = match (self.engine.take(), self.sender()) {
            (Some(engine), Some(tx)) => (engine, tx),
            (engine, _) => {
                self.engine = engine;
                return Err(JobError::RunnerStopped);
            }
        };

        tracing::info!("Model load started: {}", model_path.display());
        self.model = ModelState::Loading {
            model_path: model_path.clone(),
        };
        self.pending_load = Some(done);
        self.emit(JobEvent::Model(ModelEvent::Loading {
            model_path: model_path.clone(),
        }));

        let worker = tokio::spawn(async move {
            let started = Instant::now();
            let mut result = async {
                // exactly one model resident at a time
                engine.unload().await?;
                engine.load(&model_path, &vision_path).await?;
                Ok::<_, anyhow::Error>(started.elapsed())
            }
            .await;

            if result.is_err() {
                if let Err(e) = engine.unload().await {
                    tracing::error!("Failed to release engine after load error: {}", e);
                    result = result.map_err(|load_err: anyhow::Error| load_err.context(e));
                }
            }

            if let Err(e) = tx
                .send(RunnerPayload::LoadFinished {
                    engine,
                    model_path,
                    vision_path,
                    result,
                })
                .await
            {
                tracing::error!("Failed to send load finished: {}", e);
            }
        });
        self.workers.push(worker);

        Ok(())
    }

    fn finish_load(
        &mut self,
        engine: Box<dyn VisionEngine>,
        model_path: PathBuf,
        vision_path: PathBuf,
        result: anyhow::Result<Duration>,
    ) {
        self.engine = Some(engine);
        let done = self.pending_load.take();

        let result = match result {
            Ok(elapsed) => {
                tracing::info!("Model loaded: {} {:?}", model_path.display(), elapsed);
                self.model = ModelState::Loaded {
                    model_path: model_path.clone(),
                    vision_path: vision_path.clone(),
                };
                self.emit(JobEvent::Model(ModelEvent::Loaded {
                    model_path,
                    vision_path,
                    elapsed,
                }));
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!("Model load failed: {}", message);
                self.model = ModelState::Unloaded;
                self.emit(JobEvent::Model(ModelEvent::Failed {
                    message: message.clone(),
                }));
                Err(JobError::ModelLoad(message))
            }
        };

        if let Some(done) = done {
            let _ = done.send(result);
        }
    }

    async fn unload(&mut self) -> Result<(), JobError> {
        if self.is_generating() {
            return Err(JobError::Busy("cannot unload while captioning"));
        }
        if self.is_loading() {
            return Err(JobError::Busy("a model is loading"));
        }

        let Some(engine) = self.engine.as_mut() else {
            return Err(JobError::RunnerStopped);
        };
        if !self.model.is_loaded() && !engine.is_loaded() {
            return Ok(());
        }

        match engine.unload().await {
            Ok(()) => {
                tracing::info!("Model unloaded");
                self.model = ModelState::Unloaded;
                self.emit(JobEvent::Model(ModelEvent::Unloaded));
                Ok(())
            }
            Err(e) => {
                let message = format!("failed to unload model: {:#}", e);
                tracing::error!("{}", message);
                if !engine.is_loaded() {
                    self.model = ModelState::Unloaded;
                }
                Err(JobError::ModelLoad(message))
            }
        }
    }

    fn check_caption_admission(&self) -> Result<(), JobError> {
        if self.is_loading() {
            return Err(JobError::Busy("a model is loading"));
        }
        if self.is_generating() {
            return Err(JobError::Busy("a caption job is already running"));
        }
        if !self.model.is_loaded() {
            return Err(JobError::ModelNotLoaded);
        }
        Ok(())
    }

    fn admit_caption(&mut self, request: CaptionRequest) -> Result<(), JobError> {
        self.check_caption_admission()?;
        let CaptionRequest {
            image,
            spec,
            tokens,
            done,
        } = request;
        self.spawn_caption(image, spec, Some(tokens), Some(done), false)
    }

    fn spawn_caption(
        &mut self,
        image: PathBuf,
        spec: CaptionSpec,
        tokens: Option<mpsc::UnboundedSender<String>>,
        done: Option<Reply<CaptionOutcome>>,
        in_batch: bool,
    ) -> Result<(), JobError> {
        let (mut engine, tx) = match (self.engine.take(), self.sender()) {
            (Some(engine), Some(tx)) => (engine, tx),
            (engine, _) => {
                self.engine = engine;
                return Err(JobError::RunnerStopped);
            }
        };

        let cancel = CancellationToken::new();
        let request = GenerateRequest {
            image_path: image.clone(),
            prompt: spec.prompt.clone(),
            params: spec.params.clamped(),
        };

        tracing::info!("Caption started: {}", image.display());
        self.emit(JobEvent::Caption(CaptionEvent::Started {
            image: image.clone(),
        }));

        let events = self.events.clone();
        let worker_cancel = cancel.clone();
        let worker_image = image.clone();
        let worker = tokio::spawn(async move {
            let started = Instant::now();
            let generated =
                generate_caption(&mut engine, request, &worker_cancel, tokens, &events).await;
            let elapsed = started.elapsed();

            if let Err(e) = tx
                .send(RunnerPayload::CaptionFinished {
                    engine,
                    image: worker_image,
                    generated,
                    elapsed,
                })
                .await
            {
                tracing::error!("Failed to send caption finished: {}", e);
            }
        });
        self.workers.push(worker);

        self.caption = Some(RunningCaption {
            image,
            spec,
            cancel,
            in_batch,
            done,
        });

        Ok(())
    }

    fn cancel_running_caption(&self) {
        if let Some(caption) = &self.caption {
            caption.cancel.cancel();
            tracing::info!("Caption cancelled: {}", caption.image.display());
        }
    }

    async fn finish_caption(
        &mut self,
        engine: Box<dyn VisionEngine>,
        image: PathBuf,
        generated: Generated,
        elapsed: Duration,
    ) {
        self.engine = Some(engine);
        self.last_inference = Some(elapsed);

        let Some(running) = self.caption.take() else {
            tracing::error!("caption finished without a running job: {}", image.display());
            return;
        };

        let mut failure = None;
        let result = match generated {
            Generated::Done { raw } => {
                let caption = finalize_caption(&raw, &running.spec.prefix, &running.spec.suffix);
                tracing::info!("Caption finished: {} {:?}", image.display(), elapsed);
                self.cache.insert(image.clone(), caption.clone());
                self.emit(JobEvent::Caption(CaptionEvent::Finished {
                    image: image.clone(),
                    caption: caption.clone(),
                    elapsed,
                }));
                if running.spec.auto_save {
                    self.auto_save(&image, &caption).await;
                }
                Ok(CaptionOutcome {
                    image,
                    status: JobStatus::Done,
                    text: caption,
                    elapsed,
                })
            }
            Generated::Cancelled { partial } => {
                let partial = partial.trim().to_string();
                self.emit(JobEvent::Caption(CaptionEvent::Cancelled {
                    image: image.clone(),
                    partial: partial.clone(),
                }));
                Ok(CaptionOutcome {
                    image,
                    status: JobStatus::Cancelled,
                    text: partial,
                    elapsed,
                })
            }
            Generated::Failed { message } => {
                tracing::error!("Caption failed: {} {}", image.display(), message);
                self.emit(JobEvent::Caption(CaptionEvent::Failed {
                    image,
                    message: message.clone(),
                }));
                failure = Some(message.clone());
                Err(JobError::Generation(message))
            }
        };

        let status = match &result {
            Ok(outcome) => outcome.status,
            Err(_) => JobStatus::Failed,
        };

        if let Some(done) = running.done {
            let _ = done.send(result);
        }

        if running.in_batch {
            self.advance_batch(status, failure);
        }
    }

    async fn auto_save(&mut self, image: &Path, caption: &str) {
        match write_sidecar(image, caption).await {
            Ok(path) => self.emit(JobEvent::Caption(CaptionEvent::Saved {
                image: image.to_path_buf(),
                path,
            })),
            Err(e) => {
                tracing::error!("Failed to save caption {}: {}", image.display(), e);
                self.emit(JobEvent::Caption(CaptionEvent::SaveFailed {
                    image: image.to_path_buf(),
                    message: e.to_string(),
                }));
            }
        }
    }

    async fn start_batch(
        &mut self,
        images: Vec<PathBuf>,
        spec: CaptionSpec,
        skip_existing: bool,
        done: Reply<BatchSummary>,
    ) -> Result<BatchPlan, JobError> {
        self.check_caption_admission()?;
        if images.is_empty() {
            return Err(JobError::NothingToCaption);
        }

        let mut queued = Vec::with_capacity(images.len());
        let mut skipped = 0;
        for image in images {
            if skip_existing && (self.cache.contains(&image) || has_sidecar(&image).await) {
                skipped += 1;
            } else {
                queued.push(image);
            }
        }

        let plan = BatchPlan {
            queued: queued.len(),
            skipped,
        };

        if queued.is_empty() {
            tracing::info!("Batch skipped, all {} images captioned", skipped);
            self.emit(JobEvent::Batch(BatchEvent::AllSkipped { skipped }));
            let _ = done.send(Ok(BatchSummary {
                status: JobStatus::Done,
                consumed: 0,
                captioned: 0,
                remaining: 0,
            }));
            return Ok(plan);
        }

        if skipped > 0 {
            self.emit(JobEvent::Batch(BatchEvent::Skipped { skipped }));
        }
        tracing::info!("Batch started: {} queued {} skipped", plan.queued, skipped);
        self.emit(JobEvent::Batch(BatchEvent::Started {
            queued: plan.queued,
            skipped,
        }));

        self.batch = Some(BatchRun {
            queue: BatchQueue::new(queued),
            spec,
            total: plan.queued,
            dispatched: 0,
            captioned: 0,
            dropped: 0,
            cancel_requested: false,
            done,
        });
        self.dispatch_next();

        Ok(plan)
    }

    /// Start the next queued item, or close the batch when the queue is empty.
    fn dispatch_next(&mut self) {
        let Some(batch) = self.batch.as_mut() else {
            return;
        };

        let Some(image) = batch.queue.pop_front() else {
            if let Some(batch) = self.batch.take() {
                tracing::info!("Batch complete: {} images captioned", batch.dispatched);
                self.emit(JobEvent::Batch(BatchEvent::Completed {
                    completed: batch.dispatched,
                }));
                let summary = batch.summary(JobStatus::Done);
                let _ = batch.done.send(Ok(summary));
            }
            return;
        };

        batch.dispatched += 1;
        let (index, total, spec) = (batch.dispatched, batch.total, batch.spec.clone());
        self.emit(JobEvent::Batch(BatchEvent::Progress {
            index,
            total,
            image: image.clone(),
        }));

        if let Err(e) = self.spawn_caption(image, spec, None, None, true) {
            if let Some(batch) = self.batch.take() {
                self.emit(JobEvent::Batch(BatchEvent::Halted {
                    completed: batch.captioned,
                    remaining: batch.queue.len(),
                    message: e.to_string(),
                }));
                let _ = batch.done.send(Err(e));
            }
        }
    }

    fn advance_batch(&mut self, status: JobStatus, failure: Option<String>) {
        let Some(batch) = self.batch.as_mut() else {
            return;
        };

        match status {
            JobStatus::Done => batch.captioned += 1,
            JobStatus::Failed => {
                if let Some(batch) = self.batch.take() {
                    let remaining = batch.queue.len();
                    let message = failure.unwrap_or_default();
                    tracing::error!(
                        "Batch halted: {} captioned {} remaining",
                        batch.captioned,
                        remaining
                    );
                    self.emit(JobEvent::Batch(BatchEvent::Halted {
                        completed: batch.captioned,
                        remaining,
                        message,
                    }));
                    let summary = batch.summary(JobStatus::Failed);
                    let _ = batch.done.send(Ok(summary));
                }
                return;
            }
            // a cancelled item still counts as consumed
            _ => {}
        }

        if batch.cancel_requested {
            if let Some(batch) = self.batch.take() {
                tracing::info!("Batch cancelled: {} captioned", batch.captioned);
                self.emit(JobEvent::Batch(BatchEvent::Cancelled {
                    completed: batch.captioned,
                    dropped: batch.dropped,
                }));
                let summary = batch.summary(JobStatus::Cancelled);
                let _ = batch.done.send(Ok(summary));
            }
            return;
        }

        self.dispatch_next();
    }

    fn check_download_admission(&self) -> Result<(), JobError> {
        match &self.downloading {
            Some(_) => Err(JobError::Busy("a download is already running")),
            None => Ok(()),
        }
    }

    fn start_download(
        &mut self,
        request: DownloadRequest,
        done: Reply<PathBuf>,
    ) -> Result<(), JobError> {
        self.check_download_admission()?;
        let target = request.target_path();
        if target.exists() {
            return Err(JobError::AlreadyExists(target));
        }
        let tx = self.sender().ok_or(JobError::RunnerStopped)?;

        self.downloading = Some(request.filename.clone());
        let fetcher = self.fetcher.clone();
        let events = self.events.clone();
        self.download_worker = Some(tokio::spawn(async move {
            let result = fetch_one(fetcher.as_ref(), &request, &events, false)
                .await
                .map_err(JobError::from);

            if let Err(e) = tx
                .send(RunnerPayload::DownloadFinished { result, done })
                .await
            {
                tracing::error!("Failed to send download finished: {}", e);
            }
        }));

        Ok(())
    }

    fn start_vision_encoder_download(
        &mut self,
        target_dir: PathBuf,
        token: Option<String>,
        done: Reply<PathBuf>,
    ) -> Result<(), JobError> {
        if let Some(existing) = find_vision_encoder(&target_dir) {
            tracing::info!("Vision encoder found: {}", existing.display());
            let _ = done.send(Ok(existing));
            return Ok(());
        }

        self.check_download_admission()?;
        let tx = self.sender().ok_or(JobError::RunnerStopped)?;

        self.downloading = Some("vision encoder".to_string());
        let fetcher = self.fetcher.clone();
        let events = self.events.clone();
        self.download_worker = Some(tokio::spawn(async move {
            let mut auth_failed = false;
            let mut last_error: Option<DownloadError> = None;
            let mut found = None;

            for source in VISION_ENCODER_SOURCES.iter() {
                let request = DownloadRequest::new(source.repo_id, source.filename, &target_dir)
                    .with_token(token.clone());
                match fetch_one(fetcher.as_ref(), &request, &events, true).await {
                    Ok(path) | Err(DownloadError::AlreadyExists(path)) => {
                        found = Some(path);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Vision encoder source failed: {} {}", source.filename, e);
                        auth_failed |= e.is_auth();
                        last_error = Some(e);
                    }
                }
            }

            let result = match (found, last_error) {
                (Some(path), _) => Ok(path),
                (None, Some(e)) if auth_failed && !e.is_auth() => {
                    Err(JobError::Auth(e.to_string()))
                }
                (None, Some(e)) => Err(JobError::from(e)),
                (None, None) => Err(JobError::Download("no vision encoder source".to_string())),
            };

            if let Err(e) = tx
                .send(RunnerPayload::DownloadFinished { result, done })
                .await
            {
                tracing::error!("Failed to send download finished: {}", e);
            }
        }));

        Ok(())
    }

    async fn import_images(&mut self, paths: Vec<PathBuf>) -> ImportSummary {
        let mut summary = ImportSummary::default();

        for path in paths {
            if !is_image_file(&path) || self.images.contains(&path) {
                summary.ignored += 1;
                continue;
            }

            match read_sidecar(&path).await {
                Ok(Some(caption)) => {
                    self.cache.insert(path.clone(), caption);
                    summary.with_captions += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to read caption for {}: {}", path.display(), e);
                }
            }

            self.images.push(path);
            summary.added += 1;
        }

        tracing::info!(
            "Images imported: {} added {} captioned",
            summary.added,
            summary.with_captions
        );
        summary
    }

    async fn caption_for(&mut self, image: PathBuf) -> Result<Option<String>, JobError> {
        if let Some(caption) = self.cache.get(&image) {
            return Ok(Some(caption.to_string()));
        }

        let caption = read_sidecar(&image).await?;
        if let Some(caption) = &caption {
            self.cache.insert(image, caption.clone());
        }
        Ok(caption)
    }

    async fn export_all(&mut self) -> ExportSummary {
        let mut summary = ExportSummary::default();

        for (image, caption) in self.cache.iter() {
            match write_sidecar(image, caption).await {
                Ok(_) => summary.written += 1,
                Err(e) => {
                    tracing::error!("Failed to export caption {}: {}", image.display(), e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn dataset_stats(&mut self) -> DatasetStats {
        let mut captioned = 0;
        for image in &self.images {
            let cached = self.cache.get(image).map_or(false, |c| !c.is_empty());
            if cached || has_sidecar(image).await {
                captioned += 1;
            }
        }
        DatasetStats::new(self.images.len(), captioned)
    }

    fn snapshot(&self) -> RunnerSnapshot {
        RunnerSnapshot {
            model: self.model.clone(),
            captioning: self.caption.as_ref().map(|c| c.image.clone()),
            batch: self.batch.as_ref().map(BatchRun::progress),
            downloading: self.downloading.clone(),
            last_inference: self.last_inference,
            images: self.images.len(),
            cached_captions: self.cache.len(),
        }
    }

    async fn shutdown(&mut self, rx: &mut mpsc::Receiver<RunnerPayload>) {
        tracing::info!("Caption runner shutting down");

        if let Some(batch) = self.batch.as_mut() {
            batch.dropped = batch.queue.drain();
            batch.cancel_requested = true;
        }
        self.cancel_running_caption();

        // downloads cannot be cancelled cooperatively
        if let Some(download) = self.download_worker.take() {
            download.abort();
        }
        self.downloading = None;

        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.await {
                tracing::error!("Worker failed: {}", e);
            }
        }

        // collect results, and the engine, from workers that finished in the meantime
        while let Ok(payload) = rx.try_recv() {
            match payload {
                payload @ (RunnerPayload::LoadFinished { .. }
                | RunnerPayload::CaptionFinished { .. }
                | RunnerPayload::DownloadFinished { .. }) => self.handle(payload).await,
                _ => {}
            }
        }

        self.release_engine().await;
    }

    async fn release_engine(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            if engine.is_loaded() {
                match engine.unload().await {
                    Ok(()) => self.emit(JobEvent::Model(ModelEvent::Unloaded)),
                    Err(e) => tracing::error!("Failed to unload model: {}", e),
                }
            }
        }
        self.model = ModelState::Unloaded;
    }
}

/// Stream one generation, checking for cancellation before every token.
async fn generate_caption(
    engine: &mut Box<dyn VisionEngine>,
    request: GenerateRequest,
    cancel: &CancellationToken,
    tokens: Option<mpsc::UnboundedSender<String>>,
    events: &mpsc::UnboundedSender<JobEvent>,
) -> Generated {
    let image = request.image_path.clone();

    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Generated::Cancelled { partial: String::new() };
        }
        result = engine.generate(request) => match result {
            Ok(stream) => stream,
            Err(e) => return Generated::Failed { message: format!("{:#}", e) },
        },
    };

    let mut text = String::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Generated::Cancelled { partial: text };
            }
            next = stream.next() => match next {
                Some(Ok(piece)) => {
                    text.push_str(&piece);
                    if let Some(tokens) = &tokens {
                        let _ = tokens.send(piece.clone());
                    }
                    let _ = events.send(JobEvent::Caption(CaptionEvent::Token {
                        image: image.clone(),
                        text: piece,
                    }));
                }
                Some(Err(e)) => {
                    return Generated::Failed { message: format!("{:#}", e) };
                }
                None => return Generated::Done { raw: text },
            },
        }
    }
}

/// Run one fetch, turning its progress and outcome into download events.
/// With `existing_ok`, a target that is already on disk is reported as finished.
async fn fetch_one(
    fetcher: &dyn ModelFetcher,
    request: &DownloadRequest,
    events: &mpsc::UnboundedSender<JobEvent>,
    existing_ok: bool,
) -> Result<PathBuf, DownloadError> {
    tracing::info!("Download started: {} {}", request.repo_id, request.filename);
    let _ = events.send(JobEvent::Download(DownloadEvent::Started {
        repo_id: request.repo_id.clone(),
        filename: request.filename.clone(),
    }));

    let (progress_tx, mut progress_rx) = mpsc::channel::<DownloadProgress>(PROGRESS_CAPACITY);
    let progress_events = events.clone();
    let filename = request.filename.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            let _ = progress_events.send(JobEvent::Download(DownloadEvent::Progress {
                filename: filename.clone(),
                downloaded_bytes: progress.downloaded_bytes,
                total_bytes: progress.total_bytes,
            }));
        }
    });

    let result = fetcher.fetch(request, progress_tx).await;
    if let Err(e) = forwarder.await {
        tracing::error!("Progress forwarder failed: {}", e);
    }

    match &result {
        Err(DownloadError::AlreadyExists(path)) if existing_ok => {
            tracing::info!("Already downloaded: {}", path.display());
            let _ = events.send(JobEvent::Download(DownloadEvent::Finished {
                path: path.clone(),
            }));
        }
        Ok(path) => {
            tracing::info!("Download finished: {}", path.display());
            let _ = events.send(JobEvent::Download(DownloadEvent::Finished {
                path: path.clone(),
            }));
        }
        Err(e) => {
            tracing::error!("Download failed: {} {}", request.filename, e);
            let _ = events.send(JobEvent::Download(DownloadEvent::Failed {
                filename: file_label(&request.target_path()),
                message: e.to_string(),
                auth: e.is_auth(),
            }));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, FakeFetcher, FetchReply, Script};
    use std::sync::atomic::Ordering;

    fn model_files(dir: &Path) -> (PathBuf, PathBuf) {
        let model = dir.join("model.Q4_K_M.gguf");
        let vision = dir.join("model.mmproj-f16.gguf");
        std::fs::write(&model, b"gguf").unwrap();
        std::fs::write(&vision, b"gguf").unwrap();
        (model, vision)
    }

    fn spec() -> CaptionSpec {
        CaptionSpec {
            prompt: "Describe this image.".into(),
            ..Default::default()
        }
    }

    fn images(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                std::fs::write(&path, b"img").unwrap();
                path
            })
            .collect()
    }

    async fn loaded_runner(
        engine: FakeEngine,
        fetcher: FakeFetcher,
        dir: &Path,
    ) -> (CaptionRunner, mpsc::UnboundedReceiver<JobEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let runner = CaptionRunner::new(engine, Arc::new(fetcher), events);
        let (model, vision) = model_files(dir);
        runner
            .load_model(&model, &vision)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        (runner, rx)
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<JobEvent>,
        matches: impl Fn(&JobEvent) -> bool,
    ) -> JobEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel open");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event before timeout")
    }

    #[test_log::test(tokio::test)]
    async fn test_caption_streams_tokens_and_cleans_output() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new(Script::Tokens(vec!["Caption: ", "a red ", "barn."]));
        let (runner, _events) = loaded_runner(engine, FakeFetcher::default(), dir.path()).await;
        let image = images(dir.path(), &["barn.png"]).remove(0);

        let mut handle = runner
            .caption(
                &image,
                CaptionSpec {
                    prefix: " sks ".into(),
                    suffix: "rural".into(),
                    ..spec()
                },
            )
            .await
            .unwrap();

        let mut tokens = vec![];
        while let Some(token) = handle.next_token().await {
            tokens.push(token);
        }
        assert_eq!(tokens, vec!["Caption: ", "a red ", "barn."]);

        let outcome = handle.finish().await.unwrap();
        assert_eq!(outcome.status, JobStatus::Done);
        assert_eq!(outcome.text, "sks a red barn. rural");
        assert_eq!(
            runner.caption_for(&image).await.unwrap().as_deref(),
            Some("sks a red barn. rural")
        );
        // no auto-save requested
        assert!(!has_sidecar(&image).await);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_mid_stream_returns_partial_text() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new(Script::Hang(vec!["A ", "photo ", "of ", "a "]));
        let (runner, _events) = loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let mut handle = runner.caption(dir.path().join("p.png"), spec()).await.unwrap();
        let mut partial = String::new();
        while partial != "A photo of a " {
            partial.push_str(&handle.next_token().await.unwrap());
        }

        runner.cancel_current_caption().await.unwrap();
        let outcome = handle.finish().await.unwrap();
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.text, "A photo of a");

        // partial text is not cached and the engine is free again
        assert_eq!(
            runner.caption_for(dir.path().join("p.png")).await.unwrap(),
            None
        );
        assert!(runner.snapshot().await.unwrap().captioning.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_unload_while_captioning_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new(Script::Hang(vec!["A "]));
        let loaded = engine.loaded.clone();
        let (runner, _events) = loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let mut handle = runner.caption(dir.path().join("a.png"), spec()).await.unwrap();
        assert_eq!(handle.next_token().await.as_deref(), Some("A "));

        assert!(matches!(
            runner.unload_model().await,
            Err(JobError::Busy(_))
        ));
        assert!(matches!(
            runner.caption(dir.path().join("b.png"), spec()).await,
            Err(JobError::Busy(_))
        ));
        let (model, vision) = model_files(dir.path());
        assert!(matches!(
            runner.load_model(&model, &vision).await,
            Err(JobError::Busy(_))
        ));
        assert!(runner.snapshot().await.unwrap().model.is_loaded());
        assert!(loaded.load(Ordering::SeqCst));

        runner.cancel_current_caption().await.unwrap();
        assert_eq!(handle.finish().await.unwrap().status, JobStatus::Cancelled);

        runner.unload_model().await.unwrap();
        assert!(!loaded.load(Ordering::SeqCst));
        // idempotent
        runner.unload_model().await.unwrap();
        assert_eq!(runner.snapshot().await.unwrap().model, ModelState::Unloaded);
    }

    #[test_log::test(tokio::test)]
    async fn test_admission_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = mpsc::unbounded_channel();
        let engine = FakeEngine::new(Script::Tokens(vec!["x"]));
        let runner = CaptionRunner::new(engine, Arc::new(FakeFetcher::default()), events);

        assert!(matches!(
            runner.caption(dir.path().join("a.png"), spec()).await,
            Err(JobError::ModelNotLoaded)
        ));

        let (model, _) = model_files(dir.path());
        let err = runner
            .load_model(&model, dir.path().join("missing-mmproj.gguf"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ModelLoad(_)));
        assert!(err.to_string().contains("Vision encoder file not found"));

        let (model, vision) = model_files(dir.path());
        runner
            .load_model(&model, &vision)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(matches!(
            runner.start_batch(vec![], spec(), false).await,
            Err(JobError::NothingToCaption)
        ));

        runner.shutdown().await.unwrap();
        assert!(matches!(
            runner.snapshot().await,
            Err(JobError::RunnerStopped)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_load_reports_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut engine = FakeEngine::new(Script::Tokens(vec![]));
        engine.fail_load = true;
        let runner = CaptionRunner::new(engine, Arc::new(FakeFetcher::default()), events);

        let (model, vision) = model_files(dir.path());
        let err = runner
            .load_model(&model, &vision)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ModelLoad(_)));
        wait_for(&mut rx, |e| matches!(e, JobEvent::Model(ModelEvent::Failed { .. }))).await;
        assert_eq!(runner.snapshot().await.unwrap().model, ModelState::Unloaded);
    }

    #[test_log::test(tokio::test)]
    async fn test_batch_skips_existing_and_keeps_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new(Script::Tokens(vec!["1girl, ", "solo"]));
        let generated = engine.generated.clone();
        let (runner, mut events) =
            loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let batch = images(dir.path(), &["e.png", "a.png", "d.png", "b.png", "c.png"]);
        std::fs::write(dir.path().join("a.txt"), "old caption").unwrap();
        runner.set_caption(&batch[3], "edited").await.unwrap();

        let handle = runner
            .start_batch(
                batch.clone(),
                CaptionSpec {
                    auto_save: true,
                    ..spec()
                },
                true,
            )
            .await
            .unwrap();
        assert_eq!(handle.plan, BatchPlan { queued: 3, skipped: 2 });

        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.status, JobStatus::Done);
        assert_eq!(summary.consumed, 3);
        assert_eq!(summary.captioned, 3);

        let expected = vec![batch[0].clone(), batch[2].clone(), batch[4].clone()];
        assert_eq!(*generated.lock().unwrap(), expected);
        for image in &expected {
            assert_eq!(
                read_sidecar(image).await.unwrap().as_deref(),
                Some("1girl, solo")
            );
        }
        assert_eq!(
            read_sidecar(&batch[1]).await.unwrap().as_deref(),
            Some("old caption")
        );

        let skipped = wait_for(&mut events, |e| {
            matches!(e, JobEvent::Batch(BatchEvent::Skipped { .. }))
        })
        .await;
        assert_eq!(
            skipped.message().as_deref(),
            Some("Skipping 2 images that already have captions")
        );
        let mut indexes = vec![];
        loop {
            match wait_for(&mut events, |e| matches!(e, JobEvent::Batch(_))).await {
                JobEvent::Batch(BatchEvent::Progress { index, total, .. }) => {
                    assert_eq!(total, 3);
                    indexes.push(index);
                }
                JobEvent::Batch(BatchEvent::Completed { completed }) => {
                    assert_eq!(completed, 3);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[test_log::test(tokio::test)]
    async fn test_batch_all_skipped_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new(Script::Tokens(vec!["x"]));
        let generated = engine.generated.clone();
        let (runner, mut events) =
            loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let batch = images(dir.path(), &["a.png", "b.png"]);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();

        let handle = runner.start_batch(batch, spec(), true).await.unwrap();
        assert_eq!(handle.plan, BatchPlan { queued: 0, skipped: 2 });
        assert_eq!(handle.wait().await.unwrap().consumed, 0);

        let event = wait_for(&mut events, |e| matches!(e, JobEvent::Batch(_))).await;
        assert_eq!(
            event.message().as_deref(),
            Some("All 2 images already have .txt captions.")
        );
        assert!(generated.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_batch_halts_on_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new(Script::Tokens(vec!["ok"]))
            .with_script("b.png", Script::Fail(vec!["par"]));
        let generated = engine.generated.clone();
        let (runner, mut events) =
            loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let batch = images(dir.path(), &["a.png", "b.png", "c.png", "d.png"]);
        let summary = runner
            .start_batch(batch.clone(), spec(), false)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Failed);
        assert_eq!(summary.captioned, 1);
        assert_eq!(summary.remaining, 2);
        assert_eq!(generated.lock().unwrap().len(), 2);

        match wait_for(&mut events, |e| {
            matches!(e, JobEvent::Batch(BatchEvent::Halted { .. }))
        })
        .await
        {
            JobEvent::Batch(BatchEvent::Halted {
                completed,
                remaining,
                message,
            }) => {
                assert_eq!((completed, remaining), (1, 2));
                assert!(message.contains("engine fault"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(runner.caption_for(&batch[1]).await.unwrap(), None);
        assert!(runner.snapshot().await.unwrap().batch.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_skipped_item_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            FakeEngine::new(Script::Tokens(vec!["done"])).with_script("b.png", Script::Hang(vec![]));
        let (runner, mut events) =
            loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let batch = images(dir.path(), &["a.png", "b.png", "c.png"]);
        let handle = runner.start_batch(batch.clone(), spec(), false).await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e, JobEvent::Batch(BatchEvent::Progress { index: 2, .. }))
        })
        .await;
        runner.skip_current_item().await.unwrap();

        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.status, JobStatus::Done);
        assert_eq!(summary.consumed, 3);
        assert_eq!(summary.captioned, 2);
        assert_eq!(runner.caption_for(&batch[1]).await.unwrap(), None);
        assert_eq!(
            runner.caption_for(&batch[2]).await.unwrap().as_deref(),
            Some("done")
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_drains_batch() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            FakeEngine::new(Script::Tokens(vec!["done"])).with_script("b.png", Script::Hang(vec![]));
        let generated = engine.generated.clone();
        let (runner, mut events) =
            loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let batch = images(dir.path(), &["a.png", "b.png", "c.png", "d.png"]);
        let handle = runner.start_batch(batch, spec(), false).await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e, JobEvent::Batch(BatchEvent::Progress { index: 2, .. }))
        })
        .await;
        runner.cancel_current_caption().await.unwrap();

        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.status, JobStatus::Cancelled);
        assert_eq!(summary.consumed, 2);
        assert_eq!(summary.captioned, 1);
        assert_eq!(summary.remaining, 0);
        assert_eq!(generated.lock().unwrap().len(), 2);

        let event = wait_for(&mut events, |e| {
            matches!(e, JobEvent::Batch(BatchEvent::Cancelled { .. }))
        })
        .await;
        assert!(matches!(
            event,
            JobEvent::Batch(BatchEvent::Cancelled {
                completed: 1,
                dropped: 2
            })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_clear_workspace_mid_batch_ends_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new(Script::Tokens(vec!["done"])).with_script(
            "b.png",
            Script::Delayed(Duration::from_millis(200), vec!["late"]),
        );
        let generated = engine.generated.clone();
        let (runner, mut events) =
            loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let batch = images(dir.path(), &["a.png", "b.png", "c.png", "d.png"]);
        runner.import_images(batch.clone()).await.unwrap();
        let handle = runner.start_batch(batch, spec(), false).await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e, JobEvent::Batch(BatchEvent::Progress { index: 2, .. }))
        })
        .await;
        runner.clear_workspace().await.unwrap();

        // the running item finishes, the rest is dropped
        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.status, JobStatus::Cancelled);
        assert_eq!(summary.consumed, 2);
        assert_eq!(summary.captioned, 2);
        assert_eq!(summary.remaining, 0);
        assert_eq!(generated.lock().unwrap().len(), 2);

        let event = wait_for(&mut events, |e| {
            matches!(
                e,
                JobEvent::Batch(BatchEvent::Cancelled { .. } | BatchEvent::Completed { .. })
            )
        })
        .await;
        assert!(matches!(
            event,
            JobEvent::Batch(BatchEvent::Cancelled {
                completed: 2,
                dropped: 2
            })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_second_load_while_loading_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = mpsc::unbounded_channel();
        let mut engine = FakeEngine::new(Script::Tokens(vec![]));
        engine.load_delay = Duration::from_millis(300);
        let runner = CaptionRunner::new(engine, Arc::new(FakeFetcher::default()), events);
        let (model, vision) = model_files(dir.path());

        let first = runner.load_model(&model, &vision).await.unwrap();
        assert!(matches!(
            runner.load_model(&model, &vision).await,
            Err(JobError::Busy(_))
        ));

        first.wait().await.unwrap();
        assert!(matches!(
            runner.snapshot().await.unwrap().model,
            ModelState::Loaded { .. }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_second_download_while_downloading_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default().with_delay(Duration::from_millis(300));
        let (events, _rx) = mpsc::unbounded_channel();
        let runner = CaptionRunner::new(
            FakeEngine::new(Script::Tokens(vec![])),
            Arc::new(fetcher),
            events,
        );

        let first = runner
            .download_model(DownloadRequest::new("org/repo", "a.gguf", dir.path()))
            .await
            .unwrap();
        assert!(matches!(
            runner
                .download_model(DownloadRequest::new("org/repo", "b.gguf", dir.path()))
                .await,
            Err(JobError::Busy(_))
        ));
        assert!(matches!(
            runner.download_vision_encoder(dir.path(), None).await,
            Err(JobError::Busy(_))
        ));

        first.wait().await.unwrap();
        let path = runner
            .download_model(DownloadRequest::new("org/repo", "b.gguf", dir.path()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("b.gguf"));
    }

    #[test_log::test(tokio::test)]
    async fn test_download_errors_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .with_reply("gated.gguf", FetchReply::Unauthorized)
            .with_reply("broken.gguf", FetchReply::ServerError);
        let (events, mut rx) = mpsc::unbounded_channel();
        let runner = CaptionRunner::new(
            FakeEngine::new(Script::Tokens(vec![])),
            Arc::new(fetcher),
            events,
        );

        let err = runner
            .download_model(DownloadRequest::new("org/repo", "gated.gguf", dir.path()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Auth(_)));
        let failed = wait_for(&mut rx, |e| {
            matches!(e, JobEvent::Download(DownloadEvent::Failed { .. }))
        })
        .await;
        assert!(matches!(
            failed,
            JobEvent::Download(DownloadEvent::Failed { auth: true, .. })
        ));

        let err = runner
            .download_model(DownloadRequest::new("org/repo", "broken.gguf", dir.path()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Download(_)));

        let path = runner
            .download_model(DownloadRequest::new("org/repo", "model.gguf", dir.path()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("model.gguf"));

        assert!(matches!(
            runner
                .download_model(DownloadRequest::new("org/repo", "model.gguf", dir.path()))
                .await,
            Err(JobError::AlreadyExists(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_vision_encoder_falls_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::default()
                .with_reply(VISION_ENCODER_SOURCES[0].filename, FetchReply::Unauthorized)
                .with_reply(VISION_ENCODER_SOURCES[1].filename, FetchReply::ServerError),
        );
        let (events, _rx) = mpsc::unbounded_channel();
        let runner = CaptionRunner::new(
            FakeEngine::new(Script::Tokens(vec![])),
            fetcher.clone(),
            events,
        );

        let path = runner
            .download_vision_encoder(dir.path(), None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(path, dir.path().join(VISION_ENCODER_SOURCES[2].filename));
        assert_eq!(fetcher.requested.lock().unwrap().len(), 3);

        // now present locally, nothing is fetched
        let again = runner
            .download_vision_encoder(dir.path(), None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(again, path);
        assert_eq!(fetcher.requested.lock().unwrap().len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_vision_encoder_reports_auth_when_all_sources_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = FakeFetcher::default();
        for source in VISION_ENCODER_SOURCES.iter() {
            fetcher = fetcher.with_reply(source.filename, FetchReply::ServerError);
        }
        let fetcher = fetcher.with_reply(VISION_ENCODER_SOURCES[1].filename, FetchReply::Unauthorized);
        let (events, _rx) = mpsc::unbounded_channel();
        let runner = CaptionRunner::new(
            FakeEngine::new(Script::Tokens(vec![])),
            Arc::new(fetcher),
            events,
        );

        let err = runner
            .download_vision_encoder(dir.path(), Some("hf_x".into()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Auth(_)));
    }

    #[test_log::test(tokio::test)]
    async fn test_vision_encoder_already_present_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .with_reply(VISION_ENCODER_SOURCES[0].filename, FetchReply::Present);
        let (events, mut rx) = mpsc::unbounded_channel();
        let runner = CaptionRunner::new(
            FakeEngine::new(Script::Tokens(vec![])),
            Arc::new(fetcher),
            events,
        );

        let path = runner
            .download_vision_encoder(dir.path(), None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(path, dir.path().join(VISION_ENCODER_SOURCES[0].filename));

        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, JobEvent::Download(DownloadEvent::Failed { .. })),
                "unexpected {:?}",
                event
            );
            if matches!(event, JobEvent::Download(DownloadEvent::Finished { .. })) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_workspace_import_edit_export() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = mpsc::unbounded_channel();
        let runner = CaptionRunner::new(
            FakeEngine::new(Script::Tokens(vec![])),
            Arc::new(FakeFetcher::default()),
            events,
        );

        let batch = images(dir.path(), &["a.png", "b.JPG", "c.webp"]);
        std::fs::write(dir.path().join("a.txt"), " a cat \n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let summary = runner.import_folder(dir.path()).await.unwrap();
        assert_eq!(summary.added, 3);
        assert_eq!(summary.with_captions, 1);
        let again = runner.import_images(batch.clone()).await.unwrap();
        assert_eq!(again.added, 0);
        assert_eq!(again.ignored, 3);

        assert_eq!(
            runner.caption_for(&batch[0]).await.unwrap().as_deref(),
            Some("a cat")
        );

        let stats = runner.dataset_stats().await.unwrap();
        assert_eq!((stats.total, stats.captioned, stats.percent), (3, 1, 33));

        runner.set_caption(&batch[1], "a dog").await.unwrap();
        assert!(!has_sidecar(&batch[1]).await);
        let saved = runner.save_caption(&batch[2], "a bird").await.unwrap();
        assert_eq!(saved, dir.path().join("c.txt"));

        let exported = runner.export_all().await.unwrap();
        assert_eq!(exported, ExportSummary { written: 3, failed: 0 });
        assert_eq!(
            read_sidecar(&batch[1]).await.unwrap().as_deref(),
            Some("a dog")
        );

        runner.clear_workspace().await.unwrap();
        let snapshot = runner.snapshot().await.unwrap();
        assert_eq!((snapshot.images, snapshot.cached_captions), (0, 0));
        assert_eq!(runner.dataset_stats().await.unwrap().total, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_cancels_and_releases_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new(Script::Hang(vec!["A "]));
        let loaded = engine.loaded.clone();
        let (runner, _events) = loaded_runner(engine, FakeFetcher::default(), dir.path()).await;

        let mut handle = runner.caption(dir.path().join("a.png"), spec()).await.unwrap();
        assert_eq!(handle.next_token().await.as_deref(), Some("A "));

        runner.shutdown().await.unwrap();
        let outcome = handle.finish().await.unwrap();
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.text, "A");
        assert!(!loaded.load(Ordering::SeqCst));
    }
}
