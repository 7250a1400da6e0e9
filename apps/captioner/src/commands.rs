use crate::{
    cli::{
        BatchArgs, CaptionArgs, Cli, Command, ConfigAction, DownloadArgs, ModelArgs, PromptArgs,
    },
    notifications::{Category, NotificationLog},
};
use anyhow::{anyhow, bail};
use app_config::{AppConfig, ConfigStore};
use caption_pool::{CaptionRunner, CaptionSpec, DownloadEvent, JobEvent, JobStatus};
use file_downloader::{DownloadRequest, HubDownload, HubDownloadConfig};
use model_catalog::{
    find_vision_encoder, model_file_exists, model_search_dirs, registry_model, scan_images,
    scan_models, RegistryModel,
};
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use vlm_inference::{LlamaServerConfig, LlamaServerEngine, SamplingParams};

pub async fn run(cli: Cli, store: ConfigStore) -> anyhow::Result<()> {
    let mut config = store.load();

    match cli.command {
        Command::Prompt(args) => print_prompt(&args),
        Command::Models => list_models(&cli.model_dir, &config),
        Command::Config { action } => configure(action, &store, &mut config),
        Command::Stats { folder } => {
            let session = Session::start(LlamaServerConfig::default());
            let result = print_stats(&session.runner, &folder).await;
            session.finish().await?;
            result
        }
        Command::Download(args) => {
            let session = Session::start(LlamaServerConfig::default());
            let result = download(&session.runner, &args, &cli.model_dir, &config).await;
            session.finish().await?;
            result
        }
        Command::Caption(args) => {
            let (model, vision) = resolve_model(&args.model, &cli.model_dir, &config)?;
            let session = Session::start(args.model.server_config());
            let result = caption_one(&session.runner, &args, &model, &vision).await;
            session.finish().await?;
            result
        }
        Command::Batch(args) => {
            let (model, vision) = resolve_model(&args.model, &cli.model_dir, &config)?;
            let session = Session::start(args.model.server_config());
            let result = caption_folder(&session.runner, &args, &model, &vision).await;
            session.finish().await?;
            result
        }
    }
}

/// A running caption runner and the task printing its events.
struct Session {
    runner: CaptionRunner,
    reporter: JoinHandle<NotificationLog>,
}

impl Session {
    fn start(server: LlamaServerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let fetcher = Arc::new(HubDownload::new(HubDownloadConfig::default()));
        let runner = CaptionRunner::new(LlamaServerEngine::new(server), fetcher, tx);
        Self {
            runner,
            reporter: tokio::spawn(report(rx)),
        }
    }

    async fn finish(self) -> anyhow::Result<()> {
        self.runner.shutdown().await?;
        // the event channel closes once the runner loop is gone
        let log = self.reporter.await?;

        let errors = log
            .iter()
            .filter(|n| n.category == Category::Error && !n.read)
            .count();
        if errors > 0 {
            eprintln!("{} error(s) during this run", errors);
        }
        Ok(())
    }
}

async fn report(mut events: mpsc::UnboundedReceiver<JobEvent>) -> NotificationLog {
    let mut log = NotificationLog::default();

    while let Some(event) = events.recv().await {
        if let JobEvent::Download(DownloadEvent::Progress {
            filename,
            downloaded_bytes,
            total_bytes,
        }) = &event
        {
            print_download_progress(filename, *downloaded_bytes, *total_bytes);
            continue;
        }

        if let Some(message) = event.message() {
            if event.is_error() {
                eprintln!("error: {}", message);
            } else {
                eprintln!("{}", message);
            }
        }
        log.record(&event);
    }

    log
}

fn print_download_progress(filename: &str, downloaded: u64, total: Option<u64>) {
    let mb = downloaded as f64 / 1_048_576.0;
    match total {
        Some(total) if total > 0 => eprint!(
            "\r{}: {:.1} MB ({}%)",
            filename,
            mb,
            downloaded * 100 / total
        ),
        _ => eprint!("\r{}: {:.1} MB", filename, mb),
    }
    if total == Some(downloaded) {
        eprintln!();
    }
}

fn print_prompt(args: &PromptArgs) -> anyhow::Result<()> {
    let settings = args.to_settings()?;
    println!("{}", settings.compose());

    let prefix = settings.effective_prefix();
    if !prefix.trim().is_empty() {
        eprintln!("prefix: {}", prefix);
    }
    let suffix = settings.effective_suffix();
    if !suffix.trim().is_empty() {
        eprintln!("suffix: {}", suffix);
    }
    Ok(())
}

fn caption_spec(
    prompt: &PromptArgs,
    params: SamplingParams,
    auto_save: bool,
) -> anyhow::Result<CaptionSpec> {
    let settings = prompt.to_settings()?;
    Ok(CaptionSpec {
        prompt: settings.compose(),
        params,
        prefix: settings.effective_prefix(),
        suffix: settings.effective_suffix(),
        auto_save,
    })
}

/// Model and vision encoder paths for a caption run.
fn resolve_model(
    args: &ModelArgs,
    model_dir: &Path,
    config: &AppConfig,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    let dirs = model_search_dirs(model_dir, &config.model_search_paths);
    let models = scan_models(&dirs);

    let model = match &args.model {
        Some(path) if path.is_file() => path.clone(),
        Some(name) => models
            .iter()
            .find(|m| m.name == name.to_string_lossy())
            .map(|m| m.path.clone())
            .ok_or_else(|| anyhow!("Model not found: {}", name.display()))?,
        None => match models.first() {
            Some(model) => model.path.clone(),
            None => bail!(
                "No models found in {}. Download one with `vl-captioner download Q4_K_M`.",
                model_dir.display()
            ),
        },
    };

    let vision = match &args.vision {
        Some(path) => path.clone(),
        None => model
            .parent()
            .and_then(find_vision_encoder)
            .or_else(|| dirs.iter().find_map(find_vision_encoder))
            .ok_or_else(|| {
                anyhow!("No vision encoder (mmproj) found next to {}", model.display())
            })?,
    };

    Ok((model, vision))
}

async fn load(runner: &CaptionRunner, model: &Path, vision: &Path) -> anyhow::Result<()> {
    runner.load_model(model, vision).await?.wait().await?;
    Ok(())
}

async fn caption_one(
    runner: &CaptionRunner,
    args: &CaptionArgs,
    model: &Path,
    vision: &Path,
) -> anyhow::Result<()> {
    let spec = caption_spec(&args.prompt, args.sampling.params(), args.save)?;
    load(runner, model, vision).await?;

    let mut job = runner.caption(&args.image, spec).await?;
    let mut stderr = std::io::stderr();
    loop {
        tokio::select! {
            token = job.next_token() => match token {
                Some(token) => {
                    write!(stderr, "{}", token)?;
                    stderr.flush()?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                runner.cancel_current_caption().await?;
            }
        }
    }
    eprintln!();

    let outcome = job.finish().await?;
    if outcome.status == JobStatus::Done {
        println!("{}", outcome.text);
    }
    Ok(())
}

async fn caption_folder(
    runner: &CaptionRunner,
    args: &BatchArgs,
    model: &Path,
    vision: &Path,
) -> anyhow::Result<()> {
    let spec = caption_spec(&args.prompt, args.sampling.params(), !args.no_save)?;

    let imported = runner.import_folder(&args.folder).await?;
    tracing::info!(
        "imported {} images ({} with captions)",
        imported.added,
        imported.with_captions
    );
    let images = scan_images(&args.folder)?;
    if images.is_empty() {
        bail!("No images found in {}", args.folder.display());
    }

    load(runner, model, vision).await?;

    let batch = runner.start_batch(images, spec, args.skip_existing).await?;
    if batch.plan.queued == 0 {
        return print_stats(runner, &args.folder).await;
    }

    let outcome = batch.wait();
    tokio::pin!(outcome);
    let mut interrupts = 0;
    let summary = loop {
        tokio::select! {
            summary = &mut outcome => break summary?,
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    eprintln!("Skipping current image, press Ctrl-C again to stop the batch");
                    runner.skip_current_item().await?;
                } else {
                    runner.cancel_current_caption().await?;
                }
            }
        }
    };

    eprintln!(
        "Batch {}: {} captioned, {} remaining",
        summary.status, summary.captioned, summary.remaining
    );

    print_stats(runner, &args.folder).await
}

async fn print_stats(runner: &CaptionRunner, folder: &Path) -> anyhow::Result<()> {
    runner.import_folder(folder).await?;
    let stats = runner.dataset_stats().await?;
    println!(
        "{} images, {} captioned, {} uncaptioned ({}%)",
        stats.total, stats.captioned, stats.uncaptioned, stats.percent
    );
    Ok(())
}

async fn download(
    runner: &CaptionRunner,
    args: &DownloadArgs,
    model_dir: &Path,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let model = registry_model(&args.model).ok_or_else(|| {
        anyhow!(
            "Unknown model {}. Run `vl-captioner models` to list downloadable models.",
            args.model
        )
    })?;
    let token = config.resolve_hf_token(args.token.as_deref());

    if model_file_exists(model_dir, &model.filename) {
        eprintln!("{} is already installed", model.filename);
    } else {
        let request = DownloadRequest::new(model.repo_id, &model.filename, model_dir)
            .with_token(token.clone());
        let path = runner.download_model(request).await?.wait().await?;
        println!("{}", path.display());
    }

    if args.with_vision_encoder {
        let path = runner
            .download_vision_encoder(model_dir, token)
            .await?
            .wait()
            .await?;
        println!("{}", path.display());
    }
    Ok(())
}

fn list_models(model_dir: &Path, config: &AppConfig) -> anyhow::Result<()> {
    let dirs = model_search_dirs(model_dir, &config.model_search_paths);

    println!("Local models:");
    let models = scan_models(&dirs);
    if models.is_empty() {
        println!("  (none)");
    }
    for model in &models {
        println!("  {}  {}", model.name, model.path.display());
    }

    match dirs.iter().find_map(find_vision_encoder) {
        Some(path) => println!("Vision encoder: {}", path.display()),
        None => println!("Vision encoder: not found"),
    }

    println!("Downloadable:");
    for model in RegistryModel::all() {
        let installed = dirs
            .iter()
            .any(|dir| model_file_exists(dir, &model.filename));
        println!(
            "  {:<8} {}{}",
            model.quant,
            model.display_name,
            if installed { "  [installed]" } else { "" }
        );
    }
    Ok(())
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn configure(
    action: ConfigAction,
    store: &ConfigStore,
    config: &mut AppConfig,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let mut shown = config.clone();
            shown.hf_token = mask_token(&shown.hf_token);
            println!("# {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        ConfigAction::SetToken { token } => {
            config.hf_token = token.trim().to_string();
            store.save(config)?;
            eprintln!("Token saved");
        }
        ConfigAction::AddSearchPath { dir } => {
            if config.add_model_search_path(&dir) {
                store.save(config)?;
                eprintln!("Added {}", dir.display());
            } else {
                eprintln!("{} is already a search path", dir.display());
            }
        }
    }
    Ok(())
}
