use anyhow::{Context, Result};
use library_backup::{
    config::{AppConfig, Command},
    models::{ArchiveJob, BackupPolicy, BackupRunResult, job::ttl_from_days},
    services::{
        archive::{ArchiveProducer, TarGzArchiver},
        backup_service::BackupService,
        checksum::composite_checksum,
        multipart_upload::MultipartUploader,
        verified_upload::VerifiedUploader,
    },
    stores::create_store,
};
use std::{path::Path, process::ExitCode, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::debug!(?cfg, "loaded configuration");

    let producer: Arc<dyn ArchiveProducer> = Arc::new(TarGzArchiver::new());

    let ok = match command {
        Command::Checksum { folder } => {
            let folder = std::path::absolute(&folder)?;
            let checksum =
                composite_checksum(producer.produce(&folder, &[".".into()]), cfg.part_size)
                    .await
                    .with_context(|| format!("archiving {}", folder.display()))?;
            println!("{checksum}");
            true
        }
        Command::UploadFolder {
            folder,
            key,
            storage_class,
            ttl,
        } => {
            let verified = pipeline(&cfg, producer).await?;
            let job = ArchiveJob::new(std::path::absolute(&folder)?, key)
                .with_storage_class(Some(storage_class))
                .with_ttl(ttl.map(ttl_from_days));
            let outcome = verified.run(&job).await;
            if outcome.is_success() {
                tracing::info!(key = %job.key, "backup verified");
            } else {
                tracing::error!(key = %job.key, ?outcome, "backup failed");
            }
            outcome.is_success()
        }
        Command::BackUpLibrary {
            upload_location,
            date,
        } => {
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let service = BackupService::new(pipeline(&cfg, producer).await?);

            // Both passes always run.
            let mut ok = true;
            for policy in [BackupPolicy::archival(), BackupPolicy::recent()] {
                ok &= run_pass(&service, &upload_location, date, &policy).await;
            }
            ok
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Connect to the configured store and assemble the upload pipeline.
async fn pipeline(cfg: &AppConfig, producer: Arc<dyn ArchiveProducer>) -> Result<VerifiedUploader> {
    let store = create_store(cfg)
        .await
        .context("initializing object store")?;
    let uploader =
        MultipartUploader::new(store, cfg.part_size)?.with_concurrency(cfg.part_concurrency);
    Ok(VerifiedUploader::new(producer, uploader))
}

/// Run one policy pass and log its result. Returns true on success.
async fn run_pass(
    service: &BackupService,
    upload_location: &Path,
    date: chrono::NaiveDate,
    policy: &BackupPolicy,
) -> bool {
    match service.run(upload_location, date, policy).await {
        Ok(BackupRunResult::Success) => {
            tracing::info!(policy = policy.name, "backup pass succeeded");
            true
        }
        Ok(BackupRunResult::UploadFailed { details }) => {
            for report in details.iter().filter(|r| !r.outcome.is_success()) {
                tracing::error!(
                    policy = policy.name,
                    key = %report.key,
                    outcome = ?report.outcome,
                    "backup job failed"
                );
            }
            false
        }
        Err(err) => {
            tracing::error!(policy = policy.name, error = %err, "backup pass aborted");
            false
        }
    }
}
