use crate::{
    models::StorageClass,
    services::multipart_upload::{DEFAULT_PART_CONCURRENCY, DEFAULT_PART_SIZE, MIN_PART_SIZE},
};
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, path::PathBuf, str::FromStr};

/// Where archives are uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Amazon S3 or an S3-compatible service.
    S3,
    /// Local disk with SQLite metadata.
    Local,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "local" => Ok(Self::Local),
            other => bail!("unknown backend `{other}` (expected `s3` or `local`)"),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: BackendKind,
    /// Only needed by commands that talk to a store.
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub local_root: PathBuf,
    pub part_size: usize,
    pub part_concurrency: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Archive, upload and verify media library backups")]
pub struct Args {
    /// Storage backend (overrides BACKUP_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Destination bucket (overrides BACKUP_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// AWS region (overrides AWS_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Custom S3-compatible endpoint (overrides BACKUP_S3_ENDPOINT)
    #[arg(long)]
    pub endpoint_url: Option<String>,

    /// Root directory of the local backend (overrides BACKUP_LOCAL_ROOT)
    #[arg(long)]
    pub local_root: Option<PathBuf>,

    /// Upload part size in bytes (overrides BACKUP_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<usize>,

    /// Parts uploaded concurrently per job (overrides BACKUP_PART_CONCURRENCY)
    #[arg(long)]
    pub part_concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Archive one folder, upload it and verify the stored checksum
    UploadFolder {
        #[arg(long)]
        folder: PathBuf,

        /// Destination object key
        #[arg(long)]
        key: String,

        #[arg(long, value_enum)]
        storage_class: StorageClass,

        /// Expire the object after this many days
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Run the archival and recent passes over a media library
    BackUpLibrary {
        /// Directory containing `library/{tenant}/{YYYY}/{MM}/{DD}`
        #[arg(long)]
        upload_location: PathBuf,

        /// Reference date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Print the checksum a folder's archive should have once uploaded
    Checksum {
        #[arg(long)]
        folder: PathBuf,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let cfg = Self::merge(&args)?;
        Ok((cfg, args.command))
    }

    fn merge(args: &Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_backend = env_parsed::<BackendKind>("BACKUP_BACKEND")?.unwrap_or(BackendKind::S3);
        let env_bucket = env::var("BACKUP_BUCKET").ok();
        let env_region = env::var("AWS_REGION").ok();
        let env_endpoint = env::var("BACKUP_S3_ENDPOINT").ok();
        let env_local_root =
            env::var("BACKUP_LOCAL_ROOT").unwrap_or_else(|_| "./data/objects".into());
        let env_part_size = env_parsed::<usize>("BACKUP_PART_SIZE")?.unwrap_or(DEFAULT_PART_SIZE);
        let env_concurrency = env_parsed::<usize>("BACKUP_PART_CONCURRENCY")?
            .unwrap_or(DEFAULT_PART_CONCURRENCY);

        // --- Merge ---
        let cfg = Self {
            backend: args.backend.unwrap_or(env_backend),
            bucket: args.bucket.clone().or(env_bucket),
            region: args.region.clone().or(env_region),
            endpoint_url: args.endpoint_url.clone().or(env_endpoint),
            local_root: args
                .local_root
                .clone()
                .unwrap_or_else(|| PathBuf::from(env_local_root)),
            part_size: args.part_size.unwrap_or(env_part_size),
            part_concurrency: args.part_concurrency.unwrap_or(env_concurrency),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            bail!("part size must be at least 1 byte");
        }
        if self.backend == BackendKind::S3 && self.part_size < MIN_PART_SIZE {
            bail!(
                "part size {} is below the S3 minimum of {MIN_PART_SIZE} bytes",
                self.part_size
            );
        }
        if self.part_concurrency == 0 {
            bail!("part concurrency must be at least 1");
        }
        Ok(())
    }
}

/// Read and parse an optional environment variable.
fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: BackendKind, part_size: usize) -> AppConfig {
        AppConfig {
            backend,
            bucket: Some("backups".into()),
            region: None,
            endpoint_url: None,
            local_root: PathBuf::from("./data/objects"),
            part_size,
            part_concurrency: 4,
        }
    }

    #[test]
    fn s3_needs_provider_minimum_part_size() {
        assert!(config(BackendKind::S3, MIN_PART_SIZE).validate().is_ok());
        assert!(config(BackendKind::S3, MIN_PART_SIZE - 1).validate().is_err());
        assert!(config(BackendKind::Local, 1024).validate().is_ok());
        assert!(config(BackendKind::Local, 0).validate().is_err());
    }

    #[test]
    fn cli_parses_subcommands_and_flags() {
        let args = Args::try_parse_from([
            "library-backup",
            "--bucket",
            "media",
            "--backend",
            "local",
            "--part-size",
            "1024",
            "upload-folder",
            "--folder",
            "/srv/media",
            "--key",
            "media.tgz",
            "--storage-class",
            "DEEP_ARCHIVE",
            "--ttl",
            "7",
        ])
        .unwrap();

        assert_eq!(args.backend, Some(BackendKind::Local));
        let cfg = AppConfig::merge(&args).unwrap();
        assert_eq!(cfg.bucket.as_deref(), Some("media"));
        assert_eq!(cfg.part_size, 1024);
        match args.command {
            Command::UploadFolder {
                storage_class, ttl, ..
            } => {
                assert_eq!(storage_class, StorageClass::DeepArchive);
                assert_eq!(ttl, Some(7));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args = Args::try_parse_from([
            "library-backup",
            "back-up-library",
            "--upload-location",
            "/srv",
            "--date",
            "2024-05-02",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::BackUpLibrary { date: Some(d), .. } if d == NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()
        ));
    }

    #[test]
    fn checksum_needs_no_bucket() {
        let args = Args::try_parse_from([
            "library-backup",
            "--backend",
            "local",
            "checksum",
            "--folder",
            "/srv/media",
        ])
        .unwrap();

        assert!(args.bucket.is_none());
        assert!(AppConfig::merge(&args).is_ok());
        assert!(matches!(args.command, Command::Checksum { .. }));
    }

    #[test]
    fn backend_names_are_case_insensitive() {
        assert_eq!("S3".parse::<BackendKind>().unwrap(), BackendKind::S3);
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("gcs".parse::<BackendKind>().is_err());
    }
}
