//! Turns folders into a gzip-compressed tar stream.
//!
//! Verification re-reads the source by archiving it a second time, so the
//! archive must be byte-for-byte reproducible: entries are visited in sorted
//! order, tar headers carry deterministic metadata, and the gzip header has
//! no timestamp.

use crate::models::ByteStream;
use bytes::Bytes;
use flate2::{Compression, GzBuilder};
use futures::{StreamExt, stream};
use std::{
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use tar::HeaderMode;
use tokio::sync::mpsc;

/// Chunks buffered between the archiving thread and the consumer.
const CHANNEL_DEPTH: usize = 16;
const WRITE_BUFFER: usize = 64 * 1024;

/// Something that can archive `folders` (relative to `base`) into a stream,
/// any number of times.
pub trait ArchiveProducer: Send + Sync {
    fn produce(&self, base: &Path, folders: &[String]) -> ByteStream;
}

/// `tar` + gzip archiver.
#[derive(Clone, Copy, Debug)]
pub struct TarGzArchiver {
    level: Compression,
}

impl Default for TarGzArchiver {
    fn default() -> Self {
        Self {
            level: Compression::best(),
        }
    }
}

impl TarGzArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gzip level, 0 (store) to 9 (best).
    #[must_use]
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }
}

impl ArchiveProducer for TarGzArchiver {
    /// Must be called from within a Tokio runtime. Archiving runs on the
    /// blocking pool; dropping the stream stops it.
    fn produce(&self, base: &Path, folders: &[String]) -> ByteStream {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
        let base = base.to_path_buf();
        let folders = folders.to_vec();
        let level = self.level;

        tokio::task::spawn_blocking(move || {
            let out = BufWriter::with_capacity(WRITE_BUFFER, ChannelWriter { tx: tx.clone() });
            if let Err(err) = write_archive(&base, &folders, level, out) {
                // The receiver may already be gone; nothing left to tell.
                let _ = tx.blocking_send(Err(err));
            }
        });

        stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
        .boxed()
    }
}

struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_archive<W: Write>(
    base: &Path,
    folders: &[String],
    level: Compression,
    out: W,
) -> io::Result<()> {
    let encoder = GzBuilder::new().mtime(0).write(out, level);
    let mut builder = tar::Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for folder in folders {
        append_tree(&mut builder, &base.join(folder), Path::new(folder))?;
    }

    let encoder = builder.into_inner()?;
    let mut out = encoder.finish()?;
    out.flush()
}

/// Append `disk` under archive name `name`, recursing into directories in
/// sorted order.
fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    disk: &Path,
    name: &Path,
) -> io::Result<()> {
    let meta = fs::symlink_metadata(disk)?;
    if !meta.is_dir() {
        return builder.append_path_with_name(disk, name);
    }

    builder.append_dir(name, disk)?;

    let mut entries = fs::read_dir(disk)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();

    for entry in entries {
        let child: PathBuf = name.join(&entry);
        append_tree(builder, &disk.join(&entry), &child)?;
    }
    Ok(())
}
