//! Demo binary: wires a filesystem-backed handle into [`tftpd::Server`].
//! Not part of the tested library contract — just enough to make the
//! crate runnable against a real directory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tftpd::handle::{Handle, ReadHandle, ReadSource, WriteSink};
use tftpd::{Connection, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "tftpd", version, about = "A TFTP (RFC 1350/2347/2348/2349) server")]
struct Cli {
    /// `[scheme://]host[:port]` to listen on, or `*` for all interfaces.
    #[arg(long)]
    listen: Option<String>,

    /// Directory served for RRQ and accepted into for WRQ.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Hard cap on concurrent connections.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Retransmit budget per connection.
    #[arg(long)]
    retries: Option<u32>,

    /// Per-connection idle/retransmit timeout, in seconds.
    #[arg(long)]
    timeout: Option<u32>,

    /// Load a JSON config file; CLI flags above override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(max_connections) = cli.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(retries) = cli.retries {
        config.retries = retries;
    }
    if let Some(timeout) = cli.timeout {
        config.retransmit_timeout = timeout;
    }

    let root = std::fs::canonicalize(&cli.root)
        .with_context(|| format!("served directory {:?} does not exist", cli.root))?;

    let mut server = Server::bind(config).await?;
    info!(addr = %server.local_addr()?, root = %root.display(), "tftpd listening");

    let rrq_root = root.clone();
    server.on_rrq(move |conn: &mut Connection| match open_for_read(&rrq_root, &conn.file) {
        Ok((file, len)) => {
            conn.set_filesize(len);
            conn.attach_handle(Handle::Read(ReadHandle::Positioned(Box::new(FileReader(file)))));
        }
        Err(e) => error!(file = %conn.file, error = %e, "rrq: cannot open file"),
    });

    let wrq_root = root.clone();
    server.on_wrq(move |conn: &mut Connection| match create_for_write(&wrq_root, &conn.file) {
        Ok(file) => conn.attach_handle(tftpd::connection::write_handle(FileWriter(file))),
        Err(e) => error!(file = %conn.file, error = %e, "wrq: cannot create file"),
    });

    server.on_finish(|conn, error| {
        if error.is_empty() {
            info!(peer = %conn.peer, file = %conn.file, "transfer complete");
        } else {
            error!(peer = %conn.peer, file = %conn.file, %error, "transfer failed");
        }
    });
    server.on_error(|message| error!(%message, "server error"));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::select! {
        result = server.run(shutdown_rx) => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            Ok(())
        }
    }
}

fn init_tracing() {
    let verbose = std::env::var("TFTPD_DEBUG").as_deref() == Ok("1");
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Walk `filename` component-by-component onto `root`, refusing to
/// leave it: a `RootDir`/`Prefix` component (an absolute path) or a
/// `ParentDir` component (`..`) aborts the walk rather than being
/// stripped, so a crafted name can never reach outside the served tree
/// regardless of how many segments it tries to climb.
fn sanitize_path(root: &Path, filename: &str) -> Result<PathBuf> {
    use std::path::Component;

    let mut resolved = root.to_path_buf();
    let mut saw_named_segment = false;

    for component in Path::new(filename).components() {
        match component {
            Component::Normal(segment) => {
                resolved.push(segment);
                saw_named_segment = true;
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(anyhow!("path traversal is not allowed")),
            Component::RootDir | Component::Prefix(_) => return Err(anyhow!("absolute paths are not allowed")),
        }
    }

    if !saw_named_segment {
        return Err(anyhow!("invalid filename"));
    }

    Ok(resolved)
}

fn open_for_read(root: &Path, filename: &str) -> Result<(File, u64)> {
    let path = sanitize_path(root, filename)?;
    let canonical_root = root.canonicalize().context("cannot canonicalize served directory")?;
    let canonical = path.canonicalize().context("file not found")?;
    if !canonical.starts_with(&canonical_root) {
        return Err(anyhow!("path escapes served directory"));
    }
    let file = File::open(&canonical)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

fn create_for_write(root: &Path, filename: &str) -> Result<File> {
    let path = sanitize_path(root, filename)?;
    let canonical_root = root.canonicalize().context("cannot canonicalize served directory")?;
    if let Some(parent) = path.parent()
        && let Ok(canonical_parent) = parent.canonicalize()
        && !canonical_parent.starts_with(&canonical_root)
    {
        return Err(anyhow!("path escapes served directory"));
    }
    let file = OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
    Ok(file)
}

struct FileReader(File);
impl ReadSource for FileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.seek(SeekFrom::Start(offset))?;
        self.0.read(buf)
    }
}

struct FileWriter(File);
impl WriteSink for FileWriter {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.0.seek(SeekFrom::Start(offset))?;
        self.0.write_all(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_path(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_path(dir.path(), "../secret").is_err());
        assert!(sanitize_path(dir.path(), "a/../../b").is_err());
    }

    #[test]
    fn accepts_plain_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = sanitize_path(dir.path(), "file.bin").unwrap();
        assert_eq!(resolved, dir.path().join("file.bin"));
    }

    #[test]
    fn open_for_read_rejects_escape_via_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"nope").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt")).unwrap();
        #[cfg(unix)]
        assert!(open_for_read(dir.path(), "link.txt").is_err());
    }
}
