//! Moving a Worker's results to where the Manager collects them.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use walkdir::WalkDir;

use warden_core::{WorkerError, WorkerResult};

/// How `collect` hands results to a connected Manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Delivery {
    /// Move when the Manager runs on this machine, upload otherwise.
    #[default]
    Auto,
    /// Always move into the destination folder.
    Move,
    /// Always upload to the Manager.
    Upload,
}

/// Whether a Manager on `manager_host` shares this Worker's filesystem,
/// judged by name alone.
pub fn is_co_located(manager_host: &str, worker_host: &str) -> bool {
    if manager_host.eq_ignore_ascii_case("localhost") || manager_host == worker_host {
        return true;
    }
    manager_host
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

/// [`is_co_located`], also accepting any address of this machine.
///
/// Each address `manager_host` resolves to is compared with the source
/// address the kernel picks to reach it; they only match when the
/// address belongs to one of this machine's interfaces.
pub async fn shares_machine(manager_host: &str, worker_host: &str) -> bool {
    if is_co_located(manager_host, worker_host) {
        return true;
    }
    let Ok(addrs) = tokio::net::lookup_host((manager_host, 0)).await else {
        return false;
    };
    for addr in addrs {
        if routes_to_self(addr.ip()).await {
            return true;
        }
    }
    false
}

async fn routes_to_self(ip: IpAddr) -> bool {
    let any: SocketAddr = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let Ok(socket) = tokio::net::UdpSocket::bind(any).await else {
        return false;
    };
    // Connecting a UDP socket only selects a route; nothing is sent.
    if socket.connect((ip, 9)).await.is_err() {
        return false;
    }
    socket.local_addr().is_ok_and(|local| local.ip() == ip)
}

/// Move `src` to `dest_root/final_name`, retrying while the move fails.
///
/// An existing destination folder is merged into rather than replaced.
/// If `src` is already gone but the destination exists, an earlier
/// collect got there first and this one succeeds as well. Retries stop
/// with [`WorkerError::ArchiveMoveTimeout`] once `bound` would be
/// exceeded.
pub async fn move_archive(
    src: &Path,
    dest_root: &Path,
    final_name: &str,
    retry: Duration,
    bound: Duration,
) -> WorkerResult<PathBuf> {
    let target = dest_root.join(final_name);
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if !src.exists() {
            if target.exists() {
                debug!(target = %target.display(), "archive already in place");
                return Ok(target);
            }
            return Err(WorkerError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("nothing to collect at {}", src.display()),
            )));
        }

        match relocate(src.to_path_buf(), dest_root.to_path_buf(), target.clone()).await {
            Ok(()) => {
                info!(target = %target.display(), attempt, "archive moved");
                return Ok(target);
            }
            Err(e) => {
                let waited = started.elapsed();
                if waited.saturating_add(retry) > bound {
                    return Err(WorkerError::ArchiveMoveTimeout {
                        path: target,
                        waited,
                    });
                }
                debug!(attempt, error = %e, "archive move failed, retrying");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

async fn relocate(src: PathBuf, dest_root: PathBuf, target: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dest_root)?;
        if target.exists() {
            debug!(target = %target.display(), "destination exists, merging");
            copy_tree(&src, &target)?;
            return std::fs::remove_dir_all(&src);
        }
        match std::fs::rename(&src, &target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                copy_tree(&src, &target)?;
                std::fs::remove_dir_all(&src)
            }
            Err(e) => Err(e),
        }
    })
    .await
    .map_err(io::Error::other)?
}

/// Copy everything under `src` into `dst`, overwriting files that exist.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let to = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&to)?;
        } else {
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}
