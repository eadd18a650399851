//! Linux port lookup via procfs

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use crate::error::ProbeError;

const TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];

/// `st` column value for `TCP_LISTEN` in the kernel socket tables.
const TCP_LISTEN: &str = "0A";

pub fn find_owners(port: u16) -> Result<BTreeSet<u32>, ProbeError> {
    let mut inodes = HashSet::new();
    for table in TCP_TABLES {
        match fs::read_to_string(table) {
            Ok(raw) => inodes.extend(listening_inodes(&raw, port)),
            // tcp6 is absent on kernels built without IPv6
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(ProbeError::Read {
                    path: table.into(),
                    source,
                });
            }
        }
    }

    if inodes.is_empty() {
        return Ok(BTreeSet::new());
    }

    let owners = owners_of_inodes(Path::new("/proc"), &inodes)?;
    if owners.is_empty() {
        return Err(ProbeError::OwnerNotVisible { port });
    }
    Ok(owners)
}

/// Socket inodes in `LISTEN` state bound to `port`, from one
/// `/proc/net/tcp`-formatted table.
pub(crate) fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            if u16::from_str_radix(port_hex, 16).ok()? != port {
                return None;
            }
            fields[9].parse::<u64>().ok().filter(|inode| *inode != 0)
        })
        .collect()
}

/// Scan `<proc_root>/<pid>/fd` for descriptors pointing at the given
/// socket inodes. Processes whose fd table we cannot read are skipped.
pub(crate) fn owners_of_inodes(
    proc_root: &Path,
    inodes: &HashSet<u64>,
) -> Result<BTreeSet<u32>, ProbeError> {
    let entries = fs::read_dir(proc_root).map_err(|source| ProbeError::Read {
        path: proc_root.to_path_buf(),
        source,
    })?;

    let mut owners = BTreeSet::new();
    let mut hidden = 0usize;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let fds = match fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            Err(_) => {
                hidden += 1;
                continue;
            }
        };
        for fd in fds.flatten() {
            if let Ok(target) = fs::read_link(fd.path())
                && let Some(inode) = socket_inode(&target.to_string_lossy())
                && inodes.contains(&inode)
            {
                owners.insert(pid);
                break;
            }
        }
    }
    if owners.is_empty() && hidden > 0 {
        log::debug!("{hidden} processes had unreadable fd tables");
    }
    Ok(owners)
}

/// Inode from a `socket:[12345]` link target.
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}
