use std::path::Path;

use tracing::debug;

const SYSFS_NODE_DIR: &str = "/sys/devices/system/node";

/// Detect the number of NUMA nodes on this machine.
///
/// Falls back to a single node when the topology can't be read (non-linux,
/// restricted sysfs, etc).
pub fn detect_num_numa_nodes() -> usize {
    match count_numa_nodes_in(Path::new(SYSFS_NODE_DIR)) {
        Some(n) if n > 0 => n,
        _ => {
            debug!("unable to detect numa topology, assuming a single node");
            1
        }
    }
}

/// Count `node<N>` entries in a sysfs style node directory.
pub(crate) fn count_numa_nodes_in(dir: &Path) -> Option<usize> {
    let entries = std::fs::read_dir(dir).ok()?;
    let count = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_node_entry(&entry.file_name().to_string_lossy()))
        .count();
    Some(count)
}

fn is_node_entry(name: &str) -> bool {
    match name.strip_prefix("node") {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_entry_names() {
        assert!(is_node_entry("node0"));
        assert!(is_node_entry("node12"));
        assert!(!is_node_entry("node"));
        assert!(!is_node_entry("possible"));
        assert!(!is_node_entry("nodex1"));
    }

    #[test]
    fn count_nodes_in_dir() {
        let dir = std::env::temp_dir().join(format!("quarry_numa_test_{}", std::process::id()));
        std::fs::create_dir_all(dir.join("node0")).unwrap();
        std::fs::create_dir_all(dir.join("node1")).unwrap();
        std::fs::create_dir_all(dir.join("power")).unwrap();
        std::fs::write(dir.join("online"), "0-1").unwrap();

        assert_eq!(Some(2), count_numa_nodes_in(&dir));
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(None, count_numa_nodes_in(&dir));
    }

    #[test]
    fn detect_at_least_one() {
        assert!(detect_num_numa_nodes() >= 1);
    }
}
