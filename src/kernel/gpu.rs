//! NVIDIA device probing and memory sampling.
//!
//! The kernel exposes no per-job GPU memory accounting, so the supervisor
//! samples the device through `nvidia-smi` while the job runs.

use crate::config::types::{Result, SandboxError};
use std::path::{Path, PathBuf};
use std::process::Command;

const CONTROL_NODES: &[&str] = &["/dev/nvidiactl", "/dev/nvidia-uvm", "/dev/nvidia-uvm-tools"];

/// A GPU the job may use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub id: u32,
    pub node: PathBuf,
}

impl GpuDevice {
    /// Device nodes to bind into the sandbox: the card plus whichever
    /// control nodes exist.
    pub fn nodes(&self) -> Vec<PathBuf> {
        let mut nodes = vec![self.node.clone()];
        nodes.extend(
            CONTROL_NODES
                .iter()
                .map(PathBuf::from)
                .filter(|p| p.exists()),
        );
        nodes
    }
}

pub fn device_node(dev_root: &Path, id: u32) -> PathBuf {
    dev_root.join(format!("nvidia{}", id))
}

/// Check that `/dev/nvidia<id>` exists.
pub fn probe(id: u32) -> Result<GpuDevice> {
    probe_in(Path::new("/dev"), id)
}

pub fn probe_in(dev_root: &Path, id: u32) -> Result<GpuDevice> {
    let node = device_node(dev_root, id);
    if !node.exists() {
        return Err(SandboxError::Gpu(format!(
            "GPU device {} not available ({} missing)",
            id,
            node.display()
        )));
    }
    Ok(GpuDevice { id, node })
}

/// First number of `nvidia-smi --format=csv,noheader,nounits` output, in MiB.
pub fn parse_memory_used_mib(output: &str) -> Option<u64> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

/// Current memory in use on the device, in bytes.
pub fn sample_memory_used(id: u32) -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.used",
            "--format=csv,noheader,nounits",
            "-i",
            &id.to_string(),
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_memory_used_mib(&String::from_utf8_lossy(&output.stdout)).map(|mib| mib * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_requires_device_node() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(probe_in(dir.path(), 0), Err(SandboxError::Gpu(_))));

        std::fs::write(dir.path().join("nvidia1"), b"").unwrap();
        let gpu = probe_in(dir.path(), 1).unwrap();
        assert_eq!(gpu.id, 1);
        assert_eq!(gpu.nodes()[0], dir.path().join("nvidia1"));
    }

    #[test]
    fn parses_nvidia_smi_output() {
        assert_eq!(parse_memory_used_mib("1234\n"), Some(1234));
        assert_eq!(parse_memory_used_mib("\n  512 , extra\n"), Some(512));
        assert_eq!(parse_memory_used_mib("[N/A]\n"), None);
        assert_eq!(parse_memory_used_mib(""), None);
    }
}
