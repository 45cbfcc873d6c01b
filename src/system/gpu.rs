//! GPU detection
//!
//! Best-effort accelerator detection used for device descriptors.

use crate::types::model::DeviceInfo;
use std::process::Command;

/// GPU information
#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    pub name: String,
    /// "CUDA" or "Metal"
    pub api: String,
    pub vram_total_mb: u64,
    pub is_available: bool,
}

impl GpuInfo {
    fn unavailable() -> Self {
        GpuInfo {
            name: "GPU not detected".to_string(),
            api: String::new(),
            vram_total_mb: 0,
            is_available: false,
        }
    }

    /// Convert to the descriptor reported over the control protocol
    pub fn to_device_info(&self) -> DeviceInfo {
        if !self.is_available {
            return DeviceInfo::cpu();
        }
        DeviceInfo {
            device_type: self.api.clone(),
            name: self.name.clone(),
            memory: if self.vram_total_mb > 0 {
                format!("{:.1} GB", self.vram_total_mb as f64 / 1024.0)
            } else {
                "—".to_string()
            },
        }
    }
}

/// Detect available GPU (best effort)
pub fn detect_gpu() -> GpuInfo {
    #[cfg(target_os = "macos")]
    {
        if let Some(info) = detect_gpu_system_profiler() {
            return info;
        }
    }

    detect_gpu_nvidia_smi().unwrap_or_else(GpuInfo::unavailable)
}

/// Device descriptor for the detected accelerator, or CPU
pub fn device_info() -> DeviceInfo {
    detect_gpu().to_device_info()
}

fn detect_gpu_nvidia_smi() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 2 {
        return None;
    }

    Some(GpuInfo {
        name: parts[0].to_string(),
        api: "CUDA".to_string(),
        vram_total_mb: parts[1].parse::<u64>().ok()?,
        is_available: true,
    })
}

/// Detect GPU using system_profiler SPDisplaysDataType
#[cfg(target_os = "macos")]
fn detect_gpu_system_profiler() -> Option<GpuInfo> {
    let output = Command::new("system_profiler")
        .args(["SPDisplaysDataType"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut gpu_name: Option<String> = None;
    let mut vram_mb: Option<u64> = None;

    for line in stdout.lines() {
        let trimmed = line.trim();

        // "Chipset Model: Apple M2 Pro"
        if let Some(name) = trimmed.strip_prefix("Chipset Model:") {
            let name = name.trim();
            if !name.is_empty() {
                gpu_name = Some(name.to_string());
            }
        }

        // "VRAM (Total): 16 GB" or "VRAM (Dynamic, Max): 48 GB"
        if trimmed.contains("VRAM") && trimmed.contains(':') {
            let after_colon = trimmed.split(':').nth(1).unwrap_or("").trim();
            let parts: Vec<&str> = after_colon.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(val) = parts[0].parse::<u64>() {
                    vram_mb = Some(match parts[1].to_uppercase().as_str() {
                        "GB" => val * 1024,
                        _ => val,
                    });
                }
            }
        }
    }

    Some(GpuInfo {
        name: gpu_name?,
        api: "Metal".to_string(),
        vram_total_mb: vram_mb.unwrap_or(0),
        is_available: true,
    })
}
