//! GPU capability probe
//!
//! Interrogates the first high-performance adapter the host exposes and
//! derives a coarse capability report: VRAM estimate, discrete/integrated
//! classification and a low-memory flag. The report feeds UI warnings only
//! and never gates execution; a CPU-only host still runs every pipeline
//! operation.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LOW_VRAM_THRESHOLD_BYTES;

/// Adapter identity as reported by the GPU API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub name: String,
    pub driver: String,
    pub backend: String,
    pub device_type: String,
}

/// Capability report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuCapabilities {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterDescriptor>,
    /// Heuristic: four times the adapter's maximum buffer size
    pub estimated_vram_bytes: u64,
    pub is_discrete_gpu: bool,
    /// True iff the estimate is nonzero and under 4 GiB
    pub is_low_vram: bool,
}

impl GpuCapabilities {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            unavailable_reason: Some(reason.into()),
            adapter: None,
            estimated_vram_bytes: 0,
            is_discrete_gpu: false,
            is_low_vram: false,
        }
    }
}

/// Descriptor tokens that identify discrete GPU families
const DISCRETE_TOKENS: &[&str] = &[
    "nvidia", "geforce", "rtx", "gtx", "quadro", "tesla", "radeon rx", "radeon pro", "rx ", "arc ",
    "vega",
];

fn is_discrete(name: &str, device_type: wgpu::DeviceType) -> bool {
    if device_type == wgpu::DeviceType::DiscreteGpu {
        return true;
    }
    // Backends that report an unknown device type still expose the marketing
    // name; match it against known discrete families.
    let lowered = name.to_lowercase();
    device_type != wgpu::DeviceType::IntegratedGpu
        && device_type != wgpu::DeviceType::Cpu
        && DISCRETE_TOKENS.iter().any(|t| lowered.contains(t))
}

fn is_low_vram(estimated_vram_bytes: u64) -> bool {
    estimated_vram_bytes > 0 && estimated_vram_bytes < LOW_VRAM_THRESHOLD_BYTES
}

/// Probe the GPU. Cheap enough to call once per process; callers cache the
/// result.
pub async fn probe_gpu() -> GpuCapabilities {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

    let adapter = match instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
    {
        Ok(adapter) => adapter,
        Err(e) => {
            warn!("no GPU adapter available: {}", e);
            return GpuCapabilities::unavailable(format!("no adapter: {e}"));
        }
    };

    let info = adapter.get_info();
    let limits = adapter.limits();
    let estimated_vram_bytes = limits.max_buffer_size.saturating_mul(4);
    let discrete = is_discrete(&info.name, info.device_type);
    let low_vram = is_low_vram(estimated_vram_bytes);

    debug!(
        "adapter '{}' ({:?}, {:?}): ~{} MiB VRAM, discrete={}",
        info.name,
        info.device_type,
        info.backend,
        estimated_vram_bytes / (1024 * 1024),
        discrete
    );

    GpuCapabilities {
        available: true,
        unavailable_reason: None,
        adapter: Some(AdapterDescriptor {
            name: info.name,
            driver: info.driver,
            backend: format!("{:?}", info.backend),
            device_type: format!("{:?}", info.device_type),
        }),
        estimated_vram_bytes,
        is_discrete_gpu: discrete,
        is_low_vram: low_vram,
    }
}
