use crate::core::task::GpuRequirement;
use anyhow::{Context, Result};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Point-in-time snapshot of a single device. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuStatus {
    pub index: u32,
    pub name: String,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub free_memory_mb: u64,
    pub utilization_percent: u32,
    pub temperature: u32,
}

impl GpuStatus {
    pub fn free_memory_gb(&self) -> f64 {
        self.free_memory_mb as f64 / 1024.0
    }

    /// Idle means utilization below 5%.
    pub fn is_idle(&self) -> bool {
        self.utilization_percent < 5
    }
}

// The wire shape carries the derived fields alongside the raw ones.
impl Serialize for GpuStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("GpuStatus", 9)?;
        s.serialize_field("index", &self.index)?;
        s.serialize_field("name", &self.name)?;
        s.serialize_field("total_memory_mb", &self.total_memory_mb)?;
        s.serialize_field("used_memory_mb", &self.used_memory_mb)?;
        s.serialize_field("free_memory_mb", &self.free_memory_mb)?;
        s.serialize_field("free_memory_gb", &((self.free_memory_gb() * 100.0).round() / 100.0))?;
        s.serialize_field("utilization_percent", &self.utilization_percent)?;
        s.serialize_field("temperature", &self.temperature)?;
        s.serialize_field("is_idle", &self.is_idle())?;
        s.end()
    }
}

/// Source of GPU telemetry consulted by the scheduler tick and the `status`
/// handler. Injected so the scheduler can be exercised without real devices.
#[cfg_attr(test, mockall::automock)]
pub trait GpuProbe: Send + Sync {
    fn device_count(&mut self) -> Result<u32>;

    fn device_status(&mut self, index: u32) -> Result<GpuStatus>;

    /// Snapshot of all devices. A backend failure yields an empty list, which
    /// the scheduler treats as "no GPUs available right now".
    fn snapshot(&mut self) -> Vec<GpuStatus>;
}

/// NVML-backed probe. Initialization is lazy and idempotent: the first call
/// that needs the library loads it, and a failed load is retried on the next
/// call rather than wedging the daemon.
pub struct NvmlProbe {
    nvml: Option<Nvml>,
}

impl NvmlProbe {
    pub fn new() -> Self {
        Self { nvml: None }
    }

    fn ensure_init(&mut self) -> Result<&Nvml> {
        if self.nvml.is_none() {
            let nvml = Nvml::init().context("failed to initialize NVML")?;
            tracing::info!("NVML initialized");
            self.nvml = Some(nvml);
        }
        self.nvml.as_ref().context("NVML unavailable")
    }
}

impl Default for NvmlProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe for NvmlProbe {
    fn device_count(&mut self) -> Result<u32> {
        let nvml = self.ensure_init()?;
        nvml.device_count().context("failed to get device count")
    }

    fn device_status(&mut self, index: u32) -> Result<GpuStatus> {
        let nvml = self.ensure_init()?;
        let device = nvml
            .device_by_index(index)
            .with_context(|| format!("failed to open device {index}"))?;

        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let memory = device
            .memory_info()
            .with_context(|| format!("failed to read memory info for device {index}"))?;
        let utilization = device
            .utilization_rates()
            .with_context(|| format!("failed to read utilization for device {index}"))?;
        let temperature = device.temperature(TemperatureSensor::Gpu).unwrap_or(0);

        Ok(GpuStatus {
            index,
            name,
            total_memory_mb: memory.total / (1024 * 1024),
            used_memory_mb: memory.used / (1024 * 1024),
            free_memory_mb: memory.free / (1024 * 1024),
            utilization_percent: utilization.gpu,
            temperature,
        })
    }

    fn snapshot(&mut self) -> Vec<GpuStatus> {
        let count = match self.device_count() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("GPU snapshot unavailable: {e:#}");
                return Vec::new();
            }
        };
        let mut gpus = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.device_status(index) {
                Ok(status) => gpus.push(status),
                Err(e) => {
                    tracing::warn!("GPU snapshot unavailable: {e:#}");
                    return Vec::new();
                }
            }
        }
        gpus
    }
}

/// Match a requirement against a device snapshot.
///
/// Devices outside `gpu_ids` (when set), below the memory floor, or above the
/// utilization ceiling are filtered out. When at least `gpu_count` survive,
/// the first `gpu_count` in device-index order are returned.
pub fn find_matching(req: &GpuRequirement, gpus: &[GpuStatus]) -> Option<Vec<u32>> {
    let mut candidates: Vec<u32> = gpus
        .iter()
        .filter(|gpu| match &req.gpu_ids {
            Some(ids) => ids.contains(&gpu.index),
            None => true,
        })
        .filter(|gpu| {
            if gpu.free_memory_gb() < req.min_free_memory_gb {
                tracing::debug!(
                    "GPU {}: insufficient memory ({:.1}GB < {}GB)",
                    gpu.index,
                    gpu.free_memory_gb(),
                    req.min_free_memory_gb
                );
                return false;
            }
            if f64::from(gpu.utilization_percent) > req.max_util_percent {
                tracing::debug!(
                    "GPU {}: utilization too high ({}% > {}%)",
                    gpu.index,
                    gpu.utilization_percent,
                    req.max_util_percent
                );
                return false;
            }
            true
        })
        .map(|gpu| gpu.index)
        .collect();

    candidates.sort_unstable();

    if candidates.len() >= req.gpu_count {
        candidates.truncate(req.gpu_count);
        Some(candidates)
    } else {
        tracing::debug!(
            "not enough GPUs: need {}, found {}",
            req.gpu_count,
            candidates.len()
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(index: u32, free_mb: u64, util: u32) -> GpuStatus {
        GpuStatus {
            index,
            name: format!("Test GPU {index}"),
            total_memory_mb: 24_000,
            used_memory_mb: 24_000 - free_mb,
            free_memory_mb: free_mb,
            utilization_percent: util,
            temperature: 40,
        }
    }

    fn req(
        gpu_ids: Option<Vec<u32>>,
        min_free_memory_gb: f64,
        max_util_percent: f64,
        gpu_count: usize,
    ) -> GpuRequirement {
        GpuRequirement {
            gpu_ids,
            min_free_memory_gb,
            max_util_percent,
            gpu_count,
        }
    }

    #[test]
    fn test_match_any_device() {
        let gpus = vec![gpu(0, 24_000, 0)];
        assert_eq!(
            find_matching(&req(None, 0.0, 100.0, 1), &gpus),
            Some(vec![0])
        );
    }

    #[test]
    fn test_memory_floor_filters() {
        let gpus = vec![gpu(0, 4_096, 0), gpu(1, 16_384, 0)];
        assert_eq!(
            find_matching(&req(None, 8.0, 100.0, 1), &gpus),
            Some(vec![1])
        );
        assert_eq!(find_matching(&req(None, 32.0, 100.0, 1), &gpus), None);
    }

    #[test]
    fn test_utilization_ceiling_filters() {
        let gpus = vec![gpu(0, 24_000, 95), gpu(1, 24_000, 10)];
        assert_eq!(
            find_matching(&req(None, 0.0, 50.0, 1), &gpus),
            Some(vec![1])
        );
        // The bound is inclusive.
        assert_eq!(
            find_matching(&req(None, 0.0, 10.0, 1), &gpus),
            Some(vec![1])
        );
        assert_eq!(find_matching(&req(None, 0.0, 5.0, 1), &gpus), None);
    }

    #[test]
    fn test_gpu_ids_restriction() {
        let gpus = vec![gpu(0, 24_000, 0), gpu(1, 24_000, 0), gpu(2, 24_000, 0)];
        assert_eq!(
            find_matching(&req(Some(vec![2]), 0.0, 100.0, 1), &gpus),
            Some(vec![2])
        );
        // A restricted set never matches outside itself, even when too small.
        assert_eq!(
            find_matching(&req(Some(vec![1]), 0.0, 100.0, 2), &gpus),
            None
        );
    }

    #[test]
    fn test_multi_gpu_in_index_order() {
        let gpus = vec![gpu(2, 24_000, 0), gpu(0, 24_000, 0), gpu(1, 24_000, 0)];
        assert_eq!(
            find_matching(&req(None, 0.0, 100.0, 2), &gpus),
            Some(vec![0, 1])
        );
    }

    #[test]
    fn test_empty_snapshot_never_matches() {
        assert_eq!(find_matching(&req(None, 0.0, 100.0, 1), &[]), None);
    }

    #[test]
    fn test_status_wire_shape() {
        let value = serde_json::to_value(gpu(0, 2_560, 3)).unwrap();
        assert_eq!(value["free_memory_gb"], 2.5);
        assert_eq!(value["is_idle"], true);
        assert_eq!(value["utilization_percent"], 3);
    }
}
