//! NVIDIA probe via `nvidia-smi`.

use std::time::Duration;

use async_trait::async_trait;

use super::{DeviceProbe, DeviceProbeResult, most_free, parse_int, parse_rounded, run_tool};

const QUERY_ARGS: [&str; 2] = [
    "--query-gpu=memory.used,memory.free,temperature.gpu,utilization.gpu",
    "--format=csv,noheader,nounits",
];

/// Probe backed by `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    program: String,
    timeout: Duration,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new("nvidia-smi", Duration::from_secs(3))
    }
}

impl NvidiaSmiProbe {
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DeviceProbe for NvidiaSmiProbe {
    fn name(&self) -> &str {
        &self.program
    }

    async fn probe(&self) -> Option<DeviceProbeResult> {
        let stdout = run_tool(&self.program, &QUERY_ARGS, self.timeout).await?;
        parse_report(&stdout)
    }
}

/// Parse `memory.used, memory.free, temperature.gpu, utilization.gpu` rows
/// (MiB, °C, %), one per GPU.
///
/// Rows without a numeric free-memory figure are dropped. A non-numeric
/// temperature or utilization (e.g. `[N/A]` on some boards) is kept as unknown.
#[must_use]
pub fn parse_report(stdout: &str) -> Option<DeviceProbeResult> {
    let devices = stdout.lines().filter_map(|line| {
        let cols: Vec<&str> = line.split(',').collect();
        if cols.len() < 4 {
            return None;
        }
        parse_int(cols[0])?;
        Some(DeviceProbeResult {
            vram_free_mb: Some(parse_int(cols[1])?),
            temperature_c: parse_rounded(cols[2]),
            utilization_percent: parse_rounded(cols[3]),
        })
    });
    most_free(devices)
}
