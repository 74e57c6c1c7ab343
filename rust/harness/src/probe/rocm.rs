//! AMD probe via `rocm-smi`.
//!
//! The CSV layout differs between ROCm releases, so columns are located by
//! header name rather than position.

use std::time::Duration;

use async_trait::async_trait;

use super::{
    BYTES_PER_MB, DeviceProbe, DeviceProbeResult, most_free, parse_int, parse_rounded, run_tool,
};

const QUERY_ARGS: [&str; 5] = ["--showmeminfo", "vram", "--showtemp", "--showuse", "--csv"];

/// Probe backed by `rocm-smi`.
#[derive(Debug, Clone)]
pub struct RocmSmiProbe {
    program: String,
    timeout: Duration,
}

impl Default for RocmSmiProbe {
    fn default() -> Self {
        Self::new("rocm-smi", Duration::from_secs(5))
    }
}

impl RocmSmiProbe {
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DeviceProbe for RocmSmiProbe {
    fn name(&self) -> &str {
        &self.program
    }

    async fn probe(&self) -> Option<DeviceProbeResult> {
        let stdout = run_tool(&self.program, &QUERY_ARGS, self.timeout).await?;
        parse_report(&stdout)
    }
}

/// Column positions resolved from the header row.
#[derive(Debug, Default)]
struct Columns {
    total: Option<usize>,
    used: Option<usize>,
    temp: Option<usize>,
    util: Option<usize>,
}

impl Columns {
    fn from_header(header: &str) -> Self {
        let names: Vec<String> = header.split(',').map(|c| c.trim().to_lowercase()).collect();
        let find = |pred: fn(&str) -> bool| names.iter().position(|n| pred(n));
        Self {
            total: find(|n| n.contains("total") && n.contains("vram") && !n.contains("used")),
            used: find(|n| n.contains("used") && n.contains("vram")),
            temp: find(|n| n.contains("temp")),
            util: find(|n| n.contains("gpu use") || n.contains("utilization")),
        }
    }
}

/// Parse the CSV report. VRAM is reported in bytes and normalised to MB
/// before comparison.
#[must_use]
pub fn parse_report(stdout: &str) -> Option<DeviceProbeResult> {
    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
    let cols = Columns::from_header(lines.next()?);
    let (total_idx, used_idx) = (cols.total?, cols.used?);

    let devices = lines.filter_map(|line| {
        let cells: Vec<&str> = line.split(',').collect();
        let total_mb = parse_int(cells.get(total_idx)?)? / BYTES_PER_MB;
        let used_mb = parse_int(cells.get(used_idx)?)? / BYTES_PER_MB;
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| cells.get(i))
                .and_then(|c| parse_rounded(c))
        };
        Some(DeviceProbeResult {
            vram_free_mb: Some(total_mb.saturating_sub(used_mb)),
            temperature_c: cell(cols.temp),
            utilization_percent: cell(cols.util),
        })
    });
    most_free(devices)
}
