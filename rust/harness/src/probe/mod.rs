//! GPU device probing through vendor command-line tools.
//!
//! Each vendor lives in its own submodule and only knows how to invoke its
//! tool and parse its report. [`DeviceProbeChain`] dispatches between them
//! in a fixed order. A missing tool, a non-zero exit, a timeout or garbage
//! output all collapse to [`DeviceProbeResult::unknown`].

pub mod nvidia;
pub mod rocm;

use std::{fmt, process::Stdio, str::FromStr, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncReadExt, process::Command};

pub use nvidia::NvidiaSmiProbe;
pub use rocm::RocmSmiProbe;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Representative reading for the host's GPUs.
///
/// `None` means unknown, which is never the same as zero headroom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceProbeResult {
    pub vram_free_mb: Option<u64>,
    pub temperature_c: Option<u32>,
    pub utilization_percent: Option<u32>,
}

impl DeviceProbeResult {
    /// No compatible device, no tool, or probing disabled.
    #[must_use]
    pub fn unknown() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.vram_free_mb.is_none()
            && self.temperature_c.is_none()
            && self.utilization_percent.is_none()
    }
}

/// A single vendor probe.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Tool name, for logging.
    fn name(&self) -> &str;

    /// Query the tool. `None` if no usable device reading was obtained.
    async fn probe(&self) -> Option<DeviceProbeResult>;
}

/// Which probe(s) to consult.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    /// nvidia-smi first, then rocm-smi.
    #[default]
    Auto,
    NvidiaSmi,
    RocmSmi,
    None,
}

impl FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "nvidia-smi" | "nvidia" => Ok(Self::NvidiaSmi),
            "rocm-smi" | "rocm" => Ok(Self::RocmSmi),
            "none" => Ok(Self::None),
            other => Err(format!(
                "unknown probe mode '{other}' (expected auto, nvidia-smi, rocm-smi or none)"
            )),
        }
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::NvidiaSmi => "nvidia-smi",
            Self::RocmSmi => "rocm-smi",
            Self::None => "none",
        })
    }
}

/// Dispatcher over the vendor probes.
pub struct DeviceProbeChain {
    mode: ProbeMode,
    nvidia: Box<dyn DeviceProbe>,
    rocm: Box<dyn DeviceProbe>,
}

impl DeviceProbeChain {
    /// Chain using the real vendor tools from `PATH`.
    #[must_use]
    pub fn new(mode: ProbeMode) -> Self {
        Self::with_probes(
            mode,
            Box::new(NvidiaSmiProbe::default()),
            Box::new(RocmSmiProbe::default()),
        )
    }

    /// Chain with explicit vendor implementations (vendor A, vendor B).
    #[must_use]
    pub fn with_probes(
        mode: ProbeMode,
        nvidia: Box<dyn DeviceProbe>,
        rocm: Box<dyn DeviceProbe>,
    ) -> Self {
        Self { mode, nvidia, rocm }
    }

    #[must_use]
    pub fn mode(&self) -> ProbeMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ProbeMode) {
        self.mode = mode;
    }

    /// Probe according to the configured mode. Never fails.
    pub async fn probe(&self) -> DeviceProbeResult {
        let result = match self.mode {
            ProbeMode::None => None,
            ProbeMode::NvidiaSmi => self.nvidia.probe().await,
            ProbeMode::RocmSmi => self.rocm.probe().await,
            ProbeMode::Auto => match self.nvidia.probe().await {
                Some(result) => Some(result),
                None => {
                    tracing::debug!(
                        "{} gave no reading, trying {}",
                        self.nvidia.name(),
                        self.rocm.name()
                    );
                    self.rocm.probe().await
                }
            },
        };

        result.unwrap_or_else(|| {
            if self.mode != ProbeMode::None {
                tracing::debug!(mode = %self.mode, "no GPU reading available");
            }
            DeviceProbeResult::unknown()
        })
    }
}

/// Pick the device with the greatest free memory.
///
/// A new job is bounded by the most available device, not an average. Ties
/// keep the earlier row.
fn most_free<I>(devices: I) -> Option<DeviceProbeResult>
where
    I: IntoIterator<Item = DeviceProbeResult>,
{
    devices.into_iter().fold(None, |best, device| match best {
        Some(b) if b.vram_free_mb >= device.vram_free_mb => Some(b),
        _ => Some(device),
    })
}

/// Run a short-lived vendor tool and return its stdout on success.
///
/// Absence of the tool or a non-zero exit is an expected outcome and only
/// logged at debug level. A tool that outlives `timeout` is killed and
/// reaped before this returns.
async fn run_tool(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(tool = program, error = %e, "probe tool unavailable");
            return None;
        }
    };
    let mut stdout = child.stdout.take()?;

    let finished = tokio::time::timeout(timeout, async {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, buf))
    })
    .await;

    let (status, buf) = match finished {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::debug!(tool = program, error = %e, "probe tool output unreadable");
            return None;
        }
        Err(_elapsed) => {
            tracing::debug!(tool = program, ?timeout, "probe tool timed out");
            if let Err(e) = child.kill().await {
                tracing::debug!(tool = program, error = %e, "failed to kill probe tool");
            }
            return None;
        }
    };

    if !status.success() {
        tracing::debug!(tool = program, %status, "probe tool failed");
        return None;
    }

    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse an integer cell, tolerating surrounding whitespace.
fn parse_int(cell: &str) -> Option<u64> {
    cell.trim().parse().ok()
}

/// Parse a numeric cell that may carry a fractional part, rounding to the
/// nearest integer. Negative and non-finite values are rejected.
fn parse_rounded(cell: &str) -> Option<u32> {
    let value: f64 = cell.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 || value > f64::from(u32::MAX) {
        return None;
    }
    Some(value.round() as u32)
}
