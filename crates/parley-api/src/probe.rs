use std::path::Path;
use std::process::Output;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

/// Reports how long a media clip plays.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn duration(&self, path: &Path) -> Result<Duration>;
}

/// How long one `ffprobe` run may take before it is killed.
pub const FFPROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shells out to `ffprobe`.
pub struct FfprobeProbe {
    program: String,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn duration(&self, path: &Path) -> Result<Duration> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path);
        let output = output_within(cmd, FFPROBE_TIMEOUT).await?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_seconds(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Run `cmd` to completion, killing the child if it outlives `limit`.
async fn output_within(mut cmd: Command, limit: Duration) -> Result<Output> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    match tokio::time::timeout(limit, cmd.kill_on_drop(true).output()).await {
        Ok(output) => output.with_context(|| format!("failed to run {}", program)),
        Err(_) => bail!("{} did not finish within {:?}", program, limit),
    }
}

fn parse_seconds(raw: &str) -> Result<Duration> {
    let secs: f64 = raw.trim().parse().with_context(|| format!("unexpected duration {:?}", raw.trim()))?;
    Duration::try_from_secs_f64(secs).with_context(|| format!("duration out of range: {}", secs))
}
