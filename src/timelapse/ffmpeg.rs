//! External video encoder invocation

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("video encoder exited with {status}: {output}")]
    Failed { status: ExitStatus, output: String },
}

/// One encoder run: a glob of stills in, one video file out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeJob {
    pub input_glob: PathBuf,
    pub output: PathBuf,
    pub framerate: u32,
    /// Copy the JPEG stream into the container instead of re-encoding.
    pub stream_copy: bool,
    /// Container format, for outputs whose extension does not name one.
    pub format: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct EncodeReport {
    pub elapsed: Duration,
    /// Combined stdout and stderr of the encoder.
    pub output: String,
}

/// Turns an ordered set of stills into a video.
///
/// Implementations run to completion once started; callers never abort
/// an encode midway.
pub trait VideoEncoder: Send + Sync {
    fn encode<'a>(&'a self, job: &'a EncodeJob) -> BoxFuture<'a, Result<EncodeReport, EncodeError>>;
}

/// Runs `ffmpeg` (or a compatible program) as a child process.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(job: &EncodeJob) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-framerate".into(),
            job.framerate.to_string().into(),
            "-pattern_type".into(),
            "glob".into(),
            "-i".into(),
            job.input_glob.clone().into_os_string(),
        ];
        if job.stream_copy {
            args.push("-codec".into());
            args.push("copy".into());
        }
        if let Some(format) = job.format {
            args.push("-f".into());
            args.push(format.into());
        }
        args.push(job.output.clone().into_os_string());
        args
    }

    async fn run(&self, job: &EncodeJob) -> Result<EncodeReport, EncodeError> {
        let args = Self::args(job);
        debug!(program = %self.program.display(), ?args, "Running video encoder");

        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| EncodeError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        let elapsed = started.elapsed();

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(EncodeError::Failed {
                status: output.status,
                output: combined,
            });
        }

        Ok(EncodeReport {
            elapsed,
            output: combined,
        })
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode<'a>(&'a self, job: &'a EncodeJob) -> BoxFuture<'a, Result<EncodeReport, EncodeError>> {
        Box::pin(self.run(job))
    }
}
