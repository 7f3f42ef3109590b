//! Runs one job's pipeline behind an isolation boundary with a hard deadline.
//!
//! Whatever goes wrong inside (a hung converter, a crash, a panic, garbage
//! output) the worker only ever sees a [`PreviewResult`]; failures collapse to
//! [`PreviewResult::Error`].
//!
//! The child-process transport is one base64-encoded JSON [`Context`] on the
//! child's stdin and one base64-encoded JSON [`PreviewResult`] on its stdout.
//! Logs go to stderr.

use crate::error::{PreviewError, Result};
use crate::job::{Context, PreviewResult};
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{error, warn};

/// Subcommand the worker binary answers to when re-executed as a job child.
pub const CHILD_COMMAND: &str = "run-job";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: &Context) -> PreviewResult;
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<String> {
    Ok(BASE64.encode(serde_json::to_vec(value)?))
}

pub fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T> {
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| PreviewError::Conversion(format!("undecodable payload: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Runs each job in a fresh child process that is killed at the deadline.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<OsString>,
    deadline: Duration,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, deadline: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            deadline,
        }
    }

    /// Re-executes the running binary with [`CHILD_COMMAND`].
    pub fn current_exe(deadline: Duration) -> std::io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec![OsString::from(CHILD_COMMAND)],
            deadline,
        ))
    }

    async fn execute(&self, ctx: &Context) -> Result<PreviewResult> {
        let payload = encode_payload(ctx)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // The child leads its own group so the tools it spawns die with it.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let group = child.id();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PreviewError::Conversion("child stdin unavailable".to_string()))?;

        // Dropping the child on timeout kills it.
        let outcome = tokio::time::timeout(self.deadline, async move {
            stdin.write_all(payload.as_bytes()).await?;
            drop(stdin);
            child.wait_with_output().await
        })
        .await;
        if let Some(group) = group {
            kill_process_group(group);
        }
        let output = outcome.map_err(|_| PreviewError::Timeout(self.deadline))??;

        if !output.status.success() {
            return Err(PreviewError::Conversion(format!(
                "pipeline process exited with {}",
                output.status
            )));
        }
        decode_payload(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Kills whatever is left of a job child's process group.
#[cfg(unix)]
fn kill_process_group(group: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(group) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(group, error = %e, "Unable to kill job process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: u32) {}

#[async_trait]
impl JobRunner for ProcessRunner {
    async fn run(&self, ctx: &Context) -> PreviewResult {
        match self.execute(ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(job_id = %ctx.job.id, error = %e, "Unable to process job");
                PreviewResult::Error
            }
        }
    }
}

/// Runs each job as a tokio task inside the worker process.
///
/// Contains panics and enforces the deadline, but a tool that exhausts
/// memory still takes the worker down with it.
pub struct TaskRunner<P> {
    pipeline: Arc<P>,
    deadline: Duration,
}

impl<P: Pipeline> TaskRunner<P> {
    pub fn new(pipeline: Arc<P>, deadline: Duration) -> Self {
        Self { pipeline, deadline }
    }
}

#[async_trait]
impl<P: Pipeline> JobRunner for TaskRunner<P> {
    async fn run(&self, ctx: &Context) -> PreviewResult {
        let pipeline = Arc::clone(&self.pipeline);
        let owned = ctx.clone();
        let mut handle = tokio::spawn(async move { pipeline.process(owned).await });

        match tokio::time::timeout(self.deadline, &mut handle).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                error!(job_id = %ctx.job.id, error = %e, "Unable to process job");
                PreviewResult::Error
            }
            Ok(Err(e)) => {
                error!(job_id = %ctx.job.id, error = %e, "Pipeline task panicked");
                PreviewResult::Error
            }
            Err(_) => {
                handle.abort();
                warn!(job_id = %ctx.job.id, deadline = ?self.deadline, "Pipeline exceeded its deadline");
                PreviewResult::Error
            }
        }
    }
}

/// Child side of [`ProcessRunner`]: reads a context from stdin, runs the
/// pipeline and writes the result to stdout.
pub async fn run_child<P: Pipeline>(pipeline: &P) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let ctx: Context = decode_payload(&input)?;

    let result = pipeline.process(ctx).await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(encode_payload(&result)?.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Artifacts, Job};
    use pretty_assertions::assert_eq;

    fn context() -> Context {
        Context::new(
            Job::new("job-1", "http://example.com/a.png", "http://caller/cb"),
            "/tmp/preview-test",
        )
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Hang,
    }

    struct FakePipeline(Behaviour);

    #[async_trait]
    impl Pipeline for FakePipeline {
        async fn process(&self, _ctx: Context) -> Result<PreviewResult> {
            match self.0 {
                Behaviour::Succeed => Ok(PreviewResult::Unsupported),
                Behaviour::Fail => Err(PreviewError::Download("boom".to_string())),
                Behaviour::Panic => panic!("converter blew up"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(PreviewResult::Unsupported)
                }
            }
        }
    }

    fn task_runner(behaviour: Behaviour) -> TaskRunner<FakePipeline> {
        TaskRunner::new(Arc::new(FakePipeline(behaviour)), Duration::from_millis(200))
    }

    #[test]
    fn test_payload_round_trip() {
        let ctx = context().with_source("/tmp/preview-test/source".into(), "image/png".into());

        let decoded: Context = decode_payload(&encode_payload(&ctx).unwrap()).unwrap();

        assert_eq!(decoded, ctx);
    }

    #[test]
    fn test_undecodable_payload() {
        assert!(decode_payload::<PreviewResult>("%%% not base64").is_err());
        let not_json = BASE64.encode("hello");
        assert!(matches!(
            decode_payload::<PreviewResult>(&not_json),
            Err(PreviewError::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_task_runner_passes_result_through() {
        assert_eq!(task_runner(Behaviour::Succeed).run(&context()).await, PreviewResult::Unsupported);
    }

    #[tokio::test]
    async fn test_task_runner_maps_failures_to_error() {
        for behaviour in [Behaviour::Fail, Behaviour::Panic, Behaviour::Hang] {
            assert_eq!(task_runner(behaviour).run(&context()).await, PreviewResult::Error);
        }
    }

    #[cfg(unix)]
    fn shell(script: String, deadline: Duration) -> ProcessRunner {
        ProcessRunner::new("/bin/sh", vec!["-c".into(), script.into()], deadline)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_decodes_child_output() {
        let mut artifacts = Artifacts::default();
        artifacts.metadata.insert("youtubeId".to_string(), "abc".into());
        let expected = PreviewResult::Done(artifacts);
        let payload = encode_payload(&expected).unwrap();
        let runner = shell(
            format!("cat > /dev/null; printf '%s\\n' '{}'", payload),
            Duration::from_secs(10),
        );

        assert_eq!(runner.run(&context()).await, expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_failures_map_to_error() {
        let cases = [
            "cat > /dev/null; exit 3".to_string(),
            "cat > /dev/null; echo definitely-not-a-result".to_string(),
            "sleep 30".to_string(),
        ];
        for script in cases {
            let runner = shell(script, Duration::from_millis(500));
            assert_eq!(runner.run(&context()).await, PreviewResult::Error);
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_deadline_kills_grandchildren() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("sleeper.pid");
        let runner = shell(
            format!("cat > /dev/null; sleep 300 & echo $! > {}; wait", pidfile.display()),
            Duration::from_secs(1),
        );

        assert_eq!(runner.run(&context()).await, PreviewResult::Error);

        let pid = std::fs::read_to_string(&pidfile).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        // gone, or a zombie waiting for init to reap it
        let state = std::fs::read_to_string(format!("/proc/{}/stat", pid.trim()))
            .ok()
            .and_then(|stat| stat.split(' ').nth(2).map(str::to_string));
        assert!(matches!(state.as_deref(), None | Some("Z")), "sleep {} is {:?}", pid.trim(), state);
    }

    #[tokio::test]
    async fn test_missing_program_maps_to_error() {
        let runner = ProcessRunner::new("/nonexistent/preview-worker", vec![], Duration::from_secs(1));
        assert_eq!(runner.run(&context()).await, PreviewResult::Error);
    }
}
