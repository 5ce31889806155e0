//! Container build engine boundary.
//!
//! An engine turns a source directory into a tagged image. Its output is a
//! stream of lines plus a one-shot terminal error. The error, when there is
//! one, is sent before the line channel closes.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Lines buffered between the engine and the build loop
pub const OUTPUT_BUFFER: usize = 1024;

pub const DOCKERFILE: &str = "Dockerfile";

/// Used when the source tree does not carry its own build definition.
pub const DEFAULT_DOCKERFILE: &str = "FROM gliderlabs/herokuish
COPY . /app
RUN /bin/herokuish buildpack build
ENV PORT 5000
EXPOSE 5000
CMD [\"/start\", \"web\"]
";

pub struct BuildOutput {
    pub lines: mpsc::Receiver<String>,
    pub error: oneshot::Receiver<String>,
}

impl BuildOutput {
    /// A connected output pair: the engine side keeps the senders.
    pub fn channel() -> (mpsc::Sender<String>, oneshot::Sender<String>, BuildOutput) {
        let (line_tx, lines) = mpsc::channel(OUTPUT_BUFFER);
        let (error_tx, error) = oneshot::channel();
        (line_tx, error_tx, BuildOutput { lines, error })
    }
}

pub trait BuildEngine: Send + Sync + 'static {
    /// Start building `source` into an image tagged `tag`. Must be called
    /// from within a tokio runtime.
    fn build(&self, source: &Path, tag: &str) -> BuildOutput;
}

/// Runs builds through the docker CLI
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
    push: bool,
}

impl DockerEngine {
    pub fn new(binary: impl Into<String>, push: bool) -> Self {
        Self {
            binary: binary.into(),
            push,
        }
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new("docker", false)
    }
}

impl BuildEngine for DockerEngine {
    fn build(&self, source: &Path, tag: &str) -> BuildOutput {
        let (line_tx, error_tx, output) = BuildOutput::channel();
        let binary = self.binary.clone();
        let push = self.push;
        let source = source.to_path_buf();
        let tag = tag.to_string();

        tokio::spawn(async move {
            let result = run_build(&binary, &source, &tag, push, &line_tx).await;
            if let Err(reason) = result {
                let _ = error_tx.send(reason);
            }
            drop(line_tx);
        });

        output
    }
}

async fn run_build(
    binary: &str,
    source: &Path,
    tag: &str,
    push: bool,
    lines: &mpsc::Sender<String>,
) -> Result<(), String> {
    info!("Building image {} from {:?}", tag, source);
    let build = [
        OsStr::new("build"),
        OsStr::new("-t"),
        OsStr::new(tag),
        source.as_os_str(),
    ];
    run_streaming(binary, &build, lines).await?;

    if push {
        info!("Pushing image {}", tag);
        run_streaming(binary, &[OsStr::new("push"), OsStr::new(tag)], lines).await?;
    }
    Ok(())
}

/// Run `binary args`, forwarding stdout and stderr lines as they appear.
async fn run_streaming(
    binary: &str,
    args: &[&OsStr],
    lines: &mpsc::Sender<String>,
) -> Result<(), String> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("could not start {}: {}", binary, e))?;

    let stdout = child.stdout.take().map(|r| forward(r, lines.clone()));
    let stderr = child.stderr.take().map(|r| forward(r, lines.clone()));
    if let Some(task) = stdout {
        let _ = task.await;
    }
    if let Some(task) = stderr {
        let _ = task.await;
    }

    let status = child
        .wait()
        .await
        .map_err(|e| format!("could not wait for {}: {}", binary, e))?;
    if !status.success() {
        return Err(format!("{} {:?} exited with {}", binary, args.first(), status));
    }
    Ok(())
}

fn forward<R>(reader: R, lines: mpsc::Sender<String>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send(line).await.is_err() {
                break;
            }
        }
    })
}

/// Write the default build definition into `dir` if it has none.
pub async fn ensure_dockerfile(dir: &Path) -> std::io::Result<()> {
    let path = dir.join(DOCKERFILE);
    if tokio::fs::try_exists(&path).await? {
        return Ok(());
    }
    debug!("No {} in {:?}, writing the buildpack default", DOCKERFILE, dir);
    tokio::fs::write(&path, DEFAULT_DOCKERFILE).await
}
