//! Pulls executed by a separate worker process.
//!
//! The parent writes one [`PullJob`] as JSON to the worker's stdin and
//! closes it. The worker answers with newline-delimited [`PullEvent`]s on
//! stdout and writes fatal errors to stderr. A pull succeeded only if the
//! worker exited with status 0 *and* reported [`PullEvent::Done`].

use std::error::Error as StdError;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use blobcache::BlobCache;
use camino::Utf8PathBuf;
use references::RegistryImageReference;
use serde::{Deserialize, Serialize};
use store::Storage;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::IsolatedPullConfig;
use crate::destination::{PullProgress, StoreDestination};
use crate::error::{Error, Result};
use crate::pull::PullOptions;
use crate::tee::CachingDestination;
use crate::transport::{ImageTransport, DOCKER_TRANSPORT};

/// The work handed to a pull worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullJob {
    /// Transport-qualified source, e.g. `docker://quay.io/app:v1`.
    pub image: String,
    /// Registry credentials.
    pub source_auth_file: Option<Utf8PathBuf>,
    /// Registry recorded as the source of cached blobs.
    pub registry: String,
    /// Repository recorded as the source of cached blobs.
    pub repository: String,
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PullEvent {
    /// A blob finished arriving.
    Progress {
        /// The blob's digest.
        digest: String,
        /// Bytes received.
        offset: u64,
        /// Advertised size.
        total: Option<u64>,
    },
    /// Something went wrong that did not fail the pull.
    Warning {
        /// What went wrong.
        message: String,
    },
    /// The image is committed.
    Done {
        /// The stored image's ID.
        image_id: String,
    },
}

/// Moves a process into a transient cgroup scope, typically through systemd.
#[async_trait::async_trait]
pub trait CgroupMover: fmt::Debug + Send + Sync {
    /// Move `pid` into a new scope called `scope`.
    async fn move_to_scope(
        &self,
        pid: u32,
        scope: &str,
    ) -> Result<(), Box<dyn StdError + Send + Sync + 'static>>;
}

/// What the worker reported.
#[derive(Debug, Default)]
pub(crate) struct WorkerReport {
    pub(crate) image_id: Option<String>,
    pub(crate) warnings: Vec<String>,
}

/// Run `job` in a worker process and wait for its verdict.
#[tracing::instrument(skip_all, fields(image = %job.image))]
pub(crate) async fn pull_isolated(
    config: &IsolatedPullConfig,
    mover: Option<&dyn CgroupMover>,
    job: &PullJob,
    options: &PullOptions,
) -> Result<WorkerReport> {
    let request = serde_json::to_vec(job)
        .map_err(|err| Error::PullProtocol(format!("encode pull job: {err}")))?;

    let mut child = Command::new(config.program.as_std_path())
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(Error::io(format!("spawn pull worker {}", config.program)))?;

    if let Some(mover) = mover {
        let scope = format!("{}-{}.scope", config.scope_prefix, uuid::Uuid::new_v4().simple());
        let moved = match child.id() {
            Some(pid) => mover.move_to_scope(pid, &scope).await,
            None => Err("worker exited before it could be moved".into()),
        };
        if let Err(error) = moved {
            let _ = child.kill().await;
            return Err(Error::Cgroup { scope, error });
        }
        tracing::debug!(%scope, "moved pull worker");
    }

    let missing = |stream: &str| Error::PullProtocol(format!("worker {stream} is not piped"));
    let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let mut stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    let send_job = async move {
        stdin.write_all(&request).await?;
        stdin.shutdown().await
    };
    let read_events = read_events(stdout, options.progress.as_ref());
    let read_stderr = async move {
        let mut text = String::new();
        stderr.read_to_string(&mut text).await.map(|_| text)
    };

    let (sent, report, stderr) = tokio::select! {
        biased;
        _ = options.cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
        results = async { tokio::join!(send_job, read_events, read_stderr) } => results,
    };

    // Only after stderr is drained is the exit status the whole story.
    let stderr = stderr.map_err(Error::io("read pull worker stderr"))?;
    let status = child
        .wait()
        .await
        .map_err(Error::io("wait for pull worker"))?;
    if !status.success() {
        return Err(Error::IsolatedPull {
            status: status.to_string(),
            stderr: stderr.trim().to_owned(),
        });
    }

    sent.map_err(Error::io("send job to pull worker"))?;
    let report = report?;
    if report.image_id.is_none() {
        return Err(Error::PullProtocol(
            "worker exited without reporting an image".into(),
        ));
    }
    Ok(report)
}

async fn read_events<R: AsyncRead + Unpin>(
    stdout: R,
    progress: Option<&mpsc::UnboundedSender<PullProgress>>,
) -> Result<WorkerReport> {
    let mut report = WorkerReport::default();
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(Error::io("read pull worker output"))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let event: PullEvent = serde_json::from_str(&line)
            .map_err(|err| Error::PullProtocol(format!("unreadable event {line:?}: {err}")))?;

        match event {
            PullEvent::Progress {
                digest,
                offset,
                total,
            } => {
                if let Some(progress) = progress {
                    let _ = progress.send(PullProgress {
                        digest,
                        offset,
                        total,
                    });
                }
            }
            PullEvent::Warning { message } => {
                tracing::warn!("pull worker: {message}");
                report.warnings.push(message);
            }
            PullEvent::Done { image_id } => report.image_id = Some(image_id),
        }
    }
    Ok(report)
}

async fn write_event<W: AsyncWrite + Unpin>(output: &mut W, event: &PullEvent) -> Result<()> {
    let mut line = serde_json::to_vec(event)
        .map_err(|err| Error::PullProtocol(format!("encode pull event: {err}")))?;
    line.push(b'\n');
    output
        .write_all(&line)
        .await
        .map_err(Error::io("write pull event"))
}

/// Install a subscriber that logs to stderr, the only stream a worker may
/// use for free text.
pub fn init_worker_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// The worker side: read a job from `input`, pull it into `store`, and
/// report on `output`.
///
/// The caller turns an error into text on stderr and a non-zero exit status.
pub async fn run_pull_worker<I, O>(
    mut input: I,
    mut output: O,
    store: Storage,
    transport: &dyn ImageTransport,
    cache: Option<Arc<BlobCache>>,
) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + Send,
{
    let mut request = Vec::new();
    input
        .read_to_end(&mut request)
        .await
        .map_err(Error::io("read pull job"))?;
    let job: PullJob = serde_json::from_slice(&request)
        .map_err(|err| Error::PullProtocol(format!("unreadable pull job: {err}")))?;

    let name = job.image.strip_prefix(DOCKER_TRANSPORT).ok_or_else(|| {
        Error::PullProtocol(format!("{} is not a registry source", job.image))
    })?;
    let reference = RegistryImageReference::parse_qualified(name).map_err(Error::reference(name))?;
    tracing::info!(image = %job.image, "pull worker starting");

    let (tx, mut rx) = mpsc::unbounded_channel();

    // Owns the progress sender, so the forwarding loop ends with it.
    let copy = async move {
        let destination = StoreDestination::new(store, reference).with_progress(tx);
        let auth_file = job.source_auth_file.as_deref();
        let (copied, mut destination, warnings) = match cache {
            Some(cache) => {
                let mut caching = CachingDestination::new(
                    destination,
                    cache,
                    job.registry.clone(),
                    job.repository.clone(),
                    CancellationToken::new(),
                );
                let copied = transport.copy(&job.image, auth_file, &mut caching).await;
                let warnings = caching.take_warnings();
                (copied, caching.into_inner(), warnings)
            }
            None => {
                let mut destination = destination;
                let copied = transport.copy(&job.image, auth_file, &mut destination).await;
                (copied, destination, Vec::new())
            }
        };
        if let Err(error) = copied {
            destination.discard().await;
            return Err(error);
        }
        let committed = destination.committed().cloned().ok_or_else(|| {
            Error::PullProtocol("transport finished without committing the image".into())
        })?;
        Ok((committed, warnings))
    };
    let forward = async {
        while let Some(progress) = rx.recv().await {
            let event = PullEvent::Progress {
                digest: progress.digest,
                offset: progress.offset,
                total: progress.total,
            };
            write_event(&mut output, &event).await?;
        }
        Ok::<_, Error>(())
    };

    let (copied, forwarded) = tokio::join!(copy, forward);
    let (committed, warnings) = copied?;
    forwarded?;

    for message in warnings {
        write_event(&mut output, &PullEvent::Warning { message }).await?;
    }

    let image_id = committed
        .image_id
        .id_string_for_out_of_process_consumption_only()
        .to_owned();
    write_event(&mut output, &PullEvent::Done { image_id }).await?;
    output.flush().await.map_err(Error::io("flush pull events"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeImage, FakeTransport};
    use store::{MemoryStore, Store};

    fn shell(script: &str) -> IsolatedPullConfig {
        IsolatedPullConfig {
            enabled: true,
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            scope_prefix: "test-pull".into(),
        }
    }

    fn job() -> PullJob {
        PullJob {
            image: "docker://quay.io/test/app:v1".into(),
            source_auth_file: None,
            registry: "quay.io".into(),
            repository: "test/app".into(),
        }
    }

    #[test]
    fn events_are_tagged() {
        let event = PullEvent::Done {
            image_id: "abc".into(),
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"done","image_id":"abc"}"#
        );
        let parsed: PullEvent =
            serde_json::from_str(r#"{"event":"warning","message":"slow"}"#).unwrap();
        assert_eq!(
            parsed,
            PullEvent::Warning {
                message: "slow".into()
            }
        );
    }

    #[tokio::test]
    async fn reads_events_until_done() {
        let config = shell(
            r#"cat >/dev/null
echo '{"event":"progress","digest":"sha256:aa","offset":3,"total":3}'
echo '{"event":"warning","message":"cache full"}'
echo '{"event":"done","image_id":"feed"}'"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = PullOptions {
            progress: Some(tx),
            ..Default::default()
        };

        let report = pull_isolated(&config, None, &job(), &options).await.unwrap();
        assert_eq!(report.image_id.as_deref(), Some("feed"));
        assert_eq!(report.warnings, vec!["cache full".to_string()]);
        assert_eq!(rx.recv().await.unwrap().digest, "sha256:aa");
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let config = shell("cat >/dev/null; echo 'registry unreachable' >&2; exit 3");
        let err = pull_isolated(&config, None, &job(), &PullOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::IsolatedPull { stderr, .. } => assert_eq!(stderr, "registry unreachable"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn success_without_done_is_an_error() {
        let config = shell("cat >/dev/null; exit 0");
        let err = pull_isolated(&config, None, &job(), &PullOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PullProtocol(_)));
    }

    #[tokio::test]
    async fn worker_receives_the_job_on_stdin() {
        let config = shell(
            r#"grep -q '"image":"docker://quay.io/test/app:v1"' || exit 9
echo '{"event":"done","image_id":"feed"}'"#,
        );
        let report = pull_isolated(&config, None, &job(), &PullOptions::default())
            .await
            .unwrap();
        assert_eq!(report.image_id.as_deref(), Some("feed"));
    }

    #[derive(Debug)]
    struct RefusingMover;

    #[async_trait::async_trait]
    impl CgroupMover for RefusingMover {
        async fn move_to_scope(
            &self,
            _pid: u32,
            scope: &str,
        ) -> Result<(), Box<dyn StdError + Send + Sync + 'static>> {
            assert!(scope.starts_with("test-pull-"));
            Err("no systemd here".into())
        }
    }

    #[tokio::test]
    async fn failed_move_kills_the_worker() {
        let config = shell("sleep 30");
        let err = pull_isolated(&config, Some(&RefusingMover), &job(), &PullOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cgroup { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_the_worker() {
        let config = shell("sleep 30");
        let options = PullOptions::default();
        options.cancel.cancel();
        let err = pull_isolated(&config, None, &job(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn worker_pulls_and_reports() {
        init_worker_logging();
        let image = FakeImage::new(&[b"worker layer"], "0");
        let transport = FakeTransport::default();
        transport.insert("quay.io/test/app:v1", image.clone());
        let store = Storage::from(MemoryStore::new("vfs"));

        let request = serde_json::to_vec(&job()).unwrap();
        let mut output = Vec::new();
        run_pull_worker(&request[..], &mut output, store.clone(), &transport, None)
            .await
            .unwrap();

        let events: Vec<PullEvent> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], PullEvent::Progress { .. }));
        let id = image.id();
        assert_eq!(
            events.last(),
            Some(&PullEvent::Done {
                image_id: id.id_string_for_out_of_process_consumption_only().into()
            })
        );
        store
            .image(id.id_string_for_out_of_process_consumption_only())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn worker_rejects_non_registry_sources() {
        let transport = FakeTransport::default();
        let store = Storage::from(MemoryStore::new("vfs"));
        let mut job = job();
        job.image = "oci:/srv/layout:v1".into();
        let request = serde_json::to_vec(&job).unwrap();

        let err = run_pull_worker(&request[..], Vec::new(), store, &transport, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PullProtocol(_)));
    }
}
