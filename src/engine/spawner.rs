//! Process spawning abstraction over the engine subprocess, so the launcher
//! can be exercised against a fake process in tests instead of a real
//! xray/v2ray binary.

use std::io;
use std::path::Path;
use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::process::{Child, Command};

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(
        &self,
        bin: &str,
        args: &[String],
        workdir: &Path,
    ) -> io::Result<Box<dyn SpawnedProcess>>;
}

#[async_trait]
pub trait SpawnedProcess: Send {
    fn id(&self) -> Option<u32>;
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    async fn kill(&mut self) -> io::Result<()>;
    async fn wait(&mut self) -> io::Result<ExitStatus>;
}

/// Spawns the real engine binary, logging its stdout/stderr to `engine.log`
/// in the bridge workdir, same as `SingBoxController` does.
pub struct TokioSpawner;

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(
        &self,
        bin: &str,
        args: &[String],
        workdir: &Path,
    ) -> io::Result<Box<dyn SpawnedProcess>> {
        let log_path = workdir.join("engine.log");
        let stdout_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        let stderr_log = stdout_log.try_clone().await?;

        let child = Command::new(bin)
            .args(args)
            .current_dir(workdir)
            .stdout(stdout_log.into_std().await)
            .stderr(stderr_log.into_std().await)
            .kill_on_drop(true)
            .spawn()?;

        Ok(Box::new(TokioProcess { child }))
    }
}

struct TokioProcess {
    child: Child,
}

#[async_trait]
impl SpawnedProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}
