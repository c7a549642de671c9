use crate::error::ExpError;
use crate::progress::TracingProgressBar;
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

// code recorded for processes terminated by a signal
const SIGNALED: i32 = -1;

/// Exit code of a run stopped by the operator.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i32),
    Killed,
}

/// A spawned local or remote (ssh) process and its output sinks.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    host: String,
    command: String,
    child: tokio::process::Child,
    pid: Option<u32>,
    stdout: PathBuf,
    stderr: PathBuf,
    state: ProcessState,
}

impl ProcessHandle {
    pub fn new(
        name: String,
        host: String,
        command: String,
        child: tokio::process::Child,
        stdout: PathBuf,
        stderr: PathBuf,
    ) -> Self {
        // gone once the child is reaped
        let pid = child.id();
        Self {
            name,
            host,
            command,
            child,
            pid,
            stdout,
            stderr,
            state: ProcessState::Running,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdout(&self) -> &Path {
        &self.stdout
    }

    pub fn stderr(&self) -> &Path {
        &self.stderr
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Id of the local child; for ssh processes, that of the ssh client.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn summary(&self) -> ProcessSummary {
        ProcessSummary {
            name: self.name.clone(),
            host: self.host.clone(),
            pid: self.pid,
            state: self.state,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    /// Waits for the process to exit and returns its exit code. Cancel safe.
    pub async fn wait(&mut self) -> Result<i32, Report> {
        match self.state {
            ProcessState::Exited(code) => return Ok(code),
            ProcessState::Killed => return Ok(SIGNALED),
            ProcessState::Running => {}
        }
        let status = self
            .child
            .wait()
            .await
            .wrap_err_with(|| format!("wait for {}", self.name))?;
        let code = status.code().unwrap_or(SIGNALED);
        self.state = ProcessState::Exited(code);
        Ok(code)
    }

    /// Returns the exit code if the process has exited, without blocking.
    pub fn try_wait(&mut self) -> Option<i32> {
        if let ProcessState::Exited(code) = self.state {
            return Some(code);
        }
        if !self.is_running() {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(SIGNALED);
                self.state = ProcessState::Exited(code);
                Some(code)
            }
            _ => None,
        }
    }

    /// Kills the process if it's still running. Idempotent.
    pub async fn kill(&mut self) {
        if !self.is_running() {
            return;
        }
        // it may have exited on its own in the meantime
        if let Ok(Some(status)) = self.child.try_wait() {
            let code = status.code().unwrap_or(SIGNALED);
            self.state = ProcessState::Exited(code);
            return;
        }
        if let Err(e) = self.child.kill().await {
            let (name, host) = (&self.name, &self.host);
            tracing::warn!("error killing {} on {}: {:?}", name, host, e);
        }
        self.state = ProcessState::Killed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub name: String,
    pub host: String,
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// How a process ended up, reported once a definition is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub name: String,
    pub host: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
}

/// Owns every process spawned for a definition run.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    handles: Vec<ProcessHandle>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: ProcessHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = &ProcessHandle> {
        self.handles.iter()
    }

    pub fn running(&self) -> usize {
        self.handles
            .iter()
            .filter(|handle| handle.is_running())
            .count()
    }

    /// Takes over the handles of `other`.
    pub fn absorb(&mut self, other: ProcessRegistry) {
        self.handles.extend(other.handles);
    }

    pub fn summaries(&self) -> Vec<ProcessSummary> {
        self.handles.iter().map(ProcessHandle::summary).collect()
    }

    /// Processes that already exited, e.g. servers that failed to start.
    pub fn exited(&mut self) -> Vec<WorkerExit> {
        self.handles
            .iter_mut()
            .filter_map(|handle| {
                handle.try_wait().map(|code| WorkerExit {
                    name: handle.name.clone(),
                    host: handle.host.clone(),
                    code: Some(code),
                })
            })
            .collect()
    }

    /// Kills every handle still running.
    pub async fn kill_all(&mut self) {
        let kills = self.handles.iter_mut().map(|handle| handle.kill());
        futures::future::join_all(kills).await;
    }

    /// Waits for every registered process. All exit codes are collected
    /// before a `PartialFailure` is reported; if `interrupt` fires first,
    /// everything still running is killed.
    pub async fn wait_all(
        &mut self,
        interrupt: &Interrupt,
        progress: &TracingProgressBar,
    ) -> Result<Vec<WorkerExit>, Report> {
        let outcome = {
            let waits = self.handles.iter_mut().map(|handle| async move {
                let result = handle.wait().await;
                progress.inc();
                match result {
                    Ok(code) => Some(code),
                    Err(e) => {
                        tracing::warn!("{:?}", e);
                        None
                    }
                }
            });
            tokio::select! {
                codes = futures::future::join_all(waits) => Some(codes),
                _ = interrupt.fired() => None,
            }
        };

        let codes = match outcome {
            Some(codes) => codes,
            None => {
                let running = self.running();
                tracing::warn!("interrupted; killing {} process(es)", running);
                self.kill_all().await;
                return Err(ExpError::Interrupted.into());
            }
        };

        let exits: Vec<_> = self
            .handles
            .iter()
            .zip(codes)
            .map(|(handle, code)| WorkerExit {
                name: handle.name.clone(),
                host: handle.host.clone(),
                code,
            })
            .collect();

        let failed: Vec<_> =
            exits.iter().filter(|exit| !exit.success()).collect();
        if failed.is_empty() {
            return Ok(exits);
        }
        for exit in &failed {
            let (name, host) = (&exit.name, &exit.host);
            tracing::warn!("{} on {} exited with {:?}", name, host, exit.code);
        }
        Err(ExpError::PartialFailure {
            first_code: failed.iter().find_map(|exit| exit.code),
            failed: failed.iter().map(|exit| exit.name.clone()).collect(),
        }
        .into())
    }
}

/// Operator interrupt, shared by everything that may need to stop early.
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Triggers this interrupt on the first Ctrl-C. A second one exits the
    /// process right away, e.g. when teardown hangs on an unreachable host.
    pub fn listen_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let interrupt = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupt.escalate() {
                    tracing::error!("received a second ctrl-c; exiting now");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
                tracing::warn!("received ctrl-c; stopping (again to force)");
            }
        })
    }

    pub fn trigger(&self) {
        // we hold a receiver, so this can't fail
        let _ = self.tx.send(true);
    }

    /// Triggers the interrupt and returns whether it was already set.
    pub fn escalate(&self) -> bool {
        let already = self.is_set();
        self.trigger();
        already
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the interrupt is triggered.
    pub async fn fired(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // unreachable while `self` holds the sender
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::machine::{Machine, RemoteCommand};
    use std::time::Duration;

    fn spawn(
        registry: &mut ProcessRegistry,
        dir: &Path,
        name: &str,
        script: &str,
    ) {
        let out = dir.join(format!("{}.txt", name));
        let command = RemoteCommand::new(args!["sh", "-c", script]);
        let handle = Machine::Local.spawn(name, &command, &out, &out).unwrap();
        registry.register(handle);
    }

    #[tokio::test]
    async fn partial_failure_names_failed_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ProcessRegistry::new();
        for i in 0..5 {
            let script = if i == 1 || i == 3 { "exit 2" } else { "exit 0" };
            spawn(&mut registry, dir.path(), &format!("client_{}", i), script);
        }

        let error = registry
            .wait_all(&Interrupt::new(), &TracingProgressBar::hidden())
            .await
            .unwrap_err();
        match ExpError::find(&error) {
            Some(ExpError::PartialFailure { failed, first_code }) => {
                let expected =
                    vec!["client_1".to_string(), "client_3".to_string()];
                assert_eq!(failed, &expected);
                assert_eq!(*first_code, Some(2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(registry.running(), 0);
    }

    #[tokio::test]
    async fn wait_all_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ProcessRegistry::new();
        spawn(&mut registry, dir.path(), "a", "echo a");
        spawn(&mut registry, dir.path(), "b", "echo b");
        let exits = registry
            .wait_all(&Interrupt::new(), &TracingProgressBar::hidden())
            .await
            .unwrap();
        assert!(exits.iter().all(WorkerExit::success));
        let content =
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "a\n");
    }

    #[tokio::test]
    async fn interrupt_kills_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ProcessRegistry::new();
        spawn(&mut registry, dir.path(), "fast", "exit 0");
        spawn(&mut registry, dir.path(), "slow_0", "exec sleep 30");
        spawn(&mut registry, dir.path(), "slow_1", "exec sleep 30");

        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.trigger();
        });

        let error = registry
            .wait_all(&interrupt, &TracingProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(ExpError::is_interrupted(&error));
        assert_eq!(registry.running(), 0);
        assert!(registry
            .handles()
            .all(|handle| handle.state() != ProcessState::Running));
    }

    #[tokio::test]
    async fn summaries_outlive_moved_registries() {
        let dir = tempfile::tempdir().unwrap();
        let mut workers = ProcessRegistry::new();
        spawn(&mut workers, dir.path(), "populate_0", "exit 0");
        workers
            .wait_all(&Interrupt::new(), &TracingProgressBar::hidden())
            .await
            .unwrap();

        let mut retired = ProcessRegistry::new();
        spawn(&mut retired, dir.path(), "server_0", "exec sleep 30");
        retired.absorb(workers);
        retired.kill_all().await;

        let summaries = retired.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, "server_0");
        assert_eq!(summaries[0].state, ProcessState::Killed);
        assert_eq!(summaries[1].name, "populate_0");
        assert_eq!(summaries[1].state, ProcessState::Exited(0));
        assert!(summaries.iter().all(|summary| summary.pid.is_some()));
    }

    #[test]
    fn second_interrupt_escalates() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.escalate());
        assert!(interrupt.is_set());
        assert!(interrupt.clone().escalate());
    }

    #[tokio::test]
    async fn kill_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ProcessRegistry::new();
        spawn(&mut registry, dir.path(), "server", "exec sleep 30");
        registry.kill_all().await;
        registry.kill_all().await;
        let states: Vec<_> =
            registry.handles().map(ProcessHandle::state).collect();
        assert_eq!(states, vec![ProcessState::Killed]);
    }
}
