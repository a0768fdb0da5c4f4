#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::{mpsc, watch};
use url::Url;
use uuid::Uuid;

use matchday_core::fileserver::{
    Credentials, FileServerError, FileServerPlugin, FileServerResult, SessionCookie,
};
use matchday_core::transcode::{
    CommandBuilder, MetadataProbe, ProcessExit, ProcessSpawner, SupervisorSettings,
    TranscodeCommand, TranscodeListener, TranscodeProcess, TranscodeSupervisor,
};

static NEXT_PID: AtomicU32 = AtomicU32::new(1000);

/// Process double that runs until told to finish or killed.
pub struct MockProcess {
    pid: u32,
    alive: AtomicBool,
    /// When set, `kill` only signals; the exit is published by `reap`.
    linger_on_kill: bool,
    exit: watch::Sender<Option<ProcessExit>>,
    lines_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    lines_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl MockProcess {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// A process that keeps running after `kill` until it is reaped.
    pub fn lingering() -> Arc<Self> {
        Self::build(true)
    }

    fn build(linger_on_kill: bool) -> Arc<Self> {
        let (exit, _) = watch::channel(None);
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            alive: AtomicBool::new(true),
            linger_on_kill,
            exit,
            lines_tx: Mutex::new(Some(tx)),
            lines_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn emit(&self, line: &str) {
        if let Some(tx) = self.lines_tx.lock().unwrap().as_ref() {
            let _ = tx.send(line.to_string());
        }
    }

    pub fn finish(&self, code: i32) {
        self.settle(ProcessExit::exited(code));
    }

    /// Reports dead without ever publishing an exit.
    pub fn vanish(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.lines_tx.lock().unwrap().take();
    }

    /// Publishes the exit of a killed lingering process.
    pub fn reap(&self) {
        self.settle(ProcessExit::killed());
    }

    pub fn was_killed(&self) -> bool {
        matches!(*self.exit.borrow(), Some(exit) if exit.killed)
    }

    fn settle(&self, exit: ProcessExit) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.lines_tx.lock().unwrap().take();
            self.exit.send_replace(Some(exit));
        }
    }
}

#[async_trait]
impl TranscodeProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn kill(&self) {
        if !self.linger_on_kill {
            self.settle(ProcessExit::killed());
        }
    }

    async fn wait_for_exit(&self) -> ProcessExit {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return ProcessExit::killed();
            }
        }
    }

    fn take_output(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.lines_rx.lock().unwrap().take()
    }
}

#[derive(Default)]
pub struct MockSpawner {
    spawned: Mutex<Vec<(TranscodeCommand, Arc<MockProcess>)>>,
    lingering: bool,
}

impl MockSpawner {
    /// Spawns processes whose exit is only published by `MockProcess::reap`.
    pub fn lingering() -> Self {
        Self {
            lingering: true,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn command(&self, index: usize) -> TranscodeCommand {
        self.spawned.lock().unwrap()[index].0.clone()
    }

    pub fn process(&self, index: usize) -> Arc<MockProcess> {
        self.spawned.lock().unwrap()[index].1.clone()
    }

    pub fn last(&self) -> Arc<MockProcess> {
        self.spawned
            .lock()
            .unwrap()
            .last()
            .map(|(_, process)| process.clone())
            .expect("a spawned process")
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, command: &TranscodeCommand) -> io::Result<Arc<dyn TranscodeProcess>> {
        let process = if self.lingering {
            MockProcess::lingering()
        } else {
            MockProcess::new()
        };
        self.spawned
            .lock()
            .unwrap()
            .push((command.clone(), process.clone()));
        Ok(process as Arc<dyn TranscodeProcess>)
    }
}

pub fn supervisor(max_concurrent: usize, spawner: Arc<MockSpawner>) -> TranscodeSupervisor {
    let settings = SupervisorSettings {
        max_concurrent,
        logging_enabled: false,
        ..SupervisorSettings::default()
    };
    TranscodeSupervisor::new(
        settings,
        CommandBuilder::new("ffmpeg"),
        MetadataProbe::new("ffprobe", Vec::new()),
        spawner,
    )
}

#[derive(Default)]
pub struct RecordingListener {
    pub started: AtomicUsize,
    pub errors: Mutex<Vec<String>>,
    pub completions: Mutex<Vec<ProcessExit>>,
    pub progress: Mutex<Vec<f64>>,
}

impl TranscodeListener for RecordingListener {
    fn on_start(&self, _pid: Option<u32>) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_progress(&self, update: &matchday_core::transcode::ProgressUpdate) {
        if let Some(ratio) = update.completion {
            self.progress.lock().unwrap().push(ratio);
        }
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn on_complete(&self, exit: ProcessExit) {
        self.completions.lock().unwrap().push(exit);
    }
}

/// Host double: rewrites `share.test` links to `cdn.test` and counts calls.
pub struct RewritingHost {
    pub id: Uuid,
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
    pub refresh_rate: Duration,
}

impl RewritingHost {
    pub fn new(refresh_rate: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            refresh_rate,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileServerPlugin for RewritingHost {
    fn id(&self) -> Uuid {
        self.id
    }

    fn title(&self) -> &str {
        "rewriting host"
    }

    async fn login(&self, _credentials: &Credentials) -> FileServerResult<Vec<SessionCookie>> {
        Ok(Vec::new())
    }

    async fn logout(&self) {}

    fn is_logged_in(&self) -> bool {
        true
    }

    fn accepts_url(&self, url: &Url) -> bool {
        url.host_str() == Some("share.test")
    }

    fn refresh_rate(&self) -> Duration {
        self.refresh_rate
    }

    async fn download_url(
        &self,
        external_url: &Url,
        _cookies: &[SessionCookie],
    ) -> FileServerResult<Url> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(FileServerError::Transient("host offline".into()));
        }
        let mut url = external_url.clone();
        url.set_host(Some("cdn.test"))
            .map_err(|err| FileServerError::Transient(err.to_string()))?;
        Ok(url)
    }

    fn requires_login(&self) -> bool {
        false
    }
}

pub async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}
