//! Capture engine
//!
//! Owns one capture session at a time: the loaded mapping table, the
//! installed hook and the dispatcher that runs matched chains. The engine
//! moves `Idle -> Armed -> Capturing` on a successful load and back to `Idle`
//! on [`CaptureEngine::shutdown`] or when a load fails.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keycap_config::{DelayUnit, LoadError, MappingTable};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::executor::ChainExecutor;
use crate::hook::{HookBackend, HookSession};
use crate::injector::{InjectError, Injector};
use crate::matcher::{CaptureStats, ChainJob, Matcher, StatsSnapshot};
use crate::modifiers::ModifierState;

/// Result of [`CaptureEngine::load_file_and_capture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMessage {
    HookCreationSuccess,
    HookCreationFailure,
    InputMissing,
    InputZero,
    InputBad,
    AlreadyCapturing,
}

impl CaptureMessage {
    /// Numeric result code, stable across releases.
    pub fn code(self) -> u8 {
        match self {
            CaptureMessage::HookCreationSuccess => 0,
            CaptureMessage::HookCreationFailure => 1,
            CaptureMessage::InputMissing => 2,
            CaptureMessage::InputZero => 3,
            CaptureMessage::InputBad => 4,
            CaptureMessage::AlreadyCapturing => 5,
        }
    }

    pub fn is_success(self) -> bool {
        self == CaptureMessage::HookCreationSuccess
    }
}

impl fmt::Display for CaptureMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CaptureMessage::HookCreationSuccess => "capture started",
            CaptureMessage::HookCreationFailure => "could not install the input hook",
            CaptureMessage::InputMissing => "mapping file not found",
            CaptureMessage::InputZero => "mapping file is empty",
            CaptureMessage::InputBad => "mapping file is corrupt",
            CaptureMessage::AlreadyCapturing => "already capturing",
        };
        f.write_str(text)
    }
}

impl From<&LoadError> for CaptureMessage {
    fn from(error: &LoadError) -> Self {
        match error {
            // An unreadable file counts as missing
            LoadError::FileNotFound { .. } | LoadError::Io { .. } => CaptureMessage::InputMissing,
            LoadError::FileEmpty { .. } => CaptureMessage::InputZero,
            LoadError::Malformed { .. } => CaptureMessage::InputBad,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    /// Table loaded, hook being installed
    Armed,
    Capturing,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub delay_unit: DelayUnit,
}

/// Snapshot of the engine for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub state: EngineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub mappings: usize,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub toggles_active: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

struct Session {
    path: PathBuf,
    table: Arc<MappingTable>,
    hook: HookSession,
    executor: ChainExecutor,
    stats: Arc<CaptureStats>,
    stop: oneshot::Sender<()>,
    dispatcher: JoinHandle<()>,
}

pub struct CaptureEngine<B: HookBackend> {
    backend: B,
    injector: Injector,
    options: EngineOptions,
    state: EngineState,
    session: Option<Session>,
}

impl<B: HookBackend> CaptureEngine<B> {
    pub fn new(backend: B, injector: Injector, options: EngineOptions) -> Self {
        Self {
            backend,
            injector,
            options,
            state: EngineState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == EngineState::Capturing
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.session
            .as_ref()
            .map(|session| session.stats.snapshot())
            .unwrap_or_default()
    }

    pub fn status(&self) -> CaptureStatus {
        match &self.session {
            Some(session) => CaptureStatus {
                state: self.state,
                path: Some(session.path.clone()),
                mappings: session.table.len(),
                stats: session.stats.snapshot(),
                toggles_active: session.executor.toggles().len(),
                fault: session.hook.fault(),
            },
            None => CaptureStatus {
                state: self.state,
                path: None,
                mappings: 0,
                stats: StatsSnapshot::default(),
                toggles_active: 0,
                fault: None,
            },
        }
    }

    /// Load a mapping file and start capturing with it.
    ///
    /// A running session is left alone (`AlreadyCapturing`) unless its hook
    /// has faulted, in which case it is shut down and replaced.
    pub async fn load_file_and_capture(&mut self, path: &Path) -> CaptureMessage {
        match self.session.as_ref().map(|session| session.hook.fault()) {
            Some(Some(fault)) => {
                tracing::warn!("Replacing faulted capture session: {}", fault);
                self.shutdown().await;
            }
            Some(None) => return CaptureMessage::AlreadyCapturing,
            None => {}
        }

        let table = match MappingTable::load(path) {
            Ok(table) => Arc::new(table),
            Err(e) => {
                tracing::warn!("{}", e);
                return CaptureMessage::from(&e);
            }
        };

        self.state = EngineState::Armed;

        let modifiers = ModifierState::new();
        let stats = Arc::new(CaptureStats::default());
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let executor =
            ChainExecutor::new(self.injector.clone(), modifiers.clone(), self.options.delay_unit);
        let matcher = Matcher::new(
            table.clone(),
            modifiers,
            executor.toggles().clone(),
            jobs_tx,
            stats.clone(),
        );

        self.injector.arm().await;
        let hook = match self
            .backend
            .install(matcher.into_callback(), self.injector.clone())
        {
            Ok(hook) => hook,
            Err(e) => {
                tracing::error!("Failed to install input hook: {}", e);
                self.injector.disarm().await;
                self.state = EngineState::Idle;
                return CaptureMessage::HookCreationFailure;
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let dispatcher = tokio::spawn(run_dispatcher(jobs_rx, stop_rx, executor.clone()));

        tracing::info!(
            "Capturing with {} mapping(s) from {} ({} hook reader(s))",
            table.len(),
            path.display(),
            hook.reader_count()
        );

        self.session = Some(Session {
            path: path.to_path_buf(),
            table,
            hook,
            executor,
            stats,
            stop: stop_tx,
            dispatcher,
        });
        self.state = EngineState::Capturing;

        CaptureMessage::HookCreationSuccess
    }

    /// Stop capturing. Safe to call at any time, any number of times.
    ///
    /// When this returns the hook is gone, pending chains are cancelled,
    /// toggled outputs and keys left down on the sink are released and
    /// nothing more will be injected.
    pub async fn shutdown(&mut self) {
        let Some(session) = self.session.take() else {
            self.state = EngineState::Idle;
            return;
        };

        session.hook.uninstall().await;

        let _ = session.stop.send(());
        if let Err(e) = session.dispatcher.await {
            if e.is_panic() {
                tracing::warn!("Chain dispatcher panicked: {}", e);
            }
        }

        if let Err(e) = session.executor.release_toggles().await {
            tracing::warn!("Failed to release toggled outputs: {}", e);
        }

        let released = self.injector.disarm().await;
        if released > 0 {
            tracing::info!("Released {} key(s) still down on the virtual device", released);
        }
        self.state = EngineState::Idle;

        let stats = session.stats.snapshot();
        tracing::info!(
            "Capture stopped ({} events, {} suppressed, {} chains)",
            stats.events_seen,
            stats.suppressed,
            stats.chains_fired
        );
    }
}

/// Spawn a task per matched chain until told to stop, then abort the rest.
async fn run_dispatcher(
    mut jobs: mpsc::UnboundedReceiver<ChainJob>,
    mut stop: oneshot::Receiver<()>,
    executor: ChainExecutor,
) {
    let mut chains = JoinSet::new();
    let mut jobs_open = true;

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => break,

            job = jobs.recv(), if jobs_open => match job {
                Some(job) => {
                    let executor = executor.clone();
                    chains.spawn(async move {
                        match executor.run(job).await {
                            Ok(()) => {}
                            Err(InjectError::Closed) => {
                                tracing::debug!("Chain stopped: injector disarmed");
                            }
                            Err(e) => tracing::warn!("Chain failed: {}", e),
                        }
                    });
                }
                None => jobs_open = false,
            },

            Some(result) = chains.join_next(), if !chains.is_empty() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::warn!("Chain task panicked: {}", e);
                    }
                }
            }
        }
    }

    if !chains.is_empty() {
        tracing::debug!("Cancelling {} running chain(s)", chains.len());
    }
    chains.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::loopback::Loopback;
    use crate::hook::Origin;
    use evdev::Key;
    use keycap_config::{IODefinition, IOFlag, IOPairDefinition, MouseButton};
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(2);

    fn write_table(dir: &TempDir, pairs: Vec<IOPairDefinition>) -> PathBuf {
        let path = dir.path().join("test.kfg");
        MappingTable::from_pairs(pairs).save(&path).unwrap();
        path
    }

    fn engine() -> (CaptureEngine<Loopback>, Loopback) {
        let loopback = Loopback::new();
        let injector = Injector::new(loopback.sink());
        let engine = CaptureEngine::new(loopback.clone(), injector, EngineOptions::default());
        (engine, loopback)
    }

    fn pair(input: IODefinition, outputs: &[IODefinition]) -> IOPairDefinition {
        let mut pair = IOPairDefinition::new(input, outputs[0]);
        for output in &outputs[1..] {
            pair.append_output(*output).unwrap();
        }
        pair
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let (mut engine, _) = engine();

        let result = engine
            .load_file_and_capture(&dir.path().join("nope.kfg"))
            .await;
        assert_eq!(result, CaptureMessage::InputMissing);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_zero_byte_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.kfg");
        std::fs::write(&path, b"").unwrap();
        let (mut engine, _) = engine();

        assert_eq!(
            engine.load_file_and_capture(&path).await,
            CaptureMessage::InputZero
        );
        assert!(!engine.is_capturing());
    }

    #[tokio::test]
    async fn test_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.kfg");
        // Count says two outputs, only one follows
        std::fs::write(&path, [0x00, 0x41, 0x02, 0x10, 0x01]).unwrap();
        let (mut engine, loopback) = engine();

        assert_eq!(
            engine.load_file_and_capture(&path).await,
            CaptureMessage::InputBad
        );
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!loopback.is_hooked());
    }

    #[tokio::test]
    async fn test_hook_failure() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(IODefinition::key(0x41), &[IODefinition::key(0x42)])],
        );
        let (mut engine, loopback) = engine();
        loopback.refuse_install(true);

        assert_eq!(
            engine.load_file_and_capture(&path).await,
            CaptureMessage::HookCreationFailure
        );
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_key_to_left_click() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(
                IODefinition::key(0x41),
                &[IODefinition::mouse(MouseButton::Left)],
            )],
        );
        let (mut engine, loopback) = engine();

        assert_eq!(
            engine.load_file_and_capture(&path).await,
            CaptureMessage::HookCreationSuccess
        );
        assert!(engine.is_capturing());

        loopback.tap(Key::KEY_A);
        assert!(loopback.wait_for(WAIT, |d| d.len() == 2).await);

        assert_eq!(
            loopback.key_events(),
            vec![(Key::BTN_LEFT.code(), 1), (Key::BTN_LEFT.code(), 0)]
        );
        assert!(loopback
            .downstream()
            .iter()
            .all(|d| d.origin == Origin::Synthetic));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unmapped_keys_pass_through() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(IODefinition::key(0x41), &[IODefinition::key(0x42)])],
        );
        let (mut engine, loopback) = engine();
        engine.load_file_and_capture(&path).await;

        loopback.tap(Key::KEY_Z);
        assert!(loopback.wait_for(WAIT, |d| d.len() == 2).await);
        assert_eq!(
            loopback.key_events(),
            vec![(Key::KEY_Z.code(), 1), (Key::KEY_Z.code(), 0)]
        );
        assert!(loopback
            .downstream()
            .iter()
            .all(|d| d.origin == Origin::Hardware));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_mapping_does_not_recurse() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(IODefinition::key(0x41), &[IODefinition::key(0x41)])],
        );
        let (mut engine, loopback) = engine();
        engine.load_file_and_capture(&path).await;

        loopback.tap(Key::KEY_A);
        assert!(loopback.wait_for(WAIT, |d| d.len() == 2).await);

        // Give a runaway loop the chance to show up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            loopback.key_events(),
            vec![(Key::KEY_A.code(), 1), (Key::KEY_A.code(), 0)]
        );
        assert_eq!(engine.stats().chains_fired, 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_delay_does_not_block_other_input() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(
                IODefinition::key(0x41),
                &[IODefinition::delay(100), IODefinition::key(0x41)],
            )],
        );
        let (mut engine, loopback) = engine();
        engine.load_file_and_capture(&path).await;

        let start = tokio::time::Instant::now();
        loopback.tap(Key::KEY_A);
        loopback.tap(Key::KEY_B);

        // B arrives while the delay is still pending
        assert!(
            loopback
                .wait_for(WAIT, |d| d
                    .iter()
                    .any(|d| d.event.code() == Key::KEY_B.code()))
                .await
        );
        assert!(!loopback
            .downstream()
            .iter()
            .any(|d| d.event.code() == Key::KEY_A.code()));

        assert!(loopback.wait_for(WAIT, |d| d.len() == 4).await);
        let a_presses: Vec<_> = loopback
            .downstream()
            .into_iter()
            .filter(|d| d.event.code() == Key::KEY_A.code() && d.event.value() == 1)
            .collect();
        assert_eq!(a_presses.len(), 1);
        assert!(a_presses[0].at.duration_since(start) >= Duration::from_millis(100));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_already_capturing() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(IODefinition::key(0x41), &[IODefinition::key(0x42)])],
        );
        let (mut engine, _) = engine();

        assert!(engine.load_file_and_capture(&path).await.is_success());
        assert_eq!(
            engine.load_file_and_capture(&path).await,
            CaptureMessage::AlreadyCapturing
        );
        assert!(engine.is_capturing());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(IODefinition::key(0x41), &[IODefinition::key(0x42)])],
        );
        let (mut engine, loopback) = engine();

        // From idle
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Idle);

        engine.load_file_and_capture(&path).await;
        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!loopback.is_hooked());

        // Can start again afterwards
        assert!(engine.load_file_and_capture(&path).await.is_success());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_delay() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(
                IODefinition::key(0x41),
                &[IODefinition::delay(200), IODefinition::key(0x42)],
            )],
        );
        let (mut engine, loopback) = engine();
        engine.load_file_and_capture(&path).await;

        loopback.press(Key::KEY_A);
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.shutdown().await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(loopback.key_events().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_toggles() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(
                IODefinition::key(0x14),
                &[IODefinition::key(0x10).toggled()],
            )],
        );
        let (mut engine, loopback) = engine();
        engine.load_file_and_capture(&path).await;

        loopback.tap(Key::KEY_CAPSLOCK);
        assert!(loopback.wait_for(WAIT, |d| d.len() == 1).await);
        assert_eq!(engine.status().toggles_active, 1);

        engine.shutdown().await;

        // Released while unhooked, so it goes straight downstream
        assert_eq!(
            loopback.key_events(),
            vec![(Key::KEY_LEFTSHIFT.code(), 1), (Key::KEY_LEFTSHIFT.code(), 0)]
        );
    }

    #[tokio::test]
    async fn test_shutdown_releases_restored_modifier() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(
                IODefinition::key(0x41).with_modifiers(IOFlag::Control.bit()),
                &[IODefinition::key(0x42)],
            )],
        );
        let (mut engine, loopback) = engine();
        engine.load_file_and_capture(&path).await;

        // Ctrl stays down while capture stops
        loopback.press(Key::KEY_LEFTCTRL);
        loopback.tap(Key::KEY_A);
        assert!(loopback.wait_for(WAIT, |d| d.len() == 5).await);

        engine.shutdown().await;

        let events = loopback.key_events();
        assert_eq!(events.len(), 6);
        assert_eq!(events[5], (Key::KEY_LEFTCTRL.code(), 0));
        let last = loopback.downstream().pop().unwrap();
        assert_eq!(last.origin, Origin::Synthetic);
    }

    #[tokio::test]
    async fn test_faulted_session_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = write_table(
            &dir,
            vec![pair(IODefinition::key(0x41), &[IODefinition::key(0x42)])],
        );
        let (mut engine, loopback) = engine();
        engine.load_file_and_capture(&path).await;

        loopback.unplug();
        assert!(engine.status().fault.is_some());

        assert!(engine.load_file_and_capture(&path).await.is_success());
        assert!(engine.status().fault.is_none());
        engine.shutdown().await;
    }

    #[test]
    fn test_message_codes() {
        assert_eq!(CaptureMessage::HookCreationSuccess.code(), 0);
        assert_eq!(CaptureMessage::InputBad.code(), 4);
        assert_eq!(
            serde_json::to_string(&CaptureMessage::InputZero).unwrap(),
            "\"input_zero\""
        );
    }
}
