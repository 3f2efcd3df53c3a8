//! Flash sequencer
//!
//! Drives one run from start to a terminal event:
//!
//! ```text
//! Idle -> [Acquiring] -> VerifyingStageFiles
//!      -> FlashingBootloader(0) -> AwaitingReconnect(0) -> ... -> FlashingBootloader(n-1)
//!      -> [AwaitingImageMode -> FlashingImage] -> Done
//! ```
//!
//! `Failed` is reachable from every state before `Done`. Each stage gets a
//! fresh transfer session, since the device re-enumerates after every reset.

use std::{
    io,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::acquire::{Acquisition, HttpSource, TemporaryArtifacts};
use crate::cache::ImageCache;
use crate::config::FlasherConfig;
use crate::error::{FlashError, Result};
use crate::progress::{CancelToken, Event, Reporter, scale};
use crate::request::ImageRequest;
use crate::transfer::{MatchCriteria, TransferError, TransferPrimitive, Transport};

/// Raw storage alt setting receiving the OS image
pub const IMAGE_ALT_SETTING: &str = "rawemmc";

/// Boot chain, in flashing order: (file in the source directory, alt setting)
const BOOTLOADER_STAGES: [(&str, &str); 3] = [
    ("tiboot3.bin", "bootloader"),
    ("tispl.bin", "tispl.bin"),
    ("u-boot.img", "u-boot.img"),
];

const PREPARE: u8 = 5;
const VERIFY: u8 = 52;
const BOOTLOADER_START: u8 = 55;
const BOOTLOADER_END: u8 = 75;
const IMAGE_MODE_WAIT: u8 = 78;
const IMAGE_START: u8 = 80;
/// Byte progress stops short of 100 until the stage has really finished
const IMAGE_BYTES_END: u8 = 99;

const MB: u64 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    Acquiring,
    VerifyingStageFiles,
    FlashingBootloader(usize),
    AwaitingReconnect(usize),
    AwaitingImageMode,
    FlashingImage,
    Done,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageDescriptor {
    pub source_file: PathBuf,
    pub alt_setting: String,
    pub reset_after: bool,
}

impl StageDescriptor {
    /// The fixed boot chain, resolved against `source_dir`
    pub fn bootloader(source_dir: &Path) -> Vec<Self> {
        BOOTLOADER_STAGES
            .iter()
            .map(|(file, alt)| Self {
                source_file: source_dir.join(file),
                alt_setting: alt.to_string(),
                reset_after: true,
            })
            .collect()
    }

    pub fn image(path: PathBuf) -> Self {
        Self {
            source_file: path,
            alt_setting: IMAGE_ALT_SETTING.to_string(),
            reset_after: true,
        }
    }

    /// File name used in user-facing messages
    pub fn name(&self) -> String {
        self.source_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source_file.display().to_string())
    }
}

/// How a run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure(String),
}

/// A run executing on its own thread
pub struct RunHandle {
    events: Receiver<Event>,
    cancel: CancelToken,
    thread: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish
    pub fn join(self) -> RunOutcome {
        self.thread
            .join()
            .unwrap_or_else(|_| RunOutcome::Failure("Flashing thread panicked".into()))
    }
}

pub struct Sequencer<T, H> {
    config: FlasherConfig,
    request: ImageRequest,
    transport: T,
    http: H,
    cache: ImageCache,
    state: FlashState,
}

impl<T: Transport, H: HttpSource> Sequencer<T, H> {
    pub fn new(
        config: FlasherConfig,
        request: ImageRequest,
        transport: T,
        http: H,
        cache: ImageCache,
    ) -> Self {
        Self {
            config,
            request,
            transport,
            http,
            cache,
            state: FlashState::Idle,
        }
    }

    pub fn state(&self) -> &FlashState {
        &self.state
    }

    /// Execute one run, reporting through `events`.
    ///
    /// Temporary files are removed before the terminal event is sent, on
    /// every path.
    pub fn run(&mut self, events: Sender<Event>, cancel: &CancelToken) -> RunOutcome {
        self.enter(FlashState::Idle);
        let mut reporter = Reporter::new(events);
        let mut artifacts = TemporaryArtifacts::new(Some(
            self.cache.payload_path().to_path_buf(),
        ));

        let result = self.execute(&mut reporter, cancel, &mut artifacts);
        artifacts.discard_all();

        match result {
            Ok(()) => {
                self.enter(FlashState::Done);
                reporter.success();
                RunOutcome::Success
            }
            Err(e) => {
                let reason = e.to_string();
                error!("{reason}");
                self.enter(FlashState::Failed(reason.clone()));
                reporter.error(reason.clone());
                RunOutcome::Failure(reason)
            }
        }
    }

    fn execute(
        &mut self,
        reporter: &mut Reporter,
        cancel: &CancelToken,
        artifacts: &mut TemporaryArtifacts,
    ) -> Result<()> {
        reporter.status("Initializing DFU...");
        check_cancel(cancel)?;

        let image = match self.request.resolve(&self.config.base_url) {
            Some(resolved) => {
                self.enter(FlashState::Acquiring);
                reporter.progress(PREPARE, "Preparing to download system image...");
                let path = Acquisition {
                    http: &self.http,
                    cache: &mut self.cache,
                    work_dir: &self.config.paths.work_dir,
                    reporter: &mut *reporter,
                    cancel,
                }
                .run(&resolved, artifacts)?;
                Some(path)
            }
            None => {
                info!("No system image selected, sending bootloader files only");
                None
            }
        };

        self.enter(FlashState::VerifyingStageFiles);
        reporter.progress(VERIFY, "Preparing bootloader files...");
        let stages = StageDescriptor::bootloader(&self.config.source_dir);
        if let Some(missing) = stages.iter().find(|s| !s.source_file.is_file()) {
            return Err(FlashError::StageFileMissing(missing.source_file.clone()));
        }

        reporter.progress(BOOTLOADER_START, "Sending bootloader files...");
        let per_stage = (BOOTLOADER_END - BOOTLOADER_START) / stages.len() as u8;
        let mut current = BOOTLOADER_START;

        for (i, stage) in stages.iter().enumerate() {
            check_cancel(cancel)?;
            self.enter(FlashState::FlashingBootloader(i));
            let name = stage.name();
            reporter.progress(current, format!("Sending {name}..."));
            self.flash_stage(stage, cancel, &mut |_, _| {})?;

            current += per_stage;
            reporter.progress(current, format!("{name} sent successfully"));

            if let Some(next) = stages.get(i + 1) {
                self.enter(FlashState::AwaitingReconnect(i));
                reporter.progress(current, "Waiting for device to reconnect...");
                self.dwell(self.config.timing.reconnect_dwell, next, cancel)?;
            }
        }
        reporter.progress(BOOTLOADER_END, "Bootloader files sent successfully");

        let Some(image) = image else {
            reporter.progress(
                100,
                "All bootloader files sent successfully. Device should boot now.",
            );
            return Ok(());
        };

        let stage = StageDescriptor::image(image);
        self.enter(FlashState::AwaitingImageMode);
        reporter.progress(
            IMAGE_MODE_WAIT,
            "Waiting for device to enter image transfer mode...",
        );
        self.dwell(self.config.timing.image_mode_dwell, &stage, cancel)?;

        self.enter(FlashState::FlashingImage);
        reporter.progress(
            IMAGE_START,
            "Sending system image to device (this may take several minutes)...",
        );
        self.flash_stage(&stage, cancel, &mut |sent, total| {
            reporter.advance(scale(IMAGE_START, IMAGE_BYTES_END, sent, total), || {
                format!("Sending system image: {} MB / {} MB", sent / MB, total / MB)
            })
        })?;

        artifacts.discard_image();
        reporter.progress(100, "System image sent successfully!");
        Ok(())
    }

    /// One transfer session for one stage, cleaned up however it ends
    fn flash_stage(
        &self,
        stage: &StageDescriptor,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        let criteria = self.criteria(stage);
        let mut session = self.transport.session(cancel);
        let result = drive(&mut session, stage, &criteria, progress);
        session.cleanup();
        result
    }

    /// Wait up to `period` for the device to come back with `next`'s alt
    /// setting. Without a probing transport the whole period is slept.
    fn dwell(
        &self,
        period: Duration,
        next: &StageDescriptor,
        cancel: &CancelToken,
    ) -> Result<()> {
        let criteria = self.criteria(next);
        let deadline = Instant::now() + period;
        let mut probing = true;

        loop {
            check_cancel(cancel)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            // the old device can linger for a moment after reset, so sleep first
            thread::sleep(self.config.timing.poll_interval.min(deadline - now));
            if probing {
                match self.transport.device_present(&criteria) {
                    Some(true) => {
                        debug!("Alt setting \"{}\" is up", criteria.alt_name);
                        return Ok(());
                    }
                    Some(false) => {}
                    None => probing = false,
                }
            }
        }
    }

    fn criteria(&self, stage: &StageDescriptor) -> MatchCriteria {
        MatchCriteria::new(
            self.config.vendor_id,
            self.config.product_id,
            &stage.alt_setting,
        )
    }

    fn enter(&mut self, state: FlashState) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

impl<T, H> Sequencer<T, H>
where
    T: Transport + Send + 'static,
    H: HttpSource + Send + 'static,
{
    /// Run on a dedicated thread
    pub fn spawn(mut self) -> io::Result<RunHandle> {
        let (tx, events) = mpsc::channel();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let thread = thread::Builder::new()
            .name("gemflash-run".into())
            .spawn(move || self.run(tx, &token))?;
        Ok(RunHandle {
            events,
            cancel,
            thread,
        })
    }
}

fn drive<S: TransferPrimitive>(
    session: &mut S,
    stage: &StageDescriptor,
    criteria: &MatchCriteria,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let name = stage.name();
    session.initialize().map_err(|source| FlashError::Init {
        stage: name.clone(),
        source,
    })?;
    session.find_device(criteria).map_err(|source| match source {
        TransferError::Cancelled => FlashError::Cancelled,
        source => FlashError::DeviceNotFound {
            stage: name.clone(),
            alt: criteria.alt_name.clone(),
            source,
        },
    })?;

    match session.download_file(
        &stage.source_file,
        &stage.alt_setting,
        stage.reset_after,
        progress,
    ) {
        Ok(()) => Ok(()),
        Err(e) if e.is_benign() => {
            warn!("Treating \"{e}\" after {name} as success");
            Ok(())
        }
        Err(source) => Err(FlashError::Transfer {
            stage: name,
            source,
        }),
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(FlashError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::acquire::tests::{FakeHttp, xz};
    use crate::config::{Paths, Timing};
    use crate::transfer::tests::{Outcome, ScriptedTransport};

    struct Fixture {
        dir: TempDir,
        config: FlasherConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("boot");
            fs::create_dir_all(&source).unwrap();
            for (file, _) in BOOTLOADER_STAGES {
                fs::write(source.join(file), file.as_bytes()).unwrap();
            }
            let mut config = FlasherConfig::new(&source);
            config.timing = Timing {
                reconnect_dwell: Duration::ZERO,
                image_mode_dwell: Duration::ZERO,
                poll_interval: Duration::from_millis(1),
            };
            config.paths = Paths {
                cache_dir: dir.path().join("cache"),
                work_dir: dir.path().join("work"),
            };
            Self { dir, config }
        }

        fn sequencer(
            &self,
            request: ImageRequest,
            transport: &ScriptedTransport,
            http: FakeHttp,
        ) -> Sequencer<ScriptedTransport, FakeHttp> {
            let cache = ImageCache::open(&self.config.paths.cache_dir).unwrap();
            Sequencer::new(
                self.config.clone(),
                request,
                transport.clone(),
                http,
                cache,
            )
        }

        fn extracted_image(&self) -> PathBuf {
            let resolved = full_request()
                .resolve(&self.config.base_url)
                .unwrap();
            self.config
                .paths
                .work_dir
                .join(resolved.extracted_filename())
        }
    }

    fn full_request() -> ImageRequest {
        ImageRequest::new("j7", "minimal", "debian", "")
    }

    fn bootloader_only() -> ImageRequest {
        ImageRequest::new("j7", "", "debian", "")
    }

    fn run(
        seq: &mut Sequencer<ScriptedTransport, FakeHttp>,
        cancel: &CancelToken,
    ) -> (RunOutcome, Vec<Event>) {
        let (tx, rx) = mpsc::channel();
        let outcome = seq.run(tx, cancel);
        (outcome, rx.try_iter().collect())
    }

    fn assert_well_formed(events: &[Event]) {
        let percentages: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                Event::Progress { percentage, .. } => Some(*percentage),
                _ => None,
            })
            .collect();
        assert!(
            percentages.windows(2).all(|w| w[0] <= w[1]),
            "{percentages:?}"
        );
        let terminal: Vec<&Event> =
            events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    fn alts(transport: &ScriptedTransport) -> Vec<String> {
        transport
            .records()
            .into_iter()
            .map(|r| r.alt.unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_incomplete_request_flashes_bootloader_only() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[]);
        let http = FakeHttp::serving(xz(b"never fetched"));
        let mut seq = fx.sequencer(bootloader_only(), &transport, http);

        let (outcome, events) = run(&mut seq, &CancelToken::new());
        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(seq.state(), &FlashState::Done);
        assert_eq!(seq.http.fetches.get(), 0);
        assert_eq!(alts(&transport), ["bootloader", "tispl.bin", "u-boot.img"]);
        for record in transport.records() {
            assert!(record.reset_after);
            assert_eq!(record.cleanups, 1);
        }
        assert_well_formed(&events);
        assert_eq!(events.last(), Some(&Event::Success));
        assert!(events.contains(&Event::Progress {
            percentage: 100,
            message: "All bootloader files sent successfully. Device should boot now."
                .into(),
        }));
    }

    #[test]
    fn test_full_run_sends_image_last() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[]);
        let http = FakeHttp::serving(xz(b"raw disk image"));
        let mut seq = fx.sequencer(full_request(), &transport, http);

        let (outcome, events) = run(&mut seq, &CancelToken::new());
        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(
            alts(&transport),
            ["bootloader", "tispl.bin", "u-boot.img", IMAGE_ALT_SETTING]
        );
        let records = transport.records();
        assert_eq!(records[3].file.as_deref(), Some(fx.extracted_image().as_path()));
        assert_well_formed(&events);

        // extracted image is gone, the compressed download stays cached
        assert!(!fx.extracted_image().exists());
        assert!(seq.cache.payload_path().exists());
        let resolved = full_request().resolve(&fx.config.base_url).unwrap();
        assert!(seq.cache.lookup(&resolved.filename).is_some());
    }

    #[test]
    fn test_missing_stage_file_opens_no_session() {
        let fx = Fixture::new();
        let missing = fx.config.source_dir.join("tispl.bin");
        fs::remove_file(&missing).unwrap();
        let transport = ScriptedTransport::new(&[]);
        let http = FakeHttp::serving(xz(b"raw disk image"));
        let mut seq = fx.sequencer(full_request(), &transport, http);

        let (outcome, events) = run(&mut seq, &CancelToken::new());
        let RunOutcome::Failure(reason) = outcome else {
            panic!("run should fail");
        };
        assert_eq!(
            reason,
            format!("Bootloader file not found: {}", missing.display())
        );
        assert!(transport.records().is_empty());
        assert!(!fx.extracted_image().exists());
        assert_well_formed(&events);
        assert_eq!(events.last(), Some(&Event::Error(reason)));
    }

    #[test]
    fn test_benign_error_after_payload_is_success() {
        let fx = Fixture::new();
        let transport =
            ScriptedTransport::new(&[Outcome::Benign, Outcome::Benign, Outcome::Ok]);
        let mut seq =
            fx.sequencer(bootloader_only(), &transport, FakeHttp::serving(Vec::new()));

        let (outcome, events) = run(&mut seq, &CancelToken::new());
        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(transport.records().len(), 3);
        assert_well_formed(&events);
    }

    #[test]
    fn test_transfer_failure_is_terminal() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[Outcome::Ok, Outcome::Fail]);
        let mut seq =
            fx.sequencer(bootloader_only(), &transport, FakeHttp::serving(Vec::new()));

        let (outcome, events) = run(&mut seq, &CancelToken::new());
        let RunOutcome::Failure(reason) = outcome else {
            panic!("run should fail");
        };
        assert!(reason.starts_with("Failed to download tispl.bin"), "{reason}");
        // no retry, no further stages
        assert_eq!(alts(&transport), ["bootloader", "tispl.bin"]);
        assert!(transport.records().iter().all(|r| r.cleanups == 1));
        assert!(matches!(seq.state(), FlashState::Failed(_)));
        assert_well_formed(&events);
    }

    #[test]
    fn test_device_not_found_names_stage_and_alt() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[Outcome::NotFound]);
        let mut seq =
            fx.sequencer(bootloader_only(), &transport, FakeHttp::serving(Vec::new()));

        let (outcome, _) = run(&mut seq, &CancelToken::new());
        assert_eq!(
            outcome,
            RunOutcome::Failure(
                "Failed to find DFU device for tiboot3.bin (alt: bootloader)".into()
            )
        );
        let records = transport.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file, None);
        assert_eq!(records[0].cleanups, 1);
    }

    #[test]
    fn test_image_failure_deletes_extracted_image() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[
            Outcome::Ok,
            Outcome::Ok,
            Outcome::Ok,
            Outcome::Fail,
        ]);
        let http = FakeHttp::serving(xz(b"raw disk image"));
        let mut seq = fx.sequencer(full_request(), &transport, http);

        let (outcome, events) = run(&mut seq, &CancelToken::new());
        assert!(matches!(outcome, RunOutcome::Failure(_)));
        assert_eq!(transport.records().len(), 4);
        assert!(!fx.extracted_image().exists());
        assert_well_formed(&events);
    }

    #[test]
    fn test_acquisition_failure_skips_flashing() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[]);
        let mut http = FakeHttp::serving(Vec::new());
        http.status = Some(500);
        let mut seq = fx.sequencer(full_request(), &transport, http);

        let (outcome, events) = run(&mut seq, &CancelToken::new());
        let RunOutcome::Failure(reason) = outcome else {
            panic!("run should fail");
        };
        assert!(reason.contains("HTTP status 500"), "{reason}");
        assert!(transport.records().is_empty());
        assert!(fs::read_dir(&fx.config.paths.work_dir).unwrap().next().is_none());
        assert_well_formed(&events);
    }

    #[test]
    fn test_cancelled_run_fails_cleanly() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[]);
        let mut seq =
            fx.sequencer(bootloader_only(), &transport, FakeHttp::serving(Vec::new()));
        let cancel = CancelToken::new();
        cancel.cancel();

        let (outcome, events) = run(&mut seq, &cancel);
        assert_eq!(outcome, RunOutcome::Failure("Run cancelled".into()));
        assert!(transport.records().is_empty());
        assert_eq!(events.last(), Some(&Event::Error("Run cancelled".into())));
    }

    #[test]
    fn test_sequencer_runs_again_after_failure() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[Outcome::Fail]);
        let mut seq =
            fx.sequencer(bootloader_only(), &transport, FakeHttp::serving(Vec::new()));

        let (outcome, _) = run(&mut seq, &CancelToken::new());
        assert!(matches!(outcome, RunOutcome::Failure(_)));
        assert!(matches!(seq.state(), FlashState::Failed(_)));

        let (outcome, events) = run(&mut seq, &CancelToken::new());
        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(seq.state(), &FlashState::Done);
        assert_eq!(
            alts(&transport),
            ["bootloader", "bootloader", "tispl.bin", "u-boot.img"]
        );
        assert_well_formed(&events);
    }

    #[test]
    fn test_dwell_ends_when_device_shows_up() {
        let mut fx = Fixture::new();
        fx.config.timing.reconnect_dwell = Duration::from_secs(60);
        let mut transport = ScriptedTransport::new(&[]);
        transport.present = Some(true);
        let mut seq =
            fx.sequencer(bootloader_only(), &transport, FakeHttp::serving(Vec::new()));

        let started = Instant::now();
        let (outcome, _) = run(&mut seq, &CancelToken::new());
        assert_eq!(outcome, RunOutcome::Success);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_spawned_run() {
        let fx = Fixture::new();
        let transport = ScriptedTransport::new(&[]);
        let seq =
            fx.sequencer(bootloader_only(), &transport, FakeHttp::serving(Vec::new()));

        let handle = seq.spawn().unwrap();
        let events: Vec<Event> = handle.events().iter().collect();
        assert_eq!(handle.join(), RunOutcome::Success);
        assert_eq!(
            events.first(),
            Some(&Event::PreparationStatus("Initializing DFU...".into()))
        );
        assert_eq!(events.last(), Some(&Event::Success));
    }
}
