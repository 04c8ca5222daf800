use anyhow::{anyhow, Context, Result};
use bs_capture::{CaptureStatus, Frame, FrameSource};
use bs_data::Settings;
use bs_vision::TextRecognizer;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::calibration::{self, CalibrationJob};
use crate::context::RuntimeContext;
use crate::input::ActionSink;
use crate::skills::{Skill, SkillRegistry};
use crate::status::{CycleReport, RuntimeStatus, StatusBoard};
use crate::telemetry::{TelemetryEvent, Timeline};

/// Owns the active skill and its context between cycles. Moved onto a
/// blocking thread for each frame and handed back afterwards.
struct DecisionWorker {
    skill: Box<dyn Skill>,
    ctx: RuntimeContext,
    sink: Box<dyn ActionSink>,
    jobs: mpsc::Sender<CalibrationJob>,
}

impl DecisionWorker {
    fn cycle(&mut self, frame: &Frame) -> Result<CycleReport> {
        let result = self.skill.process_frame(frame, &mut self.ctx);
        self.dispatch_jobs();
        let report = result?;
        self.sink
            .execute(&report.inputs)
            .context("Action sink failed")?;
        Ok(report)
    }

    /// Hand captured calibration work to the background worker. A full
    /// queue drops the job; the calibrator retries on a later disagreement.
    fn dispatch_jobs(&mut self) {
        for job in self.ctx.pending_jobs.drain(..) {
            let template_id = job.template_id.clone();
            if let Err(e) = self.jobs.try_send(job) {
                warn!("Calibration job for {} not queued: {}", template_id, e);
                self.ctx.calibrator.abandon(&template_id);
            }
        }
    }
}

/// Manages the capture → decide → act loop
pub struct Runtime {
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    status: Arc<StatusBoard>,
    timeline: Arc<Timeline>,
    capture_rx: watch::Receiver<CaptureStatus>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Runtime {
    /// Validate the settings, start the configured skill and spawn the capture
    /// loop, the decision loop and the calibration worker. Must be called
    /// inside a tokio runtime.
    pub fn start(
        settings: Settings,
        source: Box<dyn FrameSource>,
        sink: Box<dyn ActionSink>,
        recognizer: Arc<dyn TextRecognizer>,
    ) -> Result<Self> {
        settings.validate()?;
        let mut skill = SkillRegistry::with_defaults().take(&settings.skill)?;

        let timeline = Arc::new(Timeline::default());
        let interval = Duration::from_millis(settings.capture.interval_ms);
        let mut ctx = RuntimeContext::new(settings, recognizer, timeline.clone())?;
        skill
            .on_start(&mut ctx)
            .with_context(|| format!("Skill '{}' failed to start", skill.name()))?;
        info!(
            "Text recognizer '{}' {}",
            ctx.engine.recognizer_name(),
            if ctx.engine.text_available() {
                "enabled"
            } else {
                "unavailable, text detection disabled"
            }
        );

        let stop = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let status = Arc::new(StatusBoard::new());
        let skill_name = skill.name().to_string();
        status.update(|s| {
            s.running = true;
            s.skill = Some(skill_name);
        });

        let (frame_tx, frame_rx) = watch::channel::<Option<Arc<Frame>>>(None);
        let (status_tx, capture_rx) = watch::channel(CaptureStatus::default());

        let capture = tokio::spawn(bs_capture::capture_loop(
            source,
            frame_tx,
            status_tx,
            interval,
            stop.clone(),
        ));
        let (jobs, calibration) = calibration::spawn_worker(ctx.calibrator.clone());

        let worker = DecisionWorker {
            skill,
            ctx,
            sink,
            jobs,
        };
        let decision = tokio::spawn(decision_loop(
            worker,
            frame_rx,
            capture_rx.clone(),
            status.clone(),
            stop.clone(),
            paused.clone(),
            interval,
        ));

        info!("Runtime started, cycle interval {:?}", interval);

        Ok(Self {
            stop,
            paused,
            status,
            timeline,
            capture_rx,
            tasks: vec![
                ("decision", decision),
                ("capture", capture),
                ("calibration", calibration),
            ],
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        info!("Runtime stop requested");
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        self.status.update(|s| s.paused = true);
        info!("Runtime paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        self.status.update(|s| s.paused = false);
        info!("Runtime resumed");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Copy of the shared status
    pub fn snapshot(&self) -> RuntimeStatus {
        let mut status = self.status.snapshot();
        status.capture = self.capture_rx.borrow().clone();
        status
    }

    /// Up to `n` most recent telemetry events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<TelemetryEvent> {
        self.timeline.last(n)
    }

    /// Wait for every task to finish. Call after `stop`.
    pub async fn join(self) -> Result<()> {
        for (name, handle) in self.tasks {
            handle
                .await
                .with_context(|| format!("{} task panicked", name))?;
        }
        info!("Runtime stopped");
        Ok(())
    }
}

async fn decision_loop(
    mut worker: DecisionWorker,
    mut frame_rx: watch::Receiver<Option<Arc<Frame>>>,
    capture_rx: watch::Receiver<CaptureStatus>,
    status: Arc<StatusBoard>,
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_ts: Option<f64> = None;

    loop {
        ticker.tick().await;
        if stop.load(Ordering::Relaxed) {
            info!("Decision loop stopping (stop signal received)");
            break;
        }
        if paused.load(Ordering::Relaxed) {
            continue;
        }

        // Always the latest capture; an unchanged frame is not decided twice
        let frame = match frame_rx.borrow_and_update().clone() {
            Some(frame) => frame,
            None => continue,
        };
        if last_ts == Some(frame.timestamp) {
            continue;
        }
        last_ts = Some(frame.timestamp);

        // A panicking cycle still hands the worker back
        let handed = tokio::task::spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| worker.cycle(&frame)))
                .unwrap_or_else(|payload| Err(anyhow!("Cycle panicked: {}", panic_message(&*payload))));
            (worker, result)
        })
        .await;

        let result = match handed {
            Ok((returned, result)) => {
                worker = returned;
                result
            }
            Err(e) => {
                warn!("Decision task panicked: {}", e);
                status.update(|s| {
                    s.running = false;
                    s.errors += 1;
                    s.last_error = Some(e.to_string());
                });
                return;
            }
        };

        let capture = capture_rx.borrow().clone();
        match result {
            Ok(report) => {
                let calibration = worker.ctx.calibrator.snapshot();
                status.update(|s| {
                    s.cycles += 1;
                    s.detections_total = report.detections_total;
                    s.capture = capture;
                    s.calibration = calibration;
                    s.last_report = Some(report);
                });
            }
            Err(e) => {
                // Only this cycle is lost
                warn!("Cycle failed: {:#}", e);
                status.update(|s| {
                    s.errors += 1;
                    s.last_error = Some(format!("{:#}", e));
                    s.capture = capture;
                });
            }
        }
    }

    worker.skill.on_stop(&mut worker.ctx);
    status.update(|s| s.running = false);
    debug!("Decision loop stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
