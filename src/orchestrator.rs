//! Top-level driver: one capture window, then the upload batch.

use anyhow::Result;
use std::sync::Arc;

use crate::cancel::CancellationSignal;
use crate::config::CaptureConfig;
use crate::frame::{Clock, SystemClock};
use crate::session::{SessionConnector, StreamClient};
use crate::sink::FrameSink;
use crate::upload::{UploadClient, UploadCoordinator, UploadOutcome};
use crate::window::{CaptureWindowController, WindowOutcome, WindowReport};

#[derive(Debug)]
pub enum RunReport {
    /// Capture is disabled by configuration; nothing ran.
    Disabled,
    Completed {
        window: WindowReport,
        /// `None` when an external shutdown ended the window and the upload
        /// stage was skipped.
        uploads: Option<Vec<UploadOutcome>>,
    },
}

impl RunReport {
    pub fn uploads_succeeded(&self) -> usize {
        self.uploads()
            .map(|u| u.iter().filter(|o| o.is_success()).count())
            .unwrap_or(0)
    }

    pub fn uploads_failed(&self) -> usize {
        self.uploads()
            .map(|u| u.iter().filter(|o| !o.is_success()).count())
            .unwrap_or(0)
    }

    fn uploads(&self) -> Option<&[UploadOutcome]> {
        match self {
            RunReport::Completed {
                uploads: Some(uploads),
                ..
            } => Some(uploads),
            _ => None,
        }
    }
}

pub struct Orchestrator {
    config: CaptureConfig,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CaptureConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Run capture then upload.
    ///
    /// `shutdown` is the process-wide signal; the window runs under a child
    /// of it, so an interrupt unwinds the window through the same check as
    /// the threshold. The output directory must already exist.
    pub fn run<C, U>(
        &self,
        client: C,
        uploader: U,
        shutdown: &CancellationSignal,
    ) -> Result<RunReport>
    where
        C: StreamClient,
        U: UploadClient,
    {
        if !self.config.capture_enabled {
            log::info!("capture disabled by configuration");
            return Ok(RunReport::Disabled);
        }

        let params = self.config.connection_parameters()?;
        let window_signal = shutdown.child();
        let mut connector = SessionConnector::new(client);
        let mut controller = CaptureWindowController::with_clock(
            self.config.window_settings(),
            FrameSink::new(),
            Arc::clone(&self.clock),
        );
        let window = controller.run(&mut connector, &params, &window_signal);
        drop(connector);

        if window.outcome == WindowOutcome::Shutdown || shutdown.is_cancelled() {
            log::warn!("shutdown requested, skipping upload");
            return Ok(RunReport::Completed {
                window,
                uploads: None,
            });
        }

        let mut coordinator = UploadCoordinator::new(uploader);
        let uploads = coordinator.upload_all(&self.config.output_dir)?;
        Ok(RunReport::Completed {
            window,
            uploads: Some(uploads),
        })
    }
}
