use std::path::PathBuf;
use std::time::{Duration, Instant};

use toolnest_core::{Action, Catalog, PackageDescriptor};
use toolnest_installer::{
    remove_file_if_exists, write_env_file, CancelToken, DownloadError, ErrorClass,
    HandlerRegistry, InstallError, SegmentedDownloader, StoreError, ToolLayout, VersionStore,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 8_000;

/// Re-attempts transient download failures with doubling delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `attempt_fn` until it succeeds, fails with a non-transient error,
    /// runs out of attempts, or `cancel` is tripped.
    pub fn run<T>(
        &self,
        cancel: &CancelToken,
        sleep: fn(Duration),
        mut attempt_fn: impl FnMut(u32) -> Result<T, DownloadError>,
    ) -> Result<T, DownloadError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            match attempt_fn(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient download failure; retrying"
                    );
                    sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub action: Action,
    /// Artifact size; zero for removals.
    pub bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub action: Action,
    pub class: ErrorClass,
    pub reason: String,
}

impl ActionFailure {
    fn cancelled(action: &Action) -> Self {
        Self {
            action: action.clone(),
            class: ErrorClass::Cancelled,
            reason: "cancelled before start".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub completed: Vec<ActionOutcome>,
    pub failed: Vec<ActionFailure>,
    pub warnings: Vec<String>,
    pub env_file: Option<PathBuf>,
    pub elapsed: Duration,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.completed.iter().map(|outcome| outcome.bytes).sum()
    }

    /// Completed installs and upgrades.
    pub fn installed_count(&self) -> usize {
        self.completed
            .iter()
            .filter(|outcome| !outcome.action.is_remove())
            .count()
    }

    pub fn removed_count(&self) -> usize {
        self.completed
            .iter()
            .filter(|outcome| outcome.action.is_remove())
            .count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.failed
            .iter()
            .filter(|failure| failure.class == ErrorClass::Cancelled)
            .count()
    }
}

/// Hooks for showing a session as it runs. Called from the session thread,
/// except `download_progress`, which chunk workers call concurrently.
pub trait SessionObserver: Sync {
    fn action_started(&self, _index: usize, _total: usize, _action: &Action) {}
    fn download_progress(&self, _action: &Action, _downloaded: u64, _total: u64) {}
    fn action_succeeded(&self, _outcome: &ActionOutcome) {}
    fn action_failed(&self, _failure: &ActionFailure) {}
}

#[derive(Debug)]
struct StepError {
    class: ErrorClass,
    reason: String,
}

impl StepError {
    fn new(class: ErrorClass, reason: impl Into<String>) -> Self {
        Self {
            class,
            reason: reason.into(),
        }
    }
}

impl From<DownloadError> for StepError {
    fn from(err: DownloadError) -> Self {
        Self::new(err.class(), format!("download failed: {err}"))
    }
}

impl From<InstallError> for StepError {
    fn from(err: InstallError) -> Self {
        Self::new(err.class(), err.to_string())
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        Self::new(err.class(), format!("version store not updated: {err}"))
    }
}

/// Applies reconciliation actions one at a time. A failed action is
/// reported and the session moves on; the store is only touched after the
/// handler reports success.
pub struct Session<'a> {
    layout: &'a ToolLayout,
    catalog: &'a Catalog,
    handlers: &'a HandlerRegistry,
    downloader: &'a SegmentedDownloader,
    retry: RetryPolicy,
    force_download: bool,
    sleep: fn(Duration),
}

impl<'a> Session<'a> {
    pub fn new(
        layout: &'a ToolLayout,
        catalog: &'a Catalog,
        handlers: &'a HandlerRegistry,
        downloader: &'a SegmentedDownloader,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            layout,
            catalog,
            handlers,
            downloader,
            retry,
            force_download: false,
            sleep: std::thread::sleep,
        }
    }

    /// Discard cached artifacts instead of reusing a verified download.
    pub fn force_download(mut self, force: bool) -> Self {
        self.force_download = force;
        self
    }

    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn apply(
        &self,
        store: &mut VersionStore,
        actions: &[Action],
        observer: &dyn SessionObserver,
    ) -> SessionReport {
        let started = Instant::now();
        let cancel = self.downloader.cancel_token();
        let mut report = SessionReport::default();

        for (index, action) in actions.iter().enumerate() {
            if cancel.is_cancelled() {
                let failure = ActionFailure::cancelled(action);
                observer.action_failed(&failure);
                report.failed.push(failure);
                continue;
            }

            observer.action_started(index, actions.len(), action);
            tracing::info!(action = %action, "applying action");
            let action_started = Instant::now();
            match self.apply_action(store, action, observer) {
                Ok(bytes) => {
                    let outcome = ActionOutcome {
                        action: action.clone(),
                        bytes,
                        elapsed: action_started.elapsed(),
                    };
                    observer.action_succeeded(&outcome);
                    report.completed.push(outcome);

                    match write_env_file(self.layout, store.names().iter().map(String::as_str)) {
                        Ok(path) => report.env_file = Some(path),
                        Err(err) => {
                            tracing::warn!(error = %err, "environment file not regenerated");
                            report
                                .warnings
                                .push(format!("environment file not regenerated: {err:#}"));
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(action = %action, class = err.class.as_str(), reason = %err.reason, "action failed");
                    let failure = ActionFailure {
                        action: action.clone(),
                        class: err.class,
                        reason: err.reason,
                    };
                    observer.action_failed(&failure);
                    report.failed.push(failure);
                }
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    fn apply_action(
        &self,
        store: &mut VersionStore,
        action: &Action,
        observer: &dyn SessionObserver,
    ) -> Result<u64, StepError> {
        let (name, version, is_upgrade) = match action {
            Action::Remove { name, .. } => {
                self.handlers
                    .handler_for(name)
                    .uninstall(self.layout, name)?;
                store.remove(name)?;
                return Ok(0);
            }
            Action::Install { name, version } => (name, version, false),
            Action::Upgrade {
                name, to_version, ..
            } => (name, to_version, true),
        };

        let descriptor = self.catalog.get(name).ok_or_else(|| {
            StepError::new(
                ErrorClass::Install,
                format!("package '{name}' is not in the catalog"),
            )
        })?;
        let (artifact_path, bytes) = self.fetch_artifact(descriptor, action, observer)?;

        let handler = self.handlers.handler_for(name);
        let install = if is_upgrade {
            handler.update(self.layout, name, version, &artifact_path)?
        } else {
            handler.install(self.layout, name, version, &artifact_path)?
        };
        for entry in &install.skipped_entries {
            tracing::debug!(package = %name, entry = %entry, "archive entry skipped");
        }

        if is_upgrade {
            store.record_update(name, version)?;
        } else {
            store.record_install(name, version)?;
        }
        Ok(bytes)
    }

    fn fetch_artifact(
        &self,
        descriptor: &PackageDescriptor,
        action: &Action,
        observer: &dyn SessionObserver,
    ) -> Result<(PathBuf, u64), StepError> {
        let file_name = descriptor
            .artifact_file_name()
            .map_err(|err| StepError::new(ErrorClass::Install, format!("{err:#}")))?;
        let destination = self.layout.artifact_path(&file_name);
        if self.force_download {
            remove_file_if_exists(&destination).map_err(|err| {
                StepError::new(
                    ErrorClass::State,
                    format!(
                        "failed to discard cached artifact {}: {err}",
                        destination.display()
                    ),
                )
            })?;
        }

        let progress = |downloaded: u64, total: u64| {
            observer.download_progress(action, downloaded, total);
        };
        let outcome = self.retry.run(self.downloader.cancel_token(), self.sleep, |attempt| {
            if attempt > 1 {
                tracing::info!(package = %descriptor.name, attempt, "retrying download");
            }
            self.downloader.download(
                &descriptor.url,
                &destination,
                descriptor.expected_hash(),
                &progress,
            )
        })?;

        Ok((destination, outcome.bytes()))
    }
}
