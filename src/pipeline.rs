use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::Browser;
use crate::config::{RetryConfig, SearchInstruction, SiteConfig};
use crate::currency::CurrencyNormalizer;
use crate::error::Result;
use crate::extract::{extract, Extraction};
use crate::locators::LocatorStore;
use crate::persist::Sink;
use crate::retry::{run_stage, Completed, Stage, StageFailure};
use crate::transform::{apply_filter, compile_filter, transform, NormalizedListing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionState {
    Pending,
    Extracting,
    Transforming,
    Persisting,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { persisted: usize },
    Failed { stage: Stage, reason: String },
    /// Not started because the run was aborted.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct InstructionReport {
    pub instruction: String,
    pub state: InstructionState,
    pub outcome: Outcome,
    /// Attempts used per stage, in execution order.
    pub attempts: Vec<(Stage, u32)>,
}

impl InstructionReport {
    fn new(instruction: String) -> Self {
        Self {
            instruction,
            state: InstructionState::Pending,
            outcome: Outcome::Skipped,
            attempts: Vec::new(),
        }
    }

    fn enter(&mut self, state: InstructionState) {
        debug!(instruction = %self.instruction, from = ?self.state, to = ?state, "State transition");
        self.state = state;
    }

    fn fail(mut self, failure: &StageFailure) -> Self {
        if failure.attempts > 0 {
            self.attempts.push((failure.stage, failure.attempts));
        }
        self.enter(InstructionState::Failed);
        self.outcome = Outcome::Failed {
            stage: failure.stage,
            reason: failure.error.to_string(),
        };
        self
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub instructions: Vec<InstructionReport>,
    /// Cause of an early stop, if any.
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped))
    }

    pub fn persisted(&self) -> usize {
        self.instructions
            .iter()
            .map(|r| match r.outcome {
                Outcome::Succeeded { persisted } => persisted,
                _ => 0,
            })
            .sum()
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.failed() == 0
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.instructions.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Drives instructions through extract, transform and persist, one at a time.
pub struct Pipeline<'a> {
    pub browser: &'a dyn Browser,
    pub site: &'a SiteConfig,
    pub retry: &'a RetryConfig,
    pub locators: &'a dyn LocatorStore,
    pub currency: &'a CurrencyNormalizer,
    pub sink: &'a Sink,
    pub cancel: CancellationToken,
    pub progress: ProgressBar,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        browser: &'a dyn Browser,
        site: &'a SiteConfig,
        retry: &'a RetryConfig,
        locators: &'a dyn LocatorStore,
        currency: &'a CurrencyNormalizer,
        sink: &'a Sink,
    ) -> Self {
        Self {
            browser,
            site,
            retry,
            locators,
            currency,
            sink,
            cancel: CancellationToken::new(),
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Process `instructions` in order. The browser session is released once
    /// at the end, whatever happened.
    pub async fn run(&self, instructions: &[SearchInstruction]) -> RunReport {
        let mut report = RunReport::default();
        self.progress.set_length(instructions.len() as u64);

        for instruction in instructions {
            let id = instruction.id();
            if report.aborted.is_some() {
                report.instructions.push(InstructionReport::new(id));
                continue;
            }
            if self.cancel.is_cancelled() {
                warn!(instruction = %id, "Run cancelled, skipping remaining instructions");
                report.aborted = Some("run cancelled".into());
                report.instructions.push(InstructionReport::new(id));
                continue;
            }

            self.progress.set_message(id.clone());
            let (result, abort) = self.run_instruction(instruction).await;
            if let Some(cause) = abort {
                error!(instruction = %id, %cause, "Aborting run");
                report.aborted = Some(cause);
            }
            report.instructions.push(result);
            self.progress.inc(1);
        }

        self.browser.close().await;
        self.progress.finish_and_clear();
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            persisted = report.persisted(),
            "Run finished"
        );
        report
    }

    /// Returns the report and, when the failure must stop the run, its cause.
    async fn run_instruction(
        &self,
        instruction: &SearchInstruction,
    ) -> (InstructionReport, Option<String>) {
        let id = instruction.id();
        let mut report = InstructionReport::new(id.clone());

        let regex = match compile_filter(&instruction.filter_regex, instruction.case_insensitive) {
            Ok(regex) => regex,
            Err(error) => {
                let failure = StageFailure {
                    stage: Stage::Validate,
                    attempts: 0,
                    error,
                };
                error!(instruction = %id, %failure, "Instruction rejected");
                return (report.fail(&failure), None);
            }
        };

        report.enter(InstructionState::Extracting);
        let extraction = match run_stage(Stage::Extract, &id, &self.retry.extract, &self.cancel, move || {
            extract_attempt(self, instruction)
        })
        .await
        {
            Ok(done) => record(&mut report, Stage::Extract, done),
            Err(failure) => return finish_failed(report, failure),
        };
        if extraction.calibrated {
            info!(
                instruction = %id,
                title = %extraction.locators.title_selector,
                price = %extraction.locators.price_selector,
                "Locators calibrated and cached"
            );
        }

        report.enter(InstructionState::Transforming);
        let raw = &extraction.listings;
        let currency = self.currency;
        let source_currency = self.site.source_currency.as_str();
        let listings = match run_stage(Stage::Transform, &id, &self.retry.transform, &self.cancel, move || {
            transform(raw, currency, source_currency)
        })
        .await
        {
            Ok(done) => apply_filter(record(&mut report, Stage::Transform, done), &regex),
            Err(failure) => return finish_failed(report, failure),
        };

        report.enter(InstructionState::Persisting);
        let kept = &listings;
        let persisted = match run_stage(Stage::Persist, &id, &self.retry.persist, &self.cancel, move || {
            persist_attempt(self, instruction, kept)
        })
        .await
        {
            Ok(done) => record(&mut report, Stage::Persist, done),
            Err(failure) => return finish_failed(report, failure),
        };

        report.enter(InstructionState::Succeeded);
        report.outcome = Outcome::Succeeded { persisted };
        (report, None)
    }
}

fn record<T>(report: &mut InstructionReport, stage: Stage, done: Completed<T>) -> T {
    report.attempts.push((stage, done.attempts));
    done.value
}

fn finish_failed(
    report: InstructionReport,
    failure: StageFailure,
) -> (InstructionReport, Option<String>) {
    let abort = failure.aborts_run().then(|| failure.error.to_string());
    (report.fail(&failure), abort)
}

async fn extract_attempt(p: &Pipeline<'_>, instruction: &SearchInstruction) -> Result<Extraction> {
    let cached = p.locators.load(&instruction.category)?;
    extract(p.browser, p.site, instruction, cached, p.locators).await
}

async fn persist_attempt(
    p: &Pipeline<'_>,
    instruction: &SearchInstruction,
    listings: &[NormalizedListing],
) -> Result<usize> {
    p.sink.persist(&p.site.website_name, instruction, listings)
}
