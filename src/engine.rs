//! Transactional batch engine.
//!
//! The engine drives one link through `count` operations. An [`Exchange`]
//! performs a single produce or consume step; the engine decides around it
//! when to pace, when to record the per-message checkpoint and when to
//! declare, commit or roll back transactions.
//!
//! In transactional mode the run is split into full batches of `tx_size`
//! operations, each closed with the per-batch action, followed by a tail of
//! the remaining operations closed with the final action:
//!
//! ```text
//! begin ─► [op × tx_size] ─► commit|rollback ─► begin ─► ... ─► [tail ops] ─► final action
//! ```

use crate::checkpoint::{CheckpointRecorder, Phase};
use crate::clock::{Clock, QuantaClock};
use crate::config::{DurationMode, RunConfig, TxAction};
use crate::error::Result;
use crate::pacing::Pacer;
use crate::transport::Transactional;

/// Result of a single produce/consume step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Transferred,
    /// Nothing was available (e.g. the receive timed out).
    Idle,
}

/// One produce-or-consume capability driven by the engine.
pub trait Exchange {
    /// Transfers the message with 0-based `index`.
    fn exchange(&mut self, index: u64) -> Result<Progress>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub processed: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

impl EngineReport {
    /// Transaction boundaries that received an outcome.
    pub fn boundaries(&self) -> u64 {
        self.committed + self.rolled_back
    }
}

pub struct BatchEngine<'a, C: Clock = QuantaClock> {
    config: &'a RunConfig,
    pacer: Pacer<C>,
    recorder: &'a mut CheckpointRecorder<C>,
    report: EngineReport,
}

impl<'a, C: Clock> BatchEngine<'a, C> {
    /// Creates an engine whose pacing schedule starts now.
    pub fn new(config: &'a RunConfig, recorder: &'a mut CheckpointRecorder<C>) -> Self {
        let pacer = Pacer::new(recorder.clock().clone(), config.count, config.duration);
        Self {
            config,
            pacer,
            recorder,
            report: EngineReport::default(),
        }
    }

    /// Progress so far; still meaningful after `run` failed.
    pub fn report(&self) -> EngineReport {
        self.report
    }

    /// Runs to completion. `session` is only touched in transactional mode.
    pub fn run<T>(&mut self, exchange: &mut dyn Exchange, session: &mut T) -> Result<EngineReport>
    where
        T: Transactional + ?Sized,
    {
        if self.config.is_transactional() {
            self.run_transactional(exchange, session)?;
        } else {
            self.run_plain(exchange)?;
        }
        log::info!(
            "engine finished: processed={} committed={} rolled_back={}",
            self.report.processed,
            self.report.committed,
            self.report.rolled_back
        );
        Ok(self.report)
    }

    fn wants_more(&self) -> bool {
        self.config.count == 0 || self.report.processed < self.config.count
    }

    /// Whether fewer than a full batch remains.
    fn in_tail(&self, batch: u64) -> bool {
        self.config.count > 0 && self.config.count - self.report.processed < batch
    }

    fn run_plain(&mut self, exchange: &mut dyn Exchange) -> Result<()> {
        while self.wants_more() {
            if self.step(exchange, false)? == Progress::Idle {
                break;
            }
        }
        Ok(())
    }

    fn run_transactional<T>(&mut self, exchange: &mut dyn Exchange, session: &mut T) -> Result<()>
    where
        T: Transactional + ?Sized,
    {
        let batch = u64::from(self.config.tx_size);
        let mut exhausted = false;

        session.begin()?;
        while batch > 0 && self.wants_more() && !self.in_tail(batch) {
            let mut in_batch = 0;
            while in_batch < batch {
                if self.step(exchange, true)? == Progress::Idle {
                    exhausted = true;
                    break;
                }
                in_batch += 1;
            }
            if in_batch == 0 {
                break;
            }

            self.apply(session, self.config.tx_action)?;
            session.begin()?;
            if self.config.duration_mode == DurationMode::AfterSendAfterTxAction {
                self.pacer.wait(self.report.processed);
            }
            if exhausted {
                break;
            }
        }

        let mut tail = 0u64;
        if !exhausted {
            while self.wants_more() {
                if self.step(exchange, true)? == Progress::Idle {
                    break;
                }
                tail += 1;
            }
        }

        match self.config.tx_final_action {
            Some(action) => self.apply(session, action)?,
            None if tail > 0 => self.apply(session, TxAction::Commit)?,
            // The empty boundary is discharged when the session closes.
            None => log::debug!("no final action and empty tail; leaving boundary open"),
        }
        if tail > 0 && self.config.duration_mode == DurationMode::AfterSendAfterTxAction {
            self.pacer.wait(self.report.processed);
        }
        Ok(())
    }

    fn step(&mut self, exchange: &mut dyn Exchange, transactional: bool) -> Result<Progress> {
        let index = self.report.processed;
        let mode = self.config.duration_mode;

        if mode == DurationMode::BeforeSend {
            self.pacer.wait(index + 1);
        }
        if exchange.exchange(index)? == Progress::Idle {
            return Ok(Progress::Idle);
        }
        let pace_now = match mode {
            DurationMode::BeforeSend => false,
            DurationMode::AfterSendBeforeTxAction => true,
            DurationMode::AfterSendAfterTxAction => !transactional,
        };
        if pace_now {
            self.pacer.wait(index + 1);
        }

        self.recorder.record(Phase::Message);
        self.report.processed += 1;
        Ok(Progress::Transferred)
    }

    fn apply<T>(&mut self, session: &mut T, action: TxAction) -> Result<()>
    where
        T: Transactional + ?Sized,
    {
        match action {
            TxAction::Commit => {
                session.commit()?;
                self.report.committed += 1;
            }
            TxAction::Rollback => {
                session.rollback()?;
                self.report.rolled_back += 1;
            }
        }
        log::debug!(
            "{action:?} after {} messages ({} boundaries)",
            self.report.processed,
            self.report.boundaries()
        );
        Ok(())
    }
}
