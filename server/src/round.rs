//! The countdown that drives one round.
//!
//! The timer owns no session state. It sleeps through the two letter reveals
//! and the countdown and reports each step back to the session as a
//! [`RoundEvent`] tagged with the round's generation, so the session can
//! ignore anything a cancelled round managed to send.

use crate::config::Timing;
use log::trace;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    RevealHead,
    RevealTail,
    Tick,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundEvent {
    pub generation: u64,
    pub phase: RoundPhase,
}

/// Handle to a running countdown task.
#[derive(Debug)]
pub struct RoundTimer {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RoundTimer {
    pub fn spawn<E>(
        generation: u64,
        timing: Timing,
        duration_units: u32,
        events: mpsc::UnboundedSender<E>,
    ) -> Self
    where
        E: From<RoundEvent> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_countdown(
            generation,
            timing,
            duration_units,
            events,
            cancel.clone(),
        ));
        Self {
            generation,
            cancel,
            task,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stops the countdown and waits until the task has actually exited.
    pub async fn cancel(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Waits for a countdown that is finishing on its own.
    pub async fn join(self) {
        // The task never panics on its own; an abort only happens at runtime shutdown
        let _ = self.task.await;
    }
}

async fn run_countdown<E>(
    generation: u64,
    timing: Timing,
    duration_units: u32,
    events: mpsc::UnboundedSender<E>,
    cancel: CancellationToken,
) where
    E: From<RoundEvent>,
{
    let send = |phase| {
        events
            .send(E::from(RoundEvent { generation, phase }))
            .is_ok()
    };

    for phase in [RoundPhase::RevealHead, RoundPhase::RevealTail] {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = sleep(timing.reveal_delay()) => {}
        }
        if !send(phase) {
            return;
        }
    }

    let mut ticker = interval_at(Instant::now() + timing.unit, timing.unit);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for remaining in (0..duration_units).rev() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        trace!("Round {} tick, {} left", generation, remaining);
        if !send(RoundPhase::Tick) {
            return;
        }
    }

    send(RoundPhase::Expired);
}
