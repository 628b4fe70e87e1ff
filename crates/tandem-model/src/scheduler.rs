// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-provider admission control for outbound model calls.
//!
//! Three knobs per provider: `max_parallel` (a semaphore on in-flight
//! calls), `min_interval` (a floor between call starts), and `jitter`
//! (uniform extra spacing added to the floor).  Every outbound provider
//! request passes through [`admit`]; the returned permit is held for the
//! duration of the call.
//!
//! Cancellation is free until the start instant is claimed: dropping the
//! `admit` future releases the concurrency slot and leaves the pacing
//! window unconsumed.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::catalog::Provider;

/// Admission knobs for one provider.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub min_interval: Duration,
    pub jitter: Duration,
}

impl SchedulerConfig {
    /// Built-in pacing per provider.  The ChatGPT backend is the most
    /// sensitive to bursts and gets the widest spacing.
    pub fn default_for(provider: Provider) -> Self {
        match provider {
            Provider::OpenAi => Self {
                max_parallel: 8,
                min_interval: Duration::from_millis(100),
                jitter: Duration::from_millis(50),
            },
            Provider::ChatGpt => Self {
                max_parallel: 2,
                min_interval: Duration::from_millis(500),
                jitter: Duration::from_millis(250),
            },
            Provider::Fireworks => Self {
                max_parallel: 4,
                min_interval: Duration::from_millis(150),
                jitter: Duration::from_millis(100),
            },
            Provider::Gemini => Self {
                max_parallel: 8,
                min_interval: Duration::from_millis(100),
                jitter: Duration::from_millis(50),
            },
            Provider::Mock => Self {
                max_parallel: 64,
                min_interval: Duration::ZERO,
                jitter: Duration::ZERO,
            },
        }
    }
}

/// Admission controller for a single provider.
pub struct CallScheduler {
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
    jitter: Duration,
    /// Earliest instant the next call may start.
    next_start: Mutex<Instant>,
}

/// RAII permit for one in-flight call.  Dropping it frees the slot.
pub struct CallPermit {
    _permit: OwnedSemaphorePermit,
}

impl CallScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            min_interval: config.min_interval,
            jitter: config.jitter,
            next_start: Mutex::new(Instant::now()),
        }
    }

    /// Wait until both a concurrency slot is free and the pacing window has
    /// elapsed, then claim a start instant.
    pub async fn admit(&self) -> CallPermit {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("scheduler semaphore is never closed");

        loop {
            let now = Instant::now();
            let wait = {
                let mut next = self.next_start.lock().unwrap();
                if *next <= now {
                    // Claim this start and push the window forward.  The
                    // window is only consumed here, so an abort during the
                    // sleep below costs nothing.
                    let jitter_ms = self.jitter.as_millis() as u64;
                    let extra = if jitter_ms == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
                    };
                    *next = now + self.min_interval + extra;
                    None
                } else {
                    Some(*next - now)
                }
            };
            match wait {
                None => return CallPermit { _permit: permit },
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// The lazily-built, module-level scheduler for a provider.
pub fn scheduler_for(provider: Provider) -> &'static CallScheduler {
    static SCHEDULERS: OnceLock<[CallScheduler; 5]> = OnceLock::new();
    let all = SCHEDULERS.get_or_init(|| {
        [
            CallScheduler::new(SchedulerConfig::default_for(Provider::OpenAi)),
            CallScheduler::new(SchedulerConfig::default_for(Provider::ChatGpt)),
            CallScheduler::new(SchedulerConfig::default_for(Provider::Fireworks)),
            CallScheduler::new(SchedulerConfig::default_for(Provider::Gemini)),
            CallScheduler::new(SchedulerConfig::default_for(Provider::Mock)),
        ]
    });
    match provider {
        Provider::OpenAi => &all[0],
        Provider::ChatGpt => &all[1],
        Provider::Fireworks => &all[2],
        Provider::Gemini => &all[3],
        Provider::Mock => &all[4],
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
