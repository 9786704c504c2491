//! Event processing statistics.
//!
//! A wildcard pre/post interceptor pair measures how long every dispatched
//! event takes in its handlers. Raw samples are kept per event type; on a
//! configurable interval they are folded into min/max/avg buckets. Rollups
//! happen opportunistically in the post-intercept hook, so the service needs
//! no timer of its own.

use chrono::Utc;
use ichor_runtime::{
    EventInterceptor, EventInterceptorRegistration, Service, ServiceContext, ServiceRegistration,
    StartOutcome,
};
use ichor_types::{EventEnvelope, EventTypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

/// One raw measurement: wall-clock stamp plus handler processing time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatisticEntry {
    pub timestamp_ms: i64,
    pub processing_time_us: i64,
}

/// Rolled-up bucket over one averaging interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AveragedStatisticEntry {
    pub timestamp_ms: i64,
    pub min_processing_time_us: i64,
    pub max_processing_time_us: i64,
    pub avg_processing_time_us: i64,
    pub occurrences: u64,
}

/// Read access to collected statistics.
pub trait EventStatistics {
    fn recent_statistics(&self) -> HashMap<&'static str, Vec<StatisticEntry>>;
    fn average_statistics(&self) -> HashMap<&'static str, Vec<AveragedStatisticEntry>>;
}

pub struct EventStatisticsService {
    recent: HashMap<&'static str, Vec<StatisticEntry>>,
    averaged: HashMap<&'static str, Vec<AveragedStatisticEntry>>,
    current_event_started: Option<Instant>,
    averaging_interval_ms: i64,
    last_rollup_ms: i64,
    registration: Option<EventInterceptorRegistration>,
}

impl EventStatisticsService {
    pub fn new(averaging_interval_ms: i64) -> Self {
        Self {
            recent: HashMap::new(),
            averaged: HashMap::new(),
            current_event_started: None,
            averaging_interval_ms,
            last_rollup_ms: Utc::now().timestamp_millis(),
            registration: None,
        }
    }

    /// Registration publishing `dyn EventStatistics`.
    pub fn registration(averaging_interval_ms: i64) -> ServiceRegistration<EventStatisticsService> {
        ServiceRegistration::new(move || EventStatisticsService::new(averaging_interval_ms))
            .provides(|rc| rc as Rc<RefCell<dyn EventStatistics>>)
    }

    fn roll_up(&mut self, now_ms: i64) {
        for (event_name, samples) in self.recent.drain() {
            if samples.is_empty() {
                continue;
            }
            let min = samples.iter().map(|s| s.processing_time_us).min().unwrap_or(0);
            let max = samples.iter().map(|s| s.processing_time_us).max().unwrap_or(0);
            let sum: i64 = samples.iter().map(|s| s.processing_time_us).sum();
            let occurrences = samples.len() as u64;
            self.averaged
                .entry(event_name)
                .or_default()
                .push(AveragedStatisticEntry {
                    timestamp_ms: now_ms,
                    min_processing_time_us: min,
                    max_processing_time_us: max,
                    avg_processing_time_us: sum / samples.len() as i64,
                    occurrences,
                });
        }
        self.last_rollup_ms = now_ms;
    }
}

impl Service for EventStatisticsService {
    fn start(&mut self, ctx: &ServiceContext) -> StartOutcome {
        self.registration = Some(ctx.register_interceptor::<Self>(EventTypeId::WILDCARD));
        StartOutcome::Ok
    }

    fn stop(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.registration = None;
        StartOutcome::Ok
    }
}

impl EventInterceptor for EventStatisticsService {
    fn pre_intercept(&mut self, _event: &EventEnvelope, _ctx: &ServiceContext) -> bool {
        self.current_event_started = Some(Instant::now());
        true
    }

    fn post_intercept(&mut self, event: &EventEnvelope, _processed: bool, _ctx: &ServiceContext) {
        let Some(started) = self.current_event_started.take() else {
            return;
        };
        let now_ms = Utc::now().timestamp_millis();
        let elapsed_us = i64::try_from(started.elapsed().as_micros()).unwrap_or(i64::MAX);
        self.recent.entry(event.name()).or_default().push(StatisticEntry {
            timestamp_ms: now_ms,
            processing_time_us: elapsed_us,
        });
        if now_ms - self.last_rollup_ms >= self.averaging_interval_ms {
            self.roll_up(now_ms);
        }
    }
}

impl EventStatistics for EventStatisticsService {
    fn recent_statistics(&self) -> HashMap<&'static str, Vec<StatisticEntry>> {
        self.recent.clone()
    }

    fn average_statistics(&self) -> HashMap<&'static str, Vec<AveragedStatisticEntry>> {
        self.averaged.clone()
    }
}
