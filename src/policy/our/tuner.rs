use std::collections::VecDeque;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::policy::stats::Histogram;
use crate::timeq::Cycle;

const HISTORY_CAPACITY: usize = 64;
// share of sparsely used pages above which coarser fetching is worth trying
const SPARSITY_GATE: f64 = 0.5;

// Observations collected over one adaptation window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub hit_pr: u64,
    pub hit_br: u64,
    pub miss: u64,
    // sub-blocks touched by evicted pages
    pub line_utility: Histogram,
    pub padding_interval: Histogram,
    pub miss_penalty: Histogram,
    pub promotions: u64,
    pub paddings: u64,
}

impl Default for WindowStats {
    fn default() -> Self {
        Self {
            hit_pr: 0,
            hit_br: 0,
            miss: 0,
            line_utility: Histogram::with_range(16),
            padding_interval: Histogram::new(),
            miss_penalty: Histogram::new(),
            promotions: 0,
            paddings: 0,
        }
    }
}

impl WindowStats {
    pub fn accesses(&self) -> u64 {
        self.hit_pr + self.hit_br + self.miss
    }

    pub fn miss_rate(&self) -> f64 {
        match self.accesses() {
            0 => 0.0,
            n => self.miss as f64 / n as f64,
        }
    }

    // Fraction of evicted pages that used at most half of their sub-blocks.
    pub fn sparsity(&self) -> f64 {
        let u = &self.line_utility;
        let sparse = u.range_sum(1, 2) + u.range_sum(3, 4) + u.range_sum(5, 8);
        let total = sparse + u.range_sum(9, 16);
        if total == 0 {
            return 0.0;
        }
        sparse as f64 / total as f64
    }

    // Promotions that were not triggered by padding.
    pub fn promotion_ops(&self) -> u64 {
        self.promotions.saturating_sub(self.paddings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Threshold {
    pub promotion_t: u64,
    pub padding_t: u64,
    // average miss penalty observed while running with this pair
    pub score: f64,
    pub rollbacks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunerAction {
    // window saw no accesses
    Skipped,
    Idle,
    RollBack,
    IncreasePromotion,
    DecreasePadding,
    Stay,
    TryLast,
}

// Randomized hill climbing over (PROMOTION_T, PADDING_T), evaluated once per window.
#[derive(Debug)]
pub struct ThresholdTuner {
    promotion_t: u64,
    padding_t: u64,
    max_promotion: u64,
    history: VecDeque<Threshold>,
    rollbacks: u64,
    idle: u64,
    rng: StdRng,
    pub window: WindowStats,
    // (cycle, promotion_t, padding_t) at every window boundary
    trace: Vec<(Cycle, u64, u64)>,
}

impl ThresholdTuner {
    pub fn new(padding_t: u64, max_promotion: u64, seed: u64) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_CAPACITY);
        history.push_back(Threshold {
            promotion_t: 0,
            padding_t,
            score: padding_t as f64,
            rollbacks: 0,
        });
        Self {
            promotion_t: 0,
            padding_t,
            max_promotion,
            history,
            rollbacks: 0,
            idle: 0,
            rng: StdRng::seed_from_u64(seed),
            window: WindowStats::default(),
            trace: Vec::new(),
        }
    }

    pub fn promotion_t(&self) -> u64 {
        self.promotion_t
    }

    pub fn padding_t(&self) -> u64 {
        self.padding_t
    }

    pub fn history(&self) -> impl Iterator<Item = &Threshold> {
        self.history.iter()
    }

    pub fn trace(&self) -> &[(Cycle, u64, u64)] {
        &self.trace
    }

    fn remember(&mut self, score: f64) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(Threshold {
            promotion_t: self.promotion_t,
            padding_t: self.padding_t,
            score,
            rollbacks: self.rollbacks,
        });
    }

    fn choose(&mut self, score: f64) -> TunerAction {
        let w = &self.window;
        let sparse = w.sparsity() > SPARSITY_GATE;
        let promotion_ops = w.promotion_ops();
        let last = self.history.back().copied();

        let can_roll_back = last.is_some_and(|t| t.score <= score);
        let can_promote = self.promotion_t < self.max_promotion && sparse && promotion_ops >= w.paddings;
        let can_pad = self.padding_t > 0 && sparse && promotion_ops <= w.paddings;
        let can_try_last = last
            .is_some_and(|t| !(t.promotion_t == self.promotion_t && t.padding_t == self.padding_t));

        loop {
            match self.rng.gen_range(0..5) {
                0 if can_roll_back => return TunerAction::RollBack,
                1 if can_promote => return TunerAction::IncreasePromotion,
                2 if can_pad => return TunerAction::DecreasePadding,
                3 => return TunerAction::Stay,
                4 if can_try_last => return TunerAction::TryLast,
                _ => {}
            }
        }
    }

    // Evaluate the window that just ended and possibly move the thresholds.
    pub fn adapt(&mut self, now: Cycle) -> TunerAction {
        self.trace.push((now, self.promotion_t, self.padding_t));
        if self.window.accesses() == 0 {
            return TunerAction::Skipped;
        }

        let miss_rate = self.window.miss_rate();
        let score = miss_rate * self.window.miss_penalty.average();
        debug!(
            "window @{}: hit pr {} br {} miss {} miss rate {:.4} penalty {:.2} sparsity {:.3}",
            now,
            self.window.hit_pr,
            self.window.hit_br,
            self.window.miss,
            miss_rate,
            score,
            self.window.sparsity()
        );

        if self.idle > 0 {
            self.idle -= 1;
            return TunerAction::Idle;
        }

        let action = self.choose(score);
        match action {
            TunerAction::RollBack => {
                if let Some(last) = self.history.pop_back() {
                    self.promotion_t = last.promotion_t;
                    self.padding_t = last.padding_t;
                    self.rollbacks = last.rollbacks + 1;
                    self.idle = self.rollbacks;
                    info!(
                        "roll back to {} {} and idle for {}",
                        self.promotion_t, self.padding_t, self.idle
                    );
                }
            }
            TunerAction::IncreasePromotion => {
                if self.history.back().map_or(true, |t| score < t.score) {
                    self.remember(score);
                }
                self.promotion_t += 1;
                self.rollbacks = 0;
                self.idle = 0;
                info!("increase promotion threshold to {}", self.promotion_t);
            }
            TunerAction::DecreasePadding => {
                if self.history.back().map_or(true, |t| score < t.score) {
                    self.remember(score);
                }
                self.padding_t = self.window.padding_interval.average() as u64;
                self.rollbacks = 0;
                self.idle = 0;
                info!("decrease padding threshold to {}", self.padding_t);
            }
            TunerAction::TryLast => {
                if let Some(last) = self.history.pop_back() {
                    if score < last.score {
                        self.remember(score);
                    }
                    self.promotion_t = last.promotion_t;
                    self.padding_t = last.padding_t;
                    self.rollbacks = last.rollbacks;
                    self.idle = 0;
                    info!("try last state {} {}", self.promotion_t, self.padding_t);
                }
            }
            TunerAction::Stay => {
                debug!("keep thresholds {} {}", self.promotion_t, self.padding_t);
            }
            TunerAction::Skipped | TunerAction::Idle => {}
        }

        if action != TunerAction::Stay {
            self.window = WindowStats::default();
        }
        action
    }
}
