use chrono::{DateTime, Duration, Utc};

use crate::config::GateConfig;
use crate::model::{
    CrossSign, GateState, IndicatorSnapshot, Recommendation, RsiZone, TriggerReason,
};

/// Outcome of evaluating one snapshot against a pair's prior state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateDecision {
    /// Reasons that fired and are outside their cooldown window.
    pub reasons: Vec<TriggerReason>,
    /// Reasons whose condition holds but are still cooling down.
    pub suppressed: Vec<TriggerReason>,
}

impl GateDecision {
    pub fn is_significant(&self) -> bool {
        !self.reasons.is_empty()
    }

    pub fn primary_reason(&self) -> Option<TriggerReason> {
        self.reasons.first().copied()
    }
}

/// Decides whether a snapshot is worth an analysis call and a notification.
#[derive(Debug, Clone)]
pub struct Gate {
    price_move_threshold: f64,
    rsi_overbought: f64,
    rsi_oversold: f64,
    cooldown: Duration,
}

impl Gate {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            price_move_threshold: config.price_move_threshold,
            rsi_overbought: config.rsi_overbought,
            rsi_oversold: config.rsi_oversold,
            cooldown: Duration::minutes(config.cooldown_minutes as i64),
        }
    }

    pub fn rsi_zone(&self, rsi: f64) -> RsiZone {
        if rsi >= self.rsi_overbought {
            RsiZone::Overbought
        } else if rsi <= self.rsi_oversold {
            RsiZone::Oversold
        } else {
            RsiZone::Neutral
        }
    }

    /// Pure: the same inputs always give the same decision. Undefined
    /// indicators make their rule undecidable, so it never fires.
    pub fn evaluate(
        &self,
        current: &IndicatorSnapshot,
        previous: Option<&GateState>,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let Some(previous) = previous else {
            return GateDecision {
                reasons: vec![TriggerReason::FirstRun],
                suppressed: Vec::new(),
            };
        };

        let mut fired = Vec::new();

        if previous.last_notified_price > 0.0 {
            let moved = (current.price - previous.last_notified_price).abs()
                / previous.last_notified_price;
            if moved >= self.price_move_threshold {
                fired.push(TriggerReason::PriceMove);
            }
        }

        if let Some(rsi) = current.rsi {
            let zone = self.rsi_zone(rsi);
            if zone != previous.last_rsi_zone {
                match zone {
                    RsiZone::Overbought => fired.push(TriggerReason::RsiOverbought),
                    RsiZone::Oversold => fired.push(TriggerReason::RsiOversold),
                    RsiZone::Neutral => {}
                }
            }
        }

        if let (Some(sign), Some(last_sign)) = (current.cross_sign(), previous.last_cross_sign)
            && sign != last_sign
        {
            fired.push(match sign {
                CrossSign::Positive => TriggerReason::GoldenCross,
                CrossSign::Negative => TriggerReason::DeathCross,
            });
        }

        let (suppressed, reasons): (Vec<_>, Vec<_>) = fired
            .into_iter()
            .partition(|reason| previous.in_cooldown(*reason, now));

        GateDecision {
            reasons,
            suppressed,
        }
    }

    /// State to persist once the notification for `decision` was delivered.
    ///
    /// Fired reasons start a new cooldown window; unexpired windows of other
    /// reasons carry over.
    pub fn committed_state(
        &self,
        previous: Option<&GateState>,
        current: &IndicatorSnapshot,
        decision: &GateDecision,
        recommendation: Option<Recommendation>,
        now: DateTime<Utc>,
    ) -> GateState {
        let mut cooldowns = previous.map(|p| p.cooldowns.clone()).unwrap_or_default();
        cooldowns.retain(|_, expiry| *expiry > now);
        for reason in &decision.reasons {
            cooldowns.insert(*reason, now + self.cooldown);
        }

        let last_rsi_zone = current
            .rsi
            .map(|rsi| self.rsi_zone(rsi))
            .or(previous.map(|p| p.last_rsi_zone))
            .unwrap_or(RsiZone::Neutral);

        GateState {
            last_notified_price: current.price,
            last_rsi_zone,
            last_cross_sign: current
                .cross_sign()
                .or(previous.and_then(|p| p.last_cross_sign)),
            cooldowns,
            last_recommendation: recommendation.or(previous.and_then(|p| p.last_recommendation)),
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn gate() -> Gate {
        Gate::new(&GateConfig::default())
    }

    fn snapshot(price: f64, rsi: f64, ema_short: f64, ema_long: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            ticker: "AAPL".into(),
            timestamp: Utc::now(),
            price,
            change_pct: None,
            rsi: Some(rsi),
            ema_short: Some(ema_short),
            ema_long: Some(ema_long),
        }
    }

    fn state(price: f64, zone: RsiZone, sign: Option<CrossSign>) -> GateState {
        GateState {
            last_notified_price: price,
            last_rsi_zone: zone,
            last_cross_sign: sign,
            cooldowns: BTreeMap::new(),
            last_recommendation: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn first_run_without_prior_state() {
        let decision = gate().evaluate(&snapshot(100.0, 50.0, 1.0, 2.0), None, Utc::now());
        assert!(decision.is_significant());
        assert_eq!(decision.primary_reason(), Some(TriggerReason::FirstRun));
    }

    #[test]
    fn quiet_when_nothing_changed() {
        let prev = state(100.0, RsiZone::Neutral, Some(CrossSign::Positive));
        let decision = gate().evaluate(&snapshot(101.0, 55.0, 110.0, 100.0), Some(&prev), Utc::now());
        assert!(!decision.is_significant());
        assert!(decision.suppressed.is_empty());
    }

    #[test]
    fn price_move_at_threshold_fires() {
        let prev = state(100.0, RsiZone::Neutral, None);
        let up = gate().evaluate(&snapshot(105.0, 55.0, 1.0, 1.0), Some(&prev), Utc::now());
        assert_eq!(up.reasons, vec![TriggerReason::PriceMove]);
        let down = gate().evaluate(&snapshot(94.0, 45.0, 1.0, 1.0), Some(&prev), Utc::now());
        assert_eq!(down.reasons, vec![TriggerReason::PriceMove]);
        let small = gate().evaluate(&snapshot(104.9, 55.0, 1.0, 1.0), Some(&prev), Utc::now());
        assert!(!small.is_significant());
    }

    #[test]
    fn rsi_drop_into_oversold_fires_and_commits_zone() {
        let g = gate();
        let now = Utc::now();
        let prev = state(100.0, RsiZone::Neutral, Some(CrossSign::Positive));

        // nine quiet days at RSI 50
        for _ in 0..9 {
            let d = g.evaluate(&snapshot(100.0, 50.0, 105.0, 100.0), Some(&prev), now);
            assert!(!d.is_significant());
        }

        let day10 = snapshot(99.0, 28.0, 105.0, 100.0);
        let decision = g.evaluate(&day10, Some(&prev), now);
        assert!(decision.is_significant());
        assert_eq!(decision.primary_reason(), Some(TriggerReason::RsiOversold));

        let next = g.committed_state(Some(&prev), &day10, &decision, Some(Recommendation::Buy), now);
        assert_eq!(next.last_rsi_zone, RsiZone::Oversold);
        assert_eq!(next.last_notified_price, 99.0);
        assert_eq!(next.last_recommendation, Some(Recommendation::Buy));
    }

    #[test]
    fn rsi_overbought_boundary_is_inclusive() {
        let prev = state(100.0, RsiZone::Neutral, None);
        let d = gate().evaluate(&snapshot(100.0, 70.0, 1.0, 1.0), Some(&prev), Utc::now());
        assert_eq!(d.reasons, vec![TriggerReason::RsiOverbought]);
    }

    #[test]
    fn staying_in_notified_zone_does_not_fire() {
        let prev = state(100.0, RsiZone::Oversold, None);
        let d = gate().evaluate(&snapshot(100.0, 22.0, 1.0, 1.0), Some(&prev), Utc::now());
        assert!(!d.is_significant());
    }

    #[test]
    fn golden_cross_fires_regardless_of_rsi() {
        let g = gate();
        let now = Utc::now();
        let prev = state(100.0, RsiZone::Overbought, Some(CrossSign::Negative));
        let current = snapshot(101.0, 85.0, 100.5, 100.0);

        let decision = g.evaluate(&current, Some(&prev), now);
        assert_eq!(decision.reasons, vec![TriggerReason::GoldenCross]);

        let next = g.committed_state(Some(&prev), &current, &decision, None, now);
        assert_eq!(next.last_cross_sign, Some(CrossSign::Positive));
        assert_eq!(next.last_cross_sign.map(CrossSign::as_i64), Some(1));
    }

    #[test]
    fn death_cross_fires() {
        let prev = state(100.0, RsiZone::Neutral, Some(CrossSign::Positive));
        let d = gate().evaluate(&snapshot(100.0, 50.0, 99.0, 100.0), Some(&prev), Utc::now());
        assert_eq!(d.reasons, vec![TriggerReason::DeathCross]);
    }

    #[test]
    fn unknown_prior_cross_sign_never_fires() {
        let prev = state(100.0, RsiZone::Neutral, None);
        let d = gate().evaluate(&snapshot(100.0, 50.0, 120.0, 100.0), Some(&prev), Utc::now());
        assert!(!d.is_significant());
    }

    #[test]
    fn undefined_indicators_never_fire() {
        let prev = state(100.0, RsiZone::Neutral, Some(CrossSign::Negative));
        let current = IndicatorSnapshot {
            rsi: None,
            ema_long: None,
            ..snapshot(100.0, 10.0, 120.0, 100.0)
        };
        assert!(!gate().evaluate(&current, Some(&prev), Utc::now()).is_significant());
    }

    #[test]
    fn evaluation_is_idempotent_after_commit() {
        let g = gate();
        let now = Utc::now();
        let prev = state(100.0, RsiZone::Neutral, Some(CrossSign::Negative));
        let current = snapshot(107.0, 75.0, 101.0, 100.0);

        let first = g.evaluate(&current, Some(&prev), now);
        assert_eq!(
            first.reasons,
            vec![
                TriggerReason::PriceMove,
                TriggerReason::RsiOverbought,
                TriggerReason::GoldenCross
            ]
        );
        let committed = g.committed_state(Some(&prev), &current, &first, None, now);

        for _ in 0..3 {
            assert!(!g.evaluate(&current, Some(&committed), now).is_significant());
        }
        let later = now + Duration::days(30);
        assert!(!g.evaluate(&current, Some(&committed), later).is_significant());
    }

    #[test]
    fn crossing_fires_once_inside_cooldown() {
        let g = gate();
        let now = Utc::now();
        let prev = state(100.0, RsiZone::Neutral, Some(CrossSign::Negative));
        let golden = snapshot(100.0, 50.0, 101.0, 100.0);

        let first = g.evaluate(&golden, Some(&prev), now);
        assert_eq!(first.reasons, vec![TriggerReason::GoldenCross]);
        let committed = g.committed_state(Some(&prev), &golden, &first, None, now);

        // dips below and crosses back up within the window
        let after_death = GateState {
            last_cross_sign: Some(CrossSign::Negative),
            ..committed.clone()
        };
        let again = g.evaluate(&golden, Some(&after_death), now + Duration::minutes(10));
        assert!(!again.is_significant());
        assert_eq!(again.suppressed, vec![TriggerReason::GoldenCross]);

        let expired = now + Duration::minutes(241);
        let later = g.evaluate(&golden, Some(&after_death), expired);
        assert_eq!(later.reasons, vec![TriggerReason::GoldenCross]);
    }

    #[test]
    fn cooldown_is_per_reason() {
        let g = gate();
        let now = Utc::now();
        let prev = state(100.0, RsiZone::Neutral, None);
        let jump = snapshot(110.0, 55.0, 1.0, 1.0);
        let first = g.evaluate(&jump, Some(&prev), now);
        let committed = g.committed_state(Some(&prev), &jump, &first, None, now);

        let crash = snapshot(95.0, 20.0, 1.0, 1.0);
        let d = g.evaluate(&crash, Some(&committed), now + Duration::minutes(5));
        assert_eq!(d.reasons, vec![TriggerReason::RsiOversold]);
        assert_eq!(d.suppressed, vec![TriggerReason::PriceMove]);

        let next = g.committed_state(Some(&committed), &crash, &d, None, now + Duration::minutes(5));
        assert!(next.in_cooldown(TriggerReason::PriceMove, now + Duration::minutes(6)));
        assert!(next.in_cooldown(TriggerReason::RsiOversold, now + Duration::minutes(6)));
    }
}
