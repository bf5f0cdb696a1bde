#[cfg(test)]
mod risk_manager_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use approx::assert_relative_eq;
    use chrono::{DateTime, Utc};
    use tokio_test::{assert_err, assert_ok};
    use trading_core::{
        Bar, Clock, Fill, ManualClock, OrderIntent, OrderPurpose, RecordingSink,
        RiskCheckType, Side, TakeProfitTier, Tick,
    };

    use crate::*;

    struct Harness {
        manager: RiskManager,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink>,
    }

    fn harness(limits: RiskLimits, default_stop: Option<StopConfig>) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sink = Arc::new(RecordingSink::new());
        let defaults = StopDefaults {
            default_stop,
            atr_period: 14,
        };
        let manager = RiskManager::new(limits, defaults, 100_000.0, clock.clone(), sink.clone());
        Harness {
            manager,
            clock,
            sink,
        }
    }

    fn tick(symbol: &str, price: f64, at: DateTime<Utc>) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            volume: 100.0,
            timestamp: at,
        }
    }

    fn fill_for(order: &trading_core::ApprovedOrder, price: f64, at: DateTime<Utc>) -> Fill {
        Fill {
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            correlation_id: order.correlation_id,
            purpose: order.purpose,
            filled_at: at,
        }
    }

    fn open_long(h: &mut Harness, symbol: &str, qty: f64, price: f64, plan: Option<ExitPlan>) {
        let now = h.clock.now();
        h.manager.on_tick(&tick(symbol, price, now)).unwrap();
        let intent = OrderIntent::new(symbol, Side::Buy, qty, price, 0.9, OrderPurpose::Entry, now);
        let order = match h.manager.evaluate(intent, plan) {
            RiskVerdict::Approved(order) => order,
            other => panic!("entry rejected: {:?}", other),
        };
        h.manager.apply_fill(&fill_for(&order, price, now)).unwrap();
        h.manager.on_order_terminal(&order.correlation_id);
    }

    #[test]
    fn test_static_stop_triggers_exactly_at_breach() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.02 }));
        open_long(&mut h, "SPY", 10.0, 100.0, None);

        let trigger = h.manager.stops().get("SPY").unwrap().trigger_price.unwrap();
        assert_relative_eq!(trigger, 98.0, epsilon = 1e-9);

        let now = h.clock.now();
        assert!(h.manager.on_tick(&tick("SPY", 100.0, now)).unwrap().is_empty());
        assert!(h.manager.on_tick(&tick("SPY", 99.0, now)).unwrap().is_empty());

        let exits = h.manager.on_tick(&tick("SPY", 97.5, now)).unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].side, Side::Sell);
        assert_eq!(exits[0].quantity, 10.0);
        assert_eq!(exits[0].purpose, OrderPurpose::StopExit);
        assert_eq!(h.sink.count("stop_triggered"), 1);
    }

    #[test]
    fn test_atr_stop_scenario() {
        let mut h = harness(RiskLimits::default(), None);
        let start = h.clock.now();

        // Fourteen bars with a constant true range of 5 around 500
        let mut prev_close = None;
        for i in 0..14 {
            let bar = Bar {
                timestamp: start + chrono::Duration::minutes(i),
                open: 500.0,
                high: 502.5,
                low: 497.5,
                close: 500.0,
                volume: 1_000.0,
            };
            h.manager.on_bar("SPY", &bar, prev_close);
            prev_close = Some(bar.close);
        }
        assert_relative_eq!(h.manager.stops().atr_value("SPY").unwrap(), 5.0);

        let plan = ExitPlan {
            stop: Some(StopConfig::AtrBased { multiplier: 2.5 }),
            take_profit_tiers: vec![],
        };
        open_long(&mut h, "SPY", 10.0, 500.0, Some(plan));
        let trigger = h.manager.stops().get("SPY").unwrap().trigger_price.unwrap();
        assert_relative_eq!(trigger, 487.5);

        let now = h.clock.now();
        assert!(h.manager.on_tick(&tick("SPY", 490.0, now)).unwrap().is_empty());
        let exits = h.manager.on_tick(&tick("SPY", 485.0, now)).unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].side, Side::Sell);
    }

    #[test]
    fn test_trailing_stop_never_loosens() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Trailing { pct: 0.03 }));
        open_long(&mut h, "QQQ", 5.0, 400.0, None);

        let now = h.clock.now();
        let mut last_trigger = 0.0;
        for price in [401.0, 405.0, 405.0, 410.0, 420.0, 431.5] {
            assert!(h.manager.on_tick(&tick("QQQ", price, now)).unwrap().is_empty());
            let trigger = h.manager.stops().get("QQQ").unwrap().trigger_price.unwrap();
            assert!(trigger >= last_trigger, "trigger loosened: {} -> {}", last_trigger, trigger);
            last_trigger = trigger;
        }
        assert_relative_eq!(last_trigger, 431.5 * 0.97, epsilon = 1e-9);

        // A pullback that stays above the trigger keeps it where it is
        assert!(h.manager.on_tick(&tick("QQQ", 425.0, now)).unwrap().is_empty());
        assert_relative_eq!(
            h.manager.stops().get("QQQ").unwrap().trigger_price.unwrap(),
            last_trigger,
            epsilon = 1e-9
        );
        assert_eq!(h.manager.on_tick(&tick("QQQ", 418.0, now)).unwrap().len(), 1);
    }

    #[test]
    fn test_time_stop_ignores_price() {
        let stop = StopConfig::TimeBased {
            max_duration: Duration::from_secs(3600),
        };
        let mut h = harness(RiskLimits::default(), Some(stop));
        open_long(&mut h, "SPY", 1.0, 100.0, None);

        h.clock.advance(chrono::Duration::minutes(59));
        assert!(h.manager.on_tick(&tick("SPY", 150.0, h.clock.now())).unwrap().is_empty());
        h.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(h.manager.on_tick(&tick("SPY", 150.0, h.clock.now())).unwrap().len(), 1);
    }

    #[test]
    fn test_pending_exit_suppresses_duplicates_until_settled() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.02 }));
        open_long(&mut h, "SPY", 10.0, 100.0, None);
        let now = h.clock.now();

        let exits = h.manager.on_tick(&tick("SPY", 97.0, now)).unwrap();
        assert_eq!(exits.len(), 1);
        assert!(h.manager.on_tick(&tick("SPY", 96.0, now)).unwrap().is_empty());

        let exit = exits.into_iter().next().unwrap();
        let id = exit.correlation_id;
        let order = match h.manager.evaluate(exit, None) {
            RiskVerdict::Approved(order) => order,
            other => panic!("exit rejected: {:?}", other),
        };
        // Broker rejected the exit: stop re-arms
        h.manager.on_order_terminal(&id);
        assert_eq!(h.manager.on_tick(&tick("SPY", 96.0, now)).unwrap().len(), 1);
        assert_eq!(order.quantity, 10.0);
    }

    #[test]
    fn test_take_profit_tiers_fire_once() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.05 }));
        let plan = ExitPlan {
            stop: None,
            take_profit_tiers: vec![TakeProfitTier::new(0.02, 0.5), TakeProfitTier::new(0.04, 1.0)],
        };
        open_long(&mut h, "SPY", 10.0, 100.0, Some(plan));
        let now = h.clock.now();

        let exits = h.manager.on_tick(&tick("SPY", 102.5, now)).unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].quantity, 5.0);
        assert_eq!(exits[0].purpose, OrderPurpose::TakeProfit);

        let order = match h.manager.evaluate(exits[0].clone(), None) {
            RiskVerdict::Approved(order) => order,
            other => panic!("take-profit rejected: {:?}", other),
        };
        h.manager.apply_fill(&fill_for(&order, 102.5, now)).unwrap();
        h.manager.on_order_terminal(&order.correlation_id);
        assert_eq!(h.manager.snapshot().position("SPY").unwrap().quantity, 5.0);

        // Tier 0 already fired
        assert!(h.manager.on_tick(&tick("SPY", 103.0, now)).unwrap().is_empty());

        let exits = h.manager.on_tick(&tick("SPY", 104.5, now)).unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].quantity, 5.0);
        assert_eq!(h.sink.count("take_profit_triggered"), 2);
    }

    fn approve(h: &mut Harness, intent: OrderIntent) -> trading_core::ApprovedOrder {
        match h.manager.evaluate(intent, None) {
            RiskVerdict::Approved(order) => order,
            other => panic!("rejected: {:?}", other),
        }
    }

    fn partial_fill(order: &trading_core::ApprovedOrder, qty: f64, price: f64, at: DateTime<Utc>) -> Fill {
        Fill {
            quantity: qty,
            ..fill_for(order, price, at)
        }
    }

    #[test]
    fn test_settled_exit_does_not_release_other_working_exits() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.05 }));
        let plan = ExitPlan {
            stop: None,
            take_profit_tiers: vec![TakeProfitTier::new(0.02, 0.5), TakeProfitTier::new(0.04, 1.0)],
        };
        open_long(&mut h, "SPY", 10.0, 100.0, Some(plan));
        let now = h.clock.now();

        let exits = h.manager.on_tick(&tick("SPY", 104.5, now)).unwrap();
        let quantities: Vec<f64> = exits.iter().map(|e| e.quantity).collect();
        assert_eq!(quantities, vec![5.0, 5.0]);
        let mut exits = exits.into_iter();
        let first = approve(&mut h, exits.next().unwrap());
        let second = approve(&mut h, exits.next().unwrap());

        h.manager.apply_fill(&fill_for(&first, 104.5, now)).unwrap();
        h.manager.on_order_terminal(&first.correlation_id);
        assert_eq!(h.manager.stops().working_exit_qty("SPY", None), 5.0);

        // Stop is crossed but the second tier already covers the rest
        assert!(h.manager.on_tick(&tick("SPY", 94.0, now)).unwrap().is_empty());

        h.manager.apply_fill(&fill_for(&second, 104.0, now)).unwrap();
        h.manager.on_order_terminal(&second.correlation_id);
        assert!(h.manager.snapshot().position("SPY").is_none());
        assert!(!h.manager.stops().exit_pending("SPY"));
    }

    #[test]
    fn test_cancelled_exit_releases_only_its_unfilled_remainder() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.05 }));
        let plan = ExitPlan {
            stop: None,
            take_profit_tiers: vec![TakeProfitTier::new(0.02, 0.5), TakeProfitTier::new(0.04, 1.0)],
        };
        open_long(&mut h, "SPY", 10.0, 100.0, Some(plan));
        let now = h.clock.now();

        let mut exits = h.manager.on_tick(&tick("SPY", 104.5, now)).unwrap().into_iter();
        let first = approve(&mut h, exits.next().unwrap());
        let second = approve(&mut h, exits.next().unwrap());

        // Second tier fills 2 of 5 and is cancelled, first tier still working
        h.manager.apply_fill(&partial_fill(&second, 2.0, 104.5, now)).unwrap();
        h.manager.on_order_terminal(&second.correlation_id);
        assert_eq!(h.manager.snapshot().position("SPY").unwrap().quantity, 8.0);

        let exits = h.manager.on_tick(&tick("SPY", 94.0, now)).unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].purpose, OrderPurpose::StopExit);
        assert_eq!(exits[0].quantity, 3.0);
        let stop = approve(&mut h, exits.into_iter().next().unwrap());

        h.manager.apply_fill(&fill_for(&first, 94.0, now)).unwrap();
        h.manager.apply_fill(&fill_for(&stop, 94.0, now)).unwrap();
        assert!(h.manager.snapshot().position("SPY").is_none());
    }

    #[test]
    fn test_exit_beyond_uncommitted_quantity_is_invalid() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.05 }));
        let plan = ExitPlan {
            stop: None,
            take_profit_tiers: vec![TakeProfitTier::new(0.02, 0.5)],
        };
        open_long(&mut h, "SPY", 10.0, 100.0, Some(plan));
        let now = h.clock.now();

        let exits = h.manager.on_tick(&tick("SPY", 102.5, now)).unwrap();
        approve(&mut h, exits.into_iter().next().unwrap());

        let intent = OrderIntent::new("SPY", Side::Sell, 10.0, 102.5, 1.0, OrderPurpose::StopExit, now);
        let verdict = h.manager.evaluate(intent, None);
        assert_eq!(verdict.rejection().unwrap().kind, RiskCheckType::InvalidOrder);

        let intent = OrderIntent::new("SPY", Side::Sell, 5.0, 102.5, 1.0, OrderPurpose::StopExit, now);
        assert!(h.manager.evaluate(intent, None).is_approved());
    }

    #[test]
    fn test_fractional_position_sizes_tiers_fractionally() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.05 }));
        let plan = ExitPlan {
            stop: None,
            take_profit_tiers: vec![TakeProfitTier::new(0.02, 0.5)],
        };
        open_long(&mut h, "SPY", 0.5, 100.0, Some(plan));
        let now = h.clock.now();

        let exits = h.manager.on_tick(&tick("SPY", 103.0, now)).unwrap();
        assert_eq!(exits.len(), 1);
        assert_relative_eq!(exits[0].quantity, 0.25);
        assert_eq!(exits[0].purpose, OrderPurpose::TakeProfit);
    }

    #[test]
    fn test_stop_supersedes_tiers_on_same_tick() {
        let stop = StopConfig::TimeBased {
            max_duration: Duration::from_secs(3600),
        };
        let mut h = harness(RiskLimits::default(), Some(stop));
        let now = h.clock.now();
        h.manager.on_tick(&tick("SPY", 100.0, now)).unwrap();
        let intent = OrderIntent::new("SPY", Side::Sell, 10.0, 100.0, 0.9, OrderPurpose::Entry, now);
        let plan = ExitPlan {
            stop: None,
            take_profit_tiers: vec![TakeProfitTier::new(0.01, 0.5)],
        };
        let order = match h.manager.evaluate(intent, Some(plan)) {
            RiskVerdict::Approved(order) => order,
            other => panic!("{:?}", other),
        };
        h.manager.apply_fill(&fill_for(&order, 100.0, now)).unwrap();

        // Short is 2% in profit when the hold time runs out
        h.clock.advance(chrono::Duration::hours(1));
        let exits = h.manager.on_tick(&tick("SPY", 98.0, h.clock.now())).unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].side, Side::Buy);
        assert_eq!(exits[0].quantity, 10.0);
        assert_eq!(exits[0].purpose, OrderPurpose::StopExit);
        assert_eq!(h.sink.count("take_profit_triggered"), 0);
    }

    #[test]
    fn test_exposure_limit_rejection_names_check() {
        let limits = RiskLimits {
            max_gross_exposure: 30_000.0,
            ..Default::default()
        };
        let mut h = harness(limits, Some(StopConfig::Static { pct: 0.02 }));
        open_long(&mut h, "SPY", 40.0, 500.0, None);
        open_long(&mut h, "QQQ", 20.0, 400.0, None);

        // 20k + 8k held, 4k more would be 32k
        let now = h.clock.now();
        h.manager.on_tick(&tick("IWM", 200.0, now)).unwrap();
        let intent = OrderIntent::new("IWM", Side::Buy, 20.0, 200.0, 0.9, OrderPurpose::Entry, now);
        let verdict = h.manager.evaluate(intent, None);

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.kind, RiskCheckType::ExposureLimit);
        assert!(rejection.to_string().contains("exposure_limit"));
        assert_eq!(h.sink.count("risk_rejected"), 1);
    }

    #[test]
    fn test_duplicate_correlation_id_is_rejected() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.02 }));
        let now = h.clock.now();
        h.manager.on_tick(&tick("SPY", 100.0, now)).unwrap();

        let intent = OrderIntent::new("SPY", Side::Buy, 1.0, 100.0, 0.9, OrderPurpose::Entry, now);
        let replay = intent.clone();
        assert!(h.manager.evaluate(intent, None).is_approved());

        let verdict = h.manager.evaluate(replay, None);
        assert_eq!(verdict.rejection().unwrap().kind, RiskCheckType::DuplicateIntent);
    }

    #[test]
    fn test_rejected_intent_cannot_be_reapproved() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.02 }));
        let now = h.clock.now();
        // No last price yet
        let intent = OrderIntent::new("SPY", Side::Buy, 1.0, 100.0, 0.9, OrderPurpose::Entry, now);
        let replay = intent.clone();
        assert_eq!(
            h.manager.evaluate(intent, None).rejection().unwrap().kind,
            RiskCheckType::PriceDeviation
        );

        h.manager.on_tick(&tick("SPY", 100.0, now)).unwrap();
        assert_eq!(
            h.manager.evaluate(replay, None).rejection().unwrap().kind,
            RiskCheckType::DuplicateIntent
        );
    }

    #[test]
    fn test_open_breaker_blocks_approval() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sink = Arc::new(RecordingSink::new());
        let breaker = CircuitBreaker::new(
            "broker",
            BreakerConfig {
                failure_threshold: 1,
                open_duration: Duration::from_secs(30),
            },
            clock.clone(),
            sink.clone(),
        );
        let mut manager = RiskManager::new(
            RiskLimits::default(),
            StopDefaults::default(),
            100_000.0,
            clock.clone(),
            sink.clone(),
        )
        .with_breaker(breaker.clone());

        let now = clock.now();
        manager.on_tick(&tick("SPY", 100.0, now)).unwrap();

        let permit = breaker.admit().unwrap();
        breaker.check_and_record(permit, CallOutcome::Failure);

        let intent = OrderIntent::new("SPY", Side::Buy, 1.0, 100.0, 0.9, OrderPurpose::Entry, now);
        let verdict = manager.evaluate(intent, None);
        assert_eq!(verdict.rejection().unwrap().kind, RiskCheckType::CircuitBreaker);

        clock.advance(chrono::Duration::seconds(31));
        let intent = OrderIntent::new("SPY", Side::Buy, 1.0, 100.0, 0.9, OrderPurpose::Entry, now);
        assert!(manager.evaluate(intent, None).is_approved());
    }

    #[test]
    fn test_exit_without_position_is_invalid() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.02 }));
        let now = h.clock.now();
        h.manager.on_tick(&tick("SPY", 100.0, now)).unwrap();
        let intent = OrderIntent::new("SPY", Side::Sell, 5.0, 100.0, 1.0, OrderPurpose::StopExit, now);
        assert_eq!(
            h.manager.evaluate(intent, None).rejection().unwrap().kind,
            RiskCheckType::InvalidOrder
        );
    }

    #[test]
    fn test_missing_stop_configuration_is_surfaced() {
        let mut h = harness(RiskLimits::default(), None);
        let now = h.clock.now();
        h.manager.on_tick(&tick("SPY", 100.0, now)).unwrap();
        let intent = OrderIntent::new("SPY", Side::Buy, 1.0, 100.0, 0.9, OrderPurpose::Entry, now);
        let order = match h.manager.evaluate(intent, None) {
            RiskVerdict::Approved(order) => order,
            other => panic!("{:?}", other),
        };
        assert_ok!(h.manager.apply_fill(&fill_for(&order, 100.0, now)));

        let err = assert_err!(h.manager.on_tick(&tick("SPY", 99.0, now)));
        assert_eq!(
            err,
            StopError::MissingConfiguration {
                symbol: "SPY".to_string()
            }
        );
    }

    #[test]
    fn test_fills_publish_snapshots() {
        let mut h = harness(RiskLimits::default(), Some(StopConfig::Static { pct: 0.02 }));
        let rx = h.manager.subscribe();
        open_long(&mut h, "SPY", 10.0, 100.0, None);

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.position("SPY").unwrap().quantity, 10.0);
        assert_eq!(h.sink.count("position_snapshot"), 1);
    }
}
