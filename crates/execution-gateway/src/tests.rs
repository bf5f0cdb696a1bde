#[cfg(test)]
mod gateway_tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use broker_trait::{BrokerClient, BrokerError, BrokerOrderStatus, OrderAck, OrderReport};
    use chrono::Utc;
    use risk_manager::{BreakerConfig, CircuitBreaker};
    use tokio::sync::mpsc;
    use trading_core::{
        shutdown_channel, ApprovedOrder, Clock, ManualClock, OrderIntent, OrderPurpose,
        RecordingSink, Side,
    };

    use crate::*;

    struct Harness {
        gateway: ExecutionGateway,
        events: mpsc::UnboundedReceiver<GatewayEvent>,
        clock: Arc<ManualClock>,
        sleeper: Arc<RecordingSleeper>,
        sink: Arc<RecordingSink>,
        feed: FeedHealth,
        limiter: Arc<AdaptiveRateLimiter>,
    }

    impl Harness {
        /// Mark the feed fresh as of now.
        fn tick(&self) {
            self.feed.record_tick(self.clock.now());
        }

        fn drain(&mut self) -> Vec<GatewayEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn build(broker: Arc<dyn BrokerClient>, failure_threshold: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sleeper = Arc::new(RecordingSleeper::with_clock(clock.clone()));
        let sink = Arc::new(RecordingSink::new());
        let feed = FeedHealth::new(Duration::from_secs(15));
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            RateLimitConfig::default(),
            clock.clone(),
            sleeper.clone(),
        ));
        let breaker = CircuitBreaker::new(
            "broker",
            BreakerConfig {
                failure_threshold,
                open_duration: Duration::from_secs(30),
            },
            clock.clone(),
            sink.clone(),
        );
        let ctx = GatewayContext {
            limiter: limiter.clone(),
            breaker,
            feed: feed.clone(),
            clock: clock.clone(),
            sleeper: sleeper.clone(),
            events: sink.clone(),
        };
        let config = GatewayConfig {
            retry: RetryPolicy::order_submission().without_jitter(),
            ..Default::default()
        };
        let (gateway, events) = ExecutionGateway::new(broker, config, ctx);
        let h = Harness {
            gateway,
            events,
            clock,
            sleeper,
            sink,
            feed,
            limiter,
        };
        h.tick();
        h
    }

    fn paper(mode: PaperFillMode) -> (Arc<PaperBroker>, Harness) {
        let broker = Arc::new(PaperBroker::with_fill_mode(mode));
        let h = build(broker.clone(), 5);
        (broker, h)
    }

    fn order(qty: f64) -> ApprovedOrder {
        let now = Utc::now();
        let intent = OrderIntent::new("AAPL", Side::Buy, qty, 190.0, 0.8, OrderPurpose::Entry, now);
        ApprovedOrder::approve(intent, now)
    }

    fn fills(events: &[GatewayEvent]) -> Vec<FillEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::Fill(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn immediate_fill_reports_once() {
        let (broker, mut h) = paper(PaperFillMode::Immediate);

        let report = h.gateway.execute(order(10.0)).await;
        assert!(report.is_filled());
        assert_eq!(report.attempts, 1);
        assert!(!report.replayed);
        assert_eq!(broker.submit_calls(), 1);

        let events = h.drain();
        let fills = fills(&events);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].fill.quantity, 10.0);
        assert_relative_eq!(fills[0].fill.price, 190.0);
        assert!(matches!(events.last(), Some(GatewayEvent::Report(_))));

        assert_eq!(h.sink.count("order_submitted"), 1);
        assert_eq!(h.sink.count("order_filled"), 1);
        assert_eq!(h.sink.count("order_terminal"), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_backoff() {
        let (broker, mut h) = paper(PaperFillMode::Immediate);
        broker.script(SubmitScript::Fail(BrokerError::Server {
            status: 503,
            message: "unavailable".into(),
        }));

        let report = h.gateway.execute(order(5.0)).await;
        assert!(report.is_filled());
        assert_eq!(report.attempts, 2);
        assert_eq!(broker.submit_calls(), 2);
        assert_eq!(h.sleeper.slept()[0], millis(100));
    }

    #[tokio::test]
    async fn terminal_rejection_is_not_retried() {
        let (broker, mut h) = paper(PaperFillMode::Immediate);
        broker.script(SubmitScript::Fail(BrokerError::InsufficientBuyingPower(
            "insufficient buying power".into(),
        )));

        let report = h.gateway.execute(order(5.0)).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(broker.submit_calls(), 1);
        assert!(matches!(
            report.state.reject_reason(),
            Some(RejectReason::Broker(BrokerError::InsufficientBuyingPower(_)))
        ));
        assert!(h.sleeper.slept().is_empty());
        assert!(fills(&h.drain()).is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_open_the_breaker() {
        let broker = Arc::new(PaperBroker::new());
        let mut h = build(broker.clone(), 3);
        for _ in 0..3 {
            broker.script(SubmitScript::Fail(BrokerError::Server {
                status: 502,
                message: "bad gateway".into(),
            }));
        }

        let report = h.gateway.execute(order(5.0)).await;
        match report.state.reject_reason() {
            Some(RejectReason::RetriesExhausted { attempts, last }) => {
                assert_eq!(*attempts, 3);
                assert!(matches!(last, BrokerError::Server { status: 502, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.sleeper.slept(), vec![millis(100), millis(200)]);

        let second = h.gateway.execute(order(5.0)).await;
        assert!(matches!(
            second.state.reject_reason(),
            Some(RejectReason::CircuitOpen(_))
        ));
        assert_eq!(second.attempts, 0);
        assert_eq!(broker.submit_calls(), 3);
        assert_eq!(h.sink.count("breaker_transition"), 1);
    }

    #[tokio::test]
    async fn stale_feed_halts_submission() {
        let (broker, mut h) = paper(PaperFillMode::Immediate);
        h.clock.advance(chrono::Duration::seconds(16));

        let report = h.gateway.execute(order(5.0)).await;
        assert_eq!(report.state.reject_reason(), Some(&RejectReason::MarketDataStale));
        assert_eq!(report.attempts, 0);
        assert_eq!(broker.submit_calls(), 0);

        h.tick();
        assert!(h.gateway.execute(order(5.0)).await.is_filled());
    }

    #[tokio::test]
    async fn repeated_correlation_id_replays_outcome() {
        let (broker, mut h) = paper(PaperFillMode::Immediate);
        let o = order(5.0);

        let first = h.gateway.execute(o.clone()).await;
        let second = h.gateway.execute(o).await;

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.state, first.state);
        assert_eq!(broker.submit_calls(), 1);
        assert_eq!(h.gateway.ledger().len(), 1);
        assert_eq!(fills(&h.drain()).len(), 1);
    }

    #[tokio::test]
    async fn partial_fill_is_cancelled_after_polling_window() {
        let (broker, mut h) = paper(PaperFillMode::Partial { fraction: 0.4 });

        let report = h.gateway.execute(order(10.0)).await;
        match &report.state {
            OrderState::Cancelled {
                broker_order_id,
                filled_qty,
                reason,
            } => {
                assert_eq!(*filled_qty, 4.0);
                assert_eq!(*reason, RejectReason::NotFilled);
                let id = broker_order_id.as_deref().unwrap();
                assert_eq!(broker.order(id).unwrap().status, BrokerOrderStatus::Canceled);
            }
            other => panic!("unexpected {:?}", other),
        }

        let fills = fills(&h.drain());
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].fill.quantity, 4.0);
        assert_eq!(
            h.sleeper.slept(),
            vec![millis(250), millis(500), millis(1000), millis(2000), millis(4000)]
        );
    }

    #[tokio::test]
    async fn fill_arrives_on_later_poll() {
        let (_broker, mut h) = paper(PaperFillMode::AfterPolls(3));

        let report = h.gateway.execute(order(10.0)).await;
        assert!(report.is_filled());
        assert_eq!(h.sleeper.slept(), vec![millis(250), millis(500), millis(1000)]);
        assert_eq!(fills(&h.drain()).len(), 1);
    }

    #[tokio::test]
    async fn unfilled_order_is_cancelled() {
        let (broker, mut h) = paper(PaperFillMode::Never);

        let report = h.gateway.execute(order(10.0)).await;
        assert_eq!(report.state.reject_reason(), Some(&RejectReason::NotFilled));
        assert_eq!(report.filled_qty(), 0.0);
        let id = report.state.broker_order_id().unwrap();
        assert_eq!(broker.order(id).unwrap().status, BrokerOrderStatus::Canceled);
    }

    #[tokio::test]
    async fn timeout_checks_broker_before_resubmitting() {
        let (broker, mut h) = paper(PaperFillMode::Immediate);
        broker.script(SubmitScript::AcceptThenTimeout);

        let report = h.gateway.execute(order(5.0)).await;
        assert!(report.is_filled());
        assert_eq!(broker.submit_calls(), 1);
        assert_eq!(report.attempts, 1);
    }

    /// Paper broker whose client-id lookup fails, then misses, before answering.
    struct UnreliableLookup {
        inner: Arc<PaperBroker>,
        failures: AtomicU32,
        misses: AtomicU32,
    }

    impl UnreliableLookup {
        fn new(inner: Arc<PaperBroker>, failures: u32, misses: u32) -> Self {
            Self {
                inner,
                failures: AtomicU32::new(failures),
                misses: AtomicU32::new(misses),
            }
        }

        fn take(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl BrokerClient for UnreliableLookup {
        async fn submit_order(&self, order: &ApprovedOrder) -> Result<OrderAck, BrokerError> {
            self.inner.submit_order(order).await
        }

        async fn get_order(&self, broker_order_id: &str) -> Result<OrderReport, BrokerError> {
            self.inner.get_order(broker_order_id).await
        }

        async fn find_order(
            &self,
            client_order_id: &trading_core::CorrelationId,
        ) -> Result<Option<OrderReport>, BrokerError> {
            if Self::take(&self.failures) {
                return Err(BrokerError::Network("connection reset".into()));
            }
            if Self::take(&self.misses) {
                return Ok(None);
            }
            self.inner.find_order(client_order_id).await
        }

        async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
            self.inner.cancel_order(broker_order_id).await
        }

        fn is_paper(&self) -> bool {
            true
        }

        fn broker_name(&self) -> &str {
            "unreliable-lookup"
        }
    }

    #[tokio::test]
    async fn failed_lookup_after_timeout_is_retried_not_resubmitted() {
        let paper = Arc::new(PaperBroker::with_fill_mode(PaperFillMode::Immediate));
        paper.script(SubmitScript::AcceptThenTimeout);
        let mut h = build(Arc::new(UnreliableLookup::new(paper.clone(), 1, 0)), 5);

        let report = h.gateway.execute(order(5.0)).await;
        assert!(report.is_filled(), "state {:?}", report.state);
        assert_eq!(report.attempts, 1);
        assert_eq!(paper.submit_calls(), 1);
        assert_eq!(h.sleeper.slept(), vec![millis(100), millis(100), millis(250)]);

        let fills = fills(&h.drain());
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].fill.quantity, 5.0);
    }

    #[tokio::test]
    async fn duplicate_id_rejection_after_timeout_resolves_to_landed_order() {
        let paper = Arc::new(PaperBroker::with_fill_mode(PaperFillMode::Immediate));
        paper.script(SubmitScript::AcceptThenTimeout);
        // The first lookup lags behind the broker and misses the order
        let mut h = build(Arc::new(UnreliableLookup::new(paper.clone(), 0, 1)), 5);

        let report = h.gateway.execute(order(5.0)).await;
        assert!(report.is_filled(), "state {:?}", report.state);
        assert_eq!(report.attempts, 2);
        assert_eq!(paper.submit_calls(), 2);
        assert_eq!(fills(&h.drain()).len(), 1);
    }

    #[tokio::test]
    async fn unresolved_lookup_gives_up_without_resubmitting() {
        let paper = Arc::new(PaperBroker::with_fill_mode(PaperFillMode::Immediate));
        paper.script(SubmitScript::AcceptThenTimeout);
        let mut h = build(Arc::new(UnreliableLookup::new(paper.clone(), 10, 0)), 50);

        let report = h.gateway.execute(order(5.0)).await;
        assert_eq!(paper.submit_calls(), 1);
        assert!(matches!(
            report.state,
            OrderState::Rejected {
                reason: RejectReason::RetriesExhausted {
                    last: BrokerError::Network(_),
                    ..
                }
            }
        ));
    }

    #[tokio::test]
    async fn throttling_cuts_rate_and_honours_retry_after() {
        let (broker, mut h) = paper(PaperFillMode::Immediate);
        broker.script(SubmitScript::Fail(BrokerError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        }));

        let report = h.gateway.execute(order(5.0)).await;
        assert!(report.is_filled());
        assert_eq!(report.attempts, 2);
        assert!(h.limiter.current_limit() < 180.0);
        assert!(h.sleeper.slept().contains(&Duration::from_secs(1)));
        // Throttling says nothing about broker health
        assert_eq!(h.sink.count("breaker_transition"), 0);
    }

    #[tokio::test]
    async fn cancelled_before_execution_never_reaches_broker() {
        let (broker, mut h) = paper(PaperFillMode::Immediate);
        let handle = h.gateway.handle();
        let o = order(5.0);

        handle.submit(o.clone()).await.unwrap();
        assert!(handle.cancel(&o.correlation_id));
        assert_eq!(handle.outstanding(), 1);

        let report = h.gateway.execute(o).await;
        match report.state {
            OrderState::Cancelled {
                broker_order_id,
                reason,
                ..
            } => {
                assert!(broker_order_id.is_none());
                assert_eq!(reason, RejectReason::CancelledByCaller);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(broker.submit_calls(), 0);
        assert_eq!(handle.outstanding(), 0);
    }

    #[tokio::test]
    async fn cancel_of_unknown_order_is_refused() {
        let (_broker, h) = paper(PaperFillMode::Immediate);
        assert!(!h.gateway.handle().cancel(&order(1.0).correlation_id));
    }

    /// Replays a fixed sequence of status reports.
    struct StagedBroker {
        reports: Mutex<VecDeque<(BrokerOrderStatus, f64, f64)>>,
        client_id: Mutex<Option<trading_core::CorrelationId>>,
    }

    #[async_trait]
    impl BrokerClient for StagedBroker {
        async fn submit_order(&self, order: &ApprovedOrder) -> Result<OrderAck, BrokerError> {
            *self.client_id.lock().unwrap() = Some(order.correlation_id);
            Ok(OrderAck {
                broker_order_id: "staged-1".into(),
                client_order_id: order.correlation_id,
                status: BrokerOrderStatus::Accepted,
                submitted_at: Utc::now(),
            })
        }

        async fn get_order(&self, broker_order_id: &str) -> Result<OrderReport, BrokerError> {
            let (status, filled_qty, avg) = self
                .reports
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((BrokerOrderStatus::Canceled, 0.0, 0.0));
            Ok(OrderReport {
                broker_order_id: broker_order_id.to_string(),
                client_order_id: self.client_id.lock().unwrap().unwrap(),
                symbol: "AAPL".into(),
                side: Side::Buy,
                quantity: 10.0,
                status,
                filled_qty,
                filled_avg_price: (filled_qty > 0.0).then_some(avg),
                updated_at: Utc::now(),
                reject_reason: None,
            })
        }

        async fn cancel_order(&self, _broker_order_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        fn is_paper(&self) -> bool {
            true
        }

        fn broker_name(&self) -> &str {
            "staged"
        }
    }

    #[tokio::test]
    async fn incremental_fills_are_priced_from_cumulative_average() {
        let broker = Arc::new(StagedBroker {
            reports: Mutex::new(VecDeque::from(vec![
                (BrokerOrderStatus::PartiallyFilled, 4.0, 100.0),
                (BrokerOrderStatus::Filled, 10.0, 101.2),
            ])),
            client_id: Mutex::new(None),
        });
        let mut h = build(broker, 5);

        let report = h.gateway.execute(order(10.0)).await;
        assert!(report.is_filled());
        assert_relative_eq!(report.state.avg_price().unwrap(), 101.2);

        let fills = fills(&h.drain());
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].fill.quantity, 4.0);
        assert_relative_eq!(fills[0].fill.price, 100.0);
        assert_eq!(fills[1].fill.quantity, 6.0);
        assert_relative_eq!(fills[1].fill.price, 102.0, epsilon = 1e-9);
        assert_eq!(fills[1].cumulative_qty, 10.0);
    }

    #[tokio::test]
    async fn spawned_worker_executes_queued_orders() {
        let (broker, h) = paper(PaperFillMode::Immediate);
        let Harness {
            gateway, mut events, ..
        } = h;
        let handle = gateway.handle();
        let (trigger, shutdown) = shutdown_channel();
        let worker = gateway.spawn(shutdown);

        let o = order(3.0);
        handle.submit(o.clone()).await.unwrap();

        let report = loop {
            match events.recv().await {
                Some(GatewayEvent::Report(r)) => break r,
                Some(_) => continue,
                None => panic!("gateway closed"),
            }
        };
        assert_eq!(report.correlation_id, o.correlation_id);
        assert!(report.is_filled());
        assert_eq!(broker.submit_calls(), 1);

        trigger.trigger();
        worker.await.unwrap();
        assert_eq!(handle.submit(order(1.0)).await, Err(GatewayError::Closed));
    }

    #[test]
    fn config_rejects_unbounded_submission_retries() {
        let config = GatewayConfig {
            retry: RetryPolicy::market_data(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(GatewayConfig::default().validate().is_ok());
    }
}
