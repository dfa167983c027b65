//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 参考配置加载测试
//! - 协议与时钟同步场景测试
//! - 主从节点经模拟链路的 e2e 测试

#[cfg(test)]
mod config_tests {
    use config_loader::{ConfigFormat, ConfigLoader};

    const REFERENCE_CONFIG: &str = include_str!("../../../config/haptic.toml");

    #[test]
    fn test_reference_config_loads() {
        let config = ConfigLoader::load_from_str(REFERENCE_CONFIG, ConfigFormat::Toml).unwrap();
        assert!(config.latency.enabled);
        assert_eq!(config.keepalive.timeout_us(), 6_000_000);
        assert_eq!(config.macrocycle.max_events, 12);
        assert!(ConfigLoader::warnings(&config).is_empty());
    }

    #[test]
    fn test_reference_config_matches_defaults_elsewhere() {
        let config = ConfigLoader::load_from_str(REFERENCE_CONFIG, ConfigFormat::Toml).unwrap();
        let defaults = contracts::NodeConfig::default();
        assert_eq!(config.clock_sync, defaults.clock_sync);
        assert_eq!(config.schedule, defaults.schedule);
        assert_eq!(config.channel, defaults.channel);
        assert_eq!(config.simulation, defaults.simulation);
    }
}

#[cfg(test)]
mod scenario_tests {
    use contracts::{ClockSyncConfig, Confidence};
    use sync_engine::{ClockSyncEstimator, Message, RoundTrip, SampleVerdict};

    /// Round trips of 15 ms then 40 ms: the second is an outlier
    #[test]
    fn test_slow_round_trip_rejected() {
        let mut estimator = ClockSyncEstimator::new(ClockSyncConfig::default());

        // peer clock 2 ms ahead, 7.5 ms each way
        let first = estimator.record_round_trip(1_000, 10_500, 10_500, 16_000);
        assert_eq!(
            first,
            SampleVerdict::Accepted {
                offset_us: 2_000,
                delay_us: 7_500
            }
        );

        let second = estimator.record_round_trip(100_000, 129_000, 129_000, 140_000);
        assert_eq!(
            second,
            SampleVerdict::Outlier {
                delay_us: 20_000,
                min_delay_us: 7_500
            }
        );

        let offset = estimator.current_offset();
        assert_eq!(offset.value_us, 2_000);
        assert_eq!(offset.sample_count, 1);
        assert_eq!(offset.confidence, Confidence::Low);
        assert_eq!(estimator.stats().outliers, 1);
    }

    /// `PING:7|1000` answered by the completed `PONG:7|1000|1010|1025`
    #[test]
    fn test_keepalive_timestamps_from_wire() {
        let ping = Message::parse_frame(b"PING:7|1000").unwrap();
        let pong = Message::parse_frame(b"PONG:7|1000|1010|1025").unwrap();

        let (Message::Ping { seq, t1 }, Message::Pong { seq: pong_seq, t2, t3, t4: Some(t4) }) =
            (ping, pong)
        else {
            panic!("unexpected messages");
        };
        assert_eq!(seq, pong_seq);

        let sample = RoundTrip::new(t1, t2, t3, t4);
        assert_eq!(sample.rtt_us(), (1025 - 1000) - (1010 - 1000));
        assert_eq!(sample.offset_us(), -7);

        let mut estimator = ClockSyncEstimator::new(ClockSyncConfig::default());
        assert!(estimator.record(sample).is_accepted());
        assert!(estimator.record(sample).is_accepted());
        assert_eq!(estimator.current_offset().value_us, -7);
        assert_eq!(estimator.to_local_time(50_000), 49_993);
    }

    #[test]
    fn test_follower_reply_round_trips_through_encoding() {
        let reply = Message::Pong {
            seq: 7,
            t2: 1_000,
            t3: 1_010,
            t4: None,
        };
        let encoded = reply.encode();
        assert_eq!(&encoded[..], b"PONG:7|1000|1010\x04");
        let parsed = Message::parse_frame(&encoded[..encoded.len() - 1]).unwrap();
        assert_eq!(parsed, reply);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use contracts::{Burst, ConnectionHealth, KeepaliveConfig, LinkConfig, MonotonicClock, NodeConfig};
    use link::{link_pair, SimulatedLink};
    use observability::AlignmentAggregator;
    use sync_engine::mock::{HapticCall, HapticLog, RecordingHaptic};
    use sync_engine::{FollowerCoordinator, LeaderCoordinator};

    const SKEW_US: u64 = 250_000;

    /// Upper bound for anything awaited outside the tick loops
    const GUARD: Duration = Duration::from_secs(5);

    /// Leader and follower joined by a simulated link, both clocks sharing one origin
    struct Session {
        leader: LeaderCoordinator<MonotonicClock>,
        follower: FollowerCoordinator<MonotonicClock>,
        leader_log: HapticLog,
        follower_log: HapticLog,
        to_follower: SimulatedLink,
        to_leader: SimulatedLink,
    }

    impl Session {
        fn new(config: &NodeConfig) -> Self {
            let origin = Instant::now();
            let (mut to_follower, mut to_leader) = link_pair(&config.link).unwrap();

            let leader_haptic = RecordingHaptic::new(config.macrocycle.max_fingers);
            let leader_log = leader_haptic.log();
            let follower_haptic = RecordingHaptic::new(config.macrocycle.max_fingers);
            let follower_log = follower_haptic.log();

            let (leader, leader_arrival) = LeaderCoordinator::new(
                config,
                MonotonicClock::with_origin(origin, 0),
                Arc::new(to_follower.transport()),
                leader_haptic,
            );
            let (follower, follower_arrival) = FollowerCoordinator::new(
                config,
                MonotonicClock::with_origin(origin, SKEW_US),
                Arc::new(to_leader.transport()),
                follower_haptic,
            );
            to_leader.attach(leader_arrival).unwrap();
            to_follower.attach(follower_arrival).unwrap();

            Self {
                leader,
                follower,
                leader_log,
                follower_log,
                to_follower,
                to_leader,
            }
        }

        /// Tick both main loops every millisecond for `span`
        async fn run_for(&mut self, span: Duration) {
            let deadline = tokio::time::Instant::now() + span;
            while tokio::time::Instant::now() < deadline {
                self.leader.tick().await;
                self.follower.tick().await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        async fn warm_up(&mut self, pings: u32) {
            for _ in 0..pings {
                self.leader.send_keepalive();
                self.run_for(Duration::from_millis(30)).await;
            }
        }

        async fn shutdown(self) {
            let all = async {
                self.leader.shutdown().await;
                self.follower.shutdown().await;
                self.to_follower.shutdown().await;
                self.to_leader.shutdown().await;
            };
            tokio::time::timeout(GUARD, all)
                .await
                .expect("session shutdown hung");
        }
    }

    fn quiet_link_config() -> NodeConfig {
        NodeConfig {
            link: LinkConfig {
                latency_us: 2_000,
                jitter_us: 0,
                loss_rate: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn activations(log: &HapticLog) -> BTreeMap<u8, Vec<Instant>> {
        let mut by_finger: BTreeMap<u8, Vec<Instant>> = BTreeMap::new();
        for (at, call) in log.records() {
            if let HapticCall::Activate { finger, .. } = call {
                by_finger.entry(finger).or_default().push(at);
            }
        }
        by_finger
    }

    /// Warm-up gives both sides an offset close to the true skew
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_e2e_keepalives_establish_offset() {
        let mut session = Session::new(&quiet_link_config());
        session.warm_up(4).await;

        let follower_offset = session.follower.estimator().current_offset();
        let leader_offset = session.leader.estimator().current_offset();

        assert!(follower_offset.sample_count >= 2);
        assert!(
            (follower_offset.value_us - SKEW_US as i64).abs() < 2_000,
            "offset {follower_offset:?}"
        );
        assert!((leader_offset.value_us - SKEW_US as i64).abs() < 2_000);
        assert!(session.leader.stats().round_trips_accepted >= 2);
        session.shutdown().await;
    }

    /// One macrocycle fires on both gloves within the alignment bound
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_e2e_macrocycle_fires_on_both_sides() {
        let config = quiet_link_config();
        let mut session = Session::new(&config);
        session.warm_up(4).await;

        let mut handle = session.leader.begin_macrocycle();
        for finger in 0..3u8 {
            let burst = Burst {
                finger,
                amplitude: 70,
                frequency_hz: 250,
                duration_ms: 20,
                delta_ms: u32::from(finger) * 30,
            };
            session.leader.add_burst(&mut handle, &burst).unwrap();
        }
        session.leader.commit_and_send(handle).unwrap();
        session.run_for(Duration::from_millis(300)).await;

        assert_eq!(session.leader.stats().macrocycles_acked, 1);
        assert_eq!(session.follower.stats().macrocycles_scheduled, 1);

        let leader = activations(&session.leader_log);
        let follower = activations(&session.follower_log);
        assert_eq!(leader.len(), 3);
        assert_eq!(follower.len(), 3);

        let mut aggregator = AlignmentAggregator::new(config.latency.alignment_bound_us);
        for (finger, leader_at) in &leader {
            let follower_at = &follower[finger];
            assert_eq!(leader_at.len(), 1);
            assert_eq!(follower_at.len(), 1);
            let error_us = match follower_at[0].checked_duration_since(leader_at[0]) {
                Some(late) => late.as_micros() as i64,
                None => -(leader_at[0].duration_since(follower_at[0]).as_micros() as i64),
            };
            aggregator.push(error_us);
        }
        let summary = aggregator.summary();
        assert_eq!(summary.pairs, 3);
        assert!(summary.is_within_bound(), "{summary}");
        session.shutdown().await;
    }

    /// STOP reaches the follower and both sides turn everything off
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_e2e_stop_session() {
        let mut session = Session::new(&quiet_link_config());
        session.warm_up(2).await;

        session.leader.stop_session().await.unwrap();
        session.run_for(Duration::from_millis(50)).await;

        assert!(session.follower.is_stopped());
        assert_eq!(session.leader_log.all_off_count(), 1);
        assert_eq!(session.follower_log.all_off_count(), 1);
        session.shutdown().await;
    }

    /// A double test pulse buzzes the same finger twice on both gloves
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_e2e_test_pulse() {
        let mut session = Session::new(&quiet_link_config());
        session.warm_up(2).await;

        session.leader.send_test_pulse(1, 60, 15, 2).unwrap();
        session.run_for(Duration::from_millis(200)).await;

        for log in [&session.leader_log, &session.follower_log] {
            let pulses = log
                .calls()
                .into_iter()
                .filter(|c| matches!(c, HapticCall::Activate { finger: 1, amplitude: 60 }))
                .count();
            assert_eq!(pulses, 2);
        }
        assert_eq!(session.leader.stats().test_pulses, 1);
        session.shutdown().await;
    }

    /// A silent leader drives the follower to `Lost`; the actuators are off
    /// before any observer sees it
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_e2e_silent_leader_means_lost() {
        let config = NodeConfig {
            keepalive: KeepaliveConfig {
                interval_ms: 50,
                timeout_multiple: 6,
            },
            ..quiet_link_config()
        };
        let mut session = Session::new(&config);
        session.warm_up(1).await;

        let mut watch = session.follower.health_watch();
        let follower_log = session.follower_log.clone();
        let observer = tokio::spawn(async move {
            loop {
                watch.changed().await.unwrap();
                if *watch.borrow_and_update() == ConnectionHealth::Lost {
                    return follower_log.all_off_count();
                }
            }
        });

        // only the follower keeps running
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while tokio::time::Instant::now() < deadline {
            session.follower.tick().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(session.follower.health(), ConnectionHealth::Lost);
        let all_off_when_observed = tokio::time::timeout(GUARD, observer)
            .await
            .expect("Lost never published")
            .unwrap();
        assert_eq!(all_off_when_observed, 1);
        assert_eq!(session.follower_log.all_off_count(), 1);

        // the leader resumes: it heard nothing either, so it halts the
        // session and tells the follower, while the link itself recovers
        session.warm_up(1).await;
        assert_eq!(session.follower.health(), ConnectionHealth::Connected);
        assert!(session.leader.is_stopped());
        assert_eq!(session.leader_log.all_off_count(), 1);
        assert!(session.follower.is_stopped());

        let handle = session.leader.begin_macrocycle();
        assert!(session.leader.commit_and_send(handle).is_err());
        session.shutdown().await;
    }

    /// With a lossy link some macrocycles never arrive, nothing else breaks
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_e2e_lossy_link_counts_losses() {
        let config = NodeConfig {
            link: LinkConfig {
                latency_us: 2_000,
                jitter_us: 1_000,
                loss_rate: 0.3,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut session = Session::new(&config);
        session.warm_up(6).await;

        for cycle in 0..10u32 {
            let mut handle = session.leader.begin_macrocycle();
            let burst = Burst {
                finger: (cycle % 4) as u8,
                amplitude: 50,
                frequency_hz: 250,
                duration_ms: 10,
                delta_ms: 0,
            };
            session.leader.add_burst(&mut handle, &burst).unwrap();
            session.leader.commit_and_send(handle).unwrap();
            // longer than the largest lead time, so no batch replaces an unfired one
            session.run_for(Duration::from_millis(150)).await;
        }

        let sent = session.to_follower.metrics().sent();
        let delivered = session.to_follower.metrics().delivered();
        let lost = session.to_follower.metrics().lost();
        // at most one keepalive may still be in flight
        assert!(delivered + lost <= sent);
        assert!(sent - delivered - lost <= 1);

        let scheduled = session.follower.stats().macrocycles_scheduled;
        assert_eq!(session.leader.stats().macrocycles_sent, 10);
        assert!(scheduled <= 10);
        assert!(session.leader.stats().macrocycles_acked <= scheduled);
        assert_eq!(session.follower_log.activations() as u64, scheduled);
        session.shutdown().await;
    }
}
