//! End-to-end flow scenarios driven through the engine, the scheduler and the
//! event ingestor with a recording mailer.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use campaign_core::config::FlowConfig;
    use campaign_core::event_bus::capture_sink;
    use campaign_core::types::{ActivityType, BounceKind, EngagementEvent, EngagementType, Lead};
    use campaign_flow::types::{
        ConditionConfig, CursorKey, CursorState, DelayConfig, Edge, EmailConfig, FlowDocument,
        GoalConfig, MatchMode, Node, NodeKind, TimeUnit, WaitDuration, WatchedSignals,
    };
    use campaign_flow::{
        FlowEngine, Journal, Mailer, Scheduler, SendError, SignalKind, TemplateLibrary,
        TrackingSignal,
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use parking_lot::Mutex;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, 9, 0, 0).unwrap()
    }

    /// Mailer double that records every accepted send.
    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingMailer {
        fn subjects_for(&self, lead_id: &str) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter(|(lead, _)| lead == lead_id)
                .map(|(_, subject)| subject.clone())
                .collect()
        }

        fn total(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, lead: &Lead, subject: &str, _body: &str) -> Result<String, SendError> {
            let mut sent = self.sent.lock();
            sent.push((lead.id.clone(), subject.to_string()));
            Ok(format!("msg-{}", sent.len()))
        }
    }

    /// Mailer double whose provider is always down.
    struct DownMailer;

    #[async_trait]
    impl Mailer for DownMailer {
        async fn send(&self, _lead: &Lead, _subject: &str, _body: &str) -> Result<String, SendError> {
            Err(SendError::Transient("503 from provider".into()))
        }
    }

    fn templates() -> Arc<TemplateLibrary> {
        let library = TemplateLibrary::new();
        library.register("welcome", "Welcome {{first_name}}", "Glad you're here.");
        library.register("followup", "Following up", "Did you see our last note?");
        Arc::new(library)
    }

    fn email(id: &str, template: &str) -> Node {
        Node::new(
            id,
            NodeKind::Email(EmailConfig {
                template_ref: Some(template.to_string()),
                ..Default::default()
            }),
        )
    }

    fn condition(id: &str, watch: WatchedSignals, mode: MatchMode, days: u32) -> Node {
        Node::new(
            id,
            NodeKind::Condition(ConditionConfig {
                watch,
                match_mode: mode,
                wait: WaitDuration::days(days),
            }),
        )
    }

    fn opened() -> WatchedSignals {
        WatchedSignals {
            opened: true,
            ..Default::default()
        }
    }

    fn goal(id: &str) -> Node {
        Node::new(id, NodeKind::Goal(GoalConfig::default()))
    }

    /// welcome -> opened within 2 days? yes: goal, no: followup
    fn welcome_flow() -> FlowDocument {
        FlowDocument {
            nodes: vec![
                email("welcome", "welcome"),
                condition("opened", opened(), MatchMode::Any, 2),
                goal("converted"),
                email("followup", "followup"),
            ],
            edges: vec![
                Edge::new("e1", "welcome", "opened"),
                Edge::new("e2", "opened", "converted").with_handle("yes"),
                Edge::new("e3", "opened", "followup").with_handle("no"),
            ],
        }
    }

    /// welcome -> wait 3 days -> followup
    fn drip_flow() -> FlowDocument {
        FlowDocument {
            nodes: vec![
                email("welcome", "welcome"),
                Node::new(
                    "wait",
                    NodeKind::Delay(DelayConfig {
                        amount: 3,
                        unit: TimeUnit::Days,
                    }),
                ),
                email("followup", "followup"),
            ],
            edges: vec![
                Edge::new("e1", "welcome", "wait"),
                Edge::new("e2", "wait", "followup"),
            ],
        }
    }

    fn setup(config: FlowConfig) -> (FlowEngine, Arc<RecordingMailer>) {
        let mailer = Arc::new(RecordingMailer::default());
        let engine = FlowEngine::new(config, mailer.clone(), templates());
        (engine, mailer)
    }

    fn lead(id: &str) -> Lead {
        Lead::new(id, format!("{}@example.com", id)).with_field("first_name", id)
    }

    fn open(campaign: Uuid, lead_id: &str, at: DateTime<Utc>, key: &str) -> EngagementEvent {
        EngagementEvent::new(lead_id, campaign, EngagementType::Opened, at, key)
    }

    fn history_in_order(engine: &FlowEngine, key: &CursorKey) -> bool {
        let cursor = engine.cursor(key).unwrap();
        cursor.history.windows(2).all(|pair| pair[0].at <= pair[1].at)
    }

    // -----------------------------------------------------------------------
    // Scenario A: open inside the window reaches the goal
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_open_within_window_reaches_goal() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();

        let cursor = engine.enroll(campaign, lead("ada"), t0()).await.unwrap();
        assert_eq!(cursor.state, CursorState::WaitingCondition);
        assert_eq!(mailer.subjects_for("ada"), vec!["Welcome ada".to_string()]);

        let at = t0() + Duration::hours(20);
        let report = engine.ingest(open(campaign, "ada", at, "msg-1:opened"), at).await.unwrap();
        assert_eq!((report.routed, report.resolved), (1, 1));

        let cursor = engine.cursor(&cursor.key()).unwrap();
        assert_eq!(cursor.state, CursorState::GoalReached);
        assert_eq!(cursor.goal_reached_at, Some(at));
        assert_eq!(cursor.next_run_at, None);
        assert_eq!(cursor.counters.opens, 1);

        // the window deadline passing later changes nothing
        let tick = scheduler.tick(t0() + Duration::days(3)).await;
        assert_eq!(tick.due, 0);
        assert_eq!(mailer.subjects_for("ada").len(), 1);
    }

    // -----------------------------------------------------------------------
    // Scenario B: no open, followup at the deadline and never before
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_no_open_sends_followup_once_at_deadline() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let key = engine.enroll(campaign, lead("bob"), t0()).await.unwrap().key();

        let deadline = t0() + Duration::days(2);
        assert_eq!(scheduler.tick(deadline - Duration::seconds(1)).await.due, 0);
        assert_eq!(mailer.subjects_for("bob").len(), 1);

        let tick = scheduler.tick(deadline).await;
        assert_eq!((tick.due, tick.fired), (1, 1));
        assert_eq!(
            mailer.subjects_for("bob"),
            vec!["Welcome bob".to_string(), "Following up".to_string()]
        );

        let cursor = engine.cursor(&key).unwrap();
        assert_eq!(cursor.state, CursorState::Completed);
        assert_eq!(cursor.counters.emails_sent, 2);

        // further ticks and a late open do not resend
        scheduler.tick(deadline + Duration::days(5)).await;
        let late = deadline + Duration::hours(1);
        let report = engine.ingest(open(campaign, "bob", late, "late-open"), late).await.unwrap();
        assert_eq!(report.routed, 0);
        assert_eq!(mailer.subjects_for("bob").len(), 2);
        assert_eq!(engine.campaign_summary(&campaign).unwrap().stats.opens, 1);
    }

    // -----------------------------------------------------------------------
    // Scenario C: delay deadline is exact
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_delay_fires_exactly_at_deadline() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, drip_flow(), t0()).unwrap();

        let cursor = engine.enroll(campaign, lead("cy"), t0()).await.unwrap();
        assert_eq!(cursor.state, CursorState::WaitingDelay);
        assert_eq!(cursor.current_node_id, "wait");
        assert_eq!(cursor.next_run_at, Some(t0() + Duration::days(3)));

        let almost = t0() + Duration::days(2) + Duration::hours(23);
        let tick = scheduler.tick(almost).await;
        assert_eq!(tick.due, 0);
        let unchanged = engine.cursor(&cursor.key()).unwrap();
        assert_eq!(unchanged.state, CursorState::WaitingDelay);
        assert_eq!(unchanged.updated_at, cursor.updated_at);

        scheduler.tick(t0() + Duration::days(3)).await;
        assert_eq!(engine.cursor(&cursor.key()).unwrap().state, CursorState::Completed);
        assert_eq!(mailer.subjects_for("cy").len(), 2);
    }

    // -----------------------------------------------------------------------
    // Scenario D: duplicate webhook counts once
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_duplicate_open_webhook_counts_once() {
        let (engine, _mailer) = setup(FlowConfig::default());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let key = engine.enroll(campaign, lead("dee"), t0()).await.unwrap().key();

        let at = t0() + Duration::hours(1);
        engine.ingest(open(campaign, "dee", at, "first-open"), at).await.unwrap();
        assert_eq!(engine.cursor(&key).unwrap().state, CursorState::GoalReached);

        // provider retries the same open twice after the condition resolved
        let signal = TrackingSignal::new(SignalKind::PixelHit, campaign, "dee")
            .with_message_id("msg-1")
            .at(at + Duration::hours(1));
        let first = engine.ingest_signal(&signal, at + Duration::hours(1)).await.unwrap();
        let second = engine.ingest_signal(&signal, at + Duration::hours(2)).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);

        let stats = engine.campaign_summary(&campaign).unwrap().stats;
        assert_eq!(stats.opens, 2);
        assert_eq!(stats.unique_opens, 1);
    }

    // -----------------------------------------------------------------------
    // Scenario E: cancel while leads wait on a delay
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_stops_waiting_leads() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, drip_flow(), t0()).unwrap();

        let mut keys = Vec::new();
        for i in 0..10 {
            let cursor = engine
                .enroll(campaign, lead(&format!("lead-{}", i)), t0())
                .await
                .unwrap();
            assert_eq!(cursor.state, CursorState::WaitingDelay);
            keys.push(cursor.key());
        }
        assert_eq!(mailer.total(), 10);

        let canceled = engine.cancel_campaign(campaign, t0() + Duration::days(1)).unwrap();
        assert_eq!(canceled, 10);

        let tick = scheduler.tick(t0() + Duration::days(4)).await;
        assert_eq!(tick.due, 0);
        assert_eq!(mailer.total(), 10);
        for key in &keys {
            let cursor = engine.cursor(key).unwrap();
            assert_eq!(cursor.state, CursorState::Canceled);
            assert_eq!(cursor.next_run_at, None);
        }

        let summary = engine.campaign_summary(&campaign).unwrap();
        assert_eq!(summary.stats.canceled, 10);
        assert_eq!(summary.cursor_states.get("canceled"), Some(&10));
    }

    // -----------------------------------------------------------------------
    // Restart recovery
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_restart_fires_persisted_deadline_once() {
        let (engine, first_mailer) = setup(FlowConfig::default());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let key = engine.enroll(campaign, lead("eve"), t0()).await.unwrap().key();
        let snapshot = engine.snapshot(t0() + Duration::hours(1));

        // process comes back a week later
        let (restarted, second_mailer) = setup(FlowConfig::default());
        assert_eq!(restarted.restore(snapshot), 1);
        let back = t0() + Duration::days(7);
        assert_eq!(restarted.recover(back).await.unwrap(), 0);
        assert_eq!(restarted.due_count(back), 1);

        let scheduler = Scheduler::new(restarted.clone());
        scheduler.tick(back).await;
        scheduler.tick(back + Duration::minutes(1)).await;

        assert_eq!(first_mailer.subjects_for("eve"), vec!["Welcome eve".to_string()]);
        assert_eq!(second_mailer.subjects_for("eve"), vec!["Following up".to_string()]);
        assert_eq!(restarted.cursor(&key).unwrap().state, CursorState::Completed);
    }

    #[tokio::test]
    async fn test_recover_redrives_stranded_cursor() {
        let (engine, _) = setup(FlowConfig::default());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let key = engine.enroll(campaign, lead("fay"), t0()).await.unwrap().key();

        // crash right after the condition advanced to the followup node
        let mut snapshot = engine.snapshot(t0());
        for cursor in snapshot.cursors.iter_mut() {
            cursor.current_node_id = "followup".into();
            cursor.state = CursorState::Active;
            cursor.next_run_at = None;
            cursor.condition = None;
        }

        let (restarted, mailer) = setup(FlowConfig::default());
        restarted.restore(snapshot);
        assert_eq!(restarted.recover(t0() + Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(mailer.subjects_for("fay"), vec!["Following up".to_string()]);
        assert_eq!(restarted.cursor(&key).unwrap().state, CursorState::Completed);
    }

    // -----------------------------------------------------------------------
    // Failures, halts, and concurrency
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_in_campaign_status() {
        let config = FlowConfig {
            max_send_retries: 2,
            retry_base_secs: 60,
            retry_max_secs: 600,
            ..Default::default()
        };
        let sink = capture_sink();
        let engine = FlowEngine::new(config, Arc::new(DownMailer), templates()).with_event_sink(sink.clone());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, drip_flow(), t0()).unwrap();

        let cursor = engine.enroll(campaign, lead("gus"), t0()).await.unwrap();
        assert_eq!(cursor.state, CursorState::WaitingDelay);
        assert_eq!(cursor.current_node_id, "welcome");
        assert_eq!(cursor.next_run_at, Some(t0() + Duration::minutes(1)));

        scheduler.tick(t0() + Duration::minutes(1)).await;
        scheduler.tick(t0() + Duration::minutes(3)).await;

        let cursor = engine.cursor(&cursor.key()).unwrap();
        assert_eq!(cursor.state, CursorState::Failed);
        assert!(cursor.failure_reason.is_some());
        assert_eq!(sink.count_type(ActivityType::EmailSendFailed), 2);
        assert_eq!(sink.count_type(ActivityType::CursorFailed), 1);

        let summary = engine.campaign_summary(&campaign).unwrap();
        assert_eq!(summary.stats.failed, 1);
        assert_eq!(summary.cursor_states.get("failed"), Some(&1));
        assert_eq!(summary.stats.sent, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_cancels_across_campaigns() {
        let (engine, _) = setup(FlowConfig::default());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        engine.activate_flow(first, welcome_flow(), t0()).unwrap();
        engine.activate_flow(second, drip_flow(), t0()).unwrap();
        let a = engine.enroll(first, lead("hal"), t0()).await.unwrap().key();
        let b = engine.enroll(second, lead("hal"), t0()).await.unwrap().key();

        // a soft bounce is counted but stops nothing
        let soft = TrackingSignal::new(SignalKind::Bounce { kind: BounceKind::Soft }, first, "hal")
            .with_message_id("msg-1");
        let report = engine.ingest_signal(&soft, t0()).await.unwrap();
        assert_eq!(report.canceled, 0);
        assert_eq!(engine.campaign_summary(&first).unwrap().stats.bounces, 1);

        let unsubscribe = TrackingSignal::new(SignalKind::Unsubscribe, first, "hal").with_message_id("msg-1");
        let report = engine.ingest_signal(&unsubscribe, t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.canceled, 2);
        assert_eq!(engine.cursor(&a).unwrap().state, CursorState::Canceled);
        assert_eq!(engine.cursor(&b).unwrap().state, CursorState::Canceled);

        // the open that would have resolved the condition arrives too late
        let at = t0() + Duration::hours(2);
        let report = engine.ingest(open(first, "hal", at, "after-unsub"), at).await.unwrap();
        assert_eq!(report.routed, 0);
    }

    #[tokio::test]
    async fn test_none_mode_condition() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        let replied = WatchedSignals {
            replied: true,
            ..Default::default()
        };
        let document = FlowDocument {
            nodes: vec![
                email("welcome", "welcome"),
                condition("quiet", replied, MatchMode::NoneOf, 1),
                email("followup", "followup"),
                goal("engaged"),
            ],
            edges: vec![
                Edge::new("e1", "welcome", "quiet"),
                Edge::new("e2", "quiet", "followup").with_handle("yes"),
                Edge::new("e3", "quiet", "engaged").with_handle("no"),
            ],
        };
        engine.activate_flow(campaign, document, t0()).unwrap();

        let silent = engine.enroll(campaign, lead("ivy"), t0()).await.unwrap().key();
        let chatty = engine.enroll(campaign, lead("jon"), t0()).await.unwrap().key();

        let at = t0() + Duration::hours(4);
        let reply = EngagementEvent::new("jon", campaign, EngagementType::Replied, at, "reply-1");
        engine.ingest(reply, at).await.unwrap();
        assert_eq!(engine.cursor(&chatty).unwrap().state, CursorState::GoalReached);
        assert_eq!(engine.cursor(&silent).unwrap().state, CursorState::WaitingCondition);

        scheduler.tick(t0() + Duration::days(1)).await;
        assert_eq!(engine.cursor(&silent).unwrap().state, CursorState::Completed);
        assert_eq!(mailer.subjects_for("ivy").len(), 2);
        assert_eq!(mailer.subjects_for("jon").len(), 1);
    }

    #[tokio::test]
    async fn test_event_and_timeout_race_resolves_once() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let key: CursorKey = engine.enroll(campaign, lead("kim"), t0()).await.unwrap().key();

        let deadline = t0() + Duration::days(2);
        let event = open(campaign, "kim", deadline - Duration::minutes(1), "race-open");
        let (tick, report) = tokio::join!(scheduler.tick(deadline), engine.ingest(event, deadline));
        report.unwrap();
        assert_eq!(tick.errors, 0);

        let cursor = engine.cursor(&key).unwrap();
        assert!(cursor.state.is_terminal());
        let resolutions = cursor
            .history
            .iter()
            .filter(|step| step.node_id == "opened" && (step.outcome == "yes" || step.outcome == "no"))
            .count();
        assert_eq!(resolutions, 1);
        // either the goal was reached or exactly one followup went out
        let followups = mailer.subjects_for("kim").len() - 1;
        match cursor.state {
            CursorState::GoalReached => assert_eq!(followups, 0),
            _ => assert_eq!(followups, 1),
        }
    }

    // -----------------------------------------------------------------------
    // Provider clock skew
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_future_dated_open_counts_at_arrival() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let key = engine.enroll(campaign, lead("max"), t0()).await.unwrap().key();

        // reported five days ahead, received one hour after the welcome
        let arrival = t0() + Duration::hours(1);
        let skewed = open(campaign, "max", t0() + Duration::days(5), "max-open");
        let report = engine.ingest(skewed, arrival).await.unwrap();
        assert_eq!((report.routed, report.resolved), (1, 1));

        let cursor = engine.cursor(&key).unwrap();
        assert_eq!(cursor.state, CursorState::GoalReached);
        assert_eq!(cursor.goal_reached_at, Some(arrival));
        assert!(history_in_order(&engine, &key));

        scheduler.tick(t0() + Duration::days(3)).await;
        assert_eq!(mailer.subjects_for("max"), vec!["Welcome max".to_string()]);
    }

    #[tokio::test]
    async fn test_past_dated_open_still_matches_any() {
        let (engine, mailer) = setup(FlowConfig::default());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let key = engine.enroll(campaign, lead("nia"), t0()).await.unwrap().key();

        // stamped before the window opened
        let arrival = t0() + Duration::hours(2);
        let skewed = open(campaign, "nia", t0() - Duration::hours(2), "nia-open");
        let report = engine.ingest(skewed, arrival).await.unwrap();
        assert_eq!(report.resolved, 1);

        let cursor = engine.cursor(&key).unwrap();
        assert_eq!(cursor.state, CursorState::GoalReached);
        assert_eq!(cursor.goal_reached_at, Some(arrival));
        assert!(history_in_order(&engine, &key));
        assert_eq!(mailer.subjects_for("nia").len(), 1);
    }

    #[tokio::test]
    async fn test_skewed_replies_falsify_none_mode_on_arrival() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        let replied = WatchedSignals {
            replied: true,
            ..Default::default()
        };
        let document = FlowDocument {
            nodes: vec![
                email("welcome", "welcome"),
                condition("quiet", replied, MatchMode::NoneOf, 1),
                email("followup", "followup"),
                goal("engaged"),
            ],
            edges: vec![
                Edge::new("e1", "welcome", "quiet"),
                Edge::new("e2", "quiet", "followup").with_handle("yes"),
                Edge::new("e3", "quiet", "engaged").with_handle("no"),
            ],
        };
        engine.activate_flow(campaign, document, t0()).unwrap();
        let ahead = engine.enroll(campaign, lead("oli"), t0()).await.unwrap().key();
        let behind = engine.enroll(campaign, lead("pam"), t0()).await.unwrap().key();
        let quiet = engine.enroll(campaign, lead("quinn"), t0()).await.unwrap().key();

        let arrival = t0() + Duration::hours(4);
        let reply = |lead_id: &str, at: DateTime<Utc>| {
            EngagementEvent::new(lead_id, campaign, EngagementType::Replied, at, format!("{}-reply", lead_id))
        };
        engine.ingest(reply("oli", t0() + Duration::days(10)), arrival).await.unwrap();
        engine.ingest(reply("pam", t0() - Duration::days(1)), arrival).await.unwrap();

        for key in [&ahead, &behind] {
            let cursor = engine.cursor(key).unwrap();
            assert_eq!(cursor.state, CursorState::GoalReached);
            assert_eq!(cursor.goal_reached_at, Some(arrival));
            assert!(history_in_order(&engine, key));
        }
        assert_eq!(engine.cursor(&quiet).unwrap().state, CursorState::WaitingCondition);

        scheduler.tick(t0() + Duration::days(1)).await;
        assert_eq!(engine.cursor(&quiet).unwrap().state, CursorState::Completed);
        assert_eq!(mailer.subjects_for("oli").len(), 1);
        assert_eq!(mailer.subjects_for("pam").len(), 1);
        assert_eq!(mailer.subjects_for("quinn").len(), 2);
    }

    #[tokio::test]
    async fn test_only_the_timer_takes_the_timeout_branch() {
        let (engine, mailer) = setup(FlowConfig::default());
        let scheduler = Scheduler::new(engine.clone());
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let late = engine.enroll(campaign, lead("rex"), t0()).await.unwrap().key();
        let in_window = engine.enroll(campaign, lead("sol"), t0()).await.unwrap().key();

        // both arrive after the deadline, before the scheduler catches up
        let deadline = t0() + Duration::days(2);
        let arrival = deadline + Duration::minutes(30);
        let report = engine
            .ingest(open(campaign, "rex", deadline + Duration::hours(1), "rex-open"), arrival)
            .await
            .unwrap();
        assert_eq!((report.routed, report.resolved), (1, 0));
        assert_eq!(engine.cursor(&late).unwrap().state, CursorState::WaitingCondition);

        let report = engine
            .ingest(open(campaign, "sol", deadline - Duration::hours(1), "sol-open"), arrival)
            .await
            .unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(engine.cursor(&in_window).unwrap().state, CursorState::GoalReached);

        scheduler.tick(arrival + Duration::minutes(1)).await;
        assert_eq!(engine.cursor(&late).unwrap().state, CursorState::Completed);
        assert_eq!(mailer.subjects_for("rex").len(), 2);
        assert_eq!(mailer.subjects_for("sol").len(), 1);
    }

    // -----------------------------------------------------------------------
    // Write-through persistence
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_after_snapshot_is_not_repeated_after_crash() {
        let path = std::env::temp_dir().join(format!("flow-state-{}.json", Uuid::new_v4()));
        let mailer = Arc::new(RecordingMailer::default());
        let journaled = || {
            FlowEngine::new(FlowConfig::default(), mailer.clone(), templates())
                .with_journal(Arc::new(Journal::open(&path, false).unwrap()))
        };

        let engine = journaled();
        let campaign = Uuid::new_v4();
        engine.activate_flow(campaign, drip_flow(), t0()).unwrap();
        let key = engine.enroll(campaign, lead("tia"), t0()).await.unwrap().key();
        engine.save_snapshot(&path, t0()).await.unwrap();

        let fired = t0() + Duration::days(3);
        Scheduler::new(engine.clone()).tick(fired).await;
        assert_eq!(mailer.total(), 2);
        // the process dies before the next snapshot
        drop(engine);

        let restarted = journaled();
        assert_eq!(restarted.load_snapshot(&path).await.unwrap(), Some(1));
        let back = fired + Duration::minutes(5);
        assert_eq!(restarted.recover(back).await.unwrap(), 0);
        Scheduler::new(restarted.clone()).tick(back).await;

        assert_eq!(
            mailer.subjects_for("tia"),
            vec!["Welcome tia".to_string(), "Following up".to_string()]
        );
        assert_eq!(restarted.cursor(&key).unwrap().state, CursorState::Completed);
        assert_eq!(restarted.campaign_summary(&campaign).unwrap().stats.sent, 2);

        let journal = Journal::path_for(&path);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(journal.with_extension("journal.prev"));
        let _ = std::fs::remove_file(journal);
    }

    #[tokio::test]
    async fn test_new_version_leaves_running_cursors_alone() {
        let (engine, _) = setup(FlowConfig::default());
        let sink = capture_sink();
        let engine = engine.with_event_sink(sink.clone());
        let campaign = Uuid::new_v4();
        let v1 = engine.activate_flow(campaign, welcome_flow(), t0()).unwrap();
        let old = engine.enroll(campaign, lead("lou"), t0()).await.unwrap();

        let v2 = engine.activate_flow(campaign, drip_flow(), t0() + Duration::hours(1)).unwrap();
        assert_eq!(v2.version(), 2);
        assert_eq!(engine.cursor(&old.key()).unwrap().flow_id, v1.id());
        assert_eq!(engine.cursor(&old.key()).unwrap().current_node_id, "opened");

        let fresh = engine.enroll(campaign, lead("mia"), t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(fresh.flow_id, v2.id());
        assert_eq!(sink.count_type(ActivityType::LeadEnrolled), 2);

        let fields: HashMap<String, String> = engine.lead("mia").unwrap().fields;
        assert_eq!(fields.get("first_name").map(String::as_str), Some("mia"));
    }
}
