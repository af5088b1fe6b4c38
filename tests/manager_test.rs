//! End-to-end behaviour of `PageManager` against the in-memory engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pagewright::browser::{
    BrowserEngine, KeyEventType, KeyboardInput, MemElement, MemoryEngine, MouseButton,
    MouseEventType, MouseInput, RecordedInput, StorageKind,
};
use pagewright::{
    Action, Config, ErrorKind, FindOutcome, FindParams, PageId, PageManager, PagewrightError,
    SnapshotOptions, StreamEvent, StreamOptions, StreamState,
};

fn setup() -> (Arc<MemoryEngine>, PageManager) {
    let engine = Arc::new(MemoryEngine::new());

    engine.add_page(
        "https://example.com",
        "Example Domain",
        vec![
            MemElement::heading(1, "Example Domain"),
            MemElement::paragraph("This domain is for use in illustrative examples."),
            MemElement::link("More information...", "https://www.iana.org/domains/example"),
        ],
    );
    engine.add_page(
        "https://www.iana.org/domains/example",
        "IANA-managed Reserved Domains",
        vec![
            MemElement::heading(1, "Example Domains"),
            MemElement::link("Home", "https://www.iana.org/"),
        ],
    );
    engine.add_page(
        "https://shop.test",
        "Shop",
        vec![
            MemElement::new("ul").attr("id", "items").children([
                MemElement::new("li").child(MemElement::link("First", "/1").attr("class", "item")),
                MemElement::new("li").child(MemElement::link("Second", "/2").attr("class", "item")),
                MemElement::new("li").child(MemElement::link("Third", "/3").attr("class", "item")),
            ]),
            MemElement::link("Docs", "https://docs.shop.test").attr("target", "_blank"),
            MemElement::link("Invoice", "/files/invoice.pdf").attr("download", ""),
            MemElement::button("Log").attr("id", "log").attr("data-log", "clicked log"),
            MemElement::new("label").attr("for", "code").text("Code"),
            MemElement::input("text")
                .attr("id", "code")
                .attr("maxlength", "4")
                .attr("placeholder", "four chars"),
            MemElement::input("checkbox").attr("id", "terms"),
            MemElement::new("select").attr("id", "size").children([
                MemElement::new("option").attr("value", "s").text("Small"),
                MemElement::new("option").attr("value", "l").text("Large"),
            ]),
            MemElement::button("Secret").attr("id", "secret").attr("hidden", ""),
        ],
    );
    engine.add_page("https://shop.test/1", "Item 1", vec![MemElement::paragraph("one")]);
    engine.add_page("https://docs.shop.test", "Docs", vec![MemElement::paragraph("docs")]);

    let manager = PageManager::with_engine(engine.clone(), Config::default());
    (engine, manager)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

mod snapshots {
    use super::*;

    #[tokio::test]
    async fn example_domain_snapshot() {
        let (_engine, manager) = setup();
        let page = manager.open("example.com").await.unwrap();

        assert_eq!(manager.url(&page).await.unwrap(), "https://example.com/");
        assert_eq!(manager.title(&page).await.unwrap(), "Example Domain");

        let view = manager
            .snapshot(&page, &SnapshotOptions::default())
            .await
            .unwrap();
        assert!(view.tree.contains("heading \"Example Domain\" [level=1]"));
        assert!(view.tree.contains("link \"More information...\" [ref=@e1]"));
        assert!(view.tree.contains("https://www.iana.org/domains/example"));
        assert_eq!(view.ref_count, 1);

        let result = manager.click(&page, "@e1").await.unwrap();
        assert_eq!(result.url_before, "https://example.com/");
        assert_eq!(result.url_after, "https://www.iana.org/domains/example");
        assert!(!result.opened_new_page);
    }

    #[tokio::test]
    async fn repeated_snapshots_are_stable() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let first = manager.snapshot(&page, &SnapshotOptions::default()).await.unwrap();
        let second = manager.snapshot(&page, &SnapshotOptions::default()).await.unwrap();

        assert_eq!(first.tree, second.tree);
        assert_eq!(first.ref_count, second.ref_count);
        assert!(second.generation > first.generation);
    }

    #[tokio::test]
    async fn interactive_snapshot_keeps_refs_and_drops_prose() {
        let (_engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();

        let full = manager.snapshot(&page, &SnapshotOptions::default()).await.unwrap();
        let interactive = manager
            .snapshot(
                &page,
                &SnapshotOptions {
                    interactive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(full.tree.contains("illustrative examples"));
        assert!(!interactive.tree.contains("illustrative examples"));
        assert!(interactive.tree.contains("[ref=@e1]"));
        assert_eq!(interactive.ref_count, full.ref_count);
    }

    #[tokio::test]
    async fn selector_scopes_tree_and_refs() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let view = manager
            .snapshot(
                &page,
                &SnapshotOptions {
                    selector: Some("#items".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(view.tree.contains("link \"First\" [ref=@e1]"));
        assert!(view.tree.contains("link \"Third\" [ref=@e3]"));
        assert!(!view.tree.contains("Docs"));
        assert!(!view.tree.contains("Log"));
        assert_eq!(view.ref_count, 3);

        let result = manager.click(&page, "@e1").await.unwrap();
        assert_eq!(result.url_after, "https://shop.test/1");
    }

    #[tokio::test]
    async fn typed_ref_goes_stale_after_new_snapshot() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();
        manager.snapshot(&page, &SnapshotOptions::default()).await.unwrap();

        let old_ref = manager
            .active_snapshot(&page)
            .unwrap()
            .unwrap()
            .ref_nodes()[0]
            .ref_id
            .unwrap();

        manager.snapshot(&page, &SnapshotOptions::default()).await.unwrap();
        let err = manager.click(&page, old_ref).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefStale);
    }

    #[tokio::test]
    async fn string_ref_beyond_current_generation_is_stale() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();
        let shop = manager.snapshot(&page, &SnapshotOptions::default()).await.unwrap();
        assert!(shop.ref_count > 1);

        manager.click(&page, "a.item").await.unwrap();
        let item = manager.snapshot(&page, &SnapshotOptions::default()).await.unwrap();
        assert_eq!(item.ref_count, 0);

        let err = manager.click(&page, "@e2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefStale);

        let err = manager.click(&page, "@e999").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefNotFound);
    }

    #[tokio::test]
    async fn ref_before_any_snapshot_is_not_found() {
        let (_engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();

        let err = manager.click(&page, "@e1").await.unwrap_err();
        assert!(matches!(err, PagewrightError::RefNotFound(_)));
    }
}

mod actions {
    use super::*;

    #[tokio::test]
    async fn blank_target_link_opens_new_page() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let result = manager.click(&page, "a[target=_blank]").await.unwrap();
        assert!(result.opened_new_page);
        assert_eq!(result.url_after, result.url_before);
        assert_eq!(result.new_page_ids.len(), 1);

        let popup = &result.new_page_ids[0];
        assert_eq!(manager.url(popup).await.unwrap(), "https://docs.shop.test/");
        assert_eq!(manager.pages().len(), 2);
    }

    #[tokio::test]
    async fn download_link_reports_file() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let result = manager.click(&page, "a[download]").await.unwrap();
        let download = result.download.expect("download metadata");
        assert_eq!(download.suggested_filename, "invoice.pdf");
        assert_eq!(download.url, "https://shop.test/files/invoice.pdf");
        assert!(!result.opened_new_page);
    }

    #[tokio::test]
    async fn fill_reads_back_what_the_field_kept() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let result = manager.fill(&page, "#code", "123456").await.unwrap();
        assert_eq!(result.value, Some(serde_json::json!("1234")));

        let value = manager.value(&page, "#code").await.unwrap();
        assert_eq!(value.value, Some(serde_json::json!("1234")));
    }

    #[tokio::test]
    async fn select_and_check_report_new_state() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let selected = manager.select(&page, "#size", "Large").await.unwrap();
        assert_eq!(selected.value, Some(serde_json::json!("l")));

        let checked = manager.check(&page, "#terms").await.unwrap();
        assert_eq!(checked.value, Some(serde_json::json!(true)));

        let state = manager.act(&page, "#terms", Action::IsChecked).await.unwrap();
        assert_eq!(state.value, Some(serde_json::json!(true)));
    }

    #[tokio::test]
    async fn hidden_element_is_reported_as_not_found() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let err = manager.click(&page, "#secret").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ElementNotFound);
    }

    #[tokio::test]
    async fn missing_selector_is_element_not_found() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let err = manager.click(&page, "#nope").await.unwrap_err();
        assert!(matches!(err, PagewrightError::ElementNotFound(_)));
    }

    #[tokio::test]
    async fn detached_element_is_retried_once() {
        let (engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();
        let target = manager.target(&page).unwrap();

        engine.detach_next(&target, 1).unwrap();
        manager.click(&page, "#log").await.unwrap();
        assert_eq!(engine.perform_calls(&target).unwrap(), 2);
    }

    #[tokio::test]
    async fn element_detached_twice_fails() {
        let (engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();
        let target = manager.target(&page).unwrap();

        engine.detach_next(&target, 2).unwrap();
        let err = manager.click(&page, "#log").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ElementDetached);
        assert_eq!(engine.perform_calls(&target).unwrap(), 2);
    }

    #[tokio::test]
    async fn back_reports_partial_progress() {
        let (_engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();
        manager.click(&page, "a").await.unwrap();

        let err = manager.back(&page, 2).await.unwrap_err();
        match err {
            PagewrightError::NavigationFailed {
                steps_completed, ..
            } => assert_eq!(steps_completed, 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.url(&page).await.unwrap(), "https://example.com/");
    }

    #[tokio::test]
    async fn slow_back_navigation_fails_with_progress() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_page("https://a.test", "A", vec![MemElement::link("B", "https://b.test")]);
        engine.add_page("https://b.test", "B", vec![]);
        let mut config = Config::default();
        config.actions.timeout_ms = 50;
        let manager = PageManager::with_engine(engine.clone(), config);

        let page = manager.open("https://a.test").await.unwrap();
        manager.click(&page, "a").await.unwrap();
        engine.delay_settle(Duration::from_millis(500));

        match manager.back(&page, 1).await.unwrap_err() {
            PagewrightError::NavigationFailed {
                steps_completed, ..
            } => assert_eq!(steps_completed, 0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn back_one_step_returns_to_previous_url() {
        let (_engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();
        manager.click(&page, "a").await.unwrap();

        let result = manager.back(&page, 1).await.unwrap();
        assert_eq!(result.steps_completed, Some(1));
        assert_eq!(result.url_after, "https://example.com/");

        let history = manager.history(&page).await.unwrap();
        assert_eq!(history.entries.len(), 2);
        assert_eq!(history.current, 0);
    }

    #[tokio::test]
    async fn press_without_target_goes_to_focused_element() {
        let (engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();
        let target = manager.target(&page).unwrap();

        manager.press(&page, None, "Tab").await.unwrap();
        assert_eq!(
            engine.inputs(&target).unwrap(),
            vec![RecordedInput::Key("Tab".to_string())]
        );
    }

    #[tokio::test]
    async fn unknown_page_is_session_closed() {
        let (_engine, manager) = setup();
        let err = manager
            .click(&PageId::from("p42"), "a")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }
}

mod find {
    use super::*;

    fn params(strategy: &str, action: &str) -> FindParams {
        FindParams {
            strategy: strategy.to_string(),
            action: action.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn count_reports_match_set_size() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let request = FindParams {
            selector: Some("a.item".into()),
            ..params("css", "count")
        }
        .into_request()
        .unwrap();

        let outcome = manager.find(&page, request).await.unwrap();
        assert_eq!(outcome, FindOutcome::Count { count: 3 });
    }

    #[tokio::test]
    async fn nth_out_of_range_fails() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let request = FindParams {
            selector: Some("a.item".into()),
            nth: Some(5),
            ..params("nth", "click")
        }
        .into_request()
        .unwrap();

        let err = manager.find(&page, request).await.unwrap_err();
        match err {
            PagewrightError::IndexOutOfRange { index, len, .. } => {
                assert_eq!(index, 5);
                assert_eq!(len, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn nth_clicks_zero_based_match() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let request = FindParams {
            selector: Some("a.item".into()),
            nth: Some(1),
            ..params("nth", "text")
        }
        .into_request()
        .unwrap();

        match manager.find(&page, request).await.unwrap() {
            FindOutcome::Action(result) => assert_eq!(result.text.as_deref(), Some("Second")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn css_click_navigates_away() {
        let (_engine, manager) = setup();
        let page = manager.open("example.com").await.unwrap();

        let request = FindParams {
            selector: Some("a".into()),
            ..params("css", "click")
        }
        .into_request()
        .unwrap();

        match manager.find(&page, request).await.unwrap() {
            FindOutcome::Action(result) => {
                assert_eq!(result.url_before, "https://example.com/");
                assert_eq!(result.url_after, "https://www.iana.org/domains/example");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            manager.title(&page).await.unwrap(),
            "IANA-managed Reserved Domains"
        );
    }

    #[tokio::test]
    async fn label_strategy_fills_field() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let request = FindParams {
            value: Some("Code".into()),
            action_value: Some("ab".into()),
            ..params("label", "fill")
        }
        .into_request()
        .unwrap();

        match manager.find(&page, request).await.unwrap() {
            FindOutcome::Action(result) => {
                assert_eq!(result.value, Some(serde_json::json!("ab")))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn role_strategy_follows_link_by_name() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let request = FindParams {
            value: Some("link".into()),
            name: Some("first".into()),
            ..params("role", "click")
        }
        .into_request()
        .unwrap();

        match manager.find(&page, request).await.unwrap() {
            FindOutcome::Action(result) => {
                assert_eq!(result.url_after, "https://shop.test/1")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

mod streaming {
    use super::*;

    #[tokio::test]
    async fn second_start_is_already_streaming() {
        let (_engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();

        let _handle = manager
            .stream_start(&page, &StreamOptions::default())
            .await
            .unwrap();
        assert_eq!(manager.stream_state(&page).unwrap(), StreamState::Active);

        let err = manager
            .stream_start(&page, &StreamOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyStreaming);
    }

    #[tokio::test]
    async fn stop_while_idle_is_a_no_op() {
        let (_engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();

        manager.stream_stop(&page).await.unwrap();
        assert_eq!(manager.stream_state(&page).unwrap(), StreamState::Idle);
    }

    #[tokio::test]
    async fn status_frames_and_final_status_arrive_in_order() {
        let (engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();
        let target = manager.target(&page).unwrap();

        let mut handle = manager
            .stream_start(&page, &StreamOptions::default())
            .await
            .unwrap();

        match handle.recv().await {
            Some(StreamEvent::Status(status)) => {
                assert!(status.screencasting);
                assert_eq!(status.viewport_width, Some(1280));
            }
            other => panic!("expected status, got {other:?}"),
        }

        engine.push_frame(&target, b"frame-one").await.unwrap();
        match handle.recv().await {
            Some(StreamEvent::Frame(frame)) => {
                assert_eq!(frame.metadata.device_width, 1280.0);
                assert!(!frame.data.is_empty());
            }
            other => panic!("expected frame, got {other:?}"),
        }
        wait_until(|| engine.acked_frames(&target).unwrap() == vec![1]).await;

        manager.stream_stop(&page).await.unwrap();
        assert!(!engine.is_screencasting(&target).unwrap());
        match handle.recv().await {
            Some(StreamEvent::Status(status)) => assert!(!status.screencasting),
            other => panic!("expected final status, got {other:?}"),
        }
        assert!(handle.recv().await.is_none());
        assert_eq!(manager.stream_state(&page).unwrap(), StreamState::Idle);
    }

    #[tokio::test]
    async fn frames_are_acked_only_once_delivered() {
        let (engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();
        let target = manager.target(&page).unwrap();

        let options = StreamOptions {
            channel_capacity: 1,
            ..Default::default()
        };
        let mut handle = manager.stream_start(&page, &options).await.unwrap();

        // The initial status fills the channel; the pump holds frame 1.
        engine.push_frame(&target, b"one").await.unwrap();
        engine.push_frame(&target, b"two").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.acked_frames(&target).unwrap().is_empty());

        assert!(matches!(handle.recv().await, Some(StreamEvent::Status(_))));
        assert!(matches!(handle.recv().await, Some(StreamEvent::Frame(_))));
        wait_until(|| engine.acked_frames(&target).unwrap().first() == Some(&1)).await;
    }

    #[tokio::test]
    async fn closing_the_page_ends_the_stream() {
        let (_engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();

        let mut handle = manager
            .stream_start(&page, &StreamOptions::default())
            .await
            .unwrap();
        manager.close(&page).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = handle.recv().await {
            events.push(event);
        }
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Status(status)) if !status.screencasting
        ));
        assert!(manager.pages().is_empty());
    }

    #[tokio::test]
    async fn stop_during_start_waits_and_stops() {
        let (engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();
        let target = manager.target(&page).unwrap();
        engine.delay_screencast_start(Duration::from_millis(100));

        let options = StreamOptions::default();
        let (started, stopped) = tokio::join!(
            manager.stream_start(&page, &options),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(manager.stream_state(&page).unwrap(), StreamState::Starting);
                manager.stream_stop(&page).await
            }
        );

        let mut handle = started.unwrap();
        stopped.unwrap();
        assert_eq!(manager.stream_state(&page).unwrap(), StreamState::Idle);
        assert!(!engine.is_screencasting(&target).unwrap());

        assert!(matches!(
            handle.recv().await,
            Some(StreamEvent::Status(status)) if status.screencasting
        ));
        assert!(matches!(
            handle.recv().await,
            Some(StreamEvent::Status(status)) if !status.screencasting
        ));
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_during_start_ends_the_stream() {
        let (engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();
        engine.delay_screencast_start(Duration::from_millis(100));

        let options = StreamOptions::default();
        let (started, closed) = tokio::join!(
            manager.stream_start(&page, &options),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                manager.close(&page).await
            }
        );

        let mut handle = started.unwrap();
        closed.unwrap();
        assert!(manager.pages().is_empty());

        let mut events = Vec::new();
        while let Some(event) = handle.recv().await {
            events.push(event);
        }
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Status(status)) if !status.screencasting
        ));
    }

    #[tokio::test]
    async fn input_injection_reaches_the_engine() {
        let (engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();
        let target = manager.target(&page).unwrap();

        let mouse = MouseInput {
            event_type: MouseEventType::Pressed,
            x: 10.0,
            y: 20.0,
            button: MouseButton::Left,
            click_count: 1,
            delta_x: 0.0,
            delta_y: 0.0,
            modifiers: 0,
        };
        manager.stream_inject_mouse(&page, &mouse).await.unwrap();

        let key = KeyboardInput {
            event_type: KeyEventType::Down,
            key: None,
            code: None,
            text: None,
            modifiers: 0,
        };
        let err = manager.stream_inject_keyboard(&page, &key).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidActionParameters);

        assert_eq!(engine.inputs(&target).unwrap(), vec![RecordedInput::Mouse(mouse)]);
    }
}

mod page_state {
    use super::*;

    #[tokio::test]
    async fn console_entries_are_captured() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        manager.click(&page, "#log").await.unwrap();
        wait_until(|| !manager.console_get(&page, None, 10).unwrap().is_empty()).await;

        let entries = manager.console_get(&page, None, 10).unwrap();
        assert_eq!(entries[0].kind, "log");
        assert_eq!(entries[0].text, "clicked log");
    }

    #[tokio::test]
    async fn storage_round_trips_per_kind() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        let mut items = BTreeMap::new();
        items.insert("theme".to_string(), "dark".to_string());
        manager
            .storage_set(&page, StorageKind::Local, &items)
            .await
            .unwrap();

        let local = manager
            .storage_get(&page, StorageKind::Local, None)
            .await
            .unwrap();
        assert_eq!(local.get("theme").map(String::as_str), Some("dark"));

        let session = manager
            .storage_get(&page, StorageKind::Session, None)
            .await
            .unwrap();
        assert!(session.is_empty());

        manager
            .storage_clear(&page, StorageKind::Local, None)
            .await
            .unwrap();
        assert!(manager
            .storage_get(&page, StorageKind::Local, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cookies_replace_by_name() {
        let (_engine, manager) = setup();
        let page = manager.open("https://shop.test").await.unwrap();

        manager
            .cookies_set(
                &page,
                &[
                    serde_json::json!({"name": "sid", "value": "1"}),
                    serde_json::json!({"name": "sid", "value": "2"}),
                ],
            )
            .await
            .unwrap();

        let cookies = manager.cookies_get(&page).await.unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0]["value"], "2");

        manager.cookies_clear(&page).await.unwrap();
        assert!(manager.cookies_get(&page).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_close_still_tears_everything_down() {
        let (engine, manager) = setup();
        let page = manager.open("https://example.com").await.unwrap();
        let target = manager.target(&page).unwrap();

        let port = manager
            .console_stream_start(&page, "127.0.0.1", 0)
            .await
            .unwrap();
        let _handle = manager
            .stream_start(&page, &StreamOptions::default())
            .await
            .unwrap();

        // The tab dies underneath the manager.
        engine.close_page(&target).await.unwrap();

        let err = manager.close(&page).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        assert!(manager.pages().is_empty());
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn page_infos_list_open_pages() {
        let (_engine, manager) = setup();
        let first = manager.open("https://example.com").await.unwrap();
        let second = manager.open("https://shop.test").await.unwrap();

        let infos = manager.page_infos().await.unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, first);
        assert_eq!(infos[1].title, "Shop");

        manager.close(&second).await.unwrap();
        assert_eq!(manager.pages(), vec![first]);

        manager.close_all().await.unwrap();
        assert!(manager.pages().is_empty());
    }
}
