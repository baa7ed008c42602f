use page_behaviors::{BehaviorConfig, Page};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::test_runner::{FileFailurePersistence, TestCaseResult};

const BEHAVIOR_PROPTEST_REGRESSION_FILE: &str =
    "tests/proptest-regressions/behavior_property_fuzz_test.txt";
const DEFAULT_BEHAVIOR_PROPTEST_CASES: u32 = 128;

const CHROME_PAGE_HTML: &str = r#"
<nav class="navbar navbar-dark">site</nav>
<main id="mount">
  <div id="flash">
    <div id="f1" class="alert alert-success">created</div>
    <div id="f2" class="alert alert-warning">expiring</div>
    <div id="f3" class="alert alert-danger">failed</div>
  </div>
  <p id="body-copy">content</p>
</main>
"#;

#[derive(Clone, Debug)]
enum PageAction {
    Scroll(i64),
    Advance(i64),
    CloseFirstAlert,
    RemoveFirstAlert,
    Ready,
}

fn env_proptest_cases(var_name: &str, default_cases: u32) -> u32 {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_cases)
}

fn behavior_proptest_cases() -> u32 {
    env_proptest_cases(
        "PAGE_BEHAVIORS_PROPTEST_CASES",
        DEFAULT_BEHAVIOR_PROPTEST_CASES,
    )
}

fn page_action_strategy() -> BoxedStrategy<PageAction> {
    prop_oneof![
        4 => (0i64..300).prop_map(PageAction::Scroll),
        4 => (0i64..3000).prop_map(PageAction::Advance),
        1 => Just(PageAction::CloseFirstAlert),
        1 => Just(PageAction::RemoveFirstAlert),
        2 => Just(PageAction::Ready),
    ]
    .boxed()
}

fn page_action_sequence_strategy() -> BoxedStrategy<Vec<PageAction>> {
    vec(page_action_strategy(), 1..=24).boxed()
}

fn run_action(page: &mut Page, action: &PageAction) -> page_behaviors::Result<()> {
    match action {
        PageAction::Scroll(offset) => page.scroll_to(*offset),
        PageAction::Advance(delta) => page.advance_time(*delta),
        PageAction::CloseFirstAlert => {
            if page.count(".alert")? > 0 {
                page.close_alert(".alert")?;
            }
            Ok(())
        }
        PageAction::RemoveFirstAlert => {
            if page.count(".alert")? > 0 {
                page.remove(".alert")?;
            }
            Ok(())
        }
        PageAction::Ready => {
            if !page.is_ready() {
                page.document_ready()?;
            }
            Ok(())
        }
    }
}

fn assert_action_sequence_is_stable(actions: &[PageAction]) -> TestCaseResult {
    let mut page = Page::from_html(CHROME_PAGE_HTML)
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
    page.bind_scroll_styler(".navbar", "scrolled", &BehaviorConfig::default())
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
    page.bind_alert_auto_dismiss(".alert", &BehaviorConfig::default())
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;

    let mut last_offset: Option<i64> = None;
    let mut ready_at: Option<i64> = None;

    for (step, action) in actions.iter().enumerate() {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_action(&mut page, action)
        }));

        match outcome {
            Err(_) => {
                prop_assert!(
                    false,
                    "action panicked at step {step}: {action:?}, actions={actions:?}"
                );
            }
            Ok(Err(error)) => {
                prop_assert!(
                    false,
                    "action returned error at step {step}: {action:?}, error={error:?}, actions={actions:?}"
                );
            }
            Ok(Ok(())) => {}
        }

        match action {
            PageAction::Scroll(offset) => last_offset = Some(*offset),
            PageAction::Ready => {
                if ready_at.is_none() {
                    ready_at = Some(page.now_ms());
                }
            }
            _ => {}
        }

        prop_assert!(
            page.assert_exists(".navbar").is_ok(),
            "navbar missing after step {step}: {action:?}"
        );

        if let Some(offset) = last_offset {
            let styled = page
                .has_class(".navbar", "scrolled")
                .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
            prop_assert_eq!(
                styled,
                offset > 50,
                "class state mismatch at step {} for offset {}",
                step,
                offset
            );
        }

        if let Some(ready_time) = ready_at {
            if page.now_ms().saturating_sub(ready_time) >= 4000 {
                let remaining = page
                    .count(".alert")
                    .map_err(|err| {
                        proptest::test_runner::TestCaseError::fail(format!("{err:?}"))
                    })?;
                prop_assert_eq!(
                    remaining,
                    0,
                    "alerts remained {}ms after ready at step {}",
                    page.now_ms() - ready_time,
                    step
                );
            }
        }
    }

    Ok(())
}

fn assert_scroll_class_tracks_threshold(offsets: &[i64]) -> TestCaseResult {
    let mut page = Page::from_html("<nav class='navbar'>site</nav>")
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
    page.bind_scroll_styler(".navbar", "scrolled", &BehaviorConfig::default())
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;

    for offset in offsets {
        page.scroll_to(*offset)
            .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
        let styled = page
            .has_class(".navbar", "scrolled")
            .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
        prop_assert_eq!(styled, *offset > 50, "offset {} mis-styled", offset);
    }

    Ok(())
}

fn assert_each_alert_gets_one_timer(alert_count: usize) -> TestCaseResult {
    let mut html = String::from("<div id='flash'>");
    for index in 0..alert_count {
        html.push_str(&format!("<div id='n{index}' class='alert'>note</div>"));
    }
    html.push_str("</div>");

    let mut page = Page::from_html(&html)
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
    page.bind_alert_auto_dismiss(".alert", &BehaviorConfig::default())
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
    page.document_ready()
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;

    let pending = page.pending_timers();
    prop_assert_eq!(pending.len(), alert_count);
    prop_assert!(pending.iter().all(|timer| timer.due_at == 4000));

    let mut ids: Vec<i64> = pending.iter().map(|timer| timer.id).collect();
    ids.sort_unstable();
    ids.dedup();
    prop_assert_eq!(ids.len(), alert_count, "timer ids were not unique");

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: behavior_proptest_cases(),
        failure_persistence: Some(Box::new(
            FileFailurePersistence::Direct(BEHAVIOR_PROPTEST_REGRESSION_FILE),
        )),
        .. ProptestConfig::default()
    })]

    #[test]
    fn scroll_class_always_tracks_threshold(offsets in vec(0i64..400, 1..=32)) {
        assert_scroll_class_tracks_threshold(&offsets)?;
    }

    #[test]
    fn page_action_sequences_never_error(actions in page_action_sequence_strategy()) {
        assert_action_sequence_is_stable(&actions)?;
    }

    #[test]
    fn each_ready_time_alert_gets_exactly_one_timer(alert_count in 0usize..=8) {
        assert_each_alert_gets_one_timer(alert_count)?;
    }
}
