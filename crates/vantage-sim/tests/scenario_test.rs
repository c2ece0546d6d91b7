use serde_json::{json, Value};
use vantage_sim::{run, Config, SimError, Simulation, Step};

fn scenario(text: &str) -> Config {
    toml::from_str(text).expect("scenario should parse")
}

async fn replay(config: &Config) -> Vec<Value> {
    let mut lines = Vec::new();
    let delivered = run(config, |line| lines.push(line))
        .await
        .expect("scenario should run");
    assert_eq!(delivered, lines.len());
    lines
}

fn types(lines: &[Value]) -> Vec<&str> {
    lines
        .iter()
        .map(|line| line["record"]["type"].as_str().unwrap_or_default())
        .collect()
}

// ── replay tests ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn click_scroll_and_custom_records_are_printed_in_order() {
    let config = scenario(
        r##"
[[elements]]
name = "buy"
tag = "button"
selectors = ["#buy"]
vars = { sku = "A-1" }

[[triggers]]
on = "click"
selector = "#buy"

[[triggers]]
on = "scroll"
scrollSpec = { verticalBoundaries = [50] }

[[triggers]]
on = "checkout"

[[steps]]
kind = "click"
target = "buy"

[[steps]]
kind = "scroll"
vertical = 60

[[steps]]
kind = "custom"
event = "checkout"
target = "buy"
vars = { total = 42 }
"##,
    );

    let lines = replay(&config).await;
    assert_eq!(types(&lines), vec!["click", "scroll", "checkout"]);
    assert_eq!(lines[0]["trigger"], json!(0));
    assert_eq!(lines[0]["record"]["vars"]["sku"], json!("A-1"));
    assert_eq!(lines[1]["record"]["vars"]["verticalScrollBoundary"], json!("50"));
    assert_eq!(lines[2]["record"]["vars"]["total"], json!(42));
    assert_eq!(lines[2]["record"]["vars"]["sku"], json!("A-1"));
}

#[tokio::test(start_paused = true)]
async fn timers_tick_during_waits_and_flush_on_dispose() {
    let config = scenario(
        r#"
[[triggers]]
on = "timer"
timerSpec = { interval = 1, immediate = false }

[[steps]]
kind = "wait"
ms = 2500
"#,
    );

    let lines = replay(&config).await;
    assert_eq!(types(&lines), vec!["timer", "timer", "timer"]);
    // Ticks at 1s and 2s, then the flush at disposal measures the remainder.
    let flushed = lines[2]["record"]["vars"]["timerDuration"]
        .as_u64()
        .expect("duration should be a number");
    assert!((500..1000).contains(&flushed), "flushed {flushed}ms");
}

#[tokio::test(start_paused = true)]
async fn visibility_on_exit_reports_at_pagehide() {
    let config = scenario(
        r#"
[[triggers]]
on = "visible"
visibilitySpec = { reportWhen = "documentExit" }

[[steps]]
kind = "visibility"
state = { totalVisibleTime = 800 }

[[steps]]
kind = "pagehide"
"#,
    );

    let lines = replay(&config).await;
    assert_eq!(types(&lines), vec!["visible"]);
    assert_eq!(lines[0]["record"]["vars"]["totalVisibleTime"], json!(800));
}

#[tokio::test(start_paused = true)]
async fn story_steps_pass_through_the_tag_and_repeat_filter() {
    let config = scenario(
        r#"
[[triggers]]
on = "story-page-visible"
tagName = "amp-story-page"
storySpec = { repeat = false }

[[steps]]
kind = "story"
event = "story-page-visible"
details = { tagName = "AMP-STORY-PAGE", repeated = false }

[[steps]]
kind = "story"
event = "story-page-visible"
details = { tagName = "amp-story-page", repeated = true }

[[steps]]
kind = "story"
event = "story-page-visible"
details = { tagName = "amp-story-grid-layer" }
"#,
    );

    let lines = replay(&config).await;
    assert_eq!(types(&lines), vec!["story-page-visible"]);
    assert_eq!(
        lines[0]["record"]["vars"]["eventDetails"]["tagName"],
        json!("AMP-STORY-PAGE")
    );
}

#[tokio::test(start_paused = true)]
async fn demo_scenario_exercises_every_tracker_family() {
    let config = scenario(include_str!("../scenarios/checkout.toml"));

    let lines = replay(&config).await;
    let seen = types(&lines);
    for expected in [
        "ini-load",
        "story-page-visible",
        "scroll",
        "video-percentage-played",
        "timer",
        "click",
        "checkout",
        "visible",
    ] {
        assert!(seen.contains(&expected), "{expected} missing from {seen:?}");
    }
    let stories = seen.iter().filter(|t| **t == "story-page-visible").count();
    assert_eq!(stories, 1, "the repeated page view is filtered");
}

// ── failure tests ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unknown_elements_abort_the_run() {
    let config = scenario(
        r#"
[[steps]]
kind = "click"
target = "ghost"
"#,
    );
    let err = run(&config, |_| {}).await.expect_err("unknown target should fail");
    assert!(matches!(err, SimError::UnknownElement(name) if name == "ghost"));
}

#[tokio::test(start_paused = true)]
async fn rejected_triggers_name_their_index() {
    let config = scenario(
        r##"
[[triggers]]
on = "click"
selector = "#buy"

[[triggers]]
on = "video-play"
"##,
    );
    let err = Simulation::new(&config)
        .err()
        .expect("video trigger without selector should fail");
    assert!(matches!(err, SimError::Trigger { index: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn steps_can_be_driven_one_at_a_time() {
    let config = scenario(
        r##"
[[elements]]
name = "ad"
tag = "amp-ad"
selectors = ["#ad"]
amp = true

[[triggers]]
on = "ini-load"
selector = "#ad"
"##,
    );
    let sim = Simulation::new(&config).expect("simulation should build");
    sim.step(&Step::Wait { ms: 10 }).await.expect("wait should run");
    assert!(sim.drain().is_empty());

    sim.step(&Step::Signal {
        name: "ini-load".into(),
        target: Some("ad".into()),
    })
    .await
    .expect("signal should run");
    let lines = sim.drain();
    assert_eq!(types(&lines), vec!["ini-load"]);
    sim.dispose();
}

#[tokio::test(start_paused = true)]
async fn story_steps_need_a_story_capable_root() {
    let config = scenario(
        r#"
root = "timer"

[[steps]]
kind = "story"
event = "story-page-visible"
"#,
    );
    let err = run(&config, |_| {}).await.expect_err("timer roots have no story tracker");
    assert!(matches!(err, SimError::StoryUnavailable(kind) if kind == "timer"));
}
