use std::sync::Arc;

use jeju_poll::config::Config;
use jeju_poll::models::{Poll, VoteTally};
use jeju_poll::store;
use jeju_poll::voter::VoterLedger;
use jeju_poll::widget::PollWidget;
use log::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::from_env();

    // Absent or broken store just means the page runs offline.
    let store = store::connect(&config).await;
    let ledger = Arc::new(VoterLedger::open(&config.ledger_path));

    // The two polls of the Jeju Vintage Holiday page. The design poll shows
    // seeded counts until the first remote snapshot arrives.
    let design_poll = Poll::with_seed(
        "jeju_main_poll",
        &["optionA", "optionB"],
        VoteTally::seed([("optionA", 42), ("optionB", 12)]),
    );
    let scenarios_poll = Poll::new("jeju_scenarios_poll", &["coffee", "market", "film", "music"]);

    let mut design = PollWidget::mount(design_poll, store.clone(), Arc::clone(&ledger));
    let mut scenarios = PollWidget::mount(scenarios_poll, store.clone(), Arc::clone(&ledger));
    design.activate().await;
    scenarios.activate().await;

    if let Some(choice) = &config.demo_vote {
        if design.cast_vote(choice).await {
            info!("Cast vote for {:?} on the design poll", choice);
        } else {
            info!("Vote for {:?} not accepted (already voted or unknown choice)", choice);
        }
    }

    let state = design.state();
    info!("Design poll: voted={} tally={:?}", state.has_voted, state.tally);
    let state = scenarios.state();
    info!("Scenario poll: voted={} tally={:?}", state.has_voted, state.tally);

    info!("Streaming live tallies, Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }

    design.deactivate();
    scenarios.deactivate();
    info!("Shut down");
}
