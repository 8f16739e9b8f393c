//! Behaviour tests for the scheduling core using Cucumber.
//!
//! ```bash
//! cargo test --test interfaces
//! ```

mod steps;

use cucumber::World;
use steps::history::HistoryWorld;
use steps::hyperdeck::HyperdeckWorld;
use steps::queue::QueueWorld;
use steps::runner::RunnerWorld;

#[tokio::main]
async fn main() {
    // Run state history tests
    println!("\n=== Running State History Tests ===\n");
    HistoryWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/state_history.feature")
        .await;

    // Run timed queue tests
    println!("\n=== Running Timed Queue Tests ===\n");
    QueueWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/timed_queue.feature")
        .await;

    // Run hyperdeck diff tests
    println!("\n=== Running Hyperdeck Transport Tests ===\n");
    HyperdeckWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/hyperdeck_transport.feature")
        .await;

    // Run device runner tests
    println!("\n=== Running Device Runner Tests ===\n");
    RunnerWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/device_runner.feature")
        .await;
}
