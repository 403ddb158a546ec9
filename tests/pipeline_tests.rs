//! Integration tests for the staged pipeline.
//!
//! Tests cover:
//! - Multi-stage composition with expanding and aggregating stages
//! - End-of-input propagation through the chain
//! - First-error selection by order of occurrence
//! - Teardown when an early stage fails mid-stream
//! - Throughput through small inter-stage buffers

use std::time::Duration;
use taskmill::pipeline::{FnStage, MapStage, Pipeline};
use taskmill::Error;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

// ============================================================================
// Composition Tests
// ============================================================================

#[tokio::test]
async fn test_expanding_stage_feeds_downstream_map() {
    let mut pipeline = Pipeline::new();
    pipeline
        .add_stage(FnStage::new(
            "duplicate",
            |mut input: mpsc::Receiver<u32>, output: mpsc::Sender<u32>| async move {
                while let Some(item) = input.recv().await {
                    for _ in 0..2 {
                        if output.send(item).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok(())
            },
        ))
        .add_stage(MapStage::new("add_ten", |x: u32| x + 10));

    let out = assert_ok!(pipeline.process(vec![1, 2, 3], 4).await);
    assert_eq!(out, vec![11, 11, 12, 12, 13, 13]);
}

#[tokio::test]
async fn test_aggregating_stage_sees_end_of_input() {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(FnStage::new(
        "sum",
        |mut input: mpsc::Receiver<u32>, output: mpsc::Sender<u32>| async move {
            let mut total = 0;
            // recv returns None once the upstream sender is dropped, which is
            // the only end-of-input signal a stage gets.
            while let Some(item) = input.recv().await {
                total += item;
            }
            let _ = output.send(total).await;
            Ok(())
        },
    ));

    let out = assert_ok!(pipeline.process(vec![1, 2, 3, 4], 2).await);
    assert_eq!(out, vec![10]);
}

#[tokio::test]
async fn test_three_stage_chain_through_tiny_buffers() {
    let mut pipeline = Pipeline::new();
    pipeline
        .add_stage(MapStage::new("increment", |x: u64| x + 1))
        .add_stage(MapStage::new("double", |x: u64| x * 2))
        .add_stage(MapStage::new("offset", |x: u64| x - 3));

    let input: Vec<u64> = (10..1010).collect();
    let expected: Vec<u64> = input.iter().map(|x| (x + 1) * 2 - 3).collect();

    let out = assert_ok!(pipeline.process(input, 2).await);
    assert_eq!(out, expected);
}

// ============================================================================
// Error Propagation Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_first_error_selected_by_occurrence_not_position() {
    // The earlier stage fails late (after consuming input and sleeping), the
    // later stage fails the moment it is polled. The later stage's error
    // occurs first and must win.
    let mut pipeline = Pipeline::new();
    pipeline
        .add_stage(FnStage::new(
            "late_failure",
            |mut input: mpsc::Receiver<u32>, _output: mpsc::Sender<u32>| async move {
                let _ = input.recv().await;
                let _ = input.recv().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(Error::internal("late failure"))
            },
        ))
        .add_stage(FnStage::new(
            "early_failure",
            |_input: mpsc::Receiver<u32>, _output: mpsc::Sender<u32>| async move {
                Err(Error::internal("early failure"))
            },
        ));

    let err = pipeline.process((0..10).collect(), 1).await.unwrap_err();
    assert_eq!(err.to_string(), "early failure");
}

#[tokio::test]
async fn test_head_stage_failure_unwinds_large_feed() {
    // The first stage rejects the stream outright. The feeder must notice the
    // closed channel and bail instead of blocking on a full buffer.
    let mut pipeline = Pipeline::new();
    pipeline
        .add_stage(FnStage::new(
            "reject",
            |_input: mpsc::Receiver<u64>, _output: mpsc::Sender<u64>| async move {
                Err(Error::internal("rejected"))
            },
        ))
        .add_stage(MapStage::new("identity", |x: u64| x));

    let err = pipeline.process((0..10_000).collect(), 1).await.unwrap_err();
    assert_eq!(err.to_string(), "rejected");
}

#[tokio::test]
async fn test_mid_stream_failure_returns_error_not_partial_output() {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(FnStage::new(
        "fail_at_five",
        |mut input: mpsc::Receiver<u32>, output: mpsc::Sender<u32>| async move {
            while let Some(item) = input.recv().await {
                if item == 5 {
                    return Err(Error::internal("hit the poison item"));
                }
                if output.send(item).await.is_err() {
                    break;
                }
            }
            Ok(())
        },
    ));

    let err = pipeline.process((0..100).collect(), 4).await.unwrap_err();
    assert_eq!(err.to_string(), "hit the poison item");
}
