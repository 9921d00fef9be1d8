// Tests for step selection, failure policy, deadlines and streaming
use super::*;
use crate::error::ErrorCode;

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

fn math_step(name: &str, f: fn(i64) -> i64) -> Arc<dyn Step> {
    Arc::new(FuncStep::new(name, move |_ctx, input: Value| async move {
        input
            .as_i64()
            .map(|n| json!(f(n)))
            .ok_or_else(|| AgentError::new(ErrorCode::InvalidInput, "expected an integer"))
    }))
}

fn failing_step(name: &str) -> Arc<dyn Step> {
    Arc::new(FuncStep::new(name, |_ctx, _input| async {
        Err(AgentError::new(ErrorCode::ChainExecution, "step refused"))
    }))
}

fn counting_chain(calls: Arc<AtomicUsize>) -> BaseChain {
    let counter = calls.clone();
    BaseChain::new(
        "arith",
        vec![
            math_step("add_one", |n| n + 1),
            failing_step("broken"),
            Arc::new(FuncStep::new("double", move |_ctx, input: Value| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(input.as_i64().unwrap_or(0) * 2))
                }
            })),
        ],
    )
}

#[test]
fn test_only_steps_take_precedence() {
    let options = ChainOptions::default().with_skip_steps([1, 2]).with_only_steps([1, 3]);
    assert!(!options.should_skip(1));
    assert!(options.should_skip(2));
    assert!(!options.should_skip(3));

    let skip_only = ChainOptions::default().with_skip_steps([2]);
    assert!(!skip_only.should_skip(1));
    assert!(skip_only.should_skip(2));
}

#[tokio::test]
async fn test_run_all_steps() {
    let chain = BaseChain::new("arith", vec![math_step("add_one", |n| n + 1), math_step("triple", |n| n * 3)]);
    assert_eq!(chain.steps(), 2);

    let output = chain
        .invoke(&Context::background(), ChainInput::new(1))
        .await
        .unwrap();
    assert_eq!(output.status, ChainStatus::Success);
    assert_eq!(output.data, json!(6));
    assert_eq!(output.steps_executed.len(), 2);
    assert_eq!(output.steps_executed[1].input, json!(2));
    assert_eq!(output.steps_executed[1].step_number, 2);
    assert!(output.error.is_none());
}

#[tokio::test]
async fn test_stop_on_error_aborts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = counting_chain(calls.clone());
    let ctx = Context::background();

    let err = chain.invoke(&ctx, ChainInput::new(1)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ChainExecution);
    assert_eq!(err.context_value("index"), Some(&json!(1)));
    assert_eq!(err.context_value("step"), Some(&json!(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let output = chain.run(&ctx, ChainInput::new(1)).await;
    assert_eq!(output.status, ChainStatus::Failed);
    assert_eq!(output.steps_executed.len(), 2);
    assert!(!output.steps_executed[1].success);
    assert!(output.error.as_deref().unwrap().contains("step refused"));
}

#[tokio::test]
async fn test_continue_on_error_is_partial() {
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = counting_chain(calls.clone());
    let input = ChainInput::new(1).with_options(ChainOptions::default().with_stop_on_error(false));

    let output = chain.invoke(&Context::background(), input).await.unwrap();
    assert_eq!(output.status, ChainStatus::Partial);
    // the failed step's input flows on to the next one
    assert_eq!(output.data, json!(4));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(output.executed().filter(|e| e.success).count(), 2);
}

#[tokio::test]
async fn test_skipped_steps_are_recorded() {
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = counting_chain(calls);
    let input = ChainInput::new(5).with_options(ChainOptions::default().with_skip_steps([2]));

    let output = chain.invoke(&Context::background(), input).await.unwrap();
    assert_eq!(output.status, ChainStatus::Success);
    assert_eq!(output.data, json!(12));
    assert!(output.steps_executed[1].skipped);
    assert_eq!(output.steps_executed[1].step_name, "broken");
    assert_eq!(output.executed().count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_covers_whole_chain() {
    let slow: Arc<dyn Step> = Arc::new(FuncStep::new("slow", |_ctx, input: Value| async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok(input)
    }));
    let chain = BaseChain::new("slow", vec![slow.clone(), slow.clone(), slow]);
    let options = ChainOptions::default()
        .with_timeout(Duration::from_millis(100))
        .with_stop_on_error(false);

    let err = chain
        .invoke(&Context::background(), ChainInput::new(0).with_options(options.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ContextTimeout);
    assert_eq!(err.context_value("step"), Some(&json!(3)));

    let output = chain.run(&Context::background(), ChainInput::new(0).with_options(options)).await;
    assert_eq!(output.status, ChainStatus::Failed);
    assert_eq!(output.steps_executed.len(), 3);
}

#[tokio::test]
async fn test_step_panic_is_recorded() {
    let chain = BaseChain::new("fragile", Vec::new())
        .with_step(FuncStep::new("explode", |_ctx, input: Value| async move {
            let items = input.as_array().cloned().unwrap_or_default();
            Ok(items[3].clone())
        }))
        .with_step(FuncStep::new("never", |_ctx, input| async move { Ok(input) }));

    let output = chain.run(&Context::background(), ChainInput::new(json!([1]))).await;
    assert_eq!(output.status, ChainStatus::Failed);
    assert_eq!(output.steps_executed.len(), 1);
    assert!(output.steps_executed[0].error.as_deref().unwrap().contains("panic"));
}

#[tokio::test]
async fn test_stream_emits_snapshot_per_step() {
    let chain = BaseChain::new(
        "arith",
        vec![
            math_step("add_one", |n| n + 1),
            math_step("double", |n| n * 2),
            math_step("negate", |n| -n),
        ],
    );

    let chunks: Vec<_> = chain
        .stream(&Context::background(), ChainInput::new(1))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(chunks.len(), 3);
    assert!(chunks[..2].iter().all(|chunk| !chunk.done));
    assert!(chunks[2].done);

    let seen: Vec<(Value, usize)> = chunks
        .iter()
        .map(|chunk| {
            let output = chunk.data.as_ref().unwrap();
            (output.data.clone(), output.steps_executed.len())
        })
        .collect();
    assert_eq!(seen, vec![(json!(2), 1), (json!(4), 2), (json!(-4), 3)]);
}

#[tokio::test]
async fn test_stream_failure_ends_with_error_chunk() {
    let calls = Arc::new(AtomicUsize::new(0));
    let chunks: Vec<_> = counting_chain(calls)
        .stream(&Context::background(), ChainInput::new(1))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(chunks.len(), 2);
    let last = &chunks[1];
    assert!(last.done);
    assert_eq!(last.error.as_ref().unwrap().code, ErrorCode::ChainExecution);
    assert_eq!(last.data.as_ref().unwrap().status, ChainStatus::Failed);
}

#[tokio::test]
async fn test_batch_runs_each_input() {
    let chain = BaseChain::new("inc", vec![math_step("add_one", |n| n + 1)]);
    let outputs = chain
        .batch(
            &Context::background(),
            vec![ChainInput::new(1), ChainInput::new(10), ChainInput::new(100)],
        )
        .await
        .unwrap();
    let data: Vec<_> = outputs.into_iter().map(|o| o.data).collect();
    assert_eq!(data, vec![json!(2), json!(11), json!(101)]);
}

#[test]
fn test_pooled_input_is_reset() {
    let mut input = get_chain_input();
    input.data = json!("payload");
    input.vars.insert("k".into(), json!(1));
    input.options = ChainOptions::default().without_timeout().with_stop_on_error(false);
    input.options.extra.insert("trace".into(), json!(true));
    put_chain_input(input);

    let reused = get_chain_input();
    assert_eq!(reused.data, Value::Null);
    assert!(reused.vars.is_empty());
    assert!(reused.options.extra.is_empty());
    assert!(reused.options.stop_on_error);
    assert_eq!(reused.options.timeout, Some(DEFAULT_CHAIN_TIMEOUT));

    let mut output = get_chain_output();
    output.status = ChainStatus::Failed;
    output.error = Some("boom".into());
    put_chain_output(output);
    let reused = get_chain_output();
    assert_eq!(reused.status, ChainStatus::Success);
    assert!(reused.error.is_none());
}
