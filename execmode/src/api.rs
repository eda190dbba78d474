//! The demo routes.
//!
//! One route per execution style: synchronous, delayed, outbound request,
//! logged pipeline, endless stream, and the same blocking body on both
//! pools.

use std::sync::Arc;

use serde_json::Value;

use crate::dispatch::{ExecutionMode, HandlerRegistry, Reply, Request};
use crate::errors::{ExecError, ExecResult};
use crate::multi::Multi;
use crate::options::ExecmodeOptions;
use crate::outbound::OutboundClient;
use crate::uni::Uni;

const GREETING: &str = "Hello!";
const WOOPS: &str = "Woops";

pub fn register_routes(
    registry: &HandlerRegistry,
    options: &ExecmodeOptions,
    client: Arc<dyn OutboundClient>,
) -> ExecResult<()> {
    let delay = options.api.delay();
    let tick_interval = options.api.tick_interval();

    registry.register("hello", ExecutionMode::EventLoop, |_: &Request| -> ExecResult<Reply> {
        tracing::info!("hello");
        Ok(GREETING.into())
    })?;

    registry.register(
        "async-hello",
        ExecutionMode::EventLoop,
        move |_: &Request| -> ExecResult<Reply> {
            tracing::info!("async-hello");
            let uni = Uni::item(GREETING.to_string())
                .on_item()
                .delay_it()
                .by(delay)
                .on_item()
                .invoke(|item| tracing::info!("Delayed item: {}", item));
            Ok(uni.into())
        },
    )?;

    let outbound = options.outbound.clone();
    registry.register(
        "async-request",
        ExecutionMode::EventLoop,
        move |_: &Request| -> ExecResult<Reply> {
            tracing::info!("async-request");
            let client = Arc::clone(&client);
            let path = outbound.joke_path.clone();
            let timeout = outbound.timeout();
            let uni = Uni::from_future(move || async move {
                client
                    .get(&path, &[("Accept", "application/json")], timeout)
                    .await
            })
            .on_item()
            .try_transform(joke_text)
            .on_failure()
            .recover_with_item(outbound.fallback.clone());
            Ok(uni.into())
        },
    )?;

    registry.register("log", ExecutionMode::EventLoop, move |_: &Request| -> ExecResult<Reply> {
        tracing::info!("log");
        let uni = Uni::item(GREETING.to_string())
            .log("step-1")
            .on_item()
            .delay_it()
            .by(delay)
            .on_item()
            .transform(|s| s.to_uppercase())
            .log("step-2");
        Ok(uni.into())
    })?;

    registry.register(
        "stream-log",
        ExecutionMode::EventLoop,
        move |_: &Request| -> ExecResult<Reply> {
            tracing::info!("stream-log");
            let multi = Multi::ticks()
                .every(tick_interval)
                .on_item()
                .transform(|n| format!("tick #{}", n))
                .log("stream");
            Ok(multi.into())
        },
    )?;

    let wait_for_woops = move |request: &Request| -> ExecResult<Reply> {
        tracing::info!("{}", request.route());
        let woops = Uni::item(WOOPS.to_string())
            .on_item()
            .delay_it()
            .by(delay)
            .await_blocking()
            .with_context(request.context())
            .indefinitely()?;
        Ok(woops.into())
    };
    registry.register("dont-block", ExecutionMode::EventLoop, wait_for_woops)?;
    registry.register("can-block", ExecutionMode::Blocking, wait_for_woops)?;

    Ok(())
}

fn joke_text(json: Value) -> ExecResult<String> {
    json.get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ExecError::Upstream("joke response has no \"value\" field".into()))
}
