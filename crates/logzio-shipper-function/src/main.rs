// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Producer adapter: reads Event Hub messages from stdin and ships them.
//!
//! Each non-blank line is one raw message. A blank line, or end of input, closes
//! the current invocation and runs it through the pipeline.

use anyhow::Context;
use std::future::Future;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logzio_shipper::config::Config;
use logzio_shipper::logger::Formatter;
use logzio_shipper::shipper::Shipper;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid shipper configuration")?;

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).context("could not parse log level")?)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let shipper = Shipper::from_config(&config)
        .await
        .context("failed to start shipper")?;

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupts, running until end of input: {e}");
            std::future::pending::<()>().await;
        }
    };
    pump(BufReader::new(tokio::io::stdin()), interrupted, |messages| {
        run_invocation(&shipper, messages)
    })
    .await;

    let summary = shipper.shutdown().await;
    info!(
        uploaded = summary.uploaded,
        failed = summary.failed,
        "Shipper stopped"
    );
    Ok(())
}

/// Groups input lines into invocations and hands each one to `run`.
///
/// The `shutdown` future is polled for the whole session, so an interrupt that
/// arrives while an invocation is running still stops the loop. Lines already
/// collected are run before returning.
async fn pump<R, S, F, Fut>(reader: R, shutdown: S, mut run: F)
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut lines = reader.lines();
    let mut invocation: Vec<String> = Vec::new();
    tokio::pin!(shutdown);

    loop {
        let next = tokio::select! {
            biased;
            () = &mut shutdown => {
                info!("Interrupt received, shutting down");
                break;
            }
            line = lines.next_line() => line,
        };

        match next {
            Ok(Some(line)) if line.trim().is_empty() => {
                if !invocation.is_empty() {
                    run(std::mem::take(&mut invocation)).await;
                }
            }
            Ok(Some(line)) => invocation.push(line),
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read from stdin: {e}");
                break;
            }
        }
    }

    if !invocation.is_empty() {
        run(invocation).await;
    }
}

async fn run_invocation(shipper: &Shipper, messages: Vec<String>) {
    if let Err(e) = shipper.process(&messages).await {
        error!("Invocation of {} messages was not processed: {e}", messages.len());
    }
}
