// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Logz.io Event Hub shipper
//!
//! Forwards bursts of log events to a Logz.io listener without silently losing
//! any of them. Events that cannot be delivered after bounded retries are staged
//! to local files and later uploaded to an object store.
//!
//! ## Pipeline
//!
//! ```text
//!   Producer burst (NDJSON messages)
//!          │
//!          v
//!   ┌──────────────┐
//!   │  Normalizer  │  (flatten `records`, add `@timestamp`, prune empties)
//!   └──────┬───────┘
//!          v
//!   ┌──────────────┐
//!   │  Assembler   │  (seal by count or age)
//!   └──────┬───────┘
//!          v
//!   ┌──────────────┐
//!   │ Worker pool  │  (POST with retry and backoff)
//!   └──────┬───────┘
//!          │ retries exhausted
//!          v
//!   ┌──────────────┐        ┌──────────────┐
//!   │ BackupStore  │ ─────> │ Object store │  (flush at end of cycle)
//!   └──────────────┘        └──────────────┘
//! ```
//!
//! - [`normalizer`]: envelope flattening and field normalization
//! - [`aggregator`]: batch assembly
//! - [`flusher`]: delivery worker pool and retry policy
//! - [`backup`]: local staging with rotation and upload queue
//! - [`object_store`]: sinks for staged files
//! - [`shipper`]: per-invocation orchestration and shutdown

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod backup;
pub mod config;
pub mod constants;
pub mod error;
pub mod flusher;
pub mod http_utils;
pub mod logger;
pub mod normalizer;
pub mod object_store;
pub mod shipper;
