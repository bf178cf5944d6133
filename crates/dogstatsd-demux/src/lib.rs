// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod demultiplexer;
pub mod errors;
pub mod forwarder;
pub mod logger;
pub mod metric;
pub mod pool;
pub mod sampler;
pub mod serializer;
pub mod series_sink;
pub mod tags_store;
pub mod worker;
