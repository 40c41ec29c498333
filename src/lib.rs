// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod cache;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod lock_request;
pub mod memory;
pub mod metrics;
pub mod quota;
pub mod scanner;
pub mod shutdown;
pub mod types;
pub mod worker;


pub use error::{Error, Result};
