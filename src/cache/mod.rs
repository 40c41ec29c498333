// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod intern;
pub mod relevance;
pub mod state_index;

pub use intern::InternPool;
pub use relevance::RelevanceFilter;
pub use state_index::{CompactRecord, CompactStateIndex};
