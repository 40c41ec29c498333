// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::engine::Dispatcher;
use crate::error::{Error, Result};
use crate::types::*;
use crate::worker::lock_expiry_after;
use chrono::{SecondsFormat, Utc};
use std::time::Duration;
use tracing::{debug, info};

pub const CONVERGED_CONDITION: &str = "Converged";

/// Result of handling one LockRequest.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRequestOutcome {
    pub status: LockRequestStatus,
    /// Whether a namespace write hit a stale resource version.
    pub conflicted: bool,
}

impl LockRequestOutcome {
    pub fn converged(&self) -> bool {
        !self.conflicted
            && self.status.missing_targets.is_empty()
            && self.status.converged_targets == self.status.observed_targets
    }
}

/// Applies a LockRequest by writing the requested status onto each target
/// namespace and handing the targets to the dispatcher. The namespaces then
/// converge through the regular reconcile path. Requests are never deleted.
pub struct LockRequestHandler {
    dispatcher: Dispatcher,
}

impl LockRequestHandler {
    pub fn new(dispatcher: Dispatcher) -> LockRequestHandler {
        LockRequestHandler { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn handle(&self, request: &LockRequest) -> Result<LockRequestOutcome> {
        let name = request
            .metadata
            .name
            .as_deref()
            .ok_or(Error::MissingObjectKey("metadata.name"))?;
        let ctx = self.dispatcher.engine().context();
        let spec = &request.spec;

        for target in spec.namespace_names.iter() {
            ctx.filter.insert(ctx.interner.intern(target));
        }

        let mut conflicted = false;
        for target in spec.namespace_names.iter() {
            match self.declare(target, spec).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    debug!(lock_request = %name, namespace = %target, "Namespace changed, will retry");
                    conflicted = true;
                }
                Err(e) => return Err(e),
            }
        }
        for target in spec.namespace_names.iter() {
            self.dispatcher.submit(target);
        }

        let mut status = self.observe(spec).await?;
        let mut outcome = LockRequestOutcome {
            status: status.clone(),
            conflicted,
        };
        status.conditions = vec![converged_condition(
            request.status.as_ref(),
            outcome.converged(),
            &status,
        )];
        ctx.metrics.api_call();
        ctx.cluster.patch_lock_request_status(name, &status).await?;
        outcome.status = status;
        Ok(outcome)
    }

    // Writes the requested label onto one namespace. Returns whether it changed.
    async fn declare(&self, target: &str, spec: &LockRequestSpec) -> Result<bool> {
        let ctx = self.dispatcher.engine().context();
        ctx.metrics.api_call();
        let ns = match ctx.cluster.get_namespace(target).await? {
            Some(ns) => ns,
            None => return Ok(false),
        };
        let wanted = spec.action.label_value();
        if ns.status_label() == Some(wanted) {
            return Ok(false);
        }
        let mut patch = MergePatch::guarded_by(&ns.resource_version).set_label(STATUS_LABEL, wanted);
        if spec.action == LockAction::Lock {
            if let Some(reason) = &spec.reason {
                patch = patch.set_annotation(LOCK_REASON_ANNOTATION, reason.as_str());
            }
            if let Some(operator) = &spec.operator {
                patch = patch.set_annotation(LOCK_OPERATOR_ANNOTATION, operator.as_str());
            }
            match spec.duration_seconds {
                Some(secs) if secs > 0 && !ns.has_expiry_annotation() => {
                    let expiry = lock_expiry_after(Duration::from_secs(secs as u64))?;
                    patch = patch.set_annotation(LOCK_EXPIRY_ANNOTATION, expiry);
                }
                _ => {}
            }
        }
        ctx.metrics.api_call();
        ctx.cluster.patch_namespace(target, &patch).await?;
        info!(namespace = %target, status = wanted, "Applied lock request to namespace");
        Ok(true)
    }

    /// Counts targets that exist, that have converged and that are missing.
    pub async fn observe(&self, spec: &LockRequestSpec) -> Result<LockRequestStatus> {
        let ctx = self.dispatcher.engine().context();
        let wanted = spec.action.label_value();
        let want_quota = spec.action == LockAction::Lock;
        let mut status = LockRequestStatus::default();
        for target in spec.namespace_names.iter() {
            ctx.metrics.api_call();
            let ns = match ctx.cluster.get_namespace(target).await? {
                Some(ns) => ns,
                None => {
                    status.missing_targets.push(target.clone());
                    continue;
                }
            };
            status.observed_targets += 1;
            if ns.status_label() != Some(wanted) {
                continue;
            }
            ctx.metrics.api_call();
            if ctx.cluster.quota_exists(target, DENY_ALL_QUOTA_NAME).await? == want_quota {
                status.converged_targets += 1;
            }
        }
        Ok(status)
    }
}

// Keeps the previous transition time when the condition did not flip.
fn converged_condition(
    previous: Option<&LockRequestStatus>,
    converged: bool,
    status: &LockRequestStatus,
) -> LockRequestCondition {
    let value = if converged { "True" } else { "False" };
    let (reason, message) = if converged {
        (
            "AllTargetsConverged",
            format!("{} namespaces converged", status.converged_targets),
        )
    } else if !status.missing_targets.is_empty() {
        (
            "TargetsMissing",
            format!("missing namespaces: {}", status.missing_targets.join(", ")),
        )
    } else {
        (
            "InProgress",
            format!(
                "{} of {} namespaces converged",
                status.converged_targets, status.observed_targets
            ),
        )
    };
    let last_transition_time = previous
        .and_then(|p| p.conditions.iter().find(|c| c.type_ == CONVERGED_CONDITION))
        .filter(|c| c.status == value)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
    LockRequestCondition {
        type_: CONVERGED_CONDITION.to_string(),
        status: value.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    }
}
