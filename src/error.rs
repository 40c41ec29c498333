// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use kube_core::ErrorResponse;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Write conflict on {0}, object changed since it was read")]
    Conflict(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Object already exists: {0}")]
    AlreadyExists(String),
    #[error("Kubernetes API request on {0} failed: {1}")]
    Kube(String, #[source] kube::Error),
    #[error("Failed to serialize patch: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Maps a kube-rs error onto the taxonomy the reconciler cares about.
    /// `target` names the object the request was about and ends up in the message.
    pub fn from_kube(target: impl Into<String>, err: kube::Error) -> Error {
        let target = target.into();
        match &err {
            kube::Error::Api(ErrorResponse { reason, .. }) if reason == "Conflict" => {
                Error::Conflict(target)
            }
            kube::Error::Api(ErrorResponse { reason, .. }) if reason == "NotFound" => {
                Error::NotFound(target)
            }
            kube::Error::Api(ErrorResponse { reason, .. }) if reason == "AlreadyExists" => {
                Error::AlreadyExists(target)
            }
            _ => Error::Kube(target, err),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
