// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use nslock::config::ControllerConfig;
use nslock::controller;
use nslock::types::LockRequest;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nslock-controller", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the LockRequest custom resource definition.
    Export,
    /// Run the controller against the current kubeconfig context.
    Run(ControllerConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Export => {
            println!("{}", serde_yaml::to_string(&LockRequest::crd())?);
        }
        Command::Run(config) => {
            info!("running nslock-controller");
            controller::run(config).await?;
        }
    }
    Ok(())
}
