//! Local lane execution command.

use super::runtime;
use anyhow::{Context, Result};
use greenlight_config::RuntimeSettings;
use greenlight_core::executor::LogStream;
use greenlight_core::pipeline::{ApprovalDecision, CommitEvent, LaneState};
use greenlight_scheduler::PipelineEvent;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Provision the stack and run one lane for a commit, streaming its events.
pub async fn run_lane(
    path: &str,
    settings: &RuntimeSettings,
    lane: &str,
    commit: &str,
    auto_approve: bool,
) -> Result<()> {
    let runtime = runtime(path, settings).await?;

    let pipeline = runtime
        .topology
        .pipeline(lane)
        .with_context(|| format!("No pipeline named '{}'", lane))?;
    let repository = pipeline
        .source_repositories()
        .first()
        .map(|r| r.to_string())
        .with_context(|| format!("Pipeline '{}' has no source stage", lane))?;

    println!("Running lane: {} ({} @ {})", lane, repository, commit);
    println!("\n--- Starting lane ---\n");

    let start = runtime
        .orchestrator
        .start_lane(lane, CommitEvent::new(repository, commit))?;
    let handle = start.handle;
    let mut events = start.events;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::LaneStarted { run_id, .. } => {
                println!("Run {}", run_id);
            }
            PipelineEvent::StageStarted { stage, kind, .. } => {
                println!("▶ Stage '{}' ({}) started", stage, kind);
            }
            PipelineEvent::BuildLog { job, line, .. } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!("  [{}]{} {}", job, stream_marker, line.content);
            }
            PipelineEvent::BuildCompleted { job, artifact, .. } => match artifact {
                Some(artifact) => println!("  [{}] built {}", job, artifact.image()),
                None => println!("  [{}] built", job),
            },
            PipelineEvent::ApprovalRequested { gate, .. } => {
                let decision = if auto_approve {
                    println!("⏸ Gate '{}' auto-approved", gate);
                    ApprovalDecision::Approved {
                        by: Some("cli".to_string()),
                    }
                } else {
                    ask(&gate, &mut stdin).await?
                };
                handle.decide(decision)?;
            }
            PipelineEvent::ApprovalReceived { gate, decision, .. } => match decision {
                ApprovalDecision::Approved { .. } => println!("✓ Gate '{}' approved", gate),
                ApprovalDecision::Rejected { .. } => println!("✗ Gate '{}' rejected", gate),
            },
            PipelineEvent::Promoted { job, decision, .. } => {
                println!("  [{}] promoted: {:?}", job, decision);
            }
            PipelineEvent::StageCompleted { stage, .. } => {
                println!("✓ Stage '{}' completed\n", stage);
            }
            PipelineEvent::LaneCompleted { state, .. } => {
                println!("--- Lane finished: {} ---", state);
            }
        }
    }

    let run = start.run.await.context("Lane task failed")?;

    println!("\n--- Stage Summary ---");
    for stage in &run.completed_stages {
        println!("  {} - ✓ completed", stage);
    }

    match run.state {
        LaneState::Done => {
            println!("\n✓ Lane succeeded!");
            Ok(())
        }
        state => anyhow::bail!("Lane {}", state),
    }
}

async fn ask<R>(gate: &str, stdin: &mut tokio::io::Lines<R>) -> Result<ApprovalDecision>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    println!("⏸ Gate '{}' is waiting. Approve? [y/N]", gate);
    let answer = stdin.next_line().await?.unwrap_or_default();
    Ok(match answer.trim() {
        "y" | "Y" | "yes" => ApprovalDecision::Approved {
            by: Some("cli".to_string()),
        },
        _ => ApprovalDecision::Rejected {
            by: Some("cli".to_string()),
            reason: None,
        },
    })
}
