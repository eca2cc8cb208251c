//! Two-lane stack shared by the scheduler tests.

use greenlight_config::{Topology, parse_topology};
use greenlight_provisioner::{GraphBuilder, ProvisionReport, Provisioner, SimulatedProvider};
use std::sync::Arc;

pub(crate) const TWO_LANES: &str = r#"
    stack "demo"

    resource "vpc" kind="network"
    resource "cluster" kind="compute-cluster" {
        input "vpc_id" from="vpc.id"
    }
    resource "ecr-front" kind="registry"
    resource "ecr-back" kind="registry"
    resource "repo-front" kind="source-repo"
    resource "repo-back" kind="source-repo"

    build "build-front" source="repo-front" {
        image "greenlight/build:latest"
        privileged #true
        env "CLUSTER_NAME" from="cluster.name"
        env "ECR_REPO_URI" from="ecr-front.uri"
        env "LANE" "${lane.name}/${commit.short_id}"
        phase "build" {
            run "docker build -t $ECR_REPO_URI:$TAG ."
            run "echo ${stack.name}"
        }
        promote target="rolling-front" registry="ecr-front"
    }
    build "build-back" source="repo-back" {
        image "greenlight/build:latest"
        env "ECR_REPO_URI" from="ecr-back.uri"
        phase "build" {
            run "docker build -t $ECR_REPO_URI:$TAG ."
        }
        promote target="rolling-back" registry="ecr-back"
    }

    grant "build-front" resource="ecr-front" capability="pull-push"
    grant "build-front" resource="cluster" capability="cluster-admin"
    grant "build-back" resource="ecr-back" capability="pull-push"
    grant "build-back" resource="cluster" capability="cluster-admin"

    trigger "repo-front" build="build-front"
    trigger "repo-back" build="build-back"

    pipeline "front" {
        stage "Source" {
            source "repo-front"
        }
        stage "BuildAndDeploy" {
            build "build-front"
        }
        stage "ApproveSwapBG" {
            approval "Approve"
        }
        stage "SwapBG" {
            promote "build-front"
        }
    }
    pipeline "back" {
        stage "Source" {
            source "repo-back"
        }
        stage "BuildAndDeploy" {
            build "build-back"
        }
        stage "ApproveSwapBG" {
            approval "Approve"
        }
        stage "SwapBG" {
            promote "build-back"
        }
    }
"#;

pub(crate) async fn provisioned_with(
    provider: SimulatedProvider,
) -> (Arc<Topology>, Arc<ProvisionReport>) {
    let topology = parse_topology(TWO_LANES).unwrap();
    let plan = GraphBuilder::from_topology(&topology)
        .unwrap()
        .build()
        .unwrap();
    let report = Provisioner::new(Arc::new(provider)).provision(plan).await;
    (Arc::new(topology), Arc::new(report))
}

pub(crate) async fn provisioned() -> (Arc<Topology>, Arc<ProvisionReport>) {
    let (topology, report) = provisioned_with(SimulatedProvider::new()).await;
    assert!(report.is_success());
    (topology, report)
}
