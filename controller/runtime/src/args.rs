use crate::{
    admission::Admission,
    apply::{KubeCluster, Pipeline, Settle},
    backoff::Backoff,
    core::Engine,
    form, lease, node,
    status::{FormMetrics, KubeEvents, NodeMetrics, RetryPolicy},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

const CONTROLLER_NAME: &str = "lynq-controller";
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[clap(name = "lynq", about = "A multi-tenant resource orchestrator")]
pub struct Args {
    #[clap(long, default_value = "lynq=info,warn", env = "LYNQ_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "LYNQ_CONTROLLER_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long, env = "LYNQ_ADMISSION_CONTROLLER_DISABLED")]
    admission_controller_disabled: bool,

    #[clap(long, default_value = "lynq-system", env = "LYNQ_CONTROLLER_NAMESPACE")]
    controller_namespace: String,

    #[clap(
        long,
        default_value = "lynq-controller",
        env = "LYNQ_CONTROLLER_DEPLOYMENT_NAME"
    )]
    controller_deployment_name: String,

    /// Nodes reconciled at once.
    #[clap(long, default_value = "10", env = "LYNQ_NODE_CONCURRENCY")]
    node_concurrency: u16,

    /// Forms reconciled at once.
    #[clap(long, default_value = "2", env = "LYNQ_FORM_CONCURRENCY")]
    form_concurrency: u16,

    /// Resync period for settled nodes and forms.
    #[clap(long, default_value = "30", env = "LYNQ_REQUEUE_INTERVAL_SECS")]
    requeue_interval_secs: u64,

    /// Resync period while resources wait for readiness.
    #[clap(long, default_value = "5", env = "LYNQ_READINESS_POLL_SECS")]
    readiness_poll_secs: u64,

    /// How long a pass may wait in place for a written resource to become
    /// ready. Zero leaves waiting to the readiness poll.
    #[clap(long, default_value = "0", env = "LYNQ_READINESS_SETTLE_SECS")]
    readiness_settle_secs: u64,

    #[clap(long, default_value = "lynq", env = "LYNQ_FIELD_MANAGER")]
    field_manager: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            controller_namespace,
            controller_deployment_name,
            node_concurrency,
            form_concurrency,
            requeue_interval_secs,
            readiness_poll_secs,
            readiness_settle_secs,
            field_manager,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let requeue = Duration::from_secs(requeue_interval_secs);
        let readiness_poll = Duration::from_secs(readiness_poll_secs);

        let mut prom = <Registry>::default();
        let node_metrics = NodeMetrics::register(prom.sub_registry_with_prefix("lynqnode"));
        let form_metrics = FormMetrics::register(prom.sub_registry_with_prefix("lynqform"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to read the HOSTNAME environment variable")?;

        let leadership = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        let client = runtime.client();
        let events = Arc::new(KubeEvents::new(client.clone(), CONTROLLER_NAME, &hostname));

        let cluster = Arc::new(KubeCluster::new(client.clone(), field_manager.clone()));
        let pipeline = Pipeline::new(cluster, Engine::new()).with_settle(Settle {
            timeout: Duration::from_secs(readiness_settle_secs),
            interval: readiness_poll,
        });

        let nodes = Arc::new(node::Context {
            client: client.clone(),
            pipeline,
            events: events.clone(),
            metrics: node_metrics,
            leadership: leadership.clone(),
            field_manager: field_manager.clone(),
            requeue,
            readiness_poll,
            retry: RetryPolicy::default(),
            backoff: Backoff::new(readiness_poll, MAX_BACKOFF),
        });
        tokio::spawn(node::run(nodes, node_concurrency).instrument(info_span!("lynqnodes")));

        let forms = Arc::new(form::Context {
            client,
            engine: Engine::new(),
            events,
            metrics: form_metrics,
            leadership,
            field_manager,
            requeue,
            rollout_poll: readiness_poll,
            retry: RetryPolicy::default(),
            backoff: Backoff::new(readiness_poll, MAX_BACKOFF),
        });
        tokio::spawn(form::run(forms, form_concurrency).instrument(info_span!("lynqforms")));

        info!(%hostname, node_concurrency, form_concurrency, "Controllers started");
        let runtime = runtime.spawn_server(Admission::new);

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
