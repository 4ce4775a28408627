use crate::{admission::Admission, metrics::AdmissionMetrics, policy::LabelPolicy};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use prometheus_client::registry::Registry;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "label-webhook",
    about = "Admission webhook that enforces workload labels"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "label_webhook=info,warn",
        env = "LABEL_WEBHOOK_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "LABEL_WEBHOOK_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The resource kind admitted by the webhook. Requests for any other kind
    /// are rejected.
    #[clap(long, default_value = "Pod", env = "LABEL_WEBHOOK_TARGET_KIND")]
    target_kind: String,

    /// Label that must be present for an object to pass validation.
    #[clap(long, default_value = "teacher", env = "LABEL_WEBHOOK_REQUIRED_LABEL")]
    required_label: String,

    /// Label set by the mutating webhook.
    #[clap(
        long,
        default_value = "super-teacher",
        env = "LABEL_WEBHOOK_INJECTED_LABEL_KEY"
    )]
    injected_label_key: String,

    /// Value enforced for the injected label.
    #[clap(
        long,
        default_value = "Drewbernetes",
        env = "LABEL_WEBHOOK_INJECTED_LABEL_VALUE"
    )]
    injected_label_value: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            target_kind,
            required_label,
            injected_label_key,
            injected_label_value,
        } = self;

        let policy = LabelPolicy {
            target_kind,
            required_label,
            injected_label_key,
            injected_label_value,
        };

        let mut prom = <Registry>::default();
        let metrics = AdmissionMetrics::register(prom.sub_registry_with_prefix("label_webhook"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        info!(?policy, "Admitting objects");

        // Pods are decoded into their typed form; any other kind is policed
        // through its metadata only.
        let runtime = if policy.target_kind == <Pod as k8s_openapi::Resource>::KIND {
            runtime.spawn_server(Admission::<Pod>::new(policy, metrics))
        } else {
            runtime.spawn_server(Admission::<DynamicObject>::new(policy, metrics))
        };

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // in-flight admission requests to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
