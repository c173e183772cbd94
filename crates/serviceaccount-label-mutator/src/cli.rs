use std::path::PathBuf;

use clap::{Args, Parser};
use mutator_telemetry::tracing::TelemetryOptions;
use mutator_webhook::{
    WebhookRegistration,
    constants::{
        DEFAULT_HTTPS_PORT, DEFAULT_MUTATING_WEBHOOK_CONFIGURATION_NAME,
        DEFAULT_WEBHOOK_SERVICE_PORT,
    },
};

use crate::{
    identity::cache::{DEFAULT_CACHE_TTL, DEFAULT_LOOKUP_TIMEOUT},
    policy::{EchoRule, Label},
};

pub const DEFAULT_CERT_DIR: &str = "/etc/webhook/certs";

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(author, version, about)]
pub enum Command {
    /// Issue certificates, register the webhook and serve admission reviews.
    Run(RunArguments),

    /// Print the MutatingWebhookConfiguration (without CA bundle) as YAML.
    PrintWebhookConfiguration(WebhookArguments),
}

/// Where the API server finds the webhook.
#[derive(Debug, PartialEq, Eq, Args)]
pub struct WebhookArguments {
    /// Name of the Kubernetes Service in front of the webhook.
    #[arg(long, env, default_value = "webhook-server")]
    pub webhook_service_name: String,

    /// Namespace of the Kubernetes Service in front of the webhook.
    #[arg(long, env, default_value = "webhook-demo")]
    pub webhook_namespace: String,

    /// Port of the Kubernetes Service in front of the webhook.
    #[arg(long, env, default_value_t = DEFAULT_WEBHOOK_SERVICE_PORT)]
    pub webhook_service_port: u16,

    /// Name of the MutatingWebhookConfiguration object.
    #[arg(long, env, default_value = DEFAULT_MUTATING_WEBHOOK_CONFIGURATION_NAME)]
    pub webhook_configuration_name: String,
}

impl WebhookArguments {
    /// The registration for these arguments, with the given CA bundle.
    pub fn registration(&self, ca_bundle: Vec<u8>) -> WebhookRegistration {
        WebhookRegistration::builder()
            .configuration_name(self.webhook_configuration_name.as_str())
            .service_name(self.webhook_service_name.as_str())
            .service_namespace(self.webhook_namespace.as_str())
            .service_port(self.webhook_service_port)
            .ca_bundle(ca_bundle)
            .build()
    }
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// Directory the CA certificate, serving certificate and key are written to.
    #[arg(long, env, default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,

    /// Port the HTTPS server listens on.
    #[arg(long, env, default_value_t = DEFAULT_HTTPS_PORT)]
    pub https_port: u16,

    /// Do not create or update the MutatingWebhookConfiguration.
    #[arg(long, env)]
    pub disable_webhook_registration: bool,

    /// Subscription whose user-assigned managed identities are searched.
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub azure_subscription_id: Option<String>,

    /// Upper bound for a single managed identity lookup.
    #[arg(long, env, default_value_t = DEFAULT_LOOKUP_TIMEOUT.into())]
    pub identity_lookup_timeout: humantime::Duration,

    /// How long resolved client IDs are remembered, `0s` disables this.
    #[arg(long, env, default_value_t = DEFAULT_CACHE_TTL.into())]
    pub identity_cache_ttl: humantime::Duration,

    /// Label (`KEY=VALUE`) which triggers the static label echo.
    #[arg(long, env, requires = "echo_label")]
    pub echo_trigger_label: Option<Label>,

    /// Label (`KEY=VALUE`) added to ServiceAccounts carrying the trigger label.
    #[arg(long, env, requires = "echo_trigger_label")]
    pub echo_label: Option<Label>,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub webhook: WebhookArguments,

    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

impl RunArguments {
    pub fn echo_rule(&self) -> Option<EchoRule> {
        match (&self.echo_trigger_label, &self.echo_label) {
            (Some(trigger), Some(label)) => Some(EchoRule {
                trigger: trigger.clone(),
                label: label.clone(),
            }),
            _ => None,
        }
    }
}
