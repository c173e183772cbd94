use std::{sync::Arc, time::Duration};

use clap::Parser;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use kube::Api;
use mutator_certs::{TrustBundle, TrustBundleError};
use mutator_telemetry::Tracing;
use mutator_webhook::{
    Registrar, RegistrarError, WebhookError, WebhookServer, WebhookServerOptions,
};
use serviceaccount_label_mutator::{
    cli::{Command, RunArguments, WebhookArguments},
    context::ServiceContext,
    handler,
    identity::{
        ArmIdentityResolver, CachingResolver, DefaultCredentialChain, IdentityResolver,
        Unconfigured, azure::ArmError, credential::CredentialError,
    },
    policy::PolicySet,
};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "serviceaccount-label-mutator";

#[derive(Debug, Snafu)]
enum StartupError {
    #[snafu(display("failed to initialize tracing"))]
    InitializeTracing {
        source: mutator_telemetry::tracing::Error,
    },

    #[snafu(display("failed to issue certificates"))]
    IssueTrustBundle { source: TrustBundleError },

    #[snafu(display("certificate issuing task failed"))]
    JoinCertificateTask { source: tokio::task::JoinError },

    #[snafu(display("failed to write certificates"))]
    WriteTrustBundle { source: TrustBundleError },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateKubeClient { source: kube::Error },

    #[snafu(display("failed to register the webhook"))]
    RegisterWebhook { source: RegistrarError },

    #[snafu(display("failed to discover Azure credentials"))]
    DiscoverAzureCredentials { source: CredentialError },

    #[snafu(display("failed to create HTTP client"))]
    CreateHttpClient { source: reqwest::Error },

    #[snafu(display("failed to create managed identity resolver"))]
    CreateIdentityResolver { source: ArmError },

    #[snafu(display("failed to create webhook server"))]
    CreateWebhookServer { source: WebhookError },

    #[snafu(display("failed to run webhook server"))]
    RunWebhookServer { source: WebhookError },

    #[snafu(display("failed to print the webhook configuration"))]
    PrintWebhookConfiguration { source: serde_yaml::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), StartupError> {
    match Command::parse() {
        Command::Run(run) => {
            let _tracing_guard = Tracing::pre_configured(APP_NAME, run.telemetry.clone())
                .init()
                .context(InitializeTracingSnafu)?;

            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "starting {APP_NAME}"
            );

            run_webhook(run).await.inspect_err(|err| {
                let error: &(dyn std::error::Error + 'static) = err;
                tracing::error!(error, "startup failed, exiting");
            })
        }
        Command::PrintWebhookConfiguration(webhook) => print_webhook_configuration(&webhook),
    }
}

async fn run_webhook(run: RunArguments) -> Result<(), StartupError> {
    let webhook = &run.webhook;

    let service_name = webhook.webhook_service_name.clone();
    let namespace = webhook.webhook_namespace.clone();
    let trust_bundle =
        tokio::task::spawn_blocking(move || TrustBundle::issue(&service_name, &namespace))
            .await
            .context(JoinCertificateTaskSnafu)?
            .context(IssueTrustBundleSnafu)?;

    trust_bundle
        .write_to(&run.cert_dir)
        .await
        .context(WriteTrustBundleSnafu)?;

    register_webhook(
        webhook,
        trust_bundle.ca_bundle(),
        run.disable_webhook_registration,
    )
    .await?;

    let resolver = identity_resolver(
        run.azure_subscription_id.as_deref(),
        *run.identity_lookup_timeout,
        *run.identity_cache_ttl,
    )?;
    let context = ServiceContext::new(PolicySet::with_echo(run.echo_rule()), resolver);
    let router = handler::router(Arc::new(context));

    let options = WebhookServerOptions::builder()
        .bind_port(run.https_port)
        .tls_directory(&run.cert_dir)
        .build();

    WebhookServer::new(router, options)
        .await
        .context(CreateWebhookServerSnafu)?
        .run()
        .await
        .context(RunWebhookServerSnafu)
}

async fn register_webhook(
    webhook: &WebhookArguments,
    ca_bundle: &[u8],
    disabled: bool,
) -> Result<(), StartupError> {
    let registration = webhook.registration(ca_bundle.to_vec());

    let registrar = if disabled {
        Registrar::<Api<MutatingWebhookConfiguration>>::disabled()
    } else {
        let client = kube::Client::try_default()
            .await
            .context(CreateKubeClientSnafu)?;
        Registrar::new(Api::all(client))
    };

    let outcome = registrar
        .apply(&registration)
        .await
        .context(RegisterWebhookSnafu)?;
    tracing::info!(%outcome, "webhook registration applied");

    Ok(())
}

fn identity_resolver(
    subscription_id: Option<&str>,
    timeout: Duration,
    ttl: Duration,
) -> Result<Arc<dyn IdentityResolver>, StartupError> {
    let Some(subscription_id) = subscription_id else {
        tracing::warn!(
            "no Azure subscription configured, ServiceAccounts referencing a managed identity will be rejected"
        );
        return Ok(Arc::new(Unconfigured));
    };

    let http_client = reqwest::Client::builder()
        .build()
        .context(CreateHttpClientSnafu)?;
    let credential = DefaultCredentialChain::from_env(http_client.clone())
        .context(DiscoverAzureCredentialsSnafu)?;
    let resolver = ArmIdentityResolver::new(http_client, subscription_id, credential)
        .context(CreateIdentityResolverSnafu)?;

    Ok(Arc::new(CachingResolver::new(resolver, timeout, ttl)))
}

fn print_webhook_configuration(webhook: &WebhookArguments) -> Result<(), StartupError> {
    let configuration = webhook.registration(Vec::new()).to_configuration();
    serde_yaml::to_writer(std::io::stdout().lock(), &configuration)
        .context(PrintWebhookConfigurationSnafu)
}
