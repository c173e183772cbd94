//! One-shot registration of the mutating admission hook with the cluster.
//!
//! The [`Registrar`] creates the [`MutatingWebhookConfiguration`] or, if it
//! already exists, overwrites it with the desired state. It does not watch
//! the object afterwards.
use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use kube::{Api, api::PostParams};
use snafu::{ResultExt, Snafu};
use tracing::{info, instrument};

use crate::{constants::FIELD_MANAGER, registration::WebhookRegistration};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by a [`WebhookConfigurationStore`].
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("MutatingWebhookConfiguration {name:?} already exists"))]
    AlreadyExists { name: String },

    #[snafu(display("request to the cluster API failed"))]
    Request { source: BoxError },
}

/// The cluster operations the [`Registrar`] needs.
#[async_trait]
pub trait WebhookConfigurationStore {
    /// Creates the object, failing with [`StoreError::AlreadyExists`] if an
    /// object with the same name exists.
    async fn create(
        &self,
        configuration: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, StoreError>;

    async fn get(&self, name: &str) -> Result<MutatingWebhookConfiguration, StoreError>;

    /// Replaces the object. The `resourceVersion` of `configuration` must
    /// match the stored object.
    async fn replace(
        &self,
        name: &str,
        configuration: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, StoreError>;
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_owned()),
        ..Default::default()
    }
}

#[async_trait]
impl WebhookConfigurationStore for Api<MutatingWebhookConfiguration> {
    async fn create(
        &self,
        configuration: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, StoreError> {
        match Api::create(self, &post_params(), configuration).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => {
                AlreadyExistsSnafu {
                    name: configuration.metadata.name.clone().unwrap_or_default(),
                }
                .fail()
            }
            Err(err) => Err(err).boxed().context(RequestSnafu),
        }
    }

    async fn get(&self, name: &str) -> Result<MutatingWebhookConfiguration, StoreError> {
        Api::get(self, name).await.boxed().context(RequestSnafu)
    }

    async fn replace(
        &self,
        name: &str,
        configuration: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, StoreError> {
        Api::replace(self, name, &post_params(), configuration)
            .await
            .boxed()
            .context(RequestSnafu)
    }
}

#[derive(Debug, Snafu)]
pub enum RegistrarError {
    #[snafu(display("failed to create MutatingWebhookConfiguration {name:?}"))]
    CreateConfiguration { source: StoreError, name: String },

    #[snafu(display("failed to get existing MutatingWebhookConfiguration {name:?}"))]
    GetConfiguration { source: StoreError, name: String },

    #[snafu(display("failed to replace MutatingWebhookConfiguration {name:?}"))]
    ReplaceConfiguration { source: StoreError, name: String },
}

/// The result of [`Registrar::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ApplyOutcome {
    /// Registration is disabled, the cluster was not contacted.
    Unregistered,

    /// No configuration with that name existed, it was created.
    Created,

    /// An existing configuration was overwritten.
    Updated,
}

/// Applies a [`WebhookRegistration`] once, create-or-replace.
pub struct Registrar<S> {
    store: Option<S>,
}

impl<S> Registrar<S>
where
    S: WebhookConfigurationStore + Send + Sync,
{
    pub fn new(store: S) -> Self {
        Self { store: Some(store) }
    }

    /// A registrar which never contacts the cluster.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    #[instrument(
        skip_all,
        fields(k8s.mutatingwebhookconfiguration.name = registration.configuration_name()),
    )]
    pub async fn apply(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<ApplyOutcome, RegistrarError> {
        let Some(store) = &self.store else {
            info!("webhook registration is disabled, skipping");
            return Ok(ApplyOutcome::Unregistered);
        };

        let name = registration.configuration_name();
        let mut desired = registration.to_configuration();

        match store.create(&desired).await {
            Ok(_) => {
                info!("created mutating webhook configuration");
                Ok(ApplyOutcome::Created)
            }
            Err(StoreError::AlreadyExists { .. }) => {
                let current = store
                    .get(name)
                    .await
                    .context(GetConfigurationSnafu { name })?;

                desired.metadata.resource_version = current.metadata.resource_version;
                store
                    .replace(name, &desired)
                    .await
                    .context(ReplaceConfigurationSnafu { name })?;

                info!("updated existing mutating webhook configuration");
                Ok(ApplyOutcome::Updated)
            }
            Err(source) => Err(source).context(CreateConfigurationSnafu { name }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use super::*;

    /// In-memory store behaving like the API server for create, get and
    /// replace, including optimistic concurrency on `resourceVersion`.
    #[derive(Default)]
    struct FakeStore {
        objects: Mutex<BTreeMap<String, MutatingWebhookConfiguration>>,
        next_resource_version: Mutex<u64>,
        fail_get: bool,
    }

    impl FakeStore {
        fn stored(&self, name: &str) -> Option<MutatingWebhookConfiguration> {
            self.objects.lock().unwrap().get(name).cloned()
        }

        fn bump_resource_version(&self) -> String {
            let mut version = self.next_resource_version.lock().unwrap();
            *version += 1;
            version.to_string()
        }
    }

    #[async_trait]
    impl WebhookConfigurationStore for FakeStore {
        async fn create(
            &self,
            configuration: &MutatingWebhookConfiguration,
        ) -> Result<MutatingWebhookConfiguration, StoreError> {
            let name = configuration.metadata.name.clone().unwrap();
            if self.stored(&name).is_some() {
                return AlreadyExistsSnafu { name }.fail();
            }

            let mut created = configuration.clone();
            created.metadata.resource_version = Some(self.bump_resource_version());
            self.objects.lock().unwrap().insert(name, created.clone());
            Ok(created)
        }

        async fn get(&self, name: &str) -> Result<MutatingWebhookConfiguration, StoreError> {
            if self.fail_get {
                let err: BoxError = "connection refused".into();
                return Err(err).context(RequestSnafu);
            }

            self.stored(name).ok_or_else(|| {
                let err: BoxError = format!("{name} not found").into();
                StoreError::Request { source: err }
            })
        }

        async fn replace(
            &self,
            name: &str,
            configuration: &MutatingWebhookConfiguration,
        ) -> Result<MutatingWebhookConfiguration, StoreError> {
            let current = self.get(name).await?;
            if current.metadata.resource_version != configuration.metadata.resource_version {
                let err: BoxError = "resourceVersion conflict".into();
                return Err(err).context(RequestSnafu);
            }

            let mut replaced = configuration.clone();
            replaced.metadata.resource_version = Some(self.bump_resource_version());
            self.objects
                .lock()
                .unwrap()
                .insert(name.to_owned(), replaced.clone());
            Ok(replaced)
        }
    }

    fn registration(ca_bundle: &[u8]) -> WebhookRegistration {
        WebhookRegistration::builder()
            .service_name("webhook-server")
            .service_namespace("webhook-demo")
            .ca_bundle(ca_bundle.to_vec())
            .build()
    }

    fn stored_ca_bundle(store: &FakeStore) -> Option<Vec<u8>> {
        store
            .stored("serviceaccount-label-mutator")
            .and_then(|configuration| configuration.webhooks)
            .and_then(|webhooks| webhooks[0].client_config.ca_bundle.clone())
            .map(|ca_bundle| ca_bundle.0)
    }

    #[tokio::test]
    async fn creates_then_updates() {
        let registrar = Registrar::new(FakeStore::default());

        let outcome = registrar.apply(&registration(b"first")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);

        let outcome = registrar.apply(&registration(b"second")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);

        let store = registrar.store.as_ref().unwrap();
        assert_eq!(stored_ca_bundle(store), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn repeated_apply_converges() {
        let registrar = Registrar::new(FakeStore::default());
        let registration = registration(b"ca");

        registrar.apply(&registration).await.unwrap();
        let first = registrar
            .store
            .as_ref()
            .unwrap()
            .stored("serviceaccount-label-mutator")
            .unwrap();

        registrar.apply(&registration).await.unwrap();
        let second = registrar
            .store
            .as_ref()
            .unwrap()
            .stored("serviceaccount-label-mutator")
            .unwrap();

        assert_eq!(first.webhooks, second.webhooks);
        assert_eq!(first.webhooks, registration.to_configuration().webhooks);
    }

    #[tokio::test]
    async fn disabled_registrar_does_nothing() {
        let registrar = Registrar::<FakeStore>::disabled();

        let outcome = registrar.apply(&registration(b"ca")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unregistered);
    }

    #[tokio::test]
    async fn get_failure_is_fatal() {
        let store = FakeStore {
            fail_get: true,
            ..Default::default()
        };
        store.create(&registration(b"old").to_configuration()).await.unwrap();
        let registrar = Registrar::new(store);

        let err = registrar
            .apply(&registration(b"new"))
            .await
            .expect_err("a failed get must not be recovered");
        assert!(matches!(err, RegistrarError::GetConfiguration { .. }));
    }
}
