//! The declarative description of the mutating admission hook and its
//! conversion into a [`MutatingWebhookConfiguration`].
use bon::Builder;
use k8s_openapi::{
    ByteString,
    api::admissionregistration::v1::{
        MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
        WebhookClientConfig,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};

use crate::constants::{
    DEFAULT_MUTATING_WEBHOOK_CONFIGURATION_NAME, DEFAULT_WEBHOOK_PATH,
    DEFAULT_WEBHOOK_SERVICE_PORT,
};

/// Describes where the API server reaches the webhook and which requests it
/// sends there.
///
/// The generated configuration intercepts `CREATE` and `UPDATE` of namespaced
/// `serviceaccounts` in every API group and fails closed.
///
/// ```
/// use mutator_webhook::registration::WebhookRegistration;
///
/// let registration = WebhookRegistration::builder()
///     .service_name("webhook-server")
///     .service_namespace("webhook-demo")
///     .ca_bundle(b"-----BEGIN CERTIFICATE-----".to_vec())
///     .build();
///
/// let configuration = registration.to_configuration();
/// assert_eq!(
///     configuration.metadata.name.as_deref(),
///     Some("serviceaccount-label-mutator")
/// );
/// ```
#[derive(Builder, Clone, Debug, PartialEq, Eq)]
pub struct WebhookRegistration {
    /// Name of the MutatingWebhookConfiguration object.
    #[builder(into, default = DEFAULT_MUTATING_WEBHOOK_CONFIGURATION_NAME.to_owned())]
    configuration_name: String,

    /// Name of the single webhook entry. Defaults to `<service>.<namespace>.svc`.
    #[builder(into)]
    webhook_name: Option<String>,

    #[builder(into)]
    service_name: String,

    #[builder(into)]
    service_namespace: String,

    #[builder(into, default = DEFAULT_WEBHOOK_PATH.to_owned())]
    path: String,

    #[builder(default = DEFAULT_WEBHOOK_SERVICE_PORT)]
    service_port: u16,

    /// PEM-encoded CA certificate(s) the API server uses to verify the
    /// serving certificate. Left out of the configuration when empty.
    #[builder(default)]
    ca_bundle: Vec<u8>,
}

impl WebhookRegistration {
    pub fn configuration_name(&self) -> &str {
        &self.configuration_name
    }

    pub fn webhook_name(&self) -> String {
        self.webhook_name.clone().unwrap_or_else(|| {
            format!("{}.{}.svc", self.service_name, self.service_namespace)
        })
    }

    /// Converts the registration into the object that is applied to the
    /// cluster.
    pub fn to_configuration(&self) -> MutatingWebhookConfiguration {
        let rule = RuleWithOperations {
            api_groups: Some(vec!["*".to_owned()]),
            api_versions: Some(vec!["v1".to_owned()]),
            operations: Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()]),
            resources: Some(vec!["serviceaccounts".to_owned()]),
            scope: Some("Namespaced".to_owned()),
        };

        let client_config = WebhookClientConfig {
            service: Some(ServiceReference {
                name: self.service_name.clone(),
                namespace: self.service_namespace.clone(),
                path: Some(self.path.clone()),
                port: Some(self.service_port.into()),
            }),
            // ByteString takes care of encoding the provided content as base64
            ca_bundle: (!self.ca_bundle.is_empty()).then(|| ByteString(self.ca_bundle.clone())),
            url: None,
        };

        let webhook = MutatingWebhook {
            name: self.webhook_name(),
            admission_review_versions: vec!["v1".to_owned()],
            client_config,
            rules: Some(vec![rule]),
            failure_policy: Some("Fail".to_owned()),
            match_policy: Some("Equivalent".to_owned()),
            side_effects: "None".to_owned(),
            namespace_selector: Some(LabelSelector::default()),
            object_selector: Some(LabelSelector::default()),
            ..Default::default()
        };

        MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(self.configuration_name.clone()),
                ..Default::default()
            },
            webhooks: Some(vec![webhook]),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn registration() -> WebhookRegistration {
        WebhookRegistration::builder()
            .service_name("webhook-server")
            .service_namespace("webhook-demo")
            .ca_bundle(b"ca".to_vec())
            .build()
    }

    #[test]
    fn defaults() {
        let configuration = registration().to_configuration();
        assert_eq!(
            configuration.metadata.name.as_deref(),
            Some("serviceaccount-label-mutator")
        );

        let webhooks = configuration.webhooks.unwrap();
        assert_eq!(webhooks.len(), 1);
        let webhook = &webhooks[0];

        assert_eq!(webhook.name, "webhook-server.webhook-demo.svc");
        assert_eq!(webhook.admission_review_versions, vec!["v1"]);
        assert_eq!(webhook.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(webhook.match_policy.as_deref(), Some("Equivalent"));
        assert_eq!(webhook.side_effects, "None");
        assert_eq!(webhook.namespace_selector, Some(LabelSelector::default()));
        assert_eq!(webhook.object_selector, Some(LabelSelector::default()));

        let service = webhook.client_config.service.as_ref().unwrap();
        assert_eq!(service.name, "webhook-server");
        assert_eq!(service.namespace, "webhook-demo");
        assert_eq!(service.path.as_deref(), Some("/mutate"));
        assert_eq!(service.port, Some(443));
        assert_eq!(
            webhook.client_config.ca_bundle,
            Some(ByteString(b"ca".to_vec()))
        );

        let rules = webhook.rules.as_ref().unwrap();
        assert_eq!(rules, &vec![RuleWithOperations {
            api_groups: Some(vec!["*".to_owned()]),
            api_versions: Some(vec!["v1".to_owned()]),
            operations: Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()]),
            resources: Some(vec!["serviceaccounts".to_owned()]),
            scope: Some("Namespaced".to_owned()),
        }]);
    }

    #[test]
    fn customized() {
        let configuration = WebhookRegistration::builder()
            .configuration_name("custom")
            .webhook_name("hook.example.com")
            .service_name("svc")
            .service_namespace("ns")
            .path("/custom")
            .service_port(8443)
            .build()
            .to_configuration();

        assert_eq!(configuration.metadata.name.as_deref(), Some("custom"));
        let webhook = &configuration.webhooks.unwrap()[0];
        assert_eq!(webhook.name, "hook.example.com");
        assert_eq!(webhook.client_config.ca_bundle, None);

        let service = webhook.client_config.service.as_ref().unwrap();
        assert_eq!(service.path.as_deref(), Some("/custom"));
        assert_eq!(service.port, Some(8443));
    }

    #[rstest]
    #[case(None, "webhook-server.webhook-demo.svc")]
    #[case(Some("hook.example.com"), "hook.example.com")]
    fn webhook_name(#[case] explicit: Option<&str>, #[case] expected: &str) {
        let registration = WebhookRegistration::builder()
            .maybe_webhook_name(explicit)
            .service_name("webhook-server")
            .service_namespace("webhook-demo")
            .build();

        assert_eq!(registration.webhook_name(), expected);
    }

    #[test]
    fn serializes_ca_bundle_as_base64() {
        let configuration = registration().to_configuration();
        let value = serde_json::to_value(&configuration).unwrap();

        assert_eq!(
            value["webhooks"][0]["clientConfig"]["caBundle"],
            serde_json::json!("Y2E=")
        );
        assert_eq!(
            value["webhooks"][0]["rules"][0]["operations"],
            serde_json::json!(["CREATE", "UPDATE"])
        );
    }
}
