//! The mutation policies and the order they are evaluated in.
//!
//! Each [`Policy`] variant reacts to one trigger label. [`PolicySet::decide`]
//! evaluates the variants by priority and the first one whose trigger label
//! is present decides. Objects without any trigger label are admitted
//! unchanged.
use std::{collections::BTreeMap, fmt, str::FromStr};

use json_patch::Patch;
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;

use crate::{
    identity::{IdentityResolver, ResolveError},
    patch::LabelPatchBuilder,
};

/// Names the managed identity whose client ID is injected.
pub const MANAGED_IDENTITY_NAME_LABEL: &str = "mi.clientid.webhook/azure-mi-client-name";

/// The label Azure Workload Identity reads the client ID from.
pub const WORKLOAD_IDENTITY_CLIENT_ID_LABEL: &str = "azure.workload.identity/client-id";

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ParseLabelError {
    #[snafu(display("label {input:?} is not of the form KEY=VALUE"))]
    MissingSeparator { input: String },

    #[snafu(display("label {input:?} has an empty key"))]
    EmptyKey { input: String },
}

/// A single `key=value` label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn is_set_in(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }
}

impl FromStr for Label {
    type Err = ParseLabelError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (key, value) = input
            .split_once('=')
            .ok_or_else(|| MissingSeparatorSnafu { input }.build())?;
        ensure!(!key.trim().is_empty(), EmptyKeySnafu { input });

        Ok(Self::new(key.trim(), value.trim()))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Adds `label` to objects carrying `trigger`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoRule {
    pub trigger: Label,
    pub label: Label,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Resolves the identity named by [`MANAGED_IDENTITY_NAME_LABEL`] and sets
    /// [`WORKLOAD_IDENTITY_CLIENT_ID_LABEL`] to its client ID.
    ManagedIdentity,

    StaticLabelEcho(EchoRule),
}

impl Policy {
    /// Lower values are evaluated first.
    fn priority(&self) -> u8 {
        match self {
            Self::ManagedIdentity => 0,
            Self::StaticLabelEcho(_) => 1,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::ManagedIdentity => "managed-identity",
            Self::StaticLabelEcho(_) => "static-label-echo",
        }
    }

    /// Returns [`None`] if the trigger label is absent, otherwise the patch
    /// (which is [`None`] itself when nothing changes).
    async fn evaluate(
        &self,
        labels: &BTreeMap<String, String>,
        resolver: &dyn IdentityResolver,
    ) -> Option<Result<Option<Patch>, DecideError>> {
        match self {
            Self::ManagedIdentity => {
                let name = labels
                    .get(MANAGED_IDENTITY_NAME_LABEL)
                    .filter(|name| !name.is_empty())?;

                let patch = resolver
                    .resolve_client_id(name)
                    .await
                    .context(ResolveIdentitySnafu)
                    .map(|client_id| {
                        LabelPatchBuilder::new(labels)
                            .add_label(WORKLOAD_IDENTITY_CLIENT_ID_LABEL, client_id)
                            .build()
                    });

                Some(patch)
            }
            Self::StaticLabelEcho(rule) => {
                if !rule.trigger.is_set_in(labels) {
                    return None;
                }

                let patch = LabelPatchBuilder::new(labels)
                    .add_label(&rule.label.key, rule.label.value.clone())
                    .build();

                Some(Ok(patch))
            }
        }
    }
}

#[derive(Debug, Snafu)]
pub enum DecideError {
    #[snafu(display("failed to resolve the managed identity client id"))]
    ResolveIdentity { source: ResolveError },
}

/// The outcome of evaluating the policies against one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,

    /// Present only if the object changes.
    pub patch: Option<Patch>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            patch: None,
        }
    }

    pub fn allow_with(patch: Option<Patch>) -> Self {
        Self {
            allowed: true,
            patch,
        }
    }
}

/// The policies in evaluation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicySet {
    policies: Vec<Policy>,
}

impl PolicySet {
    pub fn new(policies: impl IntoIterator<Item = Policy>) -> Self {
        let mut policies: Vec<_> = policies.into_iter().collect();
        policies.sort_by_key(Policy::priority);

        Self { policies }
    }

    /// The managed identity policy, plus label echo if `echo` is given.
    pub fn with_echo(echo: Option<EchoRule>) -> Self {
        Self::new(
            std::iter::once(Policy::ManagedIdentity).chain(echo.map(Policy::StaticLabelEcho)),
        )
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Decides on an object with the given `labels`.
    ///
    /// A failed identity lookup is an error, never an unmodified admission.
    pub async fn decide(
        &self,
        labels: &BTreeMap<String, String>,
        resolver: &dyn IdentityResolver,
    ) -> Result<Decision, DecideError> {
        for policy in &self.policies {
            if let Some(patch) = policy.evaluate(labels, resolver).await {
                debug!(policy = policy.name(), "policy matched");
                return patch.map(Decision::allow_with);
            }
        }

        Ok(Decision::allow())
    }
}
