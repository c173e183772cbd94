use std::sync::Arc;

use crate::{identity::IdentityResolver, policy::PolicySet};

/// Everything a request handler needs, constructed once at startup and
/// shared between requests.
#[derive(Clone)]
pub struct ServiceContext {
    policies: PolicySet,
    resolver: Arc<dyn IdentityResolver>,
}

impl ServiceContext {
    pub fn new(policies: PolicySet, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { policies, resolver }
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn resolver(&self) -> &dyn IdentityResolver {
        self.resolver.as_ref()
    }
}
