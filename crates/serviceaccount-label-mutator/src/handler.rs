//! The `/mutate` endpoint receiving `AdmissionReview`s from the API server.
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{State, rejection::BytesRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::core::{
    DynamicObject, Status,
    admission::{
        AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError,
        SerializePatchError,
    },
    dynamic::ParseDynamicObjectError,
};
use mutator_webhook::constants::DEFAULT_WEBHOOK_PATH;
use snafu::{OptionExt, Report, ResultExt, Snafu};
use tracing::{debug, info, instrument, warn};

use crate::{
    context::ServiceContext,
    identity::ResolveError,
    policy::DecideError,
};

const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";

#[derive(Debug, Snafu)]
pub enum ReviewError {
    #[snafu(display("failed to read request body"))]
    ReadBody { source: BytesRejection },

    #[snafu(display("failed to decode AdmissionReview"))]
    DecodeReview { source: serde_json::Error },

    #[snafu(display("failed to extract the admission request"))]
    ConvertReview { source: ConvertAdmissionReviewError },

    #[snafu(display("admission request {uid:?} carries no object"))]
    MissingObject { uid: String },

    #[snafu(display("failed to decode the object of admission request {uid:?} as ServiceAccount"))]
    DecodeServiceAccount {
        source: ParseDynamicObjectError,
        uid: String,
    },

    #[snafu(display("failed to decide on admission request {uid:?}"))]
    Decide { source: DecideError, uid: String },

    #[snafu(display("failed to serialize JSON patch for admission request {uid:?}"))]
    SerializePatch {
        source: SerializePatchError,
        uid: String,
    },
}

impl ReviewError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ReadBody { .. }
            | Self::DecodeReview { .. }
            | Self::ConvertReview { .. }
            | Self::MissingObject { .. }
            | Self::DecodeServiceAccount { .. } => StatusCode::BAD_REQUEST,
            Self::Decide {
                source:
                    DecideError::ResolveIdentity {
                        source: ResolveError::NotFound { .. },
                    },
                ..
            } => StatusCode::NOT_FOUND,
            Self::Decide { .. } | Self::SerializePatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ReviewError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = Report::from_error(&self).to_string();
        warn!(http.response.status_code = status.as_u16(), error = %message, "rejecting admission review");

        (status, message).into_response()
    }
}

/// Routes `POST /mutate` to the admission review handler.
pub fn router(context: Arc<ServiceContext>) -> Router {
    Router::new()
        .route(DEFAULT_WEBHOOK_PATH, post(mutate))
        .with_state(context)
}

#[instrument(name = "mutate", skip_all, fields(admission.uid = tracing::field::Empty))]
async fn mutate(
    State(context): State<Arc<ServiceContext>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<AdmissionReview<DynamicObject>>, ReviewError> {
    let body = body.context(ReadBodySnafu)?;
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(&body).context(DecodeReviewSnafu)?;

    // There is no uid to echo without a request.
    if review.request.is_none() {
        debug!("admission review carries no request, allowing");
        let mut response = AdmissionResponse::invalid("admission review carries no request");
        response.types = review.types;
        response.allowed = true;
        response.result = Status::default();
        return Ok(Json(response.into_review()));
    }

    // The conversion carries apiVersion and kind over, the response echoes them.
    let request: AdmissionRequest<DynamicObject> =
        review.try_into().context(ConvertReviewSnafu)?;

    let uid = request.uid.clone();
    tracing::Span::current().record("admission.uid", uid.as_str());

    let response = AdmissionResponse::from(&request);
    if request.kind.kind != SERVICE_ACCOUNT_KIND {
        debug!(kind = %request.kind.kind, "not a ServiceAccount, allowing");
        return Ok(Json(response.into_review()));
    }

    let object = request
        .object
        .context(MissingObjectSnafu { uid: uid.as_str() })?;
    let service_account: ServiceAccount = object
        .try_parse()
        .context(DecodeServiceAccountSnafu { uid: uid.as_str() })?;
    let labels = service_account.metadata.labels.unwrap_or_default();

    let decision = context
        .policies()
        .decide(&labels, context.resolver())
        .await
        .context(DecideSnafu { uid: uid.as_str() })?;

    let mut response = match decision.patch {
        Some(patch) => {
            info!(operations = patch.0.len(), "mutating ServiceAccount");
            response
                .with_patch(patch)
                .context(SerializePatchSnafu { uid: uid.as_str() })?
        }
        None => response,
    };
    response.allowed = decision.allowed;

    Ok(Json(response.into_review()))
}
