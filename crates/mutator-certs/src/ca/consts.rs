use std::time::Duration;

use x509_cert::der::pem::LineEnding;

const DAY: u64 = 24 * 60 * 60;

/// The default CA validity time span of ten years (365 day years).
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * DAY);

/// The CA subject name containing only the common name.
pub const WEBHOOK_CA_SUBJECT: &str = "CN=webhook-ca";

pub const PEM_LINE_ENDING: LineEnding = LineEnding::LF;
