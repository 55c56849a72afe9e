use std::env;
use std::sync::OnceLock;

static CHECK_ZERO_INIT: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Whether the warm-up pass verifies that real optimizer state leaves are
/// all-zero before overwriting them. Defaults to on; set
/// `TRAINSTEP_CHECK_ZERO_INIT=0` to restore unchecked replacement.
pub(crate) fn check_zero_init() -> bool {
    *CHECK_ZERO_INIT.get_or_init(|| match env::var("TRAINSTEP_CHECK_ZERO_INIT") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => true,
    })
}
