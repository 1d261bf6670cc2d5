//! Keyword classification of failure reasons.
//!
//! Upstream services report free text. These rules derive the category,
//! severity and retryability stored on every exception. All matching is
//! case-insensitive.

use crate::exception::{ExceptionCategory, ExceptionSeverity, InterfaceType};

/// Category, severity and retryability derived from one failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Broad cause.
    pub category: ExceptionCategory,
    /// Urgency.
    pub severity: ExceptionSeverity,
    /// Whether a retry can help.
    pub retryable: bool,
}

/// Classify a failure reason reported by `interface`.
///
/// # Examples
///
/// ```
/// use exception_collector_core::classify::classify;
/// use exception_collector_core::exception::{ExceptionCategory, ExceptionSeverity, InterfaceType};
///
/// let c = classify(InterfaceType::Order, "Order already exists");
/// assert_eq!(c.category, ExceptionCategory::BusinessRule);
/// assert_eq!(c.severity, ExceptionSeverity::Medium);
/// assert!(!c.retryable);
/// ```
#[must_use]
pub fn classify(interface: InterfaceType, reason: &str) -> Classification {
    let reason = reason.to_lowercase();
    Classification {
        category: category(interface, &reason),
        severity: severity(interface, &reason),
        retryable: retryable(&reason),
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

const VALIDATION_WORDS: &[&str] = &["validation", "invalid", "required"];
const NETWORK_WORDS: &[&str] = &["timeout", "connection"];
const SYSTEM_WORDS: &[&str] = &["system", "internal"];

/// `reason` must already be lowercase.
fn category(interface: InterfaceType, reason: &str) -> ExceptionCategory {
    use ExceptionCategory as C;

    match interface {
        InterfaceType::Validation => C::Validation,
        InterfaceType::Order => {
            if contains_any(reason, &["already exists", "duplicate"]) {
                C::BusinessRule
            } else if contains_any(reason, VALIDATION_WORDS) {
                C::Validation
            } else if contains_any(reason, NETWORK_WORDS) {
                C::NetworkError
            } else if contains_any(reason, &["unauthorized", "forbidden"]) {
                C::Authorization
            } else if contains_any(reason, &["authentication", "credentials"]) {
                C::Authentication
            } else if contains_any(reason, SYSTEM_WORDS) {
                C::SystemError
            } else {
                C::BusinessRule
            }
        }
        InterfaceType::Collection => {
            if contains_any(reason, VALIDATION_WORDS) {
                C::Validation
            } else if contains_any(reason, &["donor", "collection", "sample"]) {
                C::BusinessRule
            } else if contains_any(reason, NETWORK_WORDS) {
                C::NetworkError
            } else if contains_any(reason, SYSTEM_WORDS) {
                C::SystemError
            } else {
                C::BusinessRule
            }
        }
        InterfaceType::Distribution => {
            if contains_any(reason, VALIDATION_WORDS) {
                C::Validation
            } else if contains_any(reason, &["destination", "location", "inventory"]) {
                C::BusinessRule
            } else if contains_any(reason, NETWORK_WORDS) {
                C::NetworkError
            } else if contains_any(reason, &["external", "service"]) {
                C::ExternalService
            } else if contains_any(reason, SYSTEM_WORDS) {
                C::SystemError
            } else {
                C::BusinessRule
            }
        }
    }
}

fn severity(interface: InterfaceType, reason: &str) -> ExceptionSeverity {
    use ExceptionSeverity as S;

    if interface == InterfaceType::Validation {
        return S::Medium;
    }
    if contains_any(reason, &["system error", "internal error", "database", "critical"]) {
        return S::Critical;
    }
    if contains_any(
        reason,
        &[
            "timeout",
            "connection failed",
            "service unavailable",
            "authentication failed",
        ],
    ) {
        return S::High;
    }
    let interface_specific: &[&str] = match interface {
        InterfaceType::Order => &["customer"],
        InterfaceType::Collection => &["donor", "sample"],
        InterfaceType::Distribution => &["destination", "delivery"],
        InterfaceType::Validation => &[],
    };
    if contains_any(reason, interface_specific) {
        return S::High;
    }
    if contains_any(reason, &["validation", "invalid", "already exists", "not found"]) {
        return S::Medium;
    }
    if contains_any(reason, &["warning", "info"]) {
        return S::Low;
    }
    S::Medium
}

fn retryable(reason: &str) -> bool {
    !contains_any(
        reason,
        &[
            "already exists",
            "duplicate",
            "invalid format",
            "malformed",
            "authentication failed",
            "unauthorized",
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExceptionCategory as C;
    use ExceptionSeverity as S;

    #[test]
    fn order_categories() {
        let cases = [
            ("Duplicate order", C::BusinessRule),
            ("Missing required field", C::Validation),
            ("Connection reset by peer", C::NetworkError),
            ("Forbidden for partner", C::Authorization),
            ("Bad credentials", C::Authentication),
            ("Internal failure", C::SystemError),
            ("Customer on credit hold", C::BusinessRule),
        ];
        for (reason, expected) in cases {
            assert_eq!(classify(InterfaceType::Order, reason).category, expected, "{reason}");
        }
    }

    #[test]
    fn collection_and_distribution_categories() {
        assert_eq!(
            classify(InterfaceType::Collection, "Donor deferred").category,
            C::BusinessRule
        );
        assert_eq!(
            classify(InterfaceType::Collection, "Gateway timeout").category,
            C::NetworkError
        );
        assert_eq!(
            classify(InterfaceType::Distribution, "Carrier service rejected").category,
            C::ExternalService
        );
        assert_eq!(
            classify(InterfaceType::Distribution, "Inventory short").category,
            C::BusinessRule
        );
        assert_eq!(
            classify(InterfaceType::Validation, "anything").category,
            C::Validation
        );
    }

    #[test]
    fn severity_precedence() {
        assert_eq!(classify(InterfaceType::Order, "Database timeout").severity, S::Critical);
        assert_eq!(classify(InterfaceType::Order, "Request timeout").severity, S::High);
        assert_eq!(classify(InterfaceType::Order, "Customer not found").severity, S::High);
        assert_eq!(classify(InterfaceType::Order, "Product not found").severity, S::Medium);
        assert_eq!(classify(InterfaceType::Collection, "Sample hemolyzed").severity, S::High);
        assert_eq!(
            classify(InterfaceType::Distribution, "Delivery window missed").severity,
            S::High
        );
        assert_eq!(classify(InterfaceType::Order, "Warning: late").severity, S::Low);
        assert_eq!(classify(InterfaceType::Order, "Rejected").severity, S::Medium);
        assert_eq!(classify(InterfaceType::Validation, "critical").severity, S::Medium);
    }

    #[test]
    fn retryability() {
        assert!(!classify(InterfaceType::Order, "Order already exists").retryable);
        assert!(!classify(InterfaceType::Order, "Invalid format in line 3").retryable);
        assert!(!classify(InterfaceType::Order, "UNAUTHORIZED").retryable);
        assert!(classify(InterfaceType::Order, "Service unavailable").retryable);
    }
}
