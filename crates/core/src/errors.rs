use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
    #[error("currency mismatch: wallet holds {wallet}, recharge is in {requested}")]
    CurrencyMismatch { wallet: String, requested: String },
    #[error("payment reference `{payment_reference}` was already applied with different terms")]
    PaymentReferenceReused { payment_reference: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("payment required: {message}")]
    PaymentRequired { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::PaymentRequired { .. } => {
                "Insufficient funds. Please recharge your AI wallet to continue."
            }
            Self::ServiceUnavailable { .. } => {
                "The AI service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::PaymentRequired { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::PaymentRequired { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(DomainError::InsufficientBalance { required, available }) => {
                Self::PaymentRequired {
                    message: format!("required {required}, available {available}"),
                    correlation_id: "unassigned".to_owned(),
                }
            }
            ApplicationError::Domain(DomainError::InvariantViolation(_)) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Domain(
                error @ (DomainError::CurrencyMismatch { .. }
                | DomainError::PaymentReferenceReused { .. }),
            ) => Self::BadRequest { message: error.to_string(), correlation_id: "unassigned".to_owned() },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn insufficient_balance_maps_to_payment_required() {
        let interface = ApplicationError::from(DomainError::InsufficientBalance {
            required: Decimal::new(65, 2),
            available: Decimal::new(10, 2),
        })
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::PaymentRequired { ref correlation_id, .. } if correlation_id == "req-1"
        ));
        assert!(interface.user_message().starts_with("Insufficient funds"));
    }

    #[test]
    fn invariant_violation_maps_to_bad_request() {
        let interface =
            ApplicationError::from(DomainError::InvariantViolation("negative debit".to_owned()))
                .into_interface("req-2");

        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn currency_mismatch_maps_to_bad_request() {
        let interface = ApplicationError::from(DomainError::CurrencyMismatch {
            wallet: "USD".to_owned(),
            requested: "EUR".to_owned(),
        })
        .into_interface("req-5");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest { ref message, .. } if message.contains("EUR")
        ));
    }

    #[test]
    fn integration_error_hides_provider_detail_from_users() {
        let interface = ApplicationError::Integration("openai: 502 bad gateway".to_owned())
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert!(!interface.user_message().contains("openai"));
        assert!(interface.user_message().contains("temporarily unavailable"));
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface =
            ApplicationError::Configuration("missing api key".to_owned()).into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}
