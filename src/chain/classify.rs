//! Mapping of node error messages onto submission outcomes
//!
//! Geth-family nodes only report submission failures as free text, so the
//! classification is done on lowercased message fragments. Anything not listed
//! is retryable.

use super::{RejectReason, RetryReason, SubmitOutcome};

const ACCEPTED: &[&str] = &["already known", "known transaction", "already imported"];

const NONCE_TOO_LOW: &[&str] = &["nonce too low", "nonce has already been used", "oldnonce"];

const UNDERPRICED: &[&str] = &[
    "replacement transaction underpriced",
    "transaction underpriced",
    "fee cap less than block base fee",
    "max fee per gas less than block base fee",
    "underpriced",
];

const INSUFFICIENT_FUNDS: &[&str] = &["insufficient funds", "insufficient balance"];

const INVALID: &[&str] = &[
    "intrinsic gas too low",
    "exceeds block gas limit",
    "invalid sender",
    "invalid signature",
    "transaction type not supported",
    "tx type not supported",
    "rlp: ",
    "oversized data",
    "max priority fee per gas higher than max fee per gas",
];

const REVERTED: &[&str] = &["execution reverted", "revert"];

const UNAVAILABLE: &[&str] = &[
    "connection refused",
    "connection reset",
    "error sending request",
    "503",
    "502",
    "too many requests",
    "rate limit",
];

/// Classify the error text returned by `eth_sendRawTransaction`
pub fn classify_submit_error(message: &str) -> SubmitOutcome {
    let msg = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| msg.contains(p));

    if matches(ACCEPTED) {
        SubmitOutcome::Accepted
    } else if matches(NONCE_TOO_LOW) {
        SubmitOutcome::Retryable(RetryReason::NonceTooLow)
    } else if matches(UNDERPRICED) {
        SubmitOutcome::Retryable(RetryReason::Underpriced)
    } else if matches(INSUFFICIENT_FUNDS) {
        SubmitOutcome::Rejected(RejectReason::InsufficientFunds)
    } else if matches(INVALID) {
        SubmitOutcome::Rejected(RejectReason::InvalidTransaction(message.to_string()))
    } else if matches(REVERTED) {
        SubmitOutcome::Rejected(RejectReason::Reverted(message.to_string()))
    } else if matches(UNAVAILABLE) {
        SubmitOutcome::Retryable(RetryReason::Unavailable(message.to_string()))
    } else {
        SubmitOutcome::Retryable(RetryReason::Unknown(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_count_as_accepted() {
        assert_eq!(
            classify_submit_error("(code: -32000, message: already known, data: None)"),
            SubmitOutcome::Accepted
        );
    }

    #[test]
    fn nonce_and_fee_errors_are_retryable() {
        assert_eq!(
            classify_submit_error("nonce too low: next nonce 8, tx nonce 5"),
            SubmitOutcome::Retryable(RetryReason::NonceTooLow)
        );
        assert_eq!(
            classify_submit_error("replacement transaction underpriced"),
            SubmitOutcome::Retryable(RetryReason::Underpriced)
        );
        assert_eq!(
            classify_submit_error("max fee per gas less than block base fee: address 0x.."),
            SubmitOutcome::Retryable(RetryReason::Underpriced)
        );
    }

    #[test]
    fn definite_rejections() {
        assert_eq!(
            classify_submit_error("insufficient funds for gas * price + value"),
            SubmitOutcome::Rejected(RejectReason::InsufficientFunds)
        );
        assert!(matches!(
            classify_submit_error("intrinsic gas too low"),
            SubmitOutcome::Rejected(RejectReason::InvalidTransaction(_))
        ));
        assert!(matches!(
            classify_submit_error("execution reverted: Unauthorized"),
            SubmitOutcome::Rejected(RejectReason::Reverted(_))
        ));
    }

    #[test]
    fn unknown_errors_stay_retryable() {
        assert!(matches!(
            classify_submit_error("error sending request for url"),
            SubmitOutcome::Retryable(RetryReason::Unavailable(_))
        ));
        assert!(matches!(
            classify_submit_error("something odd happened"),
            SubmitOutcome::Retryable(RetryReason::Unknown(_))
        ));
    }
}
