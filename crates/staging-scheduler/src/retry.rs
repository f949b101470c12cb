// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry classification for failed remote operations.
//!
//! A failure is classified by an ordered rule list:
//!
//! | Order | Rule | Outcome |
//! |-------|------|---------|
//! | 1 | `ETIMEDOUT` | retry, stop |
//! | 2 | transient message substring | retry, stop |
//! | 3 | `SOURCE` category with a fatal code | no retry |
//! | 4 | fatal message substring | no retry (overrides 3) |
//!
//! Anything not matched by a rule is retryable.

use nix::errno::Errno;

/// Where in the transfer the error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The source endpoint (staging and deletion always report here).
    Source,
    /// The destination endpoint.
    Destination,
    /// Anything else (transfer, client side).
    General,
}

impl ErrorCategory {
    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Source => "SOURCE",
            ErrorCategory::Destination => "DESTINATION",
            ErrorCategory::General => "GENERAL",
        }
    }
}

const TRANSIENT_MESSAGES: &[&str] = &[
    "performance marker",
    "Connection timed out",
    "end-of-file was reached",
];

const FATAL_SOURCE_CODES: &[Errno] = &[
    Errno::ENOENT,
    Errno::EPERM,
    Errno::EACCES,
    Errno::EISDIR,
    Errno::ENAMETOOLONG,
    Errno::E2BIG,
    Errno::ENOTDIR,
    Errno::EPROTONOSUPPORT,
    Errno::EINVAL,
];

const FATAL_MESSAGES: &[&str] = &[
    "proxy expired",
    "File exists and overwrite",
    "No such file or directory",
    "SRM_INVALID_PATH",
    "The certificate has expired",
    "The available CRL has expired",
    "SRM Authentication failed",
    "SRM_DUPLICATION_ERROR",
    "SRM_AUTHENTICATION_FAILURE",
    "SRM_NO_FREE_SPACE",
    "digest too big for rsa key",
    "Can not determine address of local host",
    "Permission denied",
    "System error in write into HDFS",
    "globus_ftp_client: the server responded with an error 530",
];

struct Failure<'a> {
    code: i32,
    category: ErrorCategory,
    message: &'a str,
}

/// What a matching rule does to the running decision.
#[derive(Clone, Copy)]
enum Outcome {
    /// Decide and stop evaluating.
    Final(bool),
    /// Set the decision, later rules may override it.
    Set(bool),
}

type Rule = (fn(&Failure<'_>) -> bool, Outcome);

fn is_timeout(f: &Failure<'_>) -> bool {
    f.code == Errno::ETIMEDOUT as i32
}

fn is_transient_message(f: &Failure<'_>) -> bool {
    TRANSIENT_MESSAGES.iter().any(|m| f.message.contains(m))
}

fn is_fatal_source_code(f: &Failure<'_>) -> bool {
    f.category == ErrorCategory::Source && FATAL_SOURCE_CODES.iter().any(|c| *c as i32 == f.code)
}

fn is_fatal_message(f: &Failure<'_>) -> bool {
    FATAL_MESSAGES.iter().any(|m| f.message.contains(m))
}

// Evaluated top to bottom, order matters.
const RULES: &[Rule] = &[
    (is_timeout, Outcome::Final(true)),
    (is_transient_message, Outcome::Final(true)),
    (is_fatal_source_code, Outcome::Set(false)),
    (is_fatal_message, Outcome::Set(false)),
];

/// Decide whether a failed file is worth retrying.
///
/// `code` is the raw OS error number reported by the remote call.
pub fn classify_retry(code: i32, category: ErrorCategory, message: &str) -> bool {
    let failure = Failure {
        code,
        category,
        message,
    };

    let mut retry = true;
    for (matches, outcome) in RULES {
        if !matches(&failure) {
            continue;
        }
        match *outcome {
            Outcome::Final(decision) => return decision,
            Outcome::Set(decision) => retry = decision,
        }
    }
    retry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_always_retryable() {
        for category in [
            ErrorCategory::Source,
            ErrorCategory::Destination,
            ErrorCategory::General,
        ] {
            assert!(classify_retry(
                Errno::ETIMEDOUT as i32,
                category,
                "SRM_NO_FREE_SPACE"
            ));
        }
    }

    #[test]
    fn test_transient_message_beats_fatal_code() {
        assert!(classify_retry(
            Errno::ENOENT as i32,
            ErrorCategory::Source,
            "No such file or directory (end-of-file was reached)"
        ));
    }

    #[test]
    fn test_fatal_source_codes() {
        for code in FATAL_SOURCE_CODES {
            assert!(!classify_retry(*code as i32, ErrorCategory::Source, "boom"));
        }
    }

    #[test]
    fn test_fatal_code_outside_source_is_retryable() {
        assert!(classify_retry(
            Errno::ENOENT as i32,
            ErrorCategory::Destination,
            "boom"
        ));
    }

    #[test]
    fn test_unknown_code_defaults_to_retry() {
        assert!(classify_retry(Errno::EIO as i32, ErrorCategory::Source, "boom"));
    }

    #[test]
    fn test_fatal_message_overrides_retryable_code() {
        assert!(!classify_retry(
            Errno::EIO as i32,
            ErrorCategory::Source,
            "[SE][StatusOfBringOnlineRequest] SRM_NO_FREE_SPACE"
        ));
        assert!(!classify_retry(
            Errno::EIO as i32,
            ErrorCategory::General,
            "globus_ftp_client: the server responded with an error 530 Login incorrect"
        ));
    }

    #[test]
    fn test_deterministic() {
        let inputs = [
            (Errno::EAGAIN as i32, "still queued"),
            (Errno::EACCES as i32, "Permission denied"),
            (Errno::ETIMEDOUT as i32, ""),
        ];
        for (code, message) in inputs {
            assert_eq!(
                classify_retry(code, ErrorCategory::Source, message),
                classify_retry(code, ErrorCategory::Source, message)
            );
        }
    }
}
