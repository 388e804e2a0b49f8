// ABOUTME: Turns upstream transport errors into an actionable cause
// ABOUTME: TLS scheme mismatches and untrusted certificates are fatal, the rest is retried

use std::error::Error;
use std::fmt;

/// Why a request to the primary failed at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The primary speaks TLS but we connected with plain HTTP.
    PlaintextToTls,
    /// TLS handshake failed on certificate verification.
    UntrustedCertificate,
    /// We connected with TLS but the primary speaks plain HTTP.
    TlsToPlaintext,
    /// Anything else: refused, reset, timed out, DNS...
    Transient,
}

const PLAINTEXT_TO_TLS: &[&str] = &[
    "malformed HTTP response",
    "invalid HTTP version",
    "HTTP/0.9",
    "Client sent an HTTP request to an HTTPS server",
];

const UNTRUSTED_CERTIFICATE: &[&str] = &[
    "certificate signed by unknown authority",
    "certificate verify failed",
    "self signed certificate",
    "self-signed certificate",
    "unable to get local issuer certificate",
    "UnknownIssuer",
    "not trusted",
];

const TLS_TO_PLAINTEXT: &[&str] = &[
    "oversized record received",
    "wrong version number",
    "record overflow",
    "packet length too long",
];

impl FailureCause {
    pub fn is_fatal(self) -> bool {
        !matches!(self, FailureCause::Transient)
    }

    pub fn guidance(self) -> &'static str {
        match self {
            FailureCause::PlaintextToTls => {
                "it looks like the upstream server is using SSL, did you forget to specify --ssl?"
            }
            FailureCause::UntrustedCertificate => {
                "encountered a certificate error when trying to verify SSL, you may want to use \
                 --ssl-skip-verify if this is a self-signed certificate"
            }
            FailureCause::TlsToPlaintext => {
                "it looks like you're trying to connect through SSL, but the server isn't set up \
                 to use SSL, try removing --ssl or properly setting it up on the server"
            }
            FailureCause::Transient => "upstream is unreachable, will retry",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.guidance())
    }
}

/// Classify a transport error by everything in its source chain.
pub fn classify(err: &(dyn Error + 'static), tls: bool) -> FailureCause {
    classify_message(&error_chain(err), tls)
}

/// Classify by message text alone.
pub fn classify_message(message: &str, tls: bool) -> FailureCause {
    let contains_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if !tls && contains_any(PLAINTEXT_TO_TLS) {
        FailureCause::PlaintextToTls
    } else if tls && contains_any(UNTRUSTED_CERTIFICATE) {
        FailureCause::UntrustedCertificate
    } else if tls && contains_any(TLS_TO_PLAINTEXT) {
        FailureCause::TlsToPlaintext
    } else {
        FailureCause::Transient
    }
}

/// `outer: inner: innermost`, skipping repeats.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(err);
    while let Some(e) = current {
        let text = e.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        current = e.source();
    }
    parts.join(": ")
}
