use dns_types::protocol::types::{Question, Rcode};

/// What to do when every candidate server for a resolution has been
/// exhausted without a reply. The source this resolver is ported from
/// raises a hard error here; it's ambiguous whether that was meant to
/// crash the process or turn into a `SERVFAIL` reply, so the choice is
/// a runtime policy rather than a guess.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NoConnectivityPolicy {
    /// Answer the client with `SERVFAIL`.
    ServerFailure,
    /// Exit the process.
    Terminate,
}

impl std::str::FromStr for NoConnectivityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server-failure" => Ok(NoConnectivityPolicy::ServerFailure),
            "terminate" => Ok(NoConnectivityPolicy::Terminate),
            other => Err(format!(
                "'{other}' is not a valid no-connectivity policy (expected 'server-failure' or 'terminate')"
            )),
        }
    }
}

/// An error that can occur resolving a question.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResolutionError {
    /// An upstream server returned a non-`NoError` RCODE. Returned to
    /// the caller immediately: this resolver never tries another
    /// server once one has given a definitive answer.
    Rcode(Rcode),
    /// Every candidate nameserver, at every level of the delegation
    /// chain, failed to answer within its timeout.
    NoConnectivity,
    /// Tried to resolve a question already on the question stack,
    /// which would otherwise loop forever (e.g. a glueless NS whose
    /// address depends on resolving itself).
    DuplicateQuestion { question: Question },
    /// Hit the recursion depth limit while chasing glueless
    /// delegations.
    RecursionLimit,
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResolutionError::Rcode(rcode) => write!(f, "upstream returned {rcode:?}"),
            ResolutionError::NoConnectivity => {
                write!(f, "no candidate nameserver responded")
            }
            ResolutionError::DuplicateQuestion { question } => {
                write!(f, "loop resolving '{} {}'", question.name, question.qtype)
            }
            ResolutionError::RecursionLimit => write!(f, "recursion limit reached"),
        }
    }
}

impl std::error::Error for ResolutionError {}
