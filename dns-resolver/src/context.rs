use tokio::net::UdpSocket;

use dns_types::protocol::types::Question;

use crate::cache::SharedCache;
use crate::metrics::Metrics;

/// How deep a single resolution is allowed to recurse while chasing
/// glueless NS delegations, before giving up rather than looping
/// forever on a misconfigured zone.
pub const RECURSION_LIMIT: usize = 16;

/// State threaded through one top-level resolution: the shared cache,
/// the socket upstream queries are sent and read back on, a guard
/// against resolving the same question twice on one call stack, and
/// the metrics accumulated so far.
///
/// The socket is the same one the server loop reads client queries
/// from (see `dns-resolver::util::net` and the `resolved` binary):
/// this resolver is single-threaded, so only one resolution is ever
/// in flight, and it is the only code reading the socket while an
/// upstream reply is outstanding.
pub struct Context<'a> {
    pub cache: &'a SharedCache,
    pub socket: &'a UdpSocket,
    question_stack: Vec<Question>,
    metrics: Metrics,
}

impl<'a> Context<'a> {
    pub fn new(cache: &'a SharedCache, socket: &'a UdpSocket) -> Self {
        Self {
            cache,
            socket,
            question_stack: Vec::with_capacity(RECURSION_LIMIT),
            metrics: Metrics::new(),
        }
    }

    pub fn metrics(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    pub fn done(self) -> Metrics {
        self.metrics
    }

    pub fn at_recursion_limit(&self) -> bool {
        self.question_stack.len() >= RECURSION_LIMIT
    }

    pub fn is_duplicate_question(&self, question: &Question) -> bool {
        self.question_stack.contains(question)
    }

    pub fn push_question(&mut self, question: &Question) {
        self.question_stack.push(question.clone());
    }

    pub fn pop_question(&mut self) {
        self.question_stack.pop();
    }
}
