//! The iterative resolution engine: given a question, find the
//! best-matching delegation the cache already knows, pick a server,
//! query it, and either return an answer or chase the delegation one
//! level deeper. See `original_source/dns_server.py::_resolve` for the
//! control flow this follows step for step.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_recursion::async_recursion;
use rand::Rng;
use tokio::time::timeout;

use dns_types::protocol::types::{
    DomainName, Message, QueryClass, QueryType, Question, Rcode, RecordClass, RecordType,
    RecordTypeWithData, ResourceRecord,
};

use crate::cache::{now, Expiry};
use crate::context::Context;
use crate::util::net::send_udp_bytes_to;
use crate::util::types::ResolutionError;

/// How long to wait for a reply to one (IP, query) pair before trying
/// the next candidate.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

const DNS_PORT: u16 = 53;

/// The result of a successful resolution: an RCODE and whatever answer
/// records go with it (empty for anything other than `NoError`).
pub type ResolveResult = Result<(Rcode, Vec<ResourceRecord>), ResolutionError>;

/// Resolve a single question, consulting the cache first and falling
/// back to iterative resolution from the nearest known delegation.
///
/// `ctx` carries the recursion-depth and question-stack loop guards
/// shared by this whole call tree: glueless NS names are resolved by
/// recursing into this same function, so those guards are what bounds
/// a pathological zone rather than the loop structure itself.
#[async_recursion]
pub async fn resolve(ctx: &mut Context<'_>, question: &Question) -> ResolveResult {
    if !matches!(question.qclass, QueryClass::Record(RecordClass::IN)) {
        return Ok((Rcode::NotImplemented, Vec::new()));
    }

    if let Some(hit) = cache_lookup(ctx, question) {
        ctx.metrics().cache_hit();
        return Ok(hit);
    }
    ctx.metrics().cache_miss();

    if ctx.is_duplicate_question(question) {
        return Err(ResolutionError::DuplicateQuestion {
            question: question.clone(),
        });
    }
    if ctx.at_recursion_limit() {
        return Err(ResolutionError::RecursionLimit);
    }

    ctx.push_question(question);
    let outcome = resolve_iteratively(ctx, question).await;
    ctx.pop_question();
    outcome
}

/// Step 1 of `resolve`: a cache hit for a cacheable qtype. Per
/// spec, A and NS are always cacheable; AAAA is cached too (see
/// `DESIGN.md`'s resolution of the "qtype beyond A/NS" open question),
/// since the wire codec already decodes it and upstream responses
/// routinely carry it as glue.
fn cache_lookup(ctx: &Context<'_>, question: &Question) -> Option<(Rcode, Vec<ResourceRecord>)> {
    let now_ts = now();
    let snapshot = ctx.cache.snapshot();

    let rrs: Vec<ResourceRecord> = match question.qtype {
        QueryType::Record(RecordType::A) => snapshot
            .lookup_a_with_expiry(now_ts, &question.name)
            .into_iter()
            .map(|(address, expiry)| ResourceRecord {
                name: question.name.clone(),
                rtype_with_data: RecordTypeWithData::A { address },
                rclass: RecordClass::IN,
                ttl: ttl_for(expiry, now_ts),
            })
            .collect(),
        QueryType::Record(RecordType::AAAA) => snapshot
            .lookup_aaaa_with_expiry(now_ts, &question.name)
            .into_iter()
            .map(|(address, expiry)| ResourceRecord {
                name: question.name.clone(),
                rtype_with_data: RecordTypeWithData::AAAA { address },
                rclass: RecordClass::IN,
                ttl: ttl_for(expiry, now_ts),
            })
            .collect(),
        QueryType::Record(RecordType::NS) => snapshot
            .lookup_ns_exact_with_expiry(now_ts, &question.name)
            .into_iter()
            .map(|(nsdname, expiry)| ResourceRecord {
                name: question.name.clone(),
                rtype_with_data: RecordTypeWithData::NS { nsdname },
                rclass: RecordClass::IN,
                ttl: ttl_for(expiry, now_ts),
            })
            .collect(),
        _ => return None,
    };

    if rrs.is_empty() {
        None
    } else {
        Some((Rcode::NoError, rrs))
    }
}

/// `Expiry::Never` entries (root hints) are re-emitted with a synthetic
/// TTL rather than an unbounded one, per spec.
fn ttl_for(expiry: Expiry, now_ts: i64) -> u32 {
    match expiry {
        Expiry::Never => 86400,
        Expiry::At(t) => u32::try_from(t - now_ts).unwrap_or(0),
    }
}

/// Step 2 of `resolve`: walk the delegation chain. Each pass through
/// the `'restart` loop looks up the longest-suffix zone again, because
/// the previous pass's ingest may have just cached a deeper
/// delegation for it.
async fn resolve_iteratively(ctx: &mut Context<'_>, question: &Question) -> ResolveResult {
    'restart: loop {
        let (zone, servers) = ctx.cache.lookup_ns_zone(now(), &question.name);
        tracing::debug!(%zone, candidates = servers.len(), name = %question.name, "selected delegation");

        let mut saw_any_reply = false;

        for server in &servers {
            let ips = match resolve_server_address(ctx, server).await {
                Ok(ips) => ips,
                Err(error) => {
                    tracing::trace!(%server, %error, "could not resolve nameserver address, skipping");
                    continue;
                }
            };

            for ip in ips {
                match query_one(ctx, question, ip).await {
                    Some(response) => {
                        saw_any_reply = true;
                        ctx.metrics().nameserver_hit();

                        let now_ts = now();
                        ctx.cache.ingest(now_ts, &response.answers);
                        ctx.cache.ingest(now_ts, &response.authority);
                        ctx.cache.ingest(now_ts, &response.additional);

                        if response.header.rcode != Rcode::NoError {
                            tracing::debug!(%server, %ip, rcode = ?response.header.rcode, "upstream returned an error, not trying other servers");
                            return Ok((response.header.rcode, Vec::new()));
                        }

                        if !response.answers.is_empty() {
                            return Ok((Rcode::NoError, response.answers));
                        }

                        tracing::trace!(%server, %ip, %zone, "pure delegation, restarting from the deeper zone");
                        continue 'restart;
                    }
                    None => {
                        ctx.metrics().nameserver_miss();
                        tracing::trace!(%server, %ip, "no reply within timeout, trying next candidate");
                    }
                }
            }
        }

        if !saw_any_reply {
            ctx.metrics().no_connectivity();
            return Err(ResolutionError::NoConnectivity);
        }
    }
}

/// The addresses to query a candidate nameserver at. If the A-cache
/// has no live entry for `server` (a glueless delegation), resolves it
/// by recursing into `resolve` with an A question; a non-`NoError`
/// RCODE or any error from that sub-resolution causes the caller to
/// skip this server, exactly as any other failure to get an address
/// would.
async fn resolve_server_address(
    ctx: &mut Context<'_>,
    server: &DomainName,
) -> Result<Vec<Ipv4Addr>, ResolutionError> {
    let cached = ctx.cache.lookup_a(now(), server);
    if !cached.is_empty() {
        return Ok(cached);
    }

    let glue_question = Question {
        name: server.clone(),
        qtype: QueryType::Record(RecordType::A),
        qclass: QueryClass::Record(RecordClass::IN),
    };
    let (rcode, _) = resolve(ctx, &glue_question).await?;
    if rcode != Rcode::NoError {
        return Err(ResolutionError::Rcode(rcode));
    }

    Ok(ctx.cache.lookup_a(now(), server))
}

/// Send one non-recursive query to one server IP and wait up to
/// [`UPSTREAM_TIMEOUT`] for a reply whose ID matches. Replies with a
/// mismatched ID (stray traffic, or a reply to an earlier, already
/// abandoned query sharing this socket) are dropped and waiting
/// continues within the same timeout budget, per spec.
async fn query_one(ctx: &Context<'_>, question: &Question, ip: Ipv4Addr) -> Option<Message> {
    let id: u16 = rand::thread_rng().gen();
    let mut request = Message::from_question(id, question.clone());
    request.header.recursion_desired = false;

    let mut bytes = request.into_octets().ok()?;
    let addr = SocketAddr::from((ip, DNS_PORT));

    timeout(UPSTREAM_TIMEOUT, async {
        send_udp_bytes_to(ctx.socket, addr, &mut bytes).await.ok()?;

        let mut buf = [0u8; 512];
        loop {
            let (n, from) = ctx.socket.recv_from(&mut buf).await.ok()?;
            if from != addr || n < 2 {
                continue;
            }
            if buf[0] != (id >> 8) as u8 || buf[1] != (id & 0xff) as u8 {
                continue;
            }
            return Message::from_octets(&buf[..n]).ok();
        }
    })
    .await
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_for_never_is_synthetic_day() {
        assert_eq!(ttl_for(Expiry::Never, 1000), 86400);
    }

    #[test]
    fn ttl_for_at_is_remaining_lifetime() {
        assert_eq!(ttl_for(Expiry::At(1500), 1000), 500);
    }

    #[test]
    fn ttl_for_past_expiry_floors_at_zero() {
        // sweep() ought to have removed this already; defend anyway.
        assert_eq!(ttl_for(Expiry::At(900), 1000), 0);
    }
}
