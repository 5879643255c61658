//! Resolution metrics. A fresh [`Metrics`] is built per request by
//! [`crate::context::Context`], then folded into the process-wide
//! Prometheus counters once the request is done.

use lazy_static::lazy_static;
use prometheus::{opts, register_int_counter, IntCounter};

lazy_static! {
    pub static ref CACHE_HIT_TOTAL: IntCounter = register_int_counter!(opts!(
        "dns_resolver_cache_hit_total",
        "Total number of cache hits."
    ))
    .unwrap();
    pub static ref CACHE_MISS_TOTAL: IntCounter = register_int_counter!(opts!(
        "dns_resolver_cache_miss_total",
        "Total number of cache misses."
    ))
    .unwrap();
    pub static ref NAMESERVER_HIT_TOTAL: IntCounter = register_int_counter!(opts!(
        "dns_resolver_nameserver_hit_total",
        "Total number of hits when calling an upstream nameserver."
    ))
    .unwrap();
    pub static ref NAMESERVER_MISS_TOTAL: IntCounter = register_int_counter!(opts!(
        "dns_resolver_nameserver_miss_total",
        "Total number of misses (timeouts) when calling an upstream nameserver."
    ))
    .unwrap();
    pub static ref NO_CONNECTIVITY_TOTAL: IntCounter = register_int_counter!(opts!(
        "dns_resolver_no_connectivity_total",
        "Total number of resolutions that exhausted every candidate server."
    ))
    .unwrap();
}

/// Per-request counters, built up while resolving a single question.
#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub nameserver_hits: u64,
    pub nameserver_misses: u64,
    pub no_connectivity: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn cache_miss(&mut self) {
        self.cache_misses += 1;
    }

    pub fn nameserver_hit(&mut self) {
        self.nameserver_hits += 1;
    }

    pub fn nameserver_miss(&mut self) {
        self.nameserver_misses += 1;
    }

    pub fn no_connectivity(&mut self) {
        self.no_connectivity += 1;
    }

    /// Folds this request's counts into the process-wide Prometheus
    /// counters. Called once, after the request finishes.
    pub fn record_global(&self) {
        CACHE_HIT_TOTAL.inc_by(self.cache_hits);
        CACHE_MISS_TOTAL.inc_by(self.cache_misses);
        NAMESERVER_HIT_TOTAL.inc_by(self.nameserver_hits);
        NAMESERVER_MISS_TOTAL.inc_by(self.nameserver_misses);
        NO_CONNECTIVITY_TOTAL.inc_by(self.no_connectivity);
    }
}
