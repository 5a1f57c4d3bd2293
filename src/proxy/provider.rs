//! Proxy source fetching and probing.
//!
//! A small list of text/JSON proxy-list endpoints, deduplicated and
//! shuffled before being probed concurrently against a handful of exchange
//! REST endpoints, with an early-exit once the pool has enough healthy
//! entries again.

use std::time::Duration;

use rand::seq::SliceRandom;

use crate::models::ProxyProtocol;

use super::ProxyPool;

#[derive(Debug, Clone, Copy)]
pub enum ProxySourceFormat {
    /// One `ip:port` per line.
    PlainText,
    /// geonode-style JSON array of `{ip, port, protocols}` objects.
    Json,
}

#[derive(Debug, Clone)]
pub struct ProxySource {
    pub url: &'static str,
    pub format: ProxySourceFormat,
    pub protocol: ProxyProtocol,
}

/// Public proxy list providers polled to keep the pool topped up.
pub fn default_sources() -> Vec<ProxySource> {
    vec![
        ProxySource {
            url: "https://api.proxyscrape.com/v2/?request=getproxies&protocol=http",
            format: ProxySourceFormat::PlainText,
            protocol: ProxyProtocol::Http,
        },
        ProxySource {
            url: "https://api.proxyscrape.com/v2/?request=getproxies&protocol=socks5",
            format: ProxySourceFormat::PlainText,
            protocol: ProxyProtocol::Socks5,
        },
        ProxySource {
            url: "https://proxylist.geonode.com/api/proxy-list?limit=500&sort_by=lastChecked&sort_type=desc",
            format: ProxySourceFormat::Json,
            protocol: ProxyProtocol::Http,
        },
    ]
}

/// Candidate `ip:port` endpoints parsed out of a raw source response, not
/// yet health-tested.
#[derive(Debug, Clone)]
pub struct CandidateProxy {
    pub url: String,
    pub protocol: ProxyProtocol,
}

pub fn parse_plain_text(body: &str, protocol: ProxyProtocol) -> Vec<CandidateProxy> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && l.contains(':'))
        .map(|l| CandidateProxy {
            url: format!("{}://{}", protocol_scheme(protocol), l),
            protocol,
        })
        .collect()
}

fn protocol_scheme(protocol: ProxyProtocol) -> &'static str {
    match protocol {
        ProxyProtocol::Http => "http",
        ProxyProtocol::Socks5 => "socks5",
    }
}

/// Exchange endpoints used as connectivity probes, per
/// `EXCHANGE_TEST_URLS` in the Python source.
pub fn exchange_test_urls() -> &'static [(&'static str, &'static str)] {
    &[
        ("BINANCE", "https://api.binance.com/api/v3/ping"),
        ("OKX", "https://www.okx.com/api/v5/public/time"),
        ("BYBIT", "https://api.bybit.com/v5/market/time"),
        ("BITGET", "https://api.bitget.com/api/v2/public/time"),
    ]
}

/// Result of probing one candidate against one exchange endpoint.
pub struct ProbeOutcome {
    pub candidate: CandidateProxy,
    pub exchange: &'static str,
    pub reachable: bool,
}

/// Deduplicate and shuffle candidates before probing, capping at
/// `max_to_test` the way `fetch_all_proxies` caps `MAX_PROXIES_TO_TEST`.
pub fn prepare_candidates(mut candidates: Vec<CandidateProxy>, max_to_test: usize) -> Vec<CandidateProxy> {
    candidates.sort_by(|a, b| a.url.cmp(&b.url));
    candidates.dedup_by(|a, b| a.url == b.url);
    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(max_to_test);
    candidates
}

/// Orchestrates a refresh: probes candidates in batches, adding each
/// reachable one to the pool, stopping early once `min_active` is met
/// again — mirroring `refresh_free_proxies`'s early-exit behavior.
///
/// The actual HTTP probing is injected via `probe` so this function stays
/// unit-testable without a network connection.
pub async fn refresh<F, Fut>(
    pool: &ProxyPool,
    candidates: Vec<CandidateProxy>,
    min_active: usize,
    batch_size: usize,
    probe: F,
) where
    F: Fn(CandidateProxy) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for batch in candidates.chunks(batch_size) {
        if pool.active_count() >= min_active {
            break;
        }
        for candidate in batch {
            if probe(candidate.clone()).await {
                pool.add(candidate.url.clone(), candidate.protocol);
            }
        }
    }
}

impl Clone for CandidateProxy {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            protocol: self.protocol,
        }
    }
}

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text_ip_port_lines() {
        let body = "1.2.3.4:8080\n5.6.7.8:3128\n\nnot-a-proxy\n";
        let parsed = parse_plain_text(body, ProxyProtocol::Http);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].url, "http://1.2.3.4:8080");
    }

    #[test]
    fn prepare_candidates_dedupes_and_caps() {
        let candidates = vec![
            CandidateProxy { url: "http://1.1.1.1:80".into(), protocol: ProxyProtocol::Http },
            CandidateProxy { url: "http://1.1.1.1:80".into(), protocol: ProxyProtocol::Http },
            CandidateProxy { url: "http://2.2.2.2:80".into(), protocol: ProxyProtocol::Http },
        ];
        let prepared = prepare_candidates(candidates, 1);
        assert_eq!(prepared.len(), 1);
    }

    #[tokio::test]
    async fn refresh_stops_once_min_active_reached() {
        let pool = ProxyPool::new(1);
        let candidates = vec![
            CandidateProxy { url: "http://1.1.1.1:80".into(), protocol: ProxyProtocol::Http },
            CandidateProxy { url: "http://2.2.2.2:80".into(), protocol: ProxyProtocol::Http },
        ];
        refresh(&pool, candidates, 1, 1, |_| async { true }).await;
        assert_eq!(pool.active_count(), 1);
    }
}
