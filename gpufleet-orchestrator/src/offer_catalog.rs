//! Offer search, client-side re-filtering, ranking and the relaxation ladder.

use crate::retry::{retry, with_timeout, RetryPolicy};
use gpufleet_common::gpu_patterns::{gpu_matches_patterns, gpu_name_contains_any};
use gpufleet_common::{FleetError, FleetResult, Offer, RelaxationAttempt};
use gpufleet_providers::{Marketplace, OfferQuery};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const VRAM_STEP_MB: u64 = 4096;
const PRICE_STEP_FACTOR: f64 = 1.5;
const RELIABILITY_STEP: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct OfferConstraints {
    /// Per-GPU VRAM floor.
    pub min_vram_mb: u64,
    /// None = no ceiling.
    pub max_price_per_hour: Option<f64>,
    pub min_reliability: f64,
    pub num_gpus: u32,
    /// Hard allow-list of GPU name patterns (`*` wildcards). Empty = any.
    pub gpu_allow: Vec<String>,
    /// GPU name substrings that are never acceptable.
    pub gpu_deny: Vec<String>,
    pub mobile_markers: Vec<String>,
    /// Soft preference: restrict to these models when any are available.
    pub preferred_gpus: Vec<String>,
    /// Reject instead of falling back when no preferred model is available.
    pub strict_preferred: bool,
    pub host_allow: Vec<String>,
    pub host_deny: Vec<String>,
    pub min_inet_down_mbps: f64,
    pub min_inet_up_mbps: f64,
    pub datacenter_only: bool,
    pub verified_only: bool,
    pub search_limit: usize,
}

impl Default for OfferConstraints {
    fn default() -> Self {
        Self {
            min_vram_mb: 16 * 1024,
            max_price_per_hour: Some(0.60),
            min_reliability: 0.95,
            num_gpus: 1,
            gpu_allow: Vec::new(),
            gpu_deny: Vec::new(),
            mobile_markers: gpufleet_common::gpu_patterns::parse_patterns(
                None,
                gpufleet_common::gpu_patterns::DEFAULT_MOBILE_GPU_MARKERS,
            ),
            preferred_gpus: Vec::new(),
            strict_preferred: false,
            host_allow: Vec::new(),
            host_deny: Vec::new(),
            min_inet_down_mbps: 100.0,
            min_inet_up_mbps: 50.0,
            datacenter_only: false,
            verified_only: true,
            search_limit: 64,
        }
    }
}

impl OfferConstraints {
    /// The subset of constraints the marketplace understands server-side.
    pub fn to_query(&self) -> OfferQuery {
        OfferQuery {
            min_vram_mb: self.min_vram_mb,
            max_price_per_hour: self.max_price_per_hour,
            min_reliability: self.min_reliability,
            num_gpus: self.num_gpus,
            verified_only: self.verified_only,
            datacenter_only: self.datacenter_only,
            min_inet_down_mbps: self.min_inet_down_mbps,
            limit: self.search_limit,
        }
    }

    fn attempt(&self, step: Relaxation, candidates: usize) -> RelaxationAttempt {
        RelaxationAttempt {
            step: step.as_str().to_string(),
            max_price: self.max_price_per_hour,
            min_vram_mb: self.min_vram_mb,
            min_reliability: self.min_reliability,
            candidates,
        }
    }
}

/// Rungs of the fallback ladder, applied cumulatively in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relaxation {
    None,
    RaisePrice,
    LowerVram,
    LowerReliability,
    DropGpuAllowList,
    DropVerifiedOnly,
    /// Drops bandwidth floors, datacenter-only and the host allow-list. The
    /// price ceiling and every deny-list still apply.
    BroadSweep,
}

impl Relaxation {
    pub const LADDER: [Relaxation; 7] = [
        Relaxation::None,
        Relaxation::RaisePrice,
        Relaxation::LowerVram,
        Relaxation::LowerReliability,
        Relaxation::DropGpuAllowList,
        Relaxation::DropVerifiedOnly,
        Relaxation::BroadSweep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Relaxation::None => "initial",
            Relaxation::RaisePrice => "raise_price",
            Relaxation::LowerVram => "lower_vram",
            Relaxation::LowerReliability => "lower_reliability",
            Relaxation::DropGpuAllowList => "drop_gpu_allow_list",
            Relaxation::DropVerifiedOnly => "drop_verified_only",
            Relaxation::BroadSweep => "broad_sweep",
        }
    }

    fn apply(&self, c: &mut OfferConstraints) {
        match self {
            Relaxation::None => {}
            Relaxation::RaisePrice => {
                c.max_price_per_hour = c.max_price_per_hour.map(|p| p * PRICE_STEP_FACTOR);
            }
            Relaxation::LowerVram => c.min_vram_mb = c.min_vram_mb.saturating_sub(VRAM_STEP_MB),
            Relaxation::LowerReliability => {
                c.min_reliability = (c.min_reliability - RELIABILITY_STEP).max(0.0);
            }
            Relaxation::DropGpuAllowList => c.gpu_allow.clear(),
            Relaxation::DropVerifiedOnly => c.verified_only = false,
            Relaxation::BroadSweep => {
                c.min_inet_down_mbps = 0.0;
                c.min_inet_up_mbps = 0.0;
                c.datacenter_only = false;
                c.host_allow.clear();
            }
        }
    }
}

/// Every rung with the constraints in effect at that rung.
pub fn relaxation_ladder(base: &OfferConstraints) -> Vec<(Relaxation, OfferConstraints)> {
    let mut current = base.clone();
    Relaxation::LADDER
        .iter()
        .map(|step| {
            step.apply(&mut current);
            (*step, current.clone())
        })
        .collect()
}

/// Re-apply every numeric and string constraint; the marketplace's own
/// filtering is not trusted. Offers without a parsable price never pass.
pub fn filter_offers(offers: Vec<Offer>, c: &OfferConstraints) -> Vec<Offer> {
    offers
        .into_iter()
        .filter(|o| {
            let reason = rejection_reason(o, c);
            if let Some(r) = reason {
                debug!("[offers] drop {} ({}): {}", o.id, o.gpu_name, r);
            }
            reason.is_none()
        })
        .collect()
}

fn rejection_reason(o: &Offer, c: &OfferConstraints) -> Option<&'static str> {
    if !o.has_parsable_price() {
        return Some("unparsable price");
    }
    if let Some(max) = c.max_price_per_hour {
        if o.price_per_hour > max {
            return Some("above price ceiling");
        }
    }
    if o.vram_mb < c.min_vram_mb {
        return Some("not enough VRAM");
    }
    if o.num_gpus < c.num_gpus.max(1) {
        return Some("not enough GPUs");
    }
    if o.reliability < c.min_reliability {
        return Some("reliability below floor");
    }
    if !c.gpu_allow.is_empty() && !gpu_matches_patterns(&o.gpu_name, &c.gpu_allow) {
        return Some("GPU not in allow-list");
    }
    if !c.host_allow.is_empty() && !c.host_allow.iter().any(|h| h == &o.host_id) {
        return Some("host not in allow-list");
    }
    if o.inet_down_mbps < c.min_inet_down_mbps {
        return Some("download bandwidth below floor");
    }
    if o.inet_up_mbps < c.min_inet_up_mbps {
        return Some("upload bandwidth below floor");
    }
    if c.datacenter_only && !o.datacenter {
        return Some("not a datacenter host");
    }
    if c.verified_only && !o.verified {
        return Some("not verified");
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    NotRequested,
    Matched,
    /// Preferred models were requested but none survived filtering.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ranked {
    pub offers: Vec<Offer>,
    pub preference: Preference,
}

/// Drop blacklisted hosts and GPU names, restrict to preferred models when
/// possible, and order cheapest-first (reliability breaks ties).
pub fn rank_offers(offers: Vec<Offer>, c: &OfferConstraints) -> Ranked {
    let mut allowed: Vec<Offer> = offers
        .into_iter()
        .filter(|o| o.has_parsable_price())
        .filter(|o| {
            if c.host_deny.iter().any(|h| h == &o.host_id) {
                debug!("[offers] drop {}: host {} blacklisted", o.id, o.host_id);
                return false;
            }
            if let Some(m) = gpu_name_contains_any(&o.gpu_name, &c.gpu_deny)
                .or_else(|| gpu_name_contains_any(&o.gpu_name, &c.mobile_markers))
            {
                debug!("[offers] drop {}: GPU {} matches {}", o.id, o.gpu_name, m);
                return false;
            }
            true
        })
        .collect();

    let preference = if c.preferred_gpus.is_empty() {
        Preference::NotRequested
    } else {
        let preferred: Vec<Offer> = allowed
            .iter()
            .filter(|o| gpu_matches_patterns(&o.gpu_name, &c.preferred_gpus))
            .cloned()
            .collect();
        if preferred.is_empty() {
            Preference::Unavailable
        } else {
            allowed = preferred;
            Preference::Matched
        }
    };

    allowed.sort_by(|a, b| {
        a.price_per_hour
            .total_cmp(&b.price_per_hour)
            .then(b.reliability.total_cmp(&a.reliability))
    });
    Ranked {
        offers: allowed,
        preference,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfferSelection {
    /// Cheapest first; never empty.
    pub offers: Vec<Offer>,
    pub relaxation: Relaxation,
    /// Constraints of the rung that produced the offers.
    pub constraints: OfferConstraints,
    pub preference: Preference,
    pub history: Vec<RelaxationAttempt>,
}

impl OfferSelection {
    pub fn cheapest(&self) -> &Offer {
        &self.offers[0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Found(OfferSelection),
    /// Strict preference could not be honoured at the first rung with candidates.
    Rejected {
        reason: String,
        relaxation: Relaxation,
        history: Vec<RelaxationAttempt>,
    },
}

pub struct OfferCatalog {
    marketplace: Arc<dyn Marketplace>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl OfferCatalog {
    pub fn new(marketplace: Arc<dyn Marketplace>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            marketplace,
            retry,
            call_timeout,
        }
    }

    async fn search(&self, c: &OfferConstraints) -> FleetResult<Vec<Offer>> {
        let query = c.to_query();
        let limit = self.call_timeout;
        retry(&self.retry, "search_offers", |_| {
            let marketplace = self.marketplace.clone();
            let query = query.clone();
            async move {
                with_timeout(limit, "search_offers", marketplace.search_offers(&query)).await
            }
        })
        .await
        .map_err(|e| FleetError::marketplace(format!("{:#}", e)))
    }

    /// Walk the relaxation ladder once and return the first non-empty rung.
    pub async fn query(&self, constraints: &OfferConstraints) -> FleetResult<Selection> {
        let mut history = Vec::new();
        for (step, c) in relaxation_ladder(constraints) {
            let raw = self.search(&c).await?;
            let returned = raw.len();
            let ranked = rank_offers(filter_offers(raw, &c), &c);
            history.push(c.attempt(step, ranked.offers.len()));
            info!(
                "[offers] step {}: {} returned, {} acceptable (max_price={:?}, min_vram={}MB, min_rel={:.2})",
                step.as_str(),
                returned,
                ranked.offers.len(),
                c.max_price_per_hour,
                c.min_vram_mb,
                c.min_reliability
            );

            if ranked.offers.is_empty() {
                continue;
            }
            if ranked.preference == Preference::Unavailable {
                if c.strict_preferred {
                    let reason = format!(
                        "no preferred GPU ({}) among {} acceptable offer(s)",
                        c.preferred_gpus.join(","),
                        ranked.offers.len()
                    );
                    warn!("[offers] {}", reason);
                    return Ok(Selection::Rejected {
                        reason,
                        relaxation: step,
                        history,
                    });
                }
                info!("[offers] no preferred GPU available, falling back to cheapest overall");
            }
            return Ok(Selection::Found(OfferSelection {
                offers: ranked.offers,
                relaxation: step,
                constraints: c,
                preference: ranked.preference,
                history,
            }));
        }
        warn!("[offers] relaxation ladder exhausted after {} step(s)", history.len());
        Err(FleetError::NoOffersFound { history })
    }

    /// Cheapest acceptable offer, or an error. A strict-preference rejection
    /// becomes `OfferRejected`.
    pub async fn select_cheapest(&self, constraints: &OfferConstraints) -> FleetResult<OfferSelection> {
        match self.query(constraints).await? {
            Selection::Found(sel) => {
                let o = sel.cheapest();
                info!(
                    "[offers] selected {} {} x{} at ${:.3}/h (step {})",
                    o.id,
                    o.gpu_name,
                    o.num_gpus,
                    o.price_per_hour,
                    sel.relaxation.as_str()
                );
                Ok(sel)
            }
            Selection::Rejected { reason, .. } => Err(FleetError::OfferRejected { reason }),
        }
    }
}
