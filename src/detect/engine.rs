//! Detector: the periodic evaluation loop.
//!
//! One instance per deployment, enforced by an advisory lease. Each tick
//! refreshes the rule snapshot, discovers the live traffic slices from the
//! counter scan, evaluates every active rule against them, and drives the
//! incident lifecycle (open / refresh / suppress / recover).

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use rusqlite::OptionalExtension;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::incident::{IncidentManager, NewIncident};
use super::trend::{self, MinuteCounts, WindowCounts};
use super::{DetectError, RootCause, Severity, SuggestedAction};
use crate::config::Config;
use crate::ingest::event::EventStatus;
use crate::metrics::{minute_bucket, Dimension, MemoryMetricStore, RESPONSE_CODE_NS};
use crate::rules::{MetricType, Rule, RuleRegistry};
use crate::storage::events::IssuerImpact;
use crate::storage::{self, events, Pool, DETECTOR_LEASE};

/// A tick must finish inside this budget; the interval itself is 10 s.
const TICK_BUDGET: StdDuration = StdDuration::from_secs(8);

const LEASE_TTL_SECONDS: i64 = 60;

/// An error-rate observation above this is CRITICAL no matter what the rule
/// says.
const ERROR_RATE_PROMOTION: f64 = 0.30;

const TRY_AGAIN_LATER: &str = "TRY_AGAIN_LATER";

/// Fallback SLA countdown when the merchant has no baseline row.
const DEFAULT_SLA_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The rule's condition held for this dimension.
    Firing,
    /// Evaluated and healthy; recovery may apply.
    NotFiring,
    /// A guard clause (sample floor, empty denominator) skipped it.
    Skipped,
}

struct RulesCache {
    rules: Vec<Rule>,
    refreshed_at: Option<Instant>,
}

pub struct Detector {
    pool: Pool,
    store: Arc<MemoryMetricStore>,
    incidents: IncidentManager,
    registry: RuleRegistry,
    cfg: Arc<Config>,
    enrich_tx: mpsc::Sender<Uuid>,
    instance_id: String,
    cache: Mutex<RulesCache>,
}

impl Detector {
    pub fn new(
        pool: Pool,
        store: Arc<MemoryMetricStore>,
        cfg: Arc<Config>,
        enrich_tx: mpsc::Sender<Uuid>,
    ) -> Self {
        Self {
            incidents: IncidentManager::new(pool.clone()),
            registry: RuleRegistry::new(pool.clone()),
            pool,
            store,
            cfg,
            enrich_tx,
            instance_id: Uuid::new_v4().to_string(),
            cache: Mutex::new(RulesCache {
                rules: Vec::new(),
                refreshed_at: None,
            }),
        }
    }

    /// Take the detector lease before the loop starts. A held lease means a
    /// second detector is running against this store.
    pub fn acquire_startup_lease(&self) -> Result<(), DetectError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| DetectError::Storage(e.to_string()))?;
        let acquired =
            storage::acquire_lease(&conn, DETECTOR_LEASE, &self.instance_id, LEASE_TTL_SECONDS)
                .map_err(|e| DetectError::Storage(e.to_string()))?;
        if acquired {
            Ok(())
        } else {
            Err(DetectError::LeaseHeld)
        }
    }

    /// The periodic loop. Ticks never overlap: an over-budget tick delays the
    /// next one instead of running beside it.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(StdDuration::from_secs(self.cfg.tick_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(instance = %self.instance_id, "detector loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let detector = self.clone();
            let started = Instant::now();
            let mut handle = tokio::task::spawn_blocking(move || detector.tick(Utc::now()));

            let result = match tokio::time::timeout(TICK_BUDGET, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("detector tick exceeded its budget; next tick is delayed");
                    handle.await
                }
            };
            match result {
                Ok(Ok(())) => debug!(elapsed_ms = started.elapsed().as_millis() as u64, "tick done"),
                Ok(Err(e)) => warn!(error = %e, "detector tick failed"),
                Err(e) => warn!(error = %e, "detector tick panicked"),
            }
        }

        if let Ok(conn) = self.pool.get() {
            let _ = storage::release_lease(&conn, DETECTOR_LEASE, &self.instance_id);
        }
        info!("detector loop stopped");
    }

    /// One full evaluation pass. Public so tests can drive time explicitly.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        self.renew_lease()?;
        self.refresh_rules_if_stale()?;

        let swept = self.store.sweep();
        if swept > 0 {
            debug!(swept, "expired metric buckets dropped");
        }

        let rules = self.cache.lock().unwrap().rules.clone();
        if rules.is_empty() {
            return Ok(());
        }

        let max_window = rules
            .iter()
            .map(|r| r.metric_type.window_minutes(self.cfg.window_minutes_rate))
            .max()
            .unwrap_or(self.cfg.window_minutes_rate);
        let live = self.live_dimensions(now, max_window);

        for rule in &rules {
            // A faulty rule must not take the loop down with it.
            if let Err(e) = self.evaluate_rule(rule, &live, now) {
                warn!(rule_id = %rule.rule_id, error = %e, "rule evaluation failed; retrying next tick");
            }
        }

        self.rescue_stalled_enrichment()?;
        Ok(())
    }

    fn renew_lease(&self) -> Result<()> {
        let conn = self.pool.get()?;
        let held =
            storage::acquire_lease(&conn, DETECTOR_LEASE, &self.instance_id, LEASE_TTL_SECONDS)?;
        if !held {
            anyhow::bail!("lost detector lease to another instance");
        }
        Ok(())
    }

    fn refresh_rules_if_stale(&self) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        let stale = cache
            .refreshed_at
            .map_or(true, |t| t.elapsed().as_secs() >= self.cfg.rule_refresh_seconds);
        if stale {
            cache.rules = self.registry.load_active()?;
            cache.refreshed_at = Some(Instant::now());
            debug!(count = cache.rules.len(), "rule snapshot refreshed");
        }
        Ok(())
    }

    /// Concrete traffic slices currently visible in the counter scan.
    fn live_dimensions(&self, now: DateTime<Utc>, window_minutes: i64) -> HashSet<Dimension> {
        let now_bucket = minute_bucket(now);
        let range = (now_bucket - window_minutes + 1)..(now_bucket + 1);

        let mut dims = HashSet::new();
        for (key, _bucket, _count) in self.store.scan(range) {
            if key.starts_with(RESPONSE_CODE_NS) {
                continue;
            }
            // Strip the trailing status segment.
            if let Some(prefix) = key.rsplit_once('/').map(|(p, _)| p) {
                if let Some(dim) = Dimension::parse(prefix) {
                    dims.insert(dim);
                }
            }
        }
        dims
    }

    fn evaluate_rule(
        &self,
        rule: &Rule,
        live: &HashSet<Dimension>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !rule.applies_at_hour(now.hour() as u8) {
            return Ok(());
        }

        let window = rule.metric_type.window_minutes(self.cfg.window_minutes_rate);
        let mut firing_keys: HashSet<String> = HashSet::new();

        for dim in candidate_dimensions(rule, live) {
            if self.evaluate_dimension(rule, &dim, now, window)? == Outcome::Firing {
                firing_keys.insert(dim.prefix());
            }
        }

        // Recovery pass: live incidents of this rule whose dimension did not
        // fire this tick, including slices whose counters have gone quiet.
        for (incident_id, dim_key, _state) in self.incidents.live_for_rule(rule.rule_id)? {
            if firing_keys.contains(&dim_key) {
                continue;
            }
            if let Some(dim) = Dimension::parse(&dim_key) {
                self.check_recovery(rule, incident_id, &dim, now)?;
            }
        }
        Ok(())
    }

    fn window_counts(&self, dim: &Dimension, now: DateTime<Utc>, window: i64) -> WindowCounts {
        let now_bucket = minute_bucket(now);
        let range = (now_bucket - window + 1)..(now_bucket + 1);

        let mut by_bucket: BTreeMap<i64, MinuteCounts> = BTreeMap::new();
        for status in [
            EventStatus::Created,
            EventStatus::Succeeded,
            EventStatus::Declined,
            EventStatus::Error,
            EventStatus::Rejected,
        ] {
            let key = dim.status_key(status);
            for (bucket, count) in self.store.series(&key, range.clone()) {
                by_bucket
                    .entry(bucket)
                    .or_insert_with(|| MinuteCounts {
                        bucket,
                        ..Default::default()
                    })
                    .add_status(status, count);
            }
        }
        WindowCounts {
            minutes: by_bucket.into_values().collect(),
        }
    }

    fn evaluate_dimension(
        &self,
        rule: &Rule,
        dim: &Dimension,
        now: DateTime<Utc>,
        window: i64,
    ) -> Result<Outcome> {
        let counts = self.window_counts(dim, now, window);

        let sample = counts.sample_size(rule.metric_type);
        if sample < rule.min_transactions {
            return Ok(Outcome::Skipped);
        }
        let Some(observed) = counts.observed(rule.metric_type) else {
            return Ok(Outcome::Skipped);
        };

        if !rule.operator.compare(observed, rule.threshold) {
            return Ok(Outcome::NotFiring);
        }

        let adverse_total = counts.adverse_total(rule.metric_type);
        let affected = if rule.metric_type.is_rate() {
            adverse_total
        } else {
            sample
        };
        let dimension_key = dim.prefix();
        let since = now - Duration::minutes(window);
        let adverse = rule.metric_type.adverse_statuses();

        // A live incident is refreshed in place; never duplicated.
        if let Some((incident_id, _)) = self.incidents.live_incident(rule.rule_id, &dimension_key)? {
            let revenue = self.adverse_revenue(dim, adverse, since)?;
            self.incidents.refresh(incident_id, observed, affected, revenue)?;
            return Ok(Outcome::Firing);
        }

        let min_adverse = rule
            .min_consecutive_errors
            .unwrap_or(self.cfg.min_consecutive_errors);
        if !trend::confirm_trend(
            &counts,
            rule.metric_type,
            rule.operator,
            rule.threshold,
            min_adverse,
        ) {
            debug!(rule_id = %rule.rule_id, dimension = %dimension_key, "condition met but trend not persistent yet");
            return Ok(Outcome::Firing);
        }

        if self
            .incidents
            .closed_within(rule.rule_id, &dimension_key, self.cfg.cooldown_seconds)?
        {
            info!(rule_id = %rule.rule_id, dimension = %dimension_key, "re-fire inside cooldown, suppressing");
            self.incidents.suppress(
                rule.rule_id,
                &dimension_key,
                rule.severity,
                observed,
                self.cfg.cooldown_seconds,
            )?;
            return Ok(Outcome::Firing);
        }

        // Build the incident context from the event log and side counters.
        let revenue = self.adverse_revenue(dim, adverse, since)?;
        let breakdown = self.response_code_breakdown(dim, now, window);
        let (issuers, advice_override) = {
            if adverse.is_empty() {
                (Vec::new(), false)
            } else {
                let conn = self.pool.get()?;
                let issuers = events::issuer_breakdown(&conn, dim, adverse, since)?;
                let advice =
                    events::advice_code_majority(&conn, dim, adverse, since, TRY_AGAIN_LATER)?;
                (issuers, advice)
            }
        };

        let severity = promote_severity(rule.severity, rule.metric_type, observed);
        let baseline_approval = self.baseline_approval_rate(dim)?;
        let (root_cause, suggested_action) = build_diagnosis(
            rule,
            dim,
            observed,
            &breakdown,
            &issuers,
            advice_override,
            baseline_approval,
        );
        let confidence = confidence_score(affected, &issuers);
        let sla = self.sla_countdown(dim, severity)?;

        let new = NewIncident {
            rule_id: rule.rule_id,
            dimension_key: dimension_key.clone(),
            severity,
            observed_value: observed,
            affected_transactions: affected,
            revenue_at_risk_usd: revenue,
            response_code_breakdown: serde_json::to_value(&breakdown)?,
            root_cause,
            suggested_action,
            confidence_score: confidence,
            sla_breach_countdown_seconds: sla,
        };
        let incident_id = self.incidents.open(&new).context("opening incident")?;
        info!(
            %incident_id,
            rule_id = %rule.rule_id,
            dimension = %dimension_key,
            severity = severity.as_str(),
            observed,
            affected,
            revenue_usd = revenue,
            "incident opened"
        );

        if self.incidents.mark_enriching(incident_id)? {
            if self.enrich_tx.try_send(incident_id).is_err() {
                warn!(%incident_id, "enrichment queue full; will be rescued next tick");
            }
        }
        Ok(Outcome::Firing)
    }

    fn adverse_revenue(
        &self,
        dim: &Dimension,
        adverse: &[EventStatus],
        since: DateTime<Utc>,
    ) -> Result<f64> {
        if adverse.is_empty() {
            return Ok(0.0);
        }
        let conn = self.pool.get()?;
        events::adverse_revenue(&conn, dim, adverse, since)
    }

    /// Aggregate the `rc/` side counters that fall inside this dimension.
    fn response_code_breakdown(
        &self,
        dim: &Dimension,
        now: DateTime<Utc>,
        window: i64,
    ) -> BTreeMap<String, u64> {
        let now_bucket = minute_bucket(now);
        let range = (now_bucket - window + 1)..(now_bucket + 1);

        let matches = |filter: &Option<String>, value: &str| {
            filter.as_deref().map_or(true, |f| f == value)
        };

        let mut map = BTreeMap::new();
        for (key, _bucket, count) in self.store.scan(range) {
            let parts: Vec<&str> = key.split('/').collect();
            if parts.len() != 5 || parts[0] != RESPONSE_CODE_NS {
                continue;
            }
            if matches(&dim.merchant, parts[1])
                && matches(&dim.country, parts[2])
                && matches(&dim.provider, parts[3])
            {
                *map.entry(parts[4].to_string()).or_insert(0) += count;
            }
        }
        map
    }

    /// The merchant's long-run approval rate, when a baseline row exists.
    fn baseline_approval_rate(&self, dim: &Dimension) -> Result<Option<f64>> {
        let Some(merchant) = &dim.merchant else {
            return Ok(None);
        };
        let conn = self.pool.get()?;
        let rate: Option<Option<f64>> = conn
            .query_row(
                "SELECT avg_approval_rate FROM merchant_baselines WHERE merchant_id = ?1",
                rusqlite::params![merchant],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rate.flatten())
    }

    fn sla_countdown(&self, dim: &Dimension, severity: Severity) -> Result<Option<i64>> {
        if severity != Severity::Critical {
            return Ok(None);
        }
        let Some(merchant) = &dim.merchant else {
            return Ok(Some(DEFAULT_SLA_SECONDS));
        };
        let conn = self.pool.get()?;
        let sla_minutes: Option<i64> = conn
            .query_row(
                "SELECT sla_minutes FROM merchant_baselines WHERE merchant_id = ?1",
                rusqlite::params![merchant],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Some(
            sla_minutes.map(|m| m * 60).unwrap_or(DEFAULT_SLA_SECONDS),
        ))
    }

    fn check_recovery(
        &self,
        rule: &Rule,
        incident_id: Uuid,
        dim: &Dimension,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let recovered = match rule.metric_type {
            MetricType::TotalVolume => {
                let last_minute = self.window_counts(dim, now, 1).totals().volume_total();
                trend::recovered_volume(rule.operator, rule.threshold, last_minute)
            }
            _ => {
                let conn = self.pool.get()?;
                let tail = events::recent_statuses(
                    &conn,
                    dim,
                    now - Duration::minutes(1),
                    self.cfg.recovery_threshold,
                )?;
                trend::recovered_rates(&tail, self.cfg.recovery_threshold)
            }
        };

        if recovered && self.incidents.recover(incident_id)? {
            info!(%incident_id, dimension = %dim.prefix(), "incident recovered on healthy traffic");
        }
        Ok(())
    }

    /// Re-queue ENRICHING incidents when the queue has drained, covering
    /// restarts and dropped sends.
    fn rescue_stalled_enrichment(&self) -> Result<()> {
        if self.enrich_tx.capacity() < self.enrich_tx.max_capacity() {
            return Ok(());
        }
        for incident_id in self.incidents.enriching_ids()? {
            let _ = self.enrich_tx.try_send(incident_id);
        }
        Ok(())
    }
}

/// Select the concrete slices a rule evaluates, at the most specific
/// pre-declared key granularity its filters imply.
fn candidate_dimensions(rule: &Rule, live: &HashSet<Dimension>) -> Vec<Dimension> {
    #[derive(PartialEq)]
    enum Shape {
        Issuer,
        MerchantProvider,
        GlobalProvider,
        MerchantCountry,
        MerchantOnly,
    }

    let shape = if rule.issuer.is_some() {
        Shape::Issuer
    } else if rule.provider.is_some() {
        if rule.merchant_id.is_some() {
            Shape::MerchantProvider
        } else {
            Shape::GlobalProvider
        }
    } else if rule.country.is_some() {
        if rule.merchant_id.is_some() {
            Shape::MerchantCountry
        } else {
            Shape::GlobalProvider
        }
    } else if rule.merchant_id.is_some() {
        Shape::MerchantOnly
    } else {
        Shape::GlobalProvider
    };

    let matches = |filter: &Option<String>, slot: &Option<String>| match filter {
        Some(f) => slot.as_deref() == Some(f.as_str()),
        None => true,
    };

    live.iter()
        .filter(|d| {
            let shape_ok = match shape {
                Shape::Issuer => {
                    d.merchant.is_some()
                        && d.country.is_some()
                        && d.provider.is_some()
                        && d.issuer.is_some()
                }
                Shape::MerchantProvider => {
                    d.merchant.is_some()
                        && d.country.is_some()
                        && d.provider.is_some()
                        && d.issuer.is_none()
                }
                Shape::GlobalProvider => {
                    d.merchant.is_none()
                        && d.country.is_some()
                        && d.provider.is_some()
                        && d.issuer.is_none()
                }
                Shape::MerchantCountry => {
                    d.merchant.is_some()
                        && d.country.is_some()
                        && d.provider.is_none()
                        && d.issuer.is_none()
                }
                Shape::MerchantOnly => {
                    d.merchant.is_some()
                        && d.country.is_none()
                        && d.provider.is_none()
                        && d.issuer.is_none()
                }
            };
            shape_ok
                && matches(&rule.merchant_id, &d.merchant)
                && matches(&rule.country, &d.country)
                && matches(&rule.provider, &d.provider)
                && matches(&rule.issuer, &d.issuer)
        })
        .cloned()
        .collect()
}

fn promote_severity(base: Severity, metric: MetricType, observed: f64) -> Severity {
    if metric == MetricType::ErrorRate && observed > ERROR_RATE_PROMOTION {
        Severity::Critical
    } else {
        base
    }
}

/// Root cause and recommendation from the response-code profile, the issuer
/// breakdown, the provider advice codes, and the merchant baseline.
fn build_diagnosis(
    rule: &Rule,
    dim: &Dimension,
    observed: f64,
    breakdown: &BTreeMap<String, u64>,
    issuers: &[IssuerImpact],
    advice_override: bool,
    baseline_approval: Option<f64>,
) -> (RootCause, SuggestedAction) {
    let provider_label = dim.provider.clone().unwrap_or_else(|| "provider".to_string());
    let top_code = breakdown
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(code, _)| code.clone());

    let scope = if issuers.len() == 1 {
        format!("{} issuers only", issuers[0].issuer_name)
    } else if let Some(country) = &dim.country {
        format!("All {country} transactions")
    } else {
        "All transactions".to_string()
    };

    let metric_label = rule.metric_type.as_str();
    let mut issue = match &top_code {
        Some(code) => format!(
            "{metric_label} at {:.1}% with dominant response code {code}",
            observed * 100.0
        ),
        None => format!("{metric_label} at {:.1}% above configured threshold", observed * 100.0),
    };
    // Deviation context for decline/approval rules with a known baseline.
    if let Some(baseline) = baseline_approval {
        if matches!(
            rule.metric_type,
            MetricType::DeclineRate | MetricType::ApprovalRate
        ) {
            issue.push_str(&format!(
                "; merchant baseline approval rate is {:.1}%",
                baseline * 100.0
            ));
        }
    }

    let mut action = match top_code.as_deref() {
        Some("401") => SuggestedAction {
            label: format!("Update API keys for {provider_label}"),
            action_type: "UPDATE_CREDENTIALS".to_string(),
        },
        Some("57") => SuggestedAction {
            label: format!(
                "Review country rules for {}",
                dim.country.as_deref().unwrap_or("affected markets")
            ),
            action_type: "REVIEW_COMPLIANCE".to_string(),
        },
        _ if issuers.len() == 1 => SuggestedAction {
            label: format!("Failover {} to backup provider", issuers[0].issuer_name),
            action_type: "FAILOVER_PROVIDER".to_string(),
        },
        Some("502") | Some("503") | Some("504") => SuggestedAction {
            label: format!("Increase timeout or failover {provider_label}"),
            action_type: "INCREASE_TIMEOUT".to_string(),
        },
        Some("500") => SuggestedAction {
            label: format!("Contact {provider_label} support"),
            action_type: "CONTACT_PROVIDER".to_string(),
        },
        _ => SuggestedAction {
            label: format!("Pause traffic to {provider_label} temporarily"),
            action_type: "PAUSE_TRAFFIC".to_string(),
        },
    };

    if advice_override {
        action = SuggestedAction {
            label: format!("Pause traffic to {provider_label}"),
            action_type: "PAUSE_TRAFFIC".to_string(),
        };
    }

    let root_cause = RootCause {
        merchant: dim.merchant.clone(),
        country: dim.country.clone(),
        provider: dim.provider.clone(),
        issue,
        scope,
        response_code: top_code,
    };
    (root_cause, action)
}

/// Data-quality heuristic: more adverse samples and a pinpointed issuer give
/// the diagnosis more weight.
fn confidence_score(affected: u64, issuers: &[IssuerImpact]) -> f64 {
    let mut confidence: f64 = 0.5;
    if affected >= 10 {
        confidence += 0.2;
    }
    if affected >= 50 {
        confidence += 0.1;
    }
    if issuers.len() == 1 {
        confidence += 0.15;
    }
    if issuers.iter().any(|i| !i.sub_statuses.is_empty()) {
        confidence += 0.05;
    }
    confidence.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Operator;

    fn dim(m: Option<&str>, c: Option<&str>, p: Option<&str>, i: Option<&str>) -> Dimension {
        Dimension {
            merchant: m.map(str::to_string),
            country: c.map(str::to_string),
            provider: p.map(str::to_string),
            issuer: i.map(str::to_string),
        }
    }

    fn rule_with(
        merchant: Option<&str>,
        country: Option<&str>,
        provider: Option<&str>,
        issuer: Option<&str>,
    ) -> Rule {
        Rule {
            rule_id: Uuid::new_v4(),
            merchant_id: merchant.map(str::to_string),
            country: country.map(str::to_string),
            provider: provider.map(str::to_string),
            issuer: issuer.map(str::to_string),
            metric_type: MetricType::ErrorRate,
            operator: Operator::Gt,
            threshold: 0.1,
            min_transactions: 30,
            start_hour: None,
            end_hour: None,
            severity: Severity::Warning,
            min_consecutive_errors: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    fn live_set() -> HashSet<Dimension> {
        [
            dim(Some("shopito"), None, None, None),
            dim(Some("shopito"), Some("MX"), None, None),
            dim(Some("shopito"), Some("MX"), Some("STRIPE"), None),
            dim(Some("shopito"), Some("MX"), Some("STRIPE"), Some("BBVA")),
            dim(None, Some("MX"), Some("STRIPE"), None),
            dim(None, Some("BR"), Some("ADYEN"), None),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_candidates_merchant_provider_rule() {
        let rule = rule_with(Some("shopito"), Some("MX"), Some("STRIPE"), None);
        let dims = candidate_dimensions(&rule, &live_set());
        assert_eq!(dims.len(), 1);
        assert_eq!(dims[0].prefix(), "shopito/MX/STRIPE/_");
    }

    #[test]
    fn test_candidates_global_rule_fans_out_per_provider() {
        let rule = rule_with(None, None, None, None);
        let mut prefixes: Vec<String> =
            candidate_dimensions(&rule, &live_set()).iter().map(|d| d.prefix()).collect();
        prefixes.sort();
        assert_eq!(prefixes, vec!["_/BR/ADYEN/_", "_/MX/STRIPE/_"]);
    }

    #[test]
    fn test_candidates_country_rule_uses_global_slices() {
        let rule = rule_with(None, Some("MX"), None, None);
        let dims = candidate_dimensions(&rule, &live_set());
        assert_eq!(dims.len(), 1);
        assert_eq!(dims[0].prefix(), "_/MX/STRIPE/_");
    }

    #[test]
    fn test_candidates_issuer_rule() {
        let rule = rule_with(None, None, None, Some("BBVA"));
        let dims = candidate_dimensions(&rule, &live_set());
        assert_eq!(dims.len(), 1);
        assert_eq!(dims[0].prefix(), "shopito/MX/STRIPE/BBVA");
    }

    #[test]
    fn test_candidates_merchant_only_rule() {
        let rule = rule_with(Some("shopito"), None, None, None);
        let dims = candidate_dimensions(&rule, &live_set());
        assert_eq!(dims.len(), 1);
        assert_eq!(dims[0].prefix(), "shopito/_/_/_");
    }

    #[test]
    fn test_error_rate_promotion() {
        assert_eq!(
            promote_severity(Severity::Warning, MetricType::ErrorRate, 0.31),
            Severity::Critical
        );
        // Exactly the threshold stays as configured.
        assert_eq!(
            promote_severity(Severity::Warning, MetricType::ErrorRate, 0.30),
            Severity::Warning
        );
        assert_eq!(
            promote_severity(Severity::Warning, MetricType::DeclineRate, 0.9),
            Severity::Warning
        );
    }

    #[test]
    fn test_diagnosis_timeout_codes() {
        let rule = rule_with(Some("shopito"), Some("MX"), Some("STRIPE"), None);
        let d = dim(Some("shopito"), Some("MX"), Some("STRIPE"), None);
        let breakdown: BTreeMap<String, u64> =
            [("504".to_string(), 20), ("500".to_string(), 3)].into_iter().collect();

        let (cause, action) = build_diagnosis(&rule, &d, 0.3, &breakdown, &[], false, None);
        assert_eq!(action.action_type, "INCREASE_TIMEOUT");
        assert_eq!(cause.response_code.as_deref(), Some("504"));
        assert_eq!(cause.scope, "All MX transactions");
    }

    #[test]
    fn test_diagnosis_internal_error_code() {
        let rule = rule_with(None, Some("MX"), Some("STRIPE"), None);
        let d = dim(None, Some("MX"), Some("STRIPE"), None);
        let breakdown: BTreeMap<String, u64> = [("500".to_string(), 9)].into_iter().collect();
        let (_, action) = build_diagnosis(&rule, &d, 0.2, &breakdown, &[], false, None);
        assert_eq!(action.action_type, "CONTACT_PROVIDER");
    }

    #[test]
    fn test_diagnosis_advice_code_override() {
        let rule = rule_with(None, Some("MX"), Some("STRIPE"), None);
        let d = dim(None, Some("MX"), Some("STRIPE"), None);
        let breakdown: BTreeMap<String, u64> = [("504".to_string(), 9)].into_iter().collect();
        let (_, action) = build_diagnosis(&rule, &d, 0.2, &breakdown, &[], true, None);
        assert_eq!(action.action_type, "PAUSE_TRAFFIC");
    }

    #[test]
    fn test_diagnosis_single_issuer_failover() {
        let rule = rule_with(Some("shopito"), Some("MX"), Some("STRIPE"), None);
        let d = dim(Some("shopito"), Some("MX"), Some("STRIPE"), None);
        let issuers = vec![IssuerImpact {
            issuer_name: "BBVA".to_string(),
            count: 12,
            revenue_usd: 900.0,
            sub_statuses: vec!["TIMEOUT".to_string()],
        }];
        let (cause, action) =
            build_diagnosis(&rule, &d, 0.2, &BTreeMap::new(), &issuers, false, None);
        assert_eq!(action.action_type, "FAILOVER_PROVIDER");
        assert_eq!(cause.scope, "BBVA issuers only");
    }

    #[test]
    fn test_confidence_score_bumps() {
        assert!((confidence_score(5, &[]) - 0.5).abs() < 1e-9);
        assert!((confidence_score(10, &[]) - 0.7).abs() < 1e-9);
        let issuers = vec![IssuerImpact {
            issuer_name: "BBVA".to_string(),
            count: 60,
            revenue_usd: 1.0,
            sub_statuses: vec!["TIMEOUT".to_string()],
        }];
        let c = confidence_score(60, &issuers);
        assert!((c - 1.0).abs() < f64::EPSILON);
    }
}
