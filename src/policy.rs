//! The policy decision engine (§4.2): a fixed seven-step evaluation order
//! where every step can only narrow what a later step is allowed to decide.
//! A circuit-breaker trip or a quarantine hit is final; no rule, rate limit,
//! or anomaly score downstream can turn a denial back into an allow.
//!
//! ```text
//! 1. circuit breaker gate   -- host open?                 -> deny, stop
//! 2. quarantine gate        -- host/tool/agent hit?        -> deny, stop
//! 3. mode gate              -- lockdown?                   -> decide, stop
//! 4. rule match             -- first enabled rule, in priority order
//! 5. rate limit             -- matched rule's bucket, if any
//! 6. anomaly fold-in        -- annotate risk_score, never the decision
//! 7. default-for-unmatched  -- no rule matched: mode's default action
//! ```
//!
//! `silent-allow` and `alert` still run every call through rule matching;
//! only the default action taken when nothing matches (step 7) depends on
//! the mode. `lockdown` is the one mode that short-circuits at step 3, with
//! a single carve-out: a tool name containing "health" or "status" is still
//! admitted, with a risk score of zero, so operators can keep monitoring a
//! locked-down fleet.

use crate::anomaly::AnomalyDetector;
use crate::circuit_breaker::CircuitBreaker;
use crate::confirmation::ConfirmationTokens;
use crate::glob::glob_match;
use crate::quarantine::QuarantineRegistry;
use crate::rate_limiter::RateLimiter;
use crate::redact::canonical_json;
use crate::store::rules::{Rule, Schedule};
use crate::store::Store;
use crate::types::{Action, Mode, PolicyContext, PolicyVerdict, RiskFactor};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use regex::Regex;
use std::sync::Arc;
use std::str::FromStr;

pub struct PolicyEngine {
    store: Arc<Store>,
    circuit_breaker: CircuitBreaker,
    quarantine: QuarantineRegistry,
    rate_limiter: RateLimiter,
    anomaly: AnomalyDetector,
    confirmation: ConfirmationTokens,
}

impl PolicyEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            circuit_breaker: CircuitBreaker::new(store.clone(), Default::default()),
            quarantine: QuarantineRegistry::new(store.clone()),
            rate_limiter: RateLimiter::new(store.clone()),
            anomaly: AnomalyDetector::new(store.clone()),
            confirmation: ConfirmationTokens::new(store.clone()),
            store,
        }
    }

    fn default_action_for_mode(mode: Mode) -> Action {
        match mode {
            Mode::Alert => Action::Ask,
            Mode::SilentDeny => Action::Deny,
            Mode::SilentAllow => Action::Allow,
            // Unreachable in practice: lockdown is fully decided at step 3.
            Mode::Lockdown => Action::Deny,
        }
    }

    /// `true` if `tool` is exempt from the lockdown-mode denial, i.e. it
    /// names a health or status check rather than a mutating action.
    fn is_lockdown_exempt(tool: &str) -> bool {
        let lower = tool.to_ascii_lowercase();
        lower.contains("health") || lower.contains("status")
    }

    /// `[start_hour, end_hour]` is inclusive on both ends per §4.2 step 4.
    /// An empty `days` set is treated as "no day restriction" rather than
    /// "never matches" — consistent with every other optional predicate in
    /// `rule_matches`, where absence means the predicate is skipped.
    fn schedule_matches(schedule: &Schedule, now_ms: i64) -> bool {
        let utc = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let local_hour_weekday = match schedule.timezone.as_deref() {
            Some(tz_name) => match chrono_tz::Tz::from_str(tz_name) {
                Ok(tz) => {
                    let local = utc.with_timezone(&tz);
                    (local.hour() as u8, local.weekday().num_days_from_sunday() as u8)
                }
                Err(_) => {
                    let local = utc.with_timezone(&chrono::Local);
                    (local.hour() as u8, local.weekday().num_days_from_sunday() as u8)
                }
            },
            // Default system zone.
            None => {
                let local = utc.with_timezone(&chrono::Local);
                (local.hour() as u8, local.weekday().num_days_from_sunday() as u8)
            }
        };
        let (hour, weekday) = local_hour_weekday;

        if !schedule.days.is_empty() && !schedule.days.contains(&weekday) {
            return false;
        }

        if schedule.start_hour <= schedule.end_hour {
            hour >= schedule.start_hour && hour <= schedule.end_hour
        } else {
            // Wraps past midnight, e.g. 22..6.
            hour >= schedule.start_hour || hour <= schedule.end_hour
        }
    }

    fn rule_matches(rule: &Rule, ctx: &PolicyContext) -> Result<bool, regex::Error> {
        if let Some(pattern) = &rule.tool_pattern {
            if !glob_match(pattern, &ctx.tool) {
                return Ok(false);
            }
        }
        if let Some(pattern) = &rule.host_pattern {
            if !glob_match(pattern, &ctx.host) {
                return Ok(false);
            }
        }
        if let Some(pattern) = &rule.agent_pattern {
            if !glob_match(pattern, &ctx.agent) {
                return Ok(false);
            }
        }
        if let Some(pattern) = &rule.argument_pattern {
            let re = Regex::new(pattern)?;
            let canonical = canonical_json(&ctx.arguments);
            if !re.is_match(&canonical) {
                return Ok(false);
            }
        }
        if let Some(schedule) = &rule.schedule {
            if !Self::schedule_matches(schedule, ctx.timestamp_ms) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluates one inbound call. `previous_tool` is the last tool this
    /// agent invoked on this host, for the anomaly detector's bigram
    /// component; pass `None` for the first call in a session.
    pub async fn evaluate(
        &self,
        ctx: &PolicyContext,
        previous_tool: Option<&str>,
        now_ms: i64,
    ) -> Result<PolicyVerdict, crate::error::StoreError> {
        // Step 1: circuit breaker gate.
        if !self.circuit_breaker.admit(&ctx.host, now_ms).await? {
            return Ok(deny(
                format!("circuit breaker open for host {}", ctx.host),
                None,
                100.0,
                vec![],
            ));
        }

        // Step 2: quarantine gate.
        if let Some(entry) = self.quarantine.check(ctx, now_ms).await? {
            return Ok(deny(
                format!(
                    "quarantined: scope={} target={} reason={}",
                    entry.scope.as_str(),
                    entry.target,
                    entry.reason
                ),
                None,
                100.0,
                vec![],
            ));
        }

        // Step 3: mode gate. Only lockdown is fully decided here; every
        // other mode proceeds to rule matching and only falls back to its
        // default action (step 7) when nothing matches.
        let mode = self.store.get_mode().await?;
        if mode == Mode::Lockdown {
            if Self::is_lockdown_exempt(&ctx.tool) {
                return Ok(allow(
                    format!("lockdown mode: {} is a health/status check", ctx.tool),
                    None,
                    0.0,
                    vec![],
                ));
            }
            return Ok(deny("lockdown mode active".to_string(), None, 100.0, vec![]));
        }

        // Step 4: rule match, first enabled rule in priority order wins.
        let rules = self.store.list_enabled_rules_ordered().await?;
        let mut matched: Option<&Rule> = None;
        for rule in &rules {
            match Self::rule_matches(rule, ctx) {
                Ok(true) => {
                    matched = Some(rule);
                    break;
                }
                Ok(false) => continue,
                Err(_) => continue,
            }
        }

        let mut action = match matched {
            Some(rule) => rule.action,
            // Step 7 runs logically here when nothing matched, but is
            // computed now so steps 5/6 have a concrete action to refine.
            None => Self::default_action_for_mode(mode),
        };
        let matched_rule_id = matched.map(|r| r.id.clone());
        let mut reason = match matched {
            Some(rule) => format!("matched rule {} ({})", rule.id, rule.name),
            None => format!("no rule matched; default action for mode {mode}"),
        };

        // silent-deny never prompts: any would-be ask is a denial instead.
        if mode == Mode::SilentDeny && action == Action::Ask {
            action = Action::Deny;
            reason = format!("{reason}; silent-deny converts ask to deny");
        }

        // An ask action with a context-bound confirmation token already
        // presented is resolved right here: mark the token used and return
        // allow immediately, without consulting rate limiting or anomaly.
        if action == Action::Ask {
            if let Some(token) = &ctx.confirmation_token {
                if self.confirmation.consume(token, ctx, now_ms).await?.is_ok() {
                    return Ok(allow("confirmed via token".to_string(), matched_rule_id, 0.0, vec![]));
                }
            }
        }

        let mut risk_factors: Vec<RiskFactor> = Vec::new();
        let mut retry_after_seconds = None;

        // Step 5: rate limit, only for a matched rule that's otherwise
        // still admitting the call.
        if action != Action::Deny {
            if let (Some(rule), Some(spec)) = (matched, matched.and_then(|r| r.rate_limit.as_ref())) {
                let decision = self
                    .rate_limiter
                    .check_and_consume(&rule.id, &ctx.tool, &ctx.host, &ctx.agent, spec, now_ms)
                    .await?;
                if !decision.allowed {
                    action = Action::Deny;
                    retry_after_seconds = decision.retry_after_seconds;
                    reason = "rate limited".to_string();
                }
            }
        }

        // Step 6: anomaly fold-in. The computed score only annotates
        // risk_score/risk_factors on the verdict; it never changes `action`
        // itself. Operators who want enforcement must write a rule whose
        // argument_pattern or schedule consults the recorded risk factors.
        let mut risk_score = if action == Action::Deny { 100.0 } else { 0.0 };
        if action != Action::Deny {
            let anomaly_score = self
                .anomaly
                .score(&ctx.tool, &ctx.host, previous_tool, &ctx.arguments, now_ms)
                .await?;
            risk_factors.extend(anomaly_score.factors.clone());

            // risk = 0.6 * anomaly_composite + 0.4 * mean(other factor
            // scores); with no other risk-factor source feeding this
            // engine, the composite reduces to the pure anomaly score.
            risk_score = anomaly_score.total;
        }

        let allowed = matches!(action, Action::Allow | Action::LogOnly);
        let requires_confirmation = action == Action::Ask;
        let confirmation_token = if requires_confirmation {
            Some(self.confirmation.mint(ctx, now_ms).await?.token)
        } else {
            None
        };

        Ok(PolicyVerdict {
            allowed,
            action,
            reason,
            matched_rule_id,
            risk_score,
            risk_factors,
            requires_confirmation,
            confirmation_token,
            retry_after_seconds,
        })
    }
}

fn deny(
    reason: String,
    matched_rule_id: Option<String>,
    risk_score: f64,
    risk_factors: Vec<RiskFactor>,
) -> PolicyVerdict {
    PolicyVerdict {
        allowed: false,
        action: Action::Deny,
        reason,
        matched_rule_id,
        risk_score,
        risk_factors,
        requires_confirmation: false,
        confirmation_token: None,
        retry_after_seconds: None,
    }
}

fn allow(
    reason: String,
    matched_rule_id: Option<String>,
    risk_score: f64,
    risk_factors: Vec<RiskFactor>,
) -> PolicyVerdict {
    PolicyVerdict {
        allowed: true,
        action: Action::Allow,
        reason,
        matched_rule_id,
        risk_score,
        risk_factors,
        requires_confirmation: false,
        confirmation_token: None,
        retry_after_seconds: None,
    }
}
