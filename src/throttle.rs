//! Bot-to-bot exchange throttle.
//!
//! Autonomous candidates in a channel where bots keep answering each other
//! get a decaying chance to proceed, then are suppressed outright at the
//! hard limit. Bot-authored mentions and replies skip the draw but still
//! stop at the pause flag, the bot-chain cooldown and the hard limit. Any
//! human message resets the channel.

use crate::config::{RuntimeConfig, RuntimeSettings};
use crate::{ContextKey, TriggerKind};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Coarse state of a channel's exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePhase {
    /// No consecutive bot messages since the last human.
    Idle,
    /// Bots are exchanging; chance decays with each message.
    Decaying,
    /// Hard limit reached; autonomous candidates are refused.
    Suppressed,
}

/// Per-channel exchange counters.
#[derive(Debug, Clone, Default)]
pub struct ExchangeState {
    pub consecutive_bot_count: u32,
    /// Autonomous bot-triggered candidates are refused until this instant.
    pub cooldown_until: Option<Instant>,
    pub suppressed: bool,
}

impl ExchangeState {
    pub fn phase(&self) -> ExchangePhase {
        if self.suppressed {
            ExchangePhase::Suppressed
        } else if self.consecutive_bot_count > 0 {
            ExchangePhase::Decaying
        } else {
            ExchangePhase::Idle
        }
    }
}

/// Falloff tuning, copied out of the settings snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FalloffParams {
    pub enabled: bool,
    pub base_chance: f64,
    pub decay_rate: f64,
    pub min_chance: f64,
    pub hard_limit: u32,
}

impl FalloffParams {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            enabled: settings.bot_falloff_enabled,
            base_chance: settings.bot_falloff_base_chance,
            decay_rate: settings.bot_falloff_decay_rate,
            min_chance: settings.bot_falloff_min_chance,
            hard_limit: settings.bot_falloff_hard_limit,
        }
    }
}

impl Default for FalloffParams {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default())
    }
}

/// Chance that an autonomous candidate proceeds after `count` consecutive
/// bot messages.
///
/// `count == 0` is always 1.0 and `count >= hard_limit` is always 0.0.
/// Between them: `max(min_chance, base_chance - decay_rate * (count - 1))`.
/// With falloff disabled every count is 1.0.
pub fn response_chance(count: u32, params: &FalloffParams) -> f64 {
    if !params.enabled || count == 0 {
        return 1.0;
    }
    if count >= params.hard_limit {
        return 0.0;
    }
    let decayed = params.base_chance - params.decay_rate * f64::from(count - 1);
    decayed.max(params.min_chance).clamp(0.0, 1.0)
}

/// A response being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub trigger: TriggerKind,
    /// The triggering message was authored by a bot.
    pub from_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SuppressReason {
    /// Consecutive bot messages reached the hard limit.
    HardLimit,
    /// The falloff draw came up above the chance.
    Falloff { chance: f64 },
    /// The name-trigger draw failed.
    NameTrigger { chance: f64 },
    /// Still cooling down after answering a bot.
    Cooldown,
    /// Bot interactions are paused.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum ThrottleDecision {
    Proceed,
    Suppressed(SuppressReason),
}

impl ThrottleDecision {
    pub fn proceeds(&self) -> bool {
        matches!(self, ThrottleDecision::Proceed)
    }
}

/// Exchange state for one bot instance across all its channels.
pub struct BotExchangeThrottle {
    runtime: Arc<RuntimeConfig>,
    channels: Mutex<HashMap<ContextKey, ExchangeState>>,
    rng: Mutex<StdRng>,
}

impl BotExchangeThrottle {
    /// Throttle with an RNG seeded from the OS once per process.
    pub fn new(runtime: Arc<RuntimeConfig>) -> Self {
        Self::with_rng(runtime, StdRng::from_os_rng())
    }

    /// Throttle with a caller-supplied RNG, for deterministic draws.
    pub fn with_rng(runtime: Arc<RuntimeConfig>, rng: StdRng) -> Self {
        Self {
            runtime,
            channels: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// A human spoke: the channel returns to idle.
    pub fn observe_human(&self, key: &ContextKey) {
        if self.channels.lock().remove(key).is_some() {
            tracing::trace!(%key, "human message reset bot exchange");
        }
    }

    /// A bot-authored message (from any bot, this one included) was observed.
    pub fn observe_bot(&self, key: &ContextKey) {
        let params = FalloffParams::from_settings(&self.runtime.settings());
        let mut channels = self.channels.lock();
        let state = channels.entry(key.clone()).or_default();
        state.consecutive_bot_count = state.consecutive_bot_count.saturating_add(1);
        if params.enabled && state.consecutive_bot_count >= params.hard_limit && !state.suppressed {
            state.suppressed = true;
            tracing::info!(
                %key,
                count = state.consecutive_bot_count,
                "bot exchange hit hard limit, suppressing autonomous responses"
            );
        }
    }

    /// This instance answered a bot: start the bot-chain cooldown.
    pub fn note_replied_to_bot(&self, key: &ContextKey) {
        let cooldown = Duration::from_secs(self.runtime.settings().bot_chain_cooldown_seconds);
        if cooldown.is_zero() {
            return;
        }
        let mut channels = self.channels.lock();
        let state = channels.entry(key.clone()).or_default();
        state.cooldown_until = Some(Instant::now() + cooldown);
    }

    /// Current proceed chance for an autonomous candidate in `key`.
    pub fn chance(&self, key: &ContextKey) -> f64 {
        let params = FalloffParams::from_settings(&self.runtime.settings());
        let channels = self.channels.lock();
        match channels.get(key) {
            Some(state) if params.enabled && state.suppressed => 0.0,
            Some(state) => response_chance(state.consecutive_bot_count, &params),
            None => 1.0,
        }
    }

    /// Decide whether a candidate may proceed to generation.
    ///
    /// Direct triggers from humans always proceed. Anything a bot authored
    /// passes the pause and cooldown gates first; a bot mention or reply is
    /// then refused only at the hard limit, without a draw. Autonomous
    /// candidates take the name-trigger draw when applicable, then one draw
    /// against the current falloff chance.
    pub fn decide(&self, key: &ContextKey, candidate: Candidate) -> ThrottleDecision {
        if candidate.trigger.is_direct() && !candidate.from_bot {
            return ThrottleDecision::Proceed;
        }

        let settings = self.runtime.settings();
        let decision = match self.bot_gate(key, candidate, &settings) {
            Some(reason) => ThrottleDecision::Suppressed(reason),
            None if candidate.trigger.is_direct() => {
                if self.chance(key) <= 0.0 {
                    ThrottleDecision::Suppressed(SuppressReason::HardLimit)
                } else {
                    ThrottleDecision::Proceed
                }
            }
            None => self.decide_autonomous(key, candidate, &settings),
        };
        tracing::debug!(%key, trigger = %candidate.trigger, from_bot = candidate.from_bot, ?decision, "throttle decision");

        #[cfg(feature = "metrics")]
        crate::telemetry::Metrics::global()
            .throttle_decisions_total
            .with_label_values(&[if decision.proceeds() { "proceed" } else { "suppressed" }])
            .inc();

        decision
    }

    /// Pause and bot-chain cooldown, applied to every bot-authored candidate.
    fn bot_gate(
        &self,
        key: &ContextKey,
        candidate: Candidate,
        settings: &RuntimeSettings,
    ) -> Option<SuppressReason> {
        if !candidate.from_bot {
            return None;
        }
        if settings.bot_interactions_paused {
            return Some(SuppressReason::Paused);
        }
        let cooling = self
            .channels
            .lock()
            .get(key)
            .and_then(|state| state.cooldown_until)
            .is_some_and(|until| Instant::now() < until);
        cooling.then_some(SuppressReason::Cooldown)
    }

    fn decide_autonomous(
        &self,
        key: &ContextKey,
        candidate: Candidate,
        settings: &RuntimeSettings,
    ) -> ThrottleDecision {
        if candidate.trigger == TriggerKind::NameTrigger && !self.roll(settings.name_trigger_chance) {
            return ThrottleDecision::Suppressed(SuppressReason::NameTrigger {
                chance: settings.name_trigger_chance,
            });
        }

        let chance = self.chance(key);
        if chance <= 0.0 {
            return ThrottleDecision::Suppressed(SuppressReason::HardLimit);
        }
        if self.roll(chance) {
            ThrottleDecision::Proceed
        } else {
            ThrottleDecision::Suppressed(SuppressReason::Falloff { chance })
        }
    }

    /// One draw: true with probability `chance`.
    pub fn roll(&self, chance: f64) -> bool {
        if chance >= 1.0 {
            return true;
        }
        if !(chance > 0.0) {
            return false;
        }
        self.rng.lock().random::<f64>() < chance
    }

    /// Snapshot of a channel's state. Idle channels have no entry.
    pub fn state(&self, key: &ContextKey) -> ExchangeState {
        self.channels.lock().get(key).cloned().unwrap_or_default()
    }

    /// Forget a channel entirely, e.g. when its history is cleared.
    pub fn reset(&self, key: &ContextKey) {
        self.channels.lock().remove(key);
    }

    /// Every tracked channel with its phase and counters.
    pub fn snapshot(&self) -> Vec<ChannelExchange> {
        let params = FalloffParams::from_settings(&self.runtime.settings());
        let mut rows: Vec<_> = self
            .channels
            .lock()
            .iter()
            .map(|(key, state)| ChannelExchange {
                key: key.clone(),
                phase: state.phase(),
                consecutive_bot_count: state.consecutive_bot_count,
                chance: if params.enabled && state.suppressed {
                    0.0
                } else {
                    response_chance(state.consecutive_bot_count, &params)
                },
                cooling_down: state.cooldown_until.is_some_and(|until| Instant::now() < until),
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }
}

/// Serializable view of one channel for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelExchange {
    pub key: ContextKey,
    pub phase: ExchangePhase,
    pub consecutive_bot_count: u32,
    pub chance: f64,
    pub cooling_down: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ProviderSet;

    fn runtime(settings: RuntimeSettings) -> Arc<RuntimeConfig> {
        Arc::new(RuntimeConfig::new(settings, ProviderSet::default()))
    }

    fn throttle(settings: RuntimeSettings) -> BotExchangeThrottle {
        BotExchangeThrottle::with_rng(runtime(settings), StdRng::seed_from_u64(42))
    }

    const AUTONOMOUS_FROM_BOT: Candidate = Candidate {
        trigger: TriggerKind::Autonomous,
        from_bot: true,
    };

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[test]
    fn decay_sequence_with_defaults() {
        let params = FalloffParams::default();
        let expected = [
            1.0, 0.8, 0.65, 0.5, 0.35, 0.2, 0.05, 0.05, 0.05, 0.05, 0.0, 0.0,
        ];
        for (count, expected) in expected.into_iter().enumerate() {
            assert_close(response_chance(count as u32, &params), expected);
        }
    }

    #[test]
    fn disabled_falloff_always_proceeds() {
        let params = FalloffParams {
            enabled: false,
            ..FalloffParams::default()
        };
        assert_eq!(response_chance(50, &params), 1.0);

        let throttle = throttle(RuntimeSettings {
            bot_falloff_enabled: false,
            bot_chain_cooldown_seconds: 0,
            ..RuntimeSettings::default()
        });
        let key = ContextKey::channel(1);
        for _ in 0..20 {
            throttle.observe_bot(&key);
        }
        for _ in 0..50 {
            assert!(throttle.decide(&key, AUTONOMOUS_FROM_BOT).proceeds());
        }
    }

    #[test]
    fn chance_follows_observations() {
        let throttle = throttle(RuntimeSettings::default());
        let key = ContextKey::channel(7);
        assert_close(throttle.chance(&key), 1.0);

        for expected in [0.8, 0.65, 0.5, 0.35, 0.2, 0.05, 0.05, 0.05, 0.05] {
            throttle.observe_bot(&key);
            assert_close(throttle.chance(&key), expected);
        }
        assert_eq!(throttle.state(&key).phase(), ExchangePhase::Decaying);

        throttle.observe_bot(&key);
        assert_eq!(throttle.chance(&key), 0.0);
        assert_eq!(throttle.state(&key).phase(), ExchangePhase::Suppressed);
        for _ in 0..20 {
            assert_eq!(
                throttle.decide(&key, Candidate { trigger: TriggerKind::Autonomous, from_bot: false }),
                ThrottleDecision::Suppressed(SuppressReason::HardLimit)
            );
        }
    }

    #[test]
    fn human_message_resets_to_idle() {
        let throttle = throttle(RuntimeSettings::default());
        let key = ContextKey::channel(3);
        for _ in 0..12 {
            throttle.observe_bot(&key);
        }
        throttle.observe_human(&key);

        let state = throttle.state(&key);
        assert_eq!(state.consecutive_bot_count, 0);
        assert!(!state.suppressed);
        assert_eq!(state.phase(), ExchangePhase::Idle);
        assert_eq!(throttle.chance(&key), 1.0);
    }

    #[test]
    fn human_direct_triggers_bypass_everything() {
        let throttle = throttle(RuntimeSettings {
            bot_interactions_paused: true,
            ..RuntimeSettings::default()
        });
        let key = ContextKey::channel(9);
        for _ in 0..15 {
            throttle.observe_bot(&key);
        }
        let direct = Candidate {
            trigger: TriggerKind::Direct,
            from_bot: false,
        };
        assert!(throttle.decide(&key, direct).proceeds());
    }

    #[tokio::test(start_paused = true)]
    async fn bot_direct_triggers_respect_pause_cooldown_and_hard_limit() {
        let runtime = runtime(RuntimeSettings {
            bot_interactions_paused: true,
            bot_chain_cooldown_seconds: 60,
            ..RuntimeSettings::default()
        });
        let throttle = BotExchangeThrottle::with_rng(runtime.clone(), StdRng::seed_from_u64(7));
        let key = ContextKey::channel(9);
        let direct = Candidate {
            trigger: TriggerKind::Direct,
            from_bot: true,
        };
        assert_eq!(
            throttle.decide(&key, direct),
            ThrottleDecision::Suppressed(SuppressReason::Paused)
        );

        runtime.replace_settings(RuntimeSettings {
            bot_chain_cooldown_seconds: 60,
            ..RuntimeSettings::default()
        });
        // Below the hard limit a bot mention proceeds without a draw.
        for _ in 0..5 {
            throttle.observe_bot(&key);
        }
        assert!(throttle.decide(&key, direct).proceeds());

        throttle.note_replied_to_bot(&key);
        assert_eq!(
            throttle.decide(&key, direct),
            ThrottleDecision::Suppressed(SuppressReason::Cooldown)
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..5 {
            throttle.observe_bot(&key);
        }
        assert_eq!(
            throttle.decide(&key, direct),
            ThrottleDecision::Suppressed(SuppressReason::HardLimit)
        );
    }

    #[test]
    fn channels_are_independent() {
        let throttle = throttle(RuntimeSettings::default());
        let busy = ContextKey::channel(1);
        let quiet = ContextKey::channel(2);
        for _ in 0..10 {
            throttle.observe_bot(&busy);
        }
        assert_eq!(throttle.chance(&busy), 0.0);
        assert_eq!(throttle.chance(&quiet), 1.0);
    }

    #[test]
    fn paused_bot_interactions_refuse_bot_triggers() {
        let throttle = throttle(RuntimeSettings {
            bot_interactions_paused: true,
            ..RuntimeSettings::default()
        });
        let key = ContextKey::channel(4);
        assert_eq!(
            throttle.decide(&key, AUTONOMOUS_FROM_BOT),
            ThrottleDecision::Suppressed(SuppressReason::Paused)
        );
        // Human-authored autonomous candidates are unaffected.
        let from_human = Candidate {
            trigger: TriggerKind::Autonomous,
            from_bot: false,
        };
        assert!(throttle.decide(&key, from_human).proceeds());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_bot_triggers_until_it_expires() {
        let throttle = throttle(RuntimeSettings {
            bot_chain_cooldown_seconds: 60,
            ..RuntimeSettings::default()
        });
        let key = ContextKey::channel(5);
        throttle.note_replied_to_bot(&key);
        assert_eq!(
            throttle.decide(&key, AUTONOMOUS_FROM_BOT),
            ThrottleDecision::Suppressed(SuppressReason::Cooldown)
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(throttle.decide(&key, AUTONOMOUS_FROM_BOT).proceeds());
    }

    #[test]
    fn zero_name_trigger_chance_refuses_name_triggers() {
        let throttle = throttle(RuntimeSettings {
            name_trigger_chance: 0.0,
            ..RuntimeSettings::default()
        });
        let candidate = Candidate {
            trigger: TriggerKind::NameTrigger,
            from_bot: false,
        };
        assert!(matches!(
            throttle.decide(&ContextKey::channel(1), candidate),
            ThrottleDecision::Suppressed(SuppressReason::NameTrigger { .. })
        ));
    }

    #[test]
    fn draws_track_the_chance() {
        let throttle = throttle(RuntimeSettings {
            bot_chain_cooldown_seconds: 0,
            ..RuntimeSettings::default()
        });
        let key = ContextKey::channel(8);
        for _ in 0..3 {
            throttle.observe_bot(&key);
        }
        // Chance is 0.5 after three bot messages.
        let proceeded = (0..2000)
            .filter(|_| throttle.decide(&key, AUTONOMOUS_FROM_BOT).proceeds())
            .count();
        assert!((800..1200).contains(&proceeded), "proceeded {proceeded} of 2000");
    }

    #[test]
    fn lowering_hard_limit_applies_to_existing_counts() {
        let runtime = runtime(RuntimeSettings::default());
        let throttle = BotExchangeThrottle::with_rng(runtime.clone(), StdRng::seed_from_u64(1));
        let key = ContextKey::channel(6);
        for _ in 0..4 {
            throttle.observe_bot(&key);
        }
        runtime.replace_settings(RuntimeSettings {
            bot_falloff_hard_limit: 3,
            ..RuntimeSettings::default()
        });
        assert_eq!(throttle.chance(&key), 0.0);
    }
}
