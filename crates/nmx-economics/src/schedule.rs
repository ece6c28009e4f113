//! # Mint Schedule
//!
//! Emission is described by an ordered list of items. Each item repeats `repeat_count`
//! cycles of `tick_count` ticks. Inside a cycle every tick emits `next_tick_supply`;
//! after each cycle the supply is multiplied by `repeat_multiplier`. Each tick's
//! supply is split across five pools by `pool_rates`, then throttled by the global
//! `output_rate`.
//!
//! ## Default Nominex Schedule (weekly cycles)
//!
//! | Item | Weeks | Weekly multiplier | Primary | Bonus | Team | Nominex |
//! |------|-------|-------------------|---------|-------|------|---------|
//! | 0 | 4 | 0.994 | 0.72 | 0.08 | 0.20 | 0 |
//! | 1 | 4 | 0.994 | 0.541875 | 0.095625 | 0.1875 | 0.15 |
//! | 2-10 | 18 .. 2084 | 0.994 .. 0.99995 | 0.392 | 0.098 | 0.21 | 0.30 |
//!
//! Rounding is floor everywhere: per-tick pool emission is floored once per span and
//! the decayed supply is floored at every cycle boundary. Actual emission never
//! exceeds the continuous-time integral.

use nmx_core::{amount_serde, Address, Amount, Fixed64x64, NmxError, Ownable, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::constants::{ONE_NMX, SECONDS_PER_DAY, SECONDS_PER_WEEK};

/// Number of logical emission pools
pub const POOL_COUNT: usize = 5;

/// Emission destination
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MintPool {
    /// Unassigned, never emits
    Default = 0,
    /// Staking rewards
    Primary = 1,
    /// Direct referral bonuses
    Bonus = 2,
    Team = 3,
    /// Operational fund
    Nominex = 4,
}

impl MintPool {
    pub const ALL: [MintPool; POOL_COUNT] = [
        MintPool::Default,
        MintPool::Primary,
        MintPool::Bonus,
        MintPool::Team,
        MintPool::Nominex,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Primary => "primary",
            Self::Bonus => "bonus",
            Self::Team => "team",
            Self::Nominex => "nominex",
        }
    }
}

impl TryFrom<u8> for MintPool {
    type Error = NmxError;

    fn try_from(value: u8) -> Result<Self> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(NmxError::InvalidPool(value))
    }
}

impl fmt::Display for MintPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One segment of the schedule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleItem {
    /// Cycles in this item
    pub repeat_count: u32,

    /// Ticks per cycle
    pub tick_count: u64,

    /// Per-tick supply when the item is entered; `None` keeps the decayed supply
    #[serde(
        default,
        with = "option_amount",
        skip_serializing_if = "Option::is_none"
    )]
    pub reward_rate: Option<Amount>,

    /// Supply multiplier applied after every cycle
    pub repeat_multiplier: Fixed64x64,

    /// Fraction of each tick routed to each pool
    pub pool_rates: [Fixed64x64; POOL_COUNT],
}

impl ScheduleItem {
    pub fn validate(&self) -> Result<()> {
        if self.repeat_count == 0 || self.tick_count == 0 {
            return Err(NmxError::InvalidArgument);
        }
        if self.repeat_multiplier.is_negative() {
            return Err(NmxError::InvalidArgument);
        }
        let mut total = Fixed64x64::ZERO;
        for (pool, rate) in MintPool::ALL.iter().zip(self.pool_rates.iter()) {
            if rate.is_negative() || *rate > Fixed64x64::ONE {
                return Err(NmxError::InvalidPoolRates(format!(
                    "{pool} rate {rate} outside [0, 1]"
                )));
            }
            total = total.checked_add(*rate)?;
        }
        if total > Fixed64x64::ONE {
            return Err(NmxError::InvalidPoolRates(format!("rates sum to {total}")));
        }
        Ok(())
    }

    pub fn duration(&self) -> u64 {
        self.tick_count.saturating_mul(self.repeat_count as u64)
    }
}

mod option_amount {
    use nmx_core::{amount_serde, Amount};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Wrapped(#[serde(with = "amount_serde")] Amount);

    pub fn serialize<S: Serializer>(value: &Option<Amount>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(Wrapped).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Amount>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|w| w.0))
    }
}

/// Cursor into the schedule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub time: Timestamp,
    pub item_index: usize,
    pub cycle_index: u32,
    pub cycle_start_time: Timestamp,
    #[serde(with = "amount_serde")]
    pub next_tick_supply: Amount,
}

/// Emission schedule with an owner-settable global throttle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintSchedule {
    owner: Ownable,
    items: Vec<ScheduleItem>,
    output_rate: Fixed64x64,
}

impl MintSchedule {
    pub fn new(owner: Address, items: Vec<ScheduleItem>) -> Result<Self> {
        for item in &items {
            item.validate()?;
        }
        Ok(Self {
            owner: Ownable::new(owner),
            items,
            output_rate: Fixed64x64::ONE,
        })
    }

    /// Weekly schedule of the deployed token, starting at 10,000 NMX per day
    pub fn nominex_default(owner: Address) -> Self {
        Self {
            owner: Ownable::new(owner),
            items: nominex_items(),
            output_rate: Fixed64x64::ONE,
        }
    }

    pub fn owner(&self) -> Address {
        self.owner.owner()
    }

    pub fn items(&self) -> &[ScheduleItem] {
        &self.items
    }

    pub fn output_rate(&self) -> Fixed64x64 {
        self.output_rate
    }

    /// Total ticks covered by the schedule
    pub fn duration(&self) -> u64 {
        self.items
            .iter()
            .fold(0u64, |acc, item| acc.saturating_add(item.duration()))
    }

    pub fn set_output_rate(&mut self, caller: &Address, rate: Fixed64x64) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        if rate.is_negative() {
            return Err(NmxError::OutputRateNegative);
        }
        if rate > Fixed64x64::ONE {
            return Err(NmxError::OutputRateTooLarge);
        }
        info!(%rate, "output rate changed");
        self.output_rate = rate;
        Ok(())
    }

    /// Replace the item list. States built against the old list must be reset.
    pub fn set_items(&mut self, caller: &Address, items: Vec<ScheduleItem>) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        for item in &items {
            item.validate()?;
        }
        info!(items = items.len(), "schedule replaced");
        self.items = items;
        Ok(())
    }

    pub fn transfer_ownership(&mut self, caller: &Address, new_owner: Address) -> Result<()> {
        self.owner.transfer_ownership(caller, new_owner)
    }

    /// State at distribution start
    pub fn initial_state(&self, start: Timestamp) -> ScheduleState {
        ScheduleState {
            time: start,
            item_index: 0,
            cycle_index: 0,
            cycle_start_time: start,
            next_tick_supply: self
                .items
                .first()
                .and_then(|item| item.reward_rate)
                .unwrap_or(0),
        }
    }

    /// Whether the state has run past the last item
    pub fn is_finished(&self, state: &ScheduleState) -> bool {
        state.item_index >= self.items.len()
    }

    /// Emission of one tick for `pool` at the state's current supply
    pub fn tick_supply(&self, state: &ScheduleState, pool: MintPool) -> Result<Amount> {
        match self.items.get(state.item_index) {
            Some(item) => self.pool_tick_supply(item, pool, state.next_tick_supply),
            None => Ok(0),
        }
    }

    fn pool_tick_supply(&self, item: &ScheduleItem, pool: MintPool, supply: Amount) -> Result<Amount> {
        self.output_rate
            .checked_mul(item.pool_rates[pool.index()])?
            .mulu(supply)
    }

    /// Advance `state` to `now` and return what `pool` is owed for the elapsed ticks.
    ///
    /// Each loop iteration covers one span of constant supply, ending at `now` or at
    /// the current cycle's boundary, whichever comes first.
    pub fn make_progress(
        &self,
        state: &ScheduleState,
        now: Timestamp,
        pool: MintPool,
    ) -> Result<(Amount, ScheduleState)> {
        if now <= state.time {
            return Ok((0, state.clone()));
        }

        let mut next = state.clone();
        let mut emitted: Amount = 0;

        while now > next.time && next.item_index < self.items.len() {
            let item = &self.items[next.item_index];
            let cycle_end = next.cycle_start_time.saturating_add(item.tick_count);
            let boundary = now.min(cycle_end);
            let ticks = boundary.saturating_sub(next.time);

            let per_tick = self.pool_tick_supply(item, pool, next.next_tick_supply)?;
            let span = per_tick
                .checked_mul(ticks as u128)
                .ok_or(NmxError::ArithmeticOverflow)?;
            emitted = emitted
                .checked_add(span)
                .ok_or(NmxError::ArithmeticOverflow)?;

            next.time = boundary;
            if boundary == cycle_end {
                next.next_tick_supply = item.repeat_multiplier.mulu(next.next_tick_supply)?;
                next.cycle_index += 1;
                next.cycle_start_time = boundary;
                if next.cycle_index == item.repeat_count {
                    next.cycle_index = 0;
                    next.item_index += 1;
                    if let Some(rate) = self.items.get(next.item_index).and_then(|i| i.reward_rate) {
                        next.next_tick_supply = rate;
                    }
                }
            }
        }

        debug!(%pool, from = state.time, to = next.time, emitted, "schedule progress");
        Ok((emitted, next))
    }
}

fn fixed(s: &str) -> Fixed64x64 {
    // literals below are known-good decimals
    Fixed64x64::from_decimal_str(s).unwrap_or(Fixed64x64::ZERO)
}

fn nominex_items() -> Vec<ScheduleItem> {
    let first_month = ["0", "0.72", "0.08", "0.2", "0"].map(fixed);
    let second_month = ["0", "0.541875", "0.095625", "0.1875", "0.15"].map(fixed);
    let steady = ["0", "0.392", "0.098", "0.21", "0.3"].map(fixed);

    let weekly = |weeks: u32, multiplier: &str, rates: [Fixed64x64; POOL_COUNT]| ScheduleItem {
        repeat_count: weeks,
        tick_count: SECONDS_PER_WEEK,
        reward_rate: None,
        repeat_multiplier: fixed(multiplier),
        pool_rates: rates,
    };

    let mut items = vec![
        weekly(4, "0.994", first_month),
        weekly(4, "0.994", second_month),
        weekly(18, "0.994", steady),
        weekly(26, "0.996", steady),
        weekly(26, "0.997", steady),
        weekly(52, "0.998", steady),
        weekly(52, "0.999", steady),
        weekly(104, "0.9995", steady),
        weekly(556, "0.9997", steady),
        weekly(520, "0.9998", steady),
        weekly(2084, "0.99995", steady),
    ];
    items[0].reward_rate = Some(10_000 * ONE_NMX / SECONDS_PER_DAY as u128);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_SUPPLY;

    fn owner() -> Address {
        Address::from_label("owner")
    }

    fn state(item_index: usize, cycle_index: u32, cycle_start_time: u64, supply: Amount) -> ScheduleState {
        ScheduleState {
            time: 1_000_000,
            item_index,
            cycle_index,
            cycle_start_time,
            next_tick_supply: supply,
        }
    }

    fn rate(s: &str) -> Fixed64x64 {
        Fixed64x64::from_decimal_str(s).unwrap()
    }

    #[test]
    fn test_time_not_advanced_is_noop() {
        let schedule = MintSchedule::nominex_default(owner());
        let s = state(4, 4, 1_000_000 - 222, 1_000_000);

        assert_eq!(schedule.make_progress(&s, s.time - 1, MintPool::Primary).unwrap(), (0, s.clone()));
        assert_eq!(schedule.make_progress(&s, s.time, MintPool::Bonus).unwrap(), (0, s.clone()));
    }

    #[test]
    fn test_first_second() {
        let schedule = MintSchedule::nominex_default(owner());
        let s = state(0, 0, 1_000_000, 1_000_000);

        let (emitted, next) = schedule.make_progress(&s, s.time + 1, MintPool::Primary).unwrap();
        assert_eq!(emitted, rate("0.72").mulu(1_000_000).unwrap());
        assert_eq!(next.time, s.time + 1);
        assert_eq!(next.cycle_index, 0);
        assert_eq!(next.next_tick_supply, 1_000_000);
    }

    #[test]
    fn test_all_pools_in_one_second() {
        let schedule = MintSchedule::nominex_default(owner());
        let s = state(2, 3, 1_000_000 - 100, 1_000_000);
        let expected = [0, 392_000, 98_000, 210_000, 300_000];

        for pool in MintPool::ALL {
            let (emitted, _) = schedule.make_progress(&s, s.time + 1, pool).unwrap();
            // each decimal rate floors to just below its value
            assert!(expected[pool.index()] - emitted <= 1, "{pool}: {emitted}");
        }
    }

    #[test]
    fn test_cycle_change_in_several_seconds() {
        let schedule = MintSchedule::nominex_default(owner());
        let s = state(0, 0, 1_000_000 - SECONDS_PER_WEEK + 1, 1_000_000);
        let bonus = rate("0.08");
        let decayed = rate("0.994").mulu(1_000_000).unwrap();

        let (emitted, next) = schedule.make_progress(&s, s.time + 3, MintPool::Bonus).unwrap();
        let expected = bonus.mulu(1_000_000).unwrap() + 2 * bonus.mulu(decayed).unwrap();
        assert_eq!(emitted, expected);
        assert_eq!(next.cycle_index, 1);
        assert_eq!(next.cycle_start_time, s.time + 1);
        assert_eq!(next.next_tick_supply, decayed);
    }

    #[test]
    fn test_two_cycles_at_once() {
        let schedule = MintSchedule::nominex_default(owner());
        let s = state(0, 1, 1_000_000 - SECONDS_PER_WEEK + 2, 1_000_000);
        let primary = rate("0.72");
        let m = rate("0.994");
        let second = m.mulu(1_000_000).unwrap();
        let third = m.mulu(second).unwrap();

        let (emitted, next) = schedule
            .make_progress(&s, s.time + SECONDS_PER_WEEK + 5, MintPool::Primary)
            .unwrap();
        let expected = primary.mulu(1_000_000).unwrap() * 2
            + primary.mulu(second).unwrap() * SECONDS_PER_WEEK as u128
            + primary.mulu(third).unwrap() * 3;
        assert_eq!(emitted, expected);
        assert_eq!(next.cycle_index, 3);
        assert_eq!(next.cycle_start_time, s.time + SECONDS_PER_WEEK + 2);
        assert_eq!(next.next_tick_supply, third);
    }

    #[test]
    fn test_item_change() {
        let schedule = MintSchedule::nominex_default(owner());
        let s = state(2, 17, 1_000_000 - SECONDS_PER_WEEK + 1, 1_000_000);

        let (_, next) = schedule.make_progress(&s, s.time + 1, MintPool::Nominex).unwrap();
        assert_eq!(next.item_index, 3);
        assert_eq!(next.cycle_index, 0);
        assert_eq!(next.cycle_start_time, s.time + 1);
        assert_eq!(next.next_tick_supply, rate("0.994").mulu(1_000_000).unwrap());
    }

    #[test]
    fn test_last_second_and_terminal_state() {
        let schedule = MintSchedule::nominex_default(owner());
        let s = state(10, 2083, 1_000_000 - SECONDS_PER_WEEK + 1, 1_000_000);

        let (emitted, last) = schedule.make_progress(&s, s.time + 1, MintPool::Team).unwrap();
        assert_eq!(emitted, rate("0.21").mulu(1_000_000).unwrap());
        assert_eq!(last.item_index, 11);
        assert_eq!(last.next_tick_supply, rate("0.99995").mulu(1_000_000).unwrap());
        assert!(schedule.is_finished(&last));

        for dt in [1, 2, SECONDS_PER_WEEK + 3] {
            let (emitted, after) = schedule.make_progress(&last, last.time + dt, MintPool::Team).unwrap();
            assert_eq!(emitted, 0);
            assert_eq!(after, last);
        }
    }

    #[test]
    fn test_output_rate_throttles() {
        let mut schedule = MintSchedule::nominex_default(owner());
        let s = state(8, 555, 1_000_000 - 50, 1_000_000);
        let bonus_rate = rate("0.098");

        schedule.set_output_rate(&owner(), rate("0.5")).unwrap();
        let (emitted, _) = schedule.make_progress(&s, s.time + 2, MintPool::Bonus).unwrap();
        let per_tick = rate("0.5").checked_mul(bonus_rate).unwrap().mulu(1_000_000).unwrap();
        assert_eq!(emitted, per_tick * 2);

        schedule.set_output_rate(&owner(), Fixed64x64::ZERO).unwrap();
        let (emitted, next) = schedule.make_progress(&s, s.time + 4, MintPool::Bonus).unwrap();
        assert_eq!(emitted, 0);
        assert_eq!(next.time, s.time + 4);
    }

    #[test]
    fn test_output_rate_bounds() {
        let mut schedule = MintSchedule::nominex_default(owner());
        assert_eq!(
            schedule.set_output_rate(&owner(), rate("-0.5")).unwrap_err().to_string(),
            "outputRate must be ge 0"
        );
        assert_eq!(
            schedule.set_output_rate(&owner(), rate("1.5")).unwrap_err().to_string(),
            "outputRate must be le 1<<64"
        );
        assert_eq!(
            schedule.set_output_rate(&Address::from_label("other"), rate("0.5")),
            Err(NmxError::PermissionDenied)
        );
        schedule.set_output_rate(&owner(), Fixed64x64::ONE).unwrap();
    }

    #[test]
    fn test_item_validation() {
        let mut item = nominex_items()[2].clone();
        item.pool_rates[1] = rate("0.5");
        assert!(matches!(item.validate(), Err(NmxError::InvalidPoolRates(_))));

        let mut item = nominex_items()[2].clone();
        item.pool_rates[0] = rate("1.1");
        assert!(matches!(item.validate(), Err(NmxError::InvalidPoolRates(_))));

        let mut item = nominex_items()[2].clone();
        item.repeat_count = 0;
        assert_eq!(item.validate(), Err(NmxError::InvalidArgument));

        for item in nominex_items() {
            item.validate().unwrap();
        }
    }

    #[test]
    fn test_reward_rate_resets_supply_per_item() {
        let rates = [Fixed64x64::ZERO, Fixed64x64::ONE, Fixed64x64::ZERO, Fixed64x64::ZERO, Fixed64x64::ZERO];
        let item = |reward_rate| ScheduleItem {
            repeat_count: 2,
            tick_count: 10,
            reward_rate: Some(reward_rate),
            repeat_multiplier: rate("0.5"),
            pool_rates: rates,
        };
        let schedule = MintSchedule::new(owner(), vec![item(4), item(8)]).unwrap();
        let start = schedule.initial_state(0);

        // 10*4 + 10*2 + 10*8 + 10*4
        let (emitted, end) = schedule.make_progress(&start, 100, MintPool::Primary).unwrap();
        assert_eq!(emitted, 180);
        assert!(schedule.is_finished(&end));
        assert_eq!(end.time, 40);
    }

    #[test]
    fn test_default_schedule_total_supply() {
        let schedule = MintSchedule::nominex_default(owner());
        let start = schedule.initial_state(0);
        let end = schedule.duration();

        let total: Amount = MintPool::ALL
            .iter()
            .map(|pool| schedule.make_progress(&start, end, *pool).unwrap().0)
            .sum();
        assert!(total > 0);
        assert!(total < MAX_SUPPLY);
    }

    #[test]
    fn test_pool_from_u8() {
        assert_eq!(MintPool::try_from(1).unwrap(), MintPool::Primary);
        assert_eq!(MintPool::try_from(5), Err(NmxError::InvalidPool(5)));
    }
}
