//! Energy accounting by time-integration of the aggregate power reading.
//!
//! Two integrators exist:
//!
//! - the *balancing* integrator of grid meters, driven by changes of `/Ac/Power`.
//!   It holds the previous power reading constant over the elapsed time
//!   (zero-order hold) and adds positive energy to the forward and negative energy
//!   to the reverse accumulator;
//! - the *net-metering* integrator of inverter-class meters, run on every poll cycle
//!   with the current power reading. Exported energy (positive power) goes to the
//!   reverse accumulator, imported energy to the forward accumulator.
//!
//! The exposed `/Ac/Energy/Forward` and `/Ac/Energy/Reverse` values are selected by
//! the [`CountingPolicy`] and published at most every [`PUBLISH_INTERVAL`], except
//! under net metering where they follow the accumulators on every cycle. The
//! accumulators are checkpointed to an [`EnergyStore`] at most every
//! [`PERSIST_INTERVAL`].

use crate::{
    poll::ChangeHandler,
    protocol::fmt_kwh,
    publish::Publisher,
    store::{self, Balancing, EnergyStore},
};
use log::*;
use std::fmt;
use std::time::{Duration, Instant};

/// Minimum time between two publications of the exposed energy counters.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(5);
/// Minimum time between two checkpoints of the accumulators.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(300);
/// Delay of the first publication after the account is created.
const FIRST_PUBLISH_DELAY: Duration = Duration::from_secs(1);

const WATT_SECONDS_PER_KWH: f64 = 3_600_000.0;

pub const POWER: &str = "/Ac/Power";
pub const DEVICE_FORWARD: &str = "/Ac/Energy/ForwardSum";
pub const DEVICE_REVERSE: &str = "/Ac/Energy/ReverseSum";
pub const FORWARD: &str = "/Ac/Energy/Forward";
pub const REVERSE: &str = "/Ac/Energy/Reverse";
pub const FORWARD_BALANCING: &str = "/Ac/Energy/ForwardBalancing";
pub const REVERSE_BALANCING: &str = "/Ac/Energy/ReverseBalancing";

/// Selects which counters are exposed as the authoritative energy reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountingPolicy {
    /// The counters reported by the device, unchanged.
    DeviceRaw,
    /// The locally integrated accumulators.
    Balancing,
    /// The difference of the device counters, as forward and negated as reverse.
    DeviceNet,
    /// Net-metering accumulators of inverter-class meters. Not user selectable.
    NetMetering,
}

impl CountingPolicy {
    /// Maps the external counter selector (0, 1 or 2) to a policy.
    pub fn from_selector(selector: u8) -> Option<Self> {
        match selector {
            0 => Some(CountingPolicy::DeviceRaw),
            1 => Some(CountingPolicy::Balancing),
            2 => Some(CountingPolicy::DeviceNet),
            _ => None,
        }
    }

    /// The external selector value, `None` for [`CountingPolicy::NetMetering`].
    pub fn selector(&self) -> Option<u8> {
        match self {
            CountingPolicy::DeviceRaw => Some(0),
            CountingPolicy::Balancing => Some(1),
            CountingPolicy::DeviceNet => Some(2),
            CountingPolicy::NetMetering => None,
        }
    }
}

impl fmt::Display for CountingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CountingPolicy::DeviceRaw => "device counters",
            CountingPolicy::Balancing => "balancing",
            CountingPolicy::DeviceNet => "device net",
            CountingPolicy::NetMetering => "net metering",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Power,
    DeviceForward,
    DeviceReverse,
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

fn kwh(power: f64, elapsed: Duration) -> f64 {
    power * elapsed.as_secs_f64() / WATT_SECONDS_PER_KWH
}

/// Per-device energy accumulator state.
pub struct EnergyAccount {
    policy: CountingPolicy,
    balancing: Balancing,
    last_power: f64,
    power: Option<f64>,
    last_integration: Instant,
    last_publish: Instant,
    last_persist: Instant,
    device_forward: Option<f64>,
    device_reverse: Option<f64>,
    hooks: Vec<(&'static str, Hook)>,
    store: Box<dyn EnergyStore>,
}

impl fmt::Debug for EnergyAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnergyAccount")
            .field("policy", &self.policy)
            .field("balancing", &self.balancing)
            .field("last_power", &self.last_power)
            .field("device_forward", &self.device_forward)
            .field("device_reverse", &self.device_reverse)
            .finish_non_exhaustive()
    }
}

impl EnergyAccount {
    /// Creates the account, seeding the accumulators from the store.
    pub fn new(
        policy: CountingPolicy,
        mut store: Box<dyn EnergyStore>,
        now: Instant,
    ) -> Result<Self, store::Error> {
        let balancing = store.load()?;
        debug!("Energy accounting ({policy}) resumes from {balancing:?}");
        let hooks = match policy {
            CountingPolicy::NetMetering => vec![(POWER, Hook::Power)],
            _ => vec![
                (POWER, Hook::Power),
                (DEVICE_FORWARD, Hook::DeviceForward),
                (DEVICE_REVERSE, Hook::DeviceReverse),
            ],
        };
        Ok(Self {
            policy,
            balancing,
            last_power: 0.0,
            power: None,
            last_integration: now,
            last_publish: now
                .checked_sub(PUBLISH_INTERVAL - FIRST_PUBLISH_DELAY)
                .unwrap_or(now),
            last_persist: now,
            device_forward: None,
            device_reverse: None,
            hooks,
            store,
        })
    }

    pub fn policy(&self) -> CountingPolicy {
        self.policy
    }

    /// Switches between the user selectable policies.
    ///
    /// Returns `false` if either the current or the requested policy is
    /// [`CountingPolicy::NetMetering`].
    pub fn set_policy(&mut self, policy: CountingPolicy) -> bool {
        if self.policy == CountingPolicy::NetMetering || policy == CountingPolicy::NetMetering {
            return false;
        }
        self.policy = policy;
        true
    }

    pub fn balancing(&self) -> Balancing {
        self.balancing
    }

    pub fn device_counters(&self) -> (Option<f64>, Option<f64>) {
        (self.device_forward, self.device_reverse)
    }

    /// Publishes the accumulators and clears the exposed counters.
    pub fn publish_initial(&self, publisher: &mut dyn Publisher) {
        self.publish_balancing(publisher);
        publisher.publish(FORWARD, None, None);
        publisher.publish(REVERSE, None, None);
    }

    fn publish_balancing(&self, publisher: &mut dyn Publisher) {
        let Balancing { forward, reverse } = self.balancing;
        publisher.publish(FORWARD_BALANCING, Some(forward), Some(fmt_kwh(forward)));
        publisher.publish(REVERSE_BALANCING, Some(reverse), Some(fmt_kwh(reverse)));
    }

    fn publish_exposed(&self, publisher: &mut dyn Publisher) {
        let mut expose =
            |path: &str, value: f64| publisher.publish(path, Some(value), Some(fmt_kwh(value)));
        match self.policy {
            CountingPolicy::Balancing | CountingPolicy::NetMetering => {
                expose(FORWARD, self.balancing.forward);
                expose(REVERSE, self.balancing.reverse);
            }
            CountingPolicy::DeviceNet => {
                if let (Some(forward), Some(reverse)) = (self.device_forward, self.device_reverse) {
                    let net = round5(forward - reverse);
                    expose(FORWARD, net);
                    expose(REVERSE, -net);
                }
            }
            CountingPolicy::DeviceRaw => {
                if let Some(forward) = self.device_forward {
                    expose(FORWARD, forward);
                }
                if let Some(reverse) = self.device_reverse {
                    expose(REVERSE, reverse);
                }
            }
        }
    }

    fn integrate_balancing(
        &mut self,
        value: Option<f64>,
        now: Instant,
        publisher: &mut dyn Publisher,
    ) {
        let energy = kwh(self.last_power, now.saturating_duration_since(self.last_integration));
        if self.last_power > 0.0 {
            self.balancing.forward += energy;
        } else {
            self.balancing.reverse += energy.abs();
        }
        self.last_integration = now;
        self.last_power = value.unwrap_or(0.0);
        self.publish_balancing(publisher);
    }

    fn integrate_net_metering(&mut self, power: f64, now: Instant, publisher: &mut dyn Publisher) {
        let energy = kwh(power, now.saturating_duration_since(self.last_integration));
        if energy >= 0.0 {
            self.balancing.reverse += energy;
        } else {
            self.balancing.forward += energy.abs();
        }
        self.last_integration = now;
        self.publish_balancing(publisher);
    }

    fn persist(&mut self, now: Instant) {
        match self.store.save(&self.balancing) {
            Ok(()) => trace!("Persisted {:?}", self.balancing),
            Err(err) => warn!("Cannot persist energy counters: {err}"),
        }
        self.last_persist = now;
    }

    /// Per-cycle hook, run after all due registers of a poll cycle were decoded.
    ///
    /// Net metering exposes its accumulators on every cycle with a power reading;
    /// the selectable policies publish at most every [`PUBLISH_INTERVAL`].
    pub fn on_cycle(&mut self, now: Instant, publisher: &mut dyn Publisher) {
        if self.policy == CountingPolicy::NetMetering {
            let Some(power) = self.power else {
                return;
            };
            self.integrate_net_metering(power, now, publisher);
            self.publish_exposed(publisher);
            self.last_publish = now;
        } else if now.saturating_duration_since(self.last_publish) >= PUBLISH_INTERVAL {
            self.publish_exposed(publisher);
            self.last_publish = now;
        }

        if now.saturating_duration_since(self.last_persist) >= PERSIST_INTERVAL {
            self.persist(now);
        }
    }

    /// Zeroes both accumulators and checkpoints them right away.
    pub fn reset(
        &mut self,
        now: Instant,
        publisher: &mut dyn Publisher,
    ) -> Result<(), store::Error> {
        info!("Resetting energy accumulators {:?}", self.balancing);
        self.balancing = Balancing::default();
        self.last_integration = now;
        self.publish_balancing(publisher);
        self.store.save(&self.balancing)?;
        self.last_persist = now;
        Ok(())
    }
}

impl ChangeHandler for EnergyAccount {
    fn handles(&self, name: &str) -> bool {
        self.hooks.iter().any(|(hook, _)| *hook == name)
    }

    fn on_change(
        &mut self,
        name: &str,
        value: Option<f64>,
        now: Instant,
        publisher: &mut dyn Publisher,
    ) {
        let Some((_, hook)) = self.hooks.iter().find(|(hook, _)| *hook == name) else {
            return;
        };
        match hook {
            Hook::Power => {
                self.power = value;
                if self.policy != CountingPolicy::NetMetering {
                    self.integrate_balancing(value, now, publisher);
                }
            }
            Hook::DeviceForward => self.device_forward = Some(value.unwrap_or(0.0)),
            Hook::DeviceReverse => self.device_reverse = Some(value.unwrap_or(0.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::PublishedState;
    use crate::store::MemoryStore;
    use std::cell::RefCell;
    use std::rc::Rc;

    const HOUR: Duration = Duration::from_secs(3600);

    #[derive(Clone, Default)]
    struct SharedStore {
        saves: Rc<RefCell<Vec<Balancing>>>,
    }

    impl EnergyStore for SharedStore {
        fn load(&mut self) -> Result<Balancing, store::Error> {
            Ok(Balancing::default())
        }

        fn save(&mut self, balancing: &Balancing) -> Result<(), store::Error> {
            self.saves.borrow_mut().push(*balancing);
            Ok(())
        }
    }

    fn account(policy: CountingPolicy, now: Instant) -> EnergyAccount {
        EnergyAccount::new(policy, Box::new(MemoryStore::default()), now).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn resumes_from_store() {
        let store = MemoryStore::new(Balancing {
            forward: 42.0,
            reverse: 1.5,
        });
        let account =
            EnergyAccount::new(CountingPolicy::Balancing, Box::new(store), Instant::now()).unwrap();
        assert_eq!(account.balancing().forward, 42.0);
        assert_eq!(account.balancing().reverse, 1.5);
    }

    #[test]
    fn balancing_zero_order_hold() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::Balancing, t0);
        let mut state = PublishedState::new();

        account.on_change(POWER, Some(100.0), t0, &mut state);
        assert_eq!(account.balancing(), Balancing::default());

        account.on_change(POWER, Some(-50.0), t0 + HOUR, &mut state);
        assert_close(account.balancing().forward, 0.1);
        assert_close(account.balancing().reverse, 0.0);

        account.on_change(POWER, Some(0.0), t0 + 2 * HOUR, &mut state);
        assert_close(account.balancing().forward, 0.1);
        assert_close(account.balancing().reverse, 0.05);

        assert_close(state.value(FORWARD_BALANCING).unwrap(), 0.1);
        assert_close(state.value(REVERSE_BALANCING).unwrap(), 0.05);
    }

    #[test]
    fn balancing_invalid_power_counts_as_zero() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::Balancing, t0);
        let mut state = PublishedState::new();

        account.on_change(POWER, Some(1000.0), t0, &mut state);
        account.on_change(POWER, None, t0 + HOUR, &mut state);
        assert_close(account.balancing().forward, 1.0);
        account.on_change(POWER, Some(500.0), t0 + 2 * HOUR, &mut state);
        assert_close(account.balancing().forward, 1.0);
        assert_close(account.balancing().reverse, 0.0);
    }

    #[test]
    fn accumulators_never_decrease() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::Balancing, t0);
        let mut state = PublishedState::new();
        let mut previous = account.balancing();
        let powers = [250.0, -300.0, 0.0, -10.0, 4000.0, -1.0];
        for (step, power) in powers.into_iter().enumerate() {
            let now = t0 + Duration::from_secs(60 * step as u64);
            account.on_change(POWER, Some(power), now, &mut state);
            let current = account.balancing();
            assert!(current.forward >= previous.forward);
            assert!(current.reverse >= previous.reverse);
            previous = current;
        }
    }

    #[test]
    fn device_net_rounds_and_negates() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::DeviceNet, t0);
        let mut state = PublishedState::new();
        account.on_change(DEVICE_FORWARD, Some(10.0), t0, &mut state);
        account.on_change(DEVICE_REVERSE, Some(3.00001), t0, &mut state);

        account.on_cycle(t0 + PUBLISH_INTERVAL, &mut state);
        assert_close(state.value(FORWARD).unwrap(), 6.99999);
        // reverse is the negated net value, kept as the driver always exposed it
        assert_close(state.value(REVERSE).unwrap(), -6.99999);
    }

    #[test]
    fn device_net_skips_without_counters() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::DeviceNet, t0);
        let mut state = PublishedState::new();
        account.on_change(DEVICE_FORWARD, Some(10.0), t0, &mut state);

        account.on_cycle(t0 + PUBLISH_INTERVAL, &mut state);
        assert_eq!(state.updates(FORWARD), 0);
        assert_eq!(state.updates(REVERSE), 0);
    }

    #[test]
    fn device_raw_exposes_device_counters() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::DeviceRaw, t0);
        let mut state = PublishedState::new();

        account.on_cycle(t0 + PUBLISH_INTERVAL, &mut state);
        assert_eq!(state.updates(FORWARD), 0);

        account.on_change(DEVICE_FORWARD, Some(1234.5), t0, &mut state);
        account.on_change(DEVICE_REVERSE, None, t0, &mut state);
        account.on_cycle(t0 + 2 * PUBLISH_INTERVAL, &mut state);
        assert_eq!(state.value(FORWARD), Some(1234.5));
        assert_eq!(state.value(REVERSE), Some(0.0));
        assert_eq!(
            state.get(FORWARD).unwrap().text.as_deref(),
            Some("1234.500 kWh")
        );
    }

    #[test]
    fn balancing_policy_exposes_accumulators() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::Balancing, t0);
        let mut state = PublishedState::new();
        account.on_change(DEVICE_FORWARD, Some(99.0), t0, &mut state);
        account.on_change(POWER, Some(-3600.0), t0, &mut state);
        account.on_change(POWER, Some(0.0), t0 + HOUR, &mut state);

        account.on_cycle(t0 + HOUR, &mut state);
        assert_close(state.value(FORWARD).unwrap(), 0.0);
        assert_close(state.value(REVERSE).unwrap(), 3.6);
    }

    #[test]
    fn publication_cadence() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::Balancing, t0);
        let mut state = PublishedState::new();
        for step in 0..600 {
            account.on_cycle(t0 + Duration::from_millis(100 * step), &mut state);
        }
        // first after one second, then every five seconds
        assert_eq!(state.updates(FORWARD), 12);
    }

    #[test]
    fn persistence_cadence() {
        let t0 = Instant::now();
        let store = SharedStore::default();
        let saves = store.saves.clone();
        let mut account =
            EnergyAccount::new(CountingPolicy::Balancing, Box::new(store), t0).unwrap();
        let mut state = PublishedState::new();

        account.on_change(POWER, Some(360.0), t0, &mut state);
        for step in 0..1000 {
            let now = t0 + Duration::from_millis(250 * step);
            if step % 40 == 0 {
                account.on_change(POWER, Some(360.0 + step as f64), now, &mut state);
            }
            account.on_cycle(now, &mut state);
        }
        // 250 seconds of polling, no checkpoint yet
        assert!(saves.borrow().is_empty());

        account.on_cycle(t0 + PERSIST_INTERVAL, &mut state);
        account.on_cycle(t0 + PERSIST_INTERVAL + Duration::from_secs(299), &mut state);
        assert_eq!(saves.borrow().len(), 1);
        account.on_cycle(t0 + 2 * PERSIST_INTERVAL, &mut state);
        assert_eq!(saves.borrow().len(), 2);
        assert_eq!(saves.borrow()[1], account.balancing());
    }

    #[test]
    fn net_metering_import_and_export() {
        let half_hour = Duration::from_secs(1800);
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::NetMetering, t0);
        let mut state = PublishedState::new();

        account.on_change(POWER, Some(-200.0), t0, &mut state);
        // change events alone never integrate
        assert_eq!(state.updates(FORWARD_BALANCING), 0);
        account.on_cycle(t0, &mut state);
        account.on_cycle(t0 + half_hour, &mut state);
        assert_close(account.balancing().forward, 0.1);
        assert_close(account.balancing().reverse, 0.0);

        account.on_change(POWER, Some(200.0), t0 + half_hour, &mut state);
        account.on_cycle(t0 + 2 * half_hour, &mut state);
        assert_close(account.balancing().forward, 0.1);
        assert_close(account.balancing().reverse, 0.1);

        assert_close(state.value(FORWARD).unwrap(), 0.1);
        assert_close(state.value(REVERSE).unwrap(), 0.1);
    }

    #[test]
    fn net_metering_exposes_every_cycle() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::NetMetering, t0);
        let mut state = PublishedState::new();
        account.on_change(POWER, Some(3600.0), t0, &mut state);

        for secs in 1..=3 {
            let now = t0 + Duration::from_secs(secs);
            account.on_cycle(now, &mut state);
            let balancing = account.balancing();
            assert_eq!(state.value(REVERSE), Some(balancing.reverse));
            assert_eq!(state.value(FORWARD), Some(balancing.forward));
        }
        assert_close(account.balancing().reverse, 0.003);
        assert_eq!(state.updates(REVERSE), 3);
    }

    #[test]
    fn net_metering_persistence_cadence() {
        let t0 = Instant::now();
        let store = SharedStore::default();
        let saves = store.saves.clone();
        let mut account =
            EnergyAccount::new(CountingPolicy::NetMetering, Box::new(store), t0).unwrap();
        let mut state = PublishedState::new();

        account.on_change(POWER, Some(100.0), t0, &mut state);
        for secs in 0..=400 {
            account.on_cycle(t0 + Duration::from_secs(secs), &mut state);
        }
        assert_eq!(saves.borrow().len(), 1);

        // no power reading, no checkpoint even though one is due
        account.on_change(POWER, None, t0 + Duration::from_secs(400), &mut state);
        account.on_cycle(t0 + Duration::from_secs(700), &mut state);
        assert_eq!(saves.borrow().len(), 1);

        account.on_change(POWER, Some(100.0), t0 + Duration::from_secs(700), &mut state);
        account.on_cycle(t0 + Duration::from_secs(701), &mut state);
        assert_eq!(saves.borrow().len(), 2);
        assert_eq!(saves.borrow()[1], account.balancing());
    }

    #[test]
    fn net_metering_skips_without_power() {
        let t0 = Instant::now();
        let mut account = account(CountingPolicy::NetMetering, t0);
        let mut state = PublishedState::new();
        account.on_cycle(t0 + HOUR, &mut state);
        assert_eq!(state.iter().count(), 0);

        account.on_change(POWER, Some(1000.0), t0 + HOUR, &mut state);
        account.on_change(POWER, None, t0 + HOUR, &mut state);
        account.on_cycle(t0 + 2 * HOUR, &mut state);
        assert_eq!(account.balancing(), Balancing::default());
    }

    #[test]
    fn net_metering_policy_is_fixed() {
        let mut account = account(CountingPolicy::NetMetering, Instant::now());
        assert!(!account.set_policy(CountingPolicy::Balancing));
        assert!(!account.handles(DEVICE_FORWARD));

        let mut grid = self::account(CountingPolicy::DeviceRaw, Instant::now());
        assert!(grid.set_policy(CountingPolicy::DeviceNet));
        assert!(!grid.set_policy(CountingPolicy::NetMetering));
        assert_eq!(grid.policy(), CountingPolicy::DeviceNet);
    }

    #[test]
    fn reset_zeroes_and_persists() {
        let t0 = Instant::now();
        let store = SharedStore::default();
        let saves = store.saves.clone();
        let mut account =
            EnergyAccount::new(CountingPolicy::Balancing, Box::new(store), t0).unwrap();
        let mut state = PublishedState::new();
        account.on_change(POWER, Some(1000.0), t0, &mut state);
        account.on_change(POWER, Some(0.0), t0 + HOUR, &mut state);
        assert_close(account.balancing().forward, 1.0);

        account.reset(t0 + HOUR, &mut state).unwrap();
        assert_eq!(account.balancing(), Balancing::default());
        assert_eq!(*saves.borrow(), vec![Balancing::default()]);
        assert_eq!(state.value(FORWARD_BALANCING), Some(0.0));
    }

    #[test]
    fn selectors() {
        assert_eq!(CountingPolicy::from_selector(0), Some(CountingPolicy::DeviceRaw));
        assert_eq!(CountingPolicy::from_selector(1), Some(CountingPolicy::Balancing));
        assert_eq!(CountingPolicy::from_selector(2), Some(CountingPolicy::DeviceNet));
        assert_eq!(CountingPolicy::from_selector(3), None);
        assert_eq!(CountingPolicy::NetMetering.selector(), None);
    }
}
