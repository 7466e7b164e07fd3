//! Network fault injection for reproducible testing.
//!
//! See [`Simulator`] and [`LinkSimulator`].

use {
    crate::Datagram,
    core::time::Duration,
    log::trace,
    rand::{Rng, SeedableRng, rngs::StdRng},
    std::{
        collections::VecDeque,
        sync::{Arc, Mutex, PoisonError},
    },
    web_time::Instant,
};

/// Intercepts datagrams between the protocol engine and a
/// [`Driver`](crate::Driver) to inject latency, loss and reordering.
///
/// Every outgoing datagram is offered to [`Simulator::on_outgoing`] before it
/// reaches the driver, and every incoming datagram to
/// [`Simulator::on_incoming`] before it reaches the engine. The simulator
/// either hands the datagram straight back, or keeps it (dropping it, or
/// queueing it for later). Queued datagrams are released through
/// [`Simulator::poll_outgoing`] and [`Simulator::poll_incoming`] once they are
/// due.
///
/// Disabling a simulator only affects newly offered datagrams: datagrams that
/// were already queued are still released when they become due.
pub trait Simulator: Send {
    /// Gets whether this simulator currently interferes with traffic.
    fn is_enabled(&self) -> bool;

    /// Starts interfering with newly offered datagrams.
    fn enable(&mut self);

    /// Stops interfering with newly offered datagrams.
    fn disable(&mut self);

    /// Offers an outgoing datagram.
    ///
    /// Returns the datagram if it should be sent immediately.
    fn on_outgoing(&mut self, now: Instant, datagram: Datagram) -> Option<Datagram>;

    /// Offers an incoming datagram.
    ///
    /// Returns the datagram if it should be processed immediately.
    fn on_incoming(&mut self, now: Instant, datagram: Datagram) -> Option<Datagram>;

    /// Takes the next queued outgoing datagram which is due to be sent.
    fn poll_outgoing(&mut self, now: Instant) -> Option<Datagram>;

    /// Takes the next queued incoming datagram which is due to be processed.
    fn poll_incoming(&mut self, now: Instant) -> Option<Datagram>;
}

/// Lets a simulator be reconfigured while something else owns it.
///
/// # Examples
///
/// ```
/// use {
///     carrier_io::sim::{LinkConditions, LinkSimulator, Simulator},
///     std::sync::{Arc, Mutex},
/// };
///
/// let sim = Arc::new(Mutex::new(LinkSimulator::new(0)));
/// let mut owned: Box<dyn Simulator> = Box::new(sim.clone());
///
/// sim.lock().unwrap().set_incoming(LinkConditions::default().with_loss(2, 2));
/// assert!(owned.is_enabled());
/// ```
impl<S: Simulator> Simulator for Arc<Mutex<S>> {
    fn is_enabled(&self) -> bool {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_enabled()
    }

    fn enable(&mut self) {
        self.lock().unwrap_or_else(PoisonError::into_inner).enable();
    }

    fn disable(&mut self) {
        self.lock().unwrap_or_else(PoisonError::into_inner).disable();
    }

    fn on_outgoing(&mut self, now: Instant, datagram: Datagram) -> Option<Datagram> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_outgoing(now, datagram)
    }

    fn on_incoming(&mut self, now: Instant, datagram: Datagram) -> Option<Datagram> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_incoming(now, datagram)
    }

    fn poll_outgoing(&mut self, now: Instant) -> Option<Datagram> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll_outgoing(now)
    }

    fn poll_incoming(&mut self, now: Instant) -> Option<Datagram> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll_incoming(now)
    }
}

impl<S: Simulator + ?Sized> Simulator for Box<S> {
    fn is_enabled(&self) -> bool {
        S::is_enabled(self)
    }

    fn enable(&mut self) {
        S::enable(self);
    }

    fn disable(&mut self) {
        S::disable(self);
    }

    fn on_outgoing(&mut self, now: Instant, datagram: Datagram) -> Option<Datagram> {
        S::on_outgoing(self, now, datagram)
    }

    fn on_incoming(&mut self, now: Instant, datagram: Datagram) -> Option<Datagram> {
        S::on_incoming(self, now, datagram)
    }

    fn poll_outgoing(&mut self, now: Instant) -> Option<Datagram> {
        S::poll_outgoing(self, now)
    }

    fn poll_incoming(&mut self, now: Instant) -> Option<Datagram> {
        S::poll_incoming(self, now)
    }
}

/// Conditions applied to datagrams travelling in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkConditions {
    /// Minimum extra delay added to each datagram.
    pub latency_min: Duration,
    /// Maximum extra delay added to each datagram.
    ///
    /// The delay of each datagram is sampled uniformly from
    /// `latency_min..=latency_max`.
    pub latency_max: Duration,
    /// Drops one datagram out of every `N`, where `N` is sampled uniformly
    /// from this range after every drop.
    ///
    /// `None` disables loss. `Some((2, 2))` drops every second datagram.
    pub loss_interval: Option<(u32, u32)>,
    /// Whether datagrams may be released in a different order than they were
    /// offered in.
    pub reorder: bool,
}

impl LinkConditions {
    /// Sets the latency range.
    #[must_use]
    pub const fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency_min = min;
        self.latency_max = max;
        self
    }

    /// Drops one datagram in every `N`, with `N` in `min..=max`.
    #[must_use]
    pub const fn with_loss(mut self, min: u32, max: u32) -> Self {
        self.loss_interval = Some((min, max));
        self
    }

    /// Disables datagram loss.
    #[must_use]
    pub const fn without_loss(mut self) -> Self {
        self.loss_interval = None;
        self
    }

    /// Sets whether datagrams may be reordered.
    #[must_use]
    pub const fn with_reorder(mut self, reorder: bool) -> Self {
        self.reorder = reorder;
        self
    }

    const fn is_transparent(&self) -> bool {
        self.latency_max.is_zero() && self.loss_interval.is_none() && !self.reorder
    }
}

/// Default [`Simulator`], applying independent [`LinkConditions`] to outgoing
/// and incoming datagrams.
///
/// All random decisions come from a [`StdRng`] seeded at construction, so a
/// given seed and sequence of calls always produces the same faults.
///
/// # Examples
///
/// ```
/// use {
///     carrier_io::{
///         Datagram,
///         sim::{LinkConditions, LinkSimulator, Simulator},
///     },
///     core::time::Duration,
///     web_time::Instant,
/// };
///
/// let mut sim = LinkSimulator::new(0);
/// sim.set_outgoing(
///     LinkConditions::default()
///         .with_latency(Duration::from_millis(30), Duration::from_millis(30)),
/// );
///
/// let now = Instant::now();
/// let addr = "127.0.0.1:1000".parse().unwrap();
/// assert!(sim.on_outgoing(now, Datagram::new(addr, &b"hi"[..])).is_none());
/// assert!(sim.poll_outgoing(now).is_none());
/// assert!(sim.poll_outgoing(now + Duration::from_millis(30)).is_some());
/// ```
#[derive(Debug)]
pub struct LinkSimulator {
    enabled: bool,
    rng: StdRng,
    outgoing: Link,
    incoming: Link,
}

#[derive(Debug, Default)]
struct Link {
    conditions: LinkConditions,
    queue: VecDeque<Scheduled>,
    since_drop: u32,
    drop_every: Option<u32>,
    last_release_at: Option<Instant>,
}

#[derive(Debug)]
struct Scheduled {
    datagram: Datagram,
    release_at: Instant,
}

impl LinkSimulator {
    /// Creates an enabled simulator with no faults configured.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            enabled: true,
            rng: StdRng::seed_from_u64(seed),
            outgoing: Link::default(),
            incoming: Link::default(),
        }
    }

    /// Gets the conditions applied to outgoing datagrams.
    #[must_use]
    pub const fn outgoing(&self) -> &LinkConditions {
        &self.outgoing.conditions
    }

    /// Gets the conditions applied to incoming datagrams.
    #[must_use]
    pub const fn incoming(&self) -> &LinkConditions {
        &self.incoming.conditions
    }

    /// Replaces the conditions applied to outgoing datagrams.
    pub fn set_outgoing(&mut self, conditions: LinkConditions) {
        self.outgoing.set_conditions(conditions);
    }

    /// Replaces the conditions applied to incoming datagrams.
    pub fn set_incoming(&mut self, conditions: LinkConditions) {
        self.incoming.set_conditions(conditions);
    }

    /// Gets how many datagrams are waiting to be released in either direction.
    #[must_use]
    pub fn num_queued(&self) -> usize {
        self.outgoing.queue.len() + self.incoming.queue.len()
    }
}

impl Simulator for LinkSimulator {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn on_outgoing(&mut self, now: Instant, datagram: Datagram) -> Option<Datagram> {
        if !self.enabled {
            return Some(datagram);
        }
        self.outgoing.condition(&mut self.rng, now, datagram)
    }

    fn on_incoming(&mut self, now: Instant, datagram: Datagram) -> Option<Datagram> {
        if !self.enabled {
            return Some(datagram);
        }
        self.incoming.condition(&mut self.rng, now, datagram)
    }

    fn poll_outgoing(&mut self, now: Instant) -> Option<Datagram> {
        self.outgoing.release(&mut self.rng, now)
    }

    fn poll_incoming(&mut self, now: Instant) -> Option<Datagram> {
        self.incoming.release(&mut self.rng, now)
    }
}

impl Link {
    fn set_conditions(&mut self, conditions: LinkConditions) {
        if conditions.loss_interval != self.conditions.loss_interval {
            self.since_drop = 0;
            self.drop_every = None;
        }
        self.conditions = conditions;
    }

    fn condition(&mut self, rng: &mut StdRng, now: Instant, datagram: Datagram) -> Option<Datagram> {
        if self.conditions.is_transparent() && self.queue.is_empty() {
            return Some(datagram);
        }

        if let Some((min, max)) = self.conditions.loss_interval {
            let drop_every = *self
                .drop_every
                .get_or_insert_with(|| sample_interval(rng, min, max));
            self.since_drop += 1;
            if self.since_drop >= drop_every {
                self.since_drop = 0;
                self.drop_every = Some(sample_interval(rng, min, max));
                trace!("dropping datagram for {}", datagram.addr);
                return None;
            }
        }

        let LinkConditions {
            latency_min,
            latency_max,
            reorder,
            ..
        } = self.conditions;
        let latency = if latency_max > latency_min {
            rng.gen_range(latency_min..=latency_max)
        } else {
            latency_min
        };

        let mut release_at = now + latency;
        if !reorder {
            // never let a datagram overtake one offered before it
            if let Some(last) = self.last_release_at {
                release_at = release_at.max(last);
            }
        }
        self.last_release_at = Some(release_at);
        self.queue.push_back(Scheduled {
            datagram,
            release_at,
        });
        None
    }

    fn release(&mut self, rng: &mut StdRng, now: Instant) -> Option<Datagram> {
        let index = if self.conditions.reorder {
            let due = self.queue.iter().filter(|s| s.release_at <= now).count();
            if due == 0 {
                return None;
            }
            let nth = rng.gen_range(0..due);
            self.queue
                .iter()
                .enumerate()
                .filter(|(_, s)| s.release_at <= now)
                .nth(nth)
                .map(|(index, _)| index)?
        } else {
            self.queue.iter().position(|s| s.release_at <= now)?
        };
        self.queue.remove(index).map(|s| s.datagram)
    }
}

fn sample_interval(rng: &mut StdRng, min: u32, max: u32) -> u32 {
    let (min, max) = (min.max(1), max.max(1));
    if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {super::*, core::net::SocketAddr};

    fn addr() -> SocketAddr {
        "127.0.0.1:1000".parse().unwrap()
    }

    fn datagram(n: u8) -> Datagram {
        Datagram::new(addr(), vec![n])
    }

    #[test]
    fn transparent_by_default() {
        let mut sim = LinkSimulator::new(0);
        let now = Instant::now();
        assert_eq!(Some(datagram(1)), sim.on_outgoing(now, datagram(1)));
        assert_eq!(Some(datagram(2)), sim.on_incoming(now, datagram(2)));
    }

    #[test]
    fn drop_every_second() {
        let mut sim = LinkSimulator::new(0);
        sim.set_outgoing(LinkConditions::default().with_loss(2, 2));
        let now = Instant::now();

        let mut passed = 0;
        for n in 0..10 {
            sim.on_outgoing(now, datagram(n));
            while sim.poll_outgoing(now).is_some() {
                passed += 1;
            }
        }
        assert_eq!(5, passed);
    }

    #[test]
    fn latency_keeps_order() {
        let mut sim = LinkSimulator::new(0);
        sim.set_incoming(LinkConditions::default().with_latency(
            Duration::from_millis(10),
            Duration::from_millis(50),
        ));
        let now = Instant::now();
        for n in 0..20 {
            assert!(sim.on_incoming(now, datagram(n)).is_none());
        }

        let later = now + Duration::from_millis(50);
        let order = (0..20)
            .map(|_| sim.poll_incoming(later).unwrap().payload[0])
            .collect::<Vec<_>>();
        assert_eq!((0..20).collect::<Vec<_>>(), order);
    }

    #[test]
    fn reorder_changes_order() {
        let mut sim = LinkSimulator::new(7);
        sim.set_incoming(LinkConditions::default().with_reorder(true));
        let now = Instant::now();
        for n in 0..20 {
            assert!(sim.on_incoming(now, datagram(n)).is_none());
        }

        let order = (0..20)
            .map(|_| sim.poll_incoming(now).unwrap().payload[0])
            .collect::<Vec<_>>();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!((0..20).collect::<Vec<_>>(), sorted);
        assert_ne!(sorted, order);
    }

    #[test]
    fn disable_keeps_queued() {
        let mut sim = LinkSimulator::new(0);
        sim.set_outgoing(LinkConditions::default().with_latency(
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        let now = Instant::now();
        assert!(sim.on_outgoing(now, datagram(1)).is_none());

        sim.disable();
        assert!(!sim.is_enabled());
        assert_eq!(Some(datagram(2)), sim.on_outgoing(now, datagram(2)));
        assert!(sim.poll_outgoing(now).is_none());
        assert_eq!(
            Some(datagram(1)),
            sim.poll_outgoing(now + Duration::from_millis(100))
        );
    }

    #[test]
    fn same_seed_same_faults() {
        let run = |seed| {
            let mut sim = LinkSimulator::new(seed);
            sim.set_outgoing(LinkConditions::default().with_loss(1, 5));
            let now = Instant::now();
            (0..50)
                .map(|n| {
                    sim.on_outgoing(now, datagram(n));
                    sim.poll_outgoing(now).is_some()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(3), run(3));
    }
}
