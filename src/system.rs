//! The broker core: station chain, grand-central lists, attachments,
//! event routing, and cooperative wakeup.
//!
//! # Locking
//!
//! At most one station lock is held during any dispatch step, stations
//! are visited in ascending position order, and no path takes a pool
//! slot lock while holding a station lock (the predicate test holds the
//! slot and briefly takes the station's locks, never the reverse). No
//! lock is ever held across an await; waits happen on `Notify` handles
//! after the guard is dropped, with the notified-future created before
//! the final condition check so wakeups cannot be lost.
//!
//! # Ownership
//!
//! The system owns every event sitting on a list; a get moves ownership
//! to the attachment, put/dump/detach-restore move it back. The disjoint
//! union of grand-central new + used, all station inputs/outputs, and all
//! per-attachment owned sets is the whole pool at any quiescent point.

use crate::config::SystemConfig;
use crate::errors::{EtError, Result};
use crate::pool::Pool;
use crate::station::{PredicateRegistry, Station, StationConfig};
use crate::types::{
    AttId, BlockMode, FlowMode, Mode, Owner, ParallelPos, Place, Position, RestoreMode, StatId,
    StationState, UserMode, ATTACHMENTS_MAX, GRAND_CENTRAL, STATIONS_MAX,
};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-attachment record: identity for crash bookkeeping, transfer
/// counters, the cooperative sleep/quit flags, and the ordered set of
/// owned events used at restore time.
pub struct Attachment {
    pub id: AttId,
    pub stat_id: StatId,
    pub pid: u32,
    pub host: String,
    pub interface: String,
    pub events_make: AtomicU64,
    pub events_get: AtomicU64,
    pub events_put: AtomicU64,
    pub events_dump: AtomicU64,
    pub sleeping: AtomicBool,
    pub quit: AtomicBool,
    owned: Mutex<Vec<Place>>,
}

impl Attachment {
    fn new(id: AttId, stat_id: StatId, pid: u32, host: String, interface: String) -> Attachment {
        Attachment {
            id,
            stat_id,
            pid,
            host,
            interface,
            events_make: AtomicU64::new(0),
            events_get: AtomicU64::new(0),
            events_put: AtomicU64::new(0),
            events_dump: AtomicU64::new(0),
            sleeping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            owned: Mutex::new(Vec::new()),
        }
    }

    pub fn owned_count(&self) -> usize {
        self.owned.lock().len()
    }

    /// Consume a pending quit request, clearing the sleep state.
    fn take_quit(&self) -> bool {
        self.sleeping.store(false, Ordering::Release);
        self.quit.swap(false, Ordering::AcqRel)
    }
}

/// Grand-central storage: per-group new lists plus the single used list.
struct Central {
    new_lists: Vec<VecDeque<Place>>,
    used: VecDeque<Place>,
}

/// Snapshot of where every event currently sits; used by monitoring and
/// the conservation tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCensus {
    pub central_new: usize,
    pub central_used: usize,
    pub station_inputs: usize,
    pub station_outputs: usize,
    pub attached: usize,
}

impl EventCensus {
    pub fn total(&self) -> usize {
        self.central_new
            + self.central_used
            + self.station_inputs
            + self.station_outputs
            + self.attached
    }
}

pub struct System {
    config: SystemConfig,
    pool: Pool,
    registry: PredicateRegistry,
    /// Position-ordered chain; each entry is a parallel group in
    /// parallel-position order. Entry 0 is always `[grand central]`.
    chain: RwLock<Vec<Vec<Arc<Station>>>>,
    /// Station slot table addressed by `StatId`.
    stations: RwLock<Vec<Option<Arc<Station>>>>,
    central: Mutex<Central>,
    /// Wakes producers parked in `new_events`.
    notify_new: Notify,
    attachments: RwLock<Vec<Option<Arc<Attachment>>>>,
    killed: AtomicBool,
    /// Woken once on kill so servers can unwind.
    pub notify_kill: Notify,
    heartbeat: AtomicU64,
}

impl System {
    pub fn new(config: SystemConfig) -> Result<Arc<System>> {
        let config = config.validate()?;
        let pool = Pool::new(&config);
        let registry = PredicateRegistry::default();

        let gc = Arc::new(Station::new(
            GRAND_CENTRAL,
            "GRAND_CENTRAL".into(),
            StationConfig::default().validate(config.nevents, &registry)?,
            &registry,
        )?);
        gc.lists().state = StationState::Active;

        let mut new_lists: Vec<VecDeque<Place>> =
            config.groups.iter().map(|&q| VecDeque::with_capacity(q)).collect();
        for place in 0..config.nevents {
            new_lists[config.group_of(place)].push_back(place);
        }

        info!(
            name = %config.name,
            nevents = config.nevents,
            event_size = config.event_size,
            groups = config.groups.len(),
            "event system created"
        );

        Ok(Arc::new(System {
            pool,
            registry,
            chain: RwLock::new(vec![vec![gc.clone()]]),
            stations: RwLock::new({
                let mut v = vec![None; STATIONS_MAX];
                v[GRAND_CENTRAL] = Some(gc);
                v
            }),
            central: Mutex::new(Central { new_lists, used: VecDeque::new() }),
            notify_new: Notify::new(),
            attachments: RwLock::new(vec![None; ATTACHMENTS_MAX]),
            killed: AtomicBool::new(false),
            notify_kill: Notify::new(),
            heartbeat: AtomicU64::new(0),
            config,
        }))
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn predicates(&self) -> &PredicateRegistry {
        &self.registry
    }

    pub fn alive(&self) -> bool {
        !self.killed.load(Ordering::Acquire)
    }

    /// Set the terminate flag and wake everything that might be parked.
    pub fn kill(&self) {
        warn!("kill requested, shutting the system down");
        self.killed.store(true, Ordering::Release);
        self.notify_new.notify_waiters();
        self.notify_kill.notify_waiters();
        for group in self.chain.read().iter() {
            for st in group {
                st.notify_in.notify_waiters();
                st.notify_space.notify_waiters();
            }
        }
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    pub fn beat(&self) {
        self.heartbeat.fetch_add(1, Ordering::Relaxed);
    }

    fn check_alive(&self) -> Result<()> {
        if self.alive() { Ok(()) } else { Err(EtError::Dead) }
    }

    // =========================================================================
    // STATIONS
    // =========================================================================

    pub fn station(&self, stat_id: StatId) -> Result<Arc<Station>> {
        self.stations
            .read()
            .get(stat_id)
            .and_then(|s| s.clone())
            .ok_or(EtError::BadArg)
    }

    /// Station id by name, the `exists` operation.
    pub fn station_find(&self, name: &str) -> Option<StatId> {
        self.stations
            .read()
            .iter()
            .flatten()
            .find(|s| s.name == name)
            .map(|s| s.id)
    }

    /// Number of stations currently in the chain, grand central included.
    pub fn station_count(&self) -> usize {
        self.chain.read().iter().map(|g| g.len()).sum()
    }

    /// Create a station at `position` / `ppos` in the chain.
    /// A duplicate name reports the existing id via `Exists`.
    pub fn station_create_at(
        &self,
        name: &str,
        config: StationConfig,
        position: Position,
        ppos: ParallelPos,
    ) -> Result<StatId> {
        self.check_alive()?;
        if let Some(id) = self.station_find(name) {
            return Err(EtError::Exists(id));
        }
        let config = config.validate(self.config.nevents, &self.registry)?;

        let mut stations = self.stations.write();
        let mut chain = self.chain.write();

        let slot = stations
            .iter()
            .position(|s| s.is_none())
            .ok_or(EtError::TooMany)?;

        let pos = match position {
            Position::End => chain.len(),
            Position::At(0) => return Err(EtError::BadArg),
            Position::At(n) => n.min(chain.len()),
        };

        let station = Arc::new(Station::new(slot, name.to_string(), config.clone(), &self.registry)?);

        if config.flow_mode == FlowMode::Parallel {
            // Joining an existing group: the group must be there and the
            // head must carry compatible selection and block policies.
            if pos >= chain.len() {
                return Err(EtError::BadArg);
            }
            let group = &mut chain[pos];
            let head = group.first().ok_or(EtError::BadArg)?;
            if !config.compatible_with(&head.config()) {
                return Err(EtError::BadArg);
            }
            let at = match ppos {
                ParallelPos::End => group.len(),
                ParallelPos::Head => 0,
                ParallelPos::At(n) => n.min(group.len()),
            };
            group.insert(at, station.clone());
        } else {
            chain.insert(pos, vec![station.clone()]);
        }

        station.lists().state = StationState::Idle;
        stations[slot] = Some(station);
        debug!(name, id = slot, position = pos, "station created");
        Ok(slot)
    }

    /// Remove an idle station; anything left on its lists goes to the
    /// grand-central used list.
    pub fn station_remove(&self, stat_id: StatId) -> Result<()> {
        if stat_id == GRAND_CENTRAL {
            return Err(EtError::BadArg);
        }
        let station = self.station(stat_id)?;

        let mut stations = self.stations.write();
        let mut chain = self.chain.write();

        let mut stranded: Vec<Place> = Vec::new();
        {
            let mut lists = station.lists();
            if !lists.attachments.is_empty() {
                return Err(EtError::Error);
            }
            lists.state = StationState::Removing;
            stranded.extend(lists.input.drain(..));
            stranded.extend(lists.output.drain(..));
        }

        for group in chain.iter_mut() {
            group.retain(|s| s.id != stat_id);
        }
        chain.retain(|g| !g.is_empty());
        stations[stat_id] = None;
        drop(chain);
        drop(stations);

        if !stranded.is_empty() {
            let mut central = self.central.lock();
            central.used.extend(stranded);
            drop(central);
            self.notify_new.notify_waiters();
        }
        debug!(id = stat_id, "station removed");
        Ok(())
    }

    /// Current (position, parallel-position) of a station.
    pub fn station_position(&self, stat_id: StatId) -> Result<(usize, usize)> {
        let chain = self.chain.read();
        for (pos, group) in chain.iter().enumerate() {
            if let Some(ppos) = group.iter().position(|s| s.id == stat_id) {
                return Ok((pos, ppos));
            }
        }
        Err(EtError::BadArg)
    }

    /// Move a station to a new place in the chain.
    pub fn station_set_position(
        &self,
        stat_id: StatId,
        position: Position,
        ppos: ParallelPos,
    ) -> Result<()> {
        if stat_id == GRAND_CENTRAL {
            return Err(EtError::BadArg);
        }
        let station = self.station(stat_id)?;
        let mut chain = self.chain.write();

        for group in chain.iter_mut() {
            group.retain(|s| s.id != stat_id);
        }
        chain.retain(|g| !g.is_empty());

        let pos = match position {
            Position::End => chain.len(),
            Position::At(0) => return Err(EtError::BadArg),
            Position::At(n) => n.min(chain.len()),
        };
        match ppos {
            ParallelPos::End if pos < chain.len() => chain[pos].push(station),
            ParallelPos::Head if pos < chain.len() => chain[pos].insert(0, station),
            ParallelPos::At(n) if pos < chain.len() => {
                let at = n.min(chain[pos].len());
                chain[pos].insert(at, station);
            }
            _ => {
                let at = pos.min(chain.len());
                chain.insert(at, vec![station]);
            }
        }
        Ok(())
    }

    // =========================================================================
    // ATTACHMENTS
    // =========================================================================

    pub fn attachment(&self, att_id: AttId) -> Result<Arc<Attachment>> {
        self.attachments
            .read()
            .get(att_id)
            .and_then(|a| a.clone())
            .ok_or(EtError::BadArg)
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.read().iter().flatten().count()
    }

    pub fn attach(
        &self,
        stat_id: StatId,
        pid: u32,
        host: &str,
        interface: &str,
    ) -> Result<AttId> {
        self.check_alive()?;
        let station = self.station(stat_id)?;

        let mut attachments = self.attachments.write();
        let slot = attachments
            .iter()
            .position(|a| a.is_none())
            .ok_or(EtError::TooMany)?;

        {
            let mut lists = station.lists();
            match lists.state {
                StationState::Idle | StationState::Active => {}
                _ => return Err(EtError::BadArg),
            }
            if station.config().user_mode == UserMode::Single && !lists.attachments.is_empty() {
                return Err(EtError::Busy);
            }
            lists.attachments.push(slot);
            lists.state = StationState::Active;
        }

        let att = Arc::new(Attachment::new(
            slot,
            stat_id,
            pid,
            host.to_string(),
            interface.to_string(),
        ));
        attachments[slot] = Some(att);
        debug!(att = slot, station = stat_id, pid, host, "attached");
        Ok(slot)
    }

    /// Detach, restoring any events the attachment still owns according
    /// to the station's restore mode. Always succeeds for a live id.
    pub async fn detach(&self, att_id: AttId) -> Result<()> {
        let att = self.attachment(att_id)?;
        let station = self.station(att.stat_id)?;

        let owned: Vec<Place> = std::mem::take(&mut *att.owned.lock());
        let restore = station.config().restore_mode;

        if !owned.is_empty() {
            debug!(
                att = att_id,
                station = att.stat_id,
                events = owned.len(),
                ?restore,
                "restoring events on detach"
            );
            for &place in &owned {
                self.pool.event(place)?.owner = Owner::System;
            }
            match restore {
                RestoreMode::Input => {
                    let mut lists = station.lists();
                    // Reverse push-front keeps the original get order at
                    // the head of the list.
                    for &place in owned.iter().rev() {
                        lists.input.push_front(place);
                    }
                    drop(lists);
                    station.notify_in.notify_waiters();
                }
                RestoreMode::Output => {
                    station.lists().output.extend(owned.iter().copied());
                    self.drain_output(&station, None).await?;
                }
                RestoreMode::GrandCentral => {
                    self.central.lock().used.extend(owned.iter().copied());
                    self.notify_new.notify_waiters();
                }
                RestoreMode::Discard => {
                    let mut central = self.central.lock();
                    for &place in &owned {
                        let group = self.pool.event(place)?.group();
                        self.pool.recycle(place)?;
                        central.new_lists[group].push_back(place);
                    }
                    drop(central);
                    self.notify_new.notify_waiters();
                }
            }
        }

        {
            let mut lists = station.lists();
            lists.attachments.retain(|&a| a != att_id);
            if lists.attachments.is_empty() && station.id != GRAND_CENTRAL {
                lists.state = StationState::Idle;
            }
        }
        self.attachments.write()[att_id] = None;
        debug!(att = att_id, "detached");
        Ok(())
    }

    pub fn is_attached(&self, stat_id: StatId, att_id: AttId) -> Result<bool> {
        let station = self.station(stat_id)?;
        let lists = station.lists();
        Ok(lists.attachments.contains(&att_id))
    }

    // =========================================================================
    // WAKEUP
    // =========================================================================

    /// Raise the quit flag and kick every wait the attachment might be
    /// parked in.
    pub fn wake_attachment(&self, att_id: AttId) -> Result<()> {
        let att = self.attachment(att_id)?;
        att.quit.store(true, Ordering::Release);
        if let Ok(station) = self.station(att.stat_id) {
            station.notify_in.notify_waiters();
            station.notify_space.notify_waiters();
        }
        self.notify_new.notify_waiters();
        debug!(att = att_id, "wake requested");
        Ok(())
    }

    /// Wake every attachment of a station.
    pub fn wake_station(&self, stat_id: StatId) -> Result<()> {
        let station = self.station(stat_id)?;
        let atts: Vec<AttId> = station.lists().attachments.clone();
        for att_id in atts {
            if let Ok(att) = self.attachment(att_id) {
                att.quit.store(true, Ordering::Release);
            }
        }
        station.notify_in.notify_waiters();
        station.notify_space.notify_waiters();
        self.notify_new.notify_waiters();
        Ok(())
    }

    // =========================================================================
    // EVENT OPERATIONS
    // =========================================================================

    /// Allocate fresh events from grand central. Honors group quotas when
    /// `group` is given, may partially fulfil `count`, and waits per
    /// `mode` when nothing is free. Oversized requests draw on the
    /// side-buffer budget unless `no_alloc` promises payload at put time.
    pub async fn new_events(
        &self,
        att_id: AttId,
        mode: Mode,
        size: u64,
        count: usize,
        group: Option<usize>,
        no_alloc: bool,
    ) -> Result<Vec<Place>> {
        self.check_alive()?;
        let att = self.attachment(att_id)?;
        if size == 0 || count == 0 {
            return Err(EtError::BadArg);
        }
        if let Some(g) = group {
            if g >= self.config.groups.len() {
                return Err(EtError::BadArg);
            }
        }
        let oversized = size > self.config.event_size && !no_alloc;
        if oversized && self.config.temp_max == 0 {
            return Err(EtError::TooBig);
        }

        let deadline = match mode {
            Mode::Timed(d) => Some(Instant::now() + d),
            _ => None,
        };

        loop {
            let notified = self.notify_new.notified();

            let taken = self.take_from_central(count, group);
            if !taken.is_empty() {
                let mut out = Vec::with_capacity(taken.len());
                let mut failed = None;
                for (i, &place) in taken.iter().enumerate() {
                    if oversized {
                        if let Err(e) = self.pool.make_oversized(place, size) {
                            failed = Some((i, e));
                            break;
                        }
                    }
                    let mut ev = self.pool.event(place)?;
                    ev.reset(Owner::Attachment(att_id));
                    drop(ev);
                    att.owned.lock().push(place);
                    att.events_make.fetch_add(1, Ordering::Relaxed);
                    out.push(place);
                }
                if let Some((i, e)) = failed {
                    // Budget ran dry mid-batch: hand the rest back and
                    // stop with whatever was upgraded.
                    let mut central = self.central.lock();
                    for &place in &taken[i..] {
                        let g = self.pool.event(place)?.group();
                        central.new_lists[g].push_back(place);
                    }
                    drop(central);
                    self.notify_new.notify_waiters();
                    if out.is_empty() {
                        return Err(e);
                    }
                }
                att.sleeping.store(false, Ordering::Release);
                return Ok(out);
            }

            if att.take_quit() {
                return Err(EtError::Wakeup);
            }
            if !self.alive() {
                return Err(EtError::Dead);
            }

            match mode {
                Mode::Async => return Err(EtError::Empty),
                Mode::Sleep => {
                    att.sleeping.store(true, Ordering::Release);
                    notified.await;
                }
                Mode::Timed(_) => {
                    att.sleeping.store(true, Ordering::Release);
                    let deadline = deadline.unwrap_or_else(Instant::now);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        att.sleeping.store(false, Ordering::Release);
                        if att.take_quit() {
                            return Err(EtError::Wakeup);
                        }
                        return Err(EtError::Timeout);
                    }
                }
            }
        }
    }

    /// Pull up to `count` free places, lazily recycling the used list
    /// when the new lists run out.
    fn take_from_central(&self, count: usize, group: Option<usize>) -> Vec<Place> {
        let mut central = self.central.lock();

        let empty = match group {
            Some(g) => central.new_lists[g].is_empty(),
            None => central.new_lists.iter().all(|l| l.is_empty()),
        };
        if empty && !central.used.is_empty() {
            while let Some(place) = central.used.pop_front() {
                if self.pool.recycle(place).is_err() {
                    continue;
                }
                let g = match self.pool.event(place) {
                    Ok(ev) => ev.group(),
                    Err(_) => continue,
                };
                central.new_lists[g].push_back(place);
            }
        }

        let mut out = Vec::new();
        match group {
            Some(g) => {
                while out.len() < count {
                    match central.new_lists[g].pop_front() {
                        Some(p) => out.push(p),
                        None => break,
                    }
                }
            }
            None => {
                'outer: for list in central.new_lists.iter_mut() {
                    while out.len() < count {
                        match list.pop_front() {
                            Some(p) => out.push(p),
                            None => continue 'outer,
                        }
                    }
                    break;
                }
            }
        }
        out
    }

    /// Take events from the attachment's station input, transferring
    /// ownership. Returns `min(available, count)` once anything is there;
    /// otherwise waits per `mode`, honouring the quit flag on entry,
    /// after every wake or timeout, and on exit.
    pub async fn get_events(&self, att_id: AttId, mode: Mode, count: usize) -> Result<Vec<Place>> {
        self.check_alive()?;
        let att = self.attachment(att_id)?;
        if att.stat_id == GRAND_CENTRAL {
            return Err(EtError::BadArg);
        }
        if count == 0 {
            return Err(EtError::BadArg);
        }
        let station = self.station(att.stat_id)?;

        let deadline = match mode {
            Mode::Timed(d) => Some(Instant::now() + d),
            _ => None,
        };

        loop {
            let notified = station.notify_in.notified();

            let taken: Vec<Place> = {
                let mut lists = station.lists();
                let n = count.min(lists.input.len());
                lists.input.drain(..n).collect()
            };
            if !taken.is_empty() {
                for &place in &taken {
                    self.pool.event(place)?.owner = Owner::Attachment(att_id);
                    att.owned.lock().push(place);
                    att.events_get.fetch_add(1, Ordering::Relaxed);
                }
                att.sleeping.store(false, Ordering::Release);
                station.notify_space.notify_waiters();
                return Ok(taken);
            }

            if att.take_quit() {
                return Err(EtError::Wakeup);
            }
            if !self.alive() {
                return Err(EtError::Dead);
            }

            match mode {
                Mode::Async => return Err(EtError::Empty),
                Mode::Sleep => {
                    att.sleeping.store(true, Ordering::Release);
                    notified.await;
                }
                Mode::Timed(_) => {
                    att.sleeping.store(true, Ordering::Release);
                    let deadline = deadline.unwrap_or_else(Instant::now);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        att.sleeping.store(false, Ordering::Release);
                        if att.take_quit() {
                            return Err(EtError::Wakeup);
                        }
                        return Err(EtError::Timeout);
                    }
                }
            }
        }
    }

    /// Put events back: stage them on the station output, then run the
    /// dispatch algorithm downstream. Events must be owned by `att_id`
    /// and are dispatched in the order given.
    pub async fn put_events(&self, att_id: AttId, places: &[Place]) -> Result<()> {
        self.check_alive()?;
        let att = self.attachment(att_id)?;
        let station = self.station(att.stat_id)?;

        self.release_owned(&att, places)?;
        station.lists().output.extend(places.iter().copied());
        att.events_put.fetch_add(places.len() as u64, Ordering::Relaxed);

        self.drain_output(&station, Some(&att)).await
    }

    /// Discard events: straight to the grand-central used list, skipping
    /// every downstream station.
    pub async fn dump_events(&self, att_id: AttId, places: &[Place]) -> Result<()> {
        self.check_alive()?;
        let att = self.attachment(att_id)?;

        self.release_owned(&att, places)?;
        self.central.lock().used.extend(places.iter().copied());
        att.events_dump.fetch_add(places.len() as u64, Ordering::Relaxed);
        self.notify_new.notify_waiters();
        Ok(())
    }

    /// Validate ownership and move `places` out of the attachment's
    /// owned set, returning them to system ownership.
    fn release_owned(&self, att: &Attachment, places: &[Place]) -> Result<()> {
        {
            let owned = att.owned.lock();
            for place in places {
                if !owned.contains(place) {
                    return Err(EtError::BadArg);
                }
            }
        }
        for &place in places {
            self.pool.event(place)?.owner = Owner::System;
        }
        att.owned.lock().retain(|p| !places.contains(p));
        Ok(())
    }

    /// Move everything on a station's output through the dispatch
    /// algorithm, starting at the station's successor.
    async fn drain_output(&self, station: &Arc<Station>, att: Option<&Attachment>) -> Result<()> {
        loop {
            let place = match station.lists().output.pop_front() {
                Some(p) => p,
                None => return Ok(()),
            };
            let (pos, _) = self.station_position(station.id)?;
            self.dispatch(pos, place, att).await?;
        }
    }

    /// The routing loop of §dispatch: walk the chain after `from_pos`,
    /// pick a candidate per group (round-robin across parallel siblings
    /// with cue space, falling back to the head's blocking policy), test
    /// its predicate, and deliver. Falls through to the grand-central
    /// used list.
    async fn dispatch(&self, from_pos: usize, place: Place, att: Option<&Attachment>) -> Result<()> {
        // Work on a snapshot: stations created or removed mid-flight see
        // traffic from the next put onwards.
        let chain: Vec<Vec<Arc<Station>>> = self.chain.read().clone();

        let mut pos = from_pos + 1;
        while pos < chain.len() {
            let group: Vec<Arc<Station>> = chain[pos]
                .iter()
                .filter(|s| s.lists().state == StationState::Active)
                .cloned()
                .collect();
            pos += 1;
            if group.is_empty() {
                continue;
            }

            let head = &group[0];
            let candidate = if group.len() == 1 {
                head.clone()
            } else {
                match self.pick_sibling(head, &group) {
                    Some(st) => st,
                    None => continue,
                }
            };

            let accepted = {
                let ev = self.pool.event(place)?;
                candidate.accepts(&ev)
            };
            if !accepted {
                continue;
            }

            if self.deliver(&candidate, place, att).await? {
                return Ok(());
            }
            // Full non-blocking cue: the event skips this station.
        }

        self.central.lock().used.push_back(place);
        self.notify_new.notify_waiters();
        Ok(())
    }

    /// Round-robin over the group's siblings starting at the head's
    /// cursor, preferring one with free cue space; with every cue full,
    /// a blocking group still yields the next sibling (the producer will
    /// wait), a non-blocking group yields none.
    fn pick_sibling(&self, head: &Arc<Station>, group: &[Arc<Station>]) -> Option<Arc<Station>> {
        let start = {
            let mut lists = head.lists();
            let c = lists.rr_cursor;
            lists.rr_cursor = (c + 1) % group.len();
            c % group.len()
        };
        for i in 0..group.len() {
            let st = &group[(start + i) % group.len()];
            if st.input_space() > 0 {
                return Some(st.clone());
            }
        }
        match head.config().block_mode {
            BlockMode::Blocking => Some(group[start].clone()),
            BlockMode::Nonblocking => None,
        }
    }

    /// Push onto a station input, waiting for cue space when the station
    /// blocks. Returns false when a non-blocking cue was full (skip).
    async fn deliver(
        &self,
        station: &Arc<Station>,
        place: Place,
        att: Option<&Attachment>,
    ) -> Result<bool> {
        loop {
            let notified = station.notify_space.notified();
            {
                let cue = station.config().cue;
                let mut lists = station.lists();
                if lists.state != StationState::Active {
                    // Detached from under the waiting producer; let the
                    // event continue downstream instead.
                    return Ok(false);
                }
                if lists.input.len() < cue {
                    lists.input.push_back(place);
                    drop(lists);
                    station.notify_in.notify_waiters();
                    return Ok(true);
                }
            }
            if station.config().block_mode == BlockMode::Nonblocking {
                return Ok(false);
            }
            // A woken producer never abandons the event mid-dispatch; it
            // lands on the used list and the quit flag stays readable by
            // the next blocking call.
            if let Some(att) = att {
                if att.quit.load(Ordering::Acquire) {
                    self.central.lock().used.push_back(place);
                    self.notify_new.notify_waiters();
                    return Ok(true);
                }
            }
            if !self.alive() {
                return Err(EtError::Dead);
            }
            // Bounded wait so the quit and kill flags are seen within
            // one poll period even if no space ever opens up.
            let _ = tokio::time::timeout(Duration::from_secs(3), notified).await;
        }
    }

    // =========================================================================
    // MONITORING
    // =========================================================================

    /// Count where every event sits right now. Only quiescent totals are
    /// meaningful.
    pub fn census(&self) -> EventCensus {
        let central = self.central.lock();
        let central_new = central.new_lists.iter().map(|l| l.len()).sum();
        let central_used = central.used.len();
        drop(central);

        let mut station_inputs = 0;
        let mut station_outputs = 0;
        for group in self.chain.read().iter() {
            for st in group {
                let lists = st.lists();
                station_inputs += lists.input.len();
                station_outputs += lists.output.len();
            }
        }

        let attached = self
            .attachments
            .read()
            .iter()
            .flatten()
            .map(|a| a.owned_count())
            .sum();

        EventCensus {
            central_new,
            central_used,
            station_inputs,
            station_outputs,
            attached,
        }
    }

    /// Events waiting on the grand-central used list.
    pub fn central_used_count(&self) -> usize {
        self.central.lock().used.len()
    }

    /// Per-group quota table, served over the wire.
    pub fn group_quotas(&self) -> &[usize] {
        &self.config.groups
    }
}
