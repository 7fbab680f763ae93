//! Stations: routing nodes with a predicate, an input list, and an
//! output list.
//!
//! A station's mutable policy knobs sit behind their own lock so session
//! threads can tweak prescale/cue/select while dispatch runs. List state
//! (input, output, attachments, state machine) lives under a single
//! mutex per station, and the two `Notify` handles are its condition
//! variables: one wakes getters when input gains events, one wakes
//! producers when cue space appears.

use crate::errors::{EtError, Result};
use crate::pool::Event;
use crate::types::{
    AttId, BlockMode, FlowMode, Place, RestoreMode, SelectMode, StatId, StationState, UserMode,
    NSELECTS, SELECT_WILDCARD, STATION_NAME_MAX,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// A custom routing predicate. Receives the event header and the
/// station's current select words; must not mutate anything.
pub type Predicate = Arc<dyn Fn(&Event, &[i32; NSELECTS]) -> bool + Send + Sync>;

/// Named predicates available to `SelectMode::Custom` stations. The
/// original loads these from shared libraries by (lib, function) name;
/// here they are registered in-process before station creation.
#[derive(Default)]
pub struct PredicateRegistry {
    map: RwLock<HashMap<String, Predicate>>,
}

impl PredicateRegistry {
    pub fn register(&self, name: impl Into<String>, pred: Predicate) {
        self.map.write().insert(name.into(), pred);
    }

    pub fn resolve(&self, name: &str) -> Option<Predicate> {
        self.map.read().get(name).cloned()
    }
}

/// Station creation-time policy. Field meanings follow the data model:
/// `cue` bounds the input list (0 normalizes to the whole pool), and for
/// `SelectMode::Custom` the `function` name must resolve in the registry.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub flow_mode: FlowMode,
    pub user_mode: UserMode,
    pub restore_mode: RestoreMode,
    pub block_mode: BlockMode,
    /// Accept the first matching event, then every `prescale`-th.
    pub prescale: u32,
    pub cue: usize,
    pub select_mode: SelectMode,
    pub select: [i32; NSELECTS],
    /// Predicate reference, carried for remote inspection.
    pub function: String,
    pub lib: String,
    pub class: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            flow_mode: FlowMode::Serial,
            user_mode: UserMode::Multi,
            restore_mode: RestoreMode::Output,
            block_mode: BlockMode::Blocking,
            prescale: 1,
            cue: 0,
            select_mode: SelectMode::All,
            select: [SELECT_WILDCARD; NSELECTS],
            function: String::new(),
            lib: String::new(),
            class: String::new(),
        }
    }
}

impl StationConfig {
    pub fn validate(mut self, nevents: usize, registry: &PredicateRegistry) -> Result<Self> {
        if self.prescale == 0 {
            return Err(EtError::BadArg);
        }
        if self.cue == 0 || self.cue > nevents {
            self.cue = nevents;
        }
        if self.select_mode == SelectMode::Custom && registry.resolve(&self.function).is_none() {
            return Err(EtError::BadArg);
        }
        Ok(self)
    }

    /// A parallel member must agree with its group head on the policies
    /// that shape the shared logical input.
    pub fn compatible_with(&self, head: &StationConfig) -> bool {
        self.block_mode == head.block_mode && self.select_mode == head.select_mode
    }
}

/// List state guarded by the station mutex.
#[derive(Debug)]
pub struct StationLists {
    pub state: StationState,
    pub input: VecDeque<Place>,
    pub output: VecDeque<Place>,
    pub attachments: Vec<AttId>,
    /// Matching events seen so far, for the prescale gate.
    pub prescale_count: u64,
    /// Round-robin cursor over parallel siblings; meaningful on group
    /// heads only.
    pub rr_cursor: usize,
}

pub struct Station {
    pub id: StatId,
    pub name: String,
    config: Mutex<StationConfig>,
    predicate: Option<Predicate>,
    lists: Mutex<StationLists>,
    /// Wakes getters parked on an empty input.
    pub notify_in: Notify,
    /// Wakes producers parked on a full cue.
    pub notify_space: Notify,
}

impl std::fmt::Debug for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Station")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("config", &self.config)
            .field("has_predicate", &self.predicate.is_some())
            .field("lists", &self.lists)
            .finish()
    }
}

impl Station {
    pub fn new(
        id: StatId,
        name: String,
        config: StationConfig,
        registry: &PredicateRegistry,
    ) -> Result<Station> {
        if name.is_empty() || name.len() > STATION_NAME_MAX {
            return Err(EtError::BadArg);
        }
        let predicate = match config.select_mode {
            SelectMode::Custom => {
                Some(registry.resolve(&config.function).ok_or(EtError::BadArg)?)
            }
            _ => None,
        };
        Ok(Station {
            id,
            name,
            config: Mutex::new(config),
            predicate,
            lists: Mutex::new(StationLists {
                state: StationState::Creating,
                input: VecDeque::new(),
                output: VecDeque::new(),
                attachments: Vec::new(),
                prescale_count: 0,
                rr_cursor: 0,
            }),
            notify_in: Notify::new(),
            notify_space: Notify::new(),
        })
    }

    pub fn config(&self) -> MutexGuard<'_, StationConfig> {
        self.config.lock()
    }

    pub fn lists(&self) -> MutexGuard<'_, StationLists> {
        self.lists.lock()
    }

    /// Selection test alone, without the prescale gate. Pure.
    pub fn selects(&self, ev: &Event) -> bool {
        let cfg = self.config.lock();
        match cfg.select_mode {
            SelectMode::All => true,
            SelectMode::Match => cfg
                .select
                .iter()
                .zip(ev.control.iter())
                .all(|(&sel, &ctl)| sel == SELECT_WILDCARD || sel == ctl),
            SelectMode::Custom => match &self.predicate {
                Some(pred) => pred(ev, &cfg.select),
                None => false,
            },
        }
    }

    /// Full dispatch-time test: selection, then the prescale counter.
    /// Mutates only station state, never the event.
    pub fn accepts(&self, ev: &Event) -> bool {
        if !self.selects(ev) {
            return false;
        }
        let prescale = self.config.lock().prescale as u64;
        let mut lists = self.lists.lock();
        let hit = lists.prescale_count % prescale == 0;
        lists.prescale_count += 1;
        hit
    }

    /// Room left on the input list under the current cue.
    pub fn input_space(&self) -> usize {
        let cue = self.config.lock().cue;
        let lists = self.lists.lock();
        cue.saturating_sub(lists.input.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::pool::Pool;

    fn event_with_control(pool: &Pool, control: [i32; NSELECTS]) -> Place {
        let mut ev = pool.event(0).unwrap();
        ev.control = control;
        ev.place()
    }

    fn pool() -> Pool {
        let cfg = SystemConfig {
            nevents: 2,
            event_size: 16,
            ..Default::default()
        }
        .validate()
        .unwrap();
        Pool::new(&cfg)
    }

    fn station(config: StationConfig) -> Station {
        let registry = PredicateRegistry::default();
        Station::new(1, "s".into(), config, &registry).unwrap()
    }

    #[test]
    fn match_mode_honours_wildcards() {
        let p = pool();
        event_with_control(&p, [7, 3, 0, 0, 0, 0]);
        let mut select = [SELECT_WILDCARD; NSELECTS];
        select[0] = 7;
        let st = station(StationConfig {
            select_mode: SelectMode::Match,
            select,
            ..Default::default()
        });
        assert!(st.selects(&p.event(0).unwrap()));

        let mut miss = select;
        miss[1] = 9;
        *st.config() = StationConfig {
            select_mode: SelectMode::Match,
            select: miss,
            ..Default::default()
        };
        assert!(!st.selects(&p.event(0).unwrap()));
    }

    #[test]
    fn prescale_accepts_first_then_every_kth() {
        let p = pool();
        let st = station(StationConfig {
            prescale: 3,
            ..Default::default()
        });
        let picks: Vec<bool> = (0..9).map(|_| st.accepts(&p.event(0).unwrap())).collect();
        assert_eq!(
            picks,
            vec![true, false, false, true, false, false, true, false, false]
        );
    }

    #[test]
    fn custom_predicate_resolved_at_creation() {
        let registry = PredicateRegistry::default();
        registry.register(
            "high_first_word",
            Arc::new(|ev: &Event, _sel: &[i32; NSELECTS]| ev.control[0] > 10),
        );
        let cfg = StationConfig {
            select_mode: SelectMode::Custom,
            function: "high_first_word".into(),
            ..Default::default()
        };
        assert!(Station::new(1, "s".into(), cfg.clone(), &registry).is_ok());

        let missing = StationConfig {
            function: "nope".into(),
            ..cfg
        };
        assert_eq!(
            Station::new(2, "t".into(), missing, &registry).unwrap_err(),
            EtError::BadArg
        );
    }
}
