//! The event pool: a fixed array of event descriptors, each with a fixed
//! payload buffer, addressed by `place`.
//!
//! The pool hands out locked references, never raw pointers; free-list
//! bookkeeping lives in the grand-central lists (`system`), so the pool
//! itself only owns storage and the oversized-buffer budget.

use crate::config::SystemConfig;
use crate::errors::{EtError, Result};
use crate::types::{DataStatus, Modify, Owner, Place, Priority, Temp, NSELECTS};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// One event: metadata header plus payload storage. `length <= memsize`
/// always; `memsize` is the fixed buffer size unless the event is
/// oversized, in which case a side buffer stands in until the event
/// returns to grand central.
#[derive(Debug)]
pub struct Event {
    place: Place,
    group: usize,
    pub length: u64,
    memsize: u64,
    pub priority: Priority,
    pub datastatus: DataStatus,
    /// Opaque byte-order tag set by producers; never interpreted here.
    pub byteorder: u32,
    pub control: [i32; NSELECTS],
    pub owner: Owner,
    pub temp: Temp,
    pub modify: Modify,
    data: Box<[u8]>,
    side: Option<Box<[u8]>>,
}

impl Event {
    fn new(place: Place, group: usize, event_size: u64) -> Event {
        Event {
            place,
            group,
            length: 0,
            memsize: event_size,
            priority: Priority::Low,
            datastatus: DataStatus::Ok,
            byteorder: 0,
            control: [0; NSELECTS],
            owner: Owner::System,
            temp: Temp::Normal,
            modify: Modify::None,
            data: vec![0u8; event_size as usize].into_boxed_slice(),
            side: None,
        }
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn memsize(&self) -> u64 {
        self.memsize
    }

    pub fn data(&self) -> &[u8] {
        match &self.side {
            Some(buf) => buf,
            None => &self.data,
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.side {
            Some(buf) => buf,
            None => &mut self.data,
        }
    }

    /// Set the valid length, bounded by capacity.
    pub fn set_length(&mut self, length: u64) -> Result<()> {
        if length > self.memsize {
            return Err(EtError::TooBig);
        }
        self.length = length;
        Ok(())
    }

    /// Fresh-event state handed to a producer.
    pub fn reset(&mut self, owner: Owner) {
        self.length = 0;
        self.priority = Priority::Low;
        self.datastatus = DataStatus::Ok;
        self.byteorder = 0;
        self.control = [0; NSELECTS];
        self.modify = Modify::None;
        self.owner = owner;
    }
}

pub struct Pool {
    slots: Vec<Mutex<Event>>,
    event_size: u64,
    temp_max: usize,
    temp_count: AtomicUsize,
}

impl Pool {
    pub fn new(config: &SystemConfig) -> Pool {
        let slots = (0..config.nevents)
            .map(|place| Mutex::new(Event::new(place, config.group_of(place), config.event_size)))
            .collect();
        Pool {
            slots,
            event_size: config.event_size,
            temp_max: config.temp_max,
            temp_count: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn event_size(&self) -> u64 {
        self.event_size
    }

    pub fn event(&self, place: Place) -> Result<MutexGuard<'_, Event>> {
        self.slots.get(place).map(|m| m.lock()).ok_or(EtError::BadArg)
    }

    /// Attach an oversized side buffer, drawing on the system-wide
    /// budget. The descriptor and `place` stay the same.
    pub fn make_oversized(&self, place: Place, size: u64) -> Result<()> {
        let mut prev = self.temp_count.load(Ordering::Relaxed);
        loop {
            if prev >= self.temp_max {
                return Err(EtError::TooBig);
            }
            match self.temp_count.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => prev = cur,
            }
        }

        let mut ev = self.event(place)?;
        ev.side = Some(vec![0u8; size as usize].into_boxed_slice());
        ev.memsize = size;
        ev.temp = Temp::Oversized;
        Ok(())
    }

    /// Return an event to pristine pool state when it reaches the
    /// grand-central new list. Oversized buffers are released here.
    pub fn recycle(&self, place: Place) -> Result<()> {
        let mut ev = self.event(place)?;
        if ev.side.take().is_some() {
            self.temp_count.fetch_sub(1, Ordering::AcqRel);
        }
        ev.memsize = self.event_size;
        ev.temp = Temp::Normal;
        ev.reset(Owner::System);
        Ok(())
    }

    /// Currently live oversized events.
    pub fn oversized_count(&self) -> usize {
        self.temp_count.load(Ordering::Relaxed)
    }

    pub fn oversized_max(&self) -> usize {
        self.temp_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Pool {
        let cfg = SystemConfig {
            nevents: 4,
            event_size: 64,
            temp_max: 1,
            ..Default::default()
        }
        .validate()
        .unwrap();
        Pool::new(&cfg)
    }

    #[test]
    fn length_bounded_by_memsize() {
        let p = pool();
        let mut ev = p.event(0).unwrap();
        assert!(ev.set_length(64).is_ok());
        assert_eq!(ev.set_length(65).unwrap_err(), EtError::TooBig);
    }

    #[test]
    fn oversized_budget_enforced_and_recycled() {
        let p = pool();
        p.make_oversized(0, 1024).unwrap();
        assert_eq!(p.event(0).unwrap().memsize(), 1024);
        assert_eq!(p.make_oversized(1, 512).unwrap_err(), EtError::TooBig);

        p.recycle(0).unwrap();
        let ev = p.event(0).unwrap();
        assert_eq!(ev.memsize(), 64);
        assert_eq!(ev.temp, Temp::Normal);
        drop(ev);
        p.make_oversized(1, 512).unwrap();
    }

    #[test]
    fn bad_place_is_rejected() {
        let p = pool();
        assert!(p.event(4).is_err());
    }
}
