//! Breakpoint bookkeeping.
//!
//! Every parsed bytecode unit registers the offsets that can carry a
//! breakpoint; the client then toggles individual offsets on and off. A unit
//! scheduled for release by the engine stays referenced until the client
//! acknowledges it, so compressed pointers remain coherent on both sides.

use crate::debugger::error::Error;
use crate::debugger::protocol::ByteCodeCp;
use std::collections::{HashMap, HashSet, VecDeque};

/// Possible breakpoint offsets of one bytecode unit and the active subset.
#[derive(Debug, Default)]
struct UnitBreakpoints {
    known: HashSet<u32>,
    active: HashSet<u32>,
}

#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    units: HashMap<ByteCodeCp, UnitBreakpoints>,
}

impl BreakpointRegistry {
    /// Learn the valid offsets of a freshly parsed unit. All start inactive.
    pub fn register_unit(&mut self, cp: ByteCodeCp, offsets: &[u32]) {
        let unit = self.units.entry(cp).or_default();
        unit.known.extend(offsets.iter().copied());
    }

    pub fn remove_unit(&mut self, cp: ByteCodeCp) {
        self.units.remove(&cp);
    }

    /// Toggle one offset. Unknown locations are client errors.
    pub fn update(&mut self, cp: ByteCodeCp, offset: u32, enable: bool) -> Result<(), Error> {
        let unit = self
            .units
            .get_mut(&cp)
            .ok_or(Error::UnknownBreakpoint(cp, offset))?;
        if !unit.known.contains(&offset) {
            return Err(Error::UnknownBreakpoint(cp, offset));
        }
        if enable {
            unit.active.insert(offset);
        } else {
            unit.active.remove(&offset);
        }
        Ok(())
    }

    pub fn is_active(&self, cp: ByteCodeCp, offset: u32) -> bool {
        self.units
            .get(&cp)
            .is_some_and(|unit| unit.active.contains(&offset))
    }
}

/// Units the engine wants gone, parked until the client stops referring to
/// them by compressed pointer.
#[derive(Debug, Default)]
pub struct FreeQueue {
    pending: VecDeque<ByteCodeCp>,
}

impl FreeQueue {
    pub fn push(&mut self, cp: ByteCodeCp) {
        self.pending.push_back(cp);
    }

    /// Client acknowledged the release; the unit may be freed now.
    pub fn acknowledge(&mut self, cp: ByteCodeCp) -> Result<(), Error> {
        let position = self
            .pending
            .iter()
            .position(|&pending| pending == cp)
            .ok_or(Error::UnknownByteCode(cp))?;
        self.pending.remove(position);
        Ok(())
    }

    /// Everything still parked, e.g. on connection teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = ByteCodeCp> + '_ {
        self.pending.drain(..)
    }
}
