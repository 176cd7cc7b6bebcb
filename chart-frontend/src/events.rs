use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use ts_core::{LogicalRange, TimeKey};

use crate::PaneRole;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceEvent {
    RangeChanged {
        role: PaneRole,
        range: LogicalRange,
    },
    CrosshairMoved {
        role: PaneRole,
        time: Option<TimeKey>,
        from_pointer: bool,
    },
}

impl SurfaceEvent {
    pub fn role(&self) -> PaneRole {
        match *self {
            SurfaceEvent::RangeChanged { role, .. } => role,
            SurfaceEvent::CrosshairMoved { role, .. } => role,
        }
    }
}

/// FIFO shared by every surface subscription; drained by the session.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    events: Rc<RefCell<VecDeque<SurfaceEvent>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: SurfaceEvent) {
        self.events.borrow_mut().push_back(event);
    }

    pub fn drain(&self) -> Vec<SurfaceEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}
