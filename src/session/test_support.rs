//! Test doubles shared by the session unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::Result;
use crate::ws::error::WsError;
use crate::ws::traits::{ReadyState, Socket};

/// In-memory socket recording every frame it accepts.
#[derive(Debug, Clone)]
pub(crate) struct RecordingSocket {
    pub(crate) state: Rc<RefCell<ReadyState>>,
    pub(crate) sent: Rc<RefCell<Vec<String>>>,
    pub(crate) fail_after: Rc<RefCell<Option<usize>>>,
}

impl RecordingSocket {
    pub(crate) fn open() -> Self {
        Self::with_state(ReadyState::Open)
    }

    pub(crate) fn with_state(state: ReadyState) -> Self {
        Self {
            state: Rc::new(RefCell::new(state)),
            sent: Rc::default(),
            fail_after: Rc::default(),
        }
    }

    pub(crate) fn set_state(&self, state: ReadyState) {
        *self.state.borrow_mut() = state;
    }

    /// Accept `count` more frames, then fail every send.
    pub(crate) fn fail_after(&self, count: usize) {
        *self.fail_after.borrow_mut() = Some(self.sent.borrow().len() + count);
    }

    pub(crate) fn frames(&self) -> Vec<Value> {
        self.sent
            .borrow()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }
}

impl Socket for RecordingSocket {
    fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    fn send_text(&self, text: String) -> Result<()> {
        if !self.ready_state().is_open() {
            return Err(WsError::NotOpen.into());
        }
        if let Some(limit) = *self.fail_after.borrow()
            && self.sent.borrow().len() >= limit
        {
            return Err(WsError::ConnectionClosed.into());
        }
        self.sent.borrow_mut().push(text);
        Ok(())
    }
}
