//! Flow-control windows (RFC 9113 §5.2).

use super::frame::Reason;
use crate::config::MAX_WINDOW_SIZE;

/// A signed flow-control window.
///
/// Windows may legally go negative after a `SETTINGS_INITIAL_WINDOW_SIZE`
/// decrease; DATA is simply blocked until updates bring them positive again.
/// Growing past `2^31 - 1` is a `FLOW_CONTROL_ERROR`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowWindow(i64);

impl FlowWindow {
    pub(crate) fn new(initial: u32) -> FlowWindow {
        FlowWindow(i64::from(initial))
    }

    pub(crate) fn available(&self) -> i64 {
        self.0
    }

    /// Applies a WINDOW_UPDATE increment.
    pub(crate) fn increase(&mut self, increment: u32) -> Result<(), Reason> {
        let next = self.0 + i64::from(increment);
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.0 = next;
        Ok(())
    }

    /// Re-applies an initial-window-size delta; may push the window
    /// negative, but never past the 31-bit ceiling.
    pub(crate) fn adjust(&mut self, delta: i64) -> Result<(), Reason> {
        let next = self.0 + delta;
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.0 = next;
        Ok(())
    }

    /// Consumes window for sent or received DATA. Underflow means the peer
    /// overran the advertised window.
    pub(crate) fn consume(&mut self, len: u32) -> Result<(), Reason> {
        let next = self.0 - i64::from(len);
        if next < 0 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.0 = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_underflow_is_flow_control_error() {
        let mut window = FlowWindow::new(65_535);
        window.consume(65_535).unwrap();
        assert_eq!(window.available(), 0);
        assert_eq!(window.consume(1), Err(Reason::FLOW_CONTROL_ERROR));
    }

    #[test]
    fn increase_past_max_rejected() {
        let mut window = FlowWindow::new(MAX_WINDOW_SIZE);
        assert_eq!(window.increase(1), Err(Reason::FLOW_CONTROL_ERROR));
    }

    #[test]
    fn adjust_can_go_negative() {
        let mut window = FlowWindow::new(100);
        window.consume(100).unwrap();
        window.adjust(-50).unwrap();
        assert_eq!(window.available(), -50);
        window.increase(60).unwrap();
        assert_eq!(window.available(), 10);
    }
}
